//! In-process durable store engine.
//!
//! Used when no database is configured and as the store fake in tests. It
//! follows the same merge rules as the SQL engine: traffic rows merge by key,
//! status rows are replaced, deletes are bounded by `limit`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::model::{Endpoint, EndpointId, InstanceId, TunnelInstance};
use crate::persistence::store::{
    DeletionTarget, DurableStore, EventRow, LogRow, MonitorSampleRow, TrafficRow, WriteBatch,
};

type TrafficKey = (EndpointId, InstanceId, DateTime<Utc>);

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub instance: Option<TunnelInstance>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tables {
    endpoints: HashMap<EndpointId, Endpoint>,
    instances: BTreeMap<(EndpointId, InstanceId), InstanceRecord>,
    traffic: BTreeMap<TrafficKey, TrafficRow>,
    samples: Vec<MonitorSampleRow>,
    logs: Vec<LogRow>,
    events: Vec<EventRow>,
}

impl Tables {
    fn is_orphan(&self, endpoint_id: &str) -> bool {
        !self.endpoints.contains_key(endpoint_id)
    }

    fn count(&self, target: &DeletionTarget) -> u64 {
        let n = match target {
            DeletionTarget::RealtimeEventsBefore(cut) => {
                self.events.iter().filter(|r| r.event_time < *cut).count()
            }
            DeletionTarget::TrafficStatsBefore(cut) => {
                self.traffic.values().filter(|r| r.bucket < *cut).count()
            }
            DeletionTarget::MonitorSamplesBefore(cut) => {
                self.samples.iter().filter(|r| r.sampled_at < *cut).count()
            }
            DeletionTarget::LogsBefore(cut) => {
                self.logs.iter().filter(|r| r.logged_at < *cut).count()
            }
            DeletionTarget::SoftDeletedBefore(cut) => self
                .instances
                .values()
                .filter(|r| r.deleted_at.is_some_and(|at| at < *cut))
                .count(),
            DeletionTarget::Orphans => {
                self.instances.keys().filter(|(ep, _)| self.is_orphan(ep)).count()
                    + self.traffic.keys().filter(|(ep, _, _)| self.is_orphan(ep)).count()
                    + self.samples.iter().filter(|r| self.is_orphan(&r.endpoint_id)).count()
                    + self.logs.iter().filter(|r| self.is_orphan(&r.endpoint_id)).count()
                    + self.events.iter().filter(|r| self.is_orphan(&r.endpoint_id)).count()
            }
        };
        n as u64
    }

    fn delete(&mut self, target: &DeletionTarget, limit: usize) -> u64 {
        match target {
            DeletionTarget::RealtimeEventsBefore(cut) => {
                retain_limited(&mut self.events, limit, |r| r.event_time < *cut)
            }
            DeletionTarget::MonitorSamplesBefore(cut) => {
                retain_limited(&mut self.samples, limit, |r| r.sampled_at < *cut)
            }
            DeletionTarget::LogsBefore(cut) => {
                retain_limited(&mut self.logs, limit, |r| r.logged_at < *cut)
            }
            DeletionTarget::TrafficStatsBefore(cut) => {
                let keys: Vec<TrafficKey> = self
                    .traffic
                    .iter()
                    .filter(|(_, r)| r.bucket < *cut)
                    .map(|(k, _)| k.clone())
                    .take(limit)
                    .collect();
                for k in &keys {
                    self.traffic.remove(k);
                }
                keys.len() as u64
            }
            DeletionTarget::SoftDeletedBefore(cut) => {
                let keys: Vec<_> = self
                    .instances
                    .iter()
                    .filter(|(_, r)| r.deleted_at.is_some_and(|at| at < *cut))
                    .map(|(k, _)| k.clone())
                    .take(limit)
                    .collect();
                for k in &keys {
                    self.instances.remove(k);
                }
                keys.len() as u64
            }
            DeletionTarget::Orphans => {
                let endpoints = self.endpoints.clone();
                let orphan = |ep: &str| !endpoints.contains_key(ep);
                let mut left = limit;
                let mut deleted = 0u64;

                let keys: Vec<_> = self
                    .instances
                    .keys()
                    .filter(|(ep, _)| orphan(ep.as_str()))
                    .take(left)
                    .cloned()
                    .collect();
                for k in &keys {
                    self.instances.remove(k);
                }
                left -= keys.len();
                deleted += keys.len() as u64;

                let keys: Vec<_> = self
                    .traffic
                    .keys()
                    .filter(|(ep, _, _)| orphan(ep.as_str()))
                    .take(left)
                    .cloned()
                    .collect();
                for k in &keys {
                    self.traffic.remove(k);
                }
                left -= keys.len();
                deleted += keys.len() as u64;

                let n = retain_limited(&mut self.samples, left, |r| orphan(r.endpoint_id.as_str()));
                left -= n as usize;
                deleted += n;
                let n = retain_limited(&mut self.logs, left, |r| orphan(r.endpoint_id.as_str()));
                left -= n as usize;
                deleted += n;
                deleted += retain_limited(&mut self.events, left, |r| orphan(r.endpoint_id.as_str()));
                deleted
            }
        }
    }
}

/// Removes up to `limit` elements matching `pred`, keeping order. Returns how many went.
fn retain_limited<T>(rows: &mut Vec<T>, limit: usize, pred: impl Fn(&T) -> bool) -> u64 {
    let mut removed = 0usize;
    rows.retain(|r| {
        if removed < limit && pred(r) {
            removed += 1;
            false
        } else {
            true
        }
    });
    removed as u64
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
    maintenance_runs: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes subsequent batch writes fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent deletes fail until switched off again.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn traffic_rows(&self) -> Vec<TrafficRow> {
        self.lock().traffic.values().cloned().collect()
    }

    pub fn endpoint(&self, id: &str) -> Option<Endpoint> {
        self.lock().endpoints.get(id).cloned()
    }

    pub fn instance(&self, endpoint_id: &str, instance_id: &str) -> Option<InstanceRecord> {
        self.lock()
            .instances
            .get(&(endpoint_id.to_string(), instance_id.to_string()))
            .cloned()
    }

    pub fn samples(&self) -> Vec<MonitorSampleRow> {
        self.lock().samples.clone()
    }

    pub fn logs(&self) -> Vec<LogRow> {
        self.lock().logs.clone()
    }

    pub fn events(&self) -> Vec<EventRow> {
        self.lock().events.clone()
    }

    pub fn maintenance_runs(&self) -> u64 {
        self.maintenance_runs.load(Ordering::SeqCst)
    }

    /// Seeds rows directly, bypassing the writer.
    pub fn insert_rows(&self, batch: WriteBatch) {
        let mut t = self.lock();
        apply_batch(&mut t, &batch);
    }
}

fn apply_batch(t: &mut Tables, batch: &WriteBatch) -> u64 {
    for ep in &batch.endpoints {
        t.endpoints.insert(ep.id.clone(), ep.clone());
    }
    // Deletions go first: a status row in the same batch is a later re-creation
    for del in &batch.deletions {
        let rec = t
            .instances
            .entry((del.endpoint_id.clone(), del.instance_id.clone()))
            .or_insert(InstanceRecord { instance: None, deleted_at: None });
        rec.deleted_at = Some(del.deleted_at);
    }
    for inst in &batch.instances {
        let rec = t
            .instances
            .entry((inst.endpoint_id.clone(), inst.id.clone()))
            .or_insert(InstanceRecord { instance: None, deleted_at: None });
        rec.instance = Some(inst.clone());
        rec.deleted_at = None;
    }
    for row in &batch.traffic {
        let key = (row.endpoint_id.clone(), row.instance_id.clone(), row.bucket);
        match t.traffic.get_mut(&key) {
            Some(existing) => existing.merge(row),
            None => {
                t.traffic.insert(key, row.clone());
            }
        }
    }
    t.samples.extend(batch.samples.iter().cloned());
    t.logs.extend(batch.logs.iter().cloned());
    t.events.extend(batch.events.iter().cloned());
    batch.row_count() as u64
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write_batch(&self, batch: &WriteBatch) -> Result<u64, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write failure injected".into()));
        }
        let mut t = self.lock();
        Ok(apply_batch(&mut t, batch))
    }

    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<(), StoreError> {
        self.lock().endpoints.remove(endpoint_id);
        Ok(())
    }

    async fn count_matching(&self, target: &DeletionTarget) -> Result<u64, StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("delete failure injected".into()));
        }
        Ok(self.lock().count(target))
    }

    async fn delete_batch(&self, target: &DeletionTarget, limit: usize) -> Result<u64, StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("delete failure injected".into()));
        }
        Ok(self.lock().delete(target, limit))
    }

    async fn maintain(&self) -> Result<(), StoreError> {
        self.maintenance_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
