//! # In-Memory State Store
//!
//! The single authoritative in-process view of every endpoint and tunnel
//! instance. Ingestion writes into it, the hub, monitor pollers and the admin
//! API read from it, and the batch writer drains its dirty markers.
//!
//! ## Concurrency
//!
//! Entities are spread over a fixed number of shards keyed by endpoint id,
//! each behind its own `RwLock`. A mutation write-locks only the shard of the
//! endpoint it touches, so unrelated endpoints never contend. Bulk reads copy
//! entities while holding a read lock and release it before returning. Locks
//! are never held across an `.await`, a network call or a queue send.
//!
//! ## Dirty markers
//!
//! Every entity carries a mutation `version` and the last `flushed` version.
//! An entity is dirty while `version > flushed`. A flush snapshots
//! `(entity, version)` pairs and, on success, raises `flushed` to the
//! snapshotted version only. A mutation that lands between snapshot and clear
//! bumps `version` past it, so the entity stays dirty.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::SyncError;
use crate::model::{
    CanonicalEvent, Endpoint, EndpointId, EndpointStatus, EventKind, EventOrigin, FieldUpdate,
    InstanceId,
    Scope, TrafficCounters, TunnelInstance,
};

type InstanceKey = (EndpointId, InstanceId);

struct Versioned<T> {
    value: T,
    version: u64,
    flushed: u64,
}

impl<T> Versioned<T> {
    fn new(value: T) -> Self {
        Self { value, version: 1, flushed: 0 }
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    fn is_dirty(&self) -> bool {
        self.version > self.flushed
    }
}

#[derive(Default)]
struct Shard {
    endpoints: HashMap<EndpointId, Versioned<Endpoint>>,
    instances: HashMap<InstanceKey, Versioned<TunnelInstance>>,
}

/// Result of applying one canonical event.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    /// False when the event carried a sample older than the cached one and was ignored.
    pub applied: bool,
    /// Counter increase contributed by this event.
    pub delta: TrafficCounters,
    /// Copy of the instance after the event, if the event targeted one that still exists.
    pub instance: Option<TunnelInstance>,
    /// True when the event removed the instance from the cache.
    pub removed: bool,
}

impl UpsertOutcome {
    fn ignored() -> Self {
        Self {
            applied: false,
            delta: TrafficCounters::default(),
            instance: None,
            removed: false,
        }
    }
}

/// An endpoint together with copies of the instances it hosts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointView {
    pub endpoint: Endpoint,
    pub instances: Vec<TunnelInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum ScopeView {
    Endpoint(EndpointView),
    Instance(TunnelInstance),
}

/// Dirty entities and the versions they were captured at.
#[derive(Debug, Clone, Default)]
pub struct DirtySnapshot {
    pub endpoints: Vec<(Endpoint, u64)>,
    pub instances: Vec<(TunnelInstance, u64)>,
}

impl DirtySnapshot {
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty() && self.instances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len() + self.instances.len()
    }
}

pub struct StateStore {
    shards: Vec<RwLock<Shard>>,
}

impl StateStore {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| RwLock::new(Shard::default())).collect(),
        }
    }

    fn shard_index(&self, endpoint_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        endpoint_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn read(&self, idx: usize) -> RwLockReadGuard<'_, Shard> {
        self.shards[idx].read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, idx: usize) -> RwLockWriteGuard<'_, Shard> {
        self.shards[idx].write().unwrap_or_else(|e| e.into_inner())
    }

    fn write_for(&self, endpoint_id: &str) -> RwLockWriteGuard<'_, Shard> {
        self.write(self.shard_index(endpoint_id))
    }

    fn read_for(&self, endpoint_id: &str) -> RwLockReadGuard<'_, Shard> {
        self.read(self.shard_index(endpoint_id))
    }

    /// Adds an endpoint, or refreshes the URL and credential of a known one.
    /// Returns true when the endpoint was not known before.
    pub fn register_endpoint(&self, endpoint: Endpoint) -> bool {
        let mut shard = self.write_for(&endpoint.id);
        match shard.endpoints.get_mut(&endpoint.id) {
            Some(entry) => {
                entry.value.base_url = endpoint.base_url;
                entry.value.api_key = endpoint.api_key;
                entry.touch();
                false
            }
            None => {
                shard.endpoints.insert(endpoint.id.clone(), Versioned::new(endpoint));
                true
            }
        }
    }

    /// Evicts an endpoint and every instance it hosts. Their dirty markers go with them.
    pub fn remove_endpoint(&self, endpoint_id: &str) -> Option<Endpoint> {
        let mut shard = self.write_for(endpoint_id);
        let entry = shard.endpoints.remove(endpoint_id)?;
        shard.instances.retain(|(ep, _), _| ep != endpoint_id);
        Some(entry.value)
    }

    /// Evicts one instance and clears its dirty marker.
    pub fn remove_instance(&self, endpoint_id: &str, instance_id: &str) -> Option<TunnelInstance> {
        let mut shard = self.write_for(endpoint_id);
        Self::remove_instance_locked(&mut shard, endpoint_id, instance_id)
    }

    fn remove_instance_locked(
        shard: &mut Shard,
        endpoint_id: &str,
        instance_id: &str,
    ) -> Option<TunnelInstance> {
        let removed = shard
            .instances
            .remove(&(endpoint_id.to_string(), instance_id.to_string()))?;
        if let Some(ep) = shard.endpoints.get_mut(endpoint_id) {
            ep.value.instance_ids.retain(|id| id != instance_id);
            ep.touch();
        }
        Some(removed.value)
    }

    /// Merges one canonical event into the cache.
    ///
    /// Counters are absolute samples: the cached value is replaced and the
    /// increase is reported as `delta`. A sample older than the cached one is
    /// ignored as a whole.
    pub fn upsert(&self, event: &CanonicalEvent) -> Result<UpsertOutcome, SyncError> {
        let mut guard = self.write_for(&event.endpoint_id);
        let shard = &mut *guard;

        let endpoint = shard
            .endpoints
            .get_mut(&event.endpoint_id)
            .ok_or_else(|| SyncError::UnknownEndpoint(event.endpoint_id.clone()))?;
        bump_last_seen(&mut endpoint.value.last_seen, event.timestamp);
        endpoint.touch();

        match event.kind {
            EventKind::Shutdown => {
                endpoint.value.status = EndpointStatus::Offline;
                Ok(UpsertOutcome {
                    applied: true,
                    delta: TrafficCounters::default(),
                    instance: None,
                    removed: false,
                })
            }
            EventKind::Log => {
                let instance = event.instance_id.as_ref().and_then(|id| {
                    shard
                        .instances
                        .get(&(event.endpoint_id.clone(), id.clone()))
                        .map(|e| e.value.clone())
                });
                Ok(UpsertOutcome {
                    applied: true,
                    delta: TrafficCounters::default(),
                    instance,
                    removed: false,
                })
            }
            EventKind::Delete => {
                let instance_id = required_instance(event)?;
                let removed =
                    Self::remove_instance_locked(shard, &event.endpoint_id, instance_id).is_some();
                Ok(UpsertOutcome {
                    applied: true,
                    delta: TrafficCounters::default(),
                    instance: None,
                    removed,
                })
            }
            EventKind::Initial | EventKind::Create | EventKind::Update => {
                let instance_id = required_instance(event)?;
                let key = (event.endpoint_id.clone(), instance_id.clone());
                if !shard.instances.contains_key(&key) {
                    endpoint.value.instance_ids.push(instance_id.clone());
                    shard.instances.insert(
                        key.clone(),
                        Versioned::new(TunnelInstance::new(&event.endpoint_id, instance_id)),
                    );
                }
                let Some(entry) = shard.instances.get_mut(&key) else {
                    return Ok(UpsertOutcome::ignored());
                };

                let inst = &mut entry.value;
                let last_at = match event.origin {
                    EventOrigin::Stream => &mut inst.sampled_at,
                    EventOrigin::Poll => &mut inst.polled_at,
                };
                if last_at.is_some_and(|cached_at| event.timestamp < cached_at) {
                    return Ok(UpsertOutcome::ignored());
                }
                *last_at = Some(event.timestamp);

                let mut delta = TrafficCounters::default();
                if let Some(sample) = event.sample() {
                    if let Some(counters) = sample.counters {
                        delta = counters.delta_from(&inst.counters);
                        inst.counters = counters;
                    }
                    if let Some(role) = sample.role {
                        inst.role = Some(role);
                    }
                    if let Some(status) = &sample.status {
                        inst.status = status.clone();
                    }
                    if let Some(url) = &sample.url {
                        inst.url = Some(url.clone());
                    }
                    if sample.ping.is_some() {
                        inst.ping = sample.ping;
                    }
                    if sample.pool.is_some() {
                        inst.pool = sample.pool;
                    }
                }
                entry.touch();

                Ok(UpsertOutcome {
                    applied: true,
                    delta,
                    instance: Some(entry.value.clone()),
                    removed: false,
                })
            }
        }
    }

    /// Applies one typed field update and marks the entity dirty.
    pub fn apply(&self, update: FieldUpdate) -> Result<(), SyncError> {
        let mut guard = self.write_for(update.endpoint_id());
        let shard = &mut *guard;
        match update {
            FieldUpdate::EndpointStatus { endpoint_id, status } => {
                let ep = shard
                    .endpoints
                    .get_mut(&endpoint_id)
                    .ok_or(SyncError::UnknownEndpoint(endpoint_id))?;
                if ep.value.status != status {
                    ep.value.status = status;
                    ep.touch();
                }
            }
            FieldUpdate::EndpointInfo { endpoint_id, info } => {
                let ep = shard
                    .endpoints
                    .get_mut(&endpoint_id)
                    .ok_or(SyncError::UnknownEndpoint(endpoint_id))?;
                ep.value.info = Some(info);
                ep.touch();
            }
            FieldUpdate::InstanceStatus { endpoint_id, instance_id, status } => {
                let entry = instance_mut(shard, endpoint_id, instance_id)?;
                entry.value.status = status.as_str().to_string();
                entry.touch();
            }
            FieldUpdate::InstanceRole { endpoint_id, instance_id, role } => {
                let entry = instance_mut(shard, endpoint_id, instance_id)?;
                entry.value.role = Some(role);
                entry.touch();
            }
            FieldUpdate::InstanceUrl { endpoint_id, instance_id, url } => {
                let entry = instance_mut(shard, endpoint_id, instance_id)?;
                entry.value.url = Some(url.as_str().to_string());
                entry.touch();
            }
        }
        Ok(())
    }

    pub fn set_endpoint_status(&self, endpoint_id: &str, status: EndpointStatus) -> Result<(), SyncError> {
        self.apply(FieldUpdate::EndpointStatus {
            endpoint_id: endpoint_id.to_string(),
            status,
        })
    }

    pub fn get_endpoint(&self, endpoint_id: &str) -> Option<Endpoint> {
        let shard = self.read_for(endpoint_id);
        shard.endpoints.get(endpoint_id).map(|e| e.value.clone())
    }

    pub fn get_instance(&self, endpoint_id: &str, instance_id: &str) -> Option<TunnelInstance> {
        let shard = self.read_for(endpoint_id);
        shard
            .instances
            .get(&(endpoint_id.to_string(), instance_id.to_string()))
            .map(|e| e.value.clone())
    }

    /// Looks an instance up by id alone. Scans shards, so only for scope lookups.
    pub fn find_instance(&self, instance_id: &str) -> Option<TunnelInstance> {
        (0..self.shards.len()).find_map(|idx| {
            let shard = self.read(idx);
            shard
                .instances
                .values()
                .find(|e| e.value.id == instance_id)
                .map(|e| e.value.clone())
        })
    }

    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = (0..self.shards.len())
            .flat_map(|idx| self.read(idx).endpoints.keys().cloned().collect::<Vec<_>>())
            .collect();
        ids.sort();
        ids
    }

    /// Copies every endpoint with its instances, ordered by endpoint id.
    pub fn get_all(&self) -> Vec<EndpointView> {
        let mut views = Vec::new();
        for idx in 0..self.shards.len() {
            let shard = self.read(idx);
            for entry in shard.endpoints.values() {
                views.push(Self::view_locked(&shard, &entry.value));
            }
        }
        views.sort_by(|a, b| a.endpoint.id.cmp(&b.endpoint.id));
        views
    }

    pub fn get_by_scope(&self, scope: &Scope) -> Option<ScopeView> {
        match scope {
            Scope::Endpoint(id) => {
                let shard = self.read_for(id);
                let entry = shard.endpoints.get(id)?;
                Some(ScopeView::Endpoint(Self::view_locked(&shard, &entry.value)))
            }
            Scope::Instance(id) => self.find_instance(id).map(ScopeView::Instance),
        }
    }

    fn view_locked(shard: &Shard, endpoint: &Endpoint) -> EndpointView {
        let instances = endpoint
            .instance_ids
            .iter()
            .filter_map(|iid| {
                shard
                    .instances
                    .get(&(endpoint.id.clone(), iid.clone()))
                    .map(|e| e.value.clone())
            })
            .collect();
        EndpointView {
            endpoint: endpoint.clone(),
            instances,
        }
    }

    /// Captures every dirty entity with its current version.
    pub fn dirty_snapshot(&self) -> DirtySnapshot {
        let mut snap = DirtySnapshot::default();
        for idx in 0..self.shards.len() {
            let shard = self.read(idx);
            snap.endpoints.extend(
                shard
                    .endpoints
                    .values()
                    .filter(|e| e.is_dirty())
                    .map(|e| (e.value.clone(), e.version)),
            );
            snap.instances.extend(
                shard
                    .instances
                    .values()
                    .filter(|e| e.is_dirty())
                    .map(|e| (e.value.clone(), e.version)),
            );
        }
        snap
    }

    /// Marks the snapshotted versions as flushed. Later mutations stay dirty.
    pub fn clear_dirty(&self, snapshot: &DirtySnapshot) {
        for (endpoint, version) in &snapshot.endpoints {
            let mut shard = self.write_for(&endpoint.id);
            if let Some(entry) = shard.endpoints.get_mut(&endpoint.id) {
                entry.flushed = entry.flushed.max(*version);
            }
        }
        for (instance, version) in &snapshot.instances {
            let mut shard = self.write_for(&instance.endpoint_id);
            let key = (instance.endpoint_id.clone(), instance.id.clone());
            if let Some(entry) = shard.instances.get_mut(&key) {
                entry.flushed = entry.flushed.max(*version);
            }
        }
    }

    pub fn is_instance_dirty(&self, endpoint_id: &str, instance_id: &str) -> bool {
        let shard = self.read_for(endpoint_id);
        shard
            .instances
            .get(&(endpoint_id.to_string(), instance_id.to_string()))
            .is_some_and(|e| e.is_dirty())
    }

    pub fn is_endpoint_dirty(&self, endpoint_id: &str) -> bool {
        let shard = self.read_for(endpoint_id);
        shard.endpoints.get(endpoint_id).is_some_and(|e| e.is_dirty())
    }
}

fn bump_last_seen(last_seen: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) {
    if last_seen.map_or(true, |seen| at > seen) {
        *last_seen = Some(at);
    }
}

fn required_instance(event: &CanonicalEvent) -> Result<&InstanceId, SyncError> {
    event.instance_id.as_ref().ok_or_else(|| {
        SyncError::MalformedPayload(format!("{} event without instance id", event.kind.as_str()))
    })
}

fn instance_mut(
    shard: &mut Shard,
    endpoint_id: EndpointId,
    instance_id: InstanceId,
) -> Result<&mut Versioned<TunnelInstance>, SyncError> {
    shard
        .instances
        .get_mut(&(endpoint_id, instance_id.clone()))
        .ok_or(SyncError::UnknownInstance(instance_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventPayload, InstanceRole, InstanceSample, StatusText, TunnelUrl};
    use chrono::Duration;
    use std::sync::Arc;

    fn store_with(endpoint: &str) -> StateStore {
        let store = StateStore::new(4);
        store.register_endpoint(Endpoint::new(endpoint, "http://127.0.0.1:9090/api", "k"));
        store
    }

    fn update(endpoint: &str, instance: &str, tcp_rx: u64, at: DateTime<Utc>) -> CanonicalEvent {
        CanonicalEvent {
            kind: EventKind::Update,
            origin: EventOrigin::Stream,
            endpoint_id: endpoint.into(),
            instance_id: Some(instance.into()),
            payload: EventPayload::Instance(InstanceSample {
                status: Some("running".into()),
                counters: Some(TrafficCounters { tcp_rx, ..Default::default() }),
                ..Default::default()
            }),
            timestamp: at,
        }
    }

    #[test]
    fn counters_follow_last_absolute_sample() {
        let store = store_with("e1");
        let t0 = Utc::now();
        let mut total_delta = TrafficCounters::default();
        for (i, rx) in [100u64, 250, 260, 900].iter().enumerate() {
            let out = store
                .upsert(&update("e1", "i1", *rx, t0 + Duration::seconds(i as i64)))
                .unwrap();
            assert!(out.applied);
            total_delta.accumulate(&out.delta);
        }
        let inst = store.get_instance("e1", "i1").unwrap();
        assert_eq!(inst.counters.tcp_rx, 900);
        assert_eq!(total_delta.tcp_rx, 900);
        assert_eq!(inst.status, "running");
    }

    #[test]
    fn polls_do_not_shadow_a_lagging_endpoint_clock() {
        let store = store_with("e1");
        // Endpoint clock runs five minutes behind ours.
        let remote = Utc::now() - Duration::minutes(5);
        store.upsert(&update("e1", "i1", 100, remote)).unwrap();

        let mut poll = update("e1", "i1", 120, Utc::now());
        poll.origin = EventOrigin::Poll;
        assert!(store.upsert(&poll).unwrap().applied);

        let out = store
            .upsert(&update("e1", "i1", 150, remote + Duration::seconds(5)))
            .unwrap();
        assert!(out.applied);
        assert_eq!(out.delta.tcp_rx, 30);
        let inst = store.get_instance("e1", "i1").unwrap();
        assert_eq!(inst.counters.tcp_rx, 150);
        assert_eq!(inst.sampled_at, Some(remote + Duration::seconds(5)));

        let mut old_poll = update("e1", "i1", 90, Utc::now() - Duration::minutes(1));
        old_poll.origin = EventOrigin::Poll;
        assert!(!store.upsert(&old_poll).unwrap().applied);
    }

    #[test]
    fn older_sample_never_regresses_counters() {
        let store = store_with("e1");
        let t0 = Utc::now();
        store.upsert(&update("e1", "i1", 500, t0)).unwrap();
        let stale = store.upsert(&update("e1", "i1", 100, t0 - Duration::seconds(5))).unwrap();
        assert!(!stale.applied);
        assert!(stale.delta.is_zero());
        assert_eq!(store.get_instance("e1", "i1").unwrap().counters.tcp_rx, 500);
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let store = StateStore::new(2);
        let err = store.upsert(&update("nope", "i1", 1, Utc::now())).unwrap_err();
        assert!(matches!(err, SyncError::UnknownEndpoint(_)));
    }

    #[test]
    fn reads_return_copies() {
        let store = store_with("e1");
        store.upsert(&update("e1", "i1", 10, Utc::now())).unwrap();
        let mut copy = store.get_instance("e1", "i1").unwrap();
        copy.counters.tcp_rx = 9_999;
        assert_eq!(store.get_instance("e1", "i1").unwrap().counters.tcp_rx, 10);

        let all = store.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].endpoint.instance_ids, vec!["i1".to_string()]);
        assert_eq!(all[0].instances.len(), 1);

        match store.get_by_scope(&Scope::Instance("i1".into())) {
            Some(ScopeView::Instance(inst)) => assert_eq!(inst.endpoint_id, "e1"),
            other => panic!("unexpected scope view: {:?}", other),
        }
    }

    #[test]
    fn delete_event_evicts_instance_and_its_marker() {
        let store = store_with("e1");
        let t0 = Utc::now();
        store.upsert(&update("e1", "i1", 10, t0)).unwrap();
        let mut del = update("e1", "i1", 0, t0);
        del.kind = EventKind::Delete;
        let out = store.upsert(&del).unwrap();
        assert!(out.removed);
        assert!(store.get_instance("e1", "i1").is_none());
        assert!(!store.is_instance_dirty("e1", "i1"));
        assert!(store.get_endpoint("e1").unwrap().instance_ids.is_empty());
    }

    #[test]
    fn repeated_marks_clear_with_one_flush() {
        let store = store_with("e1");
        let t0 = Utc::now();
        for i in 0..5 {
            store.upsert(&update("e1", "i1", 10 * i, t0 + Duration::seconds(i as i64))).unwrap();
        }
        let snap = store.dirty_snapshot();
        assert_eq!(snap.instances.len(), 1);
        store.clear_dirty(&snap);
        assert!(!store.is_instance_dirty("e1", "i1"));
        assert!(store.dirty_snapshot().is_empty());
    }

    #[test]
    fn mutation_during_flush_stays_dirty() {
        let store = store_with("e1");
        let t0 = Utc::now();
        store.upsert(&update("e1", "i1", 10, t0)).unwrap();
        let snap = store.dirty_snapshot();
        store.upsert(&update("e1", "i1", 20, t0 + Duration::seconds(1))).unwrap();
        store.clear_dirty(&snap);
        assert!(store.is_instance_dirty("e1", "i1"));
        assert!(store.is_endpoint_dirty("e1"));
    }

    #[test]
    fn typed_field_updates_apply() {
        let store = store_with("e1");
        store.upsert(&update("e1", "i1", 1, Utc::now())).unwrap();
        store
            .apply(FieldUpdate::InstanceStatus {
                endpoint_id: "e1".into(),
                instance_id: "i1".into(),
                status: StatusText::new("stopped").unwrap(),
            })
            .unwrap();
        store.set_endpoint_status("e1", EndpointStatus::Fail).unwrap();
        assert_eq!(store.get_instance("e1", "i1").unwrap().status, "stopped");
        assert_eq!(store.get_endpoint("e1").unwrap().status, EndpointStatus::Fail);
        assert!(store.set_endpoint_status("e9", EndpointStatus::Online).is_err());
    }

    #[test]
    fn role_and_url_updates_mark_the_instance_dirty() {
        let store = store_with("e1");
        store.upsert(&update("e1", "i1", 1, Utc::now())).unwrap();
        let snap = store.dirty_snapshot();
        store.clear_dirty(&snap);

        store
            .apply(FieldUpdate::InstanceRole {
                endpoint_id: "e1".into(),
                instance_id: "i1".into(),
                role: InstanceRole::Client,
            })
            .unwrap();
        assert!(store.is_instance_dirty("e1", "i1"));
        store
            .apply(FieldUpdate::InstanceUrl {
                endpoint_id: "e1".into(),
                instance_id: "i1".into(),
                url: TunnelUrl::new("client://127.0.0.1:10101/10.1.0.2:22").unwrap(),
            })
            .unwrap();

        let inst = store.get_instance("e1", "i1").unwrap();
        assert_eq!(inst.role, Some(InstanceRole::Client));
        assert_eq!(inst.url.as_deref(), Some("client://127.0.0.1:10101/10.1.0.2:22"));
        assert_eq!(inst.counters.tcp_rx, 1);

        let missing = store.apply(FieldUpdate::InstanceRole {
            endpoint_id: "e1".into(),
            instance_id: "nope".into(),
            role: InstanceRole::Server,
        });
        assert!(matches!(missing, Err(SyncError::UnknownInstance(_))));
    }

    #[test]
    fn concurrent_writers_on_distinct_endpoints() {
        let store = Arc::new(StateStore::new(8));
        for e in 0..8 {
            store.register_endpoint(Endpoint::new(format!("e{}", e), "http://h/api", ""));
        }
        let t0 = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|e| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 1..=200u64 {
                        let ev = update(&format!("e{}", e), "i", i, t0 + Duration::milliseconds(i as i64));
                        store.upsert(&ev).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for view in store.get_all() {
            assert_eq!(view.instances[0].counters.tcp_rx, 200);
        }
    }
}
