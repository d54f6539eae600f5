//! # Event Router
//!
//! The one path every state change takes: merge into the [`StateStore`], hand
//! the result to the batch writer, then publish a notification to the hub.
//! Stream workers and monitor pollers both route through here so the three
//! consumers always see the same sequence for a given endpoint.
//!
//! The store lock is released before the writer or hub are touched; both of
//! those are non-blocking and may drop under pressure.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::core::hub::{Hub, StateUpdate, UpdateKind};
use crate::core::state_store::{StateStore, UpsertOutcome};
use crate::errors::SyncError;
use crate::model::{
    CanonicalEvent, EndpointStatus, EventKind, EventOrigin, EventPayload, FieldUpdate,
};
use crate::persistence::writer::{BatchWriter, PendingWrite};

pub struct EventRouter {
    store: Arc<StateStore>,
    writer: Arc<BatchWriter>,
    hub: Arc<Hub>,
}

impl EventRouter {
    pub fn new(store: Arc<StateStore>, writer: Arc<BatchWriter>, hub: Arc<Hub>) -> Self {
        Self { store, writer, hub }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn writer(&self) -> &Arc<BatchWriter> {
        &self.writer
    }

    /// Applies a canonical event and forwards it downstream.
    pub fn route(&self, event: CanonicalEvent) -> Result<UpsertOutcome, SyncError> {
        let outcome = self.store.upsert(&event)?;
        if !outcome.applied {
            tracing::debug!(
                endpoint = %event.endpoint_id,
                instance = ?event.instance_id,
                "ignoring sample older than the cached one"
            );
            return Ok(outcome);
        }

        let update = notification_for(&event, &outcome);
        self.writer.enqueue(PendingWrite {
            totals: outcome.instance.as_ref().map(|i| i.counters),
            delta: outcome.delta,
            event,
        });
        if let Some(update) = update {
            self.hub.publish(update);
        }
        Ok(outcome)
    }

    /// Applies a typed field update and publishes the affected entity.
    pub fn apply(&self, update: FieldUpdate) -> Result<(), SyncError> {
        let endpoint_id = update.endpoint_id().to_string();
        let (kind, instance_id) = match &update {
            FieldUpdate::EndpointStatus { .. } => (UpdateKind::EndpointStatus, None),
            FieldUpdate::EndpointInfo { .. } => (UpdateKind::EndpointInfo, None),
            FieldUpdate::InstanceStatus { instance_id, .. }
            | FieldUpdate::InstanceRole { instance_id, .. }
            | FieldUpdate::InstanceUrl { instance_id, .. } => {
                (UpdateKind::Instance, Some(instance_id.clone()))
            }
        };
        self.store.apply(update)?;

        let data = match &instance_id {
            Some(iid) => self
                .store
                .get_instance(&endpoint_id, iid)
                .and_then(|i| serde_json::to_value(i).ok()),
            None => self
                .store
                .get_endpoint(&endpoint_id)
                .and_then(|e| serde_json::to_value(e).ok()),
        };
        if let Some(data) = data {
            self.hub.publish(StateUpdate {
                kind,
                endpoint_id,
                instance_id,
                data,
                ts: Utc::now(),
            });
        }
        Ok(())
    }

    /// Records a connection status change of an endpoint.
    pub fn set_status(&self, endpoint_id: &str, status: EndpointStatus) {
        let changed = self
            .store
            .get_endpoint(endpoint_id)
            .is_some_and(|e| e.status != status);
        if !changed {
            return;
        }
        if let Err(e) = self.apply(FieldUpdate::EndpointStatus {
            endpoint_id: endpoint_id.to_string(),
            status,
        }) {
            tracing::debug!(endpoint = endpoint_id, "status change not applied: {}", e);
        }
    }
}

fn notification_for(event: &CanonicalEvent, outcome: &UpsertOutcome) -> Option<StateUpdate> {
    let (kind, data) = match event.kind {
        EventKind::Shutdown => (
            UpdateKind::EndpointStatus,
            json!({ "status": EndpointStatus::Offline }),
        ),
        EventKind::Log => match &event.payload {
            EventPayload::Log(text) => (UpdateKind::Log, json!({ "logs": text })),
            _ => return None,
        },
        EventKind::Delete => {
            if !outcome.removed {
                return None;
            }
            (UpdateKind::InstanceRemoved, json!({ "id": event.instance_id }))
        }
        EventKind::Initial | EventKind::Create | EventKind::Update => {
            let instance = outcome.instance.as_ref()?;
            let kind = match event.origin {
                EventOrigin::Stream => UpdateKind::Instance,
                EventOrigin::Poll => UpdateKind::Poll,
            };
            (kind, serde_json::to_value(instance).ok()?)
        }
    };
    Some(StateUpdate {
        kind,
        endpoint_id: event.endpoint_id.clone(),
        instance_id: event.instance_id.clone(),
        data,
        ts: event.timestamp,
    })
}
