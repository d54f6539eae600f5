//! # Domain Model
//!
//! Endpoints, the tunnel instances they host, the canonical event envelope
//! produced by ingestion, subscription scopes, and the typed field-update
//! commands accepted by the state store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

pub type EndpointId = String;
pub type InstanceId = String;

/// Connection status of an endpoint as seen by this control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EndpointStatus {
    Online,
    #[default]
    Offline,
    Fail,
    #[serde(rename = "DISCONNECT")]
    Disconnected,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Online => "ONLINE",
            EndpointStatus::Offline => "OFFLINE",
            EndpointStatus::Fail => "FAIL",
            EndpointStatus::Disconnected => "DISCONNECT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Server,
    Client,
}

impl InstanceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceRole::Server => "server",
            InstanceRole::Client => "client",
        }
    }
}

impl FromStr for InstanceRole {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(InstanceRole::Server),
            "client" => Ok(InstanceRole::Client),
            other => Err(SyncError::MalformedPayload(format!("unknown instance role '{}'", other))),
        }
    }
}

/// Cumulative traffic counters of one tunnel instance, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficCounters {
    pub tcp_rx: u64,
    pub tcp_tx: u64,
    pub udp_rx: u64,
    pub udp_tx: u64,
}

impl TrafficCounters {
    /// Per-field increase from `previous` to `self`.
    ///
    /// A field that went backwards means the remote counter restarted, in which
    /// case the whole new value counts as the increase.
    pub fn delta_from(&self, previous: &TrafficCounters) -> TrafficCounters {
        fn field(now: u64, before: u64) -> u64 {
            if now >= before {
                now - before
            } else {
                now
            }
        }
        TrafficCounters {
            tcp_rx: field(self.tcp_rx, previous.tcp_rx),
            tcp_tx: field(self.tcp_tx, previous.tcp_tx),
            udp_rx: field(self.udp_rx, previous.udp_rx),
            udp_tx: field(self.udp_tx, previous.udp_tx),
        }
    }

    pub fn accumulate(&mut self, other: &TrafficCounters) {
        self.tcp_rx = self.tcp_rx.saturating_add(other.tcp_rx);
        self.tcp_tx = self.tcp_tx.saturating_add(other.tcp_tx);
        self.udp_rx = self.udp_rx.saturating_add(other.udp_rx);
        self.udp_tx = self.udp_tx.saturating_add(other.udp_tx);
    }

    pub fn is_zero(&self) -> bool {
        *self == TrafficCounters::default()
    }
}

/// Point-in-time facts about an endpoint process, filled by monitor polls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    pub version: Option<String>,
    pub platform: Option<String>,
    pub uptime_secs: Option<u64>,
}

/// A registered tunnel-proxy process.
///
/// Instances are not owned here: the endpoint only lists the ids of the
/// instances it hosts, the instances themselves live in the state store arena.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: EndpointId,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub status: EndpointStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub info: Option<EndpointInfo>,
    pub instance_ids: Vec<InstanceId>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            status: EndpointStatus::Offline,
            last_seen: None,
            info: None,
            instance_ids: Vec::new(),
        }
    }
}

/// One forwarding session hosted by an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInstance {
    pub id: InstanceId,
    pub endpoint_id: EndpointId,
    pub role: Option<InstanceRole>,
    pub status: String,
    pub url: Option<String>,
    pub counters: TrafficCounters,
    pub ping: Option<i64>,
    pub pool: Option<i64>,
    /// Endpoint clock of the last applied stream event.
    pub sampled_at: Option<DateTime<Utc>>,
    /// Local clock of the last applied monitor poll.
    pub polled_at: Option<DateTime<Utc>>,
}

impl TunnelInstance {
    pub fn new(endpoint_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint_id: endpoint_id.into(),
            role: None,
            status: String::from("unknown"),
            url: None,
            counters: TrafficCounters::default(),
            ping: None,
            pool: None,
            sampled_at: None,
            polled_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Initial,
    Create,
    Update,
    Delete,
    Shutdown,
    Log,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Initial => "initial",
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Shutdown => "shutdown",
            EventKind::Log => "log",
        }
    }

    /// Kinds that must reference an instance to make sense.
    pub fn requires_instance(&self) -> bool {
        matches!(
            self,
            EventKind::Initial | EventKind::Create | EventKind::Update | EventKind::Delete
        )
    }
}

impl FromStr for EventKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(EventKind::Initial),
            "create" => Ok(EventKind::Create),
            "update" => Ok(EventKind::Update),
            "delete" => Ok(EventKind::Delete),
            "shutdown" => Ok(EventKind::Shutdown),
            "log" => Ok(EventKind::Log),
            other => Err(SyncError::MalformedPayload(format!("unknown event type '{}'", other))),
        }
    }
}

/// Instance fields carried by an event or a poll. Absent fields leave the cache untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSample {
    pub role: Option<InstanceRole>,
    pub status: Option<String>,
    pub url: Option<String>,
    pub counters: Option<TrafficCounters>,
    pub ping: Option<i64>,
    pub pool: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum EventPayload {
    Instance(InstanceSample),
    Log(String),
    Empty,
}

/// Where an event came from. Stream events carry the endpoint's clock, polls
/// carry ours, so ordering is only checked between events of the same origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    #[default]
    Stream,
    Poll,
}

/// The normalized form of every remote notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalEvent {
    pub kind: EventKind,
    pub origin: EventOrigin,
    pub endpoint_id: EndpointId,
    pub instance_id: Option<InstanceId>,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl CanonicalEvent {
    pub fn sample(&self) -> Option<&InstanceSample> {
        match &self.payload {
            EventPayload::Instance(sample) => Some(sample),
            _ => None,
        }
    }
}

/// Subscription key grouping dashboard clients for fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Endpoint(EndpointId),
    Instance(InstanceId),
}

impl Scope {
    pub fn id(&self) -> &str {
        match self {
            Scope::Endpoint(id) | Scope::Instance(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Endpoint(_) => "endpoint",
            Scope::Instance(_) => "instance",
        }
    }

    /// Builds a scope from a kind keyword and an id, rejecting empty ids.
    pub fn from_parts(kind: &str, id: &str) -> Result<Self, SyncError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(SyncError::Configuration("scope id must not be empty".into()));
        }
        match kind {
            "endpoint" => Ok(Scope::Endpoint(id.to_string())),
            "instance" => Ok(Scope::Instance(id.to_string())),
            other => Err(SyncError::Configuration(format!("unknown scope kind '{}'", other))),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

impl FromStr for Scope {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, id)) => Scope::from_parts(kind, id),
            None => Err(SyncError::Configuration(format!(
                "scope '{}' must look like endpoint:<id> or instance:<id>",
                s
            ))),
        }
    }
}

/// Non-empty instance status text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusText(String);

impl StatusText {
    pub fn new(value: impl Into<String>) -> Result<Self, SyncError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(SyncError::Configuration("instance status must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Tunnel URL that parsed as an absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelUrl(String);

impl TunnelUrl {
    pub fn new(value: impl Into<String>) -> Result<Self, SyncError> {
        let value = value.into();
        url::Url::parse(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single typed change to one field of a cached entity.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    EndpointStatus {
        endpoint_id: EndpointId,
        status: EndpointStatus,
    },
    EndpointInfo {
        endpoint_id: EndpointId,
        info: EndpointInfo,
    },
    InstanceStatus {
        endpoint_id: EndpointId,
        instance_id: InstanceId,
        status: StatusText,
    },
    InstanceRole {
        endpoint_id: EndpointId,
        instance_id: InstanceId,
        role: InstanceRole,
    },
    InstanceUrl {
        endpoint_id: EndpointId,
        instance_id: InstanceId,
        url: TunnelUrl,
    },
}

impl FieldUpdate {
    pub fn endpoint_id(&self) -> &str {
        match self {
            FieldUpdate::EndpointStatus { endpoint_id, .. }
            | FieldUpdate::EndpointInfo { endpoint_id, .. }
            | FieldUpdate::InstanceStatus { endpoint_id, .. }
            | FieldUpdate::InstanceRole { endpoint_id, .. }
            | FieldUpdate::InstanceUrl { endpoint_id, .. } => endpoint_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_treats_counter_reset_as_fresh_start() {
        let before = TrafficCounters { tcp_rx: 500, tcp_tx: 10, udp_rx: 0, udp_tx: 7 };
        let after = TrafficCounters { tcp_rx: 650, tcp_tx: 4, udp_rx: 3, udp_tx: 7 };
        let delta = after.delta_from(&before);
        assert_eq!(delta, TrafficCounters { tcp_rx: 150, tcp_tx: 4, udp_rx: 3, udp_tx: 0 });
    }

    #[test]
    fn scope_parses_and_displays() {
        let scope: Scope = "instance:abc".parse().unwrap();
        assert_eq!(scope, Scope::Instance("abc".into()));
        assert_eq!(scope.to_string(), "instance:abc");
        assert!("tunnel:abc".parse::<Scope>().is_err());
        assert!("endpoint:".parse::<Scope>().is_err());
    }

    #[test]
    fn field_values_are_validated_at_construction() {
        assert!(StatusText::new("  ").is_err());
        assert_eq!(StatusText::new(" running ").unwrap().as_str(), "running");
        assert!(TunnelUrl::new("not a url").is_err());
        assert!(TunnelUrl::new("server://0.0.0.0:10101/127.0.0.1:8080").is_ok());
    }

    #[test]
    fn endpoint_credential_is_not_serialized() {
        let ep = Endpoint::new("e1", "http://10.0.0.1:9090/api", "secret");
        let json = serde_json::to_value(&ep).unwrap();
        assert!(json.get("apiKey").is_none());
        assert_eq!(json["status"], "OFFLINE");
    }
}
