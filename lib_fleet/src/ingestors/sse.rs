//! # SSE Decoding and Wire Normalization
//!
//! Endpoints push Server-Sent Events. [`SseDecoder`] turns arbitrary byte
//! chunks into complete frames, and [`normalize`] turns a frame's `data`
//! payload into a [`CanonicalEvent`].

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::SyncError;
use crate::model::{
    CanonicalEvent, EndpointId, EventKind, EventOrigin, EventPayload, InstanceRole,
    InstanceSample, TrafficCounters,
};

/// One dispatched SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Default cap on a single line or a frame's accumulated `data`.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1 << 20;

/// Incremental SSE parser. Bytes may arrive split anywhere, including inside
/// a UTF-8 sequence or between `\r` and `\n`.
///
/// A line or a frame growing past `max_frame` is an error. The decoder resets
/// and the caller is expected to drop the connection.
#[derive(Debug)]
pub struct SseDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already searched for a newline.
    scanned: usize,
    max_frame: usize,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
    data_len: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_frame: max_frame.max(1),
            event: None,
            id: None,
            data: Vec::new(),
            data_len: 0,
        }
    }

    /// Bytes held back waiting for the end of a line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feeds a chunk and returns every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, SyncError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(rel) = self.buf[from..].iter().position(|b| *b == b'\n') {
            let end = from + rel;
            let mut line = &self.buf[start..end];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            let len = line.len();
            if len > self.max_frame {
                return Err(self.overflow(len));
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;
            from = start;
            match self.process_line(&line) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        let pending = self.buf.len();
        if pending > self.max_frame {
            return Err(self.overflow(pending));
        }
        Ok(frames)
    }

    fn overflow(&mut self, size: usize) -> SyncError {
        let limit = self.max_frame;
        *self = Self::with_limit(limit);
        SyncError::MalformedPayload(format!(
            "SSE frame of {} bytes exceeds the {} byte limit",
            size, limit
        ))
    }

    fn process_line(&mut self, line: &str) -> Result<Option<SseFrame>, SyncError> {
        if line.is_empty() {
            return Ok(self.dispatch());
        }
        if line.starts_with(':') {
            return Ok(None);
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => {
                self.data_len += value.len() + 1;
                if self.data_len > self.max_frame {
                    let size = self.data_len;
                    return Err(self.overflow(size));
                }
                self.data.push(value.to_string());
            }
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        self.data_len = 0;
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let frame = SseFrame {
            event: self.event.take(),
            id: self.id.clone(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(frame)
    }
}

/// Instance object as endpoints send it, in events and from `/instances/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireInstance {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub role: Option<String>,
    pub status: Option<String>,
    pub url: Option<String>,
    pub tcprx: Option<u64>,
    pub tcptx: Option<u64>,
    pub udprx: Option<u64>,
    pub udptx: Option<u64>,
    pub ping: Option<i64>,
    pub pool: Option<i64>,
}

impl WireInstance {
    /// Converts to a sample. Counters are present only if the wire carried at
    /// least one of them; missing ones read as zero.
    pub fn to_sample(&self) -> Result<InstanceSample, SyncError> {
        let role = match self.role.as_deref() {
            Some(r) if !r.is_empty() => Some(r.parse::<InstanceRole>()?),
            _ => None,
        };
        let any_counter = self.tcprx.is_some()
            || self.tcptx.is_some()
            || self.udprx.is_some()
            || self.udptx.is_some();
        let counters = any_counter.then(|| TrafficCounters {
            tcp_rx: self.tcprx.unwrap_or(0),
            tcp_tx: self.tcptx.unwrap_or(0),
            udp_rx: self.udprx.unwrap_or(0),
            udp_tx: self.udptx.unwrap_or(0),
        });
        Ok(InstanceSample {
            role,
            status: self.status.clone().filter(|s| !s.trim().is_empty()),
            url: self.url.clone().filter(|u| !u.is_empty()),
            counters,
            ping: self.ping,
            pool: self.pool,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    time: Option<String>,
    instance: Option<WireInstance>,
    logs: Option<String>,
}

fn parse_time(raw: Option<&str>) -> Result<DateTime<Utc>, SyncError> {
    match raw {
        None | Some("") => Ok(Utc::now()),
        Some(t) => DateTime::parse_from_rfc3339(t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| SyncError::MalformedPayload(format!("bad time '{}': {}", t, e))),
    }
}

/// Decodes one SSE `data` payload into a canonical event.
pub fn normalize(endpoint_id: &EndpointId, data: &str) -> Result<CanonicalEvent, SyncError> {
    let wire: WireEvent = serde_json::from_str(data)
        .map_err(|e| SyncError::MalformedPayload(format!("invalid JSON: {}", e)))?;
    let kind: EventKind = wire.kind.parse()?;
    let timestamp = parse_time(wire.time.as_deref())?;

    let instance_id = wire
        .instance
        .as_ref()
        .and_then(|i| i.id.clone())
        .filter(|id| !id.is_empty());
    if kind.requires_instance() && instance_id.is_none() {
        return Err(SyncError::MalformedPayload(format!(
            "{} event without instance id",
            kind.as_str()
        )));
    }

    let payload = match kind {
        EventKind::Initial | EventKind::Create | EventKind::Update => match &wire.instance {
            Some(inst) => EventPayload::Instance(inst.to_sample()?),
            None => EventPayload::Empty,
        },
        EventKind::Log => EventPayload::Log(wire.logs.unwrap_or_default()),
        EventKind::Delete | EventKind::Shutdown => EventPayload::Empty,
    };

    Ok(CanonicalEvent {
        kind,
        origin: EventOrigin::Stream,
        endpoint_id: endpoint_id.clone(),
        instance_id,
        payload,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_survive_arbitrary_chunking() {
        let raw = b": keepalive\r\nevent: message\r\ndata: {\"a\":1}\r\n\r\ndata: x\ndata: y\n\n";
        let mut whole = SseDecoder::new();
        let expected = whole.feed(raw).unwrap();
        assert_eq!(expected.len(), 2);
        assert_eq!(expected[0].data, "{\"a\":1}");
        assert_eq!(expected[0].event.as_deref(), Some("message"));
        assert_eq!(expected[1].data, "x\ny");

        for split in 1..raw.len() {
            let mut dec = SseDecoder::new();
            let mut frames = dec.feed(&raw[..split]).unwrap();
            frames.extend(dec.feed(&raw[split..]).unwrap());
            assert_eq!(frames, expected, "split at {}", split);
        }
    }

    #[test]
    fn endless_line_is_cut_off_at_the_limit() {
        let mut dec = SseDecoder::with_limit(64 * 1024);
        let chunk = vec![b'x'; 16 * 1024];
        let mut failed_at = None;
        for i in 0..64 {
            match dec.feed(&chunk) {
                Ok(frames) => assert!(frames.is_empty()),
                Err(e) => {
                    assert!(matches!(e, SyncError::MalformedPayload(_)));
                    failed_at = Some(i);
                    break;
                }
            }
            assert!(dec.buffered() <= 64 * 1024);
        }
        assert_eq!(failed_at, Some(4));
        assert_eq!(dec.buffered(), 0);

        // the decoder is usable again after the reset
        let frames = dec.feed(b"data: ok\n\n").unwrap();
        assert_eq!(frames[0].data, "ok");
    }

    #[test]
    fn oversized_multi_line_frame_is_rejected() {
        let mut dec = SseDecoder::with_limit(1024);
        let line = format!("data: {}\n", "y".repeat(300));
        assert!(dec.feed(line.as_bytes()).unwrap().is_empty());
        assert!(dec.feed(line.as_bytes()).unwrap().is_empty());
        assert!(dec.feed(line.as_bytes()).unwrap().is_empty());
        assert!(dec.feed(line.as_bytes()).is_err());
    }

    #[test]
    fn data_counter_resets_between_frames() {
        let mut dec = SseDecoder::with_limit(1024);
        let frame = format!("data: {}\n\n", "z".repeat(900));
        for _ in 0..5 {
            assert_eq!(dec.feed(frame.as_bytes()).unwrap().len(), 1);
        }
    }

    #[test]
    fn update_event_normalizes() {
        let data = r#"{"type":"update","time":"2024-05-01T10:00:00Z",
            "instance":{"id":"i1","type":"server","status":"running",
            "url":"server://:10101/127.0.0.1:8080","tcprx":100,"tcptx":5,"ping":12}}"#;
        let ev = normalize(&"e1".to_string(), data).unwrap();
        assert_eq!(ev.kind, EventKind::Update);
        assert_eq!(ev.instance_id.as_deref(), Some("i1"));
        let sample = ev.sample().unwrap();
        assert_eq!(sample.role, Some(InstanceRole::Server));
        assert_eq!(sample.counters.unwrap().tcp_rx, 100);
        assert_eq!(sample.counters.unwrap().udp_rx, 0);
        assert_eq!(sample.ping, Some(12));
        assert_eq!(ev.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn missing_time_means_now() {
        let before = Utc::now();
        let ev = normalize(&"e1".to_string(), r#"{"type":"shutdown"}"#).unwrap();
        assert!(ev.timestamp >= before);
        assert_eq!(ev.payload, EventPayload::Empty);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let e1 = "e1".to_string();
        for bad in [
            "not json",
            r#"{"type":"explode"}"#,
            r#"{"type":"update"}"#,
            r#"{"type":"create","instance":{"status":"x"}}"#,
            r#"{"type":"update","time":"yesterday","instance":{"id":"i"}}"#,
            r#"{"type":"update","instance":{"id":"i","type":"relay"}}"#,
        ] {
            assert!(
                matches!(normalize(&e1, bad), Err(SyncError::MalformedPayload(_))),
                "accepted {}",
                bad
            );
        }
    }

    #[test]
    fn log_event_carries_text() {
        let ev = normalize(
            &"e1".to_string(),
            r#"{"type":"log","instance":{"id":"i1"},"logs":"listening on :10101"}"#,
        )
        .unwrap();
        assert_eq!(ev.payload, EventPayload::Log("listening on :10101".into()));
        assert_eq!(ev.instance_id.as_deref(), Some("i1"));
    }
}
