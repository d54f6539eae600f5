//! Event transports.
//!
//! [`EventSource`] opens the live stream of one endpoint and yields the raw
//! `data` payload of every frame. [`SseEventSource`] is the production
//! transport; [`ChannelEventSource`] feeds payloads from in-process channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;

use crate::errors::SyncError;
use crate::ingestors::sse::SseDecoder;
use crate::model::{Endpoint, EndpointId};
use crate::retrieve::ky_http::{normalize_base, API_KEY_HEADER};

/// Raw payloads of one live connection. An `Err` item or the end of the
/// stream means the connection is gone.
pub type EventStream = BoxStream<'static, Result<String, SyncError>>;

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> Result<EventStream, SyncError>;
}

/// SSE over a long-lived `reqwest` response body.
pub struct SseEventSource {
    client: reqwest::Client,
    events_path: String,
    max_frame_bytes: usize,
}

impl SseEventSource {
    pub fn new(
        connect_timeout: Duration,
        events_path: impl Into<String>,
        max_frame_bytes: usize,
    ) -> Result<Self, SyncError> {
        // No overall timeout: the response body is meant to stay open
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SyncError::Configuration(format!("failed to build SSE client: {}", e)))?;
        Ok(Self {
            client,
            events_path: events_path.into(),
            max_frame_bytes,
        })
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn open(&self, endpoint: &Endpoint) -> Result<EventStream, SyncError> {
        let url = normalize_base(&endpoint.base_url)?.join(self.events_path.trim_start_matches('/'))?;
        let mut req = self.client.get(url).header(ACCEPT, "text/event-stream");
        if !endpoint.api_key.is_empty() {
            req = req.header(API_KEY_HEADER, endpoint.api_key.as_str());
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::TransientNetwork(format!(
                "event stream of {} answered HTTP {}",
                endpoint.id, status
            )));
        }

        // An oversized frame surfaces as an error item, which ends the connection
        let mut decoder = SseDecoder::with_limit(self.max_frame_bytes);
        let frames = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => match decoder.feed(&bytes) {
                    Ok(frames) => frames.into_iter().map(|frame| Ok(frame.data)).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                },
                Err(e) => vec![Err(SyncError::from(e))],
            })
            .flat_map(stream::iter);
        Ok(frames.boxed())
    }
}

type Feed = mpsc::UnboundedReceiver<Result<String, SyncError>>;

/// In-process transport. Each call to [`ChannelEventSource::feed`] prepares
/// one connection for an endpoint; opening an endpoint without a prepared
/// feed fails like a refused connection.
#[derive(Default)]
pub struct ChannelEventSource {
    feeds: Mutex<HashMap<EndpointId, Vec<Feed>>>,
    opens: AtomicU64,
}

impl ChannelEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares the next connection of `endpoint_id` and returns its sending side.
    /// Dropping the sender ends the stream.
    pub fn feed(&self, endpoint_id: &str) -> mpsc::UnboundedSender<Result<String, SyncError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(endpoint_id.to_string())
            .or_default()
            .push(rx);
        tx
    }

    /// How many connections have been opened, successful or not.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn open(&self, endpoint: &Endpoint) -> Result<EventStream, SyncError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let rx = {
            let mut feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
            feeds
                .get_mut(&endpoint.id)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };
        let rx = rx.ok_or_else(|| {
            SyncError::TransientNetwork(format!("connection to {} refused", endpoint.id))
        })?;
        let items = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(items.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_source_replays_feeds_in_order() {
        let source = ChannelEventSource::new();
        let ep = Endpoint::new("e1", "http://h/api", "");
        assert!(source.open(&ep).await.is_err());

        let tx = source.feed("e1");
        tx.send(Ok("a".into())).unwrap();
        tx.send(Ok("b".into())).unwrap();
        drop(tx);

        let items: Vec<String> = source
            .open(&ep)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec!["a", "b"]);
        assert_eq!(source.opens(), 2);
    }
}
