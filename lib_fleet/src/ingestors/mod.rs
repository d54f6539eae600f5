//! # Ingestors
//!
//! Everything between an endpoint's event stream and the event router.
//!
//! - **`sse`**: incremental Server-Sent Events decoding and wire normalization.
//! - **`source`**: the [`EventSource`] transport seam with its SSE and channel
//!   implementations.
//! - **`manager`**: per-endpoint connection workers with backoff and manual stop.

pub mod manager;
pub mod source;
pub mod sse;

pub use manager::{ConnectionState, ConnectionStatus, IngestionManager};
pub use source::{ChannelEventSource, EventSource, EventStream, SseEventSource};
pub use sse::{normalize, SseDecoder, SseFrame, WireInstance, DEFAULT_MAX_FRAME_BYTES};
