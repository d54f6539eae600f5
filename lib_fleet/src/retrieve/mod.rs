//! # Data Retrieval Module
//!
//! Point-in-time HTTP access to endpoints, used by the monitor pollers.
//!
//! - **`ky_http`**: a generic `ApiClient` on `reqwest` and `reqwest-middleware`
//!   with exponential-backoff retries.
//! - **`endpoint_api`**: the endpoint `/info` and `/instances/{id}` queries
//!   built on it.

pub mod endpoint_api;
pub mod ky_http;

pub use endpoint_api::HttpEndpointApi;
pub use ky_http::{ApiClient, ApiResponse};
