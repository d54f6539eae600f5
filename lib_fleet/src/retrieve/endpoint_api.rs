//! Point-in-time queries against endpoint HTTP APIs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::registry::PointInTimeSource;
use crate::errors::SyncError;
use crate::ingestors::sse::WireInstance;
use crate::model::{Endpoint, EndpointId, EndpointInfo, InstanceSample};
use crate::retrieve::ky_http::ApiClient;

/// `/info` body. Field names differ between endpoint releases.
#[derive(Debug, Deserialize)]
struct WireInfo {
    #[serde(alias = "ver")]
    version: Option<String>,
    #[serde(alias = "os")]
    platform: Option<String>,
    uptime: Option<u64>,
}

/// [`PointInTimeSource`] over the endpoint REST API. One client is kept per
/// endpoint and rebuilt when its URL or credential changes.
pub struct HttpEndpointApi {
    clients: Mutex<HashMap<EndpointId, (String, String, Arc<ApiClient>)>>,
    timeout: Duration,
}

impl HttpEndpointApi {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn client_for(&self, endpoint: &Endpoint) -> Result<Arc<ApiClient>, SyncError> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((url, key, client)) = clients.get(&endpoint.id) {
            if *url == endpoint.base_url && *key == endpoint.api_key {
                return Ok(Arc::clone(client));
            }
        }
        let client = Arc::new(ApiClient::new(
            &endpoint.base_url,
            Some(endpoint.api_key.clone()),
            self.timeout,
        )?);
        clients.insert(
            endpoint.id.clone(),
            (endpoint.base_url.clone(), endpoint.api_key.clone(), Arc::clone(&client)),
        );
        Ok(client)
    }
}

#[async_trait]
impl PointInTimeSource for HttpEndpointApi {
    async fn endpoint_info(&self, endpoint: &Endpoint) -> Result<EndpointInfo, SyncError> {
        let client = self.client_for(endpoint)?;
        let info: WireInfo = client.get_json("info").await?;
        Ok(EndpointInfo {
            version: info.version,
            platform: info.platform,
            uptime_secs: info.uptime,
        })
    }

    async fn instance_sample(
        &self,
        endpoint: &Endpoint,
        instance_id: &str,
    ) -> Result<InstanceSample, SyncError> {
        let client = self.client_for(endpoint)?;
        let wire: WireInstance = client.get_json(&format!("instances/{}", instance_id)).await?;
        wire.to_sample()
    }
}
