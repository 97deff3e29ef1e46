//! Per-host pipelined client pool
//!
//! Turbo mode reuses a small number of connections per host and bounds the
//! requests queued on them. Clients are keyed on the host so repeated
//! executions against the same target share connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::config::EngineConfig;
use crate::error::{ErrorX, Result};
use crate::http::client::{RequestSpec, ResponseChain, ResponseHop};

/// Default cap on requests pending on a pipelined connection set.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 150;

/// A connection-bounded client for one host.
#[derive(Debug)]
pub struct PipelineClient {
    client: reqwest::Client,
    pending: Semaphore,
}

impl PipelineClient {
    fn new(config: &EngineConfig, max_connections: usize, max_pending: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(max_connections.max(1))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(ErrorX::from)?;
        Ok(Self {
            client,
            pending: Semaphore::new(max_pending.max(1)),
        })
    }

    /// Sends one request through the pipelined connection set, waiting for
    /// a pending slot first. Redirects are not followed in turbo mode.
    pub async fn send(&self, spec: &RequestSpec, max_body: usize) -> Result<ResponseChain> {
        let _slot = self
            .pending
            .acquire()
            .await
            .map_err(|_| ErrorX::new("pipeline client closed"))?;

        let method = reqwest::Method::from_bytes(spec.method.as_bytes())
            .map_err(|_| ErrorX::new(format!("unsupported HTTP method: {}", spec.method)))?;
        let mut req = self.client.request(method, &spec.url);
        for (name, value) in &spec.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            req = req.body(body.clone());
        }

        let resp = req.send().await.map_err(ErrorX::from)?;
        let status = resp.status().as_u16();
        let version = format!("{:?}", resp.version());
        let url = resp.url().to_string();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let cap = if max_body == 0 {
            crate::http::client::DEFAULT_MAX_BODY
        } else {
            max_body
        };
        let bytes = resp.bytes().await.map_err(ErrorX::from)?;
        let truncated = bytes.len() > cap;
        let body = String::from_utf8_lossy(&bytes[..bytes.len().min(cap)]).into_owned();

        Ok(ResponseChain::from_hops(vec![ResponseHop {
            status,
            version,
            headers,
            body,
            url,
            truncated,
        }]))
    }
}

/// Pool of pipelined clients keyed on host.
#[derive(Default)]
pub struct PipelineClientPool {
    clients: Mutex<HashMap<String, Arc<PipelineClient>>>,
}

impl PipelineClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pipelined client for a host, creating it on first use.
    pub fn get(
        &self,
        host: &str,
        config: &EngineConfig,
        max_connections: usize,
        max_pending: usize,
    ) -> Result<Arc<PipelineClient>> {
        let mut clients = self.clients.lock().expect("pipeline pool poisoned");
        if let Some(client) = clients.get(host) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(PipelineClient::new(config, max_connections, max_pending)?);
        clients.insert(host.to_string(), Arc::clone(&client));
        Ok(client)
    }
}
