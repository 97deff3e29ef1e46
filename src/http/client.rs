//! HTTP client wrapper with per-hop redirect capture
//!
//! Redirects are disabled at the `reqwest` level and followed manually so
//! every hop of the chain is retained for operator evaluation. Response
//! bodies are capped while streaming; the remote address of each dial is
//! recorded per host for the `ip` DSL variable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Method;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::error::{ErrorX, Result};

/// Default cap on response body bytes read per hop.
pub const DEFAULT_MAX_BODY: usize = 4 * 1024 * 1024;

const INITIAL_BACKOFF_MS: u64 = 500;

/// A rebuildable request description, independent of any client so retries
/// and redirect hops can re-issue it.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: String,
    pub url: String,
    /// Order-preserving header list.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// One captured response hop.
#[derive(Debug, Clone)]
pub struct ResponseHop {
    pub status: u16,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub url: String,
    pub truncated: bool,
}

impl ResponseHop {
    /// The raw header block, one `name: value` line per header.
    pub fn header_block(&self) -> String {
        let mut block = String::new();
        for (name, value) in &self.headers {
            block.push_str(name);
            block.push_str(": ");
            block.push_str(value);
            block.push_str("\r\n");
        }
        block
    }

    /// Reconstructed full response: status line, headers, body.
    pub fn full_response(&self) -> String {
        format!(
            "{} {}\r\n{}\r\n{}",
            self.version,
            self.status,
            self.header_block(),
            self.body
        )
    }

    /// Value of a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The final response plus each preceding redirect hop, in request order.
/// Evaluation walks it newest to oldest.
#[derive(Debug, Clone, Default)]
pub struct ResponseChain {
    hops: Vec<ResponseHop>,
}

impl ResponseChain {
    pub fn from_hops(hops: Vec<ResponseHop>) -> Self {
        Self { hops }
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// The final (most recent) response.
    pub fn final_hop(&self) -> Option<&ResponseHop> {
        self.hops.last()
    }

    /// Hops newest to oldest, the order operators evaluate them in.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &ResponseHop> {
        self.hops.iter().rev()
    }
}

/// HTTP client wrapper shared by an executor.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    retries: u32,
    dialed_ips: Arc<Mutex<HashMap<String, String>>>,
}

impl HttpClient {
    /// Builds a client from engine configuration. `cookie_reuse` enables a
    /// cookie jar across requests of one executor.
    pub fn new(config: &EngineConfig, cookie_reuse: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .cookie_store(cookie_reuse)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(ErrorX::from)?;
        Ok(Self {
            client,
            retries: config.retries,
            dialed_ips: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The last IP dialed for a hostname, recorded from completed calls.
    pub fn dialed_ip(&self, host: &str) -> Option<String> {
        self.dialed_ips
            .lock()
            .expect("dialed ip map poisoned")
            .get(host)
            .cloned()
    }

    /// Executes a request, following up to `max_redirects` redirects when
    /// `follow_redirects` is set, and capturing every hop. Bodies are
    /// capped at `max_body` bytes per hop.
    pub async fn execute(
        &self,
        spec: &RequestSpec,
        follow_redirects: bool,
        max_redirects: usize,
        max_body: usize,
    ) -> Result<ResponseChain> {
        let mut hops = Vec::new();
        let mut current = spec.clone();

        loop {
            let hop = self.send_with_retry(&current, max_body).await?;
            let redirect = follow_redirects
                .then(|| self.redirect_target(&current, &hop))
                .flatten();
            hops.push(hop);

            match redirect {
                Some(next) if hops.len() <= max_redirects => current = next,
                _ => break,
            }
        }
        Ok(ResponseChain::from_hops(hops))
    }

    fn redirect_target(&self, spec: &RequestSpec, hop: &ResponseHop) -> Option<RequestSpec> {
        if !(300..400).contains(&hop.status) {
            return None;
        }
        let location = hop.header("location")?;
        let base = Url::parse(&spec.url).ok()?;
        let next_url = base.join(location).ok()?;

        // 307/308 preserve method and body, other redirect codes demote
        // to GET.
        let (method, body) = if matches!(hop.status, 307 | 308) {
            (spec.method.clone(), spec.body.clone())
        } else {
            ("GET".to_string(), None)
        };
        Some(RequestSpec {
            method,
            url: next_url.to_string(),
            headers: spec.headers.clone(),
            body,
        })
    }

    async fn send_with_retry(&self, spec: &RequestSpec, max_body: usize) -> Result<ResponseHop> {
        let mut last_err: Option<ErrorX> = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1));
                debug!("retry attempt {attempt}, waiting {backoff:?}");
                sleep(backoff).await;
            }
            match self.send_once(spec, max_body).await {
                Ok(hop) => return Ok(hop),
                Err(e) => {
                    warn!("request to {} failed (attempt {attempt}): {e}", spec.url);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ErrorX::new("request failed with no error recorded")))
    }

    async fn send_once(&self, spec: &RequestSpec, max_body: usize) -> Result<ResponseHop> {
        let method = Method::from_bytes(spec.method.as_bytes())
            .map_err(|_| ErrorX::new(format!("unsupported HTTP method: {}", spec.method)))?;

        let mut req = self.client.request(method, &spec.url);
        for (name, value) in &spec.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            req = req.body(body.clone());
        }

        let mut resp = req.send().await.map_err(ErrorX::from)?;

        if let Some(addr) = resp.remote_addr() {
            if let Ok(url) = Url::parse(&spec.url) {
                if let Some(host) = url.host_str() {
                    self.dialed_ips
                        .lock()
                        .expect("dialed ip map poisoned")
                        .insert(host.to_string(), addr.ip().to_string());
                }
            }
        }

        let status = resp.status().as_u16();
        let version = format!("{:?}", resp.version());
        let url = resp.url().to_string();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();

        let cap = if max_body == 0 { DEFAULT_MAX_BODY } else { max_body };
        let mut buf: Vec<u8> = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = resp.chunk().await.map_err(ErrorX::from)? {
            if buf.len() + chunk.len() > cap {
                buf.extend_from_slice(&chunk[..cap - buf.len()]);
                truncated = true;
                break;
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(ResponseHop {
            status,
            version,
            headers,
            body: String::from_utf8_lossy(&buf).into_owned(),
            url,
            truncated,
        })
    }
}
