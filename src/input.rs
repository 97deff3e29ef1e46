//! Scan target descriptor

use std::sync::OnceLock;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Result;

/// A captured request/response pair replacing the plain input when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRequestResponse {
    /// Absolute URL the capture was taken against.
    pub url: String,
    /// Request method of the capture.
    pub method: String,
    /// Raw request bytes as captured.
    pub request: String,
    /// Raw response bytes, if the capture included one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl RawRequestResponse {
    /// Stable identifier for the capture.
    pub fn id(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.url.as_bytes());
        hasher.update(self.method.as_bytes());
        hasher.update(self.request.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Identifies a scan target: an input URL or host:port, an optional IP
/// override for connection, and an optional captured raw request.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetaInput {
    /// The target as provided by the user.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input: String,
    /// IP to connect to instead of the resolved hostname.
    #[serde(rename = "customIP", default, skip_serializing_if = "String::is_empty")]
    pub custom_ip: String,
    /// Captured request for the input, when scanning from a capture.
    #[serde(rename = "raw-request", default, skip_serializing_if = "Option::is_none")]
    pub raw_request: Option<RawRequestResponse>,

    /// Memoized scan hash. Never serialized.
    #[serde(skip)]
    hash: OnceLock<[u8; 16]>,
}

impl MetaInput {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_custom_ip(input: impl Into<String>, custom_ip: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            custom_ip: custom_ip.into(),
            ..Default::default()
        }
    }

    /// The effective target: the raw-request URL when present, else the
    /// plain input.
    pub fn target(&self) -> &str {
        match &self.raw_request {
            Some(raw) if !raw.url.is_empty() => &raw.url,
            _ => &self.input,
        }
    }

    /// Parses the effective target as an absolute URL. Bare host:port
    /// inputs are retried with an `http://` scheme.
    pub fn url(&self) -> Result<Url> {
        let target = self.target();
        match Url::parse(target) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(Url::parse(&format!("http://{target}"))?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The explicit port of the input, empty when not present.
    pub fn port(&self) -> String {
        self.url()
            .ok()
            .and_then(|u| u.port())
            .map(|p| p.to_string())
            .unwrap_or_default()
    }

    /// The remote address of the target as `host:port`, substituting the
    /// custom IP for the hostname when set. The scheme supplies the
    /// default port (http 80, https 443, else 80). Does not resolve DNS.
    pub fn address(&self) -> String {
        let Ok(url) = self.url() else {
            return String::new();
        };
        let host = if self.custom_ip.is_empty() {
            url.host_str().unwrap_or_default().to_string()
        } else {
            self.custom_ip.clone()
        };
        let port = match url.port() {
            Some(p) => p,
            None => match url.scheme() {
                "https" => 443,
                _ => 80,
            },
        };
        format!("{host}:{port}")
    }

    /// Unique id for the target. Two targets with equal ids are the same
    /// host for error-cache purposes.
    pub fn id(&self) -> String {
        if !self.custom_ip.is_empty() {
            return format!("{}-{}", self.input, self.custom_ip);
        }
        if let Some(raw) = &self.raw_request {
            return raw.id();
        }
        self.input.clone()
    }

    /// Human-readable form for logs.
    pub fn pretty_print(&self) -> String {
        if !self.custom_ip.is_empty() {
            return format!("{} [{}]", self.input, self.custom_ip);
        }
        if let Some(raw) = &self.raw_request {
            return format!("{} [{}]", raw.url, raw.method);
        }
        self.input.clone()
    }

    /// Stable digest identifying a (template, target) scan: the raw 16
    /// MD5 bytes of `template_id:input:custom_ip` followed by the raw
    /// request id. Computed at most once per target; later calls reuse the
    /// memoized value even if fields changed in between.
    pub fn scan_hash(&self, template_id: &str) -> [u8; 16] {
        *self.hash.get_or_init(|| {
            let raw_id = self
                .raw_request
                .as_ref()
                .map(|r| r.id())
                .unwrap_or_default();
            let mut hasher = Md5::new();
            hasher.update(template_id.as_bytes());
            hasher.update(b":");
            hasher.update(self.input.as_bytes());
            hasher.update(b":");
            hasher.update(self.custom_ip.as_bytes());
            hasher.update(raw_id.as_bytes());
            hasher.finalize().into()
        })
    }

    pub fn marshal(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| crate::error::EngineError::Json(e).into())
    }

    pub fn unmarshal(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| crate::error::EngineError::Json(e).into())
    }
}

impl Clone for MetaInput {
    /// Deep copy. The memoized hash is reset so the clone recomputes it.
    fn clone(&self) -> Self {
        Self {
            input: self.input.clone(),
            custom_ip: self.custom_ip.clone(),
            raw_request: self.raw_request.clone(),
            hash: OnceLock::new(),
        }
    }
}

impl PartialEq for MetaInput {
    fn eq(&self, other: &Self) -> bool {
        self.input == other.input
            && self.custom_ip == other.custom_ip
            && self.raw_request == other.raw_request
    }
}
