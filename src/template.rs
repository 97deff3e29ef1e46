//! Template container
//!
//! A template carries metadata plus at most one non-empty request list per
//! protocol. Parsing templates from YAML is the catalog loader's job; the
//! engine works on already-built values.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::dns::DnsRequest;
use crate::engine::http_executor::HttpRequest;
use crate::engine::tls::TlsRequest;
use crate::engine::Executer;

/// Template metadata surfaced on results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A declarative probe: id, info, and per-protocol request lists. At most
/// one of the lists is non-empty unless the template is multiprotocol.
#[derive(Clone, Default)]
pub struct Template {
    pub id: String,
    pub path: String,
    pub info: TemplateInfo,
    pub http: Vec<Arc<HttpRequest>>,
    pub dns: Vec<Arc<DnsRequest>>,
    pub tls: Vec<Arc<TlsRequest>>,
    /// Flow script gating request execution order. Flow templates are
    /// never clustered.
    pub flow: Option<String>,
    /// Multiprotocol templates share state across protocols and are never
    /// clustered.
    pub multiprotocol: bool,
    /// Compiled executer for the template, set by the engine.
    pub executer: Option<Arc<dyn Executer>>,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("http", &self.http.len())
            .field("dns", &self.dns.len())
            .field("tls", &self.tls.len())
            .field("flow", &self.flow)
            .field("multiprotocol", &self.multiprotocol)
            .finish()
    }
}

impl Template {
    pub fn new(id: impl Into<String>, info: TemplateInfo) -> Self {
        Self {
            id: id.into(),
            info,
            ..Default::default()
        }
    }

    /// Total number of probes across protocols, for progress accounting.
    pub fn total_requests(&self) -> usize {
        self.http.iter().map(|r| r.total_requests()).sum::<usize>()
            + self.dns.len()
            + self.tls.len()
    }
}
