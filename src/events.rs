//! Internal event plumbing
//!
//! The transport produces an [`InternalEvent`] DSL map per response hop;
//! operators wrap it into an [`InternalWrappedEvent`] carrying their result
//! and the user-visible [`ResultEvent`] list. Ownership of an event is
//! transferred to the callback synchronously, so no locking is needed on
//! the hot path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::operators::OperatorResult;
use crate::template::TemplateInfo;

/// Key-value DSL map built from a response: dumped request, response,
/// status, headers, body, timing, matched URL, ip, template identity.
pub type InternalEvent = HashMap<String, Value>;

/// Inserts a string value into an event map.
pub fn set_str(event: &mut InternalEvent, key: &str, value: impl Into<String>) {
    event.insert(key.to_string(), Value::String(value.into()));
}

/// Reads a string value from an event map, empty when absent.
pub fn get_str<'a>(event: &'a InternalEvent, key: &str) -> &'a str {
    event.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// How an event holds its response view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Values may share transport buffers; valid only until the callback
    /// returns.
    #[default]
    Reference,
    /// Values are detached copies safe to retain past the callback.
    Value,
}

/// An internal event plus the operator results produced over it.
#[derive(Debug, Default)]
pub struct InternalWrappedEvent {
    pub internal: InternalEvent,
    pub operator_result: Option<OperatorResult>,
    pub results: Vec<ResultEvent>,
    pub uses_interactsh: bool,
    store_mode: StoreMode,
}

impl InternalWrappedEvent {
    pub fn new(internal: InternalEvent) -> Self {
        Self {
            internal,
            ..Default::default()
        }
    }

    /// True iff operators ran over this event.
    pub fn has_operator_result(&self) -> bool {
        self.operator_result.is_some()
    }

    /// True iff at least one user-visible result was materialized.
    pub fn has_results(&self) -> bool {
        !self.results.is_empty()
    }

    pub fn store_mode(&self) -> StoreMode {
        self.store_mode
    }

    /// Switches the event to value storage, detaching its map from any
    /// shared transport buffers so downstream stages retaining the event
    /// do not pin response bodies for the scan lifetime.
    pub fn set_store_mode(&mut self, mode: StoreMode) {
        if mode == StoreMode::Value && self.store_mode == StoreMode::Reference {
            let detached: InternalEvent = self
                .internal
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.internal = detached;
        }
        self.store_mode = mode;
    }
}

/// User-visible result of a matched operator.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEvent {
    #[serde(rename = "template-id")]
    pub template_id: String,
    #[serde(rename = "template-path")]
    pub template_path: String,
    pub info: TemplateInfo,
    #[serde(rename = "matcher-name", skip_serializing_if = "Option::is_none")]
    pub matcher_name: Option<String>,
    #[serde(rename = "extracted-results", skip_serializing_if = "Vec::is_empty")]
    pub extracted_results: Vec<String>,
    #[serde(rename = "matched-at")]
    pub matched_at: String,
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response: String,
    #[serde(rename = "curl-command", skip_serializing_if = "String::is_empty")]
    pub curl_command: String,
    pub timestamp: DateTime<Utc>,
    /// False only on explicit matcher-status failure events.
    #[serde(rename = "matcher-status")]
    pub matcher_status: bool,
}

/// Callback invoked with ownership of each emitted event.
pub type EventCallback = Arc<dyn Fn(InternalWrappedEvent) + Send + Sync>;

/// Sink for user-visible results. Executors write through this on the
/// `execute` path; `execute_with_results` bypasses it.
pub trait OutputSink: Send + Sync {
    fn write(&self, event: &ResultEvent) -> Result<()>;

    /// Explicit non-match notification, emitted only when matcher-status
    /// reporting is enabled.
    fn write_failure(&self, _event: &ResultEvent) -> Result<()> {
        Ok(())
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&self, _event: &ResultEvent) -> Result<()> {
        Ok(())
    }
}

/// Sink collecting results in memory, used by tests and by callers that
/// post-process a whole run.
#[derive(Default)]
pub struct MemorySink {
    results: Mutex<Vec<ResultEvent>>,
    failures: Mutex<Vec<ResultEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<ResultEvent> {
        self.results.lock().expect("sink poisoned").clone()
    }

    pub fn failures(&self) -> Vec<ResultEvent> {
        self.failures.lock().expect("sink poisoned").clone()
    }
}

impl OutputSink for MemorySink {
    fn write(&self, event: &ResultEvent) -> Result<()> {
        self.results.lock().expect("sink poisoned").push(event.clone());
        Ok(())
    }

    fn write_failure(&self, event: &ResultEvent) -> Result<()> {
        self.failures.lock().expect("sink poisoned").push(event.clone());
        Ok(())
    }
}
