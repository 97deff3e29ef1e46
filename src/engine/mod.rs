//! Execution engine: executor contract, per-run options, scan contexts,
//! protocol executors, clustering, and workflow traversal

pub mod cluster;
pub mod dns;
pub mod generator;
pub mod http_executor;
pub mod spm;
pub mod tls;
pub mod workflow;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::cache::{HostErrorsCache, Memoizer, ProjectFile};
use crate::config::EngineConfig;
use crate::error::{ErrorX, Result};
use crate::events::{InternalWrappedEvent, NullSink, OutputSink, ResultEvent};
use crate::input::MetaInput;
use crate::limiter::RateLimiter;
use crate::oob::OobRegistry;
use crate::template::TemplateInfo;

/// Per-run state threaded explicitly through every executor constructor.
/// Shared resources live here rather than in ambient statics so tests can
/// substitute them.
#[derive(Clone)]
pub struct ExecutorOptions {
    pub template_id: String,
    pub template_path: String,
    pub template_info: TemplateInfo,
    pub config: Arc<EngineConfig>,
    pub rate_limiter: Arc<RateLimiter>,
    pub host_errors: Option<Arc<HostErrorsCache>>,
    pub project_file: Option<Arc<ProjectFile>>,
    pub memoizer: Arc<Memoizer>,
    pub oob: Option<Arc<OobRegistry>>,
    pub sink: Arc<dyn OutputSink>,
    /// Template-level stop-at-first-match, OR-ed with the global setting
    /// and any request-level flag.
    pub stop_at_first_match: bool,
    /// Run-wide constants merged under payloads and extractions.
    pub constants: HashMap<String, String>,
}

impl ExecutorOptions {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::per_second(config.rate_limit));
        let host_errors = (config.max_host_errors > 0)
            .then(|| Arc::new(HostErrorsCache::new(config.max_host_errors)));
        let constants = config.vars.clone();
        Self {
            template_id: String::new(),
            template_path: String::new(),
            template_info: TemplateInfo::default(),
            config,
            rate_limiter,
            host_errors,
            project_file: None,
            memoizer: Arc::new(Memoizer::new()),
            oob: None,
            sink: Arc::new(NullSink),
            stop_at_first_match: false,
            constants,
        }
    }

    /// Starts out-of-band correlation when the configuration names a
    /// callback domain. Must run inside the async runtime.
    pub fn enable_oob(&mut self) {
        if self.oob.is_none() && !self.config.oob_domain.is_empty() {
            self.oob = Some(OobRegistry::start(self.config.oob_domain.clone()));
        }
    }

    /// Copy of these options bound to a template's identity.
    pub fn for_template(&self, id: &str, path: &str, info: TemplateInfo) -> Self {
        let mut options = self.clone();
        options.template_id = id.to_string();
        options.template_path = path.to_string();
        options.template_info = info;
        options
    }

    /// Effective stop-at-first-match for a request-level flag.
    pub fn should_stop_at_first_match(&self, request_flag: bool) -> bool {
        self.config.stop_at_first_match || self.stop_at_first_match || request_flag
    }
}

/// State for one (target, executer) invocation: the input plus every event
/// and error logged while executing against it. Clones share the logged
/// state, so concurrent transport tasks can hold one.
#[derive(Clone)]
pub struct ScanContext {
    pub input: MetaInput,
    events: Arc<Mutex<Vec<InternalWrappedEvent>>>,
    errors: Arc<Mutex<Vec<ErrorX>>>,
}

impl ScanContext {
    pub fn new(input: MetaInput) -> Self {
        Self {
            input,
            events: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Records an emitted event. Ownership transfers here; the transport
    /// never touches the event again.
    pub fn log_event(&self, event: InternalWrappedEvent) {
        self.events.lock().expect("scan events poisoned").push(event);
    }

    pub fn log_error(&self, err: ErrorX) {
        self.errors.lock().expect("scan errors poisoned").push(err);
    }

    /// Runs `f` over the events logged so far.
    pub fn with_events<T>(&self, f: impl FnOnce(&[InternalWrappedEvent]) -> T) -> T {
        let events = self.events.lock().expect("scan events poisoned");
        f(&events)
    }

    /// Flattens the user-visible results out of all logged events.
    pub fn generate_result(&self) -> Vec<ResultEvent> {
        self.events
            .lock()
            .expect("scan events poisoned")
            .iter()
            .flat_map(|e| e.results.iter().cloned())
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorX> {
        self.errors.lock().expect("scan errors poisoned").clone()
    }
}

/// Builds the executer for a template's protocol requests, bound to the
/// template's identity. Returns `None` for templates with no requests.
pub fn compile_executer(
    template: &crate::template::Template,
    options: &ExecutorOptions,
) -> Option<Arc<dyn Executer>> {
    let bound = Arc::new(options.for_template(&template.id, &template.path, template.info.clone()));
    if !template.http.is_empty() {
        return Some(Arc::new(http_executor::HttpExecutor::new(
            template.http.clone(),
            bound,
        )));
    }
    if !template.dns.is_empty() {
        return Some(Arc::new(dns::DnsExecutor::new(template.dns.clone(), bound)));
    }
    if !template.tls.is_empty() {
        return Some(Arc::new(tls::TlsExecutor::new(template.tls.clone(), bound)));
    }
    None
}

/// Contract shared by every protocol executor and the cluster executer.
///
/// Implementations are re-entrant across distinct scan contexts and
/// tolerate concurrent invocations.
#[async_trait]
pub trait Executer: Send + Sync {
    /// Prepares the executor. Idempotent; must be called before the first
    /// execute.
    fn compile(&self) -> Result<()>;

    /// Upper bound on probes performed, for progress accounting.
    fn requests(&self) -> usize;

    /// Executes against a target, writing results through the configured
    /// sink. Returns whether anything matched.
    async fn execute(&self, ctx: &ScanContext) -> Result<bool>;

    /// Executes against a target, returning results in memory and logging
    /// every emitted event on the context.
    async fn execute_with_results(&self, ctx: &ScanContext) -> Result<Vec<ResultEvent>>;
}
