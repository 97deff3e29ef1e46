//! HTTP protocol executor
//!
//! Executes a template's HTTP requests against a target in one of five
//! modes: serial (default), parallel (`threads`), pipelined (`pipeline`),
//! race (`race` + `race_count`), or fuzzing (non-empty rules). Every
//! response hop funnels through the template's operators; stop-at-first-
//! match coordination is shared with the other modes through
//! [`SpmHandler`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::engine::generator::{make_request, AttackType, GeneratedRequest, RequestGenerator};
use crate::engine::spm::SpmHandler;
use crate::engine::{Executer, ExecutorOptions, ScanContext};
use crate::error::{ErrorX, Result};
use crate::events::{
    set_str, EventCallback, InternalEvent, InternalWrappedEvent, ResultEvent, StoreMode,
};
use crate::http::client::{HttpClient, RequestSpec, ResponseChain, ResponseHop};
use crate::http::dump::{curl_command, dump_request};
use crate::http::pipeline::{PipelineClientPool, DEFAULT_MAX_PENDING_REQUESTS};
use crate::http::raw::send_raw;
use crate::http::signer::{sign_aws, AWS_INTERNAL_VARS};
use crate::input::MetaInput;
use crate::oob::{has_oob_markers, PendingCorrelation};
use crate::operators::{make_failure_event, make_result_events, Operators};

/// Worker floor for pipelined mode, keeping its queues full.
const DEFAULT_MAX_WORKERS: usize = 150;

/// Request signing schemes. AWS only for now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    Aws,
}

/// Which request part a fuzzing rule mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzPart {
    Query,
    Path,
    Body,
}

/// How a fuzzing payload combines with the original value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzMode {
    Replace,
    Append,
}

/// A fuzzing rule deriving mutated requests from a base request.
#[derive(Debug, Clone)]
pub struct FuzzRule {
    pub part: FuzzPart,
    pub mode: FuzzMode,
    pub payloads: Vec<String>,
}

impl FuzzRule {
    /// Derives the fuzzed variants of a base request. Query rules mutate
    /// one parameter at a time so each probe isolates a single injection
    /// point.
    pub fn derivatives(&self, base: &RequestSpec) -> Vec<RequestSpec> {
        let mut out = Vec::new();
        match self.part {
            FuzzPart::Query => {
                let Ok(url) = Url::parse(&base.url) else {
                    return out;
                };
                let pairs: Vec<(String, String)> = url
                    .query_pairs()
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                for payload in &self.payloads {
                    for target_idx in 0..pairs.len() {
                        let mut mutated = url.clone();
                        mutated.query_pairs_mut().clear();
                        for (idx, (k, v)) in pairs.iter().enumerate() {
                            let value = if idx == target_idx {
                                match self.mode {
                                    FuzzMode::Replace => payload.clone(),
                                    FuzzMode::Append => format!("{v}{payload}"),
                                }
                            } else {
                                v.clone()
                            };
                            mutated.query_pairs_mut().append_pair(k, &value);
                        }
                        let mut spec = base.clone();
                        spec.url = mutated.to_string();
                        out.push(spec);
                    }
                }
            }
            FuzzPart::Path => {
                for payload in &self.payloads {
                    let Ok(mut url) = Url::parse(&base.url) else {
                        continue;
                    };
                    let path = match self.mode {
                        FuzzMode::Replace => payload.clone(),
                        FuzzMode::Append => format!("{}{payload}", url.path()),
                    };
                    url.set_path(&path);
                    let mut spec = base.clone();
                    spec.url = url.to_string();
                    out.push(spec);
                }
            }
            FuzzPart::Body => {
                for payload in &self.payloads {
                    let mut spec = base.clone();
                    spec.body = Some(match self.mode {
                        FuzzMode::Replace => payload.clone(),
                        FuzzMode::Append => {
                            format!("{}{payload}", spec.body.as_deref().unwrap_or_default())
                        }
                    });
                    out.push(spec);
                }
            }
        }
        out
    }
}

/// Execution mode of one template request, first condition wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Turbo,
    Race,
    Fuzzing,
    Parallel,
    Serial,
}

/// One HTTP request block of a template: the probes it describes (paths
/// and raw blocks crossed with payloads) plus its operators and mode
/// flags.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub paths: Vec<String>,
    /// Raw request blocks, sent over the wire byte-exact when `unsafe`.
    pub raw: Vec<String>,
    /// Order-preserving header list; order participates in cluster
    /// equality.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub payloads: HashMap<String, Vec<String>>,
    pub attack: AttackType,
    /// Worker count for parallel mode. 0 selects serial execution.
    pub threads: usize,
    pub race: bool,
    pub race_count: usize,
    pub pipeline: bool,
    pub pipeline_max_connections: usize,
    pub pipeline_max_pending: usize,
    pub fuzzing: Vec<FuzzRule>,
    pub unsafe_request: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub disable_cookie: bool,
    /// Response body cap override for this request.
    pub max_size: Option<usize>,
    pub stop_at_first_match: bool,
    /// Surfaces every DSL key suffixed `_N` for cross-request matching.
    pub needs_request_condition: bool,
    /// Per-request name; named requests are never clustered.
    pub name: Option<String>,
    pub self_contained: bool,
    pub signature: Option<Signature>,
    pub skip_variables_check: bool,
    pub operators: Operators,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self {
            method: "GET".into(),
            paths: Vec::new(),
            raw: Vec::new(),
            headers: Vec::new(),
            body: None,
            payloads: HashMap::new(),
            attack: AttackType::default(),
            threads: 0,
            race: false,
            race_count: 0,
            pipeline: false,
            pipeline_max_connections: 0,
            pipeline_max_pending: 0,
            fuzzing: Vec::new(),
            unsafe_request: false,
            follow_redirects: false,
            max_redirects: 10,
            disable_cookie: false,
            max_size: None,
            stop_at_first_match: false,
            needs_request_condition: false,
            name: None,
            self_contained: false,
            signature: None,
            skip_variables_check: false,
            operators: Operators::default(),
        }
    }
}

impl HttpRequest {
    fn mode(&self) -> Mode {
        if self.pipeline {
            Mode::Turbo
        } else if self.race && self.race_count > 0 {
            Mode::Race
        } else if !self.fuzzing.is_empty() {
            Mode::Fuzzing
        } else if self.threads > 0 {
            Mode::Parallel
        } else {
            Mode::Serial
        }
    }

    /// Upper bound on probes this request performs per target.
    pub fn total_requests(&self) -> usize {
        RequestGenerator::new(self).total()
    }

    /// Whether this request may share a transport call with structurally
    /// equal requests of other templates.
    pub fn is_clusterable(&self) -> bool {
        self.paths.len() == 1
            && self.raw.is_empty()
            && self.payloads.is_empty()
            && self.body.is_none()
            && !self.unsafe_request
            && !self.needs_request_condition
            && self.name.is_none()
            && self.fuzzing.is_empty()
            && !self.race
            && !self.pipeline
    }

    /// Structural equality for clustering: identical wire output
    /// regardless of operators. Header order is significant.
    pub fn can_cluster(&self, other: &HttpRequest) -> bool {
        self.is_clusterable()
            && other.is_clusterable()
            && self.method == other.method
            && self.paths == other.paths
            && self.headers == other.headers
            && self.max_redirects == other.max_redirects
            && self.disable_cookie == other.disable_cookie
            && self.follow_redirects == other.follow_redirects
    }
}

/// Executor for the HTTP requests of one template.
#[derive(Clone)]
pub struct HttpExecutor {
    requests: Vec<Arc<HttpRequest>>,
    options: Arc<ExecutorOptions>,
    client: Arc<OnceLock<HttpClient>>,
    pipeline_pool: Arc<PipelineClientPool>,
}

impl HttpExecutor {
    pub fn new(requests: Vec<Arc<HttpRequest>>, options: Arc<ExecutorOptions>) -> Self {
        Self {
            requests,
            options,
            client: Arc::new(OnceLock::new()),
            pipeline_pool: Arc::new(PipelineClientPool::new()),
        }
    }

    fn client(&self) -> Result<&HttpClient> {
        self.client
            .get()
            .ok_or_else(|| ErrorX::new("executor used before compile"))
    }

    async fn execute_with_callback(&self, ctx: &ScanContext, callback: EventCallback) -> Result<()> {
        let mut previous = InternalEvent::new();
        let mut dynamic_values: HashMap<String, String> = HashMap::new();

        for request in &self.requests {
            let result = match request.mode() {
                Mode::Turbo => {
                    self.execute_turbo(ctx, request, &dynamic_values, &previous, &callback)
                        .await
                }
                Mode::Race => self.execute_race(ctx, request, &mut previous, &callback).await,
                Mode::Fuzzing => self.execute_fuzzing(ctx, request, &callback).await,
                Mode::Parallel => {
                    self.execute_parallel(ctx, request, &dynamic_values, &callback)
                        .await
                }
                Mode::Serial => {
                    self.execute_serial(ctx, request, &mut dynamic_values, &mut previous, &callback)
                        .await
                }
            };
            if let Err(err) = result {
                if err.is_unresolved_variables() {
                    debug!(
                        template = %self.options.template_id,
                        "unresolved variables, stopping iteration for {}",
                        ctx.input.pretty_print()
                    );
                    break;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Serial mode: one request at a time, extractions feeding forward
    /// into later iterations.
    async fn execute_serial(
        &self,
        ctx: &ScanContext,
        request: &Arc<HttpRequest>,
        dynamic_values: &mut HashMap<String, String>,
        previous: &mut InternalEvent,
        callback: &EventCallback,
    ) -> Result<()> {
        let should_stop = self.options.should_stop_at_first_match(request.stop_at_first_match);
        let mut generator = RequestGenerator::new(request);
        let mut request_err: Option<ErrorX> = None;

        while let Some((data, payloads)) = generator.next_value() {
            self.options.rate_limiter.take().await;

            let generated = make_request(
                request,
                &ctx.input,
                &data,
                &payloads,
                dynamic_values,
                &self.options.constants,
                self.options.oob.as_deref(),
            )?;

            if let Some(cache) = &self.options.host_errors {
                if cache.check(&ctx.input.id()) {
                    debug!("skipping {} marked as failing", ctx.input.pretty_print());
                    break;
                }
            }

            let got_matches = Arc::new(AtomicBool::new(false));
            let extracted: Arc<Mutex<HashMap<String, String>>> =
                Arc::new(Mutex::new(HashMap::new()));
            let inner_callback: EventCallback = {
                let callback = Arc::clone(callback);
                let got_matches = Arc::clone(&got_matches);
                let extracted = Arc::clone(&extracted);
                Arc::new(move |event: InternalWrappedEvent| {
                    if let Some(result) = &event.operator_result {
                        got_matches.store(result.matched, Ordering::SeqCst);
                        let mut extracted = extracted.lock().expect("extractions poisoned");
                        for (name, values) in &result.dynamic_values {
                            if let Some(first) = values.first() {
                                extracted.insert(name.clone(), first.clone());
                            }
                        }
                    }
                    callback(event);
                })
            };

            let result = self
                .execute_request(
                    ctx,
                    request,
                    generated,
                    previous,
                    &inner_callback,
                    generator.current_index(),
                )
                .await;

            for (name, value) in extracted.lock().expect("extractions poisoned").drain() {
                dynamic_values.insert(name, value);
            }

            if let Err(err) = result {
                if err.is_unresolved_variables() {
                    return Ok(());
                }
                if let Some(cache) = &self.options.host_errors {
                    cache.mark_failed(&ctx.input.id(), &err);
                }
                request_err = Some(err);
                break;
            }

            if should_stop && got_matches.load(Ordering::SeqCst) {
                break;
            }
        }
        request_err.map_or(Ok(()), Err)
    }

    /// Parallel mode: a blocking SPM of `threads` workers; the generator
    /// produces on the main loop and each permit dispatches one request.
    async fn execute_parallel(
        &self,
        ctx: &ScanContext,
        request: &Arc<HttpRequest>,
        dynamic_values: &HashMap<String, String>,
        callback: &EventCallback,
    ) -> Result<()> {
        let should_stop = self.options.should_stop_at_first_match(request.stop_at_first_match);
        let spm = SpmHandler::blocking(request.threads, should_stop);
        let wrapped = spm_callback(Arc::clone(&spm), Arc::clone(callback), should_stop, true);

        let mut generator = RequestGenerator::new(request);
        while let Some((data, payloads)) = generator.next_value() {
            let generated = make_request(
                request,
                &ctx.input,
                &data,
                &payloads,
                dynamic_values,
                &self.options.constants,
                self.options.oob.as_deref(),
            )?;

            spm.acquire().await;
            let executor = self.clone();
            let ctx = ctx.clone();
            let request = Arc::clone(request);
            let spm_task = Arc::clone(&spm);
            let wrapped = Arc::clone(&wrapped);
            tokio::spawn(async move {
                if spm_task.found_first_match() || spm_task.is_done() {
                    spm_task.release();
                    return;
                }
                // The rate limiter permit is taken inside the worker, so
                // enqueueing never starves the generator.
                executor.options.rate_limiter.take().await;
                let mut previous = InternalEvent::new();
                let result = executor
                    .execute_request(&ctx, &request, generated, &mut previous, &wrapped, 0)
                    .await;
                if !spm_task.is_done() {
                    spm_task.send_result(result);
                }
                spm_task.release();
            });
        }

        spm.wait().await;
        if spm.found_first_match() {
            return Ok(());
        }
        spm.combined_results().map_or(Ok(()), Err)
    }

    /// Pipelined (turbo) mode: a per-host pipelined client plus a wide
    /// blocking SPM keeping its queues full.
    async fn execute_turbo(
        &self,
        ctx: &ScanContext,
        request: &Arc<HttpRequest>,
        dynamic_values: &HashMap<String, String>,
        previous: &InternalEvent,
        callback: &EventCallback,
    ) -> Result<()> {
        let url = ctx.input.url()?;
        let host = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        let max_connections = if request.pipeline_max_connections > 0 {
            request.pipeline_max_connections
        } else {
            1
        };
        let max_pending = if request.pipeline_max_pending > 0 {
            request.pipeline_max_pending
        } else {
            DEFAULT_MAX_PENDING_REQUESTS
        };
        let pipeline_client =
            self.pipeline_pool
                .get(&host, &self.options.config, max_connections, max_pending)?;

        let max_workers = DEFAULT_MAX_WORKERS.max(max_pending);
        let should_stop = self.options.should_stop_at_first_match(request.stop_at_first_match);
        let spm = SpmHandler::blocking(max_workers, should_stop);
        let wrapped = spm_callback(Arc::clone(&spm), Arc::clone(callback), should_stop, false);

        let mut generator = RequestGenerator::new(request);
        while let Some((data, payloads)) = generator.next_value() {
            let mut generated = make_request(
                request,
                &ctx.input,
                &data,
                &payloads,
                dynamic_values,
                &self.options.constants,
                self.options.oob.as_deref(),
            )?;
            generated.pipeline_client = Some(Arc::clone(&pipeline_client));

            spm.acquire().await;
            let executor = self.clone();
            let ctx = ctx.clone();
            let request = Arc::clone(request);
            let spm_task = Arc::clone(&spm);
            let wrapped = Arc::clone(&wrapped);
            let mut previous = previous.clone();
            tokio::spawn(async move {
                if spm_task.found_first_match() || spm_task.is_done() {
                    spm_task.release();
                    return;
                }
                let result = executor
                    .execute_request(&ctx, &request, generated, &mut previous, &wrapped, 0)
                    .await;
                if !spm_task.is_done() {
                    spm_task.send_result(result);
                }
                spm_task.release();
            });
        }

        spm.wait().await;
        if spm.found_first_match() {
            return Ok(());
        }
        spm.combined_results().map_or(Ok(()), Err)
    }

    /// Race mode: pre-generate `race_count` requests, then launch them all
    /// concurrently under a non-blocking SPM.
    async fn execute_race(
        &self,
        ctx: &ScanContext,
        request: &Arc<HttpRequest>,
        previous: &mut InternalEvent,
        callback: &EventCallback,
    ) -> Result<()> {
        let empty = HashMap::new();

        // The request is dumped once up front so the `request` DSL
        // variable is available to operators; race requests themselves are
        // never dumped mid-flight.
        let mut first_generator = RequestGenerator::new(request);
        let Some((data, payloads)) = first_generator.next_value() else {
            return Ok(());
        };
        let first = make_request(
            request,
            &ctx.input,
            &data,
            &payloads,
            &empty,
            &self.options.constants,
            self.options.oob.as_deref(),
        )?;
        let dumped = dump_generated(&first)?;
        if self.options.config.debug_requests {
            debug!(
                template = %self.options.template_id,
                "dumped HTTP request for {}:\n{}",
                ctx.input.pretty_print(),
                dumped
            );
        }
        set_str(previous, "request", dumped);

        let mut generated_requests = Vec::with_capacity(request.race_count);
        for _ in 0..request.race_count {
            let mut generator = RequestGenerator::new(request);
            let Some((data, payloads)) = generator.next_value() else {
                break;
            };
            generated_requests.push(make_request(
                request,
                &ctx.input,
                &data,
                &payloads,
                &empty,
                &self.options.constants,
                self.options.oob.as_deref(),
            )?);
        }

        let should_stop = self.options.should_stop_at_first_match(request.stop_at_first_match);
        let spm = SpmHandler::non_blocking(should_stop);
        let wrapped = spm_callback(Arc::clone(&spm), Arc::clone(callback), should_stop, false);
        let previous_snapshot = previous.clone();

        for generated in generated_requests {
            spm.acquire().await;
            let executor = self.clone();
            let ctx = ctx.clone();
            let request = Arc::clone(request);
            let spm_task = Arc::clone(&spm);
            let wrapped = Arc::clone(&wrapped);
            let mut previous = previous_snapshot.clone();
            tokio::spawn(async move {
                if spm_task.found_first_match() || spm_task.is_done() {
                    spm_task.release();
                    return;
                }
                let result = executor
                    .execute_request(&ctx, &request, generated, &mut previous, &wrapped, 0)
                    .await;
                if !spm_task.is_done() {
                    spm_task.send_result(result);
                }
                spm_task.release();
            });
        }

        spm.wait().await;
        if spm.found_first_match() {
            return Ok(());
        }
        spm.combined_results().map_or(Ok(()), Err)
    }

    /// Fuzzing mode: each rule derives mutated requests from every
    /// generated base request; derivatives run synchronously.
    async fn execute_fuzzing(
        &self,
        ctx: &ScanContext,
        request: &Arc<HttpRequest>,
        callback: &EventCallback,
    ) -> Result<()> {
        if !request.self_contained {
            ctx.input.url()?;
        }
        let should_stop = self.options.should_stop_at_first_match(request.stop_at_first_match);
        let empty = HashMap::new();

        let mut generator = RequestGenerator::new(request);
        while let Some((data, payloads)) = generator.next_value() {
            let generated = match make_request(
                request,
                &ctx.input,
                &data,
                &payloads,
                &empty,
                &self.options.constants,
                self.options.oob.as_deref(),
            ) {
                Ok(g) => g,
                Err(_) => continue,
            };
            let Some(base_spec) = generated.spec.clone() else {
                continue;
            };

            for rule in &request.fuzzing {
                'derivatives: for derivative in rule.derivatives(&base_spec) {
                    if let Some(cache) = &self.options.host_errors {
                        if cache.check(&ctx.input.id()) {
                            break 'derivatives;
                        }
                    }
                    self.options.rate_limiter.take().await;

                    let fuzzed = GeneratedRequest {
                        spec: Some(derivative),
                        raw: None,
                        dynamic_values: generated.dynamic_values.clone(),
                        meta: generated.meta.clone(),
                        interactsh_urls: generated.interactsh_urls.clone(),
                        source: Arc::clone(request),
                        pipeline_client: None,
                    };

                    let got_matches = Arc::new(AtomicBool::new(false));
                    let inner_callback: EventCallback = {
                        let callback = Arc::clone(callback);
                        let got_matches = Arc::clone(&got_matches);
                        Arc::new(move |event: InternalWrappedEvent| {
                            if let Some(result) = &event.operator_result {
                                if result.matched {
                                    got_matches.store(true, Ordering::SeqCst);
                                }
                            }
                            callback(event);
                        })
                    };

                    let mut previous = InternalEvent::new();
                    let result = self
                        .execute_request(ctx, request, fuzzed, &mut previous, &inner_callback, 0)
                        .await;
                    if let Err(err) = result {
                        if err.is_unresolved_variables() {
                            break 'derivatives;
                        }
                        if let Some(cache) = &self.options.host_errors {
                            cache.mark_failed(&ctx.input.id(), &err);
                        }
                        debug!(
                            template = %self.options.template_id,
                            "error occurred in fuzzed request: {err}"
                        );
                    }
                    if should_stop && got_matches.load(Ordering::SeqCst) {
                        break 'derivatives;
                    }
                }
            }
        }
        Ok(())
    }

    /// Executes one generated request and evaluates its response chain.
    async fn execute_request(
        &self,
        ctx: &ScanContext,
        request: &Arc<HttpRequest>,
        mut generated: GeneratedRequest,
        previous: &mut InternalEvent,
        callback: &EventCallback,
        request_count: usize,
    ) -> Result<()> {
        let config = &self.options.config;
        let input = &ctx.input;

        if let Some(spec) = &mut generated.spec {
            for (name, value) in &config.custom_headers {
                spec.headers.retain(|(h, _)| !h.eq_ignore_ascii_case(name));
                spec.headers.push((name.clone(), value.clone()));
            }
        }

        // Evaluate per-request meta against the merged variable view.
        let mut final_map = generated.dynamic_values.clone();
        for (k, v) in &generated.meta {
            final_map.insert(k.clone(), v.clone());
        }
        if !input.custom_ip.is_empty() {
            final_map
                .entry("ip".to_string())
                .or_insert_with(|| input.custom_ip.clone());
        }
        generated.meta = generated
            .meta
            .iter()
            .map(|(k, v)| (k.clone(), crate::engine::generator::interpolate(v, &final_map)))
            .collect();

        // Race requests are dumped once up front by the race driver.
        let dumped = if request.race {
            String::new()
        } else {
            dump_generated(&generated)?
        };
        if config.debug_requests && !dumped.is_empty() {
            debug!(
                template = %self.options.template_id,
                "dumped HTTP request for {}:\n{}",
                input.pretty_print(),
                dumped
            );
        }

        let formed_url = {
            let url = generated.url();
            if url.is_empty() {
                input.input.clone()
            } else {
                url
            }
        };
        let hostname = input
            .url()
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_default();
        let max_body = request.max_size.unwrap_or(config.response_read_size);

        let started = Instant::now();
        let mut from_cache = false;
        let transported: Result<ResponseChain> = 'transport: {
            if let Some(pipeline_client) = &generated.pipeline_client {
                if let Some(spec) = &generated.spec {
                    break 'transport pipeline_client.send(spec, max_body).await;
                }
            }
            if request.unsafe_request {
                if let Some(raw) = &generated.raw {
                    let address = input.address();
                    let tls = input.url().map(|u| u.scheme() == "https").unwrap_or(false);
                    break 'transport send_raw(
                        &address,
                        tls,
                        &hostname,
                        raw.data.as_bytes(),
                        config.timeout_secs,
                        max_body,
                    )
                    .await;
                }
            }
            let Some(spec) = &mut generated.spec else {
                break 'transport Err(ErrorX::new("generated request has no sendable form"));
            };
            if let Some(project) = &self.options.project_file {
                if let Some(stored) = project.get(dumped.as_bytes()) {
                    from_cache = true;
                    break 'transport Ok(ResponseChain::from_hops(vec![stored.to_hop()]));
                }
            }
            if matches!(request.signature, Some(Signature::Aws)) {
                sign_aws(spec, |key| {
                    final_map
                        .get(key)
                        .cloned()
                        .or_else(|| config.vars.get(key).cloned())
                })?;
            }
            let client = self.client()?;
            client
                .execute(spec, request.follow_redirects, request.max_redirects, max_body)
                .await
        };
        let duration = started.elapsed();

        let chain = match transported {
            Ok(chain) => chain,
            Err(err) => {
                // Failed requests still emit a minimal event so an
                // out-of-band interaction arriving later can correlate.
                let synthetic = ResponseHop {
                    status: 0,
                    version: "HTTP/1.1".into(),
                    headers: Vec::new(),
                    body: String::new(),
                    url: formed_url.clone(),
                    truncated: false,
                };
                let mut output_event = self.response_to_dsl(
                    &synthetic,
                    input,
                    &formed_url,
                    &dumped,
                    duration.as_secs_f64(),
                    &generated.meta,
                );
                self.set_event_ip(&mut output_event, input, &hostname);
                let wrapped = InternalWrappedEvent::new(output_event);
                callback(wrapped);
                return Err(err);
            }
        };

        debug!(
            template = %self.options.template_id,
            "sent HTTP request to {formed_url}"
        );

        let curl = match &generated.spec {
            Some(spec) if !request.unsafe_request && !request.race => curl_command(
                &spec.method,
                &spec.url,
                &spec.headers,
                spec.body.as_deref(),
            ),
            _ => String::new(),
        };

        let should_stop = self.options.should_stop_at_first_match(request.stop_at_first_match);
        let mut project_filled = from_cache;

        for hop in chain.iter_newest_first() {
            // Persist the final response exactly once per request.
            if !project_filled {
                if let Some(project) = &self.options.project_file {
                    project.set(dumped.as_bytes(), hop.into());
                }
                project_filled = true;
            }

            let matched_url = if hop.url.is_empty() {
                formed_url.clone()
            } else {
                hop.url.clone()
            };
            let mut output_event = self.response_to_dsl(
                hop,
                input,
                &matched_url,
                &dumped,
                duration.as_secs_f64(),
                &generated.meta,
            );
            set_str(&mut output_event, "curl-command", curl.clone());
            self.set_event_ip(&mut output_event, input, &hostname);
            if let Some(oob) = &self.options.oob {
                oob.make_placeholders(&generated.interactsh_urls, &mut output_event);
            }

            let mut final_event = previous.clone();
            final_event.extend(output_event.clone());

            // Cross-request matching: surface every key suffixed with the
            // request index in the template's sequence.
            if request.needs_request_condition {
                for (key, value) in &output_event {
                    let indexed = format!("{key}_{request_count}");
                    previous.insert(indexed.clone(), value.clone());
                    final_event.insert(indexed, value.clone());
                }
            }

            if matches!(request.signature, Some(Signature::Aws)) {
                for var in AWS_INTERNAL_VARS {
                    generated.meta.remove(*var);
                    final_event.remove(*var);
                }
            }

            for (name, value) in &generated.dynamic_values {
                final_event
                    .entry(name.clone())
                    .or_insert_with(|| Value::String(value.clone()));
            }

            let mut wrapped = InternalWrappedEvent::new(final_event);
            if let Some(mut result) = request.operators.execute(&wrapped.internal) {
                result.payload_values = generated.meta.clone();
                wrapped.operator_result = Some(result);
                wrapped.results = make_result_events(
                    &wrapped,
                    &self.options.template_id,
                    &self.options.template_path,
                    &self.options.template_info,
                );
            }

            let uses_oob = request.operators.has_oob_matchers()
                || !generated.interactsh_urls.is_empty()
                || request.raw.iter().any(|r| has_oob_markers(r));
            if uses_oob {
                wrapped.uses_interactsh = true;
                if let Some(oob) = &self.options.oob {
                    oob.register(
                        &generated.interactsh_urls,
                        PendingCorrelation {
                            event: wrapped.internal.clone(),
                            operators: request.operators.clone(),
                            template_id: self.options.template_id.clone(),
                            template_path: self.options.template_path.clone(),
                            info: self.options.template_info.clone(),
                            sink: Arc::clone(&self.options.sink),
                        },
                    );
                }
            }

            if config.debug_requests {
                debug!(
                    template = %self.options.template_id,
                    "dumped HTTP response for {matched_url}:\n{}",
                    hop.full_response()
                );
            }

            let has_results = wrapped.has_results();
            callback(wrapped);

            if should_stop && has_results {
                return Ok(());
            }
        }
        Ok(())
    }

    fn set_event_ip(&self, event: &mut InternalEvent, input: &MetaInput, hostname: &str) {
        let ip = if input.custom_ip.is_empty() {
            self.client
                .get()
                .and_then(|c| c.dialed_ip(hostname))
                .unwrap_or_default()
        } else {
            input.custom_ip.clone()
        };
        set_str(event, "ip", ip);
    }

    /// Builds the DSL map for one response hop.
    fn response_to_dsl(
        &self,
        hop: &ResponseHop,
        input: &MetaInput,
        matched_url: &str,
        dumped_request: &str,
        duration_secs: f64,
        meta: &HashMap<String, String>,
    ) -> InternalEvent {
        let mut event = InternalEvent::new();
        set_str(&mut event, "input", input.input.clone());
        set_str(
            &mut event,
            "host",
            input
                .url()
                .ok()
                .and_then(|u| u.host_str().map(String::from))
                .unwrap_or_default(),
        );
        set_str(&mut event, "matched", matched_url);
        set_str(&mut event, "request", dumped_request);
        set_str(&mut event, "response", hop.full_response());
        set_str(&mut event, "body", hop.body.clone());
        set_str(&mut event, "all_headers", hop.header_block());
        event.insert("status_code".into(), Value::from(u64::from(hop.status)));
        event.insert("content_length".into(), Value::from(hop.body.len() as u64));
        event.insert("duration".into(), Value::from(duration_secs));
        set_str(&mut event, "template-id", self.options.template_id.clone());
        set_str(&mut event, "template-path", self.options.template_path.clone());
        event.insert(
            "template-info".into(),
            serde_json::to_value(&self.options.template_info).unwrap_or(Value::Null),
        );
        for (name, value) in &hop.headers {
            let key = name.to_lowercase().replace('-', "_");
            set_str(&mut event, &key, value.clone());
        }
        for (name, value) in meta {
            set_str(&mut event, name, value.clone());
        }
        event
    }
}

/// Wraps an output callback with SPM semantics: events carrying results go
/// through the once-gate, everything else passes straight through.
fn spm_callback(
    spm: Arc<SpmHandler>,
    callback: EventCallback,
    should_stop: bool,
    value_store: bool,
) -> EventCallback {
    Arc::new(move |mut event: InternalWrappedEvent| {
        if value_store {
            // Downstream stages retain event references; detaching the
            // response view here frees transport buffers promptly.
            event.set_store_mode(StoreMode::Value);
        }
        if !event.has_operator_result() {
            callback(event);
            return;
        }
        if event.has_results() {
            spm.match_callback(|| callback(event));
            if should_stop {
                spm.trigger();
            }
        } else {
            callback(event);
        }
    })
}

fn dump_generated(generated: &GeneratedRequest) -> Result<String> {
    if let Some(raw) = &generated.raw {
        return Ok(raw.data.clone());
    }
    let Some(spec) = &generated.spec else {
        return Ok(String::new());
    };
    let url = Url::parse(&spec.url)?;
    Ok(dump_request(
        &spec.method,
        &url,
        &spec.headers,
        spec.body.as_deref(),
    ))
}

#[async_trait]
impl Executer for HttpExecutor {
    fn compile(&self) -> Result<()> {
        if self.client.get().is_some() {
            return Ok(());
        }
        let disable_cookie = self
            .requests
            .first()
            .map(|r| r.disable_cookie)
            .unwrap_or(false);
        let client = HttpClient::new(&self.options.config, !disable_cookie)?;
        let _ = self.client.set(client);
        Ok(())
    }

    fn requests(&self) -> usize {
        self.requests.iter().map(|r| r.total_requests()).sum()
    }

    async fn execute(&self, ctx: &ScanContext) -> Result<bool> {
        self.compile()?;
        let matched = Arc::new(AtomicBool::new(false));
        let sink = Arc::clone(&self.options.sink);
        let options = Arc::clone(&self.options);
        let matcher_status = self.options.config.matcher_status;
        let matched_cb = Arc::clone(&matched);

        let callback: EventCallback = Arc::new(move |event: InternalWrappedEvent| {
            if event.has_results() {
                matched_cb.store(true, Ordering::SeqCst);
                for result in &event.results {
                    if let Err(e) = sink.write(result) {
                        warn!("could not write result: {e}");
                    }
                }
            } else if matcher_status && event.has_operator_result() {
                let failure = make_failure_event(
                    &event,
                    &options.template_id,
                    &options.template_path,
                    &options.template_info,
                );
                if let Err(e) = sink.write_failure(&failure) {
                    warn!("could not write failure event: {e}");
                }
            }
        });

        match self.execute_with_callback(ctx, callback).await {
            Ok(()) => Ok(matched.load(Ordering::SeqCst)),
            Err(_) if matched.load(Ordering::SeqCst) => Ok(true),
            Err(err) => Err(err),
        }
    }

    async fn execute_with_results(&self, ctx: &ScanContext) -> Result<Vec<ResultEvent>> {
        self.compile()?;
        let log_ctx = ctx.clone();
        let callback: EventCallback =
            Arc::new(move |event: InternalWrappedEvent| log_ctx.log_event(event));
        let result = self.execute_with_callback(ctx, callback).await;
        if let Err(err) = result {
            ctx.log_error(err.clone());
            return Err(err);
        }
        Ok(ctx.generate_result())
    }
}
