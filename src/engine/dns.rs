//! DNS protocol executor
//!
//! Sibling of the HTTP executor satisfying the common contract: resolves
//! the templated name and funnels the answer through the template's
//! operators. DNS requests cluster only on exact request equality.

use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioResolver;
use serde_json::Value;
use tracing::debug;

use crate::engine::generator::{interpolate, target_variables};
use crate::engine::{Executer, ExecutorOptions, ScanContext};
use crate::error::{EngineError, ErrorX, Result};
use crate::events::{set_str, EventCallback, InternalEvent, InternalWrappedEvent, ResultEvent};
use crate::operators::{make_result_events, Operators};

/// Record kinds the executor can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsRecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Ns,
    Txt,
    Soa,
}

impl DnsRecordType {
    fn to_record_type(self) -> RecordType {
        match self {
            DnsRecordType::A => RecordType::A,
            DnsRecordType::Aaaa => RecordType::AAAA,
            DnsRecordType::Cname => RecordType::CNAME,
            DnsRecordType::Mx => RecordType::MX,
            DnsRecordType::Ns => RecordType::NS,
            DnsRecordType::Txt => RecordType::TXT,
            DnsRecordType::Soa => RecordType::SOA,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DnsRecordType::A => "A",
            DnsRecordType::Aaaa => "AAAA",
            DnsRecordType::Cname => "CNAME",
            DnsRecordType::Mx => "MX",
            DnsRecordType::Ns => "NS",
            DnsRecordType::Txt => "TXT",
            DnsRecordType::Soa => "SOA",
        }
    }
}

/// One DNS request of a template: a name pattern plus the record type.
#[derive(Debug, Clone)]
pub struct DnsRequest {
    /// Name to query, typically `{{FQDN}}` or a literal.
    pub name: String,
    pub record_type: DnsRecordType,
    pub operators: Operators,
}

impl DnsRequest {
    /// DNS clustering requires exact request equality; operators may
    /// differ freely.
    pub fn can_cluster(&self, other: &DnsRequest) -> bool {
        self.name == other.name && self.record_type == other.record_type
    }

    pub fn is_clusterable(&self) -> bool {
        true
    }
}

/// Executor for the DNS requests of one template.
pub struct DnsExecutor {
    requests: Vec<Arc<DnsRequest>>,
    options: Arc<ExecutorOptions>,
    resolver: std::sync::OnceLock<TokioResolver>,
}

impl DnsExecutor {
    pub fn new(requests: Vec<Arc<DnsRequest>>, options: Arc<ExecutorOptions>) -> Self {
        Self {
            requests,
            options,
            resolver: std::sync::OnceLock::new(),
        }
    }

    fn resolver(&self) -> Result<&TokioResolver> {
        self.resolver
            .get()
            .ok_or_else(|| ErrorX::new("executor used before compile"))
    }

    async fn execute_with_callback(&self, ctx: &ScanContext, callback: EventCallback) -> Result<()> {
        let input = &ctx.input;
        let variables = {
            let mut vars = target_variables(input)?;
            let host = vars.get("Host").cloned().unwrap_or_default();
            vars.insert("FQDN".into(), host);
            vars
        };

        let mut request_err: Option<ErrorX> = None;
        for request in &self.requests {
            self.options.rate_limiter.take().await;

            let name = interpolate(&request.name, &variables);
            let started = std::time::Instant::now();
            let lookup = self
                .resolver()?
                .lookup(name.as_str(), request.record_type.to_record_type())
                .await;
            let duration = started.elapsed();

            let mut event = InternalEvent::new();
            set_str(&mut event, "input", input.input.clone());
            set_str(&mut event, "host", name.clone());
            set_str(&mut event, "matched", name.clone());
            set_str(
                &mut event,
                "request",
                format!("{} {}", request.record_type.as_str(), name),
            );
            event.insert("duration".into(), Value::from(duration.as_secs_f64()));
            set_str(&mut event, "template-id", self.options.template_id.clone());
            set_str(&mut event, "template-path", self.options.template_path.clone());

            match lookup {
                Ok(answer) => {
                    let records: Vec<String> =
                        answer.iter().map(|r| r.to_string()).collect();
                    set_str(&mut event, "answer", records.join("\n"));
                    set_str(&mut event, "body", records.join("\n"));
                    set_str(&mut event, "rcode", "NOERROR");
                }
                Err(e) => {
                    debug!(
                        template = %self.options.template_id,
                        "DNS lookup for {name} failed: {e}"
                    );
                    set_str(&mut event, "answer", "");
                    set_str(&mut event, "body", "");
                    set_str(&mut event, "rcode", "SERVFAIL");
                    let err: ErrorX = EngineError::Resolve(e.to_string()).into();
                    if let Some(cache) = &self.options.host_errors {
                        cache.mark_failed(&input.id(), &err);
                    }
                    if request_err.is_none() {
                        request_err = Some(err);
                    }
                }
            }

            let mut wrapped = InternalWrappedEvent::new(event);
            if let Some(result) = request.operators.execute(&wrapped.internal) {
                wrapped.operator_result = Some(result);
                wrapped.results = make_result_events(
                    &wrapped,
                    &self.options.template_id,
                    &self.options.template_path,
                    &self.options.template_info,
                );
            }
            callback(wrapped);
        }
        request_err.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Executer for DnsExecutor {
    fn compile(&self) -> Result<()> {
        if self.resolver.get().is_some() {
            return Ok(());
        }
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        let _ = self.resolver.set(resolver);
        Ok(())
    }

    fn requests(&self) -> usize {
        self.requests.len()
    }

    async fn execute(&self, ctx: &ScanContext) -> Result<bool> {
        self.compile()?;
        let matched = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let sink = Arc::clone(&self.options.sink);
        let matched_cb = Arc::clone(&matched);
        let callback: EventCallback = Arc::new(move |event: InternalWrappedEvent| {
            if event.has_results() {
                matched_cb.store(true, std::sync::atomic::Ordering::SeqCst);
                for result in &event.results {
                    let _ = sink.write(result);
                }
            }
        });
        self.execute_with_callback(ctx, callback).await?;
        Ok(matched.load(std::sync::atomic::Ordering::SeqCst))
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
