//! TLS protocol executor
//!
//! Sibling of the HTTP executor satisfying the common contract: performs a
//! TLS handshake against the target address and runs operators over the
//! handshake outcome. TLS requests cluster only on exact request equality.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::engine::generator::{interpolate, target_variables};
use crate::engine::{Executer, ExecutorOptions, ScanContext};
use crate::error::{ErrorClass, ErrorX, Result};
use crate::events::{set_str, EventCallback, InternalEvent, InternalWrappedEvent, ResultEvent};
use crate::operators::{make_result_events, Operators};

/// One TLS request of a template: the address to handshake with.
#[derive(Debug, Clone)]
pub struct TlsRequest {
    /// Address pattern, typically `{{Host}}:{{Port}}`.
    pub address: String,
    /// Server name sent for SNI; defaults to the target hostname.
    pub server_name: Option<String>,
    pub operators: Operators,
}

impl TlsRequest {
    /// TLS clustering requires exact request equality; operators may
    /// differ freely.
    pub fn can_cluster(&self, other: &TlsRequest) -> bool {
        self.address == other.address && self.server_name == other.server_name
    }

    pub fn is_clusterable(&self) -> bool {
        true
    }
}

/// Executor for the TLS requests of one template.
pub struct TlsExecutor {
    requests: Vec<Arc<TlsRequest>>,
    options: Arc<ExecutorOptions>,
}

impl TlsExecutor {
    pub fn new(requests: Vec<Arc<TlsRequest>>, options: Arc<ExecutorOptions>) -> Self {
        Self { requests, options }
    }

    async fn execute_with_callback(&self, ctx: &ScanContext, callback: EventCallback) -> Result<()> {
        let input = &ctx.input;
        let variables = target_variables(input)?;
        let deadline = Duration::from_secs(self.options.config.timeout_secs);

        let mut request_err: Option<ErrorX> = None;
        for request in &self.requests {
            self.options.rate_limiter.take().await;

            let address = interpolate(&request.address, &variables);
            let server_name = request
                .server_name
                .clone()
                .unwrap_or_else(|| variables.get("Host").cloned().unwrap_or_default());

            let mut event = InternalEvent::new();
            set_str(&mut event, "input", input.input.clone());
            set_str(&mut event, "host", server_name.clone());
            set_str(&mut event, "matched", address.clone());
            event.insert("port".into(), Value::String(address.split(':').next_back().unwrap_or_default().to_string()));
            set_str(&mut event, "template-id", self.options.template_id.clone());
            set_str(&mut event, "template-path", self.options.template_path.clone());

            // Handshakes are idempotent per address, so concurrent probes
            // against the same endpoint share one through the memoizer.
            let memo_key = format!("tlsHandshake:{address}:{server_name}");
            let outcome = self
                .options
                .memoizer
                .memoize(&memo_key, || self.handshake(&address, &server_name, deadline))
                .await;
            match outcome {
                Ok(cert_digest) => {
                    event.insert("tls_connected".into(), Value::Bool(true));
                    set_str(&mut event, "certificate_md5", cert_digest.unwrap_or_default());
                }
                Err(err) => {
                    debug!(
                        template = %self.options.template_id,
                        "TLS handshake with {address} failed: {err}"
                    );
                    event.insert("tls_connected".into(), Value::Bool(false));
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

    /// Connects and handshakes, returning the MD5 of the peer certificate
    /// when the server presented one.
    async fn handshake(
        &self,
        address: &str,
        server_name: &str,
        deadline: Duration,
    ) -> Result<Option<String>> {
        let stream = timeout(deadline, TcpStream::connect(address))
            .await
            .map_err(|_| {
                ErrorX::with_class(ErrorClass::Deadline, format!("connect to {address} timed out"))
            })??;

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| ErrorX::with_class(ErrorClass::NetworkTemporary, e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tls_stream = timeout(deadline, connector.connect(server_name, stream))
            .await
            .map_err(|_| {
                ErrorX::with_class(
                    ErrorClass::Deadline,
                    format!("TLS handshake with {address} timed out"),
                )
            })?
            .map_err(|e| ErrorX::with_class(ErrorClass::NetworkTemporary, e.to_string()))?;

        let digest = tls_stream
            .get_ref()
            .peer_certificate()
            .ok()
            .flatten()
            .and_then(|cert| cert.to_der().ok())
            .map(|der| {
                let mut hasher = Md5::new();
                hasher.update(&der);
                format!("{:x}", hasher.finalize())
            });
        Ok(digest)
    }
}

#[async_trait]
impl Executer for TlsExecutor {
    fn compile(&self) -> Result<()> {
        Ok(())
    }

    fn requests(&self) -> usize {
        self.requests.len()
    }

    async fn execute(&self, ctx: &ScanContext) -> Result<bool> {
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
