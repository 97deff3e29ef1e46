//! Common test utilities

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use talos::engine::workflow::{ProtocolExecuterPair, WorkflowTemplate};
use talos::engine::{Executer, ExecutorOptions, ScanContext};
use talos::events::{InternalWrappedEvent, ResultEvent};
use talos::input::MetaInput;
use talos::operators::OperatorResult;
use talos::template::TemplateInfo;
use talos::{EngineConfig, Result};

/// Engine options for tests: no rate limiting, no host-error suppression.
pub fn test_options() -> Arc<ExecutorOptions> {
    let config = EngineConfig {
        rate_limit: 0,
        max_host_errors: 0,
        retries: 0,
        timeout_secs: 5,
        ..Default::default()
    };
    Arc::new(ExecutorOptions::new(Arc::new(config)))
}

/// One scripted event emitted by a [`MockExecuter`].
#[derive(Clone, Default)]
pub struct MockOutput {
    pub operator_result: Option<OperatorResult>,
    pub result_count: usize,
}

impl MockOutput {
    /// An operator result carrying one materialized result.
    pub fn with_result() -> Self {
        Self {
            operator_result: Some(OperatorResult {
                matched: true,
                ..Default::default()
            }),
            result_count: 1,
        }
    }

    /// An operator result with a named match and no materialized results.
    pub fn with_named_match(name: &str) -> Self {
        let mut matches = HashMap::new();
        matches.insert(name.to_string(), Vec::new());
        Self {
            operator_result: Some(OperatorResult {
                matched: true,
                matches,
                ..Default::default()
            }),
            result_count: 0,
        }
    }
}

/// Scripted executer recording the inputs it was invoked with.
#[derive(Default)]
pub struct MockExecuter {
    pub result: bool,
    pub outputs: Vec<MockOutput>,
    pub seen_inputs: Arc<Mutex<Vec<String>>>,
}

impl MockExecuter {
    pub fn matching(result: bool) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn with_outputs(result: bool, outputs: Vec<MockOutput>) -> Self {
        Self {
            result,
            outputs,
            ..Default::default()
        }
    }

    pub fn inputs(&self) -> Vec<String> {
        self.seen_inputs.lock().expect("inputs poisoned").clone()
    }

    fn record(&self, input: &MetaInput) {
        self.seen_inputs
            .lock()
            .expect("inputs poisoned")
            .push(input.input.clone());
    }

    fn make_event(&self, output: &MockOutput) -> InternalWrappedEvent {
        let mut event = InternalWrappedEvent::default();
        event.operator_result = output.operator_result.clone();
        for _ in 0..output.result_count {
            event.results.push(ResultEvent {
                template_id: "mock".into(),
                template_path: "mock.yaml".into(),
                info: TemplateInfo::default(),
                matcher_name: None,
                extracted_results: Vec::new(),
                matched_at: String::new(),
                host: String::new(),
                ip: String::new(),
                request: String::new(),
                response: String::new(),
                curl_command: String::new(),
                timestamp: chrono::Utc::now(),
                matcher_status: true,
            });
        }
        event
    }
}

#[async_trait]
impl Executer for MockExecuter {
    fn compile(&self) -> Result<()> {
        Ok(())
    }

    fn requests(&self) -> usize {
        1
    }

    async fn execute(&self, ctx: &ScanContext) -> Result<bool> {
        self.record(&ctx.input);
        Ok(self.result)
    }

    async fn execute_with_results(&self, ctx: &ScanContext) -> Result<Vec<ResultEvent>> {
        self.record(&ctx.input);
        for output in &self.outputs {
            ctx.log_event(self.make_event(output));
        }
        Ok(ctx.generate_result())
    }
}

/// Wraps an executer into a terminal workflow node.
pub fn node(executer: Arc<MockExecuter>) -> WorkflowTemplate {
    WorkflowTemplate {
        executers: vec![ProtocolExecuterPair {
            executer,
            options: test_options(),
        }],
        subtemplates: Vec::new(),
        matchers: Vec::new(),
    }
}
