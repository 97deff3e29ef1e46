//! Workflow traversal
//!
//! A workflow is an ordered tree of templates where descent into children
//! is conditioned on the parent's matches: either unconditionally after
//! any match, or gated per named matcher. The returned `matched` is the
//! logical OR over every node visited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use crate::engine::{Executer, ExecutorOptions, ScanContext};
use crate::input::MetaInput;

/// A workflow tree: one or more root nodes executed in order.
#[derive(Clone, Default)]
pub struct Workflow {
    pub templates: Vec<WorkflowTemplate>,
}

/// One node of the tree: its executers plus either unconditional
/// subtemplates or named matchers gating descent.
#[derive(Clone, Default)]
pub struct WorkflowTemplate {
    pub executers: Vec<ProtocolExecuterPair>,
    /// Children executed after the parent produced at least one match.
    pub subtemplates: Vec<WorkflowTemplate>,
    /// Named matchers, each with its own subtree, executed only when the
    /// parent's operator result carries that name.
    pub matchers: Vec<WorkflowMatcher>,
}

/// An executer bound to the options it runs with.
#[derive(Clone)]
pub struct ProtocolExecuterPair {
    pub executer: Arc<dyn Executer>,
    pub options: Arc<ExecutorOptions>,
}

/// A named matcher gating a subtree.
#[derive(Clone)]
pub struct WorkflowMatcher {
    pub name: String,
    pub subtemplates: Vec<WorkflowTemplate>,
}

/// Executes a workflow against a target. Returns the OR of every node
/// visited along the traversed path.
pub async fn execute_workflow(input: &MetaInput, workflow: &Workflow) -> bool {
    let results = AtomicBool::new(false);
    for node in &workflow.templates {
        let ctx = ScanContext::new(input.clone());
        if run_workflow_step(node, &ctx, &results).await {
            results.store(true, Ordering::SeqCst);
        }
    }
    results.load(Ordering::SeqCst)
}

/// Executes one node. Side effects of its executers are fully flushed
/// before any descent. A node that errors records the error against the
/// target's error cache but never aborts siblings or parents.
fn run_workflow_step<'a>(
    node: &'a WorkflowTemplate,
    ctx: &'a ScanContext,
    results: &'a AtomicBool,
) -> BoxFuture<'a, bool> {
    async move {
        let mut first_matched = false;

        if node.matchers.is_empty() {
            for pair in &node.executers {
                if node.subtemplates.is_empty() {
                    // Terminal node: its own success is the contribution,
                    // written through the configured sinks.
                    match pair.executer.execute(ctx).await {
                        Ok(matched) => {
                            if matched {
                                first_matched = true;
                            }
                        }
                        Err(err) => record_error(pair, ctx, err),
                    }
                } else {
                    // Parent of unconditional subtemplates: capture its
                    // events without printing, descend on any match.
                    let child_ctx = ScanContext::new(ctx.input.clone());
                    if let Err(err) = pair.executer.execute_with_results(&child_ctx).await {
                        record_error(pair, ctx, err);
                    }
                    let matched = child_ctx.with_events(|events| {
                        events
                            .iter()
                            .any(|e| e.has_operator_result() && e.has_results())
                    });
                    if matched {
                        first_matched = true;
                    }
                }
            }
        } else {
            for pair in &node.executers {
                let child_ctx = ScanContext::new(ctx.input.clone());
                if let Err(err) = pair.executer.execute_with_results(&child_ctx).await {
                    record_error(pair, ctx, err);
                }
                for matcher in &node.matchers {
                    let satisfied = child_ctx.with_events(|events| {
                        events.iter().any(|event| {
                            event.operator_result.as_ref().is_some_and(|result| {
                                result.matches.contains_key(&matcher.name)
                                    || result.extracts.contains_key(&matcher.name)
                            })
                        })
                    });
                    if satisfied {
                        for subtemplate in &matcher.subtemplates {
                            if run_workflow_step(subtemplate, ctx, results).await {
                                results.store(true, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }
            return false;
        }

        if !node.subtemplates.is_empty() && first_matched {
            for subtemplate in &node.subtemplates {
                if run_workflow_step(subtemplate, ctx, results).await {
                    results.store(true, Ordering::SeqCst);
                }
            }
        }
        first_matched
    }
    .boxed()
}

fn record_error(pair: &ProtocolExecuterPair, ctx: &ScanContext, err: crate::error::ErrorX) {
    warn!(
        "workflow executer failed for {}: {err}",
        ctx.input.pretty_print()
    );
    if let Some(cache) = &pair.options.host_errors {
        cache.mark_failed(&ctx.input.id(), &err);
    }
    ctx.log_error(err);
}
