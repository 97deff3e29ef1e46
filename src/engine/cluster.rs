//! Template clustering
//!
//! Templates whose single request produces identical wire output are
//! collapsed into one cluster: the seed's request runs once per target and
//! every member's operators fan out over the shared response. Operators
//! may differ freely between members; only the request must be
//! structurally equal.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::engine::dns::DnsExecutor;
use crate::engine::http_executor::{HttpExecutor, HttpRequest};
use crate::engine::tls::TlsExecutor;
use crate::engine::{compile_executer, Executer, ExecutorOptions, ScanContext};
use crate::error::Result;
use crate::events::{set_str, InternalWrappedEvent, ResultEvent};
use crate::operators::{make_failure_event, make_result_events, Operators};
use crate::template::{Template, TemplateInfo};

/// Partitions templates into clusters of structurally equivalent single
/// requests. Unclusterable templates become singleton groups. The grouping
/// is greedy: each remaining template seeds a cluster that absorbs every
/// equivalent template after it.
pub fn cluster(list: Vec<Template>) -> Vec<Vec<Template>> {
    let mut http = Vec::new();
    let mut dns = Vec::new();
    let mut tls = Vec::new();
    let mut groups: Vec<Vec<Template>> = Vec::new();

    for template in list {
        // Flow and multiprotocol templates have dependent execution and
        // are never clustered.
        if template.flow.is_some() || template.multiprotocol {
            groups.push(vec![template]);
            continue;
        }
        if template.dns.len() == 1
            && template.http.is_empty()
            && template.tls.is_empty()
            && template.dns[0].is_clusterable()
        {
            dns.push(template);
        } else if template.http.len() == 1
            && template.dns.is_empty()
            && template.tls.is_empty()
            && template.http[0].is_clusterable()
        {
            http.push(template);
        } else if template.tls.len() == 1
            && template.http.is_empty()
            && template.dns.is_empty()
            && template.tls[0].is_clusterable()
        {
            tls.push(template);
        } else {
            groups.push(vec![template]);
        }
    }

    groups.extend(group_by(dns, |a, b| a.dns[0].can_cluster(&b.dns[0])));
    groups.extend(group_by(http, |a, b| a.http[0].can_cluster(&b.http[0])));
    groups.extend(group_by(tls, |a, b| a.tls[0].can_cluster(&b.tls[0])));
    groups
}

fn group_by(
    mut items: Vec<Template>,
    equivalent: impl Fn(&Template, &Template) -> bool,
) -> Vec<Vec<Template>> {
    let mut groups = Vec::new();
    while !items.is_empty() {
        let seed = items.remove(0);
        let mut group = vec![seed];
        let mut i = 0;
        while i < items.len() {
            if equivalent(&group[0], &items[i]) {
                group.push(items.remove(i));
            } else {
                i += 1;
            }
        }
        groups.push(group);
    }
    groups
}

/// Stable digest identifying a cluster: SHA-256 over the sorted member ids
/// joined by comma, deterministic across runs.
pub fn cluster_id(templates: &[Template]) -> String {
    let mut ids: Vec<&str> = templates.iter().map(|t| t.id.as_str()).collect();
    ids.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(ids.join(",").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Replaces clusterable groups in a template list with single cluster
/// templates. Returns the new list and how many templates were absorbed
/// into clusters.
pub fn cluster_templates(
    list: Vec<Template>,
    options: &ExecutorOptions,
) -> (Vec<Template>, usize) {
    if options.config.disable_clustering {
        return (list, 0);
    }

    let mut cluster_count = 0;
    let mut out = Vec::new();
    for group in cluster(list) {
        if group.len() > 1 {
            let id = format!("cluster-{}", cluster_id(&group));
            debug!("clustered {} templates into {id}", group.len());
            cluster_count += group.len();
            let executer_options =
                Arc::new(options.for_template(&id, &id, group[0].info.clone()));
            let executer: Arc<dyn Executer> =
                Arc::new(ClusterExecutor::new(&group, executer_options));
            let seed = &group[0];
            out.push(Template {
                id,
                path: String::new(),
                info: seed.info.clone(),
                http: seed.http.clone(),
                dns: seed.dns.clone(),
                tls: seed.tls.clone(),
                flow: None,
                multiprotocol: false,
                executer: Some(executer),
            });
        } else {
            out.extend(group.into_iter().map(|mut template| {
                if template.executer.is_none() {
                    template.executer = compile_executer(&template, options);
                }
                template
            }));
        }
    }
    (out, cluster_count)
}

/// Per-member fan-out term of a cluster.
struct ClusteredOperator {
    template_id: String,
    template_path: String,
    template_info: TemplateInfo,
    operators: Operators,
}

/// Executes a cluster: the representative request once per target, then
/// every member's operators over each emitted event, rewriting the event's
/// template identity per member.
pub struct ClusterExecutor {
    inner: Arc<dyn Executer>,
    operators: Vec<ClusteredOperator>,
    options: Arc<ExecutorOptions>,
}

impl ClusterExecutor {
    pub fn new(templates: &[Template], options: Arc<ExecutorOptions>) -> Self {
        let seed = &templates[0];

        // The representative request runs with operators stripped; members
        // evaluate their own over the shared response.
        let inner: Arc<dyn Executer> = if seed.http.len() == 1 {
            let mut request: HttpRequest = (*seed.http[0]).clone();
            request.operators = Operators::default();
            Arc::new(HttpExecutor::new(vec![Arc::new(request)], Arc::clone(&options)))
        } else if seed.dns.len() == 1 {
            let mut request = (*seed.dns[0]).clone();
            request.operators = Operators::default();
            Arc::new(DnsExecutor::new(vec![Arc::new(request)], Arc::clone(&options)))
        } else {
            let mut request = (*seed.tls[0]).clone();
            request.operators = Operators::default();
            Arc::new(TlsExecutor::new(vec![Arc::new(request)], Arc::clone(&options)))
        };

        let operators = templates
            .iter()
            .filter_map(|template| {
                let operators = if template.http.len() == 1 {
                    template.http[0].operators.clone()
                } else if template.dns.len() == 1 {
                    template.dns[0].operators.clone()
                } else if template.tls.len() == 1 {
                    template.tls[0].operators.clone()
                } else {
                    return None;
                };
                Some(ClusteredOperator {
                    template_id: template.id.clone(),
                    template_path: template.path.clone(),
                    template_info: template.info.clone(),
                    operators,
                })
            })
            .collect();

        Self {
            inner,
            operators,
            options,
        }
    }

    /// Fans one emitted event out over every member, producing the
    /// member-identified events.
    fn fan_out(&self, event: &InternalWrappedEvent) -> Vec<InternalWrappedEvent> {
        let mut out = Vec::new();
        for member in &self.operators {
            let mut internal = event.internal.clone();
            set_str(&mut internal, "template-id", member.template_id.clone());
            set_str(&mut internal, "template-path", member.template_path.clone());
            internal.insert(
                "template-info".into(),
                serde_json::to_value(&member.template_info).unwrap_or(Value::Null),
            );

            let mut member_event = InternalWrappedEvent::new(internal);
            match member.operators.execute(&member_event.internal) {
                Some(result) if result.matched => {
                    member_event.operator_result = Some(result);
                    member_event.results = make_result_events(
                        &member_event,
                        &member.template_id,
                        &member.template_path,
                        &member.template_info,
                    );
                    out.push(member_event);
                }
                other => {
                    member_event.operator_result = other;
                    out.push(member_event);
                }
            }
        }
        out
    }
}

#[async_trait]
impl Executer for ClusterExecutor {
    fn compile(&self) -> Result<()> {
        self.inner.compile()
    }

    fn requests(&self) -> usize {
        self.inner.requests()
    }

    async fn execute(&self, ctx: &ScanContext) -> Result<bool> {
        let child = ScanContext::new(ctx.input.clone());
        let inner_result = self.inner.execute_with_results(&child).await;

        let mut matched = false;
        child.with_events(|events| {
            for event in events {
                for member_event in self.fan_out(event) {
                    if member_event.has_results() {
                        matched = true;
                        for result in &member_event.results {
                            if let Err(e) = self.options.sink.write(result) {
                                warn!("could not write cluster result: {e}");
                            }
                        }
                    } else if self.options.config.matcher_status {
                        let member_id =
                            crate::events::get_str(&member_event.internal, "template-id")
                                .to_string();
                        let member_path =
                            crate::events::get_str(&member_event.internal, "template-path")
                                .to_string();
                        let failure = make_failure_event(
                            &member_event,
                            &member_id,
                            &member_path,
                            &self.options.template_info,
                        );
                        if let Err(e) = self.options.sink.write_failure(&failure) {
                            warn!("could not write cluster failure event: {e}");
                        }
                    }
                }
            }
        });

        if let Err(err) = inner_result {
            if let Some(cache) = &self.options.host_errors {
                cache.mark_failed(&ctx.input.id(), &err);
            }
            if !matched {
                return Err(err);
            }
        }
        Ok(matched)
    }

    async fn execute_with_results(&self, ctx: &ScanContext) -> Result<Vec<ResultEvent>> {
        let child = ScanContext::new(ctx.input.clone());
        let inner_result = self.inner.execute_with_results(&child).await;

        child.with_events(|events| {
            for event in events {
                for member_event in self.fan_out(event) {
                    if member_event.has_results() {
                        ctx.log_event(member_event);
                    }
                }
            }
        });

        if let Err(err) = inner_result {
            ctx.log_error(err.clone());
            if let Some(cache) = &self.options.host_errors {
                cache.mark_failed(&ctx.input.id(), &err);
            }
            return Err(err);
        }
        Ok(ctx.generate_result())
    }
}
