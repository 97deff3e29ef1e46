//! Out-of-band interaction correlation
//!
//! Templates referencing `{{interactsh-url}}` markers get unique callback
//! URLs; the event produced by the probe is registered here as an immutable
//! snapshot together with its operators. Interactions arriving later are
//! pushed through a channel whose single consumer re-evaluates the
//! snapshot and emits results, so no event is ever mutated concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{set_str, InternalEvent, InternalWrappedEvent, OutputSink};
use crate::operators::{make_result_events, Operators};
use crate::template::TemplateInfo;

/// Template marker substituted with a generated callback URL.
pub const OOB_URL_MARKER: &str = "{{interactsh-url}}";

/// True when template data references out-of-band markers.
pub fn has_oob_markers(data: &str) -> bool {
    data.contains(OOB_URL_MARKER)
}

/// A callback observed on the out-of-band listener.
#[derive(Debug, Clone)]
pub struct Interaction {
    /// Correlation id, the subdomain label of the callback URL.
    pub id: String,
    /// Protocol of the interaction (`http`, `dns`).
    pub protocol: String,
    /// Raw request observed by the listener.
    pub request: String,
    /// Response served by the listener, if any.
    pub response: String,
    pub remote_addr: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything needed to re-evaluate a probe when its callback arrives.
pub struct PendingCorrelation {
    pub event: InternalEvent,
    pub operators: Operators,
    pub template_id: String,
    pub template_path: String,
    pub info: TemplateInfo,
    pub sink: Arc<dyn OutputSink>,
}

/// Registry of probes awaiting out-of-band confirmation.
pub struct OobRegistry {
    domain: String,
    pending: Mutex<HashMap<String, Arc<PendingCorrelation>>>,
    matched: Mutex<HashSet<String>>,
    tx: mpsc::UnboundedSender<Interaction>,
}

impl OobRegistry {
    /// Creates the registry and spawns its interaction consumer.
    pub fn start(domain: impl Into<String>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Interaction>();
        let registry = Arc::new(Self {
            domain: domain.into(),
            pending: Mutex::new(HashMap::new()),
            matched: Mutex::new(HashSet::new()),
            tx,
        });

        let consumer = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(interaction) = rx.recv().await {
                consumer.evaluate(interaction);
            }
        });
        registry
    }

    /// Generates a fresh correlation id and its callback URL.
    pub fn generate_url(&self) -> (String, String) {
        let id = {
            let uuid = uuid::Uuid::new_v4();
            format!("{:x}", uuid.as_u128())[..12].to_string()
        };
        let url = format!("{}.{}", id, self.domain);
        (id, url)
    }

    /// Registers an event snapshot against its callback URLs.
    pub fn register(&self, urls: &[String], correlation: PendingCorrelation) {
        let correlation = Arc::new(correlation);
        let mut pending = self.pending.lock().expect("oob pending poisoned");
        for url in urls {
            let id = url.split('.').next().unwrap_or(url).to_string();
            pending.insert(id, Arc::clone(&correlation));
        }
    }

    /// Queues an interaction for the consumer. Callable from any listener
    /// task.
    pub fn deliver(&self, interaction: Interaction) {
        let _ = self.tx.send(interaction);
    }

    /// True when any of the given callback URLs already produced a match.
    pub fn already_matched(&self, urls: &[String]) -> bool {
        let matched = self.matched.lock().expect("oob matched poisoned");
        urls.iter().any(|url| {
            let id = url.split('.').next().unwrap_or(url);
            matched.contains(id)
        })
    }

    /// Surfaces the generated callback URLs on an event so operators and
    /// downstream writers can see them.
    pub fn make_placeholders(&self, urls: &[String], event: &mut InternalEvent) {
        if let Some(url) = urls.first() {
            set_str(event, "interactsh-url", url.clone());
        }
    }

    fn evaluate(&self, interaction: Interaction) {
        let correlation = {
            let pending = self.pending.lock().expect("oob pending poisoned");
            pending.get(&interaction.id).cloned()
        };
        let Some(correlation) = correlation else {
            debug!("dropping uncorrelated interaction {}", interaction.id);
            return;
        };

        let mut event = correlation.event.clone();
        set_str(&mut event, "interactsh_protocol", interaction.protocol.clone());
        set_str(&mut event, "interactsh_request", interaction.request.clone());
        set_str(&mut event, "interactsh_response", interaction.response.clone());
        event.insert(
            "interactsh_ip".into(),
            Value::String(interaction.remote_addr.clone()),
        );

        let Some(result) = correlation.operators.execute(&event) else {
            return;
        };
        if !result.matched {
            return;
        }

        let mut wrapped = InternalWrappedEvent::new(event);
        wrapped.uses_interactsh = true;
        wrapped.operator_result = Some(result);
        wrapped.results = make_result_events(
            &wrapped,
            &correlation.template_id,
            &correlation.template_path,
            &correlation.info,
        );

        self.matched
            .lock()
            .expect("oob matched poisoned")
            .insert(interaction.id.clone());

        for result in &wrapped.results {
            if let Err(e) = correlation.sink.write(result) {
                debug!("could not write out-of-band result: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::operators::{Matcher, MatcherKind, Part};

    fn oob_operators() -> Operators {
        Operators {
            matchers: vec![Matcher {
                part: Part::OobProtocol,
                kind: MatcherKind::Word {
                    words: vec!["dns".into()],
                    case_insensitive: false,
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn interaction_match_emits_result() {
        let registry = OobRegistry::start("oob.example.com");
        let sink = Arc::new(MemorySink::new());
        let (id, url) = registry.generate_url();

        registry.register(
            &[url],
            PendingCorrelation {
                event: InternalEvent::new(),
                operators: oob_operators(),
                template_id: "blind-ssrf".into(),
                template_path: "blind-ssrf.yaml".into(),
                info: TemplateInfo::default(),
                sink: Arc::clone(&sink) as Arc<dyn OutputSink>,
            },
        );

        registry.deliver(Interaction {
            id: id.clone(),
            protocol: "dns".into(),
            request: "A query".into(),
            response: String::new(),
            remote_addr: "203.0.113.9".into(),
            timestamp: Utc::now(),
        });

        // The consumer runs on a spawned task; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sink.results().len(), 1);
        assert!(registry.already_matched(&[format!("{id}.oob.example.com")]));
    }

    #[tokio::test]
    async fn uncorrelated_interaction_is_dropped() {
        let registry = OobRegistry::start("oob.example.com");
        registry.deliver(Interaction {
            id: "unknown".into(),
            protocol: "http".into(),
            request: String::new(),
            response: String::new(),
            remote_addr: String::new(),
            timestamp: Utc::now(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!registry.already_matched(&["unknown.oob.example.com".into()]));
    }
}
