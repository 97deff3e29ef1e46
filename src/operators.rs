//! Matcher and extractor operators
//!
//! Operators evaluate a response DSL map and produce an [`OperatorResult`]:
//! named match hits, extracted values, and dynamic values fed back into
//! later request iterations.

use std::collections::HashMap;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::events::{get_str, InternalEvent, InternalWrappedEvent, ResultEvent};
use crate::template::TemplateInfo;

/// How multiple matchers combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Condition {
    #[default]
    And,
    Or,
}

/// Which event field a matcher or extractor reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Part {
    #[default]
    Body,
    Header,
    /// The full response: status line, headers, and body.
    All,
    /// Out-of-band interaction protocol field.
    OobProtocol,
    /// Out-of-band interaction request field.
    OobRequest,
}

impl Part {
    fn key(&self) -> &'static str {
        match self {
            Part::Body => "body",
            Part::Header => "all_headers",
            Part::All => "response",
            Part::OobProtocol => "interactsh_protocol",
            Part::OobRequest => "interactsh_request",
        }
    }

    /// True for parts resolved only after an out-of-band callback.
    pub fn is_oob(&self) -> bool {
        matches!(self, Part::OobProtocol | Part::OobRequest)
    }
}

/// A single response matcher.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    /// Optional name; named hits key workflow matcher gating.
    pub name: Option<String>,
    pub part: Part,
    pub kind: MatcherKind,
    /// Inverts the outcome.
    pub negative: bool,
    /// How the words/regexes within this matcher combine.
    pub condition: Condition,
}

#[derive(Debug, Clone, Default)]
pub enum MatcherKind {
    #[default]
    None,
    Word {
        words: Vec<String>,
        case_insensitive: bool,
    },
    Regex(Vec<String>),
    Status(Vec<u16>),
    Size(Vec<usize>),
}

impl Matcher {
    /// Evaluates the matcher, returning matched snippets on success.
    fn evaluate(&self, event: &InternalEvent) -> Option<Vec<String>> {
        let outcome = match &self.kind {
            MatcherKind::None => None,
            MatcherKind::Word {
                words,
                case_insensitive,
            } => {
                let corpus = get_str(event, self.part.key());
                let corpus = if *case_insensitive {
                    corpus.to_lowercase()
                } else {
                    corpus.to_string()
                };
                let mut hits = Vec::new();
                for word in words {
                    let needle = if *case_insensitive {
                        word.to_lowercase()
                    } else {
                        word.clone()
                    };
                    if corpus.contains(&needle) {
                        hits.push(word.clone());
                        if self.condition == Condition::Or {
                            break;
                        }
                    } else if self.condition == Condition::And {
                        hits.clear();
                        break;
                    }
                }
                (!hits.is_empty()).then_some(hits)
            }
            MatcherKind::Regex(patterns) => {
                let corpus = get_str(event, self.part.key());
                let mut hits = Vec::new();
                for pattern in patterns {
                    let Ok(re) = Regex::new(pattern) else {
                        debug!("invalid matcher regex: {pattern}");
                        continue;
                    };
                    match re.find(corpus) {
                        Some(m) => {
                            hits.push(m.as_str().to_string());
                            if self.condition == Condition::Or {
                                break;
                            }
                        }
                        None if self.condition == Condition::And => {
                            hits.clear();
                            break;
                        }
                        None => {}
                    }
                }
                (!hits.is_empty()).then_some(hits)
            }
            MatcherKind::Status(statuses) => {
                let status = event.get("status_code").and_then(Value::as_u64)? as u16;
                statuses
                    .contains(&status)
                    .then(|| vec![status.to_string()])
            }
            MatcherKind::Size(sizes) => {
                let len = get_str(event, self.part.key()).len();
                sizes.contains(&len).then(|| vec![len.to_string()])
            }
        };
        if self.negative {
            match outcome {
                Some(_) => None,
                None => Some(Vec::new()),
            }
        } else {
            outcome
        }
    }
}

/// A value extractor over a response.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    pub name: Option<String>,
    pub part: Part,
    pub kind: ExtractorKind,
    /// Internal extractions feed `dynamic_values` instead of results.
    pub internal: bool,
}

#[derive(Debug, Clone, Default)]
pub enum ExtractorKind {
    #[default]
    None,
    Regex {
        patterns: Vec<String>,
        group: usize,
    },
    /// Extracts event map values by key (headers are surfaced lowercased
    /// with dashes replaced by underscores).
    Kval(Vec<String>),
}

impl Extractor {
    fn extract(&self, event: &InternalEvent) -> Vec<String> {
        match &self.kind {
            ExtractorKind::None => Vec::new(),
            ExtractorKind::Regex { patterns, group } => {
                let corpus = get_str(event, self.part.key());
                let mut values = Vec::new();
                for pattern in patterns {
                    let Ok(re) = Regex::new(pattern) else {
                        debug!("invalid extractor regex: {pattern}");
                        continue;
                    };
                    for captures in re.captures_iter(corpus) {
                        if let Some(m) = captures.get(*group) {
                            values.push(m.as_str().to_string());
                        }
                    }
                }
                values
            }
            ExtractorKind::Kval(keys) => keys
                .iter()
                .filter_map(|k| event.get(k).and_then(Value::as_str).map(String::from))
                .collect(),
        }
    }
}

/// Result of running operators over an event.
#[derive(Debug, Clone, Default)]
pub struct OperatorResult {
    pub matched: bool,
    /// Named matcher hits, keyed by matcher name.
    pub matches: HashMap<String, Vec<String>>,
    /// Named extractions, keyed by extractor name.
    pub extracts: HashMap<String, Vec<String>>,
    /// Extractions flagged internal, fed into later iterations.
    pub dynamic_values: HashMap<String, Vec<String>>,
    /// Payload substitutions that produced the match.
    pub payload_values: HashMap<String, String>,
}

impl OperatorResult {
    /// All extracted values flattened for result display.
    pub fn extracted_results(&self) -> Vec<String> {
        let mut all: Vec<String> = self.extracts.values().flatten().cloned().collect();
        all.sort();
        all.dedup();
        all
    }
}

/// The matcher/extractor block of one template request.
#[derive(Debug, Clone, Default)]
pub struct Operators {
    pub matchers: Vec<Matcher>,
    pub extractors: Vec<Extractor>,
    pub condition: Condition,
}

impl Operators {
    /// True when no matcher or extractor is defined.
    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty() && self.extractors.is_empty()
    }

    /// True when any matcher reads an out-of-band part, requiring
    /// asynchronous re-evaluation after callbacks arrive.
    pub fn has_oob_matchers(&self) -> bool {
        self.matchers.iter().any(|m| m.part.is_oob())
    }

    /// Runs matchers and extractors over the event. Returns `Some` when
    /// the operator block matched or produced extractions.
    pub fn execute(&self, event: &InternalEvent) -> Option<OperatorResult> {
        let mut result = OperatorResult::default();

        for extractor in &self.extractors {
            let values = extractor.extract(event);
            if values.is_empty() {
                continue;
            }
            let name = extractor.name.clone().unwrap_or_else(|| "extracted".into());
            if extractor.internal {
                result.dynamic_values.entry(name).or_default().extend(values);
            } else {
                result.extracts.entry(name).or_default().extend(values);
            }
        }

        let mut matcher_outcomes = Vec::with_capacity(self.matchers.len());
        for matcher in &self.matchers {
            match matcher.evaluate(event) {
                Some(hits) => {
                    matcher_outcomes.push(true);
                    if let Some(name) = &matcher.name {
                        result.matches.insert(name.clone(), hits);
                    }
                }
                None => matcher_outcomes.push(false),
            }
        }

        result.matched = if self.matchers.is_empty() {
            false
        } else {
            match self.condition {
                Condition::And => matcher_outcomes.iter().all(|m| *m),
                Condition::Or => matcher_outcomes.iter().any(|m| *m),
            }
        };
        // An AND failure discards individual named hits.
        if !result.matched && self.condition == Condition::And {
            result.matches.clear();
        }

        if result.matched || !result.extracts.is_empty() || !result.dynamic_values.is_empty() {
            Some(result)
        } else {
            None
        }
    }
}

/// Materializes user-visible result events from a wrapped event carrying an
/// operator result: one per matched named matcher, or a single unnamed one.
pub fn make_result_events(
    event: &InternalWrappedEvent,
    template_id: &str,
    template_path: &str,
    info: &TemplateInfo,
) -> Vec<ResultEvent> {
    let Some(operator_result) = &event.operator_result else {
        return Vec::new();
    };
    if !operator_result.matched && operator_result.extracts.is_empty() {
        return Vec::new();
    }

    let base = |matcher_name: Option<String>| ResultEvent {
        template_id: template_id.to_string(),
        template_path: template_path.to_string(),
        info: info.clone(),
        matcher_name,
        extracted_results: operator_result.extracted_results(),
        matched_at: get_str(&event.internal, "matched").to_string(),
        host: get_str(&event.internal, "host").to_string(),
        ip: get_str(&event.internal, "ip").to_string(),
        request: get_str(&event.internal, "request").to_string(),
        response: get_str(&event.internal, "response").to_string(),
        curl_command: get_str(&event.internal, "curl-command").to_string(),
        timestamp: Utc::now(),
        matcher_status: true,
    };

    if operator_result.matched && !operator_result.matches.is_empty() {
        let mut names: Vec<&String> = operator_result.matches.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| base(Some(name.clone())))
            .collect()
    } else {
        vec![base(None)]
    }
}

/// Builds an explicit failure event for matcher-status reporting.
pub fn make_failure_event(
    event: &InternalWrappedEvent,
    template_id: &str,
    template_path: &str,
    info: &TemplateInfo,
) -> ResultEvent {
    ResultEvent {
        template_id: template_id.to_string(),
        template_path: template_path.to_string(),
        info: info.clone(),
        matcher_name: None,
        extracted_results: Vec::new(),
        matched_at: get_str(&event.internal, "matched").to_string(),
        host: get_str(&event.internal, "host").to_string(),
        ip: get_str(&event.internal, "ip").to_string(),
        request: String::new(),
        response: String::new(),
        curl_command: String::new(),
        timestamp: Utc::now(),
        matcher_status: false,
    }
}
