//! Request generation
//!
//! A generator walks the ordered payload permutations of one template
//! request as a lazy finite sequence, and materializes each permutation
//! into a concrete request by substituting variables. Generators are owned
//! by their scheduling site and never shared across tasks; modes needing
//! multiple readers construct multiple generators.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use url::Url;

use crate::engine::http_executor::HttpRequest;
use crate::error::{ErrorX, Result};
use crate::http::client::RequestSpec;
use crate::input::MetaInput;
use crate::oob::{OobRegistry, OOB_URL_MARKER};

/// How payload sets combine across permutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttackType {
    /// Cartesian product of every payload set.
    #[default]
    ClusterBomb,
    /// Lockstep iteration, bounded by the shortest set.
    Pitchfork,
}

/// One unit of template data for an iteration: a path or a raw request
/// block.
#[derive(Debug, Clone)]
pub struct TemplateData {
    pub data: String,
    pub is_raw: bool,
}

/// Lazy sequence of `(template_data, payload_map)` pairs.
pub struct RequestGenerator {
    items: Vec<TemplateData>,
    payload_keys: Vec<String>,
    payload_sets: Vec<Vec<String>>,
    attack: AttackType,
    combos_per_item: usize,
    consumed: usize,
}

impl RequestGenerator {
    pub fn new(request: &HttpRequest) -> Self {
        let mut items: Vec<TemplateData> = request
            .paths
            .iter()
            .map(|p| TemplateData {
                data: p.clone(),
                is_raw: false,
            })
            .collect();
        items.extend(request.raw.iter().map(|r| TemplateData {
            data: r.clone(),
            is_raw: true,
        }));

        // Sorted names keep permutation order deterministic across runs.
        let mut payload_keys: Vec<String> = request.payloads.keys().cloned().collect();
        payload_keys.sort();
        let payload_sets: Vec<Vec<String>> = payload_keys
            .iter()
            .map(|k| request.payloads[k].clone())
            .collect();

        let combos_per_item = match request.attack {
            _ if payload_sets.is_empty() => 1,
            AttackType::ClusterBomb => payload_sets.iter().map(Vec::len).product::<usize>().max(1),
            AttackType::Pitchfork => payload_sets.iter().map(Vec::len).min().unwrap_or(1),
        };

        Self {
            items,
            payload_keys,
            payload_sets,
            attack: request.attack,
            combos_per_item,
            consumed: 0,
        }
    }

    /// Combinatorial count of values this generator can produce.
    pub fn total(&self) -> usize {
        self.items.len() * self.combos_per_item
    }

    /// Index of the template-data item the last produced value belongs to,
    /// i.e. the request index within the template's sequence.
    pub fn current_index(&self) -> usize {
        if self.consumed == 0 {
            0
        } else {
            (self.consumed - 1) / self.combos_per_item.max(1)
        }
    }

    /// Produces the next `(template_data, payloads)` pair, `None` on
    /// exhaustion.
    pub fn next_value(&mut self) -> Option<(TemplateData, HashMap<String, String>)> {
        if self.consumed >= self.total() {
            return None;
        }
        let item_idx = self.consumed / self.combos_per_item;
        let combo_idx = self.consumed % self.combos_per_item;
        self.consumed += 1;

        let mut payloads = HashMap::new();
        if !self.payload_sets.is_empty() {
            match self.attack {
                AttackType::ClusterBomb => {
                    // Mixed-radix decode of the flattened combination index.
                    let mut rem = combo_idx;
                    for (key, set) in self.payload_keys.iter().zip(&self.payload_sets).rev() {
                        if set.is_empty() {
                            continue;
                        }
                        payloads.insert(key.clone(), set[rem % set.len()].clone());
                        rem /= set.len();
                    }
                }
                AttackType::Pitchfork => {
                    for (key, set) in self.payload_keys.iter().zip(&self.payload_sets) {
                        payloads.insert(key.clone(), set[combo_idx].clone());
                    }
                }
            }
        }
        Some((self.items[item_idx].clone(), payloads))
    }
}

/// A raw request parsed out of an unsafe template block.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub data: String,
    pub method: String,
    pub path: String,
}

/// A materialized probe, consumed by exactly one transport call.
#[derive(Debug)]
pub struct GeneratedRequest {
    /// Structured form, absent for raw requests.
    pub spec: Option<RequestSpec>,
    /// Raw byte form for unsafe requests.
    pub raw: Option<RawRequest>,
    /// Name to value map accumulated from prior extractions plus the
    /// variables resolved for this iteration.
    pub dynamic_values: HashMap<String, String>,
    /// Per-request payload substitutions.
    pub meta: HashMap<String, String>,
    /// Out-of-band callback URLs generated into this request.
    pub interactsh_urls: Vec<String>,
    /// The template request this probe was generated from.
    pub source: Arc<HttpRequest>,
    /// Pipelined client to send through, set by turbo mode.
    pub pipeline_client: Option<Arc<crate::http::pipeline::PipelineClient>>,
}

impl GeneratedRequest {
    /// The URL this request targets.
    pub fn url(&self) -> String {
        if let Some(spec) = &self.spec {
            return spec.url.clone();
        }
        self.raw
            .as_ref()
            .map(|r| r.path.clone())
            .unwrap_or_default()
    }
}

/// Materializes a concrete request for one generator value, substituting
/// payloads, dynamic values, constants, and target variables. Fails with
/// class `template-logic` when a required variable stays unresolved,
/// signalling the executor to terminate iteration for this target.
pub fn make_request(
    request: &Arc<HttpRequest>,
    target: &MetaInput,
    data: &TemplateData,
    payloads: &HashMap<String, String>,
    dynamic_values: &HashMap<String, String>,
    constants: &HashMap<String, String>,
    oob: Option<&OobRegistry>,
) -> Result<GeneratedRequest> {
    let mut variables = target_variables(target)?;
    for (k, v) in constants {
        variables.insert(k.clone(), v.clone());
    }
    for (k, v) in payloads {
        variables.insert(k.clone(), interpolate(v, &variables));
    }
    for (k, v) in dynamic_values {
        variables.insert(k.clone(), v.clone());
    }

    let mut interactsh_urls = Vec::new();
    let substitute = |input: &str, urls: &mut Vec<String>| -> String {
        let mut out = interpolate(input, &variables);
        if let Some(registry) = oob {
            while out.contains(OOB_URL_MARKER) {
                let (_, url) = registry.generate_url();
                out = out.replacen(OOB_URL_MARKER, &url, 1);
                urls.push(url);
            }
        }
        out
    };

    let meta: HashMap<String, String> = payloads
        .iter()
        .map(|(k, v)| (k.clone(), interpolate(v, &variables)))
        .collect();

    if data.is_raw {
        let raw_data = substitute(&data.data, &mut interactsh_urls);
        if !request.skip_variables_check {
            check_resolved(&raw_data)?;
        }
        let raw = parse_raw_request(&raw_data);
        return Ok(GeneratedRequest {
            spec: None,
            raw: Some(raw),
            dynamic_values: variables,
            meta,
            interactsh_urls,
            source: Arc::clone(request),
            pipeline_client: None,
        });
    }

    let url_str = substitute(&data.data, &mut interactsh_urls);
    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, &mut interactsh_urls)))
        .collect();
    let body = request
        .body
        .as_ref()
        .map(|b| substitute(b, &mut interactsh_urls));

    if !request.skip_variables_check {
        check_resolved(&url_str)?;
        for (_, value) in &headers {
            check_resolved(value)?;
        }
        if let Some(body) = &body {
            check_resolved(body)?;
        }
    }

    // A definite Content-Length for bodies that are not chunked-encoded on
    // methods that carry one.
    let chunked = headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));
    if let Some(body) = &body {
        let bodyless = request.method.eq_ignore_ascii_case("GET")
            || request.method.eq_ignore_ascii_case("HEAD");
        if !chunked && !bodyless {
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
            headers.push(("Content-Length".to_string(), body.len().to_string()));
        }
    }

    Ok(GeneratedRequest {
        spec: Some(RequestSpec {
            method: request.method.clone(),
            url: url_str,
            headers,
            body,
        }),
        raw: None,
        dynamic_values: variables,
        meta,
        interactsh_urls,
        source: Arc::clone(request),
        pipeline_client: None,
    })
}

/// Replaces `{{name}}` placeholders from the variable map.
pub fn interpolate(input: &str, variables: &HashMap<String, String>) -> String {
    let mut out = input.to_string();
    for (name, value) in variables {
        let placeholder = format!("{{{{{name}}}}}");
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, value);
        }
    }
    out
}

/// Variables derived from the target itself.
pub fn target_variables(target: &MetaInput) -> Result<HashMap<String, String>> {
    let url = target.url()?;
    let host = url.host_str().unwrap_or_default().to_string();
    let scheme = url.scheme().to_string();
    let port = url
        .port()
        .map(|p| p.to_string())
        .unwrap_or_else(|| if scheme == "https" { "443".into() } else { "80".into() });
    let hostname = match url.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.clone(),
    };
    let root_url = match url.port() {
        Some(p) => format!("{scheme}://{host}:{p}"),
        None => format!("{scheme}://{host}"),
    };

    let mut variables = HashMap::new();
    variables.insert(
        "BaseURL".into(),
        target.target().trim_end_matches('/').to_string(),
    );
    variables.insert("RootURL".into(), root_url);
    variables.insert("Hostname".into(), hostname);
    variables.insert("Host".into(), host);
    variables.insert("Port".into(), port);
    variables.insert("Path".into(), url.path().trim_end_matches('/').to_string());
    variables.insert("Scheme".into(), scheme);
    if !target.custom_ip.is_empty() {
        variables.insert("ip".into(), target.custom_ip.clone());
    }
    Ok(variables)
}

fn check_resolved(data: &str) -> Result<()> {
    static PLACEHOLDER: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{[^{}]*\}\}").expect("static regex"));
    if re.is_match(data) {
        return Err(ErrorX::unresolved_variables());
    }
    Ok(())
}

/// Parses an unsafe raw block into wire bytes plus its method and path.
/// Bare newlines are normalized to CRLF.
fn parse_raw_request(data: &str) -> RawRequest {
    let normalized = data.replace("\r\n", "\n").replace('\n', "\r\n");
    let first_line = normalized.lines().next().unwrap_or_default();
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("GET").to_string();
    let path = parts.next().unwrap_or("/").to_string();
    RawRequest {
        data: normalized,
        method,
        path,
    }
}

/// Checks a target URL string for validity after substitution.
pub fn parse_target_url(url: &str) -> Result<Url> {
    Ok(Url::parse(url)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::http_executor::HttpRequest;

    fn request_with_payloads(paths: Vec<&str>, payloads: Vec<(&str, Vec<&str>)>) -> HttpRequest {
        HttpRequest {
            paths: paths.into_iter().map(String::from).collect(),
            payloads: payloads
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn total_matches_consumed_values() {
        let request = request_with_payloads(
            vec!["{{BaseURL}}/a", "{{BaseURL}}/b"],
            vec![("user", vec!["admin", "guest"]), ("pass", vec!["x", "y", "z"])],
        );
        let mut generator = RequestGenerator::new(&request);
        assert_eq!(generator.total(), 12);
        let mut count = 0;
        while generator.next_value().is_some() {
            count += 1;
        }
        assert_eq!(count, 12);
        assert!(generator.next_value().is_none());
    }

    #[test]
    fn pitchfork_is_bounded_by_shortest_set() {
        let mut request = request_with_payloads(
            vec!["{{BaseURL}}/login"],
            vec![("user", vec!["a", "b", "c"]), ("pass", vec!["1", "2"])],
        );
        request.attack = AttackType::Pitchfork;
        let mut generator = RequestGenerator::new(&request);
        assert_eq!(generator.total(), 2);
        let (_, first) = generator.next_value().expect("first");
        assert_eq!(first["user"], "a");
        assert_eq!(first["pass"], "1");
        let (_, second) = generator.next_value().expect("second");
        assert_eq!(second["user"], "b");
        assert_eq!(second["pass"], "2");
    }

    #[test]
    fn make_substitutes_and_sets_content_length() {
        let request = Arc::new(HttpRequest {
            method: "POST".into(),
            paths: vec!["{{BaseURL}}/login".into()],
            body: Some("user={{user}}".into()),
            payloads: [("user".to_string(), vec!["admin".to_string()])]
                .into_iter()
                .collect(),
            ..Default::default()
        });
        let target = MetaInput::new("https://example.com");
        let mut generator = RequestGenerator::new(&request);
        let (data, payloads) = generator.next_value().expect("value");
        let generated = make_request(
            &request,
            &target,
            &data,
            &payloads,
            &HashMap::new(),
            &HashMap::new(),
            None,
        )
        .expect("make");
        let spec = generated.spec.expect("structured");
        assert_eq!(spec.url, "https://example.com/login");
        assert_eq!(spec.body.as_deref(), Some("user=admin"));
        assert!(spec
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Length" && v == "10"));
    }

    #[test]
    fn unresolved_variable_fails_template_logic() {
        let request = Arc::new(HttpRequest {
            paths: vec!["{{BaseURL}}/{{unknown}}".into()],
            ..Default::default()
        });
        let target = MetaInput::new("https://example.com");
        let mut generator = RequestGenerator::new(&request);
        let (data, payloads) = generator.next_value().expect("value");
        let err = make_request(
            &request,
            &target,
            &data,
            &payloads,
            &HashMap::new(),
            &HashMap::new(),
            None,
        )
        .expect_err("must fail");
        assert!(err.is_unresolved_variables());
    }

    #[test]
    fn raw_block_parses_method_and_path() {
        let raw = parse_raw_request("POST /api/upload HTTP/1.1\nHost: x\n\npayload");
        assert_eq!(raw.method, "POST");
        assert_eq!(raw.path, "/api/upload");
        assert!(raw.data.contains("\r\n"));
    }
}
