//! Clustering: partition rules, stable cluster ids, and fan-out execution
//! over a single transport call.

mod common;

use std::sync::Arc;

use common::test_options;
use talos::engine::cluster::{cluster, cluster_id, cluster_templates, ClusterExecutor};
use talos::engine::http_executor::HttpRequest;
use talos::engine::{Executer, ScanContext};
use talos::events::MemorySink;
use talos::input::MetaInput;
use talos::operators::{Condition, Matcher, MatcherKind, Operators};
use talos::template::{Template, TemplateInfo};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn word_operators(word: &str) -> Operators {
    Operators {
        matchers: vec![Matcher {
            kind: MatcherKind::Word {
                words: vec![word.to_string()],
                case_insensitive: false,
            },
            ..Default::default()
        }],
        condition: Condition::Or,
        ..Default::default()
    }
}

fn http_template(id: &str, request_path: &str, operators: Operators) -> Template {
    let mut template = Template::new(id, TemplateInfo::default());
    template.path = format!("{id}.yaml");
    template.http = vec![Arc::new(HttpRequest {
        paths: vec![format!("{{{{BaseURL}}}}{request_path}")],
        operators,
        ..Default::default()
    })];
    template
}

// ── Partition rules ──────────────────────────────────────────────────

#[test]
fn identical_requests_cluster_together() {
    let templates = vec![
        http_template("t1", "/robots.txt", word_operators("Disallow")),
        http_template("t2", "/robots.txt", word_operators("admin")),
        http_template("t3", "/other.txt", word_operators("x")),
    ];
    let groups = cluster(templates);
    let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
    assert!(sizes.contains(&2), "t1 and t2 share wire output: {sizes:?}");
    assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), 3);
}

#[test]
fn payloads_body_and_name_prevent_clustering() {
    let mut with_body = http_template("t1", "/a", Operators::default());
    let mut inner = (*with_body.http[0]).clone();
    inner.body = Some("data".into());
    with_body.http = vec![Arc::new(inner)];

    let mut named = http_template("t2", "/a", Operators::default());
    let mut inner = (*named.http[0]).clone();
    inner.name = Some("step-one".into());
    named.http = vec![Arc::new(inner)];

    let groups = cluster(vec![with_body, named]);
    assert_eq!(groups.len(), 2, "neither template is clusterable");
}

#[test]
fn header_order_is_significant() {
    let make = |id: &str, headers: Vec<(&str, &str)>| {
        let mut template = http_template(id, "/a", Operators::default());
        let mut inner = (*template.http[0]).clone();
        inner.headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        template.http = vec![Arc::new(inner)];
        template
    };
    let a = make("t1", vec![("Accept", "*/*"), ("X-Probe", "1")]);
    let b = make("t2", vec![("X-Probe", "1"), ("Accept", "*/*")]);

    let groups = cluster(vec![a, b]);
    assert_eq!(groups.len(), 2, "reordered headers must not cluster");
}

#[test]
fn flow_and_multiprotocol_are_never_clustered() {
    let mut flow = http_template("t1", "/a", Operators::default());
    flow.flow = Some("http(1)".into());
    let mut multi = http_template("t2", "/a", Operators::default());
    multi.multiprotocol = true;
    let plain = http_template("t3", "/a", Operators::default());

    let groups = cluster(vec![flow, multi, plain]);
    assert_eq!(groups.len(), 3);
}

#[test]
fn cluster_id_is_order_independent_and_stable() {
    let a = http_template("alpha", "/x", Operators::default());
    let b = http_template("beta", "/x", Operators::default());
    let forward = cluster_id(&[a.clone(), b.clone()]);
    let reverse = cluster_id(&[b, a]);
    assert_eq!(forward, reverse);
    assert_eq!(forward.len(), 64, "sha-256 hex digest expected");
}

// ── Fan-out execution ────────────────────────────────────────────────

#[tokio::test]
async fn cluster_runs_one_transport_call_and_fans_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /admin"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let templates = vec![
        http_template("robots-disallow", "/robots.txt", word_operators("Disallow")),
        http_template("robots-admin", "/robots.txt", word_operators("/admin")),
    ];

    let options = test_options();
    let cluster_options = Arc::new(options.for_template(
        "cluster-test",
        "cluster-test",
        TemplateInfo::default(),
    ));
    let executer = ClusterExecutor::new(&templates, cluster_options);
    executer.compile().expect("compile");

    let ctx = ScanContext::new(MetaInput::new(server.uri()));
    let results = executer
        .execute_with_results(&ctx)
        .await
        .expect("cluster execution");

    assert_eq!(results.len(), 2, "one result per matching member");
    let mut ids: Vec<&str> = results.iter().map(|r| r.template_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["robots-admin", "robots-disallow"]);

    // The mock's expect(1) verifies the single transport call on drop.
    server.verify().await;
}

#[tokio::test]
async fn non_matching_member_emits_no_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(200).set_body_string("nginx"))
        .expect(1)
        .mount(&server)
        .await;

    let templates = vec![
        http_template("detect-nginx", "/version", word_operators("nginx")),
        http_template("detect-apache", "/version", word_operators("Apache")),
    ];

    let options = test_options();
    let sink = Arc::new(MemorySink::new());
    let mut bound = options.for_template("cluster-x", "cluster-x", TemplateInfo::default());
    bound.sink = Arc::clone(&sink) as Arc<dyn talos::events::OutputSink>;

    let executer = ClusterExecutor::new(&templates, Arc::new(bound));
    executer.compile().expect("compile");

    let ctx = ScanContext::new(MetaInput::new(server.uri()));
    let matched = executer.execute(&ctx).await.expect("execute");

    assert!(matched);
    let results = sink.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].template_id, "detect-nginx");
}

#[test]
fn cluster_templates_replaces_groups() {
    let templates = vec![
        http_template("t1", "/favicon.ico", word_operators("a")),
        http_template("t2", "/favicon.ico", word_operators("b")),
        http_template("t3", "/unique", word_operators("c")),
    ];
    let options = test_options();
    let (list, absorbed) = cluster_templates(templates, &options);

    assert_eq!(absorbed, 2);
    assert_eq!(list.len(), 2);
    assert!(list.iter().any(|t| t.id.starts_with("cluster-")));
    assert!(list.iter().all(|t| t.executer.is_some()));
}
