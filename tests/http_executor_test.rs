//! HTTP executor behavior over a mock server: serial iteration with
//! extraction feed-forward, response-chain evaluation, stop-at-first-match
//! fan-out, host-error suppression, and the project cache.

mod common;

use std::sync::Arc;

use common::test_options;
use talos::cache::ProjectFile;
use talos::engine::generator::RequestGenerator;
use talos::engine::http_executor::{HttpExecutor, HttpRequest};
use talos::engine::{Executer, ExecutorOptions, ScanContext};
use talos::events::get_str;
use talos::input::MetaInput;
use talos::operators::{
    Condition, Extractor, ExtractorKind, Matcher, MatcherKind, Operators,
};
use talos::template::TemplateInfo;
use talos::EngineConfig;
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

fn executor_for(request: HttpRequest, options: Arc<ExecutorOptions>) -> HttpExecutor {
    let bound = Arc::new(options.for_template(
        "http-test",
        "http-test.yaml",
        TemplateInfo::default(),
    ));
    HttpExecutor::new(vec![Arc::new(request)], bound)
}

#[tokio::test]
async fn serial_match_writes_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/admin"))
        .respond_with(ResponseTemplate::new(200).set_body_string("admin console"))
        .expect(1)
        .mount(&server)
        .await;

    let executor = executor_for(
        HttpRequest {
            paths: vec!["{{BaseURL}}/admin".into()],
            operators: word_operators("admin console"),
            ..Default::default()
        },
        test_options(),
    );
    executor.compile().expect("compile");

    let ctx = ScanContext::new(MetaInput::new(server.uri()));
    let matched = executor.execute(&ctx).await.expect("execute");
    assert!(matched);
}

#[tokio::test]
async fn serial_extractions_feed_following_iterations() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("token=abc123"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/use/abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
        .expect(1)
        .mount(&server)
        .await;

    let operators = Operators {
        matchers: vec![Matcher {
            kind: MatcherKind::Word {
                words: vec!["accepted".into()],
                case_insensitive: false,
            },
            ..Default::default()
        }],
        extractors: vec![Extractor {
            name: Some("token".into()),
            kind: ExtractorKind::Regex {
                patterns: vec![r"token=(\w+)".into()],
                group: 1,
            },
            internal: true,
            ..Default::default()
        }],
        condition: Condition::Or,
        ..Default::default()
    };

    let executor = executor_for(
        HttpRequest {
            paths: vec![
                "{{BaseURL}}/token".into(),
                "{{BaseURL}}/use/{{token}}".into(),
            ],
            operators,
            ..Default::default()
        },
        test_options(),
    );
    executor.compile().expect("compile");

    let ctx = ScanContext::new(MetaInput::new(server.uri()));
    let matched = executor.execute(&ctx).await.expect("execute");
    assert!(matched, "second iteration must see the extracted token");
    server.verify().await;
}

#[tokio::test]
async fn response_chain_evaluates_every_hop() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", "/final"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/final"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello world"))
        .mount(&server)
        .await;

    let executor = executor_for(
        HttpRequest {
            paths: vec!["{{BaseURL}}/start".into()],
            follow_redirects: true,
            max_redirects: 3,
            operators: word_operators("hello"),
            ..Default::default()
        },
        test_options(),
    );
    executor.compile().expect("compile");

    let ctx = ScanContext::new(MetaInput::new(server.uri()));
    let results = executor.execute_with_results(&ctx).await.expect("execute");
    assert!(!results.is_empty(), "final hop must match");

    ctx.with_events(|events| {
        assert_eq!(events.len(), 2, "both chain hops must be evaluated");
        // The final response is evaluated first.
        let first = &events[0].internal;
        assert_eq!(first.get("status_code").and_then(|v| v.as_u64()), Some(200));
        let second = &events[1].internal;
        assert_eq!(second.get("status_code").and_then(|v| v.as_u64()), Some(302));
    });
}

#[tokio::test]
async fn request_condition_surfaces_indexed_keys() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/first"))
        .respond_with(ResponseTemplate::new(200).set_body_string("one"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/second"))
        .respond_with(ResponseTemplate::new(404).set_body_string("two"))
        .mount(&server)
        .await;

    let executor = executor_for(
        HttpRequest {
            paths: vec!["{{BaseURL}}/first".into(), "{{BaseURL}}/second".into()],
            needs_request_condition: true,
            ..Default::default()
        },
        test_options(),
    );
    executor.compile().expect("compile");

    let ctx = ScanContext::new(MetaInput::new(server.uri()));
    let _ = executor.execute_with_results(&ctx).await.expect("execute");

    ctx.with_events(|events| {
        let last = events.last().expect("second iteration event");
        assert_eq!(
            last.internal.get("status_code_0").and_then(|v| v.as_u64()),
            Some(200),
            "first iteration keys must carry into the second"
        );
        assert_eq!(
            last.internal.get("status_code_1").and_then(|v| v.as_u64()),
            Some(404)
        );
    });
}

#[tokio::test]
async fn parallel_stop_at_first_match_emits_single_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("vulnerable"))
        .mount(&server)
        .await;

    let config = EngineConfig {
        rate_limit: 0,
        max_host_errors: 0,
        retries: 0,
        stop_at_first_match: true,
        ..Default::default()
    };
    let options = Arc::new(ExecutorOptions::new(Arc::new(config)));

    let payloads = [(
        "probe".to_string(),
        (0..8).map(|i| format!("p{i}")).collect::<Vec<_>>(),
    )]
    .into_iter()
    .collect();

    let executor = executor_for(
        HttpRequest {
            paths: vec!["{{BaseURL}}/scan/{{probe}}".into()],
            payloads,
            threads: 4,
            operators: word_operators("vulnerable"),
            ..Default::default()
        },
        options,
    );
    executor.compile().expect("compile");

    let ctx = ScanContext::new(MetaInput::new(server.uri()));
    let results = executor.execute_with_results(&ctx).await.expect("execute");
    assert_eq!(results.len(), 1, "once-gate admits exactly one result");

    ctx.with_events(|events| {
        let with_results = events.iter().filter(|e| e.has_results()).count();
        assert_eq!(with_results, 1);
    });
}

#[tokio::test]
async fn race_mode_launches_all_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/race"))
        .respond_with(ResponseTemplate::new(200).set_body_string("winner"))
        .expect(3)
        .mount(&server)
        .await;

    let executor = executor_for(
        HttpRequest {
            paths: vec!["{{BaseURL}}/race".into()],
            race: true,
            race_count: 3,
            operators: word_operators("winner"),
            ..Default::default()
        },
        test_options(),
    );
    executor.compile().expect("compile");

    let ctx = ScanContext::new(MetaInput::new(server.uri()));
    let matched = executor.execute(&ctx).await.expect("execute");
    assert!(matched);
    server.verify().await;
}

#[tokio::test]
async fn suppressed_host_short_circuits_before_transport() {
    let config = EngineConfig {
        rate_limit: 0,
        max_host_errors: 1,
        retries: 0,
        timeout_secs: 2,
        ..Default::default()
    };
    let options = Arc::new(ExecutorOptions::new(Arc::new(config)));

    let request = HttpRequest {
        paths: vec!["{{BaseURL}}/probe".into()],
        operators: word_operators("x"),
        ..Default::default()
    };
    let executor = executor_for(request, Arc::clone(&options));
    executor.compile().expect("compile");

    // Nothing listens on port 1; the first run records the failure.
    let ctx = ScanContext::new(MetaInput::new("http://127.0.0.1:1"));
    let first = executor.execute(&ctx).await;
    assert!(first.is_err(), "dead host must surface a transport error");

    let ctx = ScanContext::new(MetaInput::new("http://127.0.0.1:1"));
    let second = executor.execute(&ctx).await.expect("suppressed run");
    assert!(!second, "suppressed host must short-circuit without error");
}

#[tokio::test]
async fn project_cache_avoids_second_transport_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cached"))
        .respond_with(ResponseTemplate::new(200).set_body_string("stable body"))
        .expect(1)
        .mount(&server)
        .await;

    let mut options = (*test_options()).clone();
    options.project_file = Some(Arc::new(ProjectFile::new()));
    let options = Arc::new(options);

    let executor = executor_for(
        HttpRequest {
            paths: vec!["{{BaseURL}}/cached".into()],
            operators: word_operators("stable"),
            ..Default::default()
        },
        Arc::clone(&options),
    );
    executor.compile().expect("compile");

    for _ in 0..2 {
        let ctx = ScanContext::new(MetaInput::new(server.uri()));
        let matched = executor.execute(&ctx).await.expect("execute");
        assert!(matched);
    }
    // expect(1) on the mock verifies the second run came from the cache.
    server.verify().await;
}

#[test]
fn generator_total_bounds_successful_values() {
    let request = HttpRequest {
        paths: vec!["{{BaseURL}}/a".into(), "{{BaseURL}}/b".into()],
        payloads: [("p".to_string(), vec!["1".to_string(), "2".to_string()])]
            .into_iter()
            .collect(),
        ..Default::default()
    };
    let mut generator = RequestGenerator::new(&request);
    let total = generator.total();
    let mut produced = 0;
    while generator.next_value().is_some() {
        produced += 1;
    }
    assert!(total >= produced);
    assert_eq!(produced, 4);
}

#[tokio::test]
async fn failed_request_still_emits_minimal_event() {
    let config = EngineConfig {
        rate_limit: 0,
        max_host_errors: 0,
        retries: 0,
        timeout_secs: 2,
        ..Default::default()
    };
    let options = Arc::new(ExecutorOptions::new(Arc::new(config)));
    let executor = executor_for(
        HttpRequest {
            paths: vec!["{{BaseURL}}/probe".into()],
            operators: word_operators("x"),
            ..Default::default()
        },
        options,
    );
    executor.compile().expect("compile");

    let ctx = ScanContext::new(MetaInput::new("http://127.0.0.1:1"));
    let result = executor.execute_with_results(&ctx).await;
    assert!(result.is_err());

    ctx.with_events(|events| {
        assert_eq!(events.len(), 1, "a synthetic event must be emitted");
        let event = &events[0].internal;
        assert_eq!(get_str(event, "input"), "http://127.0.0.1:1");
        assert!(!events[0].has_operator_result());
    });
}
