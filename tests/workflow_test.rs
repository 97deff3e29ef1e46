//! Workflow traversal semantics: descent conditioned on parent matches,
//! named-matcher gating, and OR aggregation over visited nodes.

mod common;

use std::sync::Arc;

use common::{node, test_options, MockExecuter, MockOutput};
use talos::engine::workflow::{
    execute_workflow, ProtocolExecuterPair, Workflow, WorkflowMatcher, WorkflowTemplate,
};
use talos::input::MetaInput;

fn pair(executer: Arc<MockExecuter>) -> ProtocolExecuterPair {
    ProtocolExecuterPair {
        executer,
        options: test_options(),
    }
}

#[tokio::test]
async fn simple_workflow_single_match() {
    let executer = Arc::new(MockExecuter::matching(true));
    let workflow = Workflow {
        templates: vec![node(Arc::clone(&executer))],
    };

    let input = MetaInput::new("https://test.com");
    let matched = execute_workflow(&input, &workflow).await;

    assert!(matched, "could not get correct match value");
    assert_eq!(executer.inputs(), vec!["https://test.com"]);
}

#[tokio::test]
async fn sequential_siblings_both_run() {
    let first = Arc::new(MockExecuter::matching(true));
    let second = Arc::new(MockExecuter::matching(true));
    let workflow = Workflow {
        templates: vec![node(Arc::clone(&first)), node(Arc::clone(&second))],
    };

    let input = MetaInput::new("https://test.com");
    let matched = execute_workflow(&input, &workflow).await;

    assert!(matched, "could not get correct match value");
    assert_eq!(first.inputs(), vec!["https://test.com"]);
    assert_eq!(second.inputs(), vec!["https://test.com"]);
}

#[tokio::test]
async fn subtemplates_follow_matching_parent() {
    let parent = Arc::new(MockExecuter::with_outputs(
        true,
        vec![MockOutput::with_result()],
    ));
    let child = Arc::new(MockExecuter::matching(true));

    let workflow = Workflow {
        templates: vec![WorkflowTemplate {
            executers: vec![pair(Arc::clone(&parent))],
            subtemplates: vec![node(Arc::clone(&child))],
            matchers: Vec::new(),
        }],
    };

    let input = MetaInput::new("https://test.com");
    let matched = execute_workflow(&input, &workflow).await;

    assert!(matched, "could not get correct match value");
    assert_eq!(parent.inputs(), vec!["https://test.com"]);
    assert_eq!(child.inputs(), vec!["https://test.com"]);
}

#[tokio::test]
async fn subtemplates_suppressed_on_parent_miss() {
    let parent = Arc::new(MockExecuter::matching(false));
    let child = Arc::new(MockExecuter::matching(true));

    let workflow = Workflow {
        templates: vec![WorkflowTemplate {
            executers: vec![pair(Arc::clone(&parent))],
            subtemplates: vec![node(Arc::clone(&child))],
            matchers: Vec::new(),
        }],
    };

    let input = MetaInput::new("https://test.com");
    let matched = execute_workflow(&input, &workflow).await;

    assert!(!matched, "could not get correct match value");
    assert_eq!(parent.inputs(), vec!["https://test.com"]);
    assert!(child.inputs().is_empty(), "child must not run on parent miss");
}

#[tokio::test]
async fn named_matcher_hit_descends() {
    let parent = Arc::new(MockExecuter::with_outputs(
        true,
        vec![MockOutput::with_named_match("tomcat")],
    ));
    let child = Arc::new(MockExecuter::matching(true));

    let workflow = Workflow {
        templates: vec![WorkflowTemplate {
            executers: vec![pair(Arc::clone(&parent))],
            subtemplates: Vec::new(),
            matchers: vec![WorkflowMatcher {
                name: "tomcat".into(),
                subtemplates: vec![node(Arc::clone(&child))],
            }],
        }],
    };

    let input = MetaInput::new("https://test.com");
    let matched = execute_workflow(&input, &workflow).await;

    assert!(matched, "could not get correct match value");
    assert_eq!(parent.inputs(), vec!["https://test.com"]);
    assert_eq!(child.inputs(), vec!["https://test.com"]);
}

#[tokio::test]
async fn named_matcher_miss_suppresses_subtree() {
    let parent = Arc::new(MockExecuter::with_outputs(
        true,
        vec![MockOutput::with_named_match("tomcat")],
    ));
    let child = Arc::new(MockExecuter::matching(true));

    let workflow = Workflow {
        templates: vec![WorkflowTemplate {
            executers: vec![pair(Arc::clone(&parent))],
            subtemplates: Vec::new(),
            matchers: vec![WorkflowMatcher {
                name: "apache".into(),
                subtemplates: vec![node(Arc::clone(&child))],
            }],
        }],
    };

    let input = MetaInput::new("https://test.com");
    let matched = execute_workflow(&input, &workflow).await;

    assert!(!matched, "could not get correct match value");
    assert_eq!(parent.inputs(), vec!["https://test.com"]);
    assert!(child.inputs().is_empty(), "child must not run on matcher miss");
}

#[tokio::test]
async fn extract_key_also_satisfies_named_matcher() {
    let mut output = MockOutput::default();
    let mut result = talos::operators::OperatorResult::default();
    result
        .extracts
        .insert("version".into(), vec!["9.0.1".into()]);
    output.operator_result = Some(result);

    let parent = Arc::new(MockExecuter::with_outputs(true, vec![output]));
    let child = Arc::new(MockExecuter::matching(true));

    let workflow = Workflow {
        templates: vec![WorkflowTemplate {
            executers: vec![pair(Arc::clone(&parent))],
            subtemplates: Vec::new(),
            matchers: vec![WorkflowMatcher {
                name: "version".into(),
                subtemplates: vec![node(Arc::clone(&child))],
            }],
        }],
    };

    let input = MetaInput::new("https://test.com");
    let matched = execute_workflow(&input, &workflow).await;

    assert!(matched);
    assert_eq!(child.inputs(), vec!["https://test.com"]);
}

#[tokio::test]
async fn executer_error_does_not_abort_siblings() {
    struct FailingExecuter;

    #[async_trait::async_trait]
    impl talos::engine::Executer for FailingExecuter {
        fn compile(&self) -> talos::Result<()> {
            Ok(())
        }
        fn requests(&self) -> usize {
            1
        }
        async fn execute(
            &self,
            _ctx: &talos::engine::ScanContext,
        ) -> talos::Result<bool> {
            Err(talos::ErrorX::with_class(
                talos::ErrorClass::NetworkTemporary,
                "connection reset",
            ))
        }
        async fn execute_with_results(
            &self,
            _ctx: &talos::engine::ScanContext,
        ) -> talos::Result<Vec<talos::events::ResultEvent>> {
            Err(talos::ErrorX::new("unreachable"))
        }
    }

    let sibling = Arc::new(MockExecuter::matching(true));
    let workflow = Workflow {
        templates: vec![
            WorkflowTemplate {
                executers: vec![ProtocolExecuterPair {
                    executer: Arc::new(FailingExecuter),
                    options: test_options(),
                }],
                subtemplates: Vec::new(),
                matchers: Vec::new(),
            },
            node(Arc::clone(&sibling)),
        ],
    };

    let input = MetaInput::new("https://test.com");
    let matched = execute_workflow(&input, &workflow).await;

    assert!(matched, "sibling match must survive the failing node");
    assert_eq!(sibling.inputs(), vec!["https://test.com"]);
}
