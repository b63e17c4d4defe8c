//! Tests for debug logging
//!
//! Runs code paths that log at debug level with a logger installed, making
//! sure the log statements themselves never disturb the results.

use futures::{StreamExt, stream};
use serde_json::json;
use std::sync::Arc;
use turnwise::streaming::response_stream;
use turnwise::{
    CancellationToken, Error, FunctionCall, PolicyEngine, PolicyRule, ToolCallScheduler,
    ToolCallStatus, ToolRegistry, tool,
};

fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

#[tokio::test]
async fn test_scheduler_transitions_with_debug_enabled() {
    init_logging();

    let registry: ToolRegistry = vec![
        tool("echo", "Echo the input")
            .param("text", "string")
            .build(|args, _abort| async move { Ok(args) }),
    ]
    .into_iter()
    .collect();
    let policy = PolicyEngine::new(vec![
        PolicyRule::allow("echo", "echo"),
        PolicyRule::deny("no-secrets", "echo").when_arg("/text", "*secret*"),
    ])
    .unwrap();
    let scheduler = ToolCallScheduler::new(Arc::new(registry), Arc::new(policy));

    let calls = vec![
        FunctionCall::new(None, "echo", json!({"text": "hi"}).as_object().cloned().unwrap()).into(),
        FunctionCall::new(None, "echo", json!({"text": "my secret"}).as_object().cloned().unwrap())
            .into(),
    ];
    let completed = scheduler
        .schedule("debug-1", calls, &CancellationToken::new())
        .await;

    assert_eq!(completed[0].state.call_id, "echo-0");
    assert_eq!(completed[0].status(), ToolCallStatus::Completed);
    assert_eq!(completed[0].response.response["text"], json!("hi"));
    assert_eq!(completed[1].state.call_id, "echo-1");
    assert_eq!(completed[1].status(), ToolCallStatus::Denied);
    assert!(
        completed[1]
            .response
            .message()
            .unwrap()
            .contains("no-secrets")
    );
}

#[tokio::test]
async fn test_skipped_sse_events_with_debug_enabled() {
    init_logging();

    let body = stream::iter(vec![Ok::<_, Error>(
        b"data: nope\n\ndata: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"}}]}\n\n".to_vec(),
    )]);
    let emissions: Vec<_> = response_stream(body, "m", None).collect().await;

    assert_eq!(emissions.len(), 1);
    assert_eq!(emissions[0].as_ref().unwrap().text(), "ok");
}
