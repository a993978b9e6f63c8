//! End-to-end tests against real worker processes.

mod common;

use std::time::Duration;

use serde_json::json;
use shimlet::{
    CorrelationMode, FatalPolicy, FatalReason, HostAdapter, InvocationError,
    RequestResponseBridge, SpawnError, WorkerExit,
};

use common::{echo_config, script_config};

#[tokio::test]
async fn echo_round_trip() {
    let adapter = HostAdapter::start(&echo_config()).unwrap();

    let result = adapter
        .invoke(json!({"path": "/ping"}), json!({"functionName": "f"}))
        .await;

    assert_eq!(
        result,
        Ok(json!({
            "event": {"path": "/ping"},
            "context": {"functionName": "f", "callbackWaitsForEmptyEventLoop": false}
        }))
    );
}

#[cfg(unix)]
#[tokio::test]
async fn uncorrelated_worker_value_is_delivered() {
    // A worker that knows nothing about ids: reads one line, answers once.
    let dir = tempfile::tempdir().unwrap();
    let config = script_config(
        dir.path(),
        r#"read line
echo '{"value":[{"status":200,"url":"http://a"}]}'
cat > /dev/null
"#,
    );
    let adapter = HostAdapter::start(&config).unwrap();

    let result = adapter
        .invoke(json!({"urls": ["http://a"]}), json!({}))
        .await;

    assert_eq!(result, Ok(json!([{"status": 200, "url": "http://a"}])));
}

#[cfg(unix)]
#[tokio::test]
async fn uncorrelated_worker_serves_overlapping_invocations() {
    // Answers in order with no ids, like a worker that predates correlation.
    let dir = tempfile::tempdir().unwrap();
    let config = script_config(
        dir.path(),
        r#"n=0
while read line; do
  n=$((n+1))
  echo "{\"value\":$n}"
done
"#,
    );
    let bridge = RequestResponseBridge::start(&config).unwrap();

    let (first, second, third) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(
            bridge.invoke(json!({"n": 1}), json!({})),
            bridge.invoke(json!({"n": 2}), json!({})),
            bridge.invoke(json!({"n": 3}), json!({})),
        )
    })
    .await
    .expect("overlapping invocations should all complete");

    assert_eq!(first, Ok(json!(1)));
    assert_eq!(second, Ok(json!(2)));
    assert_eq!(third, Ok(json!(3)));
    assert_eq!(bridge.pending_count(), 0);
}

#[tokio::test]
async fn worker_error_is_delivered_verbatim() {
    let adapter = HostAdapter::start(&echo_config()).unwrap();

    let result = adapter.invoke(json!({"fail": "boom"}), json!({})).await;

    assert_eq!(result, Err(InvocationError::Worker("boom".to_string())));
    // The worker survives its own errors.
    assert_eq!(
        adapter.invoke(json!({"reply": 7}), json!({})).await,
        Ok(json!(7))
    );
}

#[tokio::test]
async fn worker_exit_fails_in_flight_invocation() {
    let adapter = HostAdapter::start(&echo_config()).unwrap();

    let result = adapter.invoke(json!({"exit": 3}), json!({})).await;

    let reason = FatalReason::Exited(WorkerExit {
        code: Some(3),
        signal: None,
    });
    assert_eq!(result, Err(InvocationError::WorkerLost(reason.clone())));
    assert_eq!(adapter.bridge().closed().await, reason);
    assert_eq!(
        adapter.invoke(json!({}), json!({})).await,
        Err(InvocationError::Unavailable)
    );
}

#[tokio::test]
async fn missing_worker_fails_to_start() {
    let config = echo_config().with_worker("/nonexistent/shimlet-worker");

    let err = HostAdapter::start_or_exit(&config)
        .err()
        .expect("spawn should fail");

    assert!(matches!(err, SpawnError::Spawn { .. }));
    assert!(err.to_string().contains("/nonexistent/shimlet-worker"));
}

#[tokio::test]
async fn sequential_invocations_complete_in_order() {
    let config = echo_config().with_correlation(CorrelationMode::Sequential);
    let bridge = RequestResponseBridge::start(&config).unwrap();

    for n in 0..5 {
        let result = bridge.invoke(json!({"reply": n}), json!({})).await;
        assert_eq!(result, Ok(json!(n)));
    }
    assert_eq!(bridge.pending_count(), 0);
}

#[tokio::test]
async fn correlated_invocations_overlap() {
    let config = echo_config().with_env("SHIMLET_ECHO_CONCURRENCY", "4");
    let bridge = RequestResponseBridge::start(&config).unwrap();

    // The slowest request goes first; every result still finds its caller.
    let (a, b, c) = tokio::join!(
        bridge.invoke(json!({"reply": "a", "sleep_ms": 300}), json!({})),
        bridge.invoke(json!({"reply": "b", "sleep_ms": 100}), json!({})),
        bridge.invoke(json!({"reply": "c"}), json!({})),
    );

    assert_eq!(a, Ok(json!("a")));
    assert_eq!(b, Ok(json!("b")));
    assert_eq!(c, Ok(json!("c")));
}

#[tokio::test]
async fn garbage_line_fails_one_invocation_only() {
    let bridge = RequestResponseBridge::start(&echo_config()).unwrap();

    let result = bridge.invoke(json!({"garbage": true}), json!({})).await;
    assert!(
        matches!(result, Err(InvocationError::Protocol(_))),
        "got {result:?}"
    );

    // The real response to the first request is discarded as unknown and
    // the bridge keeps serving.
    assert_eq!(
        bridge.invoke(json!({"reply": "ok"}), json!({})).await,
        Ok(json!("ok"))
    );
    assert!(bridge.is_available());
}

#[tokio::test]
async fn oversized_line_is_fatal() {
    let config = echo_config().with_max_line_bytes(64);
    let bridge = RequestResponseBridge::start(&config).unwrap();

    let result = bridge
        .invoke(json!({"reply": "x".repeat(256)}), json!({}))
        .await;

    assert!(
        matches!(result, Err(InvocationError::WorkerLost(FatalReason::Framing(_)))),
        "got {result:?}"
    );
    assert!(!bridge.is_available());
}

#[tokio::test]
async fn handle_fires_callback_once() {
    let adapter = HostAdapter::start(&echo_config()).unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    adapter.handle(
        json!({"reply": {"ok": true}}),
        json!({"callbackWaitsForEmptyEventLoop": true}),
        move |result| {
            tx.send(result).unwrap();
        },
    );

    let result = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap();
    assert_eq!(result, Some(Ok(json!({"ok": true}))));
    // Sender was consumed with the callback.
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn context_wait_flag_reaches_worker_cleared() {
    let adapter = HostAdapter::start(&echo_config()).unwrap();

    let result = adapter
        .invoke(
            json!({}),
            json!({"awsRequestId": "r-1", "callbackWaitsForEmptyEventLoop": true}),
        )
        .await
        .unwrap();

    assert_eq!(
        result["context"],
        json!({"awsRequestId": "r-1", "callbackWaitsForEmptyEventLoop": false})
    );
}

#[cfg(unix)]
#[tokio::test]
async fn killed_worker_reports_signal() {
    let dir = tempfile::tempdir().unwrap();
    let config = script_config(dir.path(), "read line\nkill -9 $$\n")
        .with_fatal_policy(FatalPolicy::Continue);
    let bridge = RequestResponseBridge::start(&config).unwrap();

    let result = bridge.invoke(json!({}), json!({})).await;

    let Err(InvocationError::WorkerLost(FatalReason::Exited(exit))) = result else {
        panic!("expected lost worker, got {result:?}");
    };
    assert_eq!(exit.signal, Some(9));
    assert!(exit.to_string().contains("SIGKILL"));
}

#[cfg(unix)]
#[tokio::test]
async fn worker_that_closes_stdout_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let config = script_config(dir.path(), "exec >&-
exec sleep 60
");
    let bridge = RequestResponseBridge::start(&config).unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(15), bridge.closed())
        .await
        .unwrap();
    assert!(matches!(reason, FatalReason::Framing(_)), "got {reason:?}");

    let exit = tokio::time::timeout(Duration::from_secs(5), bridge.worker_exited())
        .await
        .expect("worker should be killed");
    assert_eq!(exit.signal, Some(9));
}
