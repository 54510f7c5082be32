#![cfg(unix)]

use launchpad_lib::context::RuntimeContext;
use launchpad_lib::executor::stream::OutputChunk;
use launchpad_lib::executor::{CommandResult, CommandSpec, Executor, FailureReason};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn session(executor: &Executor, dir: &Path) -> (Vec<CommandResult>, Vec<OutputChunk>) {
    let ok = executor.run_buffered(&CommandSpec::new("echo hello", dir)).await;
    let failed = executor
        .run_buffered(&CommandSpec::new("echo oops >&2; exit 3", dir))
        .await;
    let mut handle = executor.run_streamed(&CommandSpec::new("printf 'a\\n'; sleep 0.05; printf 'b\\n'", dir));
    let mut chunks = Vec::new();
    let streamed = handle.collect(|chunk| chunks.push(chunk.clone())).await;
    (vec![ok, failed, streamed], chunks)
}

#[tokio::test]
async fn recorded_session_replays_call_for_call() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = dir.path().join("fixtures/session.ndjson");
    let ctx = Arc::new(RuntimeContext::default());

    let recorder = Executor::recording(ctx.clone(), &fixture).expect("recorder");
    let (live, live_chunks) = session(&recorder, dir.path()).await;
    assert_eq!(live[0].stdout, "hello\n");
    assert_eq!(live[1].exit_code, 3);
    drop(recorder);

    let raw = std::fs::read_to_string(&fixture).expect("fixture file");
    assert_eq!(raw.lines().count(), 3);
    assert!(raw.lines().all(|line| line.contains("\"kind\"")));

    let replayer = Executor::replaying(ctx, &fixture).expect("replayer");
    let (replayed, replayed_chunks) = session(&replayer, dir.path()).await;
    let shape = |results: &[CommandResult]| -> Vec<(bool, i32, String)> {
        results
            .iter()
            .map(|r| (r.succeeded, r.exit_code, r.stdout.clone()))
            .collect()
    };
    assert_eq!(shape(&replayed), shape(&live));
    assert_eq!(replayed_chunks, live_chunks);

    let exhausted = replayer.run_buffered(&CommandSpec::new("echo extra", dir.path())).await;
    assert!(!exhausted.succeeded);
    assert_eq!(exhausted.reason, Some(FailureReason::ReplayExhausted));
}

#[tokio::test]
async fn idle_timeout_aborts_silent_command() {
    let dir = tempfile::tempdir().expect("tempdir");
    let executor = Executor::live(Arc::new(RuntimeContext::default()));
    let spec = CommandSpec::new("echo started; sleep 10", dir.path())
        .with_idle_timeout(Some(Duration::from_millis(300)));

    let started = Instant::now();
    let mut handle = executor.run_streamed(&spec);
    let first = handle.next_chunk().await.expect("first chunk");
    assert_eq!(first.data, "started\n");
    let result = handle.wait().await;

    assert!(!result.succeeded);
    assert_eq!(result.reason, Some(FailureReason::IdleTimeout));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancel_stops_a_long_running_command() {
    let dir = tempfile::tempdir().expect("tempdir");
    let executor = Executor::live(Arc::new(RuntimeContext::default()));
    let mut handle = executor.run_streamed(&CommandSpec::new("sleep 30", dir.path()));

    let started = Instant::now();
    handle.cancel();
    let result = handle.wait().await;

    assert!(!result.succeeded);
    assert_eq!(result.reason, Some(FailureReason::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}
