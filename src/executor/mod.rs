pub mod fixtures;
pub mod output;
pub mod process;
pub mod stream;

use crate::context::RuntimeContext;
use crate::errors::AppResult;
use crate::models::ProviderKind;
use fixtures::{FixtureRecorder, InvocationKind, ReplayEvent, ReplaySession};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stream::{Canceller, StreamHandle, Supervision};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

pub use stream::{OutputChunk, StreamKind};

pub const CANCEL_GRACE: Duration = Duration::from_millis(500);
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(300);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEPLOY_TIMEOUT: Duration = Duration::from_secs(900);
const VERSION_TIMEOUT: Duration = Duration::from_secs(3);
// Headroom for the supervisor's own terminate-then-kill before the outer guard fires.
const ATTEMPT_GUARD_SLACK: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub attach_terminal: bool,
    pub hint_scope: Option<ProviderKind>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            stdin: None,
            timeout: None,
            idle_timeout: None,
            attach_terminal: false,
            hint_scope: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle.filter(|value| !value.is_zero());
        self
    }

    pub fn scoped(mut self, provider: ProviderKind) -> Self {
        self.hint_scope = Some(provider);
        self
    }

    /// Inherit the terminal instead of capturing output, for interactive logins.
    pub fn attached(mut self) -> Self {
        self.attach_terminal = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    SpawnFailed,
    TimedOut,
    IdleTimeout,
    Cancelled,
    ReplayExhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub succeeded: bool,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(skip)]
    pub reason: Option<FailureReason>,
}

impl CommandResult {
    pub fn failure(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            exit_code: 1,
            stdout: String::new(),
            stderr: message.into(),
            reason: Some(reason),
        }
    }

    pub fn combined_output(&self) -> String {
        let mut combined = self.stdout.clone();
        if !combined.is_empty() && !self.stderr.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&self.stderr);
        combined
    }
}

/// `retries` counts re-attempts, so a policy performs `retries + 1` runs at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub per_attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            per_attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    pub fn for_deploy(self) -> Self {
        Self {
            per_attempt_timeout: DEPLOY_TIMEOUT.max(self.per_attempt_timeout),
            ..self
        }
    }

    pub fn single_attempt(self) -> Self {
        Self { retries: 0, ..self }
    }

    /// Backoff before re-attempt number `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = if base_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..base_ms)
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("operation timed out after {}ms", .0.as_millis())]
pub struct TimeoutError(pub Duration);

/// Races `future` against a timer. A zero duration disables the timer.
///
/// Expiry drops `future`; a [`StreamHandle`] kept outside the future is left running, so
/// callers that need the process stopped pair this with [`StreamHandle::cancel`].
pub async fn with_timeout<F: Future>(future: F, duration: Duration) -> Result<F::Output, TimeoutError> {
    if duration.is_zero() {
        return Ok(future.await);
    }
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError(duration))
}

#[derive(Debug)]
enum Mode {
    Live,
    Record(Arc<FixtureRecorder>),
    Replay(ReplaySession),
}

#[derive(Debug)]
struct Inner {
    mode: Mode,
    ctx: Arc<RuntimeContext>,
}

/// Runs shell command lines, live or against recorded fixtures.
#[derive(Debug, Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn live(ctx: Arc<RuntimeContext>) -> Self {
        Self::with_mode(ctx, Mode::Live)
    }

    pub fn recording(ctx: Arc<RuntimeContext>, path: &Path) -> AppResult<Self> {
        let recorder = FixtureRecorder::create(path)?;
        tracing::info!(path = %recorder.path().display(), "recording command fixtures");
        Ok(Self::with_mode(ctx, Mode::Record(Arc::new(recorder))))
    }

    pub fn replaying(ctx: Arc<RuntimeContext>, path: &Path) -> AppResult<Self> {
        let session = ReplaySession::load(path)?;
        tracing::info!(path = %path.display(), events = session.remaining(), "replaying command fixtures");
        Ok(Self::with_mode(ctx, Mode::Replay(session)))
    }

    pub fn from_session(ctx: Arc<RuntimeContext>, session: ReplaySession) -> Self {
        Self::with_mode(ctx, Mode::Replay(session))
    }

    fn with_mode(ctx: Arc<RuntimeContext>, mode: Mode) -> Self {
        Self {
            inner: Arc::new(Inner { mode, ctx }),
        }
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.inner.ctx
    }

    pub fn is_replay(&self) -> bool {
        matches!(self.inner.mode, Mode::Replay(_))
    }

    pub async fn run_buffered(&self, spec: &CommandSpec) -> CommandResult {
        if spec.attach_terminal {
            return self.run_attached(spec).await;
        }
        let mut handle = self.launch(spec, InvocationKind::Buffered);
        handle.wait().await
    }

    pub fn run_streamed(&self, spec: &CommandSpec) -> StreamHandle {
        self.launch(spec, InvocationKind::Streamed)
    }

    pub async fn run_with_retry(&self, spec: &CommandSpec, policy: &RetryPolicy) -> CommandResult {
        let attempts = policy.retries.saturating_add(1);
        let mut attempt_spec = spec.clone();
        if !policy.per_attempt_timeout.is_zero() {
            attempt_spec.timeout = Some(match spec.timeout {
                Some(own) => own.min(policy.per_attempt_timeout),
                None => policy.per_attempt_timeout,
            });
        }
        let guard = if policy.per_attempt_timeout.is_zero() {
            Duration::ZERO
        } else {
            policy.per_attempt_timeout + CANCEL_GRACE + ATTEMPT_GUARD_SLACK
        };

        let mut last = CommandResult::failure(FailureReason::SpawnFailed, "command was not attempted");
        for attempt in 0..attempts {
            let result = match with_timeout(self.run_buffered(&attempt_spec), guard).await {
                Ok(result) => result,
                Err(error) => CommandResult::failure(FailureReason::TimedOut, error.to_string()),
            };
            if result.succeeded {
                return result;
            }

            tracing::debug!(
                attempt = attempt + 1,
                attempts,
                exit_code = result.exit_code,
                reason = ?result.reason,
                "command attempt failed"
            );
            let exhausted = result.reason == Some(FailureReason::ReplayExhausted);
            last = result;
            if exhausted || attempt + 1 >= attempts {
                break;
            }
            tokio::time::sleep(policy.jittered_backoff(attempt)).await;
        }
        last
    }

    /// Whether `binary` answers `--version` successfully.
    pub async fn has(&self, binary: &str, dir: &Path) -> bool {
        self.version_of(binary, dir).await.is_some()
    }

    pub async fn version_of(&self, binary: &str, dir: &Path) -> Option<String> {
        let spec = CommandSpec::new(format!("{} --version", binary), dir).with_timeout(VERSION_TIMEOUT);
        let result = self.run_buffered(&spec).await;
        if !result.succeeded {
            return None;
        }
        let stdout = result.stdout.trim();
        (!stdout.is_empty()).then(|| stdout.to_string())
    }

    fn launch(&self, spec: &CommandSpec, kind: InvocationKind) -> StreamHandle {
        let ctx = self.inner.ctx.clone();
        if spec.command.trim().is_empty() {
            return StreamHandle::completed(
                CommandResult::failure(FailureReason::SpawnFailed, "empty command"),
                Vec::new(),
            );
        }

        let recorder = match &self.inner.mode {
            Mode::Replay(session) => return self.replay(session, spec, kind),
            Mode::Record(recorder) => Some(recorder.clone()),
            Mode::Live => None,
        };

        tracing::debug!(command = %ctx.redact(&spec.command), cwd = %spec.working_dir.display(), "spawning command");
        let mut command = process::shell_command(spec, ctx.is_ci());
        let child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                let message = process::spawn_error_message(spec, &error);
                tracing::warn!(command = %ctx.redact(&spec.command), "{}", message);
                let result = CommandResult::failure(FailureReason::SpawnFailed, message);
                self.record(recorder.as_deref(), kind, spec, &result, Vec::new());
                return StreamHandle::completed(result, Vec::new());
            }
        };

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = oneshot::channel();
        let canceller = Canceller::new();
        tokio::spawn(stream::supervise(Supervision {
            child,
            spec: spec.clone(),
            kind,
            ctx,
            recorder,
            chunk_tx,
            cancel: canceller.signal(),
            completion_tx,
        }));
        StreamHandle::new(chunk_rx, completion_rx, canceller)
    }

    fn replay(&self, session: &ReplaySession, spec: &CommandSpec, kind: InvocationKind) -> StreamHandle {
        let Some(event) = session.next(kind, &spec.command) else {
            tracing::warn!(command = %spec.command, "no recorded invocation left to replay");
            return StreamHandle::completed(
                CommandResult::failure(
                    FailureReason::ReplayExhausted,
                    format!("no recorded invocation left for: {}", spec.command),
                ),
                Vec::new(),
            );
        };
        let chunks = event.replay_chunks();
        for chunk in &chunks {
            for line in chunk.data.lines() {
                self.inner.ctx.scan_output(spec.hint_scope, line);
            }
        }
        StreamHandle::completed(event.result, chunks)
    }

    async fn run_attached(&self, spec: &CommandSpec) -> CommandResult {
        let recorder = match &self.inner.mode {
            Mode::Replay(session) => {
                let mut handle = self.replay(session, spec, InvocationKind::Buffered);
                return handle.wait().await;
            }
            Mode::Record(recorder) => Some(recorder.clone()),
            Mode::Live => None,
        };

        let mut command = process::shell_command(spec, false);
        let result = match command.spawn() {
            Err(error) => CommandResult::failure(
                FailureReason::SpawnFailed,
                process::spawn_error_message(spec, &error),
            ),
            Ok(mut child) => {
                let waited = match spec.timeout {
                    Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
                    None => Some(child.wait().await),
                };
                match waited {
                    Some(Ok(status)) => CommandResult {
                        succeeded: status.success(),
                        exit_code: process::exit_code_of(&status),
                        ..CommandResult::default()
                    },
                    Some(Err(error)) => CommandResult::failure(
                        FailureReason::SpawnFailed,
                        format!("failed to wait for process: {}", error),
                    ),
                    None => {
                        process::terminate_then_kill(&mut child, CANCEL_GRACE).await;
                        CommandResult::failure(FailureReason::TimedOut, "interactive command timed out")
                    }
                }
            }
        };
        self.record(recorder.as_deref(), InvocationKind::Buffered, spec, &result, Vec::new());
        result
    }

    fn record(
        &self,
        recorder: Option<&FixtureRecorder>,
        kind: InvocationKind,
        spec: &CommandSpec,
        result: &CommandResult,
        chunks: Vec<OutputChunk>,
    ) {
        if let Some(recorder) = recorder {
            recorder.append(&ReplayEvent {
                kind,
                command: spec.command.clone(),
                cwd: Some(spec.working_dir.display().to_string()),
                result: result.clone(),
                chunks,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        with_timeout, CommandResult, CommandSpec, Executor, FailureReason, RetryPolicy, TimeoutError,
    };
    use crate::context::RuntimeContext;
    use crate::executor::fixtures::ReplaySession;
    use std::sync::Arc;
    use tokio::time::{Duration, Instant};

    fn replay(raw: &str) -> Executor {
        let session = ReplaySession::parse(raw).expect("fixtures parse");
        Executor::from_session(Arc::new(RuntimeContext::default()), session)
    }

    const FAIL: &str = r#"{"kind":"buffered","command":"x","succeeded":false,"exitCode":2,"stdout":"","stderr":"nope"}"#;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            retries: 3,
            base_delay: Duration::from_millis(100),
            per_attempt_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(40), Duration::from_millis(100).saturating_mul(u32::MAX));
    }

    #[test]
    fn defaults_match_documented_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(300));
        assert_eq!(policy.per_attempt_timeout, Duration::from_secs(120));
        assert_eq!(policy.for_deploy().per_attempt_timeout, Duration::from_secs(900));
    }

    #[test]
    fn combined_output_separates_streams() {
        let result = CommandResult {
            succeeded: false,
            exit_code: 1,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            reason: None,
        };
        assert_eq!(result.combined_output(), "out\nerr");
    }

    #[tokio::test]
    async fn empty_command_fails_without_spawning() {
        let executor = Executor::live(Arc::new(RuntimeContext::default()));
        let result = executor.run_buffered(&CommandSpec::new("   ", ".")).await;
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stderr, "empty command");
        assert_eq!(result.reason, Some(FailureReason::SpawnFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_exhausted_with_growing_delay() {
        let raw = [FAIL, FAIL, FAIL, FAIL].join("\n");
        let executor = replay(&raw);
        let policy = RetryPolicy {
            retries: 3,
            base_delay: Duration::from_millis(200),
            per_attempt_timeout: Duration::from_secs(5),
        };

        let started = Instant::now();
        let result = executor.run_with_retry(&CommandSpec::new("x", "."), &policy).await;
        let elapsed = started.elapsed();

        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 2);
        assert!(elapsed >= Duration::from_millis(200 + 400 + 800));
        assert!(elapsed < Duration::from_millis(200 + 400 + 800 + 3 * 200));

        let exhausted = executor.run_buffered(&CommandSpec::new("x", ".")).await;
        assert_eq!(exhausted.reason, Some(FailureReason::ReplayExhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_at_first_success() {
        let ok = r#"{"kind":"buffered","command":"x","succeeded":true,"exitCode":0,"stdout":"done","stderr":""}"#;
        let executor = replay(&[FAIL, ok, FAIL].join("\n"));
        let result = executor
            .run_with_retry(&CommandSpec::new("x", "."), &RetryPolicy::default())
            .await;
        assert!(result.succeeded);
        assert_eq!(result.stdout, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_rejects_slow_future() {
        let slow = tokio::time::sleep(Duration::from_secs(10));
        let err = with_timeout(slow, Duration::from_secs(1)).await.expect_err("must time out");
        assert_eq!(err, TimeoutError(Duration::from_secs(1)));
        assert_eq!(err.to_string(), "operation timed out after 1000ms");

        let value = with_timeout(async { 7 }, Duration::ZERO).await.expect("no timer");
        assert_eq!(value, 7);
    }
}
