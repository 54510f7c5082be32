use super::fixtures::{FixtureRecorder, InvocationKind, ReplayEvent};
use super::output::{sanitize_terminal_text, LineSplitter, MAX_PENDING_LINE_BYTES};
use super::process::{exit_code_of, terminate_then_kill};
use super::{CommandResult, CommandSpec, FailureReason, CANCEL_GRACE};
use crate::context::RuntimeContext;
use serde::{Deserialize, Serialize};
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

const READ_CHUNK_BYTES: usize = 4096;
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const EXIT_CANCELLED: i32 = 130;
const EXIT_TIMED_OUT: i32 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    #[serde(rename = "out")]
    Stdout,
    #[serde(rename = "err")]
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: String,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Canceller {
    notify: Arc<Notify>,
}

impl Canceller {
    pub(crate) fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }

    /// Requests graceful termination; the process is force-killed after the grace period.
    pub fn cancel(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn signal(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

/// A running command: its output chunks in arrival order and its eventual result.
///
/// Dropping a handle before its result has been observed cancels the command.
#[derive(Debug)]
pub struct StreamHandle {
    chunks: mpsc::UnboundedReceiver<OutputChunk>,
    completion: oneshot::Receiver<CommandResult>,
    canceller: Canceller,
    finished: Option<CommandResult>,
}

impl StreamHandle {
    pub(crate) fn new(
        chunks: mpsc::UnboundedReceiver<OutputChunk>,
        completion: oneshot::Receiver<CommandResult>,
        canceller: Canceller,
    ) -> Self {
        Self {
            chunks,
            completion,
            canceller,
            finished: None,
        }
    }

    /// A handle whose chunks and result are already known.
    pub(crate) fn completed(result: CommandResult, chunks: Vec<OutputChunk>) -> Self {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        for chunk in chunks {
            let _ = chunk_tx.send(chunk);
        }
        let (done_tx, done_rx) = oneshot::channel();
        let _ = done_tx.send(result);
        Self::new(chunk_rx, done_rx, Canceller::new())
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        self.chunks.recv().await
    }

    pub async fn wait(&mut self) -> CommandResult {
        if let Some(result) = &self.finished {
            return result.clone();
        }
        let result = match (&mut self.completion).await {
            Ok(result) => result,
            Err(_) => CommandResult::failure(
                FailureReason::Cancelled,
                "command supervisor stopped before reporting a result",
            ),
        };
        self.finished = Some(result.clone());
        result
    }

    /// Feeds every chunk to `on_chunk` as it arrives, then returns the final result.
    pub async fn collect<F>(&mut self, mut on_chunk: F) -> CommandResult
    where
        F: FnMut(&OutputChunk),
    {
        while let Some(chunk) = self.next_chunk().await {
            on_chunk(&chunk);
        }
        self.wait().await
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.finished.is_none() {
            self.canceller.cancel();
        }
    }
}

pub(crate) struct Supervision {
    pub child: Child,
    pub spec: CommandSpec,
    pub kind: InvocationKind,
    pub ctx: Arc<RuntimeContext>,
    pub recorder: Option<Arc<FixtureRecorder>>,
    pub chunk_tx: mpsc::UnboundedSender<OutputChunk>,
    pub cancel: Arc<Notify>,
    pub completion_tx: oneshot::Sender<CommandResult>,
}

enum Outcome {
    Exited(ExitStatus),
    Cancelled,
    IdleTimeout,
    TimedOut,
    WaitFailed(String),
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn spawn_reader<R>(stream: R, kind: StreamKind, tx: mpsc::UnboundedSender<OutputChunk>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buffer = vec![0_u8; READ_CHUNK_BYTES];
        let mut pending = Vec::new();
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(size) => {
                    pending.extend_from_slice(&buffer[..size]);
                    let text = decode_utf8_prefix(&mut pending);
                    if !text.is_empty() && tx.send(OutputChunk { stream: kind, data: text }).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::debug!(stream = kind.as_str(), %error, "output read failed");
                    break;
                }
            }
        }
        if !pending.is_empty() {
            let _ = tx.send(OutputChunk {
                stream: kind,
                data: String::from_utf8_lossy(&pending).to_string(),
            });
        }
    })
}

/// Drains the longest decodable prefix, keeping a trailing partial code point for the next read.
fn decode_utf8_prefix(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending.as_slice()) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(error) if error.error_len().is_none() => {
            let valid = error.valid_up_to();
            let rest = pending.split_off(valid);
            let text = String::from_utf8_lossy(pending.as_slice()).to_string();
            *pending = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending.as_slice()).to_string();
            pending.clear();
            text
        }
    }
}

struct Capture {
    ctx: Arc<RuntimeContext>,
    spec: CommandSpec,
    stdout: String,
    stderr: String,
    chunks: Vec<OutputChunk>,
    keep_chunks: bool,
    out_lines: LineSplitter,
    err_lines: LineSplitter,
}

impl Capture {
    fn new(ctx: Arc<RuntimeContext>, spec: CommandSpec, keep_chunks: bool) -> Self {
        Self {
            ctx,
            spec,
            stdout: String::new(),
            stderr: String::new(),
            chunks: Vec::new(),
            keep_chunks,
            out_lines: LineSplitter::new(Some(MAX_PENDING_LINE_BYTES)),
            err_lines: LineSplitter::new(Some(MAX_PENDING_LINE_BYTES)),
        }
    }

    fn accept(&mut self, chunk: &OutputChunk) {
        let lines = match chunk.stream {
            StreamKind::Stdout => {
                self.stdout.push_str(&chunk.data);
                self.out_lines.push(&chunk.data)
            }
            StreamKind::Stderr => {
                self.stderr.push_str(&chunk.data);
                self.err_lines.push(&chunk.data)
            }
        };
        if self.keep_chunks {
            self.chunks.push(chunk.clone());
        }
        for line in lines {
            self.inspect_line(chunk.stream, &line);
        }
    }

    fn inspect_line(&self, stream: StreamKind, line: &str) {
        let clean = sanitize_terminal_text(line);
        if clean.trim().is_empty() {
            return;
        }
        self.ctx.scan_output(self.spec.hint_scope, &clean);
        tracing::debug!(stream = stream.as_str(), "{}", self.ctx.redact(&clean));
    }

    fn finish(&mut self) {
        for (stream, rest) in [
            (StreamKind::Stdout, self.out_lines.finish()),
            (StreamKind::Stderr, self.err_lines.finish()),
        ] {
            if let Some(rest) = rest {
                self.inspect_line(stream, &rest);
            }
        }
        let dropped = self.out_lines.take_dropped_bytes() + self.err_lines.take_dropped_bytes();
        if dropped > 0 {
            tracing::debug!(bytes = dropped, "overlong output line trimmed before inspection");
        }
    }
}

/// Drives one spawned child to completion, forwarding chunks and enforcing deadlines.
pub(crate) async fn supervise(job: Supervision) {
    let Supervision {
        mut child,
        spec,
        kind,
        ctx,
        recorder,
        chunk_tx,
        cancel,
        completion_tx,
    } = job;

    if let Some(payload) = spec.stdin.clone() {
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                if let Err(error) = stdin.write_all(payload.as_bytes()).await {
                    tracing::debug!(%error, "failed to write stdin");
                }
                let _ = stdin.shutdown().await;
            });
        }
    }

    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, StreamKind::Stdout, internal_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, StreamKind::Stderr, internal_tx.clone()));
    }
    drop(internal_tx);

    let mut capture = Capture::new(ctx.clone(), spec.clone(), recorder.is_some());
    let started = Instant::now();
    let total_deadline = spec.timeout.map(|limit| started + limit);
    let mut last_activity = started;
    let mut readers_open = true;
    let mut exit_status: Option<ExitStatus> = None;
    let mut drain_deadline: Option<Instant> = None;

    let outcome = loop {
        if let (Some(status), false) = (exit_status, readers_open) {
            break Outcome::Exited(status);
        }
        let idle_deadline = spec.idle_timeout.map(|limit| last_activity + limit);

        tokio::select! {
            _ = cancel.notified() => break Outcome::Cancelled,
            received = internal_rx.recv(), if readers_open => match received {
                Some(chunk) => {
                    last_activity = Instant::now();
                    capture.accept(&chunk);
                    let _ = chunk_tx.send(chunk);
                }
                None => readers_open = false,
            },
            status = child.wait(), if exit_status.is_none() => match status {
                Ok(status) => {
                    exit_status = Some(status);
                    drain_deadline = Some(Instant::now() + DRAIN_GRACE);
                }
                Err(error) => break Outcome::WaitFailed(error.to_string()),
            },
            _ = sleep_until_opt(drain_deadline) => {
                if let Some(status) = exit_status {
                    tracing::debug!("output pipes still open after exit; finishing without them");
                    break Outcome::Exited(status);
                }
            },
            _ = sleep_until_opt(idle_deadline), if exit_status.is_none() => break Outcome::IdleTimeout,
            _ = sleep_until_opt(total_deadline), if exit_status.is_none() => break Outcome::TimedOut,
        }
    };

    if !matches!(outcome, Outcome::Exited(_)) {
        terminate_then_kill(&mut child, CANCEL_GRACE).await;
    }
    while let Ok(chunk) = internal_rx.try_recv() {
        capture.accept(&chunk);
        let _ = chunk_tx.send(chunk);
    }
    for reader in readers {
        reader.abort();
    }
    capture.finish();

    let (succeeded, exit_code, reason, note) = match outcome {
        Outcome::Exited(status) => (status.success(), exit_code_of(&status), None, None),
        Outcome::Cancelled => (false, EXIT_CANCELLED, Some(FailureReason::Cancelled), Some("command cancelled".to_string())),
        Outcome::IdleTimeout => (
            false,
            EXIT_TIMED_OUT,
            Some(FailureReason::IdleTimeout),
            spec.idle_timeout.map(|limit| format!("no output for {}ms; command aborted", limit.as_millis())),
        ),
        Outcome::TimedOut => (
            false,
            EXIT_TIMED_OUT,
            Some(FailureReason::TimedOut),
            spec.timeout.map(|limit| format!("command timed out after {}ms", limit.as_millis())),
        ),
        Outcome::WaitFailed(error) => (false, 1, Some(FailureReason::SpawnFailed), Some(format!("failed to wait for process: {}", error))),
    };

    let mut stderr = std::mem::take(&mut capture.stderr);
    if let Some(note) = note {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&note);
    }
    let result = CommandResult {
        succeeded,
        exit_code,
        stdout: std::mem::take(&mut capture.stdout),
        stderr,
        reason,
    };

    tracing::debug!(
        exit_code = result.exit_code,
        succeeded = result.succeeded,
        reason = ?result.reason,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "command finished"
    );

    if let Some(recorder) = recorder {
        recorder.append(&ReplayEvent {
            kind,
            command: spec.command.clone(),
            cwd: Some(spec.working_dir.display().to_string()),
            result: result.clone(),
            chunks: std::mem::take(&mut capture.chunks),
        });
    }

    drop(chunk_tx);
    let _ = completion_tx.send(result);
}

#[cfg(test)]
mod tests {
    use super::{decode_utf8_prefix, OutputChunk, StreamHandle, StreamKind};
    use crate::executor::CommandResult;

    #[test]
    fn keeps_partial_code_point_for_next_read() {
        let bytes = "né".as_bytes();
        let mut pending = bytes[..2].to_vec();
        assert_eq!(decode_utf8_prefix(&mut pending), "n");
        assert_eq!(pending.len(), 1);
        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(decode_utf8_prefix(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[test]
    fn chunk_stream_tags_serialize_short() {
        let json = serde_json::to_string(&OutputChunk::stderr("x")).expect("serialize");
        assert_eq!(json, r#"{"stream":"err","data":"x"}"#);
        assert_eq!(StreamKind::Stdout.as_str(), "stdout");
    }

    #[tokio::test]
    async fn completed_handle_replays_chunks_then_result() {
        let result = CommandResult {
            succeeded: true,
            exit_code: 0,
            stdout: "a".to_string(),
            stderr: String::new(),
            reason: None,
        };
        let mut handle = StreamHandle::completed(result.clone(), vec![OutputChunk::stdout("a")]);
        let mut seen = Vec::new();
        let final_result = handle.collect(|chunk| seen.push(chunk.data.clone())).await;
        assert_eq!(seen, vec!["a".to_string()]);
        assert_eq!(final_result, result);
        assert_eq!(handle.wait().await, result);
    }
}
