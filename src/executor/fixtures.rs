use super::stream::OutputChunk;
use super::CommandResult;
use crate::context::lock_unpoisoned;
use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationKind {
    Buffered,
    Streamed,
}

/// One recorded invocation, stored as a single NDJSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayEvent {
    pub kind: InvocationKind,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(flatten)]
    pub result: CommandResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<OutputChunk>,
}

impl ReplayEvent {
    /// Chunks to replay; buffered recordings are replayed as one chunk per stream.
    pub fn replay_chunks(&self) -> Vec<OutputChunk> {
        if !self.chunks.is_empty() {
            return self.chunks.clone();
        }
        let mut chunks = Vec::new();
        if !self.result.stdout.is_empty() {
            chunks.push(OutputChunk::stdout(self.result.stdout.clone()));
        }
        if !self.result.stderr.is_empty() {
            chunks.push(OutputChunk::stderr(self.result.stderr.clone()));
        }
        chunks
    }
}

#[derive(Debug)]
pub struct FixtureRecorder {
    path: PathBuf,
    file: Mutex<File>,
}

impl FixtureRecorder {
    pub fn create(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &ReplayEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(%error, "failed to serialize fixture event");
                return;
            }
        };
        let mut file = lock_unpoisoned(&self.file);
        if let Err(error) = writeln!(file, "{}", line) {
            tracing::warn!(%error, path = %self.path.display(), "failed to append fixture event");
        }
    }
}

/// Recorded events consumed strictly in file order.
#[derive(Debug)]
pub struct ReplaySession {
    events: Mutex<VecDeque<ReplayEvent>>,
}

impl ReplaySession {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Io(format!("failed to read fixtures {}: {}", path.display(), error)))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        let mut events = VecDeque::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: ReplayEvent = serde_json::from_str(line).map_err(|error| {
                AppError::Config(format!("fixture line {} is invalid: {}", index + 1, error))
            })?;
            events.push_back(event);
        }
        Ok(Self {
            events: Mutex::new(events),
        })
    }

    pub fn next(&self, expected: InvocationKind, command: &str) -> Option<ReplayEvent> {
        let event = lock_unpoisoned(&self.events).pop_front()?;
        if event.kind != expected {
            tracing::debug!(
                recorded = ?event.kind,
                requested = ?expected,
                command,
                "replaying fixture with mismatched invocation kind"
            );
        }
        Some(event)
    }

    pub fn remaining(&self) -> usize {
        lock_unpoisoned(&self.events).len()
    }
}
