use once_cell::sync::Lazy;
use std::collections::VecDeque;

static ANSI_ESCAPE_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex")
});

const MAX_TAIL_BYTES: usize = 2 * 1024 * 1024;
const MAX_TAIL_LINES: usize = 4_000;
pub const MAX_PENDING_LINE_BYTES: usize = 2_000_000;

/// Splits streamed text into complete lines, keeping the unterminated remainder.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: String,
    max_pending_bytes: Option<usize>,
    dropped_bytes: usize,
}

impl LineSplitter {
    pub fn new(max_pending_bytes: Option<usize>) -> Self {
        Self {
            pending: String::new(),
            max_pending_bytes,
            dropped_bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        if let Some(max) = self.max_pending_bytes {
            if self.pending.len() > max {
                let mut excess = self.pending.len() - max;
                while !self.pending.is_char_boundary(excess) {
                    excess += 1;
                }
                self.pending.drain(..excess);
                self.dropped_bytes = self.dropped_bytes.saturating_add(excess);
            }
        }

        let mut lines = Vec::new();
        while let Some(idx) = self.pending.find(['\n', '\r']) {
            let line = self.pending[..idx].to_string();
            let advance = if self.pending[idx..].starts_with("\r\n") { 2 } else { 1 };
            self.pending.drain(..idx + advance);
            lines.push(line);
        }
        lines
    }

    pub fn take_dropped_bytes(&mut self) -> usize {
        std::mem::take(&mut self.dropped_bytes)
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

/// Bounded ring of the most recent output lines.
#[derive(Debug, Default)]
pub struct OutputTail {
    lines: VecDeque<String>,
    total_bytes: usize,
}

impl OutputTail {
    pub fn from_text(text: &str) -> Self {
        let mut tail = Self::default();
        for line in text.lines() {
            tail.push(line.to_string());
        }
        tail
    }

    pub fn push(&mut self, line: String) {
        let line_len = line.len();
        self.lines.push_back(line);
        self.total_bytes = self.total_bytes.saturating_add(line_len);

        while self.lines.len() > MAX_TAIL_LINES || self.total_bytes > MAX_TAIL_BYTES {
            if let Some(removed) = self.lines.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(removed.len());
            } else {
                break;
            }
        }
    }

    pub fn last(&self, count: usize) -> String {
        let skip = self.lines.len().saturating_sub(count);
        self.lines
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

pub fn sanitize_terminal_text(value: &str) -> String {
    let stripped = ANSI_ESCAPE_RE.replace_all(value, "");
    stripped.replace('\r', "")
}

/// Last `count` non-blank lines of `text` with terminal escapes removed.
pub fn tail_lines(text: &str, count: usize) -> String {
    let mut tail = OutputTail::default();
    for line in text.lines() {
        let clean = sanitize_terminal_text(line);
        if !clean.trim().is_empty() {
            tail.push(clean);
        }
    }
    tail.last(count)
}
