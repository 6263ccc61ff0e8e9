use std::time::Duration;

use snapshot_wire::Snapshot;
use tokio::time::Instant;

pub const DEFAULT_CHAR_THRESHOLD: usize = 100;
pub const DEFAULT_TIME_THRESHOLD: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Pending changed characters that force an immediate flush.
    pub char_threshold: usize,
    /// Age of the oldest pending change that forces a flush.
    pub time_threshold: Duration,
    /// Longest flush text, in chars. Older content is dropped first.
    pub max_chunk_size: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            char_threshold: DEFAULT_CHAR_THRESHOLD,
            time_threshold: DEFAULT_TIME_THRESHOLD,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Time,
    /// Pending batch handed over when the pipeline shuts down.
    Drain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushEvent {
    pub text: String,
    pub line_count: usize,
    pub char_count: usize,
    pub trigger: FlushTrigger,
    pub truncated: bool,
}

/// Turns a snapshot stream into batched text deltas.
///
/// Lines are compared by index against the previous snapshot; there is no
/// real diffing, so a scrolled screen reports every shifted line as changed
/// and a cursor-only update reports nothing.
#[derive(Debug)]
pub struct ChangeAccumulator {
    policy: BatchPolicy,
    previous_lines: Vec<String>,
    pending_lines: Vec<String>,
    pending_chars: usize,
    oldest_pending: Option<Instant>,
}

impl ChangeAccumulator {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            previous_lines: Vec::new(),
            pending_lines: Vec::new(),
            pending_chars: 0,
            oldest_pending: None,
        }
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_lines.is_empty()
    }

    pub fn pending_chars(&self) -> usize {
        self.pending_chars
    }

    pub fn consume(&mut self, snapshot: &Snapshot, now: Instant) -> Option<FlushEvent> {
        let lines = snapshot.lines();
        let mut changed_chars = 0;
        let mut changed = Vec::new();
        for index in 0..lines.len().max(self.previous_lines.len()) {
            let current = lines.get(index).map(String::as_str);
            if self.previous_lines.get(index).map(String::as_str) == current {
                continue;
            }
            let current = current.unwrap_or("");
            let len = current.chars().count();
            changed_chars += len;
            if len > 0 {
                changed.push(current.to_string());
            }
        }
        self.previous_lines = lines;

        if changed_chars == 0 {
            return None;
        }

        self.pending_lines.extend(changed);
        self.pending_chars += changed_chars;
        self.oldest_pending.get_or_insert(now);

        if self.pending_chars >= self.policy.char_threshold {
            return self.flush(FlushTrigger::Size);
        }
        self.poll(now)
    }

    /// Time-path check for when no snapshot has arrived.
    pub fn poll(&mut self, now: Instant) -> Option<FlushEvent> {
        let oldest = self.oldest_pending?;
        if self.has_pending() && now.saturating_duration_since(oldest) >= self.policy.time_threshold {
            return self.flush(FlushTrigger::Time);
        }
        None
    }

    pub fn drain(&mut self) -> Option<FlushEvent> {
        self.flush(FlushTrigger::Drain)
    }

    pub fn reset(&mut self) {
        self.previous_lines.clear();
        self.clear_pending();
    }

    fn flush(&mut self, trigger: FlushTrigger) -> Option<FlushEvent> {
        if !self.has_pending() {
            return None;
        }
        let line_count = self.pending_lines.len();
        let char_count = self.pending_chars;
        let joined = self.pending_lines.join("\n");
        let (text, truncated) = keep_tail(joined, self.policy.max_chunk_size);
        self.clear_pending();
        Some(FlushEvent {
            text,
            line_count,
            char_count,
            trigger,
            truncated,
        })
    }

    fn clear_pending(&mut self) {
        self.pending_lines.clear();
        self.pending_chars = 0;
        self.oldest_pending = None;
    }
}

fn keep_tail(text: String, max_chars: usize) -> (String, bool) {
    let total = text.chars().count();
    if total <= max_chars {
        return (text, false);
    }
    let start = text
        .char_indices()
        .nth(total - max_chars)
        .map_or(text.len(), |(index, _)| index);
    (text[start..].to_string(), true)
}
