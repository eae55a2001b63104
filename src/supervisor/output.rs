//! Bounded in-memory output retained per job.

use std::collections::VecDeque;

use chrono::{DateTime, Local};

/// Most recent lines of a job's output, each stamped `[HH:MM:SS] `.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    /// Lines ever pushed; survives `clear` and wraparound.
    pushed: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            pushed: 0,
        }
    }

    pub fn push(&mut self, at: DateTime<Local>, content: &str) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines
            .push_back(format!("[{}] {}", at.format("%H:%M:%S"), content));
        self.pushed += 1;
    }

    /// Up to `max` lines, oldest first.
    pub fn tail(&self, max: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(max);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Up to `max` lines, newest first.
    pub fn newest(&self, max: usize) -> Vec<String> {
        self.lines.iter().rev().take(max).cloned().collect()
    }

    /// Lines pushed after `cursor` that are still buffered, oldest first,
    /// plus the cursor to pass next time. Lines that wrapped out before
    /// being read are counted in `skipped`.
    pub fn since(&self, cursor: u64) -> OutputChunk {
        let unread = self.pushed.saturating_sub(cursor);
        let available = (self.lines.len() as u64).min(unread);
        let skip = self.lines.len() - available as usize;
        OutputChunk {
            lines: self.lines.iter().skip(skip).cloned().collect(),
            skipped: unread - available,
            cursor: self.pushed,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.pushed
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Result of [`OutputBuffer::since`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChunk {
    pub lines: Vec<String>,
    pub skipped: u64,
    pub cursor: u64,
}
