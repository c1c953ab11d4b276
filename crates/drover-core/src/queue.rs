//! Delayed ready-queue with exponential-backoff requeueing.
//!
//! The queue is keyed by issue id (at most one entry per issue) and keeps
//! insertion order. Dequeue returns the first entry whose `next_attempt_at`
//! has passed: FIFO among ready entries, with delayed entries skipped in
//! place. A requeue overwrites the existing entry at its original position,
//! so a retried task does not jump the line when it becomes ready again.
//!
//! Pure in-memory structure; every operation is total.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::model::Task;

/// One queued task with its retry schedule. Epoch-millisecond timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub task: Task,
    #[serde(default)]
    pub retry_count: u32,
    pub next_attempt_at: i64,
    pub enqueued_at: i64,
}

/// Insertion-ordered keyed queue of [`QueueEntry`].
pub struct ReadyQueue {
    /// Insertion-ordered; issue ids are unique. Linear scans are fine at
    /// this scale (the queue holds at most a few dozen entries).
    entries: Vec<QueueEntry>,
    clock: Arc<dyn Clock>,
    retry_base_delay_ms: u64,
}

impl ReadyQueue {
    pub fn new(clock: Arc<dyn Clock>, retry_base_delay_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            clock,
            retry_base_delay_ms,
        }
    }

    /// Backoff delay for the given retry count: `base * 2^(retry_count - 1)`.
    fn backoff_ms(&self, retry_count: u32) -> i64 {
        let exponent = retry_count.saturating_sub(1).min(31);
        (self.retry_base_delay_ms as i64).saturating_mul(1_i64 << exponent)
    }

    fn position(&self, issue_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.task.issue_id == issue_id)
    }

    /// Insert a fresh entry, ready immediately.
    ///
    /// Returns `false` without modifying the queue if an entry for the same
    /// issue already exists.
    pub fn enqueue(&mut self, task: Task) -> bool {
        self.enqueue_delayed(task, 0)
    }

    /// Insert a fresh entry (retry count 0) that becomes ready only after
    /// `delay_ms`. Used to park budget-blocked tasks so the processing
    /// timer does not spin on an unadmittable head entry.
    pub fn enqueue_delayed(&mut self, task: Task, delay_ms: i64) -> bool {
        if self.position(&task.issue_id).is_some() {
            return false;
        }
        let now = self.clock.now_ms();
        self.entries.push(QueueEntry {
            task,
            retry_count: 0,
            next_attempt_at: now + delay_ms,
            enqueued_at: now,
        });
        true
    }

    /// Schedule a retry with exponential backoff.
    ///
    /// Overwrites any existing entry for the issue at its current position;
    /// if the issue is not queued, the entry is appended.
    pub fn requeue(&mut self, task: Task, retry_count: u32) {
        let now = self.clock.now_ms();
        let entry = QueueEntry {
            task,
            retry_count,
            next_attempt_at: now + self.backoff_ms(retry_count),
            enqueued_at: now,
        };
        match self.position(&entry.task.issue_id) {
            Some(index) => self.entries[index] = entry,
            None => self.entries.push(entry),
        }
    }

    /// Remove and return the first entry that is ready, or `None` when no
    /// entry is ready yet (delayed entries keep their slot).
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        let now = self.clock.now_ms();
        let index = self.entries.iter().position(|e| e.next_attempt_at <= now)?;
        Some(self.entries.remove(index))
    }

    /// Remove the entry for an issue. Returns whether one existed.
    pub fn remove(&mut self, issue_id: &str) -> bool {
        match self.position(issue_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, issue_id: &str) -> bool {
        self.position(issue_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Independent snapshot of the current entries, in queue order. Also the
    /// persisted representation.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.clone()
    }

    /// Restore entries from a persisted snapshot.
    ///
    /// Entries are inserted keyed by issue id; a duplicate overwrites the
    /// earlier occurrence at its position, so the last one wins.
    pub fn hydrate(&mut self, saved: Vec<QueueEntry>) {
        for entry in saved {
            match self.position(&entry.task.issue_id) {
                Some(index) => self.entries[index] = entry,
                None => self.entries.push(entry),
            }
        }
    }
}
