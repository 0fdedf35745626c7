//! Max-priority queue of inactive stream ids.
//!
//! Ordering is `(priority, insertion sequence)`: the highest priority pops
//! first and, at equal priority, the most recently inserted entry wins.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// One queued stream.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub stream_id: String,
    pub priority: f64,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Priority queue with O(1) membership checks.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
    members: HashSet<String>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.members.contains(stream_id)
    }

    /// Insert a stream id. Returns `false` (and leaves the queue untouched)
    /// when the id is already queued.
    pub fn push(&mut self, stream_id: impl Into<String>, priority: f64) -> bool {
        let stream_id = stream_id.into();
        if !self.members.insert(stream_id.clone()) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            stream_id,
            priority,
            seq,
        });
        true
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        let entry = self.heap.pop()?;
        self.members.remove(&entry.stream_id);
        Some(entry)
    }

    pub fn peek(&self) -> Option<&QueueEntry> {
        self.heap.peek()
    }

    /// Remove a stream id wherever it sits in the queue.
    pub fn remove(&mut self, stream_id: &str) -> bool {
        if !self.members.remove(stream_id) {
            return false;
        }
        self.heap.retain(|entry| entry.stream_id != stream_id);
        true
    }

    /// Stream ids in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    /// Entries in the order they would pop.
    pub fn ordered(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.heap.iter().cloned().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.members.clear();
    }
}
