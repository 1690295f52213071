//! Priority queue for pending downloads.
//!
//! A min-heap keyed on `(priority, inserted_at, seq)`: lower priority values
//! dispatch first, ties resolve to the earlier insertion. The heap itself is
//! pure state with no locking; the registry serializes all access to it.
//!
//! Cancellation is lazy: a cancelled id stays in the heap and is discarded by
//! the registry at pop time, which keeps cancel O(1).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// One heap entry. `seq` is a monotonic insertion counter that keeps
/// FIFO-within-priority strict even when two inserts share a timestamp.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub priority: i32,
    pub inserted_at: DateTime<Utc>,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    // Reversed so that BinaryHeap's max-heap pops the smallest key first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.inserted_at.cmp(&self.inserted_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
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

    /// Inserts an id with the given priority, stamping the insertion time.
    pub fn push(&mut self, id: String, priority: i32) -> DateTime<Utc> {
        let inserted_at = Utc::now();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            id,
            priority,
            inserted_at,
            seq,
        });
        inserted_at
    }

    /// Pops the entry with the smallest `(priority, inserted_at)` key.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop()
    }

    /// Retunes a single entry's priority in place. O(n) locate plus an O(n)
    /// rebuild. Returns false when the id is not in the heap.
    pub fn update_priority(&mut self, id: &str, priority: i32) -> bool {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let mut found = false;
        for entry in &mut entries {
            if entry.id == id {
                entry.priority = priority;
                found = true;
            }
        }
        self.heap = BinaryHeap::from(entries);
        found
    }

    /// Applies a bulk priority update, then re-heapifies once.
    pub fn reorder(&mut self, priorities: &HashMap<String, i32>) {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        for entry in &mut entries {
            if let Some(&priority) = priorities.get(&entry.id) {
                entry.priority = priority;
            }
        }
        self.heap = BinaryHeap::from(entries);
    }

    /// Snapshot of the heap contents in dispatch order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<_> = self.heap.iter().cloned().collect();
        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.inserted_at.cmp(&b.inserted_at))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        entries
    }
}
