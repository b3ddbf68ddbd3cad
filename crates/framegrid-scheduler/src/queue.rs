//! Priority queue of render tasks awaiting placement.
//!
//! Ordered by priority weight (highest first), then creation time (oldest
//! first), then insertion sequence. Backed by a `BTreeMap` so removal of an
//! arbitrary task is O(log n) and iteration is always in placement order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use framegrid_state::{RenderTask, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    weight: Reverse<u8>,
    created_at: u64,
    seq: u64,
}

/// Tasks waiting for a node, in placement order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: BTreeMap<QueueKey, TaskId>,
    index: HashMap<TaskId, QueueKey>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. Returns false if it is already queued.
    pub fn push(&mut self, task: &RenderTask) -> bool {
        if self.index.contains_key(&task.id) {
            return false;
        }
        let key = QueueKey {
            weight: Reverse(task.priority.weight()),
            created_at: task.created_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, task.id.clone());
        self.index.insert(task.id.clone(), key);
        true
    }

    /// Remove a task. Returns false if it was not queued.
    pub fn remove(&mut self, task_id: &str) -> bool {
        match self.index.remove(task_id) {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.index.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Task ids in placement order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskId> {
        self.entries.values()
    }

    /// Owned copy of the queue order, for iterating while mutating.
    pub fn snapshot(&self) -> Vec<TaskId> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
