//! Bounded append-only logs.
//!
//! Used for coordination events, optimization records and error records.
//! When full, the oldest entry is evicted.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> BoundedLog<T> {
    /// Create a log holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry);
    }

    /// The most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &T> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries dropped so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Sequence number the next pushed entry will get.
    ///
    /// Every entry ever pushed has a sequence number, counting from zero,
    /// that survives eviction of older entries.
    pub fn next_seq(&self) -> u64 {
        self.evicted + self.entries.len() as u64
    }

    /// Retained entries with a sequence number of at least `seq`, oldest
    /// first.
    pub fn since(&self, seq: u64) -> impl Iterator<Item = &T> {
        let skip = seq
            .saturating_sub(self.evicted)
            .min(self.entries.len() as u64) as usize;
        self.entries.iter().skip(skip)
    }
}

impl<T: Clone> BoundedLog<T> {
    pub fn recent_cloned(&self, n: usize) -> Vec<T> {
        self.recent(n).cloned().collect()
    }

    pub fn since_cloned(&self, seq: u64) -> Vec<T> {
        self.since(seq).cloned().collect()
    }
}
