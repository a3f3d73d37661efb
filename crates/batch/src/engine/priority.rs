//! Priority dispatch order
//!
//! Items are started highest priority first. Equal priorities start in
//! submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

/// Item paired with its dispatch priority (higher starts first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrioritizedItem<T> {
    pub item: T,
    pub priority: i64,
}

impl<T> PrioritizedItem<T> {
    pub fn new(item: T, priority: i64) -> Self {
        Self { item, priority }
    }
}

impl<T> From<(T, i64)> for PrioritizedItem<T> {
    fn from((item, priority): (T, i64)) -> Self {
        Self::new(item, priority)
    }
}

struct Entry<T> {
    index: usize,
    priority: i64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on priority, then lowest index first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Max-heap of items keyed by priority, remembering original positions
pub(crate) struct PriorityQueue<T> {
    heap: BinaryHeap<Entry<T>>,
}

impl<T> PriorityQueue<T> {
    pub(crate) fn from_items(items: Vec<PrioritizedItem<T>>) -> Self {
        let heap = items
            .into_iter()
            .enumerate()
            .map(|(index, p)| Entry {
                index,
                priority: p.priority,
                item: p.item,
            })
            .collect();
        Self { heap }
    }

    /// Next `(index, item)` to dispatch
    pub(crate) fn pop(&mut self) -> Option<(usize, T)> {
        self.heap.pop().map(|entry| (entry.index, entry.item))
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Original indices of everything still queued
    pub(crate) fn into_indices(self) -> Vec<usize> {
        self.heap.into_iter().map(|entry| entry.index).collect()
    }
}
