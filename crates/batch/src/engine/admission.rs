//! Admission control for top-level batch calls
//!
//! Tracks how many items are pending across all calls and how many calls are
//! in flight. Calls are rejected once shutdown has begun or when admitting the
//! whole batch would push pending items past the threshold.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::BatchError;

/// Shared admission state of one processor
#[derive(Debug)]
pub(crate) struct AdmissionControl {
    /// Maximum pending items (0 = unlimited)
    threshold: usize,
    accepting: AtomicBool,
    pending: AtomicUsize,
    active_calls: AtomicUsize,
    drained: Notify,
}

impl AdmissionControl {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            threshold,
            accepting: AtomicBool::new(true),
            pending: AtomicUsize::new(0),
            active_calls: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Admit a call carrying `items` items
    ///
    /// The call is registered as active before the accepting flag is read so
    /// that a concurrent shutdown either sees it or rejects it.
    pub(crate) fn admit(self: &Arc<Self>, items: usize) -> Result<AdmissionGuard, BatchError> {
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = AdmissionGuard {
            control: Arc::clone(self),
            items: 0,
        };

        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BatchError::Shutdown);
        }

        if self.threshold == 0 {
            self.pending.fetch_add(items, Ordering::SeqCst);
        } else {
            let threshold = self.threshold;
            self.pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                    pending
                        .checked_add(items)
                        .filter(|total| *total <= threshold)
                })
                .map_err(|pending| BatchError::Backpressure {
                    pending,
                    requested: items,
                    threshold,
                })?;
        }
        guard.items = items;

        Ok(guard)
    }

    /// Stop admitting calls; returns false if already stopped
    pub(crate) fn stop_accepting(&self) -> bool {
        self.accepting.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    /// Wait until no call is in flight
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active_calls() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, items: usize) {
        if items > 0 {
            self.pending.fetch_sub(items, Ordering::SeqCst);
        }
        if self.active_calls.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Releases a call's admission on drop
#[derive(Debug)]
pub(crate) struct AdmissionGuard {
    control: Arc<AdmissionControl>,
    items: usize,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.control.release(self.items);
    }
}
