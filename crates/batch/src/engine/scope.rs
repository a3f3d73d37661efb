//! Cancellation scopes
//!
//! A scope pairs a cancellation token with a deadline. Scopes nest
//! caller → batch → item: a child's deadline never outlives its parent's and
//! cancelling a parent token cancels every child token.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::ItemError;

/// Roughly thirty years, used when a timeout would overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Why a scope ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    /// The scope's deadline elapsed
    Deadline,
    /// The caller cancelled, or the scope was torn down
    Cancelled,
}

impl From<Interrupt> for ItemError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Deadline => ItemError::Timeout,
            Interrupt::Cancelled => ItemError::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Scope {
    caller: CancellationToken,
    token: CancellationToken,
    deadline: Instant,
}

impl Scope {
    /// Batch scope derived from the caller's token
    pub(crate) fn root(caller: &CancellationToken, timeout: Duration) -> Self {
        Self {
            caller: caller.clone(),
            token: caller.child_token(),
            deadline: deadline_after(timeout),
        }
    }

    /// Nested scope that ends no later than this one
    pub(crate) fn child(&self, timeout: Duration) -> Self {
        Self {
            caller: self.caller.clone(),
            token: self.token.child_token(),
            deadline: self.deadline.min(deadline_after(timeout)),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Non-blocking check; caller cancellation wins over the deadline
    pub(crate) fn check(&self) -> Option<Interrupt> {
        if self.caller.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(Interrupt::Deadline)
        } else if self.token.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else {
            None
        }
    }

    /// Resolves once the scope ends
    pub(crate) async fn done(&self) -> Interrupt {
        tokio::select! {
            biased;
            _ = self.caller.cancelled() => Interrupt::Cancelled,
            _ = sleep_until(self.deadline) => Interrupt::Deadline,
            _ = self.token.cancelled() => self.check().unwrap_or(Interrupt::Cancelled),
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses() {
        let caller = CancellationToken::new();
        let scope = Scope::root(&caller, Duration::from_secs(5));
        assert_eq!(scope.check(), None);
        assert_eq!(scope.done().await, Interrupt::Deadline);
        assert_eq!(scope.check(), Some(Interrupt::Deadline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_never_outlives_parent() {
        let caller = CancellationToken::new();
        let batch = Scope::root(&caller, Duration::from_secs(1));
        let item = batch.child(Duration::from_secs(60));

        let started = Instant::now();
        assert_eq!(item.done().await, Interrupt::Deadline);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_caller_cancellation_propagates() {
        let caller = CancellationToken::new();
        let batch = Scope::root(&caller, Duration::from_secs(60));
        let item = batch.child(Duration::from_secs(60));

        caller.cancel();
        assert_eq!(item.done().await, Interrupt::Cancelled);
        assert!(item.token().is_cancelled());
        assert!(batch.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelling_child_leaves_parent_running() {
        let caller = CancellationToken::new();
        let batch = Scope::root(&caller, Duration::from_secs(60));
        let item = batch.child(Duration::from_secs(60));

        item.cancel();
        assert_eq!(item.done().await, Interrupt::Cancelled);
        assert_eq!(batch.check(), None);
    }

    #[test]
    fn test_interrupt_maps_to_item_error() {
        assert!(ItemError::from(Interrupt::Deadline).is_timeout());
        assert!(ItemError::from(Interrupt::Cancelled).is_cancelled());
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow() {
        let caller = CancellationToken::new();
        let scope = Scope::root(&caller, Duration::MAX);
        assert_eq!(scope.check(), None);
    }
}
