//! Cancellation and deadline propagation.
//!
//! Every suspending operation takes a [`Context`]. Long-running operations
//! (enumeration, replication fan-out, synchronization) check it before each
//! I/O call, before each channel send, and between loop iterations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};

/// A cancellation signal plus an optional deadline.
///
/// Contexts form a tree: a child is cancelled whenever its parent is, and
/// inherits the parent's deadline unless it sets an earlier one. Cloning a
/// context shares its signal.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A fresh root context with no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A child context, cancelled when `self` is.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A child context whose deadline is at most `at`.
    pub fn with_deadline(&self, at: Instant) -> Self {
        let deadline = match self.deadline {
            Some(d) if d < at => d,
            _ => at,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` once cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// `Ok(())` while the context is live, else the reason it is not.
    pub fn check(&self) -> StoreResult<()> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn err(&self) -> Option<StoreError> {
        if self.token.is_cancelled() {
            return Some(StoreError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(StoreError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> StoreError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => StoreError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => StoreError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                StoreError::Cancelled
            }
        }
    }

    /// Race `fut` against this context.
    ///
    /// If the context finishes first, `fut` is dropped and the cancellation
    /// error is returned.
    pub async fn run<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => out,
        }
    }
}
