//! Per call context
//!
//! A [`CallContext`] is created by [`Accepting::read_first`](crate::server::Accepting::read_first) when
//! a call begins and lives until the call terminates. Handlers and interceptors
//! read it, the server owns it.
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{status::Status, transport::LocalAddr};

/// Metadata for a single call
#[derive(Debug, Clone)]
pub struct CallContext {
    method: &'static str,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    local_addr: Option<LocalAddr>,
}

impl CallContext {
    /// Create a new context for the given method
    ///
    /// The call is cancelled when `cancel` is cancelled.
    pub fn new(method: &'static str, cancel: CancellationToken) -> Self {
        Self {
            method,
            cancel,
            deadline: None,
            local_addr: None,
        }
    }

    /// Set the deadline of the call to `timeout` from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Set the deadline of the call
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the local address the call was accepted on
    pub fn with_local_addr(mut self, addr: LocalAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// The method identifier
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The local address the call was accepted on, if known
    pub fn local_addr(&self) -> Option<&LocalAddr> {
        self.local_addr.as_ref()
    }

    /// Cancel the call
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True if the call has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The cancellation token of the call
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Completes with the status the call has to be aborted with.
    ///
    /// This is either `Cancelled` once the token fires, or `DeadlineExceeded`
    /// once the deadline passes. Never completes for a call without a deadline
    /// that is not cancelled.
    pub async fn done(&self) -> Status {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Status::cancelled("call cancelled"),
                    _ = tokio::time::sleep_until(deadline) => Status::deadline_exceeded("deadline exceeded"),
                }
            }
            None => {
                self.cancel.cancelled().await;
                Status::cancelled("call cancelled")
            }
        }
    }
}
