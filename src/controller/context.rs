//! Operation Context
//!
//! Carries the caller's cancellation signal and deadline through one
//! Create/Read/Update/Delete invocation. Every backend call and every poll
//! wait runs under [`OperationContext::guard`].

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline for a single reconciliation operation
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OperationContext {
    /// A context that is never cancelled and has no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the caller's cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run `step`, aborting with [`Error::Cancelled`] on cancellation or
    /// when the deadline passes
    pub async fn guard<T, F>(&self, step: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("{}: cancelled", step)));
        }
        if matches!(self.deadline, Some(d) if Instant::now() >= d) {
            return Err(Error::Cancelled(format!("{}: deadline exceeded", step)));
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled(format!("{}: cancelled", step))),
            _ = deadline => Err(Error::Cancelled(format!("{}: deadline exceeded", step))),
            result = fut => result,
        }
    }

    /// Cancellable sleep
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.guard("wait", async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let ctx = OperationContext::new();
        let value = ctx.guard("step", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = OperationContext::new().with_cancellation(token);

        let err = ctx.guard("step", async { Ok(()) }).await.unwrap_err();
        assert_matches!(err, Error::Cancelled(_));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let token = CancellationToken::new();
        let ctx = OperationContext::new().with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let err = ctx.sleep(Duration::from_secs(3600)).await.unwrap_err();
        assert_matches!(err, Error::Cancelled(ref msg) if msg.contains("cancelled"));
        canceller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_cancellation_not_timeout() {
        let ctx = OperationContext::new().with_timeout(Duration::from_secs(5));
        let err = ctx.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert_matches!(err, Error::Cancelled(ref msg) if msg.contains("deadline"));
    }
}
