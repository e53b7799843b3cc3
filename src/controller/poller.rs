//! Transition Poller
//!
//! Requests an asynchronous backend state change and re-reads the object
//! until the change is observed or the configured bound elapses. Running out
//! of time is reported as [`TransitionOutcome::TimedOut`], not as an error:
//! the object exists either way.

use super::context::OperationContext;
use crate::config::PollConfig;
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a transition wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The expected condition was observed after `polls` reads
    Reached { polls: u32 },
    /// The condition was not observed within the bound
    TimedOut { waited: Duration },
}

impl TransitionOutcome {
    pub fn is_reached(&self) -> bool {
        matches!(self, TransitionOutcome::Reached { .. })
    }
}

/// Bounded, cancellable poll loop
#[derive(Debug, Clone, Copy)]
pub struct TransitionPoller {
    config: PollConfig,
}

impl TransitionPoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// Issue `request`, then call `read` every interval until `done` holds.
    ///
    /// A failed request aborts before anything is read. Read failures and
    /// cancellation end the wait with an error.
    pub async fn run<T, Req, Read, ReadFut, Done>(
        &self,
        ctx: &OperationContext,
        request: Req,
        mut read: Read,
        done: Done,
    ) -> Result<(T, TransitionOutcome)>
    where
        Req: Future<Output = Result<()>>,
        Read: FnMut() -> ReadFut,
        ReadFut: Future<Output = Result<T>>,
        Done: Fn(&T) -> bool,
    {
        ctx.guard("transition request", request).await?;

        let started = Instant::now();
        let deadline = started + self.config.timeout();
        let mut polls = 0u32;

        loop {
            ctx.sleep(self.config.interval()).await?;
            let observed = ctx.guard("transition poll", read()).await?;
            polls += 1;

            if done(&observed) {
                debug!("Transition observed after {} polls", polls);
                return Ok((observed, TransitionOutcome::Reached { polls }));
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                warn!("Transition not observed after {:?} ({} polls)", waited, polls);
                return Ok((observed, TransitionOutcome::TimedOut { waited }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn poller(interval_ms: u64, timeout_ms: u64) -> TransitionPoller {
        TransitionPoller::new(PollConfig {
            interval_ms,
            timeout_ms,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_reached_after_a_few_polls() {
        let reads = Arc::new(AtomicU32::new(0));
        let counter = reads.clone();

        let (value, outcome) = poller(1_000, 60_000)
            .run(
                &OperationContext::new(),
                async { Ok(()) },
                || {
                    let counter = counter.clone();
                    async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
                },
                |n| *n >= 3,
            )
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(outcome, TransitionOutcome::Reached { polls: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported_not_failed() {
        let (value, outcome) = poller(1_000, 5_000)
            .run(
                &OperationContext::new(),
                async { Ok(()) },
                || async { Ok("uninitialized") },
                |s| *s != "uninitialized",
            )
            .await
            .unwrap();

        assert_eq!(value, "uninitialized");
        assert_matches!(outcome, TransitionOutcome::TimedOut { waited } if waited >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_request_reads_nothing() {
        let reads = Arc::new(AtomicU32::new(0));
        let counter = reads.clone();

        let err = poller(1_000, 5_000)
            .run(
                &OperationContext::new(),
                async { Err(Error::backend("PATCH", "snapmirror/relationships/x", 400, "nope")) },
                || {
                    let counter = counter.clone();
                    async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) }
                },
                |_| true,
            )
            .await
            .unwrap_err();

        assert_matches!(err, Error::Backend { .. });
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_the_wait() {
        let token = CancellationToken::new();
        let ctx = OperationContext::new().with_cancellation(token.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            token.cancel();
        });

        let err = poller(1_000, 600_000)
            .run(&ctx, async { Ok(()) }, || async { Ok(false) }, |done| *done)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled(_));
    }
}
