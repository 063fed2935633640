//! Timeout and cancellation broker for device calls.
//!
//! Every device call made by a sub-workflow action goes through
//! [`TimeoutBroker::execute_with_timeout`]. The call runs as its own task and
//! races a timer and the caller's cancellation token:
//!
//! | First to fire | Outcome |
//! |---|---|
//! | the call | [`BrokerOutcome::Success`], or `Failure` if the call returned an error |
//! | the timer | [`BrokerOutcome::Failure`] with [`BrokerFailure::Timeout`] |
//! | the caller's token | [`BrokerOutcome::Cancelled`] |
//!
//! When the timer or the caller wins, the token handed to the call is
//! cancelled and the broker waits up to the drain grace for the call to
//! finish its own cleanup (drivers set the terminal idle on cancellation).
//! A call still running after the grace is aborted. Draining keeps the
//! half-duplex link free of a stray command when the next step starts.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dal_hardware::HardwareError;

/// Result of a brokered call.
#[derive(Debug)]
pub enum BrokerOutcome<T> {
    Success(T),
    Failure(BrokerFailure),
    Cancelled,
}

/// Why a brokered call failed.
#[derive(Debug)]
pub enum BrokerFailure {
    /// The device did not answer in time.
    Timeout(Duration),
    /// The call finished with an error of its own.
    Faulted(HardwareError),
}

/// Outcome without its payload, kept in the controller's registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OutcomeKind {
    Success,
    Failure,
    Cancelled,
}

impl<T> BrokerOutcome<T> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success(_) => OutcomeKind::Success,
            Self::Failure(_) => OutcomeKind::Failure,
            Self::Cancelled => OutcomeKind::Cancelled,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Failure(BrokerFailure::Timeout(_)))
    }
}

impl std::fmt::Display for BrokerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "no response within {}ms", after.as_millis()),
            Self::Faulted(error) => write!(f, "{error}"),
        }
    }
}

/// Runs device calls under a timeout and a cancellation token.
#[derive(Debug, Clone)]
pub struct TimeoutBroker {
    drain_grace: Duration,
}

impl TimeoutBroker {
    pub fn new(drain_grace: Duration) -> Self {
        Self { drain_grace }
    }

    pub fn drain_grace(&self) -> Duration {
        self.drain_grace
    }

    /// Run `op` until it finishes, `timeout` elapses or `external` fires.
    ///
    /// `op` receives a child of `external`, so cancelling the caller's token
    /// also reaches the call.
    pub async fn execute_with_timeout<T, F, Fut>(
        &self,
        op: F,
        timeout: Duration,
        external: &CancellationToken,
    ) -> BrokerOutcome<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, HardwareError>> + Send + 'static,
        T: Send + 'static,
    {
        let call_token = external.child_token();
        let mut task = tokio::spawn(op(call_token.clone()));
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        tokio::select! {
            biased;
            _ = external.cancelled() => {
                debug!("Brokered call cancelled by caller");
                self.drain(task, &call_token).await;
                BrokerOutcome::Cancelled
            }
            joined = &mut task => match joined {
                Ok(Ok(value)) => BrokerOutcome::Success(value),
                Ok(Err(error)) => BrokerOutcome::Failure(BrokerFailure::Faulted(error)),
                Err(join_error) => BrokerOutcome::Failure(BrokerFailure::Faulted(
                    HardwareError::aborted(join_error.to_string()),
                )),
            },
            _ = &mut deadline => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Brokered call timed out");
                self.drain(task, &call_token).await;
                BrokerOutcome::Failure(BrokerFailure::Timeout(timeout))
            }
        }
    }

    /// Cancel the call and give it the grace period to finish.
    async fn drain<T>(&self, mut task: JoinHandle<T>, token: &CancellationToken) {
        token.cancel();
        if tokio::time::timeout(self.drain_grace, &mut task).await.is_err() {
            warn!(
                grace_ms = self.drain_grace.as_millis() as u64,
                "Device call ignored cancellation, aborting"
            );
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::Instant;

    fn broker() -> TimeoutBroker {
        TimeoutBroker::new(Duration::from_millis(500))
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_call_is_success() {
        let outcome = broker()
            .execute_with_timeout(
                |_| async { Ok::<_, HardwareError>(7) },
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, BrokerOutcome::Success(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_is_fault_not_timeout() {
        let outcome = broker()
            .execute_with_timeout(
                |_| async { Err::<(), _>(HardwareError::unsupported("GetPin")) },
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.kind(), OutcomeKind::Failure);
        assert!(!outcome.is_timeout());
        assert!(matches!(
            outcome,
            BrokerOutcome::Failure(BrokerFailure::Faulted(HardwareError::Unsupported { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline() {
        let start = Instant::now();
        let outcome = broker()
            .execute_with_timeout(
                |token: CancellationToken| async move {
                    token.cancelled().await;
                    Err::<(), _>(HardwareError::Cancelled)
                },
                Duration::from_millis(3000),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.is_timeout());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3010), "fired late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_ignoring_cancellation_is_aborted_after_grace() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let start = Instant::now();

        let outcome = broker()
            .execute_with_timeout(
                move |_| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, HardwareError>(())
                },
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.is_timeout());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(600) && elapsed < Duration::from_millis(610));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_is_distinct_from_timeout() {
        let external = CancellationToken::new();
        let canceller = external.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let saw_cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&saw_cancel);
        let outcome = broker()
            .execute_with_timeout(
                move |token: CancellationToken| async move {
                    token.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, HardwareError>(())
                },
                Duration::from_secs(10),
                &external,
            )
            .await;

        assert_eq!(outcome.kind(), OutcomeKind::Cancelled);
        assert!(saw_cancel.load(Ordering::SeqCst), "call should drain before return");
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_token_wins() {
        let external = CancellationToken::new();
        external.cancel();
        let outcome = broker()
            .execute_with_timeout(
                |_| async { Ok::<_, HardwareError>(1) },
                Duration::from_secs(1),
                &external,
            )
            .await;
        assert_eq!(outcome.kind(), OutcomeKind::Cancelled);
    }
}
