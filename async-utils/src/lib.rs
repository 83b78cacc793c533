//! Cancellation helpers shared by the pipeline executor.
//!
//! A pipeline run is governed by one `CancellationToken`. Callers cancel it
//! explicitly or arm a deadline with [`cancel_after`]; per-stage tasks race
//! their own work against it with [`OrCancelExt::or_cancel`].

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Error returned when a future loses the race against its token.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelErr {
    Cancelled,
}

/// Extension trait for making futures cancellable.
///
/// Races any future against a `CancellationToken`, returning
/// `Err(CancelErr::Cancelled)` if the token fires first.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        // Biased so an already-cancelled token always wins over a ready future.
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            res = self => Ok(res),
        }
    }
}

/// Arm a deadline: cancel `token` once `timeout` elapses.
///
/// The timer stops early if the token is cancelled by someone else, so the
/// returned handle never outlives the run it guards by more than one wakeup.
pub fn cancel_after(token: CancellationToken, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::time::sleep(timeout).or_cancel(&token).await.is_ok() {
            tracing::info!(?timeout, "deadline reached, cancelling pipeline");
            token.cancel();
        }
    })
}
