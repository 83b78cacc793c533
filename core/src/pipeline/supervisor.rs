//! Per-stage signal escalation on cancellation.
//!
//! ```text
//!   Idle ──(token cancelled)──▶ +interrupt_after: SIGINT  ─┐
//!     │                         +kill_after:      SIGKILL ─┴─▶ done
//!     └──(stage finished)──────────────────────────────────────▶ done
//! ```
//!
//! Both signals are timed from the same cancellation instant and do not
//! check whether the group is still alive; a vanished group is a no-op.

use std::sync::Arc;
use std::time::Duration;

use procpipe_async_utils::OrCancelExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StageError;
use crate::sys;
use crate::sys::Delivery;
use crate::sys::GroupSignal;

/// Delays between cancellation and each escalation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub interrupt_after: Duration,
    pub kill_after: Duration,
}

impl EscalationPolicy {
    pub const DEFAULT_INTERRUPT_AFTER: Duration = Duration::from_secs(2);
    pub const DEFAULT_KILL_AFTER: Duration = Duration::from_secs(5);

    pub fn new(interrupt_after: Duration, kill_after: Duration) -> Self {
        Self {
            interrupt_after,
            kill_after,
        }
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERRUPT_AFTER, Self::DEFAULT_KILL_AFTER)
    }
}

/// Start supervising process group `pgid`.
///
/// The task ends when `stage_done` is cancelled or both signals were sent.
pub(crate) fn spawn(
    stage: usize,
    pgid: i32,
    policy: EscalationPolicy,
    cancel: CancellationToken,
    stage_done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if cancel.cancelled().or_cancel(&stage_done).await.is_err() {
            return;
        }

        tracing::info!(stage, pgid, ?policy, "pipeline cancelled, escalating");
        let cancelled_at = Instant::now();
        let interrupt = escalate(
            stage,
            pgid,
            GroupSignal::Interrupt,
            cancelled_at + policy.interrupt_after,
        );
        let kill = escalate(
            stage,
            pgid,
            GroupSignal::Kill,
            cancelled_at + policy.kill_after,
        );
        let _ = async {
            tokio::join!(interrupt, kill);
        }
        .or_cancel(&stage_done)
        .await;
    })
}

async fn escalate(stage: usize, pgid: i32, signal: GroupSignal, at: Instant) {
    tokio::time::sleep_until(at).await;
    if let Err(err) = deliver(pgid, signal) {
        tracing::warn!(stage, error = %err, "escalation signal not delivered");
    }
}

/// Signal a whole group, treating an already-empty group as success.
pub(crate) fn deliver(pgid: i32, signal: GroupSignal) -> Result<(), StageError> {
    match sys::signal_process_group(pgid, signal) {
        Ok(Delivery::Delivered) => {
            tracing::debug!(pgid, signal = signal.name(), "signal delivered");
            Ok(())
        }
        Ok(Delivery::GroupGone) => {
            tracing::trace!(pgid, signal = signal.name(), "process group already gone");
            Ok(())
        }
        Err(err) => Err(StageError::SignalDeliveryFailure {
            pgid,
            signal: signal.name(),
            source: Arc::new(err),
        }),
    }
}
