#![cfg(unix)]

use std::time::Duration;
use std::time::Instant;

use pretty_assertions::assert_eq;
use procpipe_async_utils::cancel_after;
use procpipe_core::EscalationPolicy;
use procpipe_core::RunOptions;
use procpipe_core::StageError;
use procpipe_core::StageSpec;
use procpipe_test_support::fast_escalation;
use procpipe_test_support::fast_options;
use procpipe_test_support::run_with;
use procpipe_test_support::sh;
use tokio_util::sync::CancellationToken;

const SLACK: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cancelled_sleep_ends_by_interrupt() {
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let started = Instant::now();
    let run = run_with(
        vec![StageSpec::new("sleep").arg("30")],
        None,
        &fast_options(),
        &cancel,
    )
    .await;
    canceller.await.expect("canceller");

    let stage = run.result.get(0).expect("stage 0");
    assert_eq!(stage.signal, Some(libc::SIGINT));
    assert_eq!(stage.exit_code, -1);
    assert!(matches!(stage.error, Some(StageError::WaitFailure(_))));
    assert!(started.elapsed() < fast_escalation().interrupt_after + SLACK);
}

#[tokio::test]
async fn ignored_interrupt_escalates_to_kill() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let started = Instant::now();
    let run = run_with(
        vec![sh("trap '' INT; sleep 30; echo survived")],
        None,
        &fast_options(),
        &cancel,
    )
    .await;
    let elapsed = started.elapsed();

    let stage = run.result.get(0).expect("stage 0");
    assert_eq!(stage.signal, Some(libc::SIGKILL));
    assert!(stage.stdout.is_empty());
    assert!(elapsed >= fast_escalation().kill_after, "{elapsed:?}");
    assert!(elapsed < fast_escalation().kill_after + SLACK, "{elapsed:?}");
}

#[tokio::test]
async fn deadline_cancels_every_stage() {
    let cancel = CancellationToken::new();
    let _deadline = cancel_after(cancel.clone(), Duration::from_millis(150));

    let run = run_with(
        vec![sh("sleep 30"), sh("sleep 30"), StageSpec::new("cat")],
        None,
        &fast_options(),
        &cancel,
    )
    .await;

    assert_eq!(run.result.len(), 3);
    for index in 0..2 {
        let stage = run.result.get(index).expect("stage");
        assert!(stage.signal.is_some(), "stage {index}: {stage:?}");
    }
    assert!(run.error.is_some());
}

#[tokio::test]
async fn finished_pipeline_ignores_later_cancellation() {
    let cancel = CancellationToken::new();
    let options = RunOptions {
        escalation: EscalationPolicy::new(Duration::from_millis(10), Duration::from_millis(20)),
        ..RunOptions::default()
    };

    let run = run_with(vec![StageSpec::new("true")], None, &options, &cancel).await;
    cancel.cancel();

    assert!(run.error.is_none(), "{:?}", run.error);
    assert_eq!(run.exit_code(), 0);
}
