#![allow(clippy::expect_used)]

//! Helpers shared by the `procpipe-core` integration tests.

use std::future::Future;
use std::time::Duration;

use procpipe_core::BufferedRun;
use procpipe_core::EscalationPolicy;
use procpipe_core::RunOptions;
use procpipe_core::StageSpec;
use procpipe_core::run_buffered;
use tokio_util::sync::CancellationToken;

/// Upper bound for any single pipeline run in tests.
pub const TEST_DEADLINE: Duration = Duration::from_secs(20);

/// A stage that runs `script` under `/bin/sh -c`.
pub fn sh(script: &str) -> StageSpec {
    StageSpec::new("/bin/sh").args(["-c", script])
}

/// Escalation short enough for tests to observe both steps.
pub fn fast_escalation() -> EscalationPolicy {
    EscalationPolicy::new(Duration::from_millis(100), Duration::from_millis(600))
}

pub fn fast_options() -> RunOptions {
    RunOptions {
        escalation: fast_escalation(),
        ..RunOptions::default()
    }
}

/// Fails the test instead of hanging when `future` does not finish in time.
pub async fn within_deadline<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_DEADLINE, future)
        .await
        .expect("pipeline did not finish before the test deadline")
}

/// Run `stages` in buffered mode with an uncancelled token.
pub async fn run(stages: Vec<StageSpec>, stdin: Option<&[u8]>) -> BufferedRun {
    run_with(stages, stdin, &fast_options(), &CancellationToken::new()).await
}

pub async fn run_with(
    stages: Vec<StageSpec>,
    stdin: Option<&[u8]>,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> BufferedRun {
    within_deadline(run_buffered(
        stages,
        stdin.map(<[u8]>::to_vec),
        options,
        cancel,
    ))
    .await
    .expect("pipeline should be valid")
}

pub fn tempdir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create tempdir")
}
