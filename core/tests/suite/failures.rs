#![cfg(unix)]

use pretty_assertions::assert_eq;
use procpipe_core::PipelineError;
use procpipe_core::RunOptions;
use procpipe_core::StageError;
use procpipe_core::StageSpec;
use procpipe_core::run_buffered;
use procpipe_test_support::run;
use procpipe_test_support::sh;
use procpipe_test_support::tempdir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn empty_stage_list_is_invalid() {
    let err = run_buffered(Vec::new(), None, &RunOptions::default(), &CancellationToken::new())
        .await
        .expect_err("no stages");
    assert!(matches!(err, PipelineError::InvalidPipeline(_)));
}

#[tokio::test]
async fn blank_entry_is_invalid_and_nothing_starts() {
    let dir = tempdir();
    let marker = dir.path().join("started");
    let stages = vec![
        sh("touch started").current_dir(dir.path()),
        StageSpec::default(),
    ];

    let err = run_buffered(stages, None, &RunOptions::default(), &CancellationToken::new())
        .await
        .expect_err("blank stage");

    assert!(matches!(err, PipelineError::InvalidPipeline(_)), "{err}");
    assert!(!marker.exists(), "no stage may run for an invalid pipeline");
}

#[tokio::test]
async fn missing_executable_fails_to_start_without_hanging() {
    let stages = vec![
        StageSpec::new("echo").arg("upstream"),
        StageSpec::new("/nonexistent/procpipe-missing-tool"),
        StageSpec::new("cat"),
    ];

    let run = run(stages, None).await;

    let missing = run.result.get(1).expect("stage 1");
    assert!(matches!(missing.error, Some(StageError::StartFailure(_))));
    assert_eq!((missing.exit_code, missing.pid, missing.pgid), (-1, -1, -1));

    let downstream = run.result.get(2).expect("stage 2");
    assert_eq!(downstream.exit_code, 0);
    assert!(downstream.stdout.is_empty());

    let upstream = run.result.get(0).expect("stage 0");
    assert!(
        upstream.error.is_none()
            || matches!(upstream.error, Some(StageError::PipeClosed { neighbor: 1 })),
        "{:?}",
        upstream.error
    );
    assert!(run.error.is_some());
    assert_eq!(run.result.len(), 3);
}

#[tokio::test]
async fn failing_middle_stage_keeps_later_results() {
    let stages = vec![
        sh("echo keep"),
        sh("cat >/dev/null; exit 4"),
        StageSpec::new("cat"),
    ];

    let run = run(stages, None).await;

    assert_eq!(run.result.get(1).expect("middle").exit_code, 4);
    assert_eq!(run.result.get(2).expect("last").exit_code, 0);
    assert_eq!(run.exit_code(), 0);
    match run.error {
        Some(PipelineError::Stage { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected the middle stage's error, got {other:?}"),
    }
}
