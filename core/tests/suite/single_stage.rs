#![cfg(unix)]

use pretty_assertions::assert_eq;
use procpipe_core::PipelineError;
use procpipe_core::StageError;
use procpipe_core::StageSpec;
use procpipe_test_support::run;
use procpipe_test_support::sh;
use procpipe_test_support::tempdir;

#[tokio::test]
async fn one_clean_stage_is_the_whole_output() {
    let run = run(vec![StageSpec::new("echo").arg("hello")], None).await;

    assert!(run.error.is_none(), "{:?}", run.error);
    assert_eq!(run.result.len(), 1);
    let stage = run.result.get(0).expect("stage 0");
    assert_eq!(stage.exit_code, 0);
    assert!(stage.error.is_none());
    assert_eq!(stage.stdout, b"hello\n".to_vec());
    assert_eq!(run.stdout, stage.stdout);
    assert_eq!(run.exit_code(), 0);
}

#[tokio::test]
async fn stage_runs_in_its_own_process_group() {
    let run = run(vec![sh("exit 0")], None).await;

    let stage = run.result.get(0).expect("stage 0");
    assert!(stage.pid > 1, "pid recorded: {}", stage.pid);
    assert_eq!(stage.pgid, stage.pid);
}

#[tokio::test]
async fn working_directory_and_environment_are_applied() {
    let dir = tempdir();
    let expected_dir = dir.path().canonicalize().expect("canonical tempdir");
    let spec = sh("pwd -P; printf '%s\\n' \"$GREETING\"")
        .current_dir(dir.path())
        .env("GREETING", "hi there");

    let run = run(vec![spec], None).await;

    assert!(run.error.is_none(), "{:?}", run.error);
    assert_eq!(
        String::from_utf8_lossy(&run.stdout),
        format!("{}\nhi there\n", expected_dir.display())
    );
}

#[tokio::test]
async fn global_stdin_feeds_the_first_stage() {
    let run = run(vec![StageSpec::new("tr").args(["a-z", "A-Z"])], Some(b"quiet\n")).await;

    assert_eq!(run.stdout, b"QUIET\n".to_vec());
}

#[tokio::test]
async fn non_zero_exit_is_a_wait_failure_with_context() {
    let dir = tempdir();
    let run = run(vec![sh("echo oops >&2; exit 7").current_dir(dir.path())], None).await;

    let stage = run.result.get(0).expect("stage 0");
    assert_eq!(stage.exit_code, 7);
    assert_eq!(stage.signal, None);
    assert_eq!(stage.stderr, b"oops\n".to_vec());
    assert!(matches!(stage.error, Some(StageError::WaitFailure(_))));

    assert_eq!(run.exit_code(), 7);
    match &run.error {
        Some(PipelineError::Stage {
            index,
            program,
            args,
            cwd,
            ..
        }) => {
            assert_eq!(*index, 0);
            assert_eq!(program.to_string_lossy(), "/bin/sh");
            assert_eq!(args[0], "-c");
            assert_eq!(cwd.as_path(), dir.path());
        }
        other => panic!("expected a stage error, got {other:?}"),
    }
}
