#![cfg(unix)]

use pretty_assertions::assert_eq;
use procpipe_core::StageSpec;
use procpipe_test_support::run;
use procpipe_test_support::sh;

#[tokio::test]
async fn downstream_receives_upstream_output_byte_for_byte() {
    // Well past the pipe capacity so back-pressure is exercised.
    let producer = sh("yes 'procpipe line' | head -n 40000");
    let run = run(vec![producer, StageSpec::new("cat")], None).await;

    assert!(run.error.is_none(), "{:?}", run.error);
    let upstream = run.result.get(0).expect("stage 0");
    let downstream = run.result.get(1).expect("stage 1");
    assert_eq!(upstream.stdout.len(), 40000 * "procpipe line\n".len());
    assert!(upstream.stdout == downstream.stdout, "pipe altered the bytes");
    assert!(run.stdout == downstream.stdout, "global stdout is the last stage");
}

#[tokio::test]
async fn combined_stderr_has_every_stage_and_stdout_only_the_last() {
    let stages = vec![
        sh("echo err-0 >&2; echo payload"),
        sh("echo err-1 >&2; cat"),
        sh("echo err-2 >&2; tr a-z A-Z"),
    ];

    let run = run(stages, None).await;

    assert!(run.error.is_none(), "{:?}", run.error);
    let stderr = String::from_utf8_lossy(&run.stderr);
    for index in 0..3 {
        assert!(stderr.contains(&format!("err-{index}\n")), "{stderr}");
        let stage = run.result.get(index).expect("stage");
        assert_eq!(stage.stderr, format!("err-{index}\n").into_bytes());
    }
    assert_eq!(run.stdout, b"PAYLOAD\n".to_vec());
    assert_eq!(run.result.get(2).expect("last").stdout, run.stdout);
    assert_eq!(run.result.get(0).expect("first").stdout, b"payload\n".to_vec());
}

#[tokio::test]
async fn identical_pipelines_produce_identical_results() {
    let stages = || {
        vec![
            sh("printf '3\\n1\\n2\\n1\\n'"),
            StageSpec::new("sort"),
            StageSpec::new("uniq"),
        ]
    };

    let first = run(stages(), None).await;
    let second = run(stages(), None).await;

    assert_eq!(first.result.indices(), vec![0, 1, 2]);
    assert_eq!(first.result.indices(), second.result.indices());
    let codes = |run: &procpipe_core::BufferedRun| {
        run.result.iter().map(|s| s.exit_code).collect::<Vec<_>>()
    };
    assert_eq!(codes(&first), vec![0, 0, 0]);
    assert_eq!(codes(&first), codes(&second));
    assert_eq!(first.stdout, b"1\n2\n3\n".to_vec());
    assert_eq!(first.stdout, second.stdout);
}

#[tokio::test]
async fn consumer_exiting_early_closes_the_producer_pipe() {
    let run = run(vec![StageSpec::new("yes"), StageSpec::new("head").args(["-n", "1"])], None).await;

    assert_eq!(run.stdout, b"y\n".to_vec());
    let consumer = run.result.get(1).expect("head");
    assert_eq!(consumer.exit_code, 0);
    assert!(consumer.error.is_none());

    let producer = run.result.get(0).expect("yes");
    assert!(
        matches!(
            producer.error,
            Some(procpipe_core::StageError::PipeClosed { neighbor: 1 })
        ),
        "{:?}",
        producer.error
    );
    assert_ne!(producer.exit_code, 0);
    assert_eq!(run.exit_code(), 0);
}
