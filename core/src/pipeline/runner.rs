//! Runs one stage's process to completion and reports its result.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::DuplexStream;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ExitDetails;
use crate::error::StageError;
use crate::pipeline::aggregator::ResultAggregator;
use crate::pipeline::sink::BoxedReader;
use crate::pipeline::sink::CaptureBuffer;
use crate::pipeline::sink::FanOutWriter;
use crate::pipeline::supervisor;
use crate::pipeline::supervisor::EscalationPolicy;
use crate::stage::StageSpec;
use crate::sys;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Where a stage's stdin comes from.
pub(crate) enum StdinSource {
    /// The caller's stdin; first stage only.
    Global(BoxedReader),
    /// Read end of the pipe from the previous stage.
    Pipe(DuplexStream),
}

/// A stage with all of its I/O bound, ready to start.
pub(crate) struct WiredStage {
    pub(crate) index: usize,
    pub(crate) spec: StageSpec,
    pub(crate) stdin: Option<StdinSource>,
    pub(crate) stdout: FanOutWriter,
    pub(crate) stderr: FanOutWriter,
    pub(crate) captured_stdout: CaptureBuffer,
    pub(crate) captured_stderr: CaptureBuffer,
}

/// Run `stage` and report exactly once to `aggregator`.
///
/// Pipe ends live inside `stdin`/`stdout` and are dropped exactly once on
/// every path, which is what unblocks neighbouring stages.
pub(crate) async fn run_stage(
    stage: WiredStage,
    aggregator: Arc<ResultAggregator>,
    cancel: CancellationToken,
    policy: EscalationPolicy,
) {
    let WiredStage {
        index,
        spec,
        stdin,
        stdout,
        stderr,
        captured_stdout,
        captured_stderr,
    } = stage;
    let started = Instant::now();

    let mut child = match build_command(&spec, stdin.is_some()).spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::debug!(
                stage = index,
                command = %spec.command_line(),
                error = %err,
                "stage failed to start"
            );
            drop((stdin, stdout, stderr));
            aggregator.report(index, Some(StageError::StartFailure(Arc::new(err))));
            return;
        }
    };

    let raw_pid = child.id();
    let pid = raw_pid.and_then(|pid| i32::try_from(pid).ok()).unwrap_or(-1);
    aggregator.update_result(index, |result| result.pid = pid);

    let pgid = raw_pid
        .ok_or_else(|| io::Error::other("process was reaped before its pid was read"))
        .and_then(sys::process_group_id);
    let pgid = match pgid {
        Ok(pgid) => pgid,
        Err(err) => {
            tracing::debug!(stage = index, pid, error = %err, "process group lookup failed");
            drop((stdin, stdout, stderr));
            // An unsupervised process must not outlive the pipeline.
            let _ = child.start_kill();
            let _ = child.wait().await;
            aggregator.report(
                index,
                Some(StageError::ProcessGroupFailure {
                    pid,
                    source: Arc::new(err),
                }),
            );
            return;
        }
    };
    aggregator.update_result(index, |result| result.pgid = pgid);
    tracing::debug!(stage = index, pid, pgid, command = %spec.command_line(), "stage started");

    let stage_done = CancellationToken::new();
    let supervisor = supervisor::spawn(index, pgid, policy, cancel, stage_done.clone());

    let stdin_task = match (stdin, child.stdin.take()) {
        (Some(source), Some(child_stdin)) => {
            Some(tokio::spawn(forward_input(index, source, child_stdin)))
        }
        _ => None,
    };
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(forward_output(out, stdout)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(forward_output(err, stderr)));

    let waited = child.wait().await;

    // The process is gone: release the upstream read end now, then drain
    // what it wrote, which drops the downstream write end.
    if let Some(task) = stdin_task {
        task.abort();
        let _ = task.await;
    }
    let mut forward_error = None;
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(StageError::io(
                "output forwarding task failed",
                io::Error::other(join_err.to_string()),
            )),
        };
        if let Err(err) = outcome {
            forward_error = forward_error.or(Some(err));
        }
    }
    stage_done.cancel();
    let _ = supervisor.await;

    let (exit, wait_error) = match waited {
        Ok(status) if status.success() => (ExitDetails::SUCCESS, None),
        Ok(status) => {
            let exit = sys::exit_details(status);
            (exit, Some(StageError::WaitFailure(exit)))
        }
        Err(err) => (
            ExitDetails::GENERIC_FAILURE,
            Some(StageError::io("waiting for process", err)),
        ),
    };
    tracing::debug!(stage = index, pid, %exit, "stage exited");

    aggregator.update_result(index, |result| {
        result.exit_code = exit.code;
        result.signal = exit.signal;
        result.stdout = captured_stdout.contents();
        result.stderr = captured_stderr.contents();
        result.duration = started.elapsed();
    });
    aggregator.report(index, forward_error.or(wait_error));
}

fn build_command(spec: &StageSpec, has_stdin: bool) -> Command {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(if has_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    #[cfg(unix)]
    command.process_group(0);
    command
}

async fn forward_input(index: usize, mut source: StdinSource, mut child_stdin: ChildStdin) {
    let copied = match &mut source {
        StdinSource::Global(reader) => tokio::io::copy(reader, &mut child_stdin).await,
        StdinSource::Pipe(reader) => tokio::io::copy(reader, &mut child_stdin).await,
    };
    match copied {
        Ok(bytes) => tracing::trace!(stage = index, bytes, "stdin delivered"),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!(stage = index, "stage stopped reading stdin early");
        }
        Err(err) => tracing::debug!(stage = index, error = %err, "forwarding stdin failed"),
    }
    // Dropping `child_stdin` here is the child's EOF.
}

async fn forward_output<R>(mut source: R, mut sink: FanOutWriter) -> Result<(), StageError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let read = source
            .read(&mut chunk)
            .await
            .map_err(|err| StageError::io("reading process output", err))?;
        if read == 0 {
            return Ok(());
        }
        sink.write_all(&chunk[..read]).await?;
    }
}
