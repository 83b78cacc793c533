//! Concurrent execution of a chain of external processes.
//!
//! ```text
//!  stdin ─▶ [stage 0] ──pipe──▶ [stage 1] ──pipe──▶ … ─▶ [stage N-1] ─▶ stdout
//!              │                    │                        │
//!              └──────── stderr ────┴────────────────────────┴───────▶ stderr
//! ```
//!
//! [`Pipeline::new`] validates and wires, [`Pipeline::run`] starts one task per
//! stage and waits for all of them. Every stage runs in its own process group
//! and is escalated from SIGINT to SIGKILL once the shared token is cancelled.

mod aggregator;
mod builder;
mod runner;
mod sink;
mod supervisor;

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::error::StageError;
use crate::stage::StageSpec;

pub use aggregator::PipelineResult;
pub use aggregator::StageResult;
pub use builder::PIPE_CAPACITY;
pub use sink::BoxedReader;
pub use sink::BoxedWriter;
pub use sink::CaptureBuffer;
pub use sink::SharedSink;
pub use supervisor::EscalationPolicy;

use aggregator::ResultAggregator;
use runner::WiredStage;

/// Order in which stage tasks are issued. They run concurrently either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchOrder {
    /// Last stage first, so consumers exist before producers.
    #[default]
    Reverse,
    Forward,
}

impl fmt::Display for LaunchOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchOrder::Reverse => f.write_str("reverse"),
            LaunchOrder::Forward => f.write_str("forward"),
        }
    }
}

impl FromStr for LaunchOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reverse" => Ok(LaunchOrder::Reverse),
            "forward" => Ok(LaunchOrder::Forward),
            other => Err(format!("unknown launch order `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub escalation: EscalationPolicy,
    pub launch_order: LaunchOrder,
}

/// The caller's global streams.
///
/// `stdin` feeds the first stage; without it the first stage reads from the
/// null device. `stdout` receives only the last stage's output, `stderr`
/// receives every stage's stderr.
pub struct StreamBindings {
    pub stdin: Option<BoxedReader>,
    pub stdout: SharedSink,
    pub stderr: SharedSink,
}

impl StreamBindings {
    pub fn new(stdout: SharedSink, stderr: SharedSink) -> Self {
        Self {
            stdin: None,
            stdout,
            stderr,
        }
    }

    pub fn with_stdin(mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }
}

/// A validated, fully wired pipeline. No process has been started yet.
pub struct Pipeline {
    stages: Vec<WiredStage>,
    aggregator: Arc<ResultAggregator>,
    options: RunOptions,
}

impl Pipeline {
    /// Wire `stages` to `bindings`.
    ///
    /// Fails with [`PipelineError::InvalidPipeline`] for an empty list or a
    /// blank stage, before any process exists.
    pub fn new(stages: Vec<StageSpec>, bindings: StreamBindings) -> Result<Self, PipelineError> {
        let builder::Wiring { stages, aggregator } = builder::wire(stages, bindings)?;
        Ok(Self {
            stages,
            aggregator,
            options: RunOptions::default(),
        })
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage concurrently and wait until all of them reported.
    ///
    /// Cancelling `cancel` escalates every stage's process group; `run`
    /// still returns only after each stage finished.
    pub async fn run(self, cancel: &CancellationToken) -> PipelineRun {
        let Pipeline {
            mut stages,
            aggregator,
            options,
        } = self;
        if options.launch_order == LaunchOrder::Reverse {
            stages.reverse();
        }
        tracing::debug!(
            stages = stages.len(),
            order = %options.launch_order,
            "launching pipeline"
        );

        let tasks: Vec<_> = stages
            .into_iter()
            .map(|stage| {
                let index = stage.index;
                let handle = tokio::spawn(runner::run_stage(
                    stage,
                    Arc::clone(&aggregator),
                    cancel.clone(),
                    options.escalation,
                ));
                (index, handle)
            })
            .collect();

        join_stages(tasks, &aggregator).await;

        let (result, error) = aggregator.finish();
        PipelineRun { result, error }
    }
}

/// Wait for every stage task, then for every stage report.
///
/// A task that panicked or was aborted never reported for itself, so it is
/// reported here as [`StageError::Panicked`]; otherwise `completed` would
/// never resolve.
pub(crate) async fn join_stages(
    tasks: Vec<(usize, JoinHandle<()>)>,
    aggregator: &ResultAggregator,
) {
    for (index, handle) in tasks {
        if let Err(err) = handle.await {
            tracing::warn!(stage = index, error = %err, "stage task did not finish");
            aggregator.report(index, Some(StageError::Panicked));
        }
    }
    aggregator.completed().await;
}

/// Results of a finished run plus the first stage error, if any.
#[derive(Debug)]
pub struct PipelineRun {
    pub result: PipelineResult,
    pub error: Option<PipelineError>,
}

impl PipelineRun {
    /// Last stage's exit code; -1 if it never exited on its own.
    pub fn exit_code(&self) -> i32 {
        self.result.exit_code()
    }

    pub fn into_result(self) -> Result<PipelineResult, PipelineError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}

/// A run whose combined streams were captured in memory.
#[derive(Debug)]
pub struct BufferedRun {
    pub result: PipelineResult,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<PipelineError>,
}

impl BufferedRun {
    pub fn exit_code(&self) -> i32 {
        self.result.exit_code()
    }
}

/// Run `stages` with `stdin` as bytes and the combined output captured.
///
/// Only an invalid stage list is returned as `Err`; stage failures are in
/// [`BufferedRun::error`] next to the partial results.
pub async fn run_buffered(
    stages: Vec<StageSpec>,
    stdin: Option<Vec<u8>>,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<BufferedRun, PipelineError> {
    let stdout = CaptureBuffer::new();
    let stderr = CaptureBuffer::new();
    let mut bindings = StreamBindings::new(
        SharedSink::new("stdout", stdout.clone()),
        SharedSink::new("stderr", stderr.clone()),
    );
    if let Some(bytes) = stdin {
        bindings = bindings.with_stdin(Cursor::new(bytes));
    }

    let run = Pipeline::new(stages, bindings)?
        .with_options(*options)
        .run(cancel)
        .await;
    Ok(BufferedRun {
        result: run.result,
        stdout: stdout.contents(),
        stderr: stderr.contents(),
        error: run.error,
    })
}

/// Run `stages` against caller-supplied streams.
pub async fn run_streaming<I, O, E>(
    stages: Vec<StageSpec>,
    stdin: Option<I>,
    stdout: O,
    stderr: E,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<PipelineRun, PipelineError>
where
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin + 'static,
    E: AsyncWrite + Send + Unpin + 'static,
{
    let mut bindings = StreamBindings::new(
        SharedSink::new("stdout", stdout),
        SharedSink::new("stderr", stderr),
    );
    if let Some(stdin) = stdin {
        bindings = bindings.with_stdin(stdin);
    }

    let pipeline = Pipeline::new(stages, bindings)?.with_options(*options);
    Ok(pipeline.run(cancel).await)
}
