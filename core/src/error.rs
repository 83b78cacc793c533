use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// How a stage's process terminated, as precisely as the platform reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitDetails {
    /// Exit code, or -1 when the process never exited on its own (signal).
    pub code: i32,
    /// Terminating signal number on unix.
    pub signal: Option<i32>,
}

impl ExitDetails {
    pub const SUCCESS: ExitDetails = ExitDetails {
        code: 0,
        signal: None,
    };

    /// Used when the platform gives no usable status for a failed wait.
    pub const GENERIC_FAILURE: ExitDetails = ExitDetails {
        code: 1,
        signal: None,
    };
}

impl fmt::Display for ExitDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            Some(signal) => write!(f, "terminated by signal {signal}"),
            None => write!(f, "exit code {}", self.code),
        }
    }
}

/// Failure of a single stage. Retained in that stage's result even when it
/// does not become the pipeline's aggregate error.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("failed to start process: {0}")]
    StartFailure(#[source] Arc<io::Error>),

    #[error("failed to resolve process group of pid {pid}: {source}")]
    ProcessGroupFailure {
        pid: i32,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("process exited unsuccessfully ({0})")]
    WaitFailure(ExitDetails),

    #[error("pipe to stage {neighbor} closed before all output was delivered")]
    PipeClosed { neighbor: usize },

    #[error("failed to deliver {signal} to process group {pgid}: {source}")]
    SignalDeliveryFailure {
        pgid: i32,
        signal: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("failed writing to combined {stream}: {source}")]
    OutputSink {
        stream: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("stage task panicked")]
    Panicked,
}

impl StageError {
    pub(crate) fn io(context: &'static str, err: io::Error) -> Self {
        StageError::Io {
            context,
            source: Arc::new(err),
        }
    }
}

/// Error surfaced by a pipeline as a whole.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected before any process started.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// The first stage failure by completion order, with the command that
    /// produced it.
    #[error("stage {index} `{command}` (cwd {cwd:?}) failed: {source}")]
    Stage {
        index: usize,
        command: String,
        program: PathBuf,
        args: Vec<String>,
        cwd: PathBuf,
        #[source]
        source: StageError,
    },
}

impl PipelineError {
    /// The underlying stage failure, if this error came from a stage.
    pub fn stage_error(&self) -> Option<&StageError> {
        match self {
            PipelineError::InvalidPipeline(_) => None,
            PipelineError::Stage { source, .. } => Some(source),
        }
    }
}
