//! Root of the `procpipe-core` library.

// Library code reports through return values and `tracing`, never by
// printing.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod pty;
pub mod stage;
mod sys;

pub use config::ConfigLoadError;
pub use config::ConfigLoader;
pub use config::PipelineConfig;
pub use error::ExitDetails;
pub use error::PipelineError;
pub use error::StageError;
pub use pipeline::BufferedRun;
pub use pipeline::EscalationPolicy;
pub use pipeline::LaunchOrder;
pub use pipeline::Pipeline;
pub use pipeline::PipelineResult;
pub use pipeline::PipelineRun;
pub use pipeline::RunOptions;
pub use pipeline::StageResult;
pub use pipeline::StreamBindings;
pub use pipeline::run_buffered;
pub use pipeline::run_streaming;
pub use pty::PtyError;
pub use pty::run_attached;
pub use stage::StageSpec;
