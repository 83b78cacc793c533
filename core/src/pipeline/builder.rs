//! Validation and I/O wiring for a stage list. Nothing is started here.

use std::sync::Arc;

use tokio::io::DuplexStream;

use crate::error::PipelineError;
use crate::pipeline::StreamBindings;
use crate::pipeline::aggregator::ResultAggregator;
use crate::pipeline::runner::StdinSource;
use crate::pipeline::runner::WiredStage;
use crate::pipeline::sink::CaptureBuffer;
use crate::pipeline::sink::FanOutTarget;
use crate::pipeline::sink::FanOutWriter;
use crate::stage::StageSpec;

/// Buffer size of each inter-stage pipe, matching the Linux default.
pub const PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) fn validate(stages: &[StageSpec]) -> Result<(), PipelineError> {
    if stages.is_empty() {
        return Err(PipelineError::InvalidPipeline(
            "pipeline has no stages".to_string(),
        ));
    }
    if let Some(index) = stages.iter().position(StageSpec::is_blank) {
        return Err(PipelineError::InvalidPipeline(format!(
            "stage {index} has no program"
        )));
    }
    Ok(())
}

pub(crate) struct Wiring {
    pub(crate) stages: Vec<WiredStage>,
    pub(crate) aggregator: Arc<ResultAggregator>,
}

/// Bind every stage's stdin, stdout and stderr.
///
/// All pipe pairs exist before this returns, so no stage can start writing
/// into a pipe whose reader has not been created yet.
pub(crate) fn wire(
    specs: Vec<StageSpec>,
    bindings: StreamBindings,
) -> Result<Wiring, PipelineError> {
    validate(&specs)?;
    let StreamBindings {
        stdin,
        stdout,
        stderr,
    } = bindings;
    let aggregator = Arc::new(ResultAggregator::new(&specs, stdout, stderr));

    let count = specs.len();
    let mut writers: Vec<Option<DuplexStream>> = Vec::with_capacity(count - 1);
    let mut readers: Vec<Option<DuplexStream>> = Vec::with_capacity(count - 1);
    for _ in 1..count {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        writers.push(Some(writer));
        readers.push(Some(reader));
    }

    let mut global_stdin = stdin;
    let mut stages = Vec::with_capacity(count);
    for (index, spec) in specs.into_iter().enumerate() {
        let captured_stdout = CaptureBuffer::new();
        let captured_stderr = CaptureBuffer::new();

        let stdin = if index == 0 {
            global_stdin.take().map(StdinSource::Global)
        } else {
            readers[index - 1].take().map(StdinSource::Pipe)
        };

        let mut stdout_targets = vec![FanOutTarget::Capture(captured_stdout.clone())];
        if index + 1 == count {
            stdout_targets.push(FanOutTarget::Shared(aggregator.stdout()));
        } else if let Some(writer) = writers[index].take() {
            stdout_targets.push(FanOutTarget::Pipe {
                writer,
                neighbor: index + 1,
            });
        }

        let stderr_targets = vec![
            FanOutTarget::Capture(captured_stderr.clone()),
            FanOutTarget::Shared(aggregator.stderr()),
        ];

        stages.push(WiredStage {
            index,
            spec,
            stdin,
            stdout: FanOutWriter::new(stdout_targets),
            stderr: FanOutWriter::new(stderr_targets),
            captured_stdout,
            captured_stderr,
        });
    }

    Ok(Wiring { stages, aggregator })
}
