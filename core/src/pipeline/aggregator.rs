//! Thread-safe collection of per-stage results.
//!
//! Every stage owns one pre-allocated slot. Three independent locks are in
//! play and never nest: the slot table, the first-error cell, and the
//! combined output sinks (inside [`SharedSink`]). Completion is counted on
//! a `watch` channel that does not depend on whether a stage failed.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::PipelineError;
use crate::error::StageError;
use crate::pipeline::sink::SharedSink;
use crate::stage::StageSpec;

/// Outcome of one stage.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub index: usize,
    /// Shell-quoted command line.
    pub command: String,
    /// Platform exit code; -1 if the process never exited on its own.
    pub exit_code: i32,
    pub signal: Option<i32>,
    /// -1 if the process never started.
    pub pid: i32,
    /// -1 if the process group was never resolved.
    pub pgid: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<StageError>,
    pub duration: Duration,
}

impl StageResult {
    fn pending(index: usize, command: String) -> Self {
        Self {
            index,
            command,
            exit_code: -1,
            signal: None,
            pid: -1,
            pgid: -1,
            stdout: Vec::new(),
            stderr: Vec::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Per-stage results of one pipeline run, indexed by stage position.
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    stages: Vec<StageResult>,
}

impl PipelineResult {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StageResult> {
        self.stages.get(index)
    }

    pub fn last(&self) -> Option<&StageResult> {
        self.stages.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StageResult> {
        self.stages.iter()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.stages.iter().map(|stage| stage.index).collect()
    }

    /// The last stage's exit code, or -1 for an empty result.
    pub fn exit_code(&self) -> i32 {
        self.last().map_or(-1, |stage| stage.exit_code)
    }

    pub fn success(&self) -> bool {
        self.stages.iter().all(StageResult::success)
    }
}

impl<'a> IntoIterator for &'a PipelineResult {
    type Item = &'a StageResult;
    type IntoIter = std::slice::Iter<'a, StageResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.stages.iter()
    }
}

/// Command context attached to the aggregate error.
#[derive(Debug, Clone)]
struct CommandContext {
    program: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
}

struct Slot {
    result: StageResult,
    context: CommandContext,
    reported: bool,
}

pub(crate) struct ResultAggregator {
    slots: Mutex<Vec<Slot>>,
    first_error: Mutex<Option<(usize, StageError)>>,
    reported: watch::Sender<usize>,
    total: usize,
    stdout: SharedSink,
    stderr: SharedSink,
}

impl ResultAggregator {
    pub(crate) fn new(stages: &[StageSpec], stdout: SharedSink, stderr: SharedSink) -> Self {
        let slots = stages
            .iter()
            .enumerate()
            .map(|(index, spec)| Slot {
                result: StageResult::pending(index, spec.command_line()),
                context: CommandContext {
                    program: spec.program.clone(),
                    args: spec.args.clone(),
                    cwd: spec.effective_cwd(),
                },
                reported: false,
            })
            .collect();
        let (reported, _) = watch::channel(0);
        Self {
            slots: Mutex::new(slots),
            first_error: Mutex::new(None),
            reported,
            total: stages.len(),
            stdout,
            stderr,
        }
    }

    /// Combined stdout; only the last stage writes here.
    pub(crate) fn stdout(&self) -> SharedSink {
        self.stdout.clone()
    }

    /// Combined stderr; every stage writes here.
    pub(crate) fn stderr(&self) -> SharedSink {
        self.stderr.clone()
    }

    /// Read-modify-write of one slot under the table lock.
    pub(crate) fn update_result(&self, index: usize, update: impl FnOnce(&mut StageResult)) {
        if let Some(slot) = self.lock_slots().get_mut(index) {
            update(&mut slot.result);
        }
    }

    /// Record that stage `index` is finished. Only the first report per
    /// stage counts; later ones are ignored.
    pub(crate) fn report(&self, index: usize, error: Option<StageError>) {
        {
            let mut slots = self.lock_slots();
            let Some(slot) = slots.get_mut(index) else {
                tracing::warn!(stage = index, "report for unknown stage ignored");
                return;
            };
            if slot.reported {
                tracing::debug!(stage = index, "duplicate stage report ignored");
                return;
            }
            slot.reported = true;
            if let Some(err) = &error {
                slot.result.error = Some(err.clone());
            }
        }

        if let Some(err) = error {
            let mut first = self
                .first_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if first.is_none() {
                *first = Some((index, err));
            }
        }

        self.reported.send_modify(|count| *count += 1);
    }

    /// Resolves once every stage has reported.
    pub(crate) async fn completed(&self) {
        let mut reported = self.reported.subscribe();
        let total = self.total;
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = reported.wait_for(|count| *count >= total).await;
    }

    /// Move the collected results out, paired with the aggregate error.
    pub(crate) fn finish(&self) -> (PipelineResult, Option<PipelineError>) {
        let first = self
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut slots = self.lock_slots();

        let error = first.and_then(|(index, source)| {
            slots.get(index).map(|slot| PipelineError::Stage {
                index,
                command: slot.result.command.clone(),
                program: slot.context.program.clone(),
                args: slot.context.args.clone(),
                cwd: slot.context.cwd.clone(),
                source,
            })
        });
        let stages = slots
            .iter_mut()
            .map(|slot| {
                let pending = StageResult::pending(slot.result.index, slot.result.command.clone());
                std::mem::replace(&mut slot.result, pending)
            })
            .collect();

        (PipelineResult { stages }, error)
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
