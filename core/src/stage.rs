//! Description of one process in a pipeline.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

/// Everything needed to start one stage.
///
/// A `StageSpec` is moved into the pipeline when submitted, so it cannot be
/// changed while the stage runs. A spec with an empty `program` (for example
/// `StageSpec::default()`) is a blank entry and is rejected at build time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSpec {
    /// Executable path, or a bare name resolved through `PATH`.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory; the caller's current directory when `None`.
    pub cwd: Option<PathBuf>,
    /// Variables set on top of the inherited environment.
    pub env: HashMap<String, String>,
}

impl StageSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn is_blank(&self) -> bool {
        self.program.as_os_str().is_empty()
    }

    /// Shell-quoted rendering of program and arguments, for messages.
    pub fn command_line(&self) -> String {
        let program = self.program.to_string_lossy();
        let words: Vec<&str> = std::iter::once(program.as_ref())
            .chain(self.args.iter().map(String::as_str))
            .collect();
        shlex::try_join(words.iter().copied()).unwrap_or_else(|_| words.join(" "))
    }

    /// The directory the stage runs in, for error context.
    pub fn effective_cwd(&self) -> PathBuf {
        self.cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| Path::new(".").to_path_buf())
    }
}
