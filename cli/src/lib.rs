//! `procpipe` command line.
//!
//! ```text
//! procpipe [OPTIONS] -- PROG ARGS... [| PROG ARGS...]...
//! ```
//!
//! A literal `|` word separates stages; nothing else is interpreted, so
//! quoting and globbing are left to the calling shell.
//!
//! ## Exit codes
//!
//! - the last stage's exit code when it exited on its own
//! - 1 when it was killed by a signal or never started
//! - 2 for usage errors (reported by clap)

use std::io::IsTerminal;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use procpipe_async_utils::cancel_after;
use procpipe_core::ConfigLoader;
use procpipe_core::PipelineConfig;
use procpipe_core::PipelineError;
use procpipe_core::PipelineResult;
use procpipe_core::StageSpec;
use procpipe_core::run_attached;
use procpipe_core::run_buffered;
use procpipe_core::run_streaming;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Word that separates two stages on the command line.
pub const STAGE_SEPARATOR: &str = "|";

pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    /// Used when the last stage has no exit code of its own.
    pub const FAILURE: i32 = 1;
}

/// Run a chain of programs connected by pipes.
#[derive(Debug, Parser)]
#[command(name = "procpipe", version)]
pub struct Cli {
    /// Config file to use instead of `$PROCPIPE_HOME/config.toml`.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Cancel the pipeline after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Working directory for every stage.
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Extra environment variable for every stage; may repeat.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Capture all output and print it once the pipeline finished.
    #[arg(long, conflicts_with = "pty")]
    pub buffered: bool,

    /// Print a JSON summary of every stage to stderr.
    #[arg(long)]
    pub report: bool,

    /// Run a single program attached to a pseudo-terminal.
    #[arg(long)]
    pub pty: bool,

    /// Programs and arguments, with `|` between stages.
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

impl Cli {
    /// Stage list with `--cwd` and `--env` applied to every stage.
    pub fn stages(&self) -> anyhow::Result<Vec<StageSpec>> {
        let mut stages = split_stages(&self.command)?;
        for stage in &mut stages {
            if let Some(cwd) = &self.cwd {
                stage.cwd = Some(cwd.clone());
            }
            stage.env.extend(self.env.iter().cloned());
        }
        Ok(stages)
    }
}

/// Split words on [`STAGE_SEPARATOR`] into one spec per stage.
pub fn split_stages(words: &[String]) -> anyhow::Result<Vec<StageSpec>> {
    words
        .split(|word| word == STAGE_SEPARATOR)
        .enumerate()
        .map(|(index, stage)| match stage.split_first() {
            Some((program, args)) => Ok(StageSpec::new(program).args(args.iter().cloned())),
            None => anyhow::bail!("stage {index} is empty; expected a program around `|`"),
        })
        .collect()
}

pub fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

/// Process exit code for a pipeline whose last stage reported `code`.
pub fn process_exit_code(code: i32) -> i32 {
    if code < 0 { exit_codes::FAILURE } else { code }
}

/// Per-stage JSON summary printed by `--report`.
pub fn report_json(result: &PipelineResult, error: Option<&PipelineError>) -> serde_json::Value {
    let stages: Vec<serde_json::Value> = result
        .iter()
        .map(|stage| {
            json!({
                "index": stage.index,
                "command": stage.command,
                "exit_code": stage.exit_code,
                "signal": stage.signal,
                "pid": stage.pid,
                "pgid": stage.pgid,
                "stdout_bytes": stage.stdout.len(),
                "stderr_bytes": stage.stderr.len(),
                "duration_ms": u64::try_from(stage.duration.as_millis()).unwrap_or(u64::MAX),
                "error": stage.error.as_ref().map(ToString::to_string),
            })
        })
        .collect();
    json!({
        "exit_code": result.exit_code(),
        "error": error.map(ToString::to_string),
        "stages": stages,
    })
}

/// Logs go to stderr, filtered by `RUST_LOG` (default `warn`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run the invocation described by `cli` and return the process exit code.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    let stages = cli.stages()?;

    if cli.pty {
        let [stage] = <[StageSpec; 1]>::try_from(stages).map_err(|stages| {
            anyhow::anyhow!("--pty runs exactly one program, got {} stages", stages.len())
        })?;
        let code = run_attached(stage).await?;
        return Ok(process_exit_code(code));
    }

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());
    let timeout = cli.timeout.map(Duration::from_secs).or(config.timeout);
    let _deadline = timeout.map(|timeout| cancel_after(cancel.clone(), timeout));
    let options = config.run_options();

    let (result, error) = if cli.buffered {
        let stdin = read_piped_stdin()?;
        let run = run_buffered(stages, stdin, &options, &cancel).await?;
        write_captured(&run.stdout, &run.stderr)?;
        (run.result, run.error)
    } else {
        let run = run_streaming(
            stages,
            Some(tokio::io::stdin()),
            tokio::io::stdout(),
            tokio::io::stderr(),
            &options,
            &cancel,
        )
        .await?;
        (run.result, run.error)
    };

    if cli.report {
        let report = serde_json::to_string_pretty(&report_json(&result, error.as_ref()))?;
        eprintln!("{report}");
    }
    if let Some(err) = &error {
        eprintln!("procpipe: {err}");
    }
    Ok(process_exit_code(result.exit_code()))
}

fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let config = loader.load().context("loading configuration")?;
    tracing::debug!(?config, "configuration loaded");
    Ok(config)
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling pipeline");
            cancel.cancel();
        }
    });
}

/// Whole stdin when it is redirected; `None` for an interactive terminal.
fn read_piped_stdin() -> anyhow::Result<Option<Vec<u8>>> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }
    let mut bytes = Vec::new();
    stdin
        .lock()
        .read_to_end(&mut bytes)
        .context("reading stdin")?;
    Ok(Some(bytes))
}

fn write_captured(stdout: &[u8], stderr: &[u8]) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(stdout)?;
    out.flush()?;
    let mut err = std::io::stderr().lock();
    err.write_all(stderr)?;
    err.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use procpipe_core::StageError;

    fn words(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn separator_splits_stages() {
        let stages = split_stages(&words(&["printf", "b\\na", "|", "sort", "-r"])).unwrap();

        assert_eq!(
            stages,
            vec![
                StageSpec::new("printf").arg("b\\na"),
                StageSpec::new("sort").arg("-r"),
            ]
        );
    }

    #[test]
    fn empty_stage_is_rejected() {
        for raw in [&["|", "cat"][..], &["cat", "|"], &["cat", "|", "|", "wc"]] {
            let err = split_stages(&words(raw)).unwrap_err();
            assert!(err.to_string().contains("is empty"), "{err}");
        }
    }

    #[test]
    fn cwd_and_env_apply_to_every_stage() {
        let cli = Cli::parse_from([
            "procpipe", "--cwd", "/tmp", "--env", "A=1", "--env", "B=x=y", "--", "env", "|",
            "sort",
        ]);

        let stages = cli.stages().unwrap();

        assert_eq!(stages.len(), 2);
        for stage in stages {
            assert_eq!(stage.cwd, Some(PathBuf::from("/tmp")));
            assert_eq!(stage.env.get("A").map(String::as_str), Some("1"));
            assert_eq!(stage.env.get("B").map(String::as_str), Some("x=y"));
        }
    }

    #[test]
    fn env_pairs_need_a_key() {
        assert_eq!(
            parse_env_pair("K=V"),
            Ok(("K".to_string(), "V".to_string()))
        );
        assert!(parse_env_pair("=V").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn negative_codes_become_failure() {
        assert_eq!(process_exit_code(0), exit_codes::SUCCESS);
        assert_eq!(process_exit_code(3), 3);
        assert_eq!(process_exit_code(-1), exit_codes::FAILURE);
    }

    #[test]
    fn pty_conflicts_with_buffered() {
        let err = Cli::try_parse_from(["procpipe", "--pty", "--buffered", "--", "sh"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[tokio::test]
    async fn report_lists_every_stage() {
        let run = run_buffered(
            vec![StageSpec::new("true"), StageSpec::new("false")],
            None,
            &Default::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let report = report_json(&run.result, run.error.as_ref());

        assert_eq!(report["exit_code"], 1);
        assert_eq!(report["stages"].as_array().map(Vec::len), Some(2));
        assert_eq!(report["stages"][0]["exit_code"], 0);
        assert!(report["stages"][0]["error"].is_null());
        assert!(report["stages"][1]["error"].is_string());
        assert!(report["error"].as_str().is_some_and(|e| e.contains("stage 1")));
        assert!(matches!(
            run.result.get(1).and_then(|s| s.error.as_ref()),
            Some(StageError::WaitFailure(_))
        ));
    }
}
