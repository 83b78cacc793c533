//! Terminal-attached runner: one interactive process on a fresh pseudo-terminal.
//!
//! ```text
//!   our stdin ──(raw mode)──▶ pty master ──▶ slave ──▶ child
//!   our stdout ◀───────────── pty master ◀── slave ◀── child
//!   SIGWINCH ──▶ crossterm::terminal::size ──▶ master.resize
//! ```

use std::io;
use std::io::IsTerminal;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use portable_pty::CommandBuilder;
use portable_pty::ExitStatus;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::stage::StageSpec;

const FALLBACK_ROWS: u16 = 24;
const FALLBACK_COLS: u16 = 80;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("no program given")]
    MissingProgram,

    #[error("failed to start `{command}` on a pseudo-terminal: {message}")]
    StartFailure { command: String, message: String },
}

type SharedMaster = Arc<Mutex<Box<dyn MasterPty + Send>>>;

/// Run `spec` attached to a new pseudo-terminal and return its exit code.
///
/// Only a failure to start is an error; once the process is running its
/// exit code is returned whatever it is, and -1 if it cannot be collected.
pub async fn run_attached(spec: StageSpec) -> Result<i32, PtyError> {
    if spec.is_blank() {
        return Err(PtyError::MissingProgram);
    }
    let command = spec.command_line();
    let start_failure = |err: anyhow::Error| PtyError::StartFailure {
        command: command.clone(),
        message: format!("{err:#}"),
    };

    let pair = native_pty_system()
        .openpty(current_size())
        .map_err(start_failure)?;
    let mut child = pair
        .slave
        .spawn_command(command_builder(&spec))
        .map_err(start_failure)?;
    // Our copy of the slave must go, or the master never sees EOF.
    drop(pair.slave);

    let io_handles = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
    let (reader, writer) = match io_handles {
        Ok(handles) => handles,
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(start_failure(err));
        }
    };
    tracing::debug!(command = %command, pid = ?child.process_id(), "pty child started");

    let master: SharedMaster = Arc::new(Mutex::new(pair.master));
    let _raw_mode = RawModeGuard::enable();
    let resizer = forward_resizes(Arc::clone(&master));

    // Blocks on our stdin; it cannot be interrupted, so it is left detached.
    // `done` keeps it from forwarding input read after the child is gone.
    let done = Arc::new(AtomicBool::new(false));
    std::thread::spawn({
        let done = Arc::clone(&done);
        move || copy_input(io::stdin().lock(), writer, &done)
    });

    let output = tokio::task::spawn_blocking(move || copy_output(reader)).await;
    if let Ok(Err(err)) | Err(err) = output.map_err(io::Error::other) {
        tracing::debug!(error = %err, "pty output copy ended with an error");
    }
    done.store(true, Ordering::SeqCst);
    resizer.abort();

    let waited = tokio::task::spawn_blocking(move || child.wait())
        .await
        .map_err(io::Error::other)
        .and_then(|waited| waited);
    let code = exit_code(&command, waited);
    tracing::debug!(command = %command, code, "pty child exited");
    Ok(code)
}

fn exit_code(command: &str, waited: io::Result<ExitStatus>) -> i32 {
    match waited {
        Ok(status) => i32::try_from(status.exit_code()).unwrap_or(-1),
        Err(err) => {
            tracing::warn!(
                command = %command,
                error = %err,
                "could not collect pty child status"
            );
            -1
        }
    }
}

fn command_builder(spec: &StageSpec) -> CommandBuilder {
    let mut builder = CommandBuilder::new(&spec.program);
    builder.args(&spec.args);
    builder.cwd(spec.effective_cwd());
    for (key, value) in &spec.env {
        builder.env(key, value);
    }
    builder
}

fn current_size() -> PtySize {
    let (cols, rows) =
        crossterm::terminal::size().unwrap_or((FALLBACK_COLS, FALLBACK_ROWS));
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn apply_size(master: &SharedMaster) {
    let size = current_size();
    let master = master.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(err) = master.resize(size) {
        tracing::debug!(error = %err, "pty resize failed");
    }
}

/// Apply the current size once, then again on every SIGWINCH.
fn forward_resizes(master: SharedMaster) -> JoinHandle<()> {
    tokio::spawn(async move {
        apply_size(&master);
        #[cfg(unix)]
        {
            use tokio::signal::unix::SignalKind;
            use tokio::signal::unix::signal;

            let mut resized = match signal(SignalKind::window_change()) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(error = %err, "cannot watch terminal resizes");
                    return;
                }
            };
            while resized.recv().await.is_some() {
                apply_size(&master);
            }
        }
    })
}

fn copy_input(mut input: impl Read, mut writer: impl Write, done: &AtomicBool) {
    let mut chunk = [0u8; 1024];
    loop {
        if done.load(Ordering::SeqCst) {
            return;
        }
        match input.read(&mut chunk) {
            Ok(0) => return,
            Ok(_) if done.load(Ordering::SeqCst) => return,
            Ok(read) => {
                if writer.write_all(&chunk[..read]).is_err() || writer.flush().is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

fn copy_output(mut reader: Box<dyn Read + Send>) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(read) => {
                stdout.write_all(&chunk[..read])?;
                stdout.flush()?;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            // Linux reports a closed slave as EIO rather than EOF.
            Err(err) if is_closed_pty(&err) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

#[cfg(unix)]
fn is_closed_pty(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

#[cfg(not(unix))]
fn is_closed_pty(_err: &io::Error) -> bool {
    false
}

/// Puts our stdin into raw mode and restores it when dropped.
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn enable() -> Self {
        if !io::stdin().is_terminal() {
            tracing::debug!("stdin is not a terminal, leaving it in cooked mode");
            return Self { enabled: false };
        }
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => Self { enabled: true },
            Err(err) => {
                tracing::debug!(error = %err, "could not enable raw mode");
                Self { enabled: false }
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}
