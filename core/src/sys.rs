//! Platform shims for process groups, group signalling, and exit statuses.

use std::io;
use std::process::ExitStatus;

use crate::error::ExitDetails;

/// Signals the cancellation supervisor sends, mildest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupSignal {
    Interrupt,
    Kill,
}

impl GroupSignal {
    pub(crate) fn name(self) -> &'static str {
        match self {
            GroupSignal::Interrupt => "SIGINT",
            GroupSignal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            GroupSignal::Interrupt => libc::SIGINT,
            GroupSignal::Kill => libc::SIGKILL,
        }
    }
}

/// Outcome of a successful `kill(2)` call against a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// ESRCH: every member already exited.
    GroupGone,
}

#[cfg(unix)]
pub(crate) fn process_group_id(pid: u32) -> io::Result<i32> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    let pgid = unsafe { libc::getpgid(pid) };
    if pgid < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pgid)
}

#[cfg(not(unix))]
pub(crate) fn process_group_id(pid: u32) -> io::Result<i32> {
    i32::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))
}

/// Send `signal` to every process in group `pgid` via `kill(-pgid, sig)`.
#[cfg(unix)]
pub(crate) fn signal_process_group(pgid: i32, signal: GroupSignal) -> io::Result<Delivery> {
    // kill(0) and kill(-1) would hit our own group or every process we own.
    if pgid <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }
    let ret = unsafe { libc::kill(-pgid, signal.as_raw()) };
    if ret == 0 {
        return Ok(Delivery::Delivered);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(Delivery::GroupGone);
    }
    Err(err)
}

#[cfg(not(unix))]
pub(crate) fn signal_process_group(pgid: i32, signal: GroupSignal) -> io::Result<Delivery> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot send {} to process group {pgid} on this platform", signal.name()),
    ))
}

/// Best-effort precise exit details for a process that did not succeed.
pub(crate) fn exit_details(status: ExitStatus) -> ExitDetails {
    if status.success() {
        return ExitDetails::SUCCESS;
    }
    if let Some(code) = status.code() {
        return ExitDetails { code, signal: None };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitDetails {
                code: -1,
                signal: Some(signal),
            };
        }
    }
    ExitDetails::GENERIC_FAILURE
}
