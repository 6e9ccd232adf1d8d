use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::SignalError;

/// Sends a signal to a process, swallowing the case where the process is already dead.
///
/// Grounds the spec's "signal-to-dead-process is silently ignored" rule: `ESRCH` is the
/// only error nix can return for a bad pid here, so it is the only one we eat.
pub fn signal(pid: u32, sig: Signal) -> Result<(), SignalError> {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        Err(nix::Error::ESRCH) => Ok(()),
        Err(source) => Err(SignalError::Kill {
            pid: pid as i32,
            source,
        }),
    }
}

/// Sends `SIGKILL` to a process, swallowing the already-dead case.
pub fn kill(pid: u32) -> Result<(), SignalError> {
    signal(pid, Signal::SIGKILL)
}
