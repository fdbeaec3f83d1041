use jsh_types::ExitStatus;
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, error, warn};

use super::state::ProcessState;

/// Collect a state change for `pid`. Returns None when nothing was reported.
pub fn wait_pid_job(pid: Pid, no_hang: bool) -> Option<(Pid, ProcessState)> {
    let options = if no_hang {
        WaitPidFlag::WUNTRACED | WaitPidFlag::WNOHANG
    } else {
        WaitPidFlag::WUNTRACED
    };

    let result = loop {
        match waitpid(pid, Some(options)) {
            Err(Errno::EINTR) => continue,
            other => break other,
        }
    };
    let res = match result {
        Ok(WaitStatus::Exited(pid, status)) => {
            debug!("⏳ WAIT: Process {} exited with status {}", pid, status);
            (pid, ProcessState::Terminated(ExitStatus::Exited(status)))
        }
        Ok(WaitStatus::Signaled(pid, signal, core_dumped)) => {
            debug!(
                "⏳ WAIT: Process {} killed by {:?}, core_dumped: {}",
                pid, signal, core_dumped
            );
            (
                pid,
                ProcessState::Terminated(ExitStatus::Signaled(signal, core_dumped)),
            )
        }
        Ok(WaitStatus::Stopped(pid, signal)) => {
            debug!("⏳ WAIT: Process {} stopped by {:?}", pid, signal);
            (pid, ProcessState::Stopped(signal))
        }
        Err(Errno::ECHILD) => {
            warn!("⏳ WAIT: No child process {} (ECHILD), treating as exited", pid);
            (pid, ProcessState::Terminated(ExitStatus::Exited(1)))
        }
        Ok(WaitStatus::StillAlive) | Ok(WaitStatus::Continued(_)) => return None,
        status => {
            error!("⏳ WAIT: Unexpected waitpid status for {}: {:?}", pid, status);
            return None;
        }
    };
    Some(res)
}
