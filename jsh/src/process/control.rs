use anyhow::{Context as _, Result};
use nix::sys::signal::Signal;
use nix::sys::termios::{SetArg, Termios, tcgetattr, tcsetattr};
use nix::unistd::{Pid, tcsetpgrp};
use std::os::unix::io::RawFd;
use tracing::debug;

pub use super::signal::SignalTarget;

/// Terminal and signal operations a job performs on its process group.
///
/// The engine uses [`TerminalControl`]; tests substitute a recorder.
pub trait JobControl: Send + Sync {
    /// Give the controlling terminal to `pgid`.
    fn set_foreground(&self, pgid: Pid) -> Result<()>;

    /// Snapshot the terminal attributes, if there is a terminal.
    fn save_modes(&self) -> Option<Termios>;

    fn restore_modes(&self, modes: &Termios) -> Result<()>;

    fn send_signal(&self, target: SignalTarget, signal: Signal) -> Result<()>;
}

/// [`JobControl`] backed by a terminal descriptor.
#[derive(Debug, Clone, Copy)]
pub struct TerminalControl {
    fd: RawFd,
}

impl TerminalControl {
    pub fn new(fd: RawFd) -> Self {
        TerminalControl { fd }
    }
}

impl JobControl for TerminalControl {
    fn set_foreground(&self, pgid: Pid) -> Result<()> {
        debug!("🖥️ TERMINAL: tcsetpgrp fd={} pgid={}", self.fd, pgid);
        tcsetpgrp(self.fd, pgid).context("failed tcsetpgrp")?;
        Ok(())
    }

    fn save_modes(&self) -> Option<Termios> {
        tcgetattr(self.fd).ok()
    }

    fn restore_modes(&self, modes: &Termios) -> Result<()> {
        tcsetattr(self.fd, SetArg::TCSADRAIN, modes).context("failed tcsetattr")?;
        Ok(())
    }

    fn send_signal(&self, target: SignalTarget, signal: Signal) -> Result<()> {
        super::signal::send_signal(target, signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getpgrp, pipe};

    #[test]
    fn terminal_operations_fail_on_a_pipe() {
        let (read, write) = pipe().unwrap();
        let control = TerminalControl::new(read);
        assert!(control.save_modes().is_none());
        assert!(control.set_foreground(getpgrp()).is_err());
        nix::unistd::close(read).unwrap();
        nix::unistd::close(write).unwrap();
    }

    #[test]
    fn signals_reach_own_process() {
        let control = TerminalControl::new(0);
        // SIGCHLD is harmless to deliver to ourselves.
        assert!(
            control
                .send_signal(SignalTarget::Process(nix::unistd::getpid()), Signal::SIGCHLD)
                .is_ok()
        );
    }
}
