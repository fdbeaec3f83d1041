use crate::{JshError, JshResult};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, killpg, sigaction};
use nix::sys::termios::{SetArg, Termios, tcgetattr, tcsetattr};
use nix::unistd::{Pid, getpgrp, getpid, isatty, setpgid, tcgetpgrp, tcsetpgrp};
use serde::Deserialize;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use tracing::{debug, warn};

/// How pending terminal I/O is treated when attributes are reapplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushPolicy {
    /// Apply immediately.
    Now,
    /// Apply after queued output has been transmitted.
    #[default]
    Drain,
    /// Like `Drain`, and discard unread input.
    Flush,
}

impl FlushPolicy {
    pub fn as_set_arg(self) -> SetArg {
        match self {
            FlushPolicy::Now => SetArg::TCSANOW,
            FlushPolicy::Drain => SetArg::TCSADRAIN,
            FlushPolicy::Flush => SetArg::TCSAFLUSH,
        }
    }
}

impl FromStr for FlushPolicy {
    type Err = JshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "now" => Ok(FlushPolicy::Now),
            "drain" => Ok(FlushPolicy::Drain),
            "flush" => Ok(FlushPolicy::Flush),
            other => Err(JshError::Terminal(format!("invalid mode for restore: {other}"))),
        }
    }
}

/// Signals that stop a process touching a terminal it does not own.
pub const JOB_CONTROL_SIGNALS: [Signal; 3] = [Signal::SIGTSTP, Signal::SIGTTIN, Signal::SIGTTOU];

/// Set `signals` to `SIG_IGN` for the whole process.
pub fn ignore_signals(signals: &[Signal]) -> JshResult<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for signal in signals {
        unsafe { sigaction(*signal, &ignore) }?;
    }
    debug!("ignoring {:?}", signals);
    Ok(())
}

/// The shell's own place in the terminal session.
#[derive(Debug, Clone)]
pub struct Session {
    pub pid: Pid,
    pub pgid: Pid,
    pub interactive: bool,
    /// Descriptor of the controlling terminal (usually stdin).
    pub terminal: RawFd,
    tmodes: Option<Termios>,
}

impl Session {
    /// Describe the current process without changing terminal ownership.
    pub fn detect(terminal: RawFd) -> Self {
        let interactive = isatty(terminal).unwrap_or(false);
        debug!("Terminal detection for fd {}: {}", terminal, interactive);

        let tmodes = if interactive {
            match tcgetattr(terminal) {
                Ok(tmodes) => Some(tmodes),
                Err(err) => {
                    warn!("Failed to get terminal attributes for fd {}: {}", terminal, err);
                    None
                }
            }
        } else {
            None
        };

        Session {
            pid: getpid(),
            pgid: getpgrp(),
            interactive,
            terminal,
            tmodes,
        }
    }

    /// Make the shell a process group leader owning `terminal`.
    ///
    /// Blocks (by stopping itself with SIGTTIN) until the shell is in the
    /// foreground, then ignores the interactive and job-control signals so the
    /// shell survives terminal hand-offs. Non-interactive sessions are returned
    /// unchanged.
    pub fn claim(terminal: RawFd) -> JshResult<Self> {
        let mut session = Session::detect(terminal);
        if !session.interactive {
            return Ok(session);
        }

        loop {
            let owner = tcgetpgrp(terminal)?;
            session.pgid = getpgrp();
            if owner == session.pgid {
                break;
            }
            debug!(
                "terminal owned by {}, stopping own group {}",
                owner, session.pgid
            );
            killpg(session.pgid, Signal::SIGTTIN)?;
        }

        ignore_signals(&[Signal::SIGINT, Signal::SIGQUIT])?;
        ignore_signals(&JOB_CONTROL_SIGNALS)?;

        let pid = getpid();
        if let Err(err) = setpgid(pid, pid) {
            // EPERM when already a session leader, checked below.
            debug!("setpgid for shell failed: {}", err);
        }
        session.pgid = getpgrp();
        if session.pgid != pid {
            return Err(JshError::Terminal(
                "unable to set process as group leader".to_string(),
            ));
        }

        tcsetpgrp(terminal, session.pgid).map_err(|err| {
            JshError::Terminal(format!("unable to set process group for terminal: {err}"))
        })?;
        session.tmodes = Some(tcgetattr(terminal).map_err(|err| {
            JshError::Terminal(format!("unable to get terminal attributes: {err}"))
        })?);
        debug!("claimed terminal {} for pgid {}", terminal, session.pgid);
        Ok(session)
    }

    /// Terminal attributes saved when the session was created.
    pub fn tmodes(&self) -> Option<&Termios> {
        self.tmodes.as_ref()
    }

    /// Reapply the shell's saved terminal attributes.
    pub fn restore(&self, policy: FlushPolicy) -> JshResult<()> {
        if !self.interactive {
            return Err(JshError::Terminal(
                "can't restore state for non-interactive shell".to_string(),
            ));
        }
        let Some(tmodes) = self.tmodes.as_ref() else {
            return Err(JshError::Terminal(
                "no saved terminal attributes".to_string(),
            ));
        };
        tcsetattr(self.terminal, policy.as_set_arg(), tmodes).map_err(|err| {
            JshError::Terminal(format!("unable to set terminal attributes: {err}"))
        })
    }
}
