use nix::sys::signal::Signal;
use std::fmt;
use thiserror::Error;

pub mod terminal;
pub use terminal::{FlushPolicy, JOB_CONTROL_SIGNALS, Session, ignore_signals};

/// jsh specific error types
#[derive(Error, Debug)]
pub enum JshError {
    #[error("System call failed: {0}")]
    System(#[from] nix::errno::Errno),

    #[error("job {id} has already been started")]
    AlreadyStarted { id: String },

    #[error("job {id} has no processes")]
    EmptyJob { id: String },

    #[error("operation must run on the host thread")]
    NotHostThread,

    #[error("engine has been shut down")]
    EngineStopped,

    #[error("too many engines in one process (limit {0})")]
    TooManyEngines(usize),

    #[error("Terminal operation failed: {0}")]
    Terminal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type JshResult<T> = std::result::Result<T, JshError>;

/// Decoded wait status of a finished stage.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal, bool),
    /// The stage was never forked.
    Unspawned,
}

impl ExitStatus {
    /// Shell-style status code: signals map to `128 + signo`, unspawned stages to 127.
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal, _) => 128 + *signal as i32,
            ExitStatus::Unspawned => 127,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit {code}"),
            ExitStatus::Signaled(signal, true) => write!(f, "{signal} (core dumped)"),
            ExitStatus::Signaled(signal, false) => write!(f, "{signal}"),
            ExitStatus::Unspawned => f.write_str("not started"),
        }
    }
}
