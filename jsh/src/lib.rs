//! Job-control engine for an interactive shell.
//!
//! An [`Engine`] spawns pipelines ([`Job`]s) of [`Process`]es, moves their
//! stdio on a background thread, reaps them on SIGCHLD, and delivers every
//! notification on the thread that created it via [`Engine::dispatch`].

pub mod buffer;
pub mod config;
pub mod engine;
pub mod event;
pub mod process;
mod wake;

pub use buffer::Buffer;
pub use config::EngineConfig;
pub use engine::Engine;
pub use event::{Dispatcher, EventChannel, SubscriptionKey};
pub use jsh_types::{ExitStatus, FlushPolicy, JshError, JshResult, Session};
pub use process::{
    EXEC_FAILED, Job, JobControl, JobEvents, JobState, JobStatus, Mode, Process, ProcessState,
    ProcessStatus, Redirect, RedirectTarget, SignalTarget, Stream, StreamMask, TerminalControl,
};
