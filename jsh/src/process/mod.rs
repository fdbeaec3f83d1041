#![allow(clippy::module_inception)]

pub mod control;
pub mod fork;
pub(crate) mod io;
pub mod job;
pub mod process;
pub mod redirect;
pub mod signal;
pub mod state;
pub mod wait;

pub use control::{JobControl, SignalTarget, TerminalControl};
pub use fork::EXEC_FAILED;
pub use job::{Job, JobEvents};
pub use process::Process;
pub use redirect::{Redirect, RedirectTarget};
pub use state::{JobState, JobStatus, Mode, ProcessState, ProcessStatus, Stream, StreamMask};
pub use wait::wait_pid_job;
