use jsh_types::ExitStatus;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::ops::{BitOr, BitOrAssign};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessState {
    Created,
    Running,
    Stopped(Signal),
    Terminated(ExitStatus),
}

impl ProcessState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, ProcessState::Terminated(_))
    }

    /// Created or Running: the stage may still produce a state change on its own.
    pub fn is_active(&self) -> bool {
        matches!(self, ProcessState::Created | ProcessState::Running)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProcessState::Created => formatter.write_str("created"),
            ProcessState::Running => formatter.write_str("running"),
            ProcessState::Stopped(_) => formatter.write_str("stopped"),
            ProcessState::Terminated(ExitStatus::Signaled(Signal::SIGKILL, _)) => {
                formatter.write_str("killed")
            }
            ProcessState::Terminated(ExitStatus::Signaled(Signal::SIGTERM, _)) => {
                formatter.write_str("terminated")
            }
            ProcessState::Terminated(_) => formatter.write_str("done"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Mode {
    #[default]
    Foreground,
    Background,
}

/// One of the three standard streams of a pipeline.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

/// Set of streams the host wants duplicated into pipes it can observe.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct StreamMask(u8);

impl StreamMask {
    pub const NONE: StreamMask = StreamMask(0);
    pub const STDIN: StreamMask = StreamMask(1);
    pub const STDOUT: StreamMask = StreamMask(1 << 1);
    pub const STDERR: StreamMask = StreamMask(1 << 2);
    pub const ALL: StreamMask = StreamMask(0b111);

    pub fn contains(self, other: StreamMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn has(self, stream: Stream) -> bool {
        self.contains(StreamMask::from(stream))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn remove(&mut self, other: StreamMask) {
        self.0 &= !other.0;
    }
}

impl From<Stream> for StreamMask {
    fn from(stream: Stream) -> Self {
        match stream {
            Stream::Stdin => StreamMask::STDIN,
            Stream::Stdout => StreamMask::STDOUT,
            Stream::Stderr => StreamMask::STDERR,
        }
    }
}

impl BitOr for StreamMask {
    type Output = StreamMask;

    fn bitor(self, rhs: StreamMask) -> StreamMask {
        StreamMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for StreamMask {
    fn bitor_assign(&mut self, rhs: StreamMask) {
        self.0 |= rhs.0;
    }
}

/// Job-level lifecycle notification kinds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum JobState {
    Running,
    Stopped,
    Terminated,
    /// A stage could not be forked.
    Failed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    pub exit_status: Option<ExitStatus>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProcessStatus {
    /// Position of the stage in its pipeline.
    pub index: usize,
    pub pid: Option<Pid>,
    pub state: ProcessState,
}
