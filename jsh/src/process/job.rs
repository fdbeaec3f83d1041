use anyhow::{Context as _, Result};
use jsh_types::{ExitStatus, JshError};
use libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::sys::termios::Termios;
use nix::unistd::{Pid, pipe2, setpgid};
use parking_lot::Mutex;
use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::control::SignalTarget;
use super::fork::{ExecPlan, Placement, StageIo, fork_stage};
use super::io::Registration;
use super::process::Process;
use super::state::{JobState, JobStatus, Mode, ProcessState, ProcessStatus, Stream, StreamMask};
use super::wait::wait_pid_job;
use crate::buffer::Buffer;
use crate::engine::EngineShared;
use crate::event::{EventChannel, SubscriptionKey};
use crate::wake::set_nonblocking;

/// Every notification a job raises. All of them are delivered deferred, on
/// the engine's host thread.
#[derive(Debug, Clone, Default)]
pub struct JobEvents {
    pub stdout: EventChannel<Vec<u8>>,
    pub stderr: EventChannel<Vec<u8>>,
    pub io_closed: EventChannel<Stream>,
    pub state_changed: EventChannel<JobStatus>,
    pub process_state_changed: EventChannel<ProcessStatus>,
}

/// Bytes staged for the first stage's stdin, drained by the I/O thread.
#[derive(Debug, Default)]
pub(crate) struct StdinState {
    pub(crate) buffer: Buffer,
    pub(crate) closed: bool,
}

#[derive(Debug, Default)]
struct JobInner {
    processes: Vec<Process>,
    pgid: Option<Pid>,
    mode: Mode,
    saved_modes: Option<Termios>,
    duplicated: StreamMask,
    /// Duplicated output streams that have not reached end-of-stream.
    open: StreamMask,
    started: bool,
    exit_status: Option<ExitStatus>,
    last_state: Option<JobState>,
    /// The terminal went back to the shell after this job left the foreground.
    handed_back: bool,
    notified: bool,
}

impl JobInner {
    fn all_terminated(&self) -> bool {
        self.processes.iter().all(|p| p.state.is_terminated())
    }

    fn is_stopped(&self) -> bool {
        self.started
            && !self.all_terminated()
            && self.processes.iter().all(|p| !p.state.is_active())
    }

    fn is_io_closed(&self) -> bool {
        !self.open.has(Stream::Stdout) && !self.open.has(Stream::Stderr)
    }

    fn live_pids(&self) -> Vec<Pid> {
        self.processes
            .iter()
            .filter(|p| !p.state.is_terminated())
            .filter_map(|p| p.pid)
            .collect()
    }
}

/// A pipeline of processes sharing one process group.
pub struct Job {
    id: String,
    shared: Arc<EngineShared>,
    inner: Mutex<JobInner>,
    pub(crate) stdin: Mutex<StdinState>,
    events: JobEvents,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("pgid", &inner.pgid)
            .field("mode", &inner.mode)
            .field("processes", &inner.processes)
            .finish()
    }
}

fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).context("failed pipe2")?;
    Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

fn raw_or(fd: Option<&OwnedFd>, default: RawFd) -> RawFd {
    fd.map_or(default, |fd| fd.as_raw_fd())
}

impl Job {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Job {
            id: xid::new().to_string(),
            shared,
            inner: Mutex::new(JobInner::default()),
            stdin: Mutex::new(StdinState::default()),
            events: JobEvents::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append a stage. Only legal before [`Job::start`].
    pub fn add(&self, process: Process) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.started {
            return Err(JshError::AlreadyStarted {
                id: self.id.clone(),
            }
            .into());
        }
        inner.processes.push(process);
        Ok(())
    }

    /// Wire the pipeline, fork every stage, and hand the duplicated streams
    /// to the I/O thread.
    pub fn start(self: &Arc<Self>, mode: Mode, streams: StreamMask) -> Result<()> {
        let interactive = self.shared.interactive;
        let plans = {
            let inner = self.inner.lock();
            if inner.started {
                return Err(JshError::AlreadyStarted {
                    id: self.id.clone(),
                }
                .into());
            }
            if inner.processes.is_empty() {
                return Err(JshError::EmptyJob {
                    id: self.id.clone(),
                }
                .into());
            }
            inner
                .processes
                .iter()
                .map(ExecPlan::prepare)
                .collect::<Result<Vec<_>>>()?
        };
        let stages = plans.len();

        let mut chain_read = Vec::with_capacity(stages.saturating_sub(1));
        let mut chain_write = Vec::with_capacity(stages.saturating_sub(1));
        for _ in 1..stages {
            let (read, write) = cloexec_pipe()?;
            chain_read.push(Some(read));
            chain_write.push(Some(write));
        }

        let mut registration = Registration::default();
        let mut stdin_child = None;
        let mut stdout_child = None;
        let mut stderr_child = None;
        if streams.has(Stream::Stdin) {
            let (read, write) = cloexec_pipe()?;
            set_nonblocking(write.as_raw_fd())?;
            stdin_child = Some(read);
            registration.stdin = Some(write);
        }
        if streams.has(Stream::Stdout) {
            let (read, write) = cloexec_pipe()?;
            set_nonblocking(read.as_raw_fd())?;
            stdout_child = Some(write);
            registration.stdout = Some(read);
        }
        if streams.has(Stream::Stderr) {
            let (read, write) = cloexec_pipe()?;
            set_nonblocking(read.as_raw_fd())?;
            stderr_child = Some(write);
            registration.stderr = Some(read);
        }

        {
            let mut inner = self.inner.lock();
            if inner.started {
                return Err(JshError::AlreadyStarted {
                    id: self.id.clone(),
                }
                .into());
            }
            inner.started = true;
            inner.mode = mode;
            inner.duplicated = streams;
            let mut open = StreamMask::NONE;
            for stream in [Stream::Stdout, Stream::Stderr] {
                if streams.has(stream) {
                    open |= stream.into();
                }
            }
            inner.open = open;
        }

        if !registration.is_empty() {
            self.shared
                .mux
                .register(&self.id, Arc::downgrade(self), registration);
        }
        self.shared
            .live
            .lock()
            .insert(self.id.clone(), Arc::clone(self));

        let mut inner = self.inner.lock();
        debug!(
            "🚀 START: job {} '{}' mode={:?} streams={:?} interactive={}",
            self.id,
            command_of(&inner.processes),
            mode,
            streams,
            interactive
        );

        let mut leader: Option<Pid> = None;
        let mut failure = None;
        for (index, plan) in plans.iter().enumerate() {
            let io = StageIo {
                stdin: if index == 0 {
                    raw_or(stdin_child.as_ref(), STDIN_FILENO)
                } else {
                    raw_or(chain_read[index - 1].as_ref(), STDIN_FILENO)
                },
                stdout: if index + 1 == stages {
                    raw_or(stdout_child.as_ref(), STDOUT_FILENO)
                } else {
                    raw_or(chain_write[index].as_ref(), STDOUT_FILENO)
                },
                stderr: raw_or(stderr_child.as_ref(), STDERR_FILENO),
            };
            let placement = Placement {
                pgid: leader,
                interactive,
                foreground: mode == Mode::Foreground,
                terminal: self.shared.terminal,
            };

            match fork_stage(plan, io, placement) {
                Ok(pid) => {
                    let pgid = *leader.get_or_insert(pid);
                    if interactive && let Err(e) = setpgid(pid, pgid) {
                        // the child may already have exec'd after its own setpgid
                        debug!("🚀 START: setpgid({}, {}) failed: {}", pid, pgid, e);
                    }
                    let process = &mut inner.processes[index];
                    debug!("🚀 START: job {} stage {} '{}' pid {}", self.id, index, process, pid);
                    process.pid = Some(pid);
                    if process.set_state(ProcessState::Running) {
                        self.publish_process(index, Some(pid), ProcessState::Running);
                    }
                    if index > 0 {
                        chain_read[index - 1] = None;
                    }
                    if index + 1 < stages {
                        chain_write[index] = None;
                    }
                }
                Err(e) => {
                    failure = Some((index, e));
                    break;
                }
            }
        }
        drop(chain_read);
        drop(chain_write);
        drop(stdin_child);
        drop(stdout_child);
        drop(stderr_child);
        inner.pgid = if interactive { leader } else { None };

        if let Some((index, err)) = failure {
            error!(
                "🚀 START: job {} failed to fork stage {}: {:#}",
                self.id, index, err
            );
            for i in index..stages {
                let state = ProcessState::Terminated(ExitStatus::Unspawned);
                if inner.processes[i].set_state(state) {
                    self.publish_process(i, None, state);
                }
            }
            self.signal_members(&inner, Signal::SIGTERM);
            self.publish_state(&mut inner, JobState::Failed, None);
            drop(inner);
            self.shared.schedule_sweep();
            return Err(err.context(format!("failed to start job {}", self.id)));
        }

        if interactive && let Err(e) = self.apply_mode(&mut inner, mode, false) {
            warn!("🚀 START: job {} could not apply {:?}: {:#}", self.id, mode, e);
        }
        self.publish_state(&mut inner, JobState::Running, None);
        drop(inner);
        self.shared.schedule_sweep();
        Ok(())
    }

    /// Move the job between foreground and background, optionally resuming it.
    pub fn set_mode(&self, mode: Mode, resume: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.started || inner.all_terminated() {
            inner.mode = mode;
            return Ok(());
        }
        debug!(
            "🎛️ MODE: job {} -> {:?} resume={} pgid={:?}",
            self.id, mode, resume, inner.pgid
        );
        self.apply_mode(&mut inner, mode, resume)
    }

    fn apply_mode(&self, inner: &mut JobInner, mode: Mode, resume: bool) -> Result<()> {
        inner.mode = mode;
        let control = &self.shared.control;
        match inner.pgid {
            Some(pgid) if self.shared.interactive => {
                if mode == Mode::Foreground {
                    control.set_foreground(pgid)?;
                    inner.handed_back = false;
                    if resume {
                        if let Some(modes) = inner.saved_modes.as_ref() {
                            control.restore_modes(modes)?;
                        }
                        control.send_signal(SignalTarget::Group(pgid), Signal::SIGCONT)?;
                    }
                } else if resume {
                    control.send_signal(SignalTarget::Group(pgid), Signal::SIGCONT)?;
                }
            }
            _ => {
                if resume {
                    for pid in inner.live_pids() {
                        if let Err(e) =
                            control.send_signal(SignalTarget::Process(pid), Signal::SIGCONT)
                        {
                            debug!("🎛️ MODE: SIGCONT to {} failed: {:#}", pid, e);
                        }
                    }
                }
            }
        }
        if resume {
            self.mark_resumed(inner);
        }
        Ok(())
    }

    fn mark_resumed(&self, inner: &mut JobInner) {
        let mut resumed = false;
        for (index, process) in inner.processes.iter_mut().enumerate() {
            if matches!(process.state, ProcessState::Stopped(_))
                && process.set_state(ProcessState::Running)
            {
                resumed = true;
                self.publish_process(index, process.pid, ProcessState::Running);
            }
        }
        if resumed {
            self.publish_state(inner, JobState::Running, None);
        }
    }

    /// Ask every live stage to exit. Does not wait.
    pub fn terminate(&self) {
        let inner = self.inner.lock();
        if !inner.started || inner.all_terminated() {
            return;
        }
        debug!("🛑 TERMINATE: job {} pgid={:?}", self.id, inner.pgid);
        let control = &self.shared.control;
        let report = |target: SignalTarget, signal: Signal| {
            if let Err(e) = control.send_signal(target, signal) {
                debug!("🛑 TERMINATE: {:?} to {:?} failed: {:#}", signal, target, e);
            }
        };
        match inner.pgid {
            Some(pgid) => {
                report(SignalTarget::Group(pgid), Signal::SIGTERM);
                if inner
                    .processes
                    .iter()
                    .any(|p| matches!(p.state, ProcessState::Stopped(_)))
                {
                    report(SignalTarget::Group(pgid), Signal::SIGCONT);
                }
            }
            None => {
                for process in inner.processes.iter().filter(|p| !p.state.is_terminated()) {
                    if let Some(pid) = process.pid {
                        report(SignalTarget::Process(pid), Signal::SIGTERM);
                        if matches!(process.state, ProcessState::Stopped(_)) {
                            report(SignalTarget::Process(pid), Signal::SIGCONT);
                        }
                    }
                }
            }
        }
    }

    fn signal_members(&self, inner: &JobInner, signal: Signal) {
        let targets = match inner.pgid {
            Some(pgid) => vec![SignalTarget::Group(pgid)],
            None => inner
                .live_pids()
                .into_iter()
                .map(SignalTarget::Process)
                .collect(),
        };
        for target in targets {
            if let Err(e) = self.shared.control.send_signal(target, signal) {
                debug!("{:?} to {:?} failed: {:#}", signal, target, e);
            }
        }
    }

    /// Stage bytes for the first stage's stdin.
    pub fn write(&self, data: impl Into<Vec<u8>>) {
        {
            let mut stdin = self.stdin.lock();
            if stdin.closed {
                warn!("job {} stdin already closed, dropping write", self.id);
                return;
            }
            stdin.buffer.add(data.into());
        }
        self.shared.mux.schedule_write(&self.id);
    }

    /// Close stdin once the staged bytes are delivered.
    pub fn close(&self) {
        self.stdin.lock().closed = true;
        self.shared.mux.schedule_write(&self.id);
    }

    /// Collect state changes of every started, unfinished stage. Returns true
    /// once the job has raised `Terminated`.
    pub(crate) fn reap(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.started || inner.notified {
            return inner.notified;
        }

        let mut changed = false;
        for index in 0..inner.processes.len() {
            loop {
                let process = &mut inner.processes[index];
                let Some(pid) = process.pid else {
                    break;
                };
                if process.state.is_terminated() {
                    break;
                }
                let Some((_, state)) = wait_pid_job(pid, true) else {
                    break;
                };
                if process.set_state(state) {
                    debug!("🪦 REAP: job {} stage {} pid {} -> {:?}", self.id, index, pid, state);
                    changed = true;
                    self.publish_process(index, Some(pid), state);
                }
            }
        }

        if inner.all_terminated() {
            self.reclaim_terminal(&mut inner);
            return self.try_finish(&mut inner);
        }
        if changed && inner.is_stopped() && inner.last_state != Some(JobState::Stopped) {
            if self.shared.interactive && inner.mode == Mode::Foreground {
                inner.saved_modes = self.shared.control.save_modes();
                self.reclaim_terminal(&mut inner);
            }
            self.publish_state(&mut inner, JobState::Stopped, None);
        }
        false
    }

    /// Give the terminal back to the shell when a foreground job leaves it.
    fn reclaim_terminal(&self, inner: &mut JobInner) {
        if !self.shared.interactive
            || inner.mode != Mode::Foreground
            || inner.handed_back
            || inner.pgid.is_none()
        {
            return;
        }
        inner.handed_back = true;
        let shell_pgid = self.shared.shell_pgid;
        if let Err(e) = self.shared.control.set_foreground(shell_pgid) {
            warn!("could not return terminal to shell group {}: {:#}", shell_pgid, e);
        }
    }

    /// Raise `Terminated` once every stage is done and both outputs are closed.
    fn try_finish(&self, inner: &mut JobInner) -> bool {
        if inner.notified {
            return true;
        }
        if !inner.started || !inner.all_terminated() || !inner.is_io_closed() {
            return false;
        }
        if inner.exit_status.is_none() {
            inner.exit_status = inner.processes.last().and_then(|p| p.exit_status());
        }
        inner.notified = true;
        let exit_status = inner.exit_status;
        debug!("🏁 DONE: job {} exit {:?}", self.id, exit_status);
        self.publish_state(inner, JobState::Terminated, exit_status);
        true
    }

    /// Called by the I/O thread after the last byte of `stream` was posted.
    pub(crate) fn close_stream(&self, stream: Stream) {
        self.events
            .io_closed
            .publish_deferred(&self.shared.dispatcher, stream);
        let finished = {
            let mut inner = self.inner.lock();
            inner.open.remove(stream.into());
            self.try_finish(&mut inner)
        };
        if finished {
            self.retire();
        }
    }

    pub(crate) fn publish_output(&self, stream: Stream, data: Vec<u8>) {
        let channel = match stream {
            Stream::Stdout => &self.events.stdout,
            Stream::Stderr => &self.events.stderr,
            Stream::Stdin => return,
        };
        channel.publish_deferred(&self.shared.dispatcher, data);
    }

    /// Drop the job from the engine's live set.
    pub(crate) fn retire(&self) {
        let removed = self.shared.live.lock().shift_remove(&self.id);
        if removed.is_some() {
            debug!("job {} retired", self.id);
        }
    }

    fn publish_process(&self, index: usize, pid: Option<Pid>, state: ProcessState) {
        self.events
            .process_state_changed
            .publish_deferred(&self.shared.dispatcher, ProcessStatus { index, pid, state });
    }

    fn publish_state(&self, inner: &mut JobInner, state: JobState, exit_status: Option<ExitStatus>) {
        inner.last_state = Some(state);
        self.events
            .state_changed
            .publish_deferred(&self.shared.dispatcher, JobStatus { state, exit_status });
    }

    /// Display form, e.g. `printf a | cat`.
    pub fn command(&self) -> String {
        command_of(&self.inner.lock().processes)
    }

    pub fn pgid(&self) -> Option<Pid> {
        self.inner.lock().pgid
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().mode
    }

    pub fn streams(&self) -> StreamMask {
        self.inner.lock().duplicated
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    /// No stage is created or running, and at least one is still alive.
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().is_stopped()
    }

    pub fn is_terminated(&self) -> bool {
        let inner = self.inner.lock();
        inner.started && inner.all_terminated()
    }

    pub fn is_io_closed(&self) -> bool {
        self.inner.lock().is_io_closed()
    }

    /// Exit status of the last stage, once the whole job has terminated.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.lock().exit_status
    }

    pub fn saved_modes(&self) -> Option<Termios> {
        self.inner.lock().saved_modes.clone()
    }

    pub fn process_states(&self) -> Vec<ProcessStatus> {
        self.inner
            .lock()
            .processes
            .iter()
            .enumerate()
            .map(|(index, p)| ProcessStatus {
                index,
                pid: p.pid,
                state: p.state,
            })
            .collect()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.inner
            .lock()
            .processes
            .iter()
            .filter_map(|p| p.pid)
            .collect()
    }

    pub fn events(&self) -> &JobEvents {
        &self.events
    }

    pub fn on_stdout<F>(&self, callback: F) -> SubscriptionKey
    where
        F: Fn(&Vec<u8>) + Send + Sync + 'static,
    {
        self.events.stdout.subscribe(callback)
    }

    pub fn on_stderr<F>(&self, callback: F) -> SubscriptionKey
    where
        F: Fn(&Vec<u8>) + Send + Sync + 'static,
    {
        self.events.stderr.subscribe(callback)
    }

    pub fn on_io_closed<F>(&self, callback: F) -> SubscriptionKey
    where
        F: Fn(&Stream) + Send + Sync + 'static,
    {
        self.events.io_closed.subscribe(callback)
    }

    pub fn on_state_changed<F>(&self, callback: F) -> SubscriptionKey
    where
        F: Fn(&JobStatus) + Send + Sync + 'static,
    {
        self.events.state_changed.subscribe(callback)
    }

    pub fn on_process_state_changed<F>(&self, callback: F) -> SubscriptionKey
    where
        F: Fn(&ProcessStatus) + Send + Sync + 'static,
    {
        self.events.process_state_changed.subscribe(callback)
    }
}

fn command_of(processes: &[Process]) -> String {
    processes
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}

impl Drop for Job {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.started && !inner.all_terminated() {
            warn!(
                "job {} '{}' dropped before all of its processes terminated",
                self.id,
                command_of(&inner.processes)
            );
        }
        self.shared.mux.wakeup();
    }
}
