use anyhow::Result;
use indexmap::IndexMap;
use jsh_types::{JOB_CONTROL_SIGNALS, JshError, Session, ignore_signals};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::config::EngineConfig;
use crate::event::Dispatcher;
use crate::process::control::{JobControl, TerminalControl};
use crate::process::io::Multiplexer;
use crate::process::signal::ChildSignal;
use crate::process::Job;

/// State every job of one engine shares.
pub(crate) struct EngineShared {
    pub(crate) interactive: bool,
    pub(crate) shell_pgid: Pid,
    pub(crate) terminal: RawFd,
    pub(crate) session: Mutex<Session>,
    pub(crate) control: Arc<dyn JobControl>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) mux: Multiplexer,
    /// Started jobs that have not yet raised `Terminated`.
    pub(crate) live: Mutex<IndexMap<String, Arc<Job>>>,
    child_signal: Mutex<Option<ChildSignal>>,
    stopped: AtomicBool,
}

impl EngineShared {
    /// Make the next dispatch sweep every live job.
    pub(crate) fn schedule_sweep(&self) {
        if let Some(signal) = self.child_signal.lock().as_ref() {
            signal.mark_pending();
        }
        self.dispatcher.wake();
    }
}

/// Handle to one job-control engine.
///
/// The thread that calls [`Engine::init`] becomes the host thread: every job
/// event is delivered there from [`Engine::dispatch`].
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("interactive", &self.shared.interactive)
            .field("shell_pgid", &self.shared.shell_pgid)
            .field("jobs", &self.shared.live.lock().len())
            .finish()
    }
}

impl Engine {
    pub fn init(config: EngineConfig) -> Result<Self> {
        let control = Arc::new(TerminalControl::new(config.terminal_fd));
        Self::with_control(config, control)
    }

    /// Like [`Engine::init`], routing terminal and signal operations through `control`.
    ///
    /// SIGPIPE is ignored process-wide so a reader exiting early surfaces as
    /// EPIPE on the job's stdin. An interactive engine also ignores SIGTSTP,
    /// SIGTTIN and SIGTTOU, since it hands the terminal back from a
    /// background group; children get the defaults again before exec.
    pub fn with_control(config: EngineConfig, control: Arc<dyn JobControl>) -> Result<Self> {
        let mut session = if config.claim_terminal {
            Session::claim(config.terminal_fd)?
        } else {
            Session::detect(config.terminal_fd)
        };
        if let Some(interactive) = config.interactive {
            session.interactive = interactive;
        }
        ignore_signals(&[Signal::SIGPIPE])?;
        if session.interactive {
            ignore_signals(&JOB_CONTROL_SIGNALS)?;
        }

        let dispatcher = Dispatcher::new()?;
        let mux = Multiplexer::spawn(config.write_chunk_size, config.read_buffer_size)?;
        let child_signal = ChildSignal::register(dispatcher.wake_write_fd())?;
        debug!(
            "engine ready: pid={} pgid={} interactive={}",
            session.pid, session.pgid, session.interactive
        );

        Ok(Engine {
            shared: Arc::new(EngineShared {
                interactive: session.interactive,
                shell_pgid: session.pgid,
                terminal: session.terminal,
                session: Mutex::new(session),
                control,
                dispatcher,
                mux,
                live: Mutex::new(IndexMap::new()),
                child_signal: Mutex::new(Some(child_signal)),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// A new, empty job bound to this engine.
    pub fn create_job(&self) -> Arc<Job> {
        Arc::new(Job::new(Arc::clone(&self.shared)))
    }

    /// Started jobs that have not finished yet, oldest first.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.shared.live.lock().values().cloned().collect()
    }

    pub fn find_job(&self, id: &str) -> Option<Arc<Job>> {
        self.shared.live.lock().get(id).cloned()
    }

    pub fn session(&self) -> Session {
        self.shared.session.lock().clone()
    }

    pub fn is_interactive(&self) -> bool {
        self.shared.interactive
    }

    /// Readable whenever [`Engine::dispatch`] has work; for embedding in another event loop.
    pub fn wake_fd(&self) -> RawFd {
        self.shared.dispatcher.wake_fd()
    }

    /// Wait up to `timeout` for activity, reap children if SIGCHLD arrived,
    /// and deliver every queued event. Returns the number of deliveries.
    pub fn dispatch(&self, timeout: Option<Duration>) -> Result<usize> {
        if !self.shared.dispatcher.is_host_thread() {
            return Err(JshError::NotHostThread.into());
        }
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(JshError::EngineStopped.into());
        }
        self.shared.dispatcher.wait(timeout)?;
        let pending = self
            .shared
            .child_signal
            .lock()
            .as_ref()
            .is_some_and(|signal| signal.take_pending());
        if pending {
            self.reap();
        }
        self.shared.dispatcher.flush()
    }

    /// Sweep every live job for state changes, as a SIGCHLD would.
    pub fn reap(&self) {
        let jobs = self.jobs();
        debug!("🪦 REAP: sweeping {} jobs", jobs.len());
        for job in jobs {
            if job.reap() {
                job.retire();
            }
        }
    }

    /// Stop the I/O thread and detach from SIGCHLD. Running jobs are left alone.
    pub fn deinit(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("engine shutting down");
        self.shared.mux.stop();
        self.shared.child_signal.lock().take();
        let jobs = std::mem::take(&mut *self.shared.live.lock());
        for job in jobs.values() {
            if !job.is_terminated() {
                debug!("job {} '{}' still running at shutdown", job.id(), job.command());
            }
        }
    }
}
