use anyhow::{Context as _, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::unistd::{read, write};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, warn};

use super::job::Job;
use super::state::Stream;
use crate::wake::WakePipe;

/// Upper bound on bytes collected from one stream in a single readiness pass.
const MAX_BURST: usize = 1024 * 1024;

/// Host-facing pipe ends handed to the multiplexer when a job starts.
#[derive(Debug, Default)]
pub(crate) struct Registration {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl Registration {
    pub(crate) fn is_empty(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

#[derive(Debug)]
struct PendingWrite {
    data: Vec<u8>,
    offset: usize,
}

struct Entry {
    job: Weak<Job>,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
    needs_write: bool,
    pending: Option<PendingWrite>,
}

impl Entry {
    /// Move staged stdin bytes into the pipe until it would block.
    fn flush_stdin(&mut self, job: &Job, chunk_size: usize) -> nix::Result<()> {
        let fd = match self.stdin.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => {
                // nowhere to deliver
                job.stdin.lock().buffer.clear();
                self.needs_write = false;
                return Ok(());
            }
        };

        loop {
            if self.pending.is_none() {
                let mut stdin = job.stdin.lock();
                if stdin.buffer.is_empty() {
                    let closed = stdin.closed;
                    drop(stdin);
                    self.needs_write = false;
                    if closed {
                        debug!("🔁 MUX: Closing stdin of job {}", job.id());
                        self.stdin = None;
                    }
                    return Ok(());
                }
                let mut data = vec![0u8; chunk_size.min(stdin.buffer.size())];
                let n = stdin.buffer.read(&mut data);
                data.truncate(n);
                self.pending = Some(PendingWrite { data, offset: 0 });
            }

            let pending = match self.pending.as_mut() {
                Some(pending) => pending,
                None => continue,
            };
            match write(fd, &pending.data[pending.offset..]) {
                Ok(n) => {
                    pending.offset += n;
                    if pending.offset >= pending.data.len() {
                        self.pending = None;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    // resumed on POLLOUT
                    self.needs_write = false;
                    return Ok(());
                }
                Err(Errno::EPIPE) => {
                    debug!("🔁 MUX: stdin of job {} hit EPIPE", job.id());
                    self.stdin = None;
                    self.pending = None;
                    self.needs_write = false;
                    job.stdin.lock().buffer.clear();
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one output stream until it would block or reaches end-of-stream.
    fn drain_output(&mut self, stream: Stream, job: &Job, scratch: &mut [u8]) -> nix::Result<()> {
        let slot = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
            Stream::Stdin => return Ok(()),
        };
        let fd = match slot.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => return Ok(()),
        };

        let mut data = Vec::new();
        let mut eof = false;
        let result = loop {
            if data.len() >= MAX_BURST {
                break Ok(());
            }
            match read(fd, scratch) {
                Ok(0) => {
                    eof = true;
                    break Ok(());
                }
                Ok(n) => data.extend_from_slice(&scratch[..n]),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if !data.is_empty() {
            job.publish_output(stream, data);
        }
        if eof {
            debug!("🔁 MUX: {:?} of job {} reached end-of-stream", stream, job.id());
            *slot = None;
            job.close_stream(stream);
        }
        result
    }

    /// Close every remaining descriptor, announcing the output streams.
    fn abandon(mut self, job: &Job) {
        self.stdin = None;
        if let Some(fd) = self.stdout.take() {
            drop(fd);
            job.close_stream(Stream::Stdout);
        }
        if let Some(fd) = self.stderr.take() {
            drop(fd);
            job.close_stream(Stream::Stderr);
        }
    }
}

#[derive(Debug, Clone)]
struct Interest {
    id: String,
    stream: Stream,
    fd: RawFd,
    flags: PollFlags,
}

struct MuxShared {
    registry: Mutex<HashMap<String, Entry>>,
    stopped: AtomicBool,
    wake: WakePipe,
    write_chunk: usize,
    read_buffer: usize,
}

impl MuxShared {
    /// Prune dead jobs, push pending stdin, and collect what to wait on.
    fn prepare(&self) -> Vec<Interest> {
        let mut registry = self.registry.lock();
        registry.retain(|id, entry| {
            let alive = entry.job.strong_count() > 0;
            if !alive {
                debug!("🔁 MUX: Pruning dropped job {}", id);
            }
            alive
        });

        let mut failed = Vec::new();
        for (id, entry) in registry.iter_mut() {
            if !entry.needs_write {
                continue;
            }
            if let Some(job) = entry.job.upgrade()
                && let Err(e) = entry.flush_stdin(&job, self.write_chunk)
            {
                warn!("🔁 MUX: Writing stdin of job {} failed: {}", id, e);
                failed.push((id.clone(), job));
            }
        }
        for (id, job) in failed {
            if let Some(entry) = registry.remove(&id) {
                entry.abandon(&job);
            }
        }

        let mut interest = Vec::new();
        for (id, entry) in registry.iter() {
            if let Some(fd) = &entry.stdin
                && entry.pending.is_some()
            {
                interest.push(Interest {
                    id: id.clone(),
                    stream: Stream::Stdin,
                    fd: fd.as_raw_fd(),
                    flags: PollFlags::POLLOUT,
                });
            }
            for (stream, fd) in [(Stream::Stdout, &entry.stdout), (Stream::Stderr, &entry.stderr)] {
                if let Some(fd) = fd {
                    interest.push(Interest {
                        id: id.clone(),
                        stream,
                        fd: fd.as_raw_fd(),
                        flags: PollFlags::POLLIN,
                    });
                }
            }
        }
        interest
    }

    fn service(&self, ready: &[Interest], scratch: &mut [u8]) {
        let mut registry = self.registry.lock();
        for interest in ready {
            let Some(entry) = registry.get_mut(&interest.id) else {
                continue;
            };
            if interest.stream == Stream::Stdin {
                entry.needs_write = true;
                continue;
            }
            let Some(job) = entry.job.upgrade() else {
                continue;
            };
            if let Err(e) = entry.drain_output(interest.stream, &job, scratch) {
                warn!(
                    "🔁 MUX: Reading {:?} of job {} failed: {}",
                    interest.stream, interest.id, e
                );
                if let Some(entry) = registry.remove(&interest.id) {
                    entry.abandon(&job);
                }
            }
        }
    }

    fn run(self: Arc<Self>) {
        debug!("🔁 MUX: thread started");
        let mut scratch = vec![0u8; self.read_buffer.max(1)];
        while !self.stopped.load(Ordering::Acquire) {
            let interest = self.prepare();
            let mut fds = Vec::with_capacity(interest.len() + 1);
            fds.push(PollFd::new(self.wake.read_fd(), PollFlags::POLLIN));
            fds.extend(interest.iter().map(|i| PollFd::new(i.fd, i.flags)));

            match poll(&mut fds, -1) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("🔁 MUX: poll failed: {}", e);
                    break;
                }
            }
            self.wake.drain();
            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            let ready: Vec<Interest> = interest
                .into_iter()
                .zip(fds.iter().skip(1))
                .filter(|(_, fd)| fd.revents().is_some_and(|r| !r.is_empty()))
                .map(|(interest, _)| interest)
                .collect();
            if !ready.is_empty() {
                self.service(&ready, &mut scratch);
            }
        }
        debug!("🔁 MUX: thread stopped");
    }
}

/// Background thread moving bytes between the host and every running job.
pub(crate) struct Multiplexer {
    shared: Arc<MuxShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("jobs", &self.shared.registry.lock().len())
            .field("stopped", &self.shared.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Multiplexer {
    pub(crate) fn spawn(write_chunk: usize, read_buffer: usize) -> Result<Self> {
        let shared = Arc::new(MuxShared {
            registry: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            wake: WakePipe::new()?,
            write_chunk: write_chunk.max(1),
            read_buffer,
        });
        let runner = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("jsh-io".to_string())
            .spawn(move || runner.run())
            .context("failed to spawn I/O thread")?;
        let thread_id = handle.thread().id();
        Ok(Multiplexer {
            shared,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    pub(crate) fn register(&self, id: &str, job: Weak<Job>, registration: Registration) {
        debug!(
            "🔁 MUX: Registering job {} stdin={} stdout={} stderr={}",
            id,
            registration.stdin.is_some(),
            registration.stdout.is_some(),
            registration.stderr.is_some()
        );
        let needs_write = registration.stdin.is_some();
        self.shared.registry.lock().insert(
            id.to_string(),
            Entry {
                job,
                stdin: registration.stdin,
                stdout: registration.stdout,
                stderr: registration.stderr,
                needs_write,
                pending: None,
            },
        );
        self.wakeup();
    }

    /// Ask for the job's staged stdin to be pushed.
    pub(crate) fn schedule_write(&self, id: &str) {
        if let Some(entry) = self.shared.registry.lock().get_mut(id) {
            entry.needs_write = true;
        }
        self.wakeup();
    }

    pub(crate) fn wakeup(&self) {
        self.shared.wake.wake();
    }

    pub(crate) fn is_registered(&self, id: &str) -> bool {
        self.shared.registry.lock().contains_key(id)
    }

    pub(crate) fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wakeup();
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take()
            && handle.join().is_err()
        {
            error!("🔁 MUX: I/O thread panicked");
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}
