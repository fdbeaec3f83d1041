use anyhow::Result;
use jsh_types::JshError;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, killpg, sigaction};
use nix::unistd::Pid;
use parking_lot::{Mutex, const_mutex};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::{debug, error};

/// Maximum number of engines that can share the SIGCHLD handler.
pub const MAX_ENGINES: usize = 16;

struct Slot {
    wake_fd: AtomicI32,
    pending: AtomicBool,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = Slot {
    wake_fd: AtomicI32::new(-1),
    pending: AtomicBool::new(false),
};

static SLOTS: [Slot; MAX_ENGINES] = [EMPTY_SLOT; MAX_ENGINES];

/// Handler installation state; only touched outside the signal handler.
struct Installed {
    users: usize,
    previous: Option<SigAction>,
}

static INSTALLED: Mutex<Installed> = const_mutex(Installed {
    users: 0,
    previous: None,
});

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            unsafe { libc::__errno_location() }
        }
    } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            unsafe { libc::__error() }
        }
    } else {
        unsafe fn errno_location() -> *mut libc::c_int {
            unsafe { libc::__errno() }
        }
    }
}

extern "C" fn handle_sigchld(_: libc::c_int) {
    // Only atomics and write(2) here.
    let saved = unsafe { *errno_location() };
    for slot in SLOTS.iter() {
        let fd = slot.wake_fd.load(Ordering::Acquire);
        if fd >= 0 {
            slot.pending.store(true, Ordering::Release);
            let byte = b'c';
            unsafe {
                libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
            }
        }
    }
    unsafe { *errno_location() = saved };
}

/// An engine's registration with the shared SIGCHLD handler.
#[derive(Debug)]
pub(crate) struct ChildSignal {
    slot: usize,
}

impl ChildSignal {
    /// Route SIGCHLD notifications to `wake_fd`, installing the handler if needed.
    pub(crate) fn register(wake_fd: RawFd) -> Result<Self> {
        let mut installed = INSTALLED.lock();
        let slot = SLOTS
            .iter()
            .position(|s| s.wake_fd.load(Ordering::Acquire) < 0)
            .ok_or(JshError::TooManyEngines(MAX_ENGINES))?;

        if installed.users == 0 {
            debug!("🔧 SIGNAL: Installing SIGCHLD handler");
            let action = SigAction::new(
                SigHandler::Handler(handle_sigchld),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            let previous = unsafe { sigaction(Signal::SIGCHLD, &action) }?;
            installed.previous = Some(previous);
        }
        installed.users += 1;

        SLOTS[slot].pending.store(false, Ordering::Release);
        SLOTS[slot].wake_fd.store(wake_fd, Ordering::Release);
        debug!("🔧 SIGNAL: SIGCHLD slot {} -> fd {}", slot, wake_fd);
        Ok(ChildSignal { slot })
    }

    /// Consume the pending flag.
    pub(crate) fn take_pending(&self) -> bool {
        SLOTS[self.slot].pending.swap(false, Ordering::AcqRel)
    }

    /// Force a sweep on the next dispatch, as if SIGCHLD had arrived.
    pub(crate) fn mark_pending(&self) {
        SLOTS[self.slot].pending.store(true, Ordering::Release);
    }
}

impl Drop for ChildSignal {
    fn drop(&mut self) {
        let mut installed = INSTALLED.lock();
        SLOTS[self.slot].wake_fd.store(-1, Ordering::Release);
        SLOTS[self.slot].pending.store(false, Ordering::Release);
        installed.users = installed.users.saturating_sub(1);
        if installed.users == 0
            && let Some(previous) = installed.previous.take()
        {
            debug!("🔧 SIGNAL: Restoring previous SIGCHLD disposition");
            if let Err(e) = unsafe { sigaction(Signal::SIGCHLD, &previous) } {
                error!("failed to restore SIGCHLD handler: {}", e);
            }
        }
    }
}

/// Who receives a signal: a whole process group or a single process.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SignalTarget {
    Group(Pid),
    Process(Pid),
}

pub(crate) fn send_signal(target: SignalTarget, signal: Signal) -> Result<()> {
    debug!("📡 SIGNAL: Sending signal {:?} to {:?}", signal, target);
    let result = match target {
        SignalTarget::Group(pgid) => killpg(pgid, signal),
        SignalTarget::Process(pid) => kill(pid, signal),
    };
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(
                "📡 SIGNAL: Failed to send signal {:?} to {:?}: {}",
                signal, target, e
            );
            Err(e.into())
        }
    }
}
