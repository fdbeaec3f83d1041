use anyhow::{Context as _, Result};
use libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO, c_char};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask};
use nix::sys::stat::{SFlag, stat};
use nix::unistd::{ForkResult, Pid, close, dup2, fork, getpid, setpgid, tcsetpgrp};
use std::ffi::{CStr, CString};
use std::os::unix::io::RawFd;
use std::ptr;
use tracing::debug;

use super::process::Process;
use super::redirect::PreparedRedirect;

/// Exit status of a child whose exec failed.
pub const EXEC_FAILED: i32 = 127;

/// Everything a forked child needs to exec a stage, allocated before the fork.
pub(crate) struct ExecPlan {
    /// `$PATH` candidates in search order; empty for absolute paths.
    search: Vec<CString>,
    /// Executed when no candidate qualifies.
    fallback: CString,
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
    redirects: Vec<PreparedRedirect>,
}

impl ExecPlan {
    pub(crate) fn prepare(process: &Process) -> Result<Self> {
        let fallback = CString::new(process.path.as_str())
            .with_context(|| format!("invalid command path {:?}", process.path))?;

        let search = if process.path.starts_with('/') || process.path.is_empty() {
            Vec::new()
        } else {
            let paths = process
                .environ
                .get("PATH")
                .map(|p| p.as_str())
                .unwrap_or_default();
            paths
                .split(':')
                .map(|dir| if dir.is_empty() { "." } else { dir })
                .filter_map(|dir| CString::new(format!("{}/{}", dir, process.path)).ok())
                .collect()
        };

        let argv = std::iter::once(process.path.as_str())
            .chain(process.args.iter().map(|a| a.as_str()))
            .map(CString::new)
            .collect::<Result<Vec<_>, _>>()
            .context("argument contains a NUL byte")?;
        let envp = process
            .environ
            .iter()
            .map(|(key, value)| CString::new(format!("{key}={value}")))
            .collect::<Result<Vec<_>, _>>()
            .context("environment contains a NUL byte")?;
        let redirects = process
            .redirects
            .iter()
            .map(|r| r.prepare())
            .collect::<Result<Vec<_>>>()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(ExecPlan {
            search,
            fallback,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
            redirects,
        })
    }

    /// First regular, user-executable candidate, else the path as given.
    fn resolve(&self) -> &CStr {
        for candidate in &self.search {
            if let Ok(st) = stat(candidate.as_c_str()) {
                let mode = st.st_mode as libc::mode_t;
                let is_regular = mode & SFlag::S_IFMT.bits() == SFlag::S_IFREG.bits();
                if is_regular && mode & libc::S_IXUSR != 0 {
                    return candidate;
                }
            }
        }
        &self.fallback
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Descriptors a stage should see as 0, 1 and 2.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageIo {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

/// Job-control placement for a freshly forked stage.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Placement {
    pub pgid: Option<Pid>,
    pub interactive: bool,
    pub foreground: bool,
    pub terminal: RawFd,
}

pub(crate) fn fork_stage(plan: &ExecPlan, io: StageIo, placement: Placement) -> Result<Pid> {
    debug!(
        "🍴 FORK: stdin={} stdout={} stderr={} pgid={:?} foreground={}",
        io.stdin, io.stdout, io.stderr, placement.pgid, placement.foreground
    );
    match unsafe { fork().context("failed fork")? } {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => exec_child(plan, io, placement),
    }
}

fn copy_fd(src: RawFd, dst: RawFd) -> nix::Result<()> {
    if src != dst {
        dup2(src, dst)?;
        close(src)?;
    }
    Ok(())
}

// Accept job-control-related signals (refer https://www.gnu.org/software/libc/manual/html_node/Launching-Jobs.html)
fn set_signals() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in [
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTSTP,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
        Signal::SIGCHLD,
        Signal::SIGPIPE,
    ] {
        unsafe { sigaction(signal, &action) }?;
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
}

/// Runs in the forked child: no allocation, no locking, no logging.
fn exec_child(plan: &ExecPlan, io: StageIo, placement: Placement) -> ! {
    if placement.interactive {
        let pid = getpid();
        let pgid = placement.pgid.unwrap_or(pid);
        // The parent calls setpgid too; whichever runs first wins.
        let _ = setpgid(pid, pgid);
        if placement.foreground {
            let _ = tcsetpgrp(placement.terminal, pgid);
        }
    }

    if set_signals().is_err() {
        exit_child(EXEC_FAILED);
    }

    let wired = if io.stdout == io.stderr && io.stdout != STDOUT_FILENO {
        copy_fd(io.stdin, STDIN_FILENO)
            .and_then(|_| dup2(io.stdout, STDOUT_FILENO))
            .and_then(|_| dup2(io.stderr, STDERR_FILENO))
            .and_then(|_| close(io.stdout))
    } else {
        copy_fd(io.stdin, STDIN_FILENO)
            .and_then(|_| copy_fd(io.stdout, STDOUT_FILENO))
            .and_then(|_| copy_fd(io.stderr, STDERR_FILENO))
    };
    if wired.is_err() {
        exit_child(EXEC_FAILED);
    }

    for redirect in &plan.redirects {
        if redirect.apply().is_err() {
            exit_child(1);
        }
    }

    let path = plan.resolve();
    unsafe {
        libc::execve(path.as_ptr(), plan.argv_ptrs.as_ptr(), plan.envp_ptrs.as_ptr());
    }
    exit_child(EXEC_FAILED)
}

fn exit_child(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}
