use anyhow::{Context as _, Result};
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectTarget {
    /// Open `path`; written streams are created, and truncated unless `append`.
    File { path: PathBuf, append: bool },
    /// Make the source descriptor a copy of this one.
    Duplicate(RawFd),
}

/// Rewire descriptor `fd` of a stage before it execs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub fd: RawFd,
    pub target: RedirectTarget,
}

impl Redirect {
    pub fn file(fd: RawFd, path: impl Into<PathBuf>, append: bool) -> Self {
        Redirect {
            fd,
            target: RedirectTarget::File {
                path: path.into(),
                append,
            },
        }
    }

    pub fn duplicate(fd: RawFd, from: RawFd) -> Self {
        Redirect {
            fd,
            target: RedirectTarget::Duplicate(from),
        }
    }

    pub(crate) fn prepare(&self) -> Result<PreparedRedirect> {
        let target = match &self.target {
            RedirectTarget::File { path, append } => {
                let c_path = CString::new(path.as_os_str().as_bytes())
                    .with_context(|| format!("invalid redirect path {}", path.display()))?;
                let flags = if self.fd == libc::STDIN_FILENO {
                    OFlag::O_RDONLY
                } else if *append {
                    OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND
                } else {
                    OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC
                };
                PreparedTarget::File(c_path, flags)
            }
            RedirectTarget::Duplicate(from) => PreparedTarget::Duplicate(*from),
        };
        Ok(PreparedRedirect {
            fd: self.fd,
            target,
        })
    }
}

impl std::fmt::Display for Redirect {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.target {
            RedirectTarget::File { path, append: _ } if self.fd == libc::STDIN_FILENO => {
                write!(f, "<{}", path.display())
            }
            RedirectTarget::File { path, append } => {
                let op = if *append { ">>" } else { ">" };
                write!(f, "{}{}{}", self.fd, op, path.display())
            }
            RedirectTarget::Duplicate(from) => write!(f, "{}>&{}", self.fd, from),
        }
    }
}

#[derive(Debug)]
pub(crate) enum PreparedTarget {
    File(CString, OFlag),
    Duplicate(RawFd),
}

/// A redirect with every allocation done up front, applied in the forked child.
#[derive(Debug)]
pub(crate) struct PreparedRedirect {
    fd: RawFd,
    target: PreparedTarget,
}

impl PreparedRedirect {
    /// Runs between fork and exec: no allocation, no locking.
    pub(crate) fn apply(&self) -> nix::Result<()> {
        match &self.target {
            PreparedTarget::File(path, flags) => {
                let opened = open(path.as_c_str(), *flags, Mode::from_bits_truncate(0o666))?;
                if opened != self.fd {
                    dup2(opened, self.fd)?;
                    close(opened)?;
                }
            }
            PreparedTarget::Duplicate(from) => {
                if *from != self.fd {
                    dup2(*from, self.fd)?;
                }
            }
        }
        Ok(())
    }
}
