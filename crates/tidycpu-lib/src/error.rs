//! Error types for the rebalancer
//!
//! Fatal conditions stop a run before it produces any output. Everything
//! else is reported per entry and travels with the normal results.

use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// Primary error type for the library
#[derive(Debug, Error)]
pub enum TidyError {
    /// The caller may not modify other processes' affinity
    #[error("root privileges are required to change process affinity")]
    NotPrivileged,

    /// A host facility a stage depends on is missing
    #[error("{primitive} unavailable: {reason}")]
    PrimitiveUnavailable {
        primitive: &'static str,
        reason: String,
    },

    /// CPU topology could not be read
    #[error("CPU topology unavailable: {0}")]
    TopologyUnavailable(String),

    /// The process or thread no longer exists
    #[error("no such process (pid {0})")]
    ProcessGone(i32),

    /// The kernel refused access to the process or thread
    #[error("operation not permitted (pid {0})")]
    PermissionDenied(i32),

    /// The requested core set was rejected
    #[error("invalid core set for pid {pid}: {reason}")]
    InvalidCores { pid: i32, reason: String },

    /// Malformed kernel data
    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] Errno),
}

pub type Result<T> = std::result::Result<T, TidyError>;

impl TidyError {
    /// Whether the error aborts the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TidyError::NotPrivileged
                | TidyError::PrimitiveUnavailable { .. }
                | TidyError::TopologyUnavailable(_)
        )
    }

    pub fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        TidyError::Parse {
            what,
            detail: detail.into(),
        }
    }

    /// Map an IO error on a `/proc/<pid>` entry to a per-process error
    pub fn from_proc_io(pid: i32, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TidyError::ProcessGone(pid),
            io::ErrorKind::PermissionDenied => TidyError::PermissionDenied(pid),
            _ => TidyError::Io(err),
        }
    }

    /// Map an errno from an affinity syscall to a per-process error
    pub fn from_errno(pid: i32, errno: Errno) -> Self {
        match errno {
            Errno::ESRCH => TidyError::ProcessGone(pid),
            Errno::EPERM | Errno::EACCES => TidyError::PermissionDenied(pid),
            Errno::EINVAL => TidyError::InvalidCores {
                pid,
                reason: "rejected by the kernel (kernel thread or offline cores)".to_string(),
            },
            other => TidyError::Sys(other),
        }
    }
}
