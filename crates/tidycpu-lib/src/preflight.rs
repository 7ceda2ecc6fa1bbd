//! Privilege preflight

use crate::error::{Result, TidyError};
use nix::unistd::geteuid;

/// Whether this process may change other processes' affinity
pub trait PrivilegeCheck: Send + Sync {
    fn is_privileged(&self) -> bool;

    /// `NotPrivileged` unless privileged
    fn require(&self) -> Result<()> {
        if self.is_privileged() {
            Ok(())
        } else {
            Err(TidyError::NotPrivileged)
        }
    }
}

/// Privileged when the effective uid is root
#[derive(Debug, Clone, Copy, Default)]
pub struct EffectiveUid;

impl PrivilegeCheck for EffectiveUid {
    fn is_privileged(&self) -> bool {
        geteuid().is_root()
    }
}

/// Fixed answer, for callers that already know
#[derive(Debug, Clone, Copy)]
pub struct StaticPrivilege(pub bool);

impl PrivilegeCheck for StaticPrivilege {
    fn is_privileged(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require() {
        assert!(StaticPrivilege(true).require().is_ok());
        let err = StaticPrivilege(false).require().unwrap_err();
        assert!(matches!(err, TidyError::NotPrivileged));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_effective_uid_matches_nix() {
        assert_eq!(EffectiveUid.is_privileged(), geteuid().is_root());
    }
}
