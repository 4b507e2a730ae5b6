//! Privilege drop before any connection is opened
//!
//! `[run_as]` names a user and group, by name or numeric id. The group is
//! switched first (supplementary groups reset, then `setgid`), then the user;
//! once `setuid` succeeds the process cannot regain root.

use crate::config::RunAsSection;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("run_as is enabled but {0} is not set")]
    Missing(&'static str),
    #[error("Unknown user: {0}")]
    UnknownUser(String),
    #[error("Unknown group: {0}")]
    UnknownGroup(String),
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Privilege drop is not supported on this platform")]
    Unsupported,
}

/// Ids the process runs as after a drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

/// Switch to the configured user and group
///
/// Returns `None` when `[run_as]` is disabled. Already running as the target
/// ids is not an error.
pub fn drop_privileges(section: &RunAsSection) -> Result<Option<RunAs>, PrivilegeError> {
    if !section.enabled {
        return Ok(None);
    }
    let user = section.user.as_deref().ok_or(PrivilegeError::Missing("user"))?;
    let group = section.group.as_deref().ok_or(PrivilegeError::Missing("group"))?;

    let target = RunAs {
        uid: sys::lookup_uid(user)?,
        gid: sys::lookup_gid(group)?,
    };
    if sys::current() == target {
        info!(uid = target.uid, gid = target.gid, "Already running as configured user");
        return Ok(Some(target));
    }

    sys::switch_to(target)?;
    info!(user, group, uid = target.uid, gid = target.gid, "Dropped privileges");
    Ok(Some(target))
}

#[cfg(unix)]
mod sys {
    use super::{PrivilegeError, RunAs};
    use std::ffi::CString;
    use std::io;

    const LOOKUP_BUFFER: usize = 16 * 1024;

    pub fn current() -> RunAs {
        // SAFETY: geteuid/getegid take no arguments and cannot fail
        unsafe {
            RunAs {
                uid: libc::geteuid(),
                gid: libc::getegid(),
            }
        }
    }

    pub fn lookup_uid(name: &str) -> Result<u32, PrivilegeError> {
        if let Ok(uid) = name.parse() {
            return Ok(uid);
        }
        let unknown = || PrivilegeError::UnknownUser(name.to_string());
        let c_name = CString::new(name).map_err(|_| unknown())?;

        let mut buf = vec![0 as libc::c_char; LOOKUP_BUFFER];
        // SAFETY: passwd is plain old data; all-zero is a valid bit pattern
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: every pointer refers to a live, correctly sized local buffer
        let rc = unsafe {
            libc::getpwnam_r(c_name.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc != 0 {
            return Err(PrivilegeError::Os {
                op: "getpwnam_r",
                source: io::Error::from_raw_os_error(rc),
            });
        }
        if result.is_null() {
            return Err(unknown());
        }
        Ok(pwd.pw_uid)
    }

    pub fn lookup_gid(name: &str) -> Result<u32, PrivilegeError> {
        if let Ok(gid) = name.parse() {
            return Ok(gid);
        }
        let unknown = || PrivilegeError::UnknownGroup(name.to_string());
        let c_name = CString::new(name).map_err(|_| unknown())?;

        let mut buf = vec![0 as libc::c_char; LOOKUP_BUFFER];
        // SAFETY: group is plain old data; all-zero is a valid bit pattern
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        // SAFETY: every pointer refers to a live, correctly sized local buffer
        let rc = unsafe {
            libc::getgrnam_r(c_name.as_ptr(), &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc != 0 {
            return Err(PrivilegeError::Os {
                op: "getgrnam_r",
                source: io::Error::from_raw_os_error(rc),
            });
        }
        if result.is_null() {
            return Err(unknown());
        }
        Ok(grp.gr_gid)
    }

    pub fn switch_to(target: RunAs) -> Result<(), PrivilegeError> {
        let groups = [target.gid as libc::gid_t];
        // SAFETY: setgroups reads exactly one gid from a live array
        if unsafe { libc::setgroups(1, groups.as_ptr()) } != 0 {
            return Err(os_error("setgroups"));
        }
        // SAFETY: plain syscall on integer ids
        if unsafe { libc::setgid(target.gid) } != 0 {
            return Err(os_error("setgid"));
        }
        // SAFETY: plain syscall on integer ids
        if unsafe { libc::setuid(target.uid) } != 0 {
            return Err(os_error("setuid"));
        }
        Ok(())
    }

    fn os_error(op: &'static str) -> PrivilegeError {
        PrivilegeError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use super::{PrivilegeError, RunAs};

    pub fn current() -> RunAs {
        RunAs { uid: 0, gid: 0 }
    }

    pub fn lookup_uid(_name: &str) -> Result<u32, PrivilegeError> {
        Err(PrivilegeError::Unsupported)
    }

    pub fn lookup_gid(_name: &str) -> Result<u32, PrivilegeError> {
        Err(PrivilegeError::Unsupported)
    }

    pub fn switch_to(_target: RunAs) -> Result<(), PrivilegeError> {
        Err(PrivilegeError::Unsupported)
    }
}
