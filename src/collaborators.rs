use std::fmt::Debug;
use std::path::PathBuf;

use nix::unistd::{Gid, Uid};

use crate::error::Error;

/// A resolved identity: the numeric ids and home directory a textual user
/// name maps to.
#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
}

/// Maps a textual user to `(uid, gid, home_dir)`. The default
/// implementation is backed by `getpwnam`-style lookup; a host agent may
/// substitute a synthetic resolver in tests or when `user` is an identity
/// the orchestrator itself manages rather than a system account.
pub trait UserResolver: Send + Sync + Debug {
    fn resolve(&self, user: &str) -> Result<ResolvedUser, Error>;
}

/// Resolves against the host's `/etc/passwd` (or equivalent NSS source) via
/// `nix::unistd::User`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUserResolver;

impl UserResolver for SystemUserResolver {
    fn resolve(&self, user: &str) -> Result<ResolvedUser, Error> {
        if user.is_empty() {
            return Err(Error::UserLookup {
                user: user.to_owned(),
                reason: "empty user name".to_owned(),
            });
        }
        let entry = nix::unistd::User::from_name(user)
            .map_err(|e| Error::UserLookup {
                user: user.to_owned(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| Error::UserLookup {
                user: user.to_owned(),
                reason: "no such user".to_owned(),
            })?;
        Ok(ResolvedUser {
            uid: entry.uid,
            gid: entry.gid,
            home: entry.dir,
        })
    }
}

/// Supplies the host facts `CpuTracker`'s tick derivation needs: clock
/// ticks per second (`sysconf(_SC_CLK_TCK)`) and the number of cores the
/// bandwidth figure is relative to.
pub trait HostInfo: Send + Sync + Debug {
    fn ticks_per_core(&self) -> i64;
    fn cores(&self) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SysconfHostInfo;

impl HostInfo for SysconfHostInfo {
    fn ticks_per_core(&self) -> i64 {
        nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
            .ok()
            .flatten()
            .unwrap_or(100)
    }

    fn cores(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Yields the absolute path of the currently running program, used to
/// re-invoke it as the shim.
pub trait SelfBinaryLocator: Send + Sync + Debug {
    fn locate(&self) -> Result<PathBuf, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentExeLocator;

impl SelfBinaryLocator for CurrentExeLocator {
    fn locate(&self) -> Result<PathBuf, Error> {
        std::env::current_exe().map_err(|e| Error::Spawn {
            source: nix::errno::Errno::from_i32(e.raw_os_error().unwrap_or(nix::libc::EIO)),
        })
    }
}
