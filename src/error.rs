use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every failure mode named in the core's error-handling design: one variant
/// per design-level kind so callers can match on *what* failed, with the
/// underlying cause preserved for logging.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot resolve user {user:?}: {reason}")]
    UserLookup { user: String, reason: String },

    #[error("cannot open cgroup directory {path:?}: {source}")]
    CgroupOpen { path: PathBuf, source: io::Error },

    #[error("cannot write cgroup file {path:?}: {source}")]
    CgroupWrite { path: PathBuf, source: io::Error },

    #[error("cannot read cgroup file {path:?}: {source}")]
    CgroupRead { path: PathBuf, source: io::Error },

    #[error("cannot spawn task: {source}")]
    Spawn { source: nix::errno::Errno },

    #[error("invalid access spec {spec:?}: {reason}")]
    InvalidAccessSpec { spec: String, reason: String },

    #[error("landlock ruleset could not be applied: {source}")]
    LandlockApply {
        #[source]
        source: landlock::RulesetError,
    },

    #[error("command {command:?} not found on PATH")]
    CommandResolve { command: String },

    #[error("unsupported signal name {name:?}")]
    UnsupportedSignal { name: String },

    #[error("failed waiting for task: {source}")]
    WaitFailed { source: nix::errno::Errno },

    #[error("failed delivering signal to task process group: {source}")]
    SignalDelivery { source: nix::errno::Errno },

    #[error("shim did not exec the target command before its expiration timer fired")]
    ShimExpired,

    #[error("shim argv is malformed: {reason}")]
    ShimArgv { reason: String },
}

impl Error {
    pub(crate) fn cgroup_open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::CgroupOpen {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn cgroup_write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::CgroupWrite {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn cgroup_read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::CgroupRead {
            path: path.into(),
            source,
        }
    }
}
