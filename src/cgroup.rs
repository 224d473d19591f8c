use std::fs::File;
use std::io::{Read, Write as _};
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Read/write primitives for the control files of a cgroup v2 directory, and
/// a handle suitable for `CLONE_INTO_CGROUP`.
///
/// The cgroup directory is owned by the host agent: this type never creates
/// or removes it — that belongs to a container-lifecycle owner rather than
/// a task launcher.
#[derive(Clone, Debug)]
pub struct CgroupFile {
    path: PathBuf,
}

impl CgroupFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// Opens a path-only descriptor on the cgroup directory, for
    /// `CLONE_INTO_CGROUP`. The descriptor's lifetime is exactly the
    /// returned `OwnedFd`'s — there is no separate close step, ownership
    /// already gives us that.
    pub fn open_handle(&self) -> Result<OwnedFd, Error> {
        let raw = nix::fcntl::open(
            &self.path,
            nix::fcntl::OFlag::O_PATH | nix::fcntl::OFlag::O_DIRECTORY | nix::fcntl::OFlag::O_CLOEXEC,
            nix::sys::stat::Mode::empty(),
        )
        .map_err(|e| Error::cgroup_open(&self.path, std::io::Error::from(e)))?;
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    pub fn read(&self, relpath: &str) -> Result<String, Error> {
        let full = self.path.join(relpath);
        let mut buf = String::new();
        File::open(&full)
            .and_then(|mut f| f.read_to_string(&mut buf))
            .map_err(|e| Error::cgroup_read(&full, e))?;
        Ok(buf.trim().to_owned())
    }

    #[tracing::instrument(level = "debug", skip(self, content))]
    pub fn write(&self, relpath: &str, content: &str) -> Result<(), Error> {
        let full = self.path.join(relpath);
        let result = File::options()
            .write(true)
            .mode(0o700)
            .open(&full)
            .and_then(|mut f| f.write_all(content.as_bytes()))
            .map_err(|e| Error::cgroup_write(&full, e));
        if let Err(err) = &result {
            tracing::warn!(path = %full.display(), error = %err, "cgroup write failed");
        } else {
            tracing::debug!(path = %full.display(), "wrote cgroup control file");
        }
        result
    }

    /// Reads `pids.current`, used by `Stop`'s grace-window poll.
    pub fn pids_current(&self) -> Result<u64, Error> {
        let raw = self.read("pids.current")?;
        raw.parse()
            .map_err(|_| Error::cgroup_read(self.path.join("pids.current"), invalid_data(&raw)))
    }

    /// Writes `cgroup.kill = "1"`, the cgroup v2 kill-all operation.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn kill(&self) -> Result<(), Error> {
        tracing::info!(path = %self.path.display(), "escalating to cgroup.kill");
        self.write("cgroup.kill", "1")
    }
}

fn invalid_data(raw: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unexpected cgroup counter value: {raw:?}"),
    )
}
