use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::distributions::{Alphanumeric, DistString as _};

#[allow(unused)]
pub fn rand_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

pub struct TempDir(PathBuf);

impl TempDir {
    #[allow(unused)]
    pub fn new() -> std::io::Result<Self> {
        let tmpdir = Path::new(env!("CARGO_TARGET_TMPDIR"));
        let path = loop {
            let path = tmpdir.join(format!("sbox-exec-test-{}", rand_string(32)));
            match std::fs::metadata(&path) {
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::NotFound => break path,
                Err(e) => return Err(e),
            }
        };
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    #[allow(unused)]
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// A throwaway cgroup v2 leaf directory under the host's own cgroup,
/// created directly by the test (playing the role the orchestrator plays
/// in production: this crate never creates or removes cgroups itself).
/// Requires `TEST_CGROUP_PATH` to point at a cgroup v2 directory this
/// process can create children under and that has `cpu`, `memory`, and
/// `pids` delegated as subtree controllers.
pub struct TempCgroup(PathBuf);

impl TempCgroup {
    #[allow(unused)]
    pub fn new() -> std::io::Result<Self> {
        let base = PathBuf::from(
            std::env::var("TEST_CGROUP_PATH")
                .expect("TEST_CGROUP_PATH must point at a writable cgroup v2 directory"),
        );
        let path = base.join(format!("test-{}", rand_string(32)));
        std::fs::create_dir(&path)?;
        Ok(Self(path))
    }

    #[allow(unused)]
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempCgroup {
    fn drop(&mut self) {
        let _ = std::fs::write(self.0.join("cgroup.kill"), "1");
        let _ = std::fs::remove_dir(&self.0);
    }
}

/// Whether this host can actually run the privileged scenarios: a cgroup
/// v2 scratch directory is configured via `TEST_CGROUP_PATH`.
#[allow(unused)]
pub fn privileged_tests_enabled() -> bool {
    std::env::var("TEST_CGROUP_PATH").is_ok()
}
