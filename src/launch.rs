use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, dup2, execvpe, setpgid, Pid};

use crate::cgroup::CgroupFile;
use crate::clone3::{clone3, Clone as CloneResult, CloneArgs};
use crate::collaborators::ResolvedUser;
use crate::error::Error;
use crate::executor::{CancelToken, Environment, Options};
use crate::shim;

/// Environment variables purged from the inherited set before launch.
const PURGED_VARS: &[&str] = &["LS_COLORS", "XAUTHORITY", "DISPLAY", "COLORTERM", "MAIL"];

/// Assembles the argv, environment, and clone attributes for the process
/// that becomes the task's process-group leader, and spawns it.
///
/// Argv layout (§4.6): `[nsenter …--]? unshare …-- <self> <shim-subcommand>
/// <defaults-bool> <path-spec>… -- <command> <args>…`.
pub(crate) struct LaunchPlan<'a> {
    pub options: &'a Options,
    pub environment: &'a Environment,
    pub resolved_user: &'a ResolvedUser,
    pub self_binary: &'a Path,
}

impl<'a> LaunchPlan<'a> {
    fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if !self.environment.netns_path.is_empty() {
            argv.push("nsenter".to_owned());
            argv.push("--no-fork".to_owned());
            argv.push(format!("--net={}", self.environment.netns_path));
            argv.push("--".to_owned());
        }
        argv.push("unshare".to_owned());
        argv.push("--ipc".to_owned());
        argv.push("--pid".to_owned());
        argv.push("--mount-proc".to_owned());
        argv.push("--fork".to_owned());
        argv.push("--kill-child=SIGKILL".to_owned());
        argv.push("--setuid".to_owned());
        argv.push(self.resolved_user.uid.to_string());
        argv.push("--setgid".to_owned());
        argv.push(self.resolved_user.gid.to_string());
        argv.push("--".to_owned());
        argv.push(self.self_binary.display().to_string());
        argv.push(shim::SUBCOMMAND.to_owned());
        argv.push(self.options.grant_defaults.to_string());
        argv.extend(self.options.access_specs.iter().map(|spec| spec.to_arg()));
        argv.push("--".to_owned());
        argv.push(self.options.command.clone());
        argv.extend(self.options.arguments.iter().cloned());
        argv
    }

    /// Builds the flattened `NAME=VALUE` / bare-name environment list (§3).
    fn envp(&self) -> Vec<String> {
        let mut vars = self.environment.env_vars.clone();
        for purged in PURGED_VARS {
            vars.remove(*purged);
        }
        vars.insert("USER".to_owned(), self.environment.user.clone());
        vars.insert(
            "HOME".to_owned(),
            self.resolved_user.home.display().to_string(),
        );
        let tmpdir = self
            .environment
            .task_dir
            .parent()
            .map(|parent| parent.join("tmp"))
            .unwrap_or_else(|| self.environment.task_dir.join("tmp"));
        vars.insert("TMPDIR".to_owned(), tmpdir.display().to_string());
        vars.into_iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    name
                } else {
                    format!("{name}={value}")
                }
            })
            .collect()
    }

    /// Clones directly into `cgroup` and execs the argv chain. Returns the
    /// pid of the process-group leader — stable across every subsequent
    /// `execve` the chain performs, since `execve` never changes the pid.
    #[tracing::instrument(level = "info", skip_all, fields(command = %self.options.command))]
    pub fn spawn(&self, cgroup: &CgroupFile, cancel: &CancelToken) -> Result<Pid, Error> {
        let argv = self.argv();
        let envp = self.envp();
        let task_dir = self.environment.task_dir.clone();
        let stdout = self.environment.stdout.as_ref().map(|fd| fd.as_raw_fd());
        let stderr = self.environment.stderr.as_ref().map(|fd| fd.as_raw_fd());

        let cgroup_handle = cgroup.open_handle()?;
        let mut clone_args = CloneArgs::default();
        clone_args.flag_into_cgroup(&cgroup_handle);

        // Safety: `clone3` is called with a single-threaded contract on the
        // caller's side for the child branch below — no heap allocation is
        // strictly async-signal-safe here, but the window between clone and
        // exec is short and failure-tolerant (every call below is allowed to
        // fail silently and fall through to `_exit`).
        let result = unsafe { clone3(&clone_args) }.map_err(|source| Error::Spawn { source });
        drop(cgroup_handle);

        match result? {
            CloneResult::Child => {
                if let Ok(devnull) = fcntl::open("/dev/null", OFlag::O_RDWR, Mode::empty()) {
                    let _ = dup2(devnull, 0);
                }
                if let Some(fd) = stdout {
                    let _ = dup2(fd, 1);
                }
                if let Some(fd) = stderr {
                    let _ = dup2(fd, 2);
                }
                let _ = chdir(&task_dir);
                tracing::debug!(argv = ?argv, "execing launcher chain");
                exec_chain(&argv, &envp);
                unsafe { nix::libc::_exit(127) }
            }
            CloneResult::Parent(child) => {
                setpgid(child, child).map_err(|source| Error::Spawn { source })?;
                if cancel.is_cancelled() {
                    tracing::info!(pid = child.as_raw(), "start cancelled, killing clone");
                    let _ = nix::sys::signal::killpg(child, nix::sys::signal::Signal::SIGKILL);
                    return Err(Error::Spawn {
                        source: nix::errno::Errno::from_i32(nix::libc::ECANCELED),
                    });
                }
                tracing::info!(pid = child.as_raw(), "cloned into cgroup");
                Ok(child)
            }
        }
    }
}

/// `execvpe`s into the first argv token (resolved against `PATH`, exactly
/// like `nsenter`/`unshare` are normally invoked from a shell). Never
/// returns on success; leaves the caller to `_exit` on failure.
fn exec_chain(argv: &[String], envp: &[String]) {
    let Ok(filename) = CString::new(argv[0].as_bytes()) else {
        return;
    };
    let argv_c: Vec<CString> = argv
        .iter()
        .filter_map(|a| CString::new(a.as_bytes()).ok())
        .collect();
    let envp_c: Vec<CString> = envp
        .iter()
        .filter_map(|e| CString::new(e.as_bytes()).ok())
        .collect();
    if let Err(source) = execvpe(&filename, &argv_c, &envp_c) {
        tracing::warn!(program = argv[0], %source, "execve failed in launcher chain");
    }
}
