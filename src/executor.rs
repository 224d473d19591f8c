use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::unistd::Pid;

use crate::access::AccessSpec;
use crate::cgroup::CgroupFile;
use crate::collaborators::{
    CurrentExeLocator, HostInfo, ResolvedUser, SelfBinaryLocator, SysconfHostInfo,
    SystemUserResolver, UserResolver,
};
use crate::cputracker::{self, CpuTracker};
use crate::error::Error;
use crate::launch::LaunchPlan;
use crate::signal::Signaler;
use crate::waiter::Waiter;

/// Cadence of the `pids.current` poll inside `Stop`'s grace window.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Inputs consulted only by the pre-exec path (§3 Invariant 4): the target
/// command, its arguments, and the filesystem access list the Shim converts
/// into Landlock rules.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub(crate) command: String,
    pub(crate) arguments: Vec<String>,
    pub(crate) access_specs: Vec<AccessSpec>,
    pub(crate) grant_defaults: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn access_specs(mut self, access_specs: Vec<AccessSpec>) -> Self {
        self.access_specs = access_specs;
        self
    }

    /// Whether the Shim should append its baseline rule set (§4.5 step 6).
    pub fn grant_defaults(mut self, grant_defaults: bool) -> Self {
        self.grant_defaults = grant_defaults;
        self
    }
}

/// Identity, stdio, resource envelope, and placement inputs (§3).
#[derive(Debug, Default)]
pub struct Environment {
    pub(crate) user: String,
    pub(crate) stdout: Option<OwnedFd>,
    pub(crate) stderr: Option<OwnedFd>,
    pub(crate) env_vars: BTreeMap<String, String>,
    pub(crate) task_dir: PathBuf,
    pub(crate) cgroup_path: PathBuf,
    pub(crate) netns_path: String,
    pub(crate) memory_mib: u64,
    pub(crate) memory_max_mib: u64,
    pub(crate) cpu_bandwidth: u64,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn stdout(mut self, fd: OwnedFd) -> Self {
        self.stdout = Some(fd);
        self
    }

    pub fn stderr(mut self, fd: OwnedFd) -> Self {
        self.stderr = Some(fd);
        self
    }

    pub fn env_vars(mut self, env_vars: BTreeMap<String, String>) -> Self {
        self.env_vars = env_vars;
        self
    }

    pub fn task_dir(mut self, task_dir: impl Into<PathBuf>) -> Self {
        self.task_dir = task_dir.into();
        self
    }

    pub fn cgroup_path(mut self, cgroup_path: impl Into<PathBuf>) -> Self {
        self.cgroup_path = cgroup_path.into();
        self
    }

    pub fn netns_path(mut self, netns_path: impl Into<String>) -> Self {
        self.netns_path = netns_path.into();
        self
    }

    /// Sets the resource envelope consulted by `Start`'s cgroup writes
    /// (§4.7 "Resource constraints").
    pub fn resources(mut self, memory_mib: u64, memory_max_mib: u64, cpu_bandwidth: u64) -> Self {
        self.memory_mib = memory_mib;
        self.memory_max_mib = memory_max_mib;
        self.cpu_bandwidth = cpu_bandwidth;
        self
    }
}

/// Resource utilization snapshot returned by [`Executor::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Utilization {
    pub memory_bytes: u64,
    pub swap_bytes: u64,
    pub cache_bytes: u64,
    pub user_pct: f64,
    pub system_pct: f64,
    pub total_pct: f64,
    pub ticks: f64,
}

/// A cooperative cancellation flag threaded into `Start`: if set before the
/// spawned child's pid is observed, the child is killed rather than left
/// running unsupervised.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Running {
    pid: Pid,
    waiter: Waiter,
    signaler: Signaler,
    cgroup: CgroupFile,
    cpu_tracker: CpuTracker,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
    last_utilization: Utilization,
}

struct Exited {
    pid: Pid,
    exit_code: i32,
    last_utilization: Utilization,
}

enum State {
    New,
    Started(Running),
    Exited(Exited),
}

/// The public state machine (`New` → `Started` → `Exited`) and the only
/// type a host agent interacts with directly. Method calls on a single
/// instance are not safe to interleave from multiple threads — the host is
/// expected to serialize them, exactly as it owns one `Executor` per task.
pub struct Executor {
    options: Option<Options>,
    environment: Option<Environment>,
    user_resolver: Box<dyn UserResolver>,
    host_info: Box<dyn HostInfo>,
    self_binary_locator: Box<dyn SelfBinaryLocator>,
    state: State,
}

impl Executor {
    pub fn new(options: Options, environment: Environment) -> Self {
        Self::with_collaborators(
            options,
            environment,
            Box::new(SystemUserResolver),
            Box::new(SysconfHostInfo),
            Box::new(CurrentExeLocator),
        )
    }

    /// Substitutes the external collaborators of §6 — used by hosts that
    /// fake user resolution, host facts, or the self-binary path in tests.
    pub fn with_collaborators(
        options: Options,
        environment: Environment,
        user_resolver: Box<dyn UserResolver>,
        host_info: Box<dyn HostInfo>,
        self_binary_locator: Box<dyn SelfBinaryLocator>,
    ) -> Self {
        Self {
            options: Some(options),
            environment: Some(environment),
            user_resolver,
            host_info,
            self_binary_locator,
            state: State::New,
        }
    }

    /// Resolves the user, writes the resource constraints, builds the argv
    /// chain, and clones a child directly into the cgroup (§4.7 `Start`).
    pub fn start(&mut self, cancel: &CancelToken) -> Result<(), Error> {
        assert!(
            matches!(self.state, State::New),
            "Executor::start called outside the New state"
        );
        let options = self.options.take().expect("Options already consumed");
        let mut environment = self
            .environment
            .take()
            .expect("Environment already consumed");

        let resolved_user = self.user_resolver.resolve(&environment.user)?;
        let cgroup = CgroupFile::new(&environment.cgroup_path);
        write_resource_constraints(&cgroup, &environment)?;

        let self_binary = self.self_binary_locator.locate()?;
        let stdout = environment.stdout.take();
        let stderr = environment.stderr.take();
        let plan = LaunchPlan {
            options: &options,
            environment: &environment,
            resolved_user: &resolved_user,
            self_binary: &self_binary,
        };
        let pid = plan.spawn(&cgroup, cancel)?;

        self.state = State::Started(Running {
            pid,
            waiter: Waiter::Child(pid),
            signaler: Signaler::new(pid),
            cgroup,
            cpu_tracker: CpuTracker::new(),
            stdout,
            stderr,
            last_utilization: Utilization::default(),
        });
        Ok(())
    }

    /// Rebuilds Waiter/Signaler/CpuTracker from a bare PID after a host
    /// agent restart (§4.7 `Recover`) without consulting `Options` (§3
    /// Invariant 5). Does not probe whether the PID is still alive — that
    /// surfaces through the first `Wait`.
    pub fn recover(&mut self, pid: i32, environment: Environment) {
        assert!(
            matches!(self.state, State::New),
            "Executor::recover called outside the New state"
        );
        self.options = None;
        self.environment = None;
        let pid = Pid::from_raw(pid);
        self.state = State::Started(Running {
            pid,
            waiter: Waiter::Orphan(pid),
            signaler: Signaler::new(pid),
            cgroup: CgroupFile::new(environment.cgroup_path),
            cpu_tracker: CpuTracker::new(),
            stdout: environment.stdout,
            stderr: environment.stderr,
            last_utilization: Utilization::default(),
        });
    }

    pub fn pid(&self) -> i32 {
        match &self.state {
            State::Started(running) => running.pid.as_raw(),
            State::Exited(exited) => exited.pid.as_raw(),
            State::New => panic!("Executor::pid called before Start or Recover"),
        }
    }

    /// Blocks on the Waiter, records the exit code, and transitions to
    /// `Exited`. Called at most once.
    pub fn wait(&mut self) -> Result<(), Error> {
        let running = match std::mem::replace(&mut self.state, State::New) {
            State::Started(running) => running,
            other => {
                self.state = other;
                panic!("Executor::wait called outside the Started state");
            }
        };
        let outcome = running.waiter.wait()?;
        self.state = State::Exited(Exited {
            pid: running.pid,
            exit_code: outcome.exit_code,
            last_utilization: running.last_utilization,
        });
        Ok(())
    }

    /// Delivers `name` to the task's process group.
    pub fn signal(&self, name: &str) -> Result<(), Error> {
        match &self.state {
            State::Started(running) => running.signaler.signal(name),
            _ => panic!("Executor::signal called outside the Started state"),
        }
    }

    /// Graceful-then-forced teardown (§4.7 `Stop`): signals the process
    /// group, polls `pids.current` every 500ms until it empties or
    /// `grace` elapses, escalates to `cgroup.kill` on timeout or poll
    /// error, and best-effort closes stdio. Only the initial signal error
    /// is surfaced; cleanup errors are swallowed so teardown always
    /// completes.
    #[tracing::instrument(level = "info", skip(self), fields(pid = self.pid()))]
    pub fn stop(&mut self, signal_name: &str, grace: Duration) -> Result<(), Error> {
        let running = match &mut self.state {
            State::Started(running) => running,
            _ => panic!("Executor::stop called outside the Started state"),
        };
        let signal_result = running.signaler.signal(signal_name);
        let deadline = Instant::now() + grace;
        loop {
            match running.cgroup.pids_current() {
                Ok(0) => break,
                Ok(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!("grace window elapsed, escalating to cgroup.kill");
                        let _ = running.cgroup.kill();
                        break;
                    }
                    std::thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
                }
                Err(error) => {
                    tracing::warn!(%error, "pids.current poll failed, escalating to cgroup.kill");
                    let _ = running.cgroup.kill();
                    break;
                }
            }
        }
        drop(running.stdout.take());
        drop(running.stderr.take());
        signal_result
    }

    /// Reads the cgroup's memory and CPU counters and derives instantaneous
    /// utilization. Tolerates transient read errors by zeroing the affected
    /// fields rather than failing. Once `Exited`, returns the last value
    /// observed while `Started` instead of touching the cgroup again.
    pub fn stats(&mut self) -> Utilization {
        let ticks_per_core = self.host_info.ticks_per_core();
        let cores = self.host_info.cores();
        match &mut self.state {
            State::Started(running) => {
                let utilization = read_utilization(
                    &running.cgroup,
                    &mut running.cpu_tracker,
                    ticks_per_core,
                    cores,
                );
                running.last_utilization = utilization;
                utilization
            }
            State::Exited(exited) => exited.last_utilization,
            State::New => panic!("Executor::stats called before Start or Recover"),
        }
    }

    /// The exit code recorded by `Wait`. Only valid after `Wait` returns.
    pub fn result(&self) -> i32 {
        match &self.state {
            State::Exited(exited) => exited.exit_code,
            _ => panic!("Executor::result called before Wait completed"),
        }
    }
}

fn write_resource_constraints(cgroup: &CgroupFile, environment: &Environment) -> Result<(), Error> {
    cgroup.write(
        "cpu.max",
        &format!("{} 100000", environment.cpu_bandwidth),
    )?;
    if environment.memory_max_mib == 0 {
        cgroup.write("memory.max", &environment.memory_mib.to_string())?;
    } else {
        cgroup.write("memory.low", &environment.memory_mib.to_string())?;
        cgroup.write("memory.max", &environment.memory_max_mib.to_string())?;
    }
    Ok(())
}

fn read_utilization(
    cgroup: &CgroupFile,
    cpu_tracker: &mut CpuTracker,
    ticks_per_core: i64,
    cores: usize,
) -> Utilization {
    let memory_bytes = cgroup
        .read("memory.current")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let swap_bytes = cgroup
        .read("memory.swap.current")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let cache_bytes = cgroup
        .read("memory.stat")
        .ok()
        .and_then(|stat| parse_stat_field(&stat, "file"))
        .unwrap_or(0);
    let (user_usec, system_usec, usage_usec) = cgroup
        .read("cpu.stat")
        .ok()
        .map(|stat| parse_cpu_stat(&stat))
        .unwrap_or((0, 0, 0));
    let percent = cpu_tracker.percent(user_usec, system_usec, usage_usec);
    let ticks = cputracker::ticks_from_percent(percent.total_pct, ticks_per_core, cores);
    Utilization {
        memory_bytes,
        swap_bytes,
        cache_bytes,
        user_pct: percent.user_pct,
        system_pct: percent.system_pct,
        total_pct: percent.total_pct,
        ticks,
    }
}

fn parse_stat_field(stat: &str, key: &str) -> Option<u64> {
    stat.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? == key {
            parts.next()?.parse().ok()
        } else {
            None
        }
    })
}

fn parse_cpu_stat(stat: &str) -> (u64, u64, u64) {
    let mut user = 0;
    let mut system = 0;
    let mut usage = 0;
    for line in stat.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if let Ok(value) = value.parse::<u64>() {
                match key {
                    "user_usec" => user = value,
                    "system_usec" => system = value,
                    "usage_usec" => usage = value,
                    _ => {}
                }
            }
        }
    }
    (user, system, usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cache_bytes_from_memory_stat() {
        let stat = "anon 1024\nfile 2048\nkernel 512\n";
        assert_eq!(parse_stat_field(stat, "file"), Some(2048));
    }

    #[test]
    fn missing_stat_field_yields_none() {
        let stat = "anon 1024\n";
        assert_eq!(parse_stat_field(stat, "file"), None);
    }

    #[test]
    fn parses_cpu_stat_counters() {
        let stat = "usage_usec 300\nuser_usec 200\nsystem_usec 100\n";
        assert_eq!(parse_cpu_stat(stat), (200, 100, 300));
    }

    #[test]
    fn zero_memory_max_mib_writes_memory_max_only() {
        let dir = std::env::temp_dir().join(format!(
            "sbox-executor-test-mem-{}-{}",
            std::process::id(),
            0
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::File::create(dir.join("cpu.max")).unwrap();
        std::fs::File::create(dir.join("memory.max")).unwrap();
        let cgroup = CgroupFile::new(&dir);
        let environment = Environment::new().resources(256, 0, 50_000);
        write_resource_constraints(&cgroup, &environment).unwrap();
        assert_eq!(cgroup.read("memory.max").unwrap(), "256");
        assert_eq!(cgroup.read("cpu.max").unwrap(), "50000 100000");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn nonzero_memory_max_mib_writes_low_and_max() {
        let dir = std::env::temp_dir().join(format!(
            "sbox-executor-test-mem-{}-{}",
            std::process::id(),
            1
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::File::create(dir.join("cpu.max")).unwrap();
        std::fs::File::create(dir.join("memory.low")).unwrap();
        std::fs::File::create(dir.join("memory.max")).unwrap();
        let cgroup = CgroupFile::new(&dir);
        let environment = Environment::new().resources(256, 512, 50_000);
        write_resource_constraints(&cgroup, &environment).unwrap();
        assert_eq!(cgroup.read("memory.low").unwrap(), "256");
        assert_eq!(cgroup.read("memory.max").unwrap(), "512");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
