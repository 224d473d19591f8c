use std::thread::sleep;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::error::Error;

/// Cadence at which an `Orphan` waiter polls for the watched PID's
/// existence. Cheap and unprivileged: `kill(pid, 0)` per POSIX just checks
/// permission and existence, it never actually signals anything.
const ORPHAN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The outcome of a finished wait: an exit code alongside the convention
/// used to produce it.
///
/// For a reaped child, a normal exit yields its real status; a signal death
/// is folded into `128 + signal number`, the same mapping a POSIX shell
/// uses for `$?`. For a recovered orphan, Linux gives no way to retrieve a
/// non-child's real exit status, so `0` stands in for "exited, cause
/// unknown" — this is a documented simplification, not a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub exit_code: i32,
    pub known: bool,
}

/// Blocks until a supervised process terminates and reports its result.
///
/// `wait` consumes the waiter, which is how "called at most once" is
/// enforced: there is no second `Waiter` left to call it on.
pub enum Waiter {
    /// Built from a process this core itself cloned — reaping it recovers a
    /// real exit status.
    Child(Pid),
    /// Built from a bare PID recovered after a host-agent restart — this
    /// core did not create the process, so it cannot be reaped; existence
    /// is polled instead.
    Orphan(Pid),
}

impl Waiter {
    pub fn wait(self) -> Result<ExitOutcome, Error> {
        match self {
            Waiter::Child(pid) => wait_child(pid),
            Waiter::Orphan(pid) => {
                wait_orphan(pid);
                Ok(ExitOutcome {
                    exit_code: 0,
                    known: false,
                })
            }
        }
    }
}

fn wait_child(pid: Pid) -> Result<ExitOutcome, Error> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitOutcome {
                    exit_code: code,
                    known: true,
                })
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(ExitOutcome {
                    exit_code: 128 + signal as i32,
                    known: true,
                })
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(Error::WaitFailed { source }),
        }
    }
}

/// Polls `/proc/<pid>` existence (equivalently, `kill(pid, 0)`) until the
/// process is gone.
fn wait_orphan(pid: Pid) {
    loop {
        match nix::sys::signal::kill(pid, None) {
            Ok(()) => sleep(ORPHAN_POLL_INTERVAL),
            Err(Errno::ESRCH) => return,
            Err(_) => sleep(ORPHAN_POLL_INTERVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal};
    use nix::unistd::{fork, ForkResult};

    #[test]
    fn wait_child_reports_normal_exit_code() {
        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => unsafe { nix::libc::_exit(42) },
            ForkResult::Parent { child } => {
                let outcome = wait_child(child).unwrap();
                assert_eq!(outcome, ExitOutcome { exit_code: 42, known: true });
            }
        }
    }

    #[test]
    fn wait_child_maps_signal_death_to_128_plus_signal() {
        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => {
                let _ = raise(Signal::SIGKILL);
                unsafe { nix::libc::_exit(1) }
            }
            ForkResult::Parent { child } => {
                let outcome = wait_child(child).unwrap();
                assert_eq!(
                    outcome,
                    ExitOutcome { exit_code: 128 + Signal::SIGKILL as i32, known: true }
                );
            }
        }
    }
}
