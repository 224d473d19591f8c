use std::str::FromStr;

use nix::sys::signal::{killpg, Signal as NixSignal};
use nix::unistd::Pid;

use crate::error::Error;

/// Translates a symbolic signal name into a kernel signal number and
/// delivers it to the process group led by the task's child.
///
/// Delivery always targets the *process group*, never a single PID: the
/// child created by `LaunchPlan` is always made a process-group leader via
/// `setpgid`, so one signal reaches every descendant launched under the
/// namespaces the shim establishes.
#[derive(Debug, Clone, Copy)]
pub struct Signaler {
    pgid: Pid,
}

impl Signaler {
    /// `pgid` is the pid of the process-group leader — the direct child of
    /// `Executor::Start`, which always sets its own pgid to its own pid.
    pub fn new(pgid: Pid) -> Self {
        Self { pgid }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn signal(&self, name: &str) -> Result<(), Error> {
        let signal = parse_signal(name)?;
        let result = killpg(self.pgid, signal).map_err(|source| Error::SignalDelivery { source });
        match &result {
            Ok(()) => tracing::debug!(pgid = self.pgid.as_raw(), ?signal, "delivered signal"),
            Err(err) => tracing::warn!(pgid = self.pgid.as_raw(), ?signal, error = %err, "signal delivery failed"),
        }
        result
    }
}

fn parse_signal(name: &str) -> Result<NixSignal, Error> {
    // Accept both "SIGTERM" and "TERM", matching how job specs typically
    // hand these names through.
    let normalized = if name.starts_with("SIG") {
        name.to_owned()
    } else {
        format!("SIG{name}")
    };
    NixSignal::from_str(&normalized).map_err(|_| Error::UnsupportedSignal {
        name: name.to_owned(),
    })
}
