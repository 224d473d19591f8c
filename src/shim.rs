use std::ffi::CString;
use std::path::{Path, PathBuf};

use landlock::{
    Access, AccessFs, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr, ABI,
};
use nix::unistd::{alarm, execvpe};

use crate::access::{self, AccessSpec};
use crate::error::Error;

/// The subcommand name the host binary's argv dispatch recognizes before
/// doing anything else — the top-of-main branch the design notes describe.
pub const SUBCOMMAND: &str = "__sbox_shim";

/// Self-expiration window: if the shim has not `execve`d by the time this
/// fires, the default `SIGALRM` disposition kills the process. This is the
/// backstop against a shim that hangs resolving Landlock rules or the
/// target command and never hands control to the workload.
const EXPIRATION_SECONDS: u32 = 1;

/// Exit status for every fatal shim condition (§6: insufficient argv,
/// Landlock apply failure, command resolution failure, `execve` failure,
/// self-expiration). The shim never returns on a successful path — `execve`
/// replaces the process image — so one code for every failure kind is
/// sufficient; the real cause is logged before exit, not encoded in the
/// status.
pub const EXIT_FAILURE: i32 = 111;

const LANDLOCK_ABI: ABI = ABI::V5;

/// Runs the shim body given its own argv (i.e. everything the host binary
/// received after the subcommand token: `[<defaults-bool>, <path-specs…>,
/// "--", <cmd>, <cmd-args…>]`). Never returns: either `execve` replaces this
/// process, or a fatal condition exits it with [`EXIT_FAILURE`].
pub fn run(shim_args: &[String]) -> ! {
    match run_inner(shim_args) {
        Ok(never) => match never {},
        Err(err) => {
            tracing::error!(error = %err, "shim failed before exec");
            std::process::exit(EXIT_FAILURE);
        }
    }
}

fn run_inner(shim_args: &[String]) -> Result<std::convert::Infallible, Error> {
    // Step 1: self-expiration timer.
    alarm::set(EXPIRATION_SECONDS);

    // Step 2: validate argv length (§6: fewer than 5 remaining tokens is fatal).
    if shim_args.len() < 5 {
        return Err(Error::ShimArgv {
            reason: format!(
                "expected at least 5 tokens after the subcommand, got {}",
                shim_args.len()
            ),
        });
    }

    // Step 3: parse the defaults-bool.
    let defaults = match shim_args[0].as_str() {
        "true" => true,
        "false" => false,
        other => {
            return Err(Error::ShimArgv {
                reason: format!("defaults flag must be \"true\" or \"false\", got {other:?}"),
            })
        }
    };

    // Step 4: split on the first "--" sentinel.
    let rest = &shim_args[1..];
    let sep = rest
        .iter()
        .position(|a| a == "--")
        .ok_or_else(|| Error::ShimArgv {
            reason: "missing `--` separator before the command".to_owned(),
        })?;
    let (path_spec_args, after_sep) = rest.split_at(sep);
    let cmd = &after_sep[1..];
    if cmd.is_empty() {
        return Err(Error::ShimArgv {
            reason: "no command given after `--`".to_owned(),
        });
    }

    // Step 5: convert path-specs into access specs (fatal on parse error).
    let mut specs = access::parse_all(path_spec_args)?;
    for spec in &specs {
        access::existing_path(spec)?;
    }

    // Step 6: append baseline rules when requested.
    if defaults {
        specs.extend(baseline_rules());
    }

    // Step 7: apply Landlock in mandatory mode.
    apply_landlock(&specs)?;

    // Step 8: resolve the command on PATH, post-lockdown.
    let resolved = resolve_on_path(&cmd[0])?;

    // Disarm the expiration timer: from here on we are one step from exec.
    alarm::cancel();

    // Step 9: execve, replacing this process image.
    let filename = CString::new(resolved.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::CommandResolve {
            command: cmd[0].clone(),
        })?;
    let mut argv = vec![filename.clone()];
    argv.extend(
        cmd[1..]
            .iter()
            .map(|a| CString::new(a.as_bytes()).unwrap_or_default()),
    );
    let envp: Vec<CString> = std::env::vars()
        .map(|(k, v)| CString::new(format!("{k}={v}")).unwrap_or_default())
        .collect();
    execvpe(&filename, &argv, &envp).map_err(|source| Error::Spawn { source })
}

/// Baseline rules appended when `defaults` is requested: shared libraries,
/// stdio devices, the system temp directory, DNS resolution support, CA
/// certificate bundles, and read-exec on the standard binary directories.
/// Paths that don't exist on this host are skipped rather than failing —
/// unlike user-supplied specs, these are best-effort conveniences.
fn baseline_rules() -> Vec<AccessSpec> {
    use access::AccessModes as M;
    let entries: &[(&str, M)] = &[
        ("/lib", M::READ),
        ("/lib64", M::READ),
        ("/usr/lib", M::READ),
        ("/usr/lib64", M::READ),
        ("/dev/null", M::READ | M::WRITE),
        ("/dev/zero", M::READ | M::WRITE),
        ("/dev/full", M::READ | M::WRITE),
        ("/dev/random", M::READ),
        ("/dev/urandom", M::READ),
        ("/dev/tty", M::READ | M::WRITE),
        ("/tmp", M::READ | M::WRITE),
        ("/etc/resolv.conf", M::READ),
        ("/etc/nsswitch.conf", M::READ),
        ("/etc/hosts", M::READ),
        ("/etc/ssl/certs", M::READ),
        ("/etc/pki", M::READ),
        ("/bin", M::READ | M::EXECUTE),
        ("/usr/bin", M::READ | M::EXECUTE),
        ("/usr/local/bin", M::READ | M::EXECUTE),
    ];
    entries
        .iter()
        .filter(|(path, _)| Path::new(path).exists())
        .map(|(path, modes)| AccessSpec::new(*path, *modes))
        .collect()
}

#[tracing::instrument(level = "debug", skip(specs), fields(rule_count = specs.len()))]
fn apply_landlock(specs: &[AccessSpec]) -> Result<(), Error> {
    let ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(LANDLOCK_ABI))
        .and_then(|r| r.create())
        .map_err(|source| Error::LandlockApply { source })?;
    let mut created = ruleset;
    for spec in specs {
        let access = access_for(spec, LANDLOCK_ABI);
        let path_fd = PathFd::new(&spec.path).map_err(|_| Error::InvalidAccessSpec {
            spec: spec.to_arg(),
            reason: "cannot open path for Landlock rule".to_owned(),
        })?;
        created = created
            .add_rule(PathBeneath::new(path_fd, access))
            .map_err(|source| Error::LandlockApply { source })?;
    }
    created
        .restrict_self()
        .map_err(|source| Error::LandlockApply { source })?;
    tracing::debug!("landlock ruleset restricted");
    Ok(())
}

fn access_for(spec: &AccessSpec, abi: ABI) -> AccessFs {
    use access::AccessModes as M;
    let is_dir = spec.is_dir();
    let mut access = AccessFs::empty();
    if spec.modes.contains(M::READ) {
        access |= if is_dir {
            AccessFs::from_read(abi)
        } else {
            AccessFs::ReadFile
        };
    }
    if spec.modes.contains(M::WRITE) {
        access |= if is_dir {
            AccessFs::from_write(abi)
        } else {
            AccessFs::WriteFile
        };
    }
    if spec.modes.contains(M::EXECUTE) {
        access |= AccessFs::Execute;
    }
    access
}

/// Resolves `command` to an absolute path using the current `PATH`. Runs
/// after Landlock is locked in: the lookup itself must still succeed under
/// the granted rules, which is why the baseline rule set always includes
/// read-exec on the standard binary directories.
fn resolve_on_path(command: &str) -> Result<PathBuf, Error> {
    let candidate = Path::new(command);
    if candidate.is_absolute() || command.contains('/') {
        return if candidate.is_file() {
            Ok(candidate.to_owned())
        } else {
            Err(Error::CommandResolve {
                command: command.to_owned(),
            })
        };
    }
    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(command);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(Error::CommandResolve {
        command: command.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_absolute_paths_directly() {
        assert_eq!(resolve_on_path("/bin/sh").unwrap(), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn rejects_absolute_path_that_does_not_exist() {
        assert!(matches!(
            resolve_on_path("/no/such/binary"),
            Err(Error::CommandResolve { .. })
        ));
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(matches!(
            resolve_on_path("definitely-not-a-real-binary-xyz"),
            Err(Error::CommandResolve { .. })
        ));
    }

    #[test]
    fn baseline_rules_skip_absent_paths() {
        let rules = baseline_rules();
        assert!(rules.iter().all(|spec| spec.exists()));
    }
}
