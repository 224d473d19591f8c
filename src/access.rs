use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Error;

bitflags::bitflags! {
    /// The `{r, w, x}` modes a `path:modes` entry can grant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessModes: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

impl fmt::Display for AccessModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(AccessModes::READ) {
            write!(f, "r")?;
        }
        if self.contains(AccessModes::WRITE) {
            write!(f, "w")?;
        }
        if self.contains(AccessModes::EXECUTE) {
            write!(f, "x")?;
        }
        Ok(())
    }
}

/// One `path:modes` entry of `access_specs`. Shared vocabulary between
/// `LaunchPlan` (serializes these to argv tokens for the shim) and the shim
/// itself (parses them back into Landlock rules) — the round trip is exact
/// because both sides go through this single type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSpec {
    pub path: PathBuf,
    pub modes: AccessModes,
}

impl AccessSpec {
    pub fn new(path: impl Into<PathBuf>, modes: AccessModes) -> Self {
        Self {
            path: path.into(),
            modes,
        }
    }

    /// Parses a single `path:modes` token. Fatal per §4.5 step 5: missing
    /// the `:modes` suffix, an empty mode set, or an unrecognized mode
    /// character are all rejected here rather than downstream.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let (path, modes) = raw.rsplit_once(':').ok_or_else(|| Error::InvalidAccessSpec {
            spec: raw.to_owned(),
            reason: "missing `:modes` suffix".to_owned(),
        })?;
        if path.is_empty() {
            return Err(Error::InvalidAccessSpec {
                spec: raw.to_owned(),
                reason: "empty path".to_owned(),
            });
        }
        let modes = parse_modes(modes).map_err(|reason| Error::InvalidAccessSpec {
            spec: raw.to_owned(),
            reason,
        })?;
        Ok(Self {
            path: PathBuf::from(path),
            modes,
        })
    }

    /// Serializes back to the `path:modes` argv form `LaunchPlan` passes to
    /// the shim.
    pub fn to_arg(&self) -> String {
        format!("{}:{}", self.path.display(), self.modes)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn is_dir(&self) -> bool {
        self.path.is_dir()
    }
}

fn parse_modes(raw: &str) -> Result<AccessModes, String> {
    if raw.is_empty() {
        return Err("empty mode set".to_owned());
    }
    let mut modes = AccessModes::empty();
    for ch in raw.chars() {
        modes |= match ch {
            'r' => AccessModes::READ,
            'w' => AccessModes::WRITE,
            'x' => AccessModes::EXECUTE,
            other => return Err(format!("unsupported mode character {other:?}")),
        };
    }
    Ok(modes)
}

/// Parses the ordered `path-specs` list as handed to the shim (`convert`,
/// §4.5 step 5), preserving order and duplicates exactly as given.
pub fn parse_all(raw: &[String]) -> Result<Vec<AccessSpec>, Error> {
    raw.iter().map(|s| AccessSpec::parse(s)).collect()
}

pub fn existing_path(spec: &AccessSpec) -> Result<&Path, Error> {
    if !spec.exists() {
        return Err(Error::InvalidAccessSpec {
            spec: spec.to_arg(),
            reason: "path does not exist".to_owned(),
        });
    }
    Ok(&spec.path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_modes() {
        let spec = AccessSpec::parse("/usr/bin:rx").unwrap();
        assert_eq!(spec.path, PathBuf::from("/usr/bin"));
        assert_eq!(spec.modes, AccessModes::READ | AccessModes::EXECUTE);
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(matches!(
            AccessSpec::parse("/etc/passwd"),
            Err(Error::InvalidAccessSpec { .. })
        ));
    }

    #[test]
    fn rejects_empty_modes() {
        assert!(matches!(
            AccessSpec::parse("/etc/passwd:"),
            Err(Error::InvalidAccessSpec { .. })
        ));
    }

    #[test]
    fn rejects_unknown_mode_char() {
        assert!(matches!(
            AccessSpec::parse("/etc/passwd:z"),
            Err(Error::InvalidAccessSpec { .. })
        ));
    }

    #[test]
    fn round_trips_through_to_arg() {
        let spec = AccessSpec::new("/srv/data", AccessModes::READ | AccessModes::WRITE);
        let roundtripped = AccessSpec::parse(&spec.to_arg()).unwrap();
        assert_eq!(spec, roundtripped);
    }

    #[test]
    fn preserves_order_and_duplicates() {
        let raw = vec!["/a:r".to_owned(), "/a:r".to_owned(), "/b:w".to_owned()];
        let parsed = parse_all(&raw).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], parsed[1]);
    }
}
