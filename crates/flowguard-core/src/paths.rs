use crate::error::{GuardError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const GUARD_DIR: &str = ".flowguard";
pub const CONFIG_FILE: &str = ".flowguard/config.yaml";
pub const STATE_FILE: &str = ".flowguard/state.yaml";

/// User-level settings, relative to the home directory.
pub const USER_CONFIG_FILE: &str = ".flowguard/config.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn guard_dir(root: &Path) -> PathBuf {
    root.join(GUARD_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn state_path(root: &Path) -> PathBuf {
    root.join(STATE_FILE)
}

/// `~/.flowguard/config.yaml`, or `None` when no home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    home::home_dir().map(|h| h.join(USER_CONFIG_FILE))
}

/// Express `path` relative to `root` when it lives underneath it, with `./`
/// prefixes removed. Paths outside the root are returned as given.
pub fn normalize_path(root: &Path, path: &str) -> String {
    let p = Path::new(path);
    let rel = p.strip_prefix(root).unwrap_or(p);
    let s = rel.to_string_lossy();
    let mut s = s.as_ref();
    while let Some(rest) = s.strip_prefix("./") {
        s = rest;
    }
    s.to_string()
}

/// Collapse `.` and `..` components without touching the filesystem.
/// Returns `None` when `..` climbs above the path's starting point.
pub fn lexical_clean(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            p => parts.push(p),
        }
    }
    let joined = parts.join("/");
    if path.starts_with('/') {
        Some(format!("/{joined}"))
    } else {
        Some(joined)
    }
}

// ---------------------------------------------------------------------------
// Feature id validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

pub fn validate_feature_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !id_re().is_match(id) {
        return Err(GuardError::InvalidFeatureId(id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_feature_ids() {
        for id in ["auth-login", "a", "f1", "billing-v2"] {
            validate_feature_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
    }

    #[test]
    fn invalid_feature_ids() {
        for id in ["", "-lead", "trail-", "has space", "UPPER", "a_b"] {
            assert!(validate_feature_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.flowguard/config.yaml")
        );
        assert_eq!(
            state_path(root),
            PathBuf::from("/tmp/proj/.flowguard/state.yaml")
        );
    }

    #[test]
    fn normalize_strips_root_and_dot_prefix() {
        let root = Path::new("/tmp/proj");
        assert_eq!(normalize_path(root, "/tmp/proj/src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path(root, "./src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path(root, "/etc/hosts"), "/etc/hosts");
    }

    #[test]
    fn lexical_clean_collapses_dot_segments() {
        assert_eq!(lexical_clean("./target/debug/").as_deref(), Some("target/debug"));
        assert_eq!(lexical_clean("target/../src").as_deref(), Some("src"));
        assert_eq!(lexical_clean("/tmp/../home").as_deref(), Some("/home"));
        assert_eq!(lexical_clean("target/../../etc"), None);
        assert_eq!(lexical_clean("/.."), None);
    }
}
