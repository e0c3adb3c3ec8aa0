//! Safe-name normalisation for user identifiers.
//!
//! A raw identifier is mapped to a name usable as a path component, a
//! container name and a host username. The mapping is deterministic but not
//! injective ("a.b" and "a_b" both become "a_b"), so the store rejects a new
//! user whose safe name is already taken.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Suffix appended to a safe name to form the container name.
pub const CONTAINER_SUFFIX: &str = "-dev";

/// Replaces every character outside `[A-Za-z0-9_-]` with `_`.
pub fn make_safe_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A user's raw identifier together with its normalised form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    raw: String,
    safe: String,
}

impl UserIdentity {
    /// Normalises `raw`. Empty identifiers are rejected.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(Error::InvalidIdentifier("identifier is empty".to_string()));
        }
        let safe = make_safe_name(&raw);
        Ok(Self { raw, safe })
    }

    /// The identifier as supplied by the caller.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The normalised identifier.
    pub fn safe(&self) -> &str {
        &self.safe
    }

    /// Name of the user's sandbox container.
    pub fn container_name(&self) -> String {
        format!("{}{}", self.safe, CONTAINER_SUFFIX)
    }

    /// Home directory inside the sandbox.
    pub fn sandbox_home(&self) -> PathBuf {
        PathBuf::from("/home").join(&self.safe)
    }

    /// Persistent per-user data directory on the host.
    pub fn host_data_dir(&self, data_root: &Path) -> PathBuf {
        data_root.join(&self.safe)
    }
}

/// Recovers the safe name from a container name, if it follows the naming scheme.
pub fn safe_name_from_container(container: &str) -> Option<&str> {
    container
        .strip_suffix(CONTAINER_SUFFIX)
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_keeps_allowed_characters() {
        assert_eq!(make_safe_name("alice_01-x"), "alice_01-x");
    }

    #[test]
    fn safe_name_replaces_everything_else() {
        assert_eq!(make_safe_name("a.b@c d"), "a_b_c_d");
        assert_eq!(make_safe_name("nguyễn"), "nguy_n");
    }

    #[test]
    fn distinct_raw_names_can_collide() {
        assert_eq!(make_safe_name("a.b"), make_safe_name("a_b"));
    }

    #[test]
    fn identity_derives_container_and_home() {
        let id = UserIdentity::new("bob.smith").unwrap();
        assert_eq!(id.raw(), "bob.smith");
        assert_eq!(id.safe(), "bob_smith");
        assert_eq!(id.container_name(), "bob_smith-dev");
        assert_eq!(id.sandbox_home(), PathBuf::from("/home/bob_smith"));
        assert_eq!(
            id.host_data_dir(Path::new("/srv/users")),
            PathBuf::from("/srv/users/bob_smith")
        );
    }

    #[test]
    fn empty_identity_is_rejected() {
        assert!(matches!(
            UserIdentity::new("  "),
            Err(Error::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn container_name_round_trips_to_safe_name() {
        assert_eq!(safe_name_from_container("alice-dev"), Some("alice"));
        assert_eq!(safe_name_from_container("-dev"), None);
        assert_eq!(safe_name_from_container("postgres"), None);
    }
}
