//! Path containment for sandbox file operations.
//!
//! Every remote path is resolved lexically against the user's home. The
//! result must stay inside the home and must not touch a reserved file.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Entries in a sandbox home that users may neither see nor touch.
pub const RESERVED_FILES: &[&str] = &[
    "setup_container.sh",
    "startup.sh",
    ".bashrc",
    ".profile",
    ".bash_logout",
    ".local",
    ".cache",
    ".config",
    ".wget-hsts",
    ".sudo_as_admin_successful",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_FILES.contains(&name)
}

fn violation(path: &str, reason: &str) -> Error {
    Error::PathViolation {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Resolves `requested` against `home`.
///
/// Relative paths are joined to `home`; absolute paths are taken as given.
/// `.` and `..` are folded without touching the filesystem.
pub fn resolve(home: &Path, requested: &str) -> Result<PathBuf> {
    if requested.contains('\0') {
        return Err(violation(requested, "contains a NUL byte"));
    }

    let joined = if requested.is_empty() {
        home.to_path_buf()
    } else {
        home.join(requested)
    };

    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => resolved.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => resolved.push(part),
        }
    }

    let Ok(relative) = resolved.strip_prefix(home) else {
        return Err(violation(requested, "escapes the home directory"));
    };
    if let Some(Component::Normal(first)) = relative.components().next() {
        if is_reserved(&first.to_string_lossy()) {
            return Err(violation(requested, "is a reserved system file"));
        }
    }

    Ok(resolved)
}

/// Checks that `name` is a bare, non-reserved file name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(violation(name, "is not a file name"));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(violation(name, "must not contain path separators"));
    }
    if is_reserved(name) {
        return Err(violation(name, "is a reserved system file"));
    }
    Ok(())
}

/// Reduces an uploaded file name to a safe bare name.
///
/// Directories are dropped, characters outside `[A-Za-z0-9._-]` become `_`
/// and leading dots are stripped.
pub fn sanitize_filename(name: &str) -> Result<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    validate_name(&cleaned)?;
    Ok(cleaned)
}

/// Quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> PathBuf {
        PathBuf::from("/home/alice")
    }

    #[test]
    fn relative_paths_join_home() {
        assert_eq!(
            resolve(&home(), "blink/blink.ino").unwrap(),
            PathBuf::from("/home/alice/blink/blink.ino")
        );
        assert_eq!(resolve(&home(), "").unwrap(), home());
        assert_eq!(resolve(&home(), "./a/../b").unwrap(), home().join("b"));
    }

    #[test]
    fn escapes_are_rejected() {
        for bad in ["../bob/secret", "/etc/passwd", "a/../../..", "/home/alice2/x"] {
            let err = resolve(&home(), bad).unwrap_err();
            assert!(matches!(err, Error::PathViolation { .. }), "{bad}");
        }
    }

    #[test]
    fn absolute_path_inside_home_is_allowed() {
        assert_eq!(
            resolve(&home(), "/home/alice/x.ino").unwrap(),
            home().join("x.ino")
        );
    }

    #[test]
    fn reserved_files_are_rejected_at_top_level() {
        assert!(resolve(&home(), ".bashrc").is_err());
        assert!(resolve(&home(), "setup_container.sh").is_err());
        assert!(resolve(&home(), ".config/anything").is_err());
        assert!(resolve(&home(), "project/.bashrc").is_ok());
    }

    #[test]
    fn names_must_be_bare() {
        assert!(validate_name("new.ino").is_ok());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("startup.sh").is_err());
    }

    #[test]
    fn uploaded_names_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/my sketch.ino").unwrap(), "my_sketch.ino");
        assert_eq!(sanitize_filename(".hidden").unwrap(), "hidden");
        assert!(sanitize_filename("...").is_err());
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }
}
