//! Entry name handling.
//!
//! Entry names are slash separated and relative. Directory entries are keyed
//! with a trailing separator so that a directory `a/` and a file `a` never
//! collide. The virtual root directory is keyed [`ROOT`].

use crate::{Error, Result};

/// The entry name separator.
pub const SEPARATOR: char = '/';

/// The key of the virtual root directory.
pub const ROOT: &str = "/";

/// Maximum length of an entry name in bytes.
const MAX_NAME_LENGTH: usize = 32768;

/// Splits an entry name into its parent key and base name.
///
/// A trailing separator is ignored. The parent keeps its trailing separator,
/// so it can be used as a directory key directly. Top level names have the
/// root as their parent. Returns `None` for the root itself.
///
/// ```
/// use archfs::entry_name::split;
///
/// assert_eq!(split("a/b/c.txt"), Some(("a/b/", "c.txt")));
/// assert_eq!(split("a/b/"), Some(("a/", "b")));
/// assert_eq!(split("a"), Some(("/", "a")));
/// assert_eq!(split("/"), None);
/// ```
pub fn split(name: &str) -> Option<(&str, &str)> {
    let trimmed = name.strip_suffix(SEPARATOR).unwrap_or(name);
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind(SEPARATOR) {
        Some(pos) => Some((&trimmed[..=pos], &trimmed[pos + 1..])),
        None => Some((ROOT, trimmed)),
    }
}

/// Returns the directory key for `name`: `name` with a trailing separator,
/// or the root key for the empty name.
pub fn dir_key(name: &str) -> String {
    if name.is_empty() || name == ROOT {
        ROOT.to_string()
    } else if name.ends_with(SEPARATOR) {
        name.to_string()
    } else {
        format!("{}{}", name, SEPARATOR)
    }
}

/// Returns the file key for `name`: `name` without a trailing separator.
pub fn file_key(name: &str) -> &str {
    name.strip_suffix(SEPARATOR).unwrap_or(name)
}

/// Returns `true` if `name` is a directory key.
pub fn is_dir_key(name: &str) -> bool {
    name.ends_with(SEPARATOR)
}

/// Joins a parent entry name and a child name with one separator.
///
/// An empty parent yields the child unchanged.
pub fn join(parent: &str, child: &str) -> String {
    let parent = parent.strip_suffix(SEPARATOR).unwrap_or(parent);
    if parent.is_empty() || parent == ROOT {
        child.to_string()
    } else if child.is_empty() {
        parent.to_string()
    } else {
        format!("{}{}{}", parent, SEPARATOR, child)
    }
}

/// Validates an entry name as stored in an archive.
///
/// Rejects names that contain NUL bytes, start with a separator, contain
/// empty, `.` or `..` segments, or exceed the length limit. A single
/// trailing separator (directory marker) is accepted.
pub fn validate(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidEntryName("empty name".into()));
    }
    if name.contains('\0') {
        return Err(Error::InvalidEntryName(format!("{:?} contains NUL byte", name)));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::InvalidEntryName(format!(
            "name exceeds maximum length of {} bytes",
            MAX_NAME_LENGTH
        )));
    }
    if name.starts_with(SEPARATOR) {
        return Err(Error::InvalidEntryName(format!("{:?} is absolute", name)));
    }
    for segment in file_key(name).split(SEPARATOR) {
        match segment {
            "" => {
                return Err(Error::InvalidEntryName(format!(
                    "{:?} has an empty segment",
                    name
                )));
            }
            "." | ".." => {
                return Err(Error::InvalidEntryName(format!(
                    "{:?} has a relative segment",
                    name
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_nested() {
        assert_eq!(split("a/b/c"), Some(("a/b/", "c")));
        assert_eq!(split("a/b/c/"), Some(("a/b/", "c")));
    }

    #[test]
    fn test_split_top_level() {
        assert_eq!(split("file.txt"), Some((ROOT, "file.txt")));
        assert_eq!(split("dir/"), Some((ROOT, "dir")));
    }

    #[test]
    fn test_split_root() {
        assert_eq!(split(ROOT), None);
        assert_eq!(split(""), None);
    }

    #[test]
    fn test_dir_key() {
        assert_eq!(dir_key(""), ROOT);
        assert_eq!(dir_key("a"), "a/");
        assert_eq!(dir_key("a/"), "a/");
        assert_eq!(dir_key("a/b"), "a/b/");
    }

    #[test]
    fn test_file_key() {
        assert_eq!(file_key("a/"), "a");
        assert_eq!(file_key("a/b"), "a/b");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "x"), "x");
        assert_eq!(join("a", "x"), "a/x");
        assert_eq!(join("a/", "x/y"), "a/x/y");
        assert_eq!(join("a", ""), "a");
    }

    #[test]
    fn test_validate_accepts() {
        assert!(validate("a").is_ok());
        assert!(validate("a/b.txt").is_ok());
        assert!(validate("a/b/").is_ok());
        assert!(validate("...").is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        for bad in ["", "/abs", "a//b", "a/./b", "../x", "a/..", "nul\0", "a//"] {
            assert!(validate(bad).is_err(), "{:?} should be rejected", bad);
        }
    }
}
