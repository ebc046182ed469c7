//! Path parsing utilities.
//!
//! Components are yielded with empty segments and `.` filtered out; `..`
//! is kept and interpreted by the lookup walk (it needs mount-root
//! awareness the string layer cannot have).

use salern_abi::{Errno, PATH_MAX};

/// Splits a path into components, dropping empty segments and `.`.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

/// Returns `true` if the path starts with `/`.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Validates the overall path length.
///
/// # Errors
///
/// `ENAMETOOLONG` past [`PATH_MAX`], `ENOENT` for the empty path.
pub fn check(path: &str) -> Result<(), Errno> {
    if path.is_empty() {
        return Err(Errno::Enoent);
    }
    if path.len() >= PATH_MAX {
        return Err(Errno::Enametoolong);
    }
    Ok(())
}

/// Splits a path into `(parent, final_component)`.
///
/// `"/a/b/c"` becomes `("/a/b", "c")`; `"c"` becomes `("", "c")`. Paths
/// ending in `/` or `..` have no usable final component.
#[must_use]
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let (parent, name) = match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some((parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_filter_dot_and_empty() {
        let got: Vec<_> = components("/usr//./bin/ls").collect();
        assert_eq!(got, ["usr", "bin", "ls"]);
        assert_eq!(components("/").count(), 0);
        let got: Vec<_> = components("a/../b").collect();
        assert_eq!(got, ["a", "..", "b"]);
    }

    #[test]
    fn absolute_detection() {
        assert!(is_absolute("/etc"));
        assert!(!is_absolute("etc"));
        assert!(!is_absolute(""));
    }

    #[test]
    fn split_parent_cases() {
        assert_eq!(split_parent("/a/b/c"), Some(("/a/b", "c")));
        assert_eq!(split_parent("c"), Some(("", "c")));
        assert_eq!(split_parent("/c"), Some(("", "c")));
        assert_eq!(split_parent("/a/b/"), Some(("/a", "b")));
        assert_eq!(split_parent("/"), None);
        assert_eq!(split_parent("/a/.."), None);
    }

    #[test]
    fn check_bounds() {
        assert_eq!(check(""), Err(Errno::Enoent));
        assert!(check("/ok").is_ok());
        let long = "/".repeat(PATH_MAX + 1);
        assert_eq!(check(&long), Err(Errno::Enametoolong));
    }
}
