//! Universal skip rules applied at index-build time and re-applied at
//! query time against stale records.
//!
//! The directory set is a closed list of lowercase basenames; files are
//! additionally dropped by an extension deny-list. On the system volume
//! the rules invert into an allowlist: anything under an allowed root is
//! kept regardless of the deny sets.

use once_cell::sync::Lazy;
use regex::Regex;

/// Directory basenames never indexed (lowercase).
pub const SKIP_DIRS: &[&str] = &[
    "windows",
    "program files",
    "program files (x86)",
    "programdata",
    "$recycle.bin",
    "system volume information",
    "recovery",
    "perflogs",
    "node_modules",
    "__pycache__",
    "site-packages",
    "target",
    "obj",
    "dist",
    ".git",
    ".svn",
];

/// File extensions never indexed (lowercase, with leading dot).
pub const SKIP_EXTS: &[&str] = &[
    ".tmp", ".dll", ".sys", ".pyc", ".pyd", ".lock", ".etl", ".mui", ".pf",
];

/// CAD tool install trees; these ship hundreds of thousands of support
/// files that drown name searches.
static CAD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"autodesk|autocad ?\d{0,4}|solidworks|catia").unwrap());

pub fn skip_ext(ext: &str) -> bool {
    SKIP_EXTS.contains(&ext)
}

/// Whether `path_lower` sits under one of the allowlisted roots.
pub fn is_in_allowed_roots(path_lower: &str, allowed_roots_lower: &[String]) -> bool {
    allowed_roots_lower.iter().any(|root| {
        path_lower == root
            || path_lower.starts_with(&format!("{root}\\"))
            || path_lower.starts_with(&format!("{root}/"))
    })
}

/// True when a full path should be excluded from the index.
///
/// An allowlist hit overrides every deny rule.
pub fn should_skip_path(path_lower: &str, allowed_roots_lower: Option<&[String]>) -> bool {
    if let Some(roots) = allowed_roots_lower {
        if is_in_allowed_roots(path_lower, roots) {
            return false;
        }
    }

    if path_lower
        .split(['\\', '/'])
        .any(|part| SKIP_DIRS.contains(&part))
    {
        return true;
    }

    if CAD_PATTERN.is_match(path_lower) || path_lower.contains("tangent") {
        return true;
    }

    false
}

/// True when a directory (by basename and resolved path) should be
/// pruned, cutting its whole subtree.
pub fn should_skip_dir(
    name_lower: &str,
    path_lower: &str,
    allowed_roots_lower: Option<&[String]>,
) -> bool {
    if CAD_PATTERN.is_match(name_lower) || name_lower.contains("tangent") {
        return true;
    }

    if let Some(roots) = allowed_roots_lower {
        if is_in_allowed_roots(path_lower, roots) {
            return false;
        }
    }

    SKIP_DIRS.contains(&name_lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_dirs_are_skipped() {
        assert!(should_skip_path("c:\\windows\\system32\\drivers", None));
        assert!(should_skip_path("d:\\code\\app\\node_modules\\left-pad", None));
        assert!(!should_skip_path("d:\\code\\app\\src", None));
    }

    #[test]
    fn cad_trees_are_skipped_by_pattern() {
        assert!(should_skip_path("c:\\program data\\autodesk\\shared", None));
        assert!(should_skip_dir("autocad 2021", "d:\\autocad 2021", None));
        assert!(should_skip_dir("tangentcad", "d:\\tangentcad", None));
        assert!(!should_skip_dir("projects", "d:\\projects", None));
    }

    #[test]
    fn allowlist_overrides_deny_rules() {
        let roots = vec!["c:\\users\\me\\documents".to_string()];
        // "target" is in the deny set, but it lives under an allowed root.
        assert!(!should_skip_path(
            "c:\\users\\me\\documents\\target\\report.txt",
            Some(&roots)
        ));
        assert!(should_skip_path("c:\\other\\target\\report.txt", Some(&roots)));
    }

    #[test]
    fn extension_deny_list() {
        assert!(skip_ext(".tmp"));
        assert!(skip_ext(".dll"));
        assert!(!skip_ext(".txt"));
        assert!(!skip_ext(""));
    }

    #[test]
    fn allowed_root_matching_is_prefix_exact() {
        let roots = vec!["c:\\temp".to_string()];
        assert!(is_in_allowed_roots("c:\\temp", &roots));
        assert!(is_in_allowed_roots("c:\\temp\\sub\\f.txt", &roots));
        // Sibling that merely shares the prefix string is not inside.
        assert!(!is_in_allowed_roots("c:\\temporary\\f.txt", &roots));
    }
}
