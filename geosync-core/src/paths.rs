//! Path handling for pushed files
//!
//! Client paths are normalized before any comparison. Storage locations are
//! derived from them with [`secure_filename`] so every file lands on a
//! filesystem-safe name inside its version directory.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{Result, SyncError};
use crate::model::VersionName;

/// Canonical client-visible form of a path.
///
/// Backslashes become `/`, empty and `.` components are dropped.
/// Empty paths and `..` components are rejected.
pub fn normalize_path(path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(SyncError::InvalidPath(path.to_string())),
            p if p.chars().any(|c| c.is_control()) => {
                return Err(SyncError::InvalidPath(path.to_string()));
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(SyncError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

/// Filesystem-safe version of a single path component.
pub fn secure_filename(component: &str) -> String {
    let mapped: String = component
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = mapped.trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Filesystem-safe relative path (each component sanitized).
pub fn secure_path(path: &str) -> String {
    path.split('/')
        .filter(|p| !p.is_empty())
        .map(secure_filename)
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether the changeset engine handles files with this path.
pub fn is_diffable(path: &str, extensions: &[String]) -> bool {
    let lower = path.to_lowercase();
    extensions
        .iter()
        .any(|ext| lower.ends_with(&ext.to_lowercase()))
}

/// Location of a file's diff sibling.
pub fn diff_location(location: &str) -> String {
    format!("{}-diff-{}", location, uuid::Uuid::new_v4().simple())
}

/// Assigns storage locations for the files written in one version.
///
/// Two paths that sanitize to the same name get distinct locations; a
/// random suffix is appended to the later one.
#[derive(Debug)]
pub struct LocationMap {
    version: VersionName,
    by_path: HashMap<String, String>,
    taken: HashSet<String>,
}

impl LocationMap {
    pub fn new(version: VersionName) -> Self {
        Self {
            version,
            by_path: HashMap::new(),
            taken: HashSet::new(),
        }
    }

    /// Location for `path`, assigning one on first use.
    pub fn assign(&mut self, path: &str) -> String {
        if let Some(existing) = self.by_path.get(path) {
            return existing.clone();
        }
        let base = format!("{}/{}", self.version, secure_path(path));
        let mut candidate = base.clone();
        while self.taken.contains(&candidate.to_lowercase()) {
            candidate = with_suffix(&base, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        }
        self.taken.insert(candidate.to_lowercase());
        self.by_path.insert(path.to_string(), candidate.clone());
        candidate
    }
}

fn with_suffix(location: &str, suffix: &str) -> String {
    let p = Path::new(location);
    let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let name = match p.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{}.{}", stem, suffix, ext),
        None => format!("{}_{}", stem, suffix),
    };
    match location.rsplit_once('/') {
        Some((dir, _)) => format!("{}/{}", dir, name),
        None => name,
    }
}

/// Compiled blacklist of glob patterns.
///
/// `*` matches any run of characters, `?` a single one. A pattern ending
/// in `/` matches a directory anywhere in the path. Patterns without `/`
/// are matched against the file name only.
#[derive(Debug, Clone)]
pub struct Blacklist {
    dirs: Vec<String>,
    names: Vec<Regex>,
    full: Vec<Regex>,
}

impl Blacklist {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut dirs = Vec::new();
        let mut names = Vec::new();
        let mut full = Vec::new();
        for pattern in patterns {
            if let Some(dir) = pattern.strip_suffix('/') {
                dirs.push(dir.to_string());
            } else if pattern.contains('/') {
                full.push(glob_to_regex(pattern)?);
            } else {
                names.push(glob_to_regex(pattern)?);
            }
        }
        Ok(Self { dirs, names, full })
    }

    pub fn is_blacklisted(&self, path: &str) -> bool {
        let mut components: Vec<&str> = path.split('/').collect();
        let file_name = components.pop().unwrap_or("");
        if components
            .iter()
            .any(|c| self.dirs.iter().any(|d| d == c))
        {
            return true;
        }
        self.names.iter().any(|re| re.is_match(file_name))
            || self.full.iter().any(|re| re.is_match(path))
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
        .map_err(|e| SyncError::internal(format!("Invalid blacklist pattern '{}': {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/b.gpkg").unwrap(), "a/b.gpkg");
        assert_eq!(normalize_path("a\\b\\c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_path("./a//b").unwrap(), "a/b");
        assert!(normalize_path("").is_err());
        assert!(normalize_path("/").is_err());
        assert!(normalize_path("a/../b").is_err());
    }

    #[test]
    fn test_secure_filename() {
        assert_eq!(secure_filename("data.gpkg"), "data.gpkg");
        assert_eq!(secure_filename("my file:1.gpkg"), "my_file_1.gpkg");
        assert_eq!(secure_filename(".."), "_");
        assert_eq!(secure_filename(".hidden"), "hidden");
        assert_eq!(secure_filename("čšž.txt"), "čšž.txt");
    }

    #[test]
    fn test_location_map_disambiguates_collisions() {
        let mut map = LocationMap::new(VersionName::new(2));
        let a = map.assign("a b.gpkg");
        let b = map.assign("a_b.gpkg");
        assert_eq!(a, "v2/a_b.gpkg");
        assert_ne!(a, b);
        assert!(b.starts_with("v2/a_b_"));
        assert!(b.ends_with(".gpkg"));
        // stable per path
        assert_eq!(map.assign("a_b.gpkg"), b);
        assert_eq!(map.assign("a b.gpkg"), a);
    }

    #[test]
    fn test_location_map_nested_paths() {
        let mut map = LocationMap::new(VersionName::new(1));
        assert_eq!(map.assign("dir one/x.gpkg"), "v1/dir_one/x.gpkg");
    }

    #[test]
    fn test_diff_location_keeps_prefix() {
        let loc = diff_location("v3/data.gpkg");
        assert!(loc.starts_with("v3/data.gpkg-diff-"));
    }

    #[test]
    fn test_is_diffable() {
        let exts = vec![".gpkg".to_string(), ".sqlite".to_string()];
        assert!(is_diffable("survey/points.GPKG", &exts));
        assert!(is_diffable("a.sqlite", &exts));
        assert!(!is_diffable("project.qgz", &exts));
    }

    #[test]
    fn test_blacklist() {
        let bl = Blacklist::new(&[
            ".mergin/".to_string(),
            "*.gpkg-wal".to_string(),
            "~$*".to_string(),
            "tmp/*.log".to_string(),
        ])
        .unwrap();
        assert!(bl.is_blacklisted(".mergin/client.log"));
        assert!(bl.is_blacklisted("sub/.mergin/x"));
        assert!(bl.is_blacklisted("data/a.gpkg-wal"));
        assert!(bl.is_blacklisted("~$report.docx"));
        assert!(bl.is_blacklisted("tmp/run.log"));
        assert!(!bl.is_blacklisted("data/a.gpkg"));
        assert!(!bl.is_blacklisted("other/run.log"));
    }

    proptest! {
        #[test]
        fn prop_secure_path_is_safe(path in "[a-zA-Z0-9 ./:_-]{1,40}") {
            if let Ok(normalized) = normalize_path(&path) {
                let secured = secure_path(&normalized);
                prop_assert!(!secured.starts_with('/'));
                for part in secured.split('/') {
                    prop_assert!(!part.is_empty());
                    prop_assert!(!part.starts_with('.'));
                }
            }
        }

        #[test]
        fn prop_normalize_is_idempotent(path in "[a-z/\\\\.]{1,30}") {
            if let Ok(once) = normalize_path(&path) {
                prop_assert_eq!(normalize_path(&once).unwrap(), once);
            }
        }
    }
}
