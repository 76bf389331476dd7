// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path string manipulation for the emulated host.
//!
//! Everything here is pure string math parameterized by [`PathSyntax`]; the
//! tree-aware parts of resolution (case folding against stored names and
//! symlink substitution) live in the engine. Paths are plain `str` rather
//! than `std::path::Path` because the emulated syntax (for example Windows
//! drive letters on a Linux host) is independent of the host's.

use crate::config::FsConfig;

/// Separator, case and drive rules of the emulated host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathSyntax {
    pub separator: char,
    pub alt_separator: Option<char>,
    pub case_sensitive: bool,
    pub drive_support: bool,
}

impl PathSyntax {
    pub fn posix() -> Self {
        Self { separator: '/', alt_separator: None, case_sensitive: true, drive_support: false }
    }

    pub fn windows() -> Self {
        Self { separator: '\\', alt_separator: Some('/'), case_sensitive: false, drive_support: true }
    }

    pub fn from_config(config: &FsConfig) -> Self {
        Self {
            separator: config.path_separator,
            alt_separator: config.alt_path_separator,
            case_sensitive: config.is_case_sensitive(),
            drive_support: config.drive_support,
        }
    }

    pub fn sep_str(&self) -> String {
        self.separator.to_string()
    }

    pub fn is_separator(&self, c: char) -> bool {
        c == self.separator || Some(c) == self.alt_separator
    }

    /// Replace every alternative separator with the primary one.
    pub fn normalize_separators(&self, path: &str) -> String {
        match self.alt_separator {
            Some(alt) => path.replace(alt, &self.sep_str()),
            None => path.to_string(),
        }
    }

    fn find_separator(&self, path: &str, from: usize) -> Option<usize> {
        path[from..]
            .char_indices()
            .find(|&(_, c)| self.is_separator(c))
            .map(|(i, _)| i + from)
    }

    /// Splits off a drive letter (`X:`) or UNC mount (`\\host\share`).
    ///
    /// The drive part is empty when drive support is off or the path has
    /// neither form.
    pub fn split_drive<'a>(&self, path: &'a str) -> (&'a str, &'a str) {
        if !self.drive_support {
            return ("", path);
        }
        let mut chars = path.chars();
        let (first, second, third) = (chars.next(), chars.next(), chars.next());
        match (first, second) {
            (Some(a), Some(b)) if self.is_separator(a) && self.is_separator(b) => {
                if third.is_some_and(|c| self.is_separator(c)) {
                    return ("", path);
                }
                let host_start = a.len_utf8() + b.len_utf8();
                let Some(host_end) = self.find_separator(path, host_start) else {
                    return ("", path);
                };
                let share_start = host_end + 1;
                let share_end = self.find_separator(path, share_start).unwrap_or(path.len());
                if share_end == share_start {
                    return ("", path);
                }
                (&path[..share_end], &path[share_end..])
            }
            (Some(a), Some(':')) if a.is_ascii_alphabetic() => (&path[..2], &path[2..]),
            _ => ("", path),
        }
    }

    pub fn starts_with_drive_letter(&self, path: &str) -> bool {
        let mut chars = path.chars();
        self.drive_support
            && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
            && chars.next() == Some(':')
    }

    /// True for paths anchored at the root or at a drive.
    pub fn starts_with_root(&self, path: &str) -> bool {
        path.chars().next().is_some_and(|c| self.is_separator(c))
            || self.starts_with_drive_letter(path)
    }

    pub fn is_absolute(&self, path: &str) -> bool {
        let (drive, rest) = self.split_drive(path);
        let leading_sep = |s: &str| s.chars().next().is_some_and(|c| self.is_separator(c));
        leading_sep(path) || (!drive.is_empty() && leading_sep(rest))
    }

    pub fn ends_with_separator(&self, path: &str) -> bool {
        let mut chars = path.chars();
        let Some(last) = chars.next_back() else {
            return false;
        };
        // a lone separator is the root, not a trailing separator
        chars.next().is_some() && self.is_separator(last)
    }

    pub fn strip_trailing_separators<'a>(&self, mut path: &'a str) -> &'a str {
        while self.ends_with_separator(path) {
            let cut = path.len() - path.chars().next_back().map_or(0, char::len_utf8);
            path = &path[..cut];
        }
        path
    }

    /// Lexical normalization: drops empty and `.` segments and resolves
    /// `..` against the preceding segment.
    ///
    /// Leading `..` segments of an absolute path collapse into the root;
    /// those of a relative path are kept. An empty result becomes `.`.
    pub fn collapse(&self, path: &str) -> String {
        let path = self.normalize_separators(path);
        let sep = self.separator;
        let sep_count = path.chars().count();
        if self.drive_support && (2..=3).contains(&sep_count) && path.chars().all(|c| c == sep) {
            return path;
        }
        let (drive, rest) = self.split_drive(&path);
        let is_absolute = rest.starts_with(sep);
        let mut collapsed: Vec<&str> = Vec::new();
        for component in rest.split(sep) {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                if collapsed.last().is_some_and(|last| *last != "..") {
                    collapsed.pop();
                    continue;
                }
                if is_absolute {
                    continue;
                }
            }
            collapsed.push(component);
        }
        let mut result = String::from(drive);
        if is_absolute {
            result.push(sep);
        }
        result.push_str(&collapsed.join(&self.sep_str()));
        if result.is_empty() {
            ".".to_string()
        } else {
            result
        }
    }

    /// Turns `path` into an absolute, collapsed path relative to `cwd`.
    ///
    /// Empty paths denote the root. Under drive support a drive-less
    /// absolute path is placed on the drive of `cwd` (`C:` if it has none).
    pub fn absolutize(&self, path: &str, cwd: &str) -> String {
        let path = self.normalize_separators(path);
        let sep = self.sep_str();
        let joined = if path.is_empty() {
            self.replace_root_with_drive(&sep, cwd)
        } else if path == "." {
            cwd.to_string()
        } else if !self.starts_with_root(&path) {
            if cwd == sep {
                format!("{}{}", sep, path)
            } else {
                format!("{}{}{}", cwd, sep, path)
            }
        } else {
            self.replace_root_with_drive(&path, cwd)
        };
        self.collapse(&joined)
    }

    fn replace_root_with_drive(&self, path: &str, cwd: &str) -> String {
        if !self.drive_support {
            return path.to_string();
        }
        let mut chars = path.chars();
        let first_is_sep = chars.next().is_some_and(|c| self.is_separator(c));
        let second_is_sep = chars.next().is_some_and(|c| self.is_separator(c));
        if first_is_sep && !second_is_sep {
            let (drive, _) = self.split_drive(cwd);
            let drive = if drive.is_empty() { "C:" } else { drive };
            format!("{}{}", drive, path)
        } else {
            path.to_string()
        }
    }

    /// Joins path segments; an absolute segment discards everything before it.
    pub fn join(&self, parts: &[&str]) -> String {
        match parts {
            [] => String::new(),
            [only] => only.to_string(),
            _ if self.drive_support => self.join_with_drive(parts),
            _ => {
                let mut joined = String::new();
                for part in parts {
                    if self.starts_with_root(part) {
                        joined = part.to_string();
                        continue;
                    }
                    if !joined.is_empty() && !joined.ends_with(|c| self.is_separator(c)) {
                        joined.push(self.separator);
                    }
                    joined.push_str(part);
                }
                joined
            }
        }
    }

    fn join_with_drive(&self, parts: &[&str]) -> String {
        let leading_sep = |s: &str| s.chars().next().is_some_and(|c| self.is_separator(c));
        let (drive, path) = self.split_drive(parts[0]);
        let mut result_drive = drive.to_string();
        let mut result_path = path.to_string();
        for part in &parts[1..] {
            let (drive_part, path_part) = self.split_drive(part);
            if leading_sep(path_part) {
                if !drive_part.is_empty() || result_drive.is_empty() {
                    result_drive = drive_part.to_string();
                }
                result_path = path_part.to_string();
                continue;
            }
            if !drive_part.is_empty() && drive_part != result_drive {
                if !self.names_equal(drive_part, &result_drive) {
                    // another drive: start over from this part
                    result_drive = drive_part.to_string();
                    result_path = path_part.to_string();
                    continue;
                }
                result_drive = drive_part.to_string();
            }
            if !result_path.is_empty() && !result_path.ends_with(|c| self.is_separator(c)) {
                result_path.push(self.separator);
            }
            result_path.push_str(path_part);
        }
        // UNC mount followed by a relative remainder needs a separator
        if !result_path.is_empty()
            && !leading_sep(&result_path)
            && !result_drive.is_empty()
            && !result_drive.ends_with(':')
        {
            return format!("{}{}{}", result_drive, self.separator, result_path);
        }
        result_drive + &result_path
    }

    /// Splits into `(head, tail)` where tail is the final component.
    pub fn split(&self, path: &str) -> (String, String) {
        let path = self.normalize_separators(path);
        let (drive, rest) = self.split_drive(&path);
        match rest.rfind(self.separator) {
            None => (drive.to_string(), rest.to_string()),
            Some(idx) => {
                let tail = &rest[idx + self.separator.len_utf8()..];
                let head_with_sep = &rest[..idx + self.separator.len_utf8()];
                let trimmed = head_with_sep.trim_end_matches(self.separator);
                let head = if trimmed.is_empty() { head_with_sep } else { trimmed };
                (format!("{}{}", drive, head), tail.to_string())
            }
        }
    }

    pub fn basename(&self, path: &str) -> String {
        self.split(path).1
    }

    pub fn dirname(&self, path: &str) -> String {
        self.split(path).0
    }

    /// Components of an absolute, normalized path; a drive is the first.
    pub fn components(&self, path: &str) -> Vec<String> {
        let path = self.normalize_separators(path);
        let (drive, rest) = self.split_drive(&path);
        let mut components: Vec<String> = Vec::new();
        if !drive.is_empty() {
            components.push(drive.to_string());
        }
        components.extend(rest.split(self.separator).filter(|c| !c.is_empty()).map(str::to_string));
        components
    }

    pub fn components_to_path(&self, components: &[String]) -> String {
        let path = components.join(&self.sep_str());
        if self.starts_with_root(&path) {
            path
        } else {
            format!("{}{}", self.separator, path)
        }
    }

    pub fn names_equal(&self, a: &str, b: &str) -> bool {
        if self.case_sensitive {
            a == b
        } else {
            a == b || a.to_lowercase() == b.to_lowercase()
        }
    }

    /// `true` when `prefix` is `path` or an ancestor of it.
    pub fn has_prefix(&self, path: &str, prefix: &str) -> bool {
        let path_components = self.components(path);
        let prefix_components = self.components(prefix);
        prefix_components.len() <= path_components.len()
            && prefix_components
                .iter()
                .zip(path_components.iter())
                .all(|(a, b)| self.names_equal(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_posix() {
        let p = PathSyntax::posix();
        assert_eq!(p.collapse("/a/./b//c/../d"), "/a/b/d");
        assert_eq!(p.collapse("/../../a"), "/a");
        assert_eq!(p.collapse("../a"), "../a");
        assert_eq!(p.collapse("../../a/.."), "../..");
        assert_eq!(p.collapse("a/.."), ".");
        assert_eq!(p.collapse(""), ".");
        assert_eq!(p.collapse("/"), "/");
    }

    #[test]
    fn test_collapse_is_idempotent() {
        let p = PathSyntax::windows();
        for path in ["C:\\a\\..\\b\\.\\c", "\\\\srv\\share\\x\\..", "..\\..\\a", "a/b\\c/"] {
            let once = p.collapse(path);
            assert_eq!(p.collapse(&once), once, "collapse not idempotent for {}", path);
        }
    }

    #[test]
    fn test_collapse_keeps_bare_unc_separators() {
        let p = PathSyntax::windows();
        assert_eq!(p.collapse("\\\\"), "\\\\");
        assert_eq!(p.collapse("\\\\\\"), "\\\\\\");
        assert_eq!(PathSyntax::posix().collapse("//"), "/");
    }

    #[test]
    fn test_split_drive() {
        let p = PathSyntax::windows();
        assert_eq!(p.split_drive("c:\\foo"), ("c:", "\\foo"));
        assert_eq!(p.split_drive("\\\\host\\share\\dir"), ("\\\\host\\share", "\\dir"));
        assert_eq!(p.split_drive("//host/share"), ("//host/share", ""));
        assert_eq!(p.split_drive("\\\\host"), ("", "\\\\host"));
        assert_eq!(p.split_drive("\\\\\\x"), ("", "\\\\\\x"));
        assert_eq!(p.split_drive("\\\\host\\\\share"), ("", "\\\\host\\\\share"));
        assert_eq!(PathSyntax::posix().split_drive("c:/foo"), ("", "c:/foo"));
    }

    #[test]
    fn test_absolutize() {
        let p = PathSyntax::posix();
        assert_eq!(p.absolutize("foo/bar", "/"), "/foo/bar");
        assert_eq!(p.absolutize("foo", "/home"), "/home/foo");
        assert_eq!(p.absolutize("", "/home"), "/");
        assert_eq!(p.absolutize(".", "/home"), "/home");

        let w = PathSyntax::windows();
        assert_eq!(w.absolutize("\\foo", "D:\\work"), "D:\\foo");
        assert_eq!(w.absolutize("/foo/bar", "C:\\"), "C:\\foo\\bar");
        assert_eq!(w.absolutize("baz", "C:\\work"), "C:\\work\\baz");
        assert_eq!(w.absolutize("\\\\srv\\share\\x", "C:\\"), "\\\\srv\\share\\x");
    }

    #[test]
    fn test_join_posix() {
        let p = PathSyntax::posix();
        assert_eq!(p.join(&["a", "b", "c"]), "a/b/c");
        assert_eq!(p.join(&["a/", "b"]), "a/b");
        assert_eq!(p.join(&["a", "/b", "c"]), "/b/c");
        assert_eq!(p.join(&["a", ""]), "a/");
    }

    #[test]
    fn test_join_with_drives() {
        let p = PathSyntax::windows();
        assert_eq!(p.join(&["c:", "foo"]), "c:foo");
        assert_eq!(p.join(&["c:\\a", "\\b"]), "c:\\b");
        assert_eq!(p.join(&["c:\\a", "d:b"]), "d:b");
        assert_eq!(p.join(&["c:\\a", "C:b"]), "C:\\a\\b");
        assert_eq!(p.join(&["\\\\srv\\share", "x"]), "\\\\srv\\share\\x");
    }

    #[test]
    fn test_split() {
        let p = PathSyntax::posix();
        assert_eq!(p.split("/a/b"), ("/a".to_string(), "b".to_string()));
        assert_eq!(p.split("/a"), ("/".to_string(), "a".to_string()));
        assert_eq!(p.split("a"), ("".to_string(), "a".to_string()));
        assert_eq!(p.split("/a/b/"), ("/a/b".to_string(), "".to_string()));

        let w = PathSyntax::windows();
        assert_eq!(w.split("C:\\foo"), ("C:\\".to_string(), "foo".to_string()));
        assert_eq!(w.split("C:foo"), ("C:".to_string(), "foo".to_string()));
    }

    #[test]
    fn test_components_roundtrip() {
        let w = PathSyntax::windows();
        let components = w.components("C:\\a\\b");
        assert_eq!(components, vec!["C:", "a", "b"]);
        assert_eq!(w.components_to_path(&components), "C:\\a\\b");
        let unc = w.components("\\\\srv\\share\\x");
        assert_eq!(unc, vec!["\\\\srv\\share", "x"]);
        assert_eq!(w.components_to_path(&unc), "\\\\srv\\share\\x");

        let p = PathSyntax::posix();
        assert!(p.components("/").is_empty());
        assert_eq!(p.components_to_path(&[]), "/");
    }

    #[test]
    fn test_trailing_separators() {
        let p = PathSyntax::posix();
        assert!(p.ends_with_separator("/a/"));
        assert!(!p.ends_with_separator("/"));
        assert_eq!(p.strip_trailing_separators("/a//"), "/a");
        assert_eq!(p.strip_trailing_separators("/"), "/");
    }

    #[test]
    fn test_names_equal_and_prefix() {
        let w = PathSyntax::windows();
        assert!(w.names_equal("Foo", "fOO"));
        assert!(!PathSyntax::posix().names_equal("Foo", "foo"));
        assert!(w.has_prefix("C:\\Mnt\\x", "c:\\mnt"));
        assert!(!w.has_prefix("C:\\mntx", "C:\\mnt"));
    }
}
