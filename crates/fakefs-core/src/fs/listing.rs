// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory listing and tree walks

use std::collections::HashSet;

use super::FsCore;
use crate::error::{FsError, FsResult};
use crate::stat::{FileType, StatResult};

/// One entry produced by [`FsCore::scandir`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanEntry {
    pub name: String,
    pub path: String,
    pub inode: u64,
    /// Type of the entry itself, not of a symlink's target
    pub file_type: FileType,
    /// Whether the entry, following symlinks, is a directory
    pub is_dir: bool,
    /// Whether the entry, following symlinks, is a regular file
    pub is_file: bool,
    pub lstat: StatResult,
}

impl ScanEntry {
    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// One directory visited by [`FsCore::walk`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkEntry {
    pub dir_path: String,
    pub dir_names: Vec<String>,
    pub file_names: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalkOptions {
    /// Report a directory before its subdirectories
    pub top_down: bool,
    /// Descend into symlinks to directories
    pub follow_links: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self { top_down: true, follow_links: false }
    }
}

/// Callback receiving listing failures during a walk
pub type WalkErrorHandler<'a> = &'a mut dyn FnMut(&FsError);

impl FsCore {
    /// Entry names of a directory in creation order.
    pub fn listdir(&self, path: &str) -> FsResult<Vec<String>> {
        let id = self.resolve(path, true)?;
        let node = self.node(id)?;
        if !node.is_dir() {
            return Err(FsError::not_a_directory(path));
        }
        if !self.is_root_identity()
            && !self.windows()
            && !node.stat.has_permission(crate::stat::PERM_READ, self.uid, self.gid)
        {
            return Err(FsError::permission_denied(path));
        }
        Ok(node.entry_names())
    }

    pub fn listdir_sorted(&self, path: &str) -> FsResult<Vec<String>> {
        let mut names = self.listdir(path)?;
        names.sort();
        Ok(names)
    }

    pub fn scandir(&self, path: &str) -> FsResult<Vec<ScanEntry>> {
        let dir_path = self.resolve_path(path, true)?;
        let mut entries = Vec::new();
        for name in self.listdir(path)? {
            let entry_path = self.syntax.join(&[&dir_path, &name]);
            let lstat = self.stat(&entry_path, false)?;
            let target = self.get_entry(&entry_path).ok();
            entries.push(ScanEntry {
                inode: lstat.st_ino,
                file_type: lstat.file_type(),
                is_dir: target.is_some_and(|n| n.is_dir()),
                is_file: target.is_some_and(|n| n.is_file()),
                lstat,
                path: entry_path,
                name,
            });
        }
        Ok(entries)
    }

    /// Walks the tree below `top`.
    ///
    /// A directory that cannot be listed is handed to `on_error` and
    /// skipped, so the walk continues with its siblings. Without a handler
    /// the first failure is returned.
    pub fn walk(
        &self,
        top: &str,
        options: WalkOptions,
        mut on_error: Option<WalkErrorHandler<'_>>,
    ) -> FsResult<Vec<WalkEntry>> {
        let mut out = Vec::new();
        let mut active = HashSet::new();
        self.walk_dir(top, true, options, &mut on_error, &mut active, &mut out)?;
        Ok(out)
    }

    fn walk_dir(
        &self,
        dir_path: &str,
        top_most: bool,
        options: WalkOptions,
        on_error: &mut Option<WalkErrorHandler<'_>>,
        active: &mut HashSet<(u64, u64)>,
        out: &mut Vec<WalkEntry>,
    ) -> FsResult<()> {
        if !top_most && !options.follow_links && self.is_link(dir_path) {
            return Ok(());
        }
        let names = match self.listdir(dir_path) {
            Ok(names) => names,
            Err(err) => {
                return match on_error.as_mut() {
                    Some(handler) => {
                        (*handler)(&err);
                        Ok(())
                    }
                    None => Err(err),
                }
            }
        };
        // a followed link cycle would otherwise recurse forever
        let key = self.stat(dir_path, true).map(|s| (s.st_dev, s.st_ino))?;
        if !active.insert(key) {
            return Ok(());
        }

        let mut entry = WalkEntry {
            dir_path: dir_path.to_string(),
            dir_names: Vec::new(),
            file_names: Vec::new(),
        };
        for name in names {
            if self.is_dir(&self.syntax.join(&[dir_path, &name])) {
                entry.dir_names.push(name);
            } else {
                entry.file_names.push(name);
            }
        }
        let subdirs = entry.dir_names.clone();
        if options.top_down {
            out.push(entry.clone());
        }
        for name in subdirs {
            let child = self.syntax.join(&[dir_path, &name]);
            self.walk_dir(&child, false, options, on_error, active, out)?;
        }
        if !options.top_down {
            out.push(entry);
        }
        active.remove(&key);
        Ok(())
    }
}
