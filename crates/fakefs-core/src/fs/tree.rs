// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Tree mutations: creating, linking, moving and removing entries

use indexmap::IndexMap;
use tracing::debug;

use super::FsCore;
use crate::error::{FsError, FsResult};
use crate::node::{NodeId, NodeKind};
use crate::stat::{PERM_DEF, PERM_DEF_FILE, PERM_EXE, PERM_WRITE};

/// Initial contents of a new file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileContent {
    Bytes(Vec<u8>),
    /// Only a size is recorded; the file cannot be read or written.
    DeclaredSize(i64),
}

impl Default for FileContent {
    fn default() -> Self {
        FileContent::Bytes(Vec::new())
    }
}

/// Arguments of [`FsCore::create_file`]
#[derive(Clone, Debug)]
pub struct NewFile {
    pub perm_bits: u32,
    pub content: FileContent,
    pub create_missing_dirs: bool,
    pub apply_umask: bool,
}

impl Default for NewFile {
    fn default() -> Self {
        Self {
            perm_bits: PERM_DEF_FILE,
            content: FileContent::default(),
            create_missing_dirs: true,
            apply_umask: false,
        }
    }
}

impl NewFile {
    pub fn with_contents(bytes: impl Into<Vec<u8>>) -> Self {
        Self { content: FileContent::Bytes(bytes.into()), ..Self::default() }
    }

    pub fn with_size(size: i64) -> Self {
        Self { content: FileContent::DeclaredSize(size), ..Self::default() }
    }

    pub fn perm(mut self, perm_bits: u32) -> Self {
        self.perm_bits = perm_bits;
        self
    }

    pub fn missing_dirs(mut self, create: bool) -> Self {
        self.create_missing_dirs = create;
        self
    }

    pub fn umask(mut self, apply: bool) -> Self {
        self.apply_umask = apply;
        self
    }
}

/// Payload of an entry added directly under an existing directory
#[derive(Clone, Debug)]
pub enum NewEntryKind {
    File(FileContent),
    Directory,
    Symlink(String),
}

/// Arguments of [`FsCore::add_entry`]
#[derive(Clone, Debug)]
pub struct NewEntry {
    pub name: String,
    pub kind: NewEntryKind,
    pub perm_bits: u32,
}

impl NewEntry {
    pub fn file(name: &str, content: FileContent) -> Self {
        Self { name: name.to_string(), kind: NewEntryKind::File(content), perm_bits: PERM_DEF_FILE }
    }

    pub fn directory(name: &str) -> Self {
        Self { name: name.to_string(), kind: NewEntryKind::Directory, perm_bits: PERM_DEF }
    }

    pub fn symlink(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: NewEntryKind::Symlink(target.to_string()),
            perm_bits: PERM_DEF,
        }
    }
}

fn declared_size(size: i64, path: &str) -> FsResult<u64> {
    u64::try_from(size).map_err(|_| FsError::invalid(path, "negative file size"))
}

impl FsCore {
    fn not_a_directory_for_flavor(&self, path: &str) -> FsError {
        if self.windows() {
            FsError::not_found(path)
        } else {
            FsError::not_a_directory(path)
        }
    }

    /// Inserts `child` under `parent` as `name`, assigning an inode on first
    /// insertion. With `account` set, a first link charges the child's
    /// bytes to the parent's device before anything changes.
    pub(crate) fn link_child(
        &mut self,
        parent: NodeId,
        name: &str,
        child: NodeId,
        account: bool,
    ) -> FsResult<()> {
        let parent_path = self.node_path(parent)?;
        let child_path = self.syntax.join(&[&parent_path, name]);
        let windows = self.windows();
        let dir = self.node(parent)?;
        if !dir.is_dir() {
            return Err(FsError::not_a_directory(parent_path));
        }
        let writable = self.is_root_identity()
            || windows
            || dir.stat.has_permission(PERM_WRITE | PERM_EXE, self.uid, self.gid);
        if !writable {
            return Err(FsError::permission_denied(child_path));
        }
        if self.child_entry(parent, name).is_some() {
            return Err(FsError::already_exists(child_path));
        }
        let parent_dev = dir.stat.dev;
        let node = self.node(child)?;
        let first_link = node.is_dir() || node.stat.nlink == 0;
        let needs_inode = node.stat.ino.is_none();
        if account && first_link {
            let usage = self.subtree_usage(child)?;
            self.mounts.change_usage(parent_dev, usage as i64, &child_path)?;
        }
        let ino = if needs_inode { Some(self.next_inode()) } else { None };
        let now = self.now();

        let node = self.node_mut(child)?;
        if ino.is_some() {
            node.stat.ino = ino;
        }
        node.stat.dev = parent_dev;
        node.stat.nlink += 1;
        node.name = name.to_string();
        node.parent = Some(parent);
        let subdir = node.is_dir();

        let dir = self.node_mut(parent)?;
        if let Some(children) = dir.children_mut() {
            children.insert(name.to_string(), child);
        }
        if subdir && !windows {
            dir.stat.nlink += 1;
        }
        dir.stat.touch_modified(now);
        Ok(())
    }

    /// Removes the entry `name` (stored spelling) from `parent`. The node
    /// stays in the arena; callers reap or relink it.
    pub(crate) fn unlink_child(
        &mut self,
        parent: NodeId,
        name: &str,
        account: bool,
    ) -> FsResult<NodeId> {
        let child_path = self.syntax.join(&[&self.node_path(parent)?, name]);
        let child = self
            .node(parent)?
            .children()
            .and_then(|c| c.get(name).copied())
            .ok_or_else(|| FsError::not_found(&child_path))?;
        let node = self.node(child)?;
        let is_dir = node.is_dir();
        let last_link = is_dir || node.stat.nlink <= 1;
        let (usage, dev) = (if is_dir { 0 } else { node.stat.size }, node.stat.dev);
        if account && last_link && usage > 0 {
            self.mounts.change_usage(dev, -(usage as i64), &child_path)?;
        }
        let now = self.now();
        let windows = self.windows();

        let dir = self.node_mut(parent)?;
        if let Some(children) = dir.children_mut() {
            children.shift_remove(name);
        }
        if is_dir && !windows {
            dir.stat.nlink = dir.stat.nlink.saturating_sub(1);
        }
        dir.stat.touch_modified(now);

        let other_parent = if last_link { None } else { self.find_linking_dir(child) };
        let node = self.node_mut(child)?;
        node.stat.nlink = node.stat.nlink.saturating_sub(1);
        if account && !is_dir {
            node.stat.ctime_ns = now;
        }
        if last_link || node.parent == Some(parent) {
            node.parent = other_parent;
        }
        Ok(child)
    }

    fn find_linking_dir(&self, child: NodeId) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.children().is_some_and(|c| c.values().any(|id| *id == child)))
            .map(|n| n.id)
    }

    fn alloc_entry(&mut self, entry: &NewEntry, path: &str) -> FsResult<NodeId> {
        let (kind, size) = match &entry.kind {
            NewEntryKind::File(FileContent::Bytes(bytes)) => {
                (NodeKind::File { contents: Some(bytes.clone()), epoch: 0 }, None)
            }
            NewEntryKind::File(FileContent::DeclaredSize(size)) => {
                (NodeKind::File { contents: None, epoch: 0 }, Some(declared_size(*size, path)?))
            }
            NewEntryKind::Directory => (NodeKind::Directory { children: IndexMap::new() }, None),
            NewEntryKind::Symlink(target) => (NodeKind::Symlink { target: target.clone() }, None),
        };
        let id = self.alloc_node(&entry.name, kind, entry.perm_bits);
        if let Some(size) = size {
            self.node_mut(id)?.stat.size = size;
        }
        Ok(id)
    }

    /// Links a freshly allocated node, dropping it again on failure.
    fn attach_new(&mut self, parent: NodeId, name: &str, id: NodeId) -> FsResult<()> {
        if let Err(err) = self.link_child(parent, name, id, true) {
            self.nodes.remove(&id);
            return Err(err);
        }
        Ok(())
    }

    /// Adds a new entry to the directory at `parent_path`.
    pub fn add_entry(&mut self, parent_path: &str, entry: NewEntry) -> FsResult<NodeId> {
        let parent = self.resolve(parent_path, true)?;
        if !self.node(parent)?.is_dir() {
            return Err(self.not_a_directory_for_flavor(parent_path));
        }
        let path = self.syntax.join(&[&self.node_path(parent)?, &entry.name]);
        let id = self.alloc_entry(&entry, &path)?;
        self.attach_new(parent, &entry.name, id)?;
        debug!(path = %path, "added entry");
        Ok(id)
    }

    /// Windows refuses to unlink open entries; POSIX needs write and
    /// search permission on the holding directory.
    fn check_unlink(&self, parent: NodeId, child: NodeId, path: &str) -> FsResult<()> {
        if self.windows() {
            if self.open_files.references(child) {
                return Err(FsError::permission_denied(path));
            }
        } else if !self.is_root_identity() {
            let dir = self.node(parent)?;
            if !dir.stat.has_permission(PERM_WRITE | PERM_EXE, self.uid, self.gid) {
                return Err(FsError::permission_denied(path));
            }
        }
        Ok(())
    }

    fn check_removable(&self, parent: NodeId, child: NodeId, recursive: bool, path: &str) -> FsResult<()> {
        self.check_unlink(parent, child, path)?;
        let node = self.node(child)?;
        if self.windows() && node.stat.mode & PERM_WRITE == 0 {
            return Err(FsError::permission_denied(path));
        }
        if let Some(children) = node.children() {
            if !children.is_empty() && !recursive {
                return Err(FsError::DirectoryNotEmpty { path: path.to_string() });
            }
            for (name, id) in children {
                self.check_removable(child, *id, true, &self.syntax.join(&[path, name]))?;
            }
        }
        Ok(())
    }

    fn remove_subtree(&mut self, parent: NodeId, name: &str) -> FsResult<()> {
        let child = self
            .node(parent)?
            .children()
            .and_then(|c| c.get(name).copied())
            .ok_or_else(|| FsError::not_found(name))?;
        for grandchild in self.node(child)?.entry_names() {
            self.remove_subtree(child, &grandchild)?;
        }
        self.unlink_child(parent, name, true)?;
        self.reap_if_orphaned(child);
        Ok(())
    }

    /// Removes `name` from the directory at `parent_path`. Every check runs
    /// before the first entry is removed.
    pub fn remove_entry(&mut self, parent_path: &str, name: &str, recursive: bool) -> FsResult<()> {
        let parent = self.resolve(parent_path, true)?;
        let path = self.syntax.join(&[&self.node_path(parent)?, name]);
        let (stored, child) =
            self.child_entry(parent, name).ok_or_else(|| FsError::not_found(&path))?;
        self.check_removable(parent, child, recursive, &path)?;
        self.remove_subtree(parent, &stored)?;
        debug!(path = %path, recursive, "removed entry");
        Ok(())
    }

    /// Creates `path` and any missing ancestors. Ancestors get default
    /// permission bits, the final directory `perm_bits`.
    pub fn create_directory(&mut self, path: &str, perm_bits: u32) -> FsResult<NodeId> {
        self.check_path_arg(path)?;
        let abs = self.abs_path(path);
        self.auto_mount_drive(&abs)?;
        if self.lexists(&abs)? && self.mounts.find_exact(&self.syntax, &abs).is_none() {
            return Err(FsError::already_exists(&abs));
        }
        let mut current = self.root_id;
        let mut created = None;
        for component in self.syntax.components(&abs) {
            match self.child_entry(current, &component) {
                Some((_, id)) => {
                    let id = if self.node(id)?.is_symlink() {
                        let link_path = self.node_path(id)?;
                        self.resolve(&link_path, true)?
                    } else {
                        id
                    };
                    if !self.node(id)?.is_dir() {
                        return Err(FsError::not_a_directory(&abs));
                    }
                    current = id;
                }
                None => {
                    let kind = NodeKind::Directory { children: IndexMap::new() };
                    let id = self.alloc_node(&component, kind, PERM_DEF);
                    self.attach_new(current, &component, id)?;
                    created = Some(id);
                    current = id;
                }
            }
        }
        if let Some(id) = created {
            self.node_mut(id)?.stat.set_perm_bits(perm_bits);
            debug!(path = %abs, perm_bits = format!("{:o}", perm_bits), "created directory");
        }
        Ok(current)
    }

    /// Single-level mkdir: the parent must exist, the umask applies.
    pub fn make_dir(&mut self, path: &str, perm_bits: u32) -> FsResult<NodeId> {
        self.check_path_arg(path)?;
        let abs = self.abs_path(self.syntax.strip_trailing_separators(path));
        self.auto_mount_drive(&abs)?;
        let (parent, name) = self.syntax.split(&abs);
        if name.is_empty() {
            return Err(if self.windows() {
                FsError::permission_denied(&abs)
            } else {
                FsError::already_exists(&abs)
            });
        }
        let parent_id = match self.resolve(&parent, true) {
            Ok(id) => id,
            Err(FsError::NotFound { .. }) => return Err(FsError::not_found(&parent)),
            Err(err) => return Err(err),
        };
        if self.lexists(&abs)? {
            return Err(FsError::already_exists(&abs));
        }
        if !self.node(parent_id)?.is_dir() {
            return Err(FsError::not_a_directory(&parent));
        }
        let kind = NodeKind::Directory { children: IndexMap::new() };
        let id = self.alloc_node(&name, kind, perm_bits & !self.umask);
        self.attach_new(parent_id, &name, id)?;
        debug!(path = %abs, "made directory");
        Ok(id)
    }

    /// Recursive mkdir. With `exist_ok` an existing directory is accepted.
    pub fn make_dirs(&mut self, path: &str, perm_bits: u32, exist_ok: bool) -> FsResult<NodeId> {
        self.check_path_arg(path)?;
        let abs = self.abs_path(path);
        match self.create_directory(&abs, perm_bits & !self.umask) {
            Ok(id) => Ok(id),
            Err(err @ FsError::PermissionDenied { .. }) => Err(err),
            Err(_) if exist_ok && self.is_dir(&abs) => self.resolve(&abs, true),
            Err(FsError::NotADirectory { path }) if self.windows() => Err(FsError::NotFound { path }),
            Err(err) => Err(err),
        }
    }

    /// Device an entry created below `dir` lands on: that of the deepest
    /// existing ancestor after following symlinks.
    fn device_below(&self, dir: &str) -> FsResult<u64> {
        let mut current = self.resolve_path(dir, true)?;
        loop {
            if let Ok(id) = self.lookup_resolved(&current) {
                return Ok(self.node(id)?.stat.dev);
            }
            let (up, name) = self.syntax.split(&current);
            if name.is_empty() || up == current {
                return Ok(self.node(self.root_id)?.stat.dev);
            }
            current = up;
        }
    }

    fn create_leaf(
        &mut self,
        path: &str,
        kind: NodeKind,
        declared: Option<u64>,
        perm_bits: u32,
        create_missing_dirs: bool,
        apply_umask: bool,
    ) -> FsResult<NodeId> {
        self.check_path_arg(path)?;
        let abs = self.abs_path(path);
        if self.lexists(&abs)? {
            return Err(FsError::already_exists(&abs));
        }
        self.auto_mount_drive(&abs)?;
        let size = declared.unwrap_or(match &kind {
            NodeKind::File { contents: Some(bytes), .. } => bytes.len() as u64,
            NodeKind::Symlink { target } => target.len() as u64,
            _ => 0,
        });
        let (parent, name) = self.syntax.split(&abs);
        let device_id = self.device_below(&parent)?;
        self.mounts.check_change(device_id, size as i64, &abs)?;
        if !self.exists(&parent)? {
            if !create_missing_dirs {
                return Err(FsError::not_found(&parent));
            }
            self.create_directory(&parent, PERM_DEF)?;
        }
        let parent_id = self.resolve(&parent, true)?;
        if !self.node(parent_id)?.is_dir() {
            return Err(self.not_a_directory_for_flavor(&abs));
        }
        let perm_bits = if apply_umask { perm_bits & !self.umask } else { perm_bits };
        let id = self.alloc_node(&name, kind, perm_bits);
        if let Some(size) = declared {
            self.node_mut(id)?.stat.size = size;
        }
        self.attach_new(parent_id, &name, id)?;
        debug!(path = %abs, size, "created entry");
        Ok(id)
    }

    /// Creates a regular file; see [`NewFile`] for the options.
    pub fn create_file(&mut self, path: &str, file: NewFile) -> FsResult<NodeId> {
        let (kind, declared) = match file.content {
            FileContent::Bytes(bytes) => (NodeKind::File { contents: Some(bytes), epoch: 0 }, None),
            FileContent::DeclaredSize(size) => {
                (NodeKind::File { contents: None, epoch: 0 }, Some(declared_size(size, path)?))
            }
        };
        self.create_leaf(
            path,
            kind,
            declared,
            file.perm_bits,
            file.create_missing_dirs,
            file.apply_umask,
        )
    }

    pub fn create_symlink(&mut self, path: &str, target: &str) -> FsResult<NodeId> {
        self.check_path_arg(path)?;
        if target.contains('\0') {
            return Err(FsError::invalid(target, "embedded null byte"));
        }
        if self.syntax.ends_with_separator(path) {
            return Err(if self.exists(path)? {
                FsError::already_exists(path)
            } else if self.windows() {
                FsError::invalid(path, "trailing separator")
            } else {
                FsError::not_found(path)
            });
        }
        let link_path = if self.is_link(path) {
            self.abs_path(path)
        } else {
            self.resolve_path(path, true)?
        };
        let perm_bits = if self.windows() { PERM_DEF_FILE } else { PERM_DEF };
        let kind = NodeKind::Symlink { target: target.to_string() };
        self.create_leaf(&link_path, kind, None, perm_bits, true, self.macos())
    }

    /// Adds `new` as another name for the entry at `existing`.
    pub fn create_hardlink(&mut self, existing: &str, new: &str) -> FsResult<NodeId> {
        self.check_path_arg(existing)?;
        self.check_path_arg(new)?;
        let new_abs = self.abs_path(new);
        if self.lexists(&new_abs)? {
            return Err(FsError::already_exists(&new_abs));
        }
        let (new_parent, new_name) = self.syntax.split(&new_abs);
        if !self.exists(&new_parent)? {
            return Err(FsError::not_found(&new_parent));
        }
        if self.syntax.ends_with_separator(existing) {
            return Err(if self.windows() {
                FsError::invalid(existing, "trailing separator")
            } else {
                FsError::not_a_directory(existing)
            });
        }
        let node = self.resolve(existing, true).map_err(|_| FsError::not_found(existing))?;
        if self.node(node)?.is_dir() {
            return Err(FsError::permission_denied(existing));
        }
        let parent_id = self.resolve(&new_parent, true)?;
        if !self.node(parent_id)?.is_dir() {
            return Err(self.not_a_directory_for_flavor(&new_parent));
        }
        if self.node(parent_id)?.stat.dev != self.node(node)?.stat.dev {
            return Err(FsError::CrossDevice { path: new_abs });
        }
        self.link_child(parent_id, &new_name, node, true)?;
        let now = self.now();
        self.node_mut(node)?.stat.ctime_ns = now;
        debug!(existing, new = %new_abs, "created hard link");
        Ok(node)
    }

    fn is_within(&self, candidate: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(candidate);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    /// Moves `old` to `new`, keeping the entry's stat record.
    ///
    /// `force_replace` lets the Windows flavor replace an existing file
    /// (the host's `replace` as opposed to `rename`).
    pub fn rename(&mut self, old: &str, new: &str, force_replace: bool) -> FsResult<()> {
        self.check_path_arg(old)?;
        self.check_path_arg(new)?;
        let windows = self.windows();
        let ends_with_sep = self.syntax.ends_with_separator(old);
        let old_abs = self.abs_path(old);
        let new_abs = self.abs_path(new);
        if !self.lexists(&old_abs)? {
            return Err(FsError::not_found(&old_abs));
        }
        let old_id = self.resolve(&old_abs, false)?;
        let old_is_dir = self.node(old_id)?.is_dir();
        let old_is_link = self.node(old_id)?.is_symlink();
        if ends_with_sep && !old_is_dir && !self.is_dir(old) {
            return Err(if windows {
                FsError::invalid(old, "trailing separator")
            } else {
                FsError::not_a_directory(old)
            });
        }
        if !windows {
            if old_is_dir && self.is_link(&new_abs) {
                return Err(FsError::not_a_directory(&new_abs));
            }
            let new_is_real_dir =
                self.get_entry_no_follow(&new_abs).is_ok_and(|n| n.is_dir());
            if new_is_real_dir && old_is_link && !(ends_with_sep && self.macos()) {
                return Err(if ends_with_sep {
                    FsError::not_a_directory(&new_abs)
                } else {
                    FsError::is_a_directory(&new_abs)
                });
            }
        }

        let mut replace_existing = false;
        if self.lexists(&new_abs)? {
            let new_id = self.resolve(&new_abs, false)?;
            if old_abs == new_abs {
                return Ok(());
            }
            if new_id == old_id {
                // a case-only rename on a case-insensitive filesystem moves
                // the entry; hard links to the same node are left alone
                if self.syntax.case_sensitive || !self.syntax.names_equal(&old_abs, &new_abs) {
                    return Ok(());
                }
            } else {
                let target = self.node(new_id)?;
                if target.is_dir() || target.is_symlink() {
                    if windows {
                        return Err(if force_replace {
                            FsError::permission_denied(&new_abs)
                        } else {
                            FsError::already_exists(&new_abs)
                        });
                    }
                    if target.is_dir() {
                        let non_empty = target.children().is_some_and(|c| !c.is_empty());
                        return Err(if non_empty {
                            FsError::DirectoryNotEmpty { path: new_abs }
                        } else if !old_is_dir && !old_is_link {
                            FsError::is_a_directory(&new_abs)
                        } else {
                            FsError::already_exists(&new_abs)
                        });
                    }
                } else if old_is_dir {
                    return Err(if windows {
                        FsError::already_exists(&new_abs)
                    } else {
                        FsError::not_a_directory(&new_abs)
                    });
                } else if windows && !force_replace {
                    return Err(FsError::already_exists(&new_abs));
                }
                replace_existing = true;
            }
        }

        let (old_parent, old_name) = self.syntax.split(&old_abs);
        let (new_parent, new_name) = self.syntax.split(&new_abs);
        if !self.exists(&new_parent)? {
            return Err(FsError::not_found(&new_parent));
        }
        let old_dir = self.resolve(&old_parent, true)?;
        let new_dir = self.resolve(&new_parent, true)?;
        if !self.node(new_dir)?.is_dir() {
            return Err(if windows {
                FsError::permission_denied(&new_parent)
            } else {
                FsError::not_a_directory(&new_parent)
            });
        }
        if self.node(new_dir)?.stat.dev != self.node(old_id)?.stat.dev {
            return Err(FsError::CrossDevice { path: old_abs });
        }
        if old_is_dir && self.is_within(new_dir, old_id) {
            return Err(FsError::invalid(&new_abs, "cannot move a directory into itself"));
        }
        let old_stored =
            self.case_fold(old_dir, &old_name).ok_or_else(|| FsError::not_found(&old_abs))?;
        self.check_unlink(old_dir, old_id, &old_abs)?;
        let replaced = if replace_existing { self.child_entry(new_dir, &new_name) } else { None };
        if let Some((_, existing)) = &replaced {
            self.check_removable(new_dir, *existing, false, &new_abs)?;
        }

        let moving = self.unlink_child(old_dir, &old_stored, false)?;
        if let Some((stored, _)) = replaced {
            if let Err(err) = self.remove_subtree(new_dir, &stored) {
                self.link_child(old_dir, &old_stored, moving, false)?;
                return Err(err);
            }
        }
        if let Err(err) = self.link_child(new_dir, &new_name, moving, false) {
            self.link_child(old_dir, &old_stored, moving, false)?;
            return Err(err);
        }
        debug!(old = %old_abs, new = %new_abs, "renamed entry");
        Ok(())
    }

    /// Removes a file or symlink.
    pub fn remove(&mut self, path: &str) -> FsResult<()> {
        self.check_path_arg(path)?;
        let abs = self.abs_path(path);
        let ends_with_sep = self.syntax.ends_with_separator(path);
        if self.exists(&abs)? && self.is_dir(&abs) {
            let link_is_dir = self.get_entry_no_follow(&abs).is_ok_and(|n| !n.is_symlink());
            if link_is_dir || ends_with_sep {
                return Err(if self.windows() || self.macos() {
                    FsError::permission_denied(&abs)
                } else if ends_with_sep && !link_is_dir {
                    FsError::not_a_directory(path)
                } else {
                    FsError::is_a_directory(&abs)
                });
            }
        } else if ends_with_sep {
            return Err(if self.windows() {
                FsError::invalid(path, "trailing separator")
            } else if self.lexists(&abs)? {
                FsError::not_a_directory(path)
            } else {
                FsError::not_found(path)
            });
        }
        self.remove_object(&abs)
    }

    /// Removes an empty directory.
    pub fn rmdir(&mut self, path: &str) -> FsResult<()> {
        self.check_path_arg(path)?;
        if path == "." {
            return Err(if self.windows() {
                FsError::permission_denied(path)
            } else {
                FsError::invalid(path, "cannot remove the current directory")
            });
        }
        let abs = self.abs_path(path);
        if self.syntax.split(&abs).1.is_empty() {
            return Err(FsError::Busy { path: abs });
        }
        let target = self.resolve(&abs, true)?;
        if !self.node(target)?.is_dir() {
            return Err(FsError::not_a_directory(&abs));
        }
        if !self.windows() && self.is_link(&abs) {
            return Err(FsError::not_a_directory(&abs));
        }
        if self.node(target)?.children().is_some_and(|c| !c.is_empty()) {
            return Err(FsError::DirectoryNotEmpty { path: abs });
        }
        self.remove_object(&abs)
    }

    /// Removes whatever `path` names, recursively for directories.
    pub fn remove_object(&mut self, path: &str) -> FsResult<()> {
        self.check_path_arg(path)?;
        let abs = self.abs_path(path);
        let (parent, name) = self.syntax.split(&abs);
        if name.is_empty() || (self.syntax.drive_support && self.components_are_drive(&abs)) {
            return Err(FsError::Busy { path: abs });
        }
        let parent_id = self.resolve(&parent, true)?;
        if !self.node(parent_id)?.is_dir() {
            return Err(self.not_a_directory_for_flavor(&parent));
        }
        self.remove_entry(&parent, &name, true)
    }

    fn components_are_drive(&self, abs: &str) -> bool {
        self.syntax.components(abs).len() == 1 && !self.syntax.split_drive(abs).0.is_empty()
    }

    /// Resizes a regular file, truncating or padding with NUL bytes.
    pub fn set_size(&mut self, path: &str, size: i64) -> FsResult<()> {
        let size = declared_size(size, path)?;
        let id = self.resolve(path, true)?;
        if self.node(id)?.is_dir() {
            return Err(FsError::is_a_directory(path));
        }
        self.apply_size(id, size, path)
    }

    pub(crate) fn apply_size(&mut self, id: NodeId, size: u64, path: &str) -> FsResult<()> {
        let node = self.node(id)?;
        let (delta, dev, linked) = (size as i64 - node.stat.size as i64, node.stat.dev, node.stat.nlink > 0);
        if linked {
            self.mounts.change_usage(dev, delta, path)?;
        }
        let node = self.node_mut(id)?;
        if node.is_large_file() {
            node.declare_size(size);
        } else {
            node.resize_contents(size);
        }
        Ok(())
    }

    /// Replaces the contents of a regular file. Returns whether the bytes
    /// changed.
    pub fn set_contents(&mut self, path: &str, contents: impl Into<Vec<u8>>) -> FsResult<bool> {
        let id = self.resolve(path, true)?;
        if !self.node(id)?.is_file() {
            return Err(FsError::is_a_directory(path));
        }
        self.store_contents(id, contents.into(), path)
    }

    pub(crate) fn store_contents(&mut self, id: NodeId, contents: Vec<u8>, path: &str) -> FsResult<bool> {
        let node = self.node(id)?;
        if node.contents() == Some(contents.as_slice()) {
            return Ok(false);
        }
        let (delta, dev, linked) =
            (contents.len() as i64 - node.stat.size as i64, node.stat.dev, node.stat.nlink > 0);
        if linked {
            self.mounts.change_usage(dev, delta, path)?;
        }
        Ok(self.node_mut(id)?.replace_contents(contents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FsConfig, OsFlavor};
    use crate::error::FsErrorKind;

    fn posix() -> FsCore {
        FsCore::new(FsConfig::default()).expect("Failed to create filesystem")
    }

    fn windows() -> FsCore {
        FsCore::new(FsConfig::for_flavor(OsFlavor::Windows)).expect("Failed to create filesystem")
    }

    fn nlink(fs: &FsCore, path: &str) -> u64 {
        fs.get_entry_no_follow(path).expect("entry exists").stat().nlink
    }

    fn root_used(fs: &FsCore) -> u64 {
        fs.mount_points().first().map(|m| m.used_size).expect("root mount")
    }

    #[test]
    fn test_create_directory_assigns_leaf_bits_only() {
        let mut fs = posix();
        fs.create_directory("/a/b/c", 0o700).expect("create_directory");
        assert_eq!(fs.get_entry("/a").expect("a").stat().perm_bits(), PERM_DEF);
        assert_eq!(fs.get_entry("/a/b/c").expect("c").stat().perm_bits(), 0o700);
        let err = fs.create_directory("/a/b", 0o777).expect_err("exists");
        assert_eq!(err.kind(), FsErrorKind::AlreadyExists);
    }

    #[test]
    fn test_inodes_assigned_on_insertion_and_unique() {
        let mut fs = posix();
        let a = fs.create_file("/a", NewFile::default()).expect("a");
        let b = fs.create_file("/b", NewFile::default()).expect("b");
        let ino_a = fs.node(a).expect("a").stat().ino;
        let ino_b = fs.node(b).expect("b").stat().ino;
        assert!(ino_a.is_some() && ino_b.is_some());
        assert_ne!(ino_a, ino_b);
    }

    #[test]
    fn test_posix_directory_link_counts() {
        let mut fs = posix();
        fs.create_directory("/d", 0o777).expect("mkdir");
        assert_eq!(nlink(&fs, "/d"), 2);
        fs.create_directory("/d/s1", 0o777).expect("mkdir");
        fs.create_directory("/d/s2", 0o777).expect("mkdir");
        fs.create_file("/d/f", NewFile::default()).expect("file");
        assert_eq!(nlink(&fs, "/d"), 4);
        assert_eq!(nlink(&fs, "/"), 3);
        fs.rmdir("/d/s1").expect("rmdir");
        assert_eq!(nlink(&fs, "/d"), 3);
    }

    #[test]
    fn test_windows_directory_link_count_is_one() {
        let mut fs = windows();
        fs.create_directory("C:\\d\\s", 0o777).expect("mkdir");
        assert_eq!(nlink(&fs, "C:\\d"), 1);
        assert_eq!(nlink(&fs, "C:\\d\\s"), 1);
    }

    #[test]
    fn test_hardlink_shares_node() {
        let mut fs = posix();
        fs.create_file("/orig", NewFile::with_contents(b"data".to_vec())).expect("file");
        fs.create_hardlink("/orig", "/alias").expect("link");
        assert_eq!(nlink(&fs, "/orig"), 2);
        assert_eq!(fs.resolve("/orig", true).ok(), fs.resolve("/alias", true).ok());
        assert_eq!(root_used(&fs), 4);
        fs.remove("/orig").expect("remove");
        assert_eq!(nlink(&fs, "/alias"), 1);
        assert_eq!(root_used(&fs), 4);
        fs.remove("/alias").expect("remove last link");
        assert_eq!(root_used(&fs), 0);
        assert_eq!(fs.node_path(fs.resolve("/alias", true).expect("alias")).expect("path"), "/alias");
    }

    #[test]
    fn test_hardlink_errors() {
        let mut fs = posix();
        fs.create_directory("/dir", 0o777).expect("mkdir");
        fs.create_file("/f", NewFile::default()).expect("file");
        assert_eq!(fs.create_hardlink("/dir", "/d2").expect_err("dir").kind(), FsErrorKind::PermissionDenied);
        assert_eq!(fs.create_hardlink("/f", "/dir").expect_err("exists").kind(), FsErrorKind::AlreadyExists);
        assert_eq!(fs.create_hardlink("/f", "/none/x").expect_err("parent").kind(), FsErrorKind::NotFound);
        assert_eq!(fs.create_hardlink("/missing", "/x").expect_err("source").kind(), FsErrorKind::NotFound);
    }

    #[test]
    fn test_remove_entry_recursive_validates_first() {
        let mut fs = posix();
        fs.create_file("/top/keep/a", NewFile::default()).expect("a");
        fs.create_file("/top/locked/b", NewFile::default()).expect("b");
        fs.chmod("/top/locked", 0o500, true).expect("chmod");
        let err = fs.remove_entry("/", "top", true).expect_err("locked subdir");
        assert_eq!(err.kind(), FsErrorKind::PermissionDenied);
        assert!(fs.exists("/top/keep/a").expect("exists"), "nothing removed on failure");
    }

    #[test]
    fn test_remove_entry_non_recursive_on_full_directory() {
        let mut fs = posix();
        fs.create_file("/d/x", NewFile::default()).expect("file");
        let err = fs.remove_entry("/", "d", false).expect_err("non-empty");
        assert_eq!(err.kind(), FsErrorKind::DirectoryNotEmpty);
        fs.remove_entry("/", "d", true).expect("recursive removal");
        assert!(!fs.exists("/d").expect("exists"));
    }

    #[test]
    fn test_add_entry_under_directory() {
        let mut fs = posix();
        fs.create_directory("/d", 0o777).expect("mkdir");
        fs.add_entry("/d", NewEntry::file("f", FileContent::Bytes(b"12".to_vec()))).expect("add");
        fs.add_entry("/d", NewEntry::symlink("l", "f")).expect("add link");
        let err = fs.add_entry("/d", NewEntry::directory("f")).expect_err("duplicate");
        assert_eq!(err.kind(), FsErrorKind::AlreadyExists);
        assert_eq!(fs.listdir("/d").expect("list"), vec!["f", "l"]);
        fs.create_file("/plain", NewFile::default()).expect("file");
        let err = fs.add_entry("/plain", NewEntry::directory("x")).expect_err("not a dir");
        assert_eq!(err.kind(), FsErrorKind::NotADirectory);
    }

    #[test]
    fn test_create_file_options() {
        let mut fs = posix();
        let err = fs
            .create_file("/missing/f", NewFile::default().missing_dirs(false))
            .expect_err("parent missing");
        assert_eq!(err.kind(), FsErrorKind::NotFound);
        fs.create_file("/masked", NewFile::default().perm(0o666).umask(true)).expect("file");
        assert_eq!(fs.get_entry("/masked").expect("entry").stat().perm_bits(), 0o644);
        let err = fs.create_file("/neg", NewFile::with_size(-1)).expect_err("negative");
        assert_eq!(err.kind(), FsErrorKind::InvalidArgument);
        let big = fs.create_file("/big", NewFile::with_size(1 << 33)).expect("declared size");
        assert!(fs.node(big).expect("node").is_large_file());
    }

    #[test]
    fn test_create_file_over_capacity_leaves_tree_untouched() {
        let mut fs = FsCore::new(FsConfig::default().with_total_size(10)).expect("fs");
        let err = fs
            .create_file("/new/dir/f", NewFile::with_contents(vec![b'x'; 11]))
            .expect_err("too big");
        assert_eq!(err.kind(), FsErrorKind::NoSpace);
        assert!(!fs.exists("/new").expect("exists"));
    }

    #[test]
    fn test_symlink_with_trailing_separator() {
        let mut fs = posix();
        fs.create_directory("/d", 0o777).expect("mkdir");
        assert_eq!(fs.create_symlink("/d/", "/x").expect_err("exists").kind(), FsErrorKind::AlreadyExists);
        assert_eq!(fs.create_symlink("/nope/", "/x").expect_err("missing").kind(), FsErrorKind::NotFound);
    }

    #[test]
    fn test_make_dir_requires_parent_and_applies_umask() {
        let mut fs = posix();
        assert_eq!(fs.make_dir("/a/b", 0o777).expect_err("no parent").kind(), FsErrorKind::NotFound);
        fs.make_dir("/a", 0o777).expect("mkdir");
        assert_eq!(fs.get_entry("/a").expect("a").stat().perm_bits(), 0o755);
        assert_eq!(fs.make_dir("/a/", 0o777).expect_err("exists").kind(), FsErrorKind::AlreadyExists);
    }

    #[test]
    fn test_make_dirs_exist_ok() {
        let mut fs = posix();
        fs.make_dirs("/x/y/z", 0o777, false).expect("makedirs");
        fs.make_dirs("/x/y/z", 0o777, true).expect("exist_ok");
        assert_eq!(fs.make_dirs("/x/y", 0o777, false).expect_err("exists").kind(), FsErrorKind::AlreadyExists);
        fs.create_file("/x/file", NewFile::default()).expect("file");
        assert_eq!(fs.make_dirs("/x/file", 0o777, true).expect_err("file").kind(), FsErrorKind::AlreadyExists);

        let mut win = windows();
        win.create_file("C:\\f", NewFile::default()).expect("file");
        assert_eq!(win.make_dirs("C:\\f\\sub", 0o777, true).expect_err("file parent").kind(), FsErrorKind::NotFound);
    }

    #[test]
    fn test_rename_preserves_stat_and_moves_subtree() {
        let mut fs = posix();
        fs.create_file("/src/inner/f", NewFile::with_contents(b"abc".to_vec())).expect("file");
        let fixed = crate::fs::TimeSpec::Nanos { atime_ns: 1_000_000_000, mtime_ns: 2_000_000_000 };
        fs.utime("/src/inner/f", fixed, true).expect("utime");
        let before = fs.stat("/src/inner/f", true).expect("stat");
        fs.create_directory("/dst", 0o777).expect("mkdir");
        fs.rename("/src", "/dst/moved", false).expect("rename");
        assert!(!fs.exists("/src").expect("exists"));
        let after = fs.stat("/dst/moved/inner/f", true).expect("stat");
        assert_eq!(before.st_mtime_ns, after.st_mtime_ns);
        assert_eq!(before.st_ino, after.st_ino);
        assert_eq!(nlink(&fs, "/dst"), 3);
    }

    #[test]
    fn test_rename_into_own_subtree_fails() {
        let mut fs = posix();
        fs.create_directory("/a/b", 0o777).expect("mkdir");
        let err = fs.rename("/a", "/a/b/c", false).expect_err("into itself");
        assert_eq!(err.kind(), FsErrorKind::InvalidArgument);
    }

    #[test]
    fn test_rename_over_file() {
        let mut fs = posix();
        fs.create_file("/a", NewFile::with_contents(b"aaaa".to_vec())).expect("a");
        fs.create_file("/b", NewFile::with_contents(b"bb".to_vec())).expect("b");
        fs.rename("/a", "/b", false).expect("posix replaces");
        assert_eq!(fs.get_entry("/b").expect("b").contents(), Some(&b"aaaa"[..]));
        assert_eq!(root_used(&fs), 4);

        let mut win = windows();
        win.create_file("C:\\a", NewFile::default()).expect("a");
        win.create_file("C:\\b", NewFile::default()).expect("b");
        assert_eq!(win.rename("C:\\a", "C:\\b", false).expect_err("no force").kind(), FsErrorKind::AlreadyExists);
        win.rename("C:\\a", "C:\\b", true).expect("replace");
        assert!(!win.exists("C:\\a").expect("exists"));
    }

    #[test]
    fn test_rename_case_only_on_insensitive_fs() {
        let mut fs = windows();
        fs.create_file("C:\\Foo", NewFile::default()).expect("file");
        fs.rename("C:\\Foo", "C:\\FOO", false).expect("case change");
        assert_eq!(fs.listdir("C:\\").expect("list"), vec!["FOO"]);
    }

    #[test]
    fn test_rename_hardlink_onto_itself_is_noop() {
        let mut fs = posix();
        fs.create_file("/a", NewFile::default()).expect("a");
        fs.create_hardlink("/a", "/b").expect("link");
        fs.rename("/a", "/b", false).expect("no-op");
        assert!(fs.exists("/a").expect("exists") && fs.exists("/b").expect("exists"));
    }

    #[test]
    fn test_rename_across_mounts_fails() {
        let mut fs = posix();
        fs.add_mount_point("/mnt", Some(100), false).expect("mount");
        fs.create_file("/f", NewFile::default()).expect("file");
        let err = fs.rename("/f", "/mnt/f", false).expect_err("cross device");
        assert_eq!(err.kind(), FsErrorKind::CrossDevice);
    }

    #[test]
    fn test_remove_flavor_errors() {
        let mut fs = posix();
        fs.create_directory("/d", 0o777).expect("mkdir");
        assert_eq!(fs.remove("/d").expect_err("dir").kind(), FsErrorKind::IsADirectory);
        assert_eq!(fs.remove("/none").expect_err("missing").kind(), FsErrorKind::NotFound);
        let mut win = windows();
        win.create_directory("C:\\d", 0o777).expect("mkdir");
        assert_eq!(win.remove("C:\\d").expect_err("dir").kind(), FsErrorKind::PermissionDenied);
    }

    #[test]
    fn test_remove_symlink_to_directory_removes_link() {
        let mut fs = posix();
        fs.create_directory("/d", 0o777).expect("mkdir");
        fs.create_symlink("/l", "/d").expect("link");
        fs.remove("/l").expect("remove link");
        assert!(fs.exists("/d").expect("exists"));
        assert!(!fs.lexists("/l").expect("lexists"));
    }

    #[test]
    fn test_rmdir_cases() {
        let mut fs = posix();
        fs.create_file("/d/f", NewFile::default()).expect("file");
        assert_eq!(fs.rmdir("/d").expect_err("non-empty").kind(), FsErrorKind::DirectoryNotEmpty);
        assert_eq!(fs.rmdir("/d/f").expect_err("file").kind(), FsErrorKind::NotADirectory);
        assert_eq!(fs.rmdir("/").expect_err("root").kind(), FsErrorKind::Busy);
        fs.remove("/d/f").expect("remove");
        fs.rmdir("/d").expect("rmdir");
    }

    #[test]
    fn test_set_size_boundaries() {
        let mut fs = FsCore::new(FsConfig::default().with_total_size(20)).expect("fs");
        fs.create_file("/f", NewFile::with_contents(b"dummy_file".to_vec())).expect("file");
        assert_eq!(fs.set_size("/f", -1).expect_err("negative").kind(), FsErrorKind::InvalidArgument);
        assert_eq!(fs.set_size("/f", 21).expect_err("too big").kind(), FsErrorKind::NoSpace);
        fs.set_size("/f", 13).expect("grow");
        assert_eq!(fs.get_entry("/f").expect("f").contents(), Some(&b"dummy_file\0\0\0"[..]));
        assert_eq!(fs.get_disk_usage(None).expect("usage").used, 13);
        fs.set_size("/f", 0).expect("shrink");
        assert_eq!(fs.get_disk_usage(None).expect("usage").used, 0);
    }
}
