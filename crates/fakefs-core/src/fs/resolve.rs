// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path resolution against the tree: case folding, symlink substitution
//! and node lookup.

use std::collections::VecDeque;

use super::FsCore;
use crate::error::{FsError, FsResult};
use crate::node::{Node, NodeId};
use crate::stat::PERM_EXE;

/// Indirections followed before resolution gives up with `TooManyLinks`.
pub const MAX_SYMLINK_DEPTH: usize = 20;

impl FsCore {
    pub(crate) fn check_path_arg(&self, path: &str) -> FsResult<()> {
        if path.contains('\0') {
            return Err(FsError::invalid(path, "embedded null byte"));
        }
        if path.is_empty() {
            return Err(FsError::not_found(path));
        }
        Ok(())
    }

    /// Child of `dir` matching `name` under the configured case rules,
    /// returned with its stored spelling.
    pub(crate) fn child_entry(&self, dir: NodeId, name: &str) -> Option<(String, NodeId)> {
        let children = self.nodes.get(&dir)?.children()?;
        if let Some(id) = children.get(name) {
            return Some((name.to_string(), *id));
        }
        if self.syntax.case_sensitive {
            return None;
        }
        let wanted = name.to_lowercase();
        children
            .iter()
            .find(|(stored, _)| stored.to_lowercase() == wanted)
            .map(|(stored, id)| (stored.clone(), *id))
    }

    /// Stored spelling of `name` inside `dir`, if such an entry exists.
    pub fn case_fold(&self, dir: NodeId, name: &str) -> Option<String> {
        self.child_entry(dir, name).map(|(stored, _)| stored)
    }

    pub(crate) fn may_traverse(&self, dir: &Node) -> bool {
        self.is_root_identity()
            || self.windows()
            || dir.stat.has_permission(PERM_EXE, self.uid, self.gid)
    }

    /// Canonical absolute path of `path`.
    ///
    /// Every symlink along the way is substituted; the final one only when
    /// `follow_final` is set. Components that do not exist (or sit below a
    /// non-directory) are appended verbatim, so the result may name a
    /// missing entry.
    pub fn resolve_path(&self, path: &str, follow_final: bool) -> FsResult<String> {
        self.check_path_arg(path)?;
        let abs = self.abs_path(path);
        if !follow_final {
            let (parent, name) = self.syntax.split(&abs);
            if name.is_empty() {
                return self.resolve_path(&abs, true);
            }
            let parent = self.resolve_path(&parent, true)?;
            let name = self
                .lookup_resolved(&parent)
                .ok()
                .and_then(|dir| self.case_fold(dir, &name))
                .unwrap_or(name);
            return Ok(self.syntax.join(&[&parent, &name]));
        }
        let resolved = self.resolve_components(self.syntax.components(&abs).into())?;
        Ok(self.syntax.components_to_path(&resolved))
    }

    fn resolve_components(&self, mut pending: VecDeque<String>) -> FsResult<Vec<String>> {
        let mut resolved: Vec<String> = Vec::new();
        let mut current = Some(self.root_id);
        let mut depth = 0;
        while let Some(component) = pending.pop_front() {
            let Some((stored, id)) = current.and_then(|dir| self.child_entry(dir, &component))
            else {
                resolved.push(component);
                resolved.extend(pending.drain(..));
                break;
            };
            resolved.push(stored);
            let node = self.node(id)?;
            match node.symlink_target() {
                Some(target) => {
                    if depth >= MAX_SYMLINK_DEPTH {
                        return Err(FsError::TooManyLinks {
                            path: self.syntax.components_to_path(&resolved),
                        });
                    }
                    depth += 1;
                    let link_path = self.follow_link(&resolved, target);
                    let mut next: VecDeque<String> = self.syntax.components(&link_path).into();
                    next.extend(pending.drain(..));
                    pending = next;
                    resolved.clear();
                    current = Some(self.root_id);
                }
                None => current = node.is_dir().then_some(id),
            }
        }
        Ok(resolved)
    }

    /// Absolute path a link points to; relative targets are taken from the
    /// directory holding the link.
    fn follow_link(&self, link_components: &[String], target: &str) -> String {
        let target = if self.windows() {
            target.strip_prefix("\\\\?\\").unwrap_or(target)
        } else {
            target
        };
        let holder = &link_components[..link_components.len().saturating_sub(1)];
        let holder = self.syntax.components_to_path(holder);
        self.syntax.absolutize(target, &holder)
    }

    /// Node at an already resolved path.
    pub(crate) fn lookup_resolved(&self, path: &str) -> FsResult<NodeId> {
        let mut current = self.root_id;
        for component in self.syntax.components(path) {
            let dir = self.node(current)?;
            if !dir.is_dir() {
                return Err(if self.windows() {
                    FsError::not_found(path)
                } else {
                    FsError::not_a_directory(path)
                });
            }
            if !self.may_traverse(dir) {
                return Err(FsError::permission_denied(path));
            }
            current = self
                .child_entry(current, &component)
                .map(|(_, id)| id)
                .ok_or_else(|| FsError::not_found(path))?;
        }
        Ok(current)
    }

    /// Node named by `path`, following a final symlink if `follow` is set.
    pub fn resolve(&self, path: &str, follow: bool) -> FsResult<NodeId> {
        self.check_path_arg(path)?;
        if follow {
            let resolved = self.resolve_path(path, true)?;
            return self.lookup_resolved(&resolved);
        }
        let abs = self.abs_path(path);
        let (parent, name) = self.syntax.split(&abs);
        if name.is_empty() {
            return self.resolve(&abs, true);
        }
        let parent_id = self.resolve(&parent, true)?;
        let dir = self.node(parent_id)?;
        if !dir.is_dir() {
            return Err(if self.windows() {
                FsError::not_found(&abs)
            } else {
                FsError::not_a_directory(&abs)
            });
        }
        if !self.may_traverse(dir) {
            return Err(FsError::permission_denied(&abs));
        }
        self.child_entry(parent_id, &name)
            .map(|(_, id)| id)
            .ok_or_else(|| FsError::not_found(&abs))
    }

    pub fn get_entry(&self, path: &str) -> FsResult<&Node> {
        let id = self.resolve(path, true)?;
        self.node(id)
    }

    pub fn get_entry_no_follow(&self, path: &str) -> FsResult<&Node> {
        let id = self.resolve(path, false)?;
        self.node(id)
    }

    /// Whether `path` names an entry, following symlinks. A file named
    /// with a trailing separator does not exist; a NUL byte is an error.
    pub fn exists(&self, path: &str) -> FsResult<bool> {
        if path.contains('\0') {
            return Err(FsError::invalid(path, "embedded null byte"));
        }
        if path.is_empty() {
            return Ok(false);
        }
        match self.resolve(path, true) {
            Ok(id) if self.syntax.ends_with_separator(path) => Ok(self.node(id)?.is_dir()),
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Like [`exists`](Self::exists) but true for dangling symlinks too.
    pub fn lexists(&self, path: &str) -> FsResult<bool> {
        Ok(self.exists(path)? || self.is_link(path))
    }

    pub fn is_link(&self, path: &str) -> bool {
        if path.is_empty() || path.contains('\0') {
            return false;
        }
        self.resolve(path, false)
            .and_then(|id| self.node(id))
            .is_ok_and(Node::is_symlink)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.get_entry(path).is_ok_and(Node::is_dir)
    }

    pub fn is_file(&self, path: &str) -> bool {
        !self.syntax.ends_with_separator(path) && self.get_entry(path).is_ok_and(Node::is_file)
    }
}
