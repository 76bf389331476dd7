// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The filesystem engine: the node arena, mounts, working directory and
//! open-file table of one emulated filesystem.

mod disk;
mod listing;
mod meta;
mod resolve;
mod tree;

pub use listing::{ScanEntry, WalkEntry, WalkErrorHandler, WalkOptions};
pub use meta::{AccessMode, TimeSpec, XattrFlags};
pub use tree::{FileContent, NewEntry, NewEntryKind, NewFile};

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::clock::{Clock, SystemClock};
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::handle::OpenFileTable;
use crate::mount::MountTable;
use crate::node::{Node, NodeId, NodeKind};
use crate::path::PathSyntax;
use crate::stat::{FileType, StatRecord, PERM_DEF};

/// In-memory filesystem
pub struct FsCore {
    pub(crate) config: FsConfig,
    pub(crate) syntax: PathSyntax,
    clock: Box<dyn Clock>,
    pub(crate) nodes: HashMap<NodeId, Node>,
    pub(crate) root_id: NodeId,
    next_node_id: u64,
    last_ino: u64,
    pub(crate) mounts: MountTable,
    pub(crate) open_files: OpenFileTable,
    pub(crate) cwd: String,
    pub(crate) umask: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) stat_float_times: bool,
}

impl std::fmt::Debug for FsCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsCore")
            .field("os_flavor", &self.config.os_flavor)
            .field("nodes", &self.nodes.len())
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

impl FsCore {
    pub fn new(config: FsConfig) -> FsResult<Self> {
        Self::with_clock(config, Box::new(SystemClock))
    }

    pub fn with_clock(config: FsConfig, clock: Box<dyn Clock>) -> FsResult<Self> {
        config.validate()?;
        let syntax = PathSyntax::from_config(&config);
        let windows = config.os_flavor.is_windows();
        let root_id = NodeId(1);
        let mut root_stat = StatRecord::new(
            FileType::Directory,
            PERM_DEF,
            config.security.uid,
            config.security.gid,
            clock.now_ns(),
        );
        root_stat.ino = Some(1);
        root_stat.nlink = if windows { 1 } else { 2 };
        let root = Node::new(
            root_id,
            &syntax.sep_str(),
            NodeKind::Directory { children: IndexMap::new() },
            root_stat,
        );
        let cwd = if syntax.drive_support {
            format!("C:{}", syntax.separator)
        } else {
            syntax.sep_str()
        };
        let root_mount = if syntax.drive_support { "C:".to_string() } else { syntax.sep_str() };

        let mut fs = Self {
            umask: config.umask,
            uid: config.security.uid,
            gid: config.security.gid,
            stat_float_times: config.stat_float_times,
            nodes: HashMap::from([(root_id, root)]),
            root_id,
            next_node_id: 2,
            last_ino: 1,
            mounts: MountTable::new(),
            open_files: OpenFileTable::new(),
            cwd,
            syntax,
            clock,
            config,
        };
        let total_size = fs.config.total_size;
        let device_id = fs.add_mount_point(&root_mount, total_size, false)?.device_id;
        // the drive-less root shares the first device
        let root = fs.node_mut(root_id)?;
        if root.stat.dev == 0 {
            root.stat.dev = device_id;
        }
        Ok(fs)
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn syntax(&self) -> &PathSyntax {
        &self.syntax
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub(crate) fn windows(&self) -> bool {
        self.config.os_flavor.is_windows()
    }

    pub(crate) fn macos(&self) -> bool {
        self.config.os_flavor.is_macos()
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.now_ns()
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Switch the identity used for permission checks and ownership.
    pub fn set_uid(&mut self, uid: u32) {
        self.uid = uid;
    }

    pub fn set_gid(&mut self, gid: u32) {
        self.gid = gid;
    }

    pub(crate) fn is_root_identity(&self) -> bool {
        self.uid == 0
    }

    pub fn stat_float_times(&self) -> bool {
        self.stat_float_times
    }

    /// Choose whether stat times read as fractional or whole seconds.
    /// Stored nanoseconds are unaffected either way.
    pub fn set_stat_float_times(&mut self, enabled: bool) {
        self.stat_float_times = enabled;
    }

    /// Absolute, collapsed form of `path` relative to the working directory.
    pub fn abs_path(&self, path: &str) -> String {
        self.syntax.absolutize(path, &self.cwd)
    }

    pub(crate) fn node(&self, id: NodeId) -> FsResult<&Node> {
        self.nodes.get(&id).ok_or_else(|| FsError::not_found(id.to_string()))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> FsResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or_else(|| FsError::not_found(id.to_string()))
    }

    /// Puts a new, unlinked node into the arena.
    pub(crate) fn alloc_node(&mut self, name: &str, kind: NodeKind, perm_bits: u32) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        let file_type = match kind {
            NodeKind::File { .. } => FileType::Regular,
            NodeKind::Directory { .. } => FileType::Directory,
            NodeKind::Symlink { .. } => FileType::Symlink,
        };
        let mut stat = StatRecord::new(file_type, perm_bits, self.uid, self.gid, self.now());
        stat.size = match &kind {
            NodeKind::File { contents: Some(bytes), .. } => bytes.len() as u64,
            NodeKind::Symlink { target } => target.len() as u64,
            _ => 0,
        };
        // a POSIX directory links to itself through "."
        if file_type == FileType::Directory && !self.windows() {
            stat.nlink = 1;
        }
        self.nodes.insert(id, Node::new(id, name, kind, stat));
        id
    }

    pub(crate) fn next_inode(&mut self) -> u64 {
        self.last_ino += 1;
        self.last_ino
    }

    /// Absolute path of a linked node, rebuilt from parent references.
    pub fn node_path(&self, id: NodeId) -> FsResult<String> {
        let mut names = Vec::new();
        let mut current = id;
        while current != self.root_id {
            let node = self.node(current)?;
            if names.len() > self.nodes.len() {
                return Err(FsError::TooManyLinks { path: node.name.clone() });
            }
            names.push(node.name.clone());
            current = node.parent.ok_or_else(|| FsError::not_found(node.name.clone()))?;
        }
        names.reverse();
        Ok(self.syntax.components_to_path(&names))
    }

    /// Size as seen by the tree: a directory reports the total of its
    /// descendants.
    pub fn node_size(&self, id: NodeId) -> FsResult<u64> {
        let node = self.node(id)?;
        match node.children() {
            Some(children) => {
                let mut total = 0;
                for child in children.values() {
                    total += self.node_size(*child)?;
                }
                Ok(total)
            }
            None => Ok(node.stat.size),
        }
    }

    /// Bytes charged to the disk by the subtree, counting every node once.
    pub(crate) fn subtree_usage(&self, id: NodeId) -> FsResult<u64> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        let mut total = 0;
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let node = self.node(current)?;
            match node.children() {
                Some(children) => stack.extend(children.values().copied()),
                None => total += node.stat.size,
            }
        }
        Ok(total)
    }

    /// Every node id of the subtree rooted at `id`, `id` included.
    pub(crate) fn subtree_ids(&self, id: NodeId) -> FsResult<Vec<NodeId>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            out.push(current);
            if let Some(children) = self.node(current)?.children() {
                stack.extend(children.values().copied());
            }
        }
        Ok(out)
    }

    /// Drops an unlinked node from the arena once no handle refers to it.
    pub(crate) fn reap_if_orphaned(&mut self, id: NodeId) {
        if id == self.root_id || self.open_files.references(id) {
            return;
        }
        let orphaned = self
            .nodes
            .get(&id)
            .is_some_and(|n| n.parent.is_none() && (n.is_dir() || n.stat.nlink == 0));
        if orphaned {
            self.nodes.remove(&id);
        }
    }
}
