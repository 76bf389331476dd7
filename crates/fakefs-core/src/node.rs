// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Tree nodes stored in the engine's arena

use indexmap::IndexMap;

use crate::stat::{FileType, StatRecord};

/// Arena key of a node. Stable for the node's lifetime, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Node payload
#[derive(Clone, Debug)]
pub enum NodeKind {
    File {
        /// `None` for a large file that only has a declared size
        contents: Option<Vec<u8>>,
        /// Bumped on every content change
        epoch: u64,
    },
    Directory {
        /// Children in creation order
        children: IndexMap<String, NodeId>,
    },
    Symlink {
        target: String,
    },
}

/// A file, directory or symlink
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    /// Directory that most recently linked this node; hard-linked nodes
    /// may also be listed elsewhere.
    pub(crate) parent: Option<NodeId>,
    pub(crate) kind: NodeKind,
    pub(crate) stat: StatRecord,
    pub(crate) xattrs: IndexMap<String, Vec<u8>>,
}

impl Node {
    pub(crate) fn new(id: NodeId, name: &str, kind: NodeKind, stat: StatRecord) -> Self {
        Self { id, name: name.to_string(), parent: None, kind, stat, xattrs: IndexMap::new() }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn stat(&self) -> &StatRecord {
        &self.stat
    }

    pub fn file_type(&self) -> FileType {
        match self.kind {
            NodeKind::File { .. } => FileType::Regular,
            NodeKind::Directory { .. } => FileType::Directory,
            NodeKind::Symlink { .. } => FileType::Symlink,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink { .. })
    }

    /// A file whose contents are not held, only its declared size.
    pub fn is_large_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { contents: None, .. })
    }

    pub fn contents(&self) -> Option<&[u8]> {
        match &self.kind {
            NodeKind::File { contents, .. } => contents.as_deref(),
            NodeKind::Symlink { target } => Some(target.as_bytes()),
            NodeKind::Directory { .. } => None,
        }
    }

    pub fn symlink_target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Symlink { target } => Some(target),
            _ => None,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self.kind {
            NodeKind::File { epoch, .. } => epoch,
            _ => 0,
        }
    }

    pub(crate) fn children(&self) -> Option<&IndexMap<String, NodeId>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            _ => None,
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut IndexMap<String, NodeId>> {
        match &mut self.kind {
            NodeKind::Directory { children } => Some(children),
            _ => None,
        }
    }

    /// Child names in creation order; empty for non-directories.
    pub fn entry_names(&self) -> Vec<String> {
        self.children().map(|c| c.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn xattr_names(&self) -> Vec<String> {
        self.xattrs.keys().cloned().collect()
    }

    /// Replaces file contents and keeps `size` in step. Returns whether
    /// the bytes changed.
    pub(crate) fn replace_contents(&mut self, new_contents: Vec<u8>) -> bool {
        let NodeKind::File { contents, epoch } = &mut self.kind else {
            return false;
        };
        let changed = contents.as_deref() != Some(new_contents.as_slice());
        self.stat.size = new_contents.len() as u64;
        *contents = Some(new_contents);
        *epoch += 1;
        changed
    }

    /// Sets a declared size and drops held contents.
    pub(crate) fn declare_size(&mut self, size: u64) {
        if let NodeKind::File { contents, epoch } = &mut self.kind {
            *contents = None;
            *epoch += 1;
        }
        self.stat.size = size;
    }

    /// Resizes held contents, truncating or padding with NUL bytes.
    pub(crate) fn resize_contents(&mut self, size: u64) {
        match &mut self.kind {
            NodeKind::File { contents: Some(bytes), epoch } => {
                bytes.resize(size as usize, 0);
                *epoch += 1;
            }
            NodeKind::File { contents: None, epoch } => {
                *epoch += 1;
            }
            _ => {}
        }
        self.stat.size = size;
    }
}
