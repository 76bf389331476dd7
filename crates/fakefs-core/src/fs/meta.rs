// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Metadata operations: stat, permissions, ownership, times, links,
//! working directory and extended attributes

use bitflags::bitflags;
use tracing::debug;

use super::FsCore;
use crate::error::{FsError, FsResult};
use crate::node::NodeId;
use crate::stat::{StatResult, PERM_WRITE};

/// Timestamps for [`FsCore::utime`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TimeSpec {
    /// Both times set to the current clock
    Now,
    Seconds { atime: f64, mtime: f64 },
    Nanos { atime_ns: i64, mtime_ns: i64 },
}

impl TimeSpec {
    /// Builds the times from the host-style pair of optional arguments:
    /// `times` in seconds or `ns` in nanoseconds, at most one of them, each
    /// holding exactly `[atime, mtime]`.
    pub fn from_parts(times: Option<&[f64]>, ns: Option<&[i64]>) -> FsResult<Self> {
        match (times, ns) {
            (Some(_), Some(_)) => Err(FsError::invalid(
                "",
                "utime: you may specify either 'times' or 'ns' but not both",
            )),
            (Some(&[atime, mtime]), None) => Ok(TimeSpec::Seconds { atime, mtime }),
            (Some(_), None) => Err(FsError::invalid("", "utime: 'times' must hold two values")),
            (None, Some(&[atime_ns, mtime_ns])) => Ok(TimeSpec::Nanos { atime_ns, mtime_ns }),
            (None, Some(_)) => Err(FsError::invalid("", "utime: 'ns' must hold two values")),
            (None, None) => Ok(TimeSpec::Now),
        }
    }

    fn resolve(self, now_ns: i64) -> (i64, i64) {
        let to_ns = |secs: f64| (secs * 1e9).round() as i64;
        match self {
            TimeSpec::Now => (now_ns, now_ns),
            TimeSpec::Seconds { atime, mtime } => (to_ns(atime), to_ns(mtime)),
            TimeSpec::Nanos { atime_ns, mtime_ns } => (atime_ns, mtime_ns),
        }
    }
}

bitflags! {
    /// Access mode bits of [`FsCore::access`]; empty checks existence only.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AccessMode: u32 {
        const READ = 0o4;
        const WRITE = 0o2;
        const EXECUTE = 0o1;
    }
}

impl AccessMode {
    pub const EXISTS: Self = Self::empty();
}

/// Creation rule of [`FsCore::setxattr`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum XattrFlags {
    #[default]
    Either,
    /// Fail if the attribute already exists
    Create,
    /// Fail if the attribute does not exist yet
    Replace,
}

impl FsCore {
    pub fn stat(&self, path: &str, follow_symlinks: bool) -> FsResult<StatResult> {
        self.check_path_arg(path)?;
        let trailing_sep = self.syntax.ends_with_separator(path);
        // "link/" names the link's target even without following
        let id = self.resolve(path, follow_symlinks || trailing_sep)?;
        let node = self.node(id)?;
        if trailing_sep {
            if self.windows() && node.is_file() {
                return Err(FsError::invalid(path, "trailing separator"));
            }
            if !self.windows() && !node.is_dir() {
                return Err(FsError::not_a_directory(path));
            }
        }
        Ok(node.stat.to_result(self.stat_float_times, self.windows()))
    }

    pub fn lstat(&self, path: &str) -> FsResult<StatResult> {
        self.stat(path, false)
    }

    /// Changes permission bits. The Windows flavor only knows a read-only
    /// flag, so just the write bits follow `mode` there.
    pub fn chmod(&mut self, path: &str, mode: u32, follow_symlinks: bool) -> FsResult<()> {
        let id = self.resolve(path, follow_symlinks)?;
        let windows = self.windows();
        let owner = self.node(id)?.stat.uid;
        if !windows && !self.is_root_identity() && owner != self.uid {
            return Err(FsError::permission_denied(path));
        }
        let now = self.now();
        let node = self.node_mut(id)?;
        let bits = if !windows {
            mode
        } else if mode & PERM_WRITE != 0 {
            node.stat.perm_bits() | 0o222
        } else {
            node.stat.perm_bits() & !0o222
        };
        node.stat.set_perm_bits(bits);
        node.stat.ctime_ns = now;
        debug!(path, mode = format!("{:o}", bits), "changed mode");
        Ok(())
    }

    /// Changes owner and group; `None` keeps the current value.
    pub fn chown(
        &mut self,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
        follow_symlinks: bool,
    ) -> FsResult<()> {
        let id = self.resolve(path, follow_symlinks)?;
        let now = self.now();
        let node = self.node_mut(id)?;
        if let Some(uid) = uid {
            node.stat.uid = uid;
        }
        if let Some(gid) = gid {
            node.stat.gid = gid;
        }
        node.stat.ctime_ns = now;
        Ok(())
    }

    pub fn utime(&mut self, path: &str, times: TimeSpec, follow_symlinks: bool) -> FsResult<()> {
        let id = self.resolve(path, follow_symlinks)?;
        let now = self.now();
        let (atime_ns, mtime_ns) = times.resolve(now);
        let node = self.node_mut(id)?;
        node.stat.atime_ns = atime_ns;
        node.stat.mtime_ns = mtime_ns;
        node.stat.ctime_ns = now;
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> FsResult<String> {
        self.check_path_arg(path)?;
        if !self.windows() && self.syntax.ends_with_separator(path) && self.exists(path)? {
            return Err(FsError::invalid(path, "not a symbolic link"));
        }
        let node = self.get_entry_no_follow(path)?;
        node.symlink_target()
            .map(str::to_string)
            .ok_or_else(|| FsError::invalid(path, "not a symbolic link"))
    }

    /// Checks `mode` against the owner bits of the entry. Root is never
    /// refused write access. A missing entry reports `false`.
    pub fn access(&self, path: &str, mode: AccessMode, follow_symlinks: bool) -> FsResult<bool> {
        let stat = match self.stat(path, follow_symlinks) {
            Ok(stat) => stat,
            Err(FsError::NotFound { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };
        let mut wanted = mode;
        if self.is_root_identity() {
            wanted.remove(AccessMode::WRITE);
        }
        let granted = AccessMode::from_bits_truncate((stat.st_mode >> 6) & 0o7);
        Ok(granted.contains(wanted))
    }

    /// Sets the umask, returning the previous one.
    pub fn umask(&mut self, new_mask: u32) -> u32 {
        std::mem::replace(&mut self.umask, new_mask & 0o777)
    }

    pub fn getcwd(&self) -> String {
        self.cwd.clone()
    }

    pub fn chdir(&mut self, path: &str) -> FsResult<()> {
        let id = self.resolve(path, true)?;
        let node = self.node(id)?;
        if !node.is_dir() {
            return Err(FsError::not_a_directory(path));
        }
        if !self.may_traverse(node) {
            return Err(FsError::permission_denied(path));
        }
        let mut cwd = self.resolve_path(path, true)?;
        if self.syntax.components(&cwd).len() == 1 && !self.syntax.split_drive(&cwd).0.is_empty() {
            cwd.push(self.syntax.separator);
        }
        debug!(cwd = %cwd, "changed working directory");
        self.cwd = cwd;
        Ok(())
    }

    fn xattr_target(&self, path: &str, follow_symlinks: bool) -> FsResult<NodeId> {
        if !self.config.os_flavor.is_linux() {
            return Err(FsError::unsupported("extended attributes are only available on Linux"));
        }
        self.resolve(path, follow_symlinks)
    }

    pub fn getxattr(&self, path: &str, name: &str, follow_symlinks: bool) -> FsResult<Vec<u8>> {
        let id = self.xattr_target(path, follow_symlinks)?;
        self.node(id)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::not_found(format!("{}:{}", path, name)))
    }

    pub fn setxattr(
        &mut self,
        path: &str,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
        follow_symlinks: bool,
    ) -> FsResult<()> {
        let id = self.xattr_target(path, follow_symlinks)?;
        let now = self.now();
        let node = self.node_mut(id)?;
        let exists = node.xattrs.contains_key(name);
        match flags {
            XattrFlags::Create if exists => {
                return Err(FsError::already_exists(format!("{}:{}", path, name)))
            }
            XattrFlags::Replace if !exists => {
                return Err(FsError::not_found(format!("{}:{}", path, name)))
            }
            _ => {}
        }
        node.xattrs.insert(name.to_string(), value.to_vec());
        node.stat.ctime_ns = now;
        Ok(())
    }

    pub fn listxattr(&self, path: &str, follow_symlinks: bool) -> FsResult<Vec<String>> {
        let id = self.xattr_target(path, follow_symlinks)?;
        Ok(self.node(id)?.xattr_names())
    }

    pub fn removexattr(&mut self, path: &str, name: &str, follow_symlinks: bool) -> FsResult<()> {
        let id = self.xattr_target(path, follow_symlinks)?;
        let now = self.now();
        let node = self.node_mut(id)?;
        if node.xattrs.shift_remove(name).is_none() {
            return Err(FsError::not_found(format!("{}:{}", path, name)));
        }
        node.stat.ctime_ns = now;
        Ok(())
    }
}
