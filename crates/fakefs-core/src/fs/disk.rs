// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount points and disk usage

use tracing::debug;

use super::FsCore;
use crate::error::{FsError, FsResult};
use crate::mount::{DiskUsage, MountPoint, UNLIMITED_DISK_SIZE};
use crate::stat::PERM_DEF;

impl FsCore {
    /// Mount paths are stored collapsed, and a drive root as the bare drive.
    fn mount_key(&self, path: &str) -> String {
        let collapsed = self.syntax.collapse(path);
        let (drive, rest) = self.syntax.split_drive(&collapsed);
        if !drive.is_empty() && rest.chars().all(|c| self.syntax.is_separator(c)) {
            return drive.to_string();
        }
        collapsed
    }

    /// Adds a mount at `path` with its own device id and an optional
    /// capacity.
    ///
    /// Content already below `path` moves to the new device, together with
    /// its usage; if that does not fit the new capacity nothing changes and
    /// `NoSpace` is returned. An existing mount is an error unless
    /// `can_exist` is set, in which case it is returned as is.
    pub fn add_mount_point(
        &mut self,
        path: &str,
        total_size: Option<u64>,
        can_exist: bool,
    ) -> FsResult<MountPoint> {
        let key = self.mount_key(path);
        if let Some(existing) = self.mounts.find_exact(&self.syntax, &key) {
            if can_exist {
                return Ok(existing.clone());
            }
            return Err(FsError::already_exists(key));
        }
        let is_root = key == self.syntax.sep_str();
        let existing = if is_root {
            Some(self.root_id)
        } else {
            self.resolve(&key, true).ok()
        };
        let (moved_usage, old_dev) = match existing {
            Some(id) => {
                let mount_dir = self.node(id)?;
                if !mount_dir.is_dir() {
                    return Err(FsError::not_a_directory(key));
                }
                let old_dev = mount_dir.stat.dev;
                let mut usage = 0;
                for member in self.subtree_ids(id)? {
                    let node = self.node(member)?;
                    if node.stat.dev == old_dev && !node.is_dir() {
                        usage += node.stat.size;
                    }
                }
                (usage, old_dev)
            }
            None => (0, 0),
        };
        if total_size.is_some_and(|total| moved_usage > total) {
            return Err(FsError::no_space(key));
        }

        let device_id = self.mounts.insert(&key, total_size).device_id;
        let mount_dir = match existing {
            Some(id) => id,
            None => self.create_directory(&key, PERM_DEF)?,
        };
        for member in self.subtree_ids(mount_dir)? {
            let node = self.node_mut(member)?;
            if node.stat.dev == old_dev || member == mount_dir {
                node.stat.dev = device_id;
            }
        }
        if moved_usage > 0 {
            self.mounts.change_usage(old_dev, -(moved_usage as i64), &key)?;
            self.mounts.change_usage(device_id, moved_usage as i64, &key)?;
        }
        debug!(path = %key, device_id, moved_usage, "mounted");
        self.mounts
            .for_device(device_id)
            .cloned()
            .ok_or_else(|| FsError::not_found(key))
    }

    /// Creates the mount for a drive letter or UNC share the first time a
    /// path on it is used.
    pub(crate) fn auto_mount_drive(&mut self, abs_path: &str) -> FsResult<()> {
        if !self.syntax.drive_support {
            return Ok(());
        }
        let drive = self.syntax.split_drive(abs_path).0.to_string();
        if drive.is_empty() || self.mounts.find_exact(&self.syntax, &drive).is_some() {
            return Ok(());
        }
        self.add_mount_point(&drive, None, true).map(|_| ())
    }

    /// Usage of the mount holding `path`, or of the root mount.
    pub fn get_disk_usage(&mut self, path: Option<&str>) -> FsResult<DiskUsage> {
        let mount = match path {
            Some(path) => {
                let abs = self.abs_path(path);
                self.auto_mount_drive(&abs)?;
                self.mounts.for_path(&self.syntax, &abs)
            }
            None => self.mounts.iter().next(),
        };
        Ok(mount.map(MountPoint::usage).unwrap_or(DiskUsage {
            total: UNLIMITED_DISK_SIZE,
            used: 0,
            free: UNLIMITED_DISK_SIZE,
        }))
    }

    /// Sets the capacity of the mount holding `path` (the root mount when
    /// `None`). Fails with `NoSpace` if more is already in use.
    pub fn set_disk_usage(&mut self, total_size: u64, path: Option<&str>) -> FsResult<()> {
        let abs = path.map(|p| self.abs_path(p));
        if let Some(abs) = &abs {
            self.auto_mount_drive(abs)?;
        }
        let device_id = match &abs {
            Some(abs) => self.mounts.for_path(&self.syntax, abs).map(|m| m.device_id),
            None => self.mounts.iter().next().map(|m| m.device_id),
        };
        let label = abs.unwrap_or_else(|| self.syntax.sep_str());
        let mount = device_id
            .and_then(|dev| self.mounts.for_device_mut(dev))
            .ok_or_else(|| FsError::not_found(&label))?;
        if mount.used_size > total_size {
            return Err(FsError::no_space(label));
        }
        mount.total_size = Some(total_size);
        debug!(path = %mount.path, total_size, "set disk capacity");
        Ok(())
    }

    /// Adjusts the usage of a device directly. Without `device_id` the
    /// mount holding `path` is charged.
    pub fn change_disk_usage(&mut self, delta: i64, path: &str, device_id: Option<u64>) -> FsResult<()> {
        let device_id = match device_id {
            Some(id) => Some(id),
            None => {
                let abs = self.abs_path(path);
                self.mounts.for_path(&self.syntax, &abs).map(|m| m.device_id)
            }
        };
        match device_id {
            Some(id) => self.mounts.change_usage(id, delta, path),
            None => Ok(()),
        }
    }

    pub fn mount_points(&self) -> Vec<MountPoint> {
        self.mounts.iter().cloned().collect()
    }
}
