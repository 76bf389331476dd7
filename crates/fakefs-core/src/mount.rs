// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount points and per-device disk accounting

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::path::PathSyntax;

/// Total reported for mounts without a capacity limit (1 TiB)
pub const UNLIMITED_DISK_SIZE: u64 = 1 << 40;

/// A subtree with its own device id and capacity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub path: String,
    pub device_id: u64,
    pub total_size: Option<u64>,
    pub used_size: u64,
}

impl MountPoint {
    pub fn usage(&self) -> DiskUsage {
        match self.total_size {
            Some(total) => DiskUsage { total, used: self.used_size, free: total - self.used_size },
            None => DiskUsage { total: UNLIMITED_DISK_SIZE, used: 0, free: UNLIMITED_DISK_SIZE },
        }
    }

    fn check_change(&self, delta: i64, path: &str) -> FsResult<()> {
        if let Some(total) = self.total_size {
            if delta > 0 && total.saturating_sub(self.used_size) < delta as u64 {
                return Err(FsError::no_space(path));
            }
        }
        Ok(())
    }
}

/// Disk usage triple as reported by `disk_usage`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// All mounts of one filesystem, in creation order
#[derive(Clone, Debug, Default)]
pub struct MountTable {
    mounts: Vec<MountPoint>,
    last_device: u64,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountPoint> {
        self.mounts.iter()
    }

    pub fn find_exact(&self, syntax: &PathSyntax, path: &str) -> Option<&MountPoint> {
        self.mounts.iter().find(|m| syntax.names_equal(&m.path, path))
    }

    /// Registers a mount and hands out the next device id.
    pub fn insert(&mut self, path: &str, total_size: Option<u64>) -> &MountPoint {
        self.last_device += 1;
        debug!(path, device_id = self.last_device, ?total_size, "adding mount point");
        self.mounts.push(MountPoint {
            path: path.to_string(),
            device_id: self.last_device,
            total_size,
            used_size: 0,
        });
        &self.mounts[self.mounts.len() - 1]
    }

    pub fn for_device(&self, device_id: u64) -> Option<&MountPoint> {
        self.mounts.iter().find(|m| m.device_id == device_id)
    }

    pub fn for_device_mut(&mut self, device_id: u64) -> Option<&mut MountPoint> {
        self.mounts.iter_mut().find(|m| m.device_id == device_id)
    }

    /// The innermost mount containing `path` (absolute, normalized).
    pub fn for_path(&self, syntax: &PathSyntax, path: &str) -> Option<&MountPoint> {
        self.mounts
            .iter()
            .filter(|m| syntax.has_prefix(path, &m.path))
            .max_by_key(|m| syntax.components(&m.path).len())
    }

    /// Fails with `NoSpace` if growing the device by `delta` would exceed
    /// its capacity. Does not change anything.
    pub fn check_change(&self, device_id: u64, delta: i64, path: &str) -> FsResult<()> {
        match self.for_device(device_id) {
            Some(mount) => mount.check_change(delta, path),
            None => Ok(()),
        }
    }

    /// Adjusts the used size of the device, checking capacity first.
    pub fn change_usage(&mut self, device_id: u64, delta: i64, path: &str) -> FsResult<()> {
        let Some(mount) = self.for_device_mut(device_id) else {
            return Ok(());
        };
        mount.check_change(delta, path)?;
        mount.used_size = if delta >= 0 {
            mount.used_size + delta as u64
        } else {
            mount.used_size.saturating_sub(delta.unsigned_abs())
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ids_are_monotonic() {
        let mut table = MountTable::new();
        let first = table.insert("/", None).device_id;
        let second = table.insert("/mnt", Some(10)).device_id;
        assert!(second > first);
    }

    #[test]
    fn test_innermost_mount_wins() {
        let syntax = PathSyntax::posix();
        let mut table = MountTable::new();
        table.insert("/", None);
        table.insert("/mnt", Some(10));
        table.insert("/mnt/inner", Some(5));
        assert_eq!(table.for_path(&syntax, "/mnt/inner/x").map(|m| m.path.as_str()), Some("/mnt/inner"));
        assert_eq!(table.for_path(&syntax, "/mnt/other").map(|m| m.path.as_str()), Some("/mnt"));
        assert_eq!(table.for_path(&syntax, "/mntx").map(|m| m.path.as_str()), Some("/"));
    }

    #[test]
    fn test_usage_respects_capacity() {
        let mut table = MountTable::new();
        let dev = table.insert("/", Some(100)).device_id;
        table.change_usage(dev, 60, "/a").expect("fits");
        let err = table.change_usage(dev, 41, "/b").expect_err("must not fit");
        assert!(matches!(err, FsError::NoSpace { .. }));
        assert_eq!(table.for_device(dev).map(|m| m.used_size), Some(60));
        table.change_usage(dev, -60, "/a").expect("release");
        assert_eq!(table.for_device(dev).map(|m| m.usage().free), Some(100));
    }

    #[test]
    fn test_unlimited_usage_report() {
        let mut table = MountTable::new();
        let dev = table.insert("/", None).device_id;
        table.change_usage(dev, 1 << 50, "/huge").expect("unlimited");
        let usage = table.for_device(dev).map(|m| m.usage()).expect("mount exists");
        assert_eq!(usage.total, UNLIMITED_DISK_SIZE);
    }

    #[test]
    fn test_mount_report_as_json() {
        let mut table = MountTable::new();
        let dev = table.insert("/data", Some(64)).device_id;
        table.change_usage(dev, 16, "/data/f").expect("fits");
        let mount = table.for_device(dev).cloned().expect("mount exists");
        let json = serde_json::to_value(&mount).expect("serialize");
        assert_eq!(json["path"], "/data");
        assert_eq!(json["used_size"], 16);
        let back: MountPoint = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, mount);
        let usage = serde_json::to_string(&mount.usage()).expect("serialize usage");
        assert_eq!(usage, r#"{"total":64,"used":16,"free":48}"#);
    }
}
