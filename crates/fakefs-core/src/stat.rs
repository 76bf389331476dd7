// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Stat records and the stat-result view handed to callers

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

pub const PERM_READ: u32 = 0o400;
pub const PERM_WRITE: u32 = 0o200;
pub const PERM_EXE: u32 = 0o100;
/// Default permission bits for directories and symlinks
pub const PERM_DEF: u32 = 0o777;
/// Default permission bits for regular files
pub const PERM_DEF_FILE: u32 = 0o666;
/// Permission bits including setuid, setgid and sticky
pub const PERM_ALL: u32 = 0o7777;

/// Entry type encoded in the `S_IFMT` bits of a mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

impl FileType {
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::Regular => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
        }
    }
}

/// Metadata owned by every entry.
///
/// Times are stored as integer nanoseconds; the unit a caller sees is
/// decided when a [`StatResult`] is built. `ino` stays unset until the entry
/// is first inserted into a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatRecord {
    pub mode: u32,
    pub ino: Option<u64>,
    pub dev: u64,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
}

impl StatRecord {
    pub fn new(file_type: FileType, perm_bits: u32, uid: u32, gid: u32, now_ns: i64) -> Self {
        Self {
            mode: file_type.mode_bits() | (perm_bits & PERM_ALL),
            ino: None,
            dev: 0,
            nlink: 0,
            uid,
            gid,
            size: 0,
            atime_ns: now_ns,
            mtime_ns: now_ns,
            ctime_ns: now_ns,
        }
    }

    pub fn file_type(&self) -> FileType {
        match self.mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            _ => FileType::Regular,
        }
    }

    pub fn perm_bits(&self) -> u32 {
        self.mode & PERM_ALL
    }

    /// Replace permission bits, keeping the type bits.
    pub fn set_perm_bits(&mut self, perm_bits: u32) {
        self.mode = (self.mode & !PERM_ALL) | (perm_bits & PERM_ALL);
    }

    /// Checks `permission_bits` (expressed as owner bits) against the class
    /// the caller falls into: owner, group, then other.
    pub fn has_permission(&self, permission_bits: u32, uid: u32, gid: u32) -> bool {
        if uid == self.uid {
            self.mode & permission_bits == permission_bits
        } else if gid == self.gid {
            self.mode & (permission_bits >> 3) == permission_bits >> 3
        } else {
            self.mode & (permission_bits >> 6) == permission_bits >> 6
        }
    }

    pub fn touch_modified(&mut self, now_ns: i64) {
        self.mtime_ns = now_ns;
        self.ctime_ns = now_ns;
    }

    /// Builds the caller-facing view.
    pub fn to_result(&self, float_times: bool, windows: bool) -> StatResult {
        let size = if windows && self.file_type() == FileType::Symlink { 0 } else { self.size };
        StatResult {
            st_mode: self.mode,
            st_ino: self.ino.unwrap_or(0),
            st_dev: self.dev,
            st_nlink: self.nlink,
            st_uid: self.uid,
            st_gid: self.gid,
            st_size: size,
            st_atime_ns: self.atime_ns,
            st_mtime_ns: self.mtime_ns,
            st_ctime_ns: self.ctime_ns,
            float_times,
        }
    }
}

/// A timestamp as read through a stat result
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StatTime {
    Seconds(i64),
    Fractional(f64),
}

impl StatTime {
    fn from_ns(ns: i64, float_times: bool) -> Self {
        if float_times {
            StatTime::Fractional(ns as f64 / 1e9)
        } else {
            StatTime::Seconds(ns.div_euclid(1_000_000_000))
        }
    }
}

/// Snapshot of an entry's metadata.
///
/// Fields are available by name and, in the canonical order
/// `(mode, ino, dev, nlink, uid, gid, size, atime, mtime, ctime)`, by index;
/// the indexed form carries whole seconds for the three times.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatResult {
    pub st_mode: u32,
    pub st_ino: u64,
    pub st_dev: u64,
    pub st_nlink: u64,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_atime_ns: i64,
    pub st_mtime_ns: i64,
    pub st_ctime_ns: i64,
    float_times: bool,
}

pub const STAT_FIELD_COUNT: usize = 10;

impl StatResult {
    pub fn st_atime(&self) -> StatTime {
        StatTime::from_ns(self.st_atime_ns, self.float_times)
    }

    pub fn st_mtime(&self) -> StatTime {
        StatTime::from_ns(self.st_mtime_ns, self.float_times)
    }

    pub fn st_ctime(&self) -> StatTime {
        StatTime::from_ns(self.st_ctime_ns, self.float_times)
    }

    pub fn file_type(&self) -> FileType {
        match self.st_mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            _ => FileType::Regular,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == FileType::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        let secs = |ns: i64| ns.div_euclid(1_000_000_000);
        let value = match index {
            0 => self.st_mode as i64,
            1 => self.st_ino as i64,
            2 => self.st_dev as i64,
            3 => self.st_nlink as i64,
            4 => self.st_uid as i64,
            5 => self.st_gid as i64,
            6 => self.st_size as i64,
            7 => secs(self.st_atime_ns),
            8 => secs(self.st_mtime_ns),
            9 => secs(self.st_ctime_ns),
            _ => return None,
        };
        Some(value)
    }

    pub fn to_tuple(&self) -> [i64; STAT_FIELD_COUNT] {
        let mut out = [0i64; STAT_FIELD_COUNT];
        for (index, slot) in out.iter_mut().enumerate() {
            *slot = self.get(index).unwrap_or_default();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> StatRecord {
        let mut rec = StatRecord::new(FileType::Regular, 0o640, 1000, 100, 1_500_000_000_750_000_000);
        rec.ino = Some(42);
        rec.dev = 1;
        rec.nlink = 1;
        rec.size = 12;
        rec
    }

    #[test]
    fn test_mode_encodes_single_type() {
        let rec = record();
        assert_eq!(rec.mode & S_IFMT, S_IFREG);
        assert_eq!(rec.perm_bits(), 0o640);
        assert_eq!(rec.file_type(), FileType::Regular);
    }

    #[test]
    fn test_permission_classes() {
        let rec = record();
        assert!(rec.has_permission(PERM_WRITE, 1000, 5));
        assert!(rec.has_permission(PERM_READ, 7, 100));
        assert!(!rec.has_permission(PERM_WRITE, 7, 100));
        assert!(!rec.has_permission(PERM_READ, 7, 7));
    }

    #[test]
    fn test_float_toggle_keeps_precision() {
        let rec = record();
        let as_int = rec.to_result(false, false);
        assert_eq!(as_int.st_mtime(), StatTime::Seconds(1_500_000_000));
        let as_float = rec.to_result(true, false);
        match as_float.st_mtime() {
            StatTime::Fractional(secs) => assert!((secs - 1_500_000_000.75).abs() < 1e-3),
            other => panic!("expected fractional seconds, got {:?}", other),
        }
        assert_eq!(as_float.st_mtime_ns, 1_500_000_000_750_000_000);
    }

    #[test]
    fn test_sequence_form() {
        let result = record().to_result(true, false);
        let tuple = result.to_tuple();
        assert_eq!(tuple[0], (S_IFREG | 0o640) as i64);
        assert_eq!(tuple[1], 42);
        assert_eq!(tuple[6], 12);
        assert_eq!(tuple[8], 1_500_000_000);
        assert_eq!(result.get(10), None);
    }

    #[test]
    fn test_windows_symlink_size_reads_zero() {
        let mut rec = StatRecord::new(FileType::Symlink, PERM_DEF, 0, 0, 0);
        rec.size = 9;
        assert_eq!(rec.to_result(true, true).st_size, 0);
        assert_eq!(rec.to_result(true, false).st_size, 9);
    }
}
