// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory emulation of a hierarchical filesystem.
//!
//! The engine ([`FsCore`]) keeps a tree of files, directories and symlinks,
//! resolves paths the way a POSIX or Windows host would, tracks disk usage
//! per mount point and serves buffered file handles and integer
//! descriptors. [`SharedFs`] wraps one engine for use from several owners,
//! and [`FakeFile`] is an owned handle implementing the `std::io` traits.

pub mod clock;
pub mod config;
pub mod error;
pub mod file;
pub mod fs;
pub mod handle;
pub mod mount;
pub mod node;
pub mod path;
pub mod stat;

pub use clock::{Clock, SystemClock};
pub use config::{CaseSensitivity, FsConfig, OsFlavor, SecurityPolicy};
pub use error::{FsError, FsErrorKind, FsResult};
pub use file::{FakeFile, Lines, SharedFs};
pub use fs::{
    AccessMode, FileContent, FsCore, NewEntry, NewEntryKind, NewFile, ScanEntry, TimeSpec,
    WalkEntry, WalkErrorHandler, WalkOptions, XattrFlags,
};
pub use handle::{Fd, HandleId, OpenFlags, OpenMode, OpenOptions, OpenTarget};
pub use mount::{DiskUsage, MountPoint};
pub use node::{Node, NodeId, NodeKind};
pub use path::PathSyntax;
pub use stat::{FileType, StatRecord, StatResult, StatTime};
