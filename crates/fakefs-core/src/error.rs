// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the fake filesystem

use std::io;

/// Error category, independent of the offending path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FsErrorKind {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    PermissionDenied,
    CrossDevice,
    TooManyLinks,
    NoSpace,
    BadDescriptor,
    InvalidArgument,
    Busy,
    Unsupported,
    LargeFile,
}

/// Core filesystem error type
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory: '{path}'")]
    NotFound { path: String },
    #[error("file exists: '{path}'")]
    AlreadyExists { path: String },
    #[error("not a directory: '{path}'")]
    NotADirectory { path: String },
    #[error("is a directory: '{path}'")]
    IsADirectory { path: String },
    #[error("directory not empty: '{path}'")]
    DirectoryNotEmpty { path: String },
    #[error("permission denied: '{path}'")]
    PermissionDenied { path: String },
    #[error("invalid cross-device link: '{path}'")]
    CrossDevice { path: String },
    #[error("too many levels of symbolic links: '{path}'")]
    TooManyLinks { path: String },
    #[error("no space left on device: '{path}'")]
    NoSpace { path: String },
    #[error("bad file descriptor: {fd}")]
    BadDescriptor { fd: i64 },
    #[error("invalid argument: {detail} ('{path}')")]
    InvalidArgument { path: String, detail: String },
    #[error("device or resource busy: '{path}'")]
    Busy { path: String },
    #[error("unsupported operation: {detail}")]
    Unsupported { detail: String },
    #[error("read and write operations are not supported for a file with declared size only: '{path}'")]
    LargeFile { path: String },
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory { path: path.into() }
    }

    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory { path: path.into() }
    }

    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied { path: path.into() }
    }

    pub fn no_space(path: impl Into<String>) -> Self {
        Self::NoSpace { path: path.into() }
    }

    pub fn invalid(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidArgument { path: path.into(), detail: detail.into() }
    }

    pub fn unsupported(detail: impl Into<String>) -> Self {
        Self::Unsupported { detail: detail.into() }
    }

    pub fn kind(&self) -> FsErrorKind {
        match self {
            Self::NotFound { .. } => FsErrorKind::NotFound,
            Self::AlreadyExists { .. } => FsErrorKind::AlreadyExists,
            Self::NotADirectory { .. } => FsErrorKind::NotADirectory,
            Self::IsADirectory { .. } => FsErrorKind::IsADirectory,
            Self::DirectoryNotEmpty { .. } => FsErrorKind::DirectoryNotEmpty,
            Self::PermissionDenied { .. } => FsErrorKind::PermissionDenied,
            Self::CrossDevice { .. } => FsErrorKind::CrossDevice,
            Self::TooManyLinks { .. } => FsErrorKind::TooManyLinks,
            Self::NoSpace { .. } => FsErrorKind::NoSpace,
            Self::BadDescriptor { .. } => FsErrorKind::BadDescriptor,
            Self::InvalidArgument { .. } => FsErrorKind::InvalidArgument,
            Self::Busy { .. } => FsErrorKind::Busy,
            Self::Unsupported { .. } => FsErrorKind::Unsupported,
            Self::LargeFile { .. } => FsErrorKind::LargeFile,
        }
    }

    /// The path the error is attributed to, when there is one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::NotFound { path }
            | Self::AlreadyExists { path }
            | Self::NotADirectory { path }
            | Self::IsADirectory { path }
            | Self::DirectoryNotEmpty { path }
            | Self::PermissionDenied { path }
            | Self::CrossDevice { path }
            | Self::TooManyLinks { path }
            | Self::NoSpace { path }
            | Self::InvalidArgument { path, .. }
            | Self::Busy { path }
            | Self::LargeFile { path } => Some(path),
            Self::BadDescriptor { .. } | Self::Unsupported { .. } => None,
        }
    }

    /// Host errno value for this error.
    pub fn errno(&self) -> i32 {
        match self.kind() {
            FsErrorKind::NotFound => libc::ENOENT,
            FsErrorKind::AlreadyExists => libc::EEXIST,
            FsErrorKind::NotADirectory => libc::ENOTDIR,
            FsErrorKind::IsADirectory => libc::EISDIR,
            FsErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
            FsErrorKind::PermissionDenied => libc::EACCES,
            FsErrorKind::CrossDevice => libc::EXDEV,
            FsErrorKind::TooManyLinks => libc::ELOOP,
            FsErrorKind::NoSpace => libc::ENOSPC,
            FsErrorKind::BadDescriptor => libc::EBADF,
            FsErrorKind::InvalidArgument => libc::EINVAL,
            FsErrorKind::Busy => libc::EBUSY,
            FsErrorKind::Unsupported => libc::EOPNOTSUPP,
            FsErrorKind::LargeFile => libc::EFBIG,
        }
    }
}

impl From<FsError> for io::Error {
    fn from(err: FsError) -> Self {
        let kind = match err.kind() {
            FsErrorKind::NotFound => io::ErrorKind::NotFound,
            FsErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
            FsErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            FsErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
            FsErrorKind::Unsupported => io::ErrorKind::Unsupported,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
