// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared engine access and owned file objects on top of handles.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::config::FsConfig;
use crate::error::FsResult;
use crate::fs::FsCore;
use crate::handle::{Fd, HandleId, OpenOptions, OpenTarget};

/// One engine shared by every [`FakeFile`] opened through it
#[derive(Clone, Debug)]
pub struct SharedFs {
    inner: Arc<Mutex<FsCore>>,
}

impl SharedFs {
    pub fn new(core: FsCore) -> Self {
        Self { inner: Arc::new(Mutex::new(core)) }
    }

    pub fn from_config(config: FsConfig) -> FsResult<Self> {
        Ok(Self::new(FsCore::new(config)?))
    }

    /// Locks the engine, ignoring poisoning.
    pub fn lock(&self) -> MutexGuard<'_, FsCore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<T>(&self, op: impl FnOnce(&mut FsCore) -> T) -> T {
        op(&mut self.lock())
    }

    pub fn open(&self, path: &str, mode: &str) -> FsResult<FakeFile> {
        self.open_with(OpenTarget::Path(path), &OpenOptions::new(mode))
    }

    pub fn open_with(&self, target: OpenTarget<'_>, options: &OpenOptions) -> FsResult<FakeFile> {
        let (handle, name) = self.with(|fs| {
            let handle = fs.open(target, options)?;
            Ok::<_, crate::error::FsError>((handle, fs.handle_path(handle)?))
        })?;
        Ok(FakeFile { fs: self.clone(), handle, name })
    }
}

/// An open file that closes itself when dropped
#[derive(Debug)]
pub struct FakeFile {
    fs: SharedFs,
    handle: HandleId,
    name: String,
}

impl FakeFile {
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// The path the file was opened with
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fileno(&self) -> FsResult<Fd> {
        self.fs.lock().fileno(self.handle)
    }

    pub fn read_bytes(&mut self, size: Option<usize>) -> FsResult<Vec<u8>> {
        self.fs.lock().read(self.handle, size)
    }

    pub fn readline(&mut self, limit: Option<usize>) -> FsResult<Vec<u8>> {
        self.fs.lock().readline(self.handle, limit)
    }

    pub fn lines(&mut self) -> Lines<'_> {
        Lines { file: self, done: false }
    }

    pub fn tell(&mut self) -> FsResult<u64> {
        self.fs.lock().tell(self.handle)
    }

    pub fn truncate(&mut self, size: Option<u64>) -> FsResult<u64> {
        self.fs.lock().truncate(self.handle, size)
    }

    pub fn close(&mut self) -> FsResult<()> {
        self.fs.lock().close(self.handle)
    }

    pub fn is_closed(&self) -> bool {
        self.fs.lock().is_closed(self.handle)
    }
}

impl Read for FakeFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.read_bytes(Some(buf.len()))?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl Write for FakeFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.fs.lock().write(self.handle, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.fs.lock().flush(self.handle)?)
    }
}

impl Seek for FakeFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.fs.lock().seek(self.handle, pos)?)
    }
}

impl Drop for FakeFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.name, error = %err, "closing file on drop failed");
        }
    }
}

/// Lines of a [`FakeFile`], terminators included
pub struct Lines<'a> {
    file: &'a mut FakeFile,
    done: bool,
}

impl Iterator for Lines<'_> {
    type Item = FsResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.file.readline(None) {
            Ok(line) if line.is_empty() => {
                self.done = true;
                None
            }
            Ok(line) => Some(Ok(line)),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
