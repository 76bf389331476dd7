// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open-file registry and buffered handle I/O.
//!
//! Every open handle keeps its own copy of the file contents. Writes land in
//! that buffer and reach the shared node on flush; reads first flush and then
//! resynchronize with the node when another handle changed it. Handles are
//! grouped under integer descriptors: opening by descriptor adds a handle to
//! an existing descriptor, and closing a descriptor releases it to a
//! min-heap so the lowest free number is handed out next.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::SeekFrom;

use bitflags::bitflags;
use tracing::{trace, warn};

use crate::error::{FsError, FsResult};
use crate::fs::{FsCore, NewFile};
use crate::node::NodeId;
use crate::stat::{StatResult, PERM_DEF, PERM_DEF_FILE, PERM_READ, PERM_WRITE};

/// Integer file descriptor
pub type Fd = i32;

/// Lowest descriptor handed out; 0 to 2 belong to the standard streams.
pub const FIRST_FD: Fd = 3;

pub const DEFAULT_BUFFER_SIZE: usize = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Access rules decoded from a mode string or open flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub must_exist: bool,
    pub read: bool,
    pub write: bool,
    pub truncate: bool,
    pub append: bool,
    pub must_not_exist: bool,
    pub binary: bool,
}

impl OpenMode {
    /// Parses `r`, `w`, `a`, `x`, each optionally with `+`, plus `b` or `t`.
    pub fn parse(mode: &str) -> FsResult<Self> {
        let binary = mode.contains('b');
        if binary && mode.contains('t') {
            return Err(FsError::invalid(mode, "can't have text and binary mode at once"));
        }
        let core: String = mode.chars().filter(|c| *c != 'b' && *c != 't').collect();
        let (must_exist, read, write, truncate, append, must_not_exist) = match core.as_str() {
            "r" => (true, true, false, false, false, false),
            "w" => (false, false, true, true, false, false),
            "a" => (false, false, true, false, true, false),
            "r+" => (true, true, true, false, false, false),
            "w+" => (false, true, true, true, false, false),
            "a+" => (false, true, true, false, true, false),
            "x" => (false, false, true, false, false, true),
            "x+" => (false, true, true, false, false, true),
            _ => return Err(FsError::invalid(mode, "invalid mode")),
        };
        Ok(Self { must_exist, read, write, truncate, append, must_not_exist, binary })
    }

    pub fn from_flags(flags: OpenFlags) -> FsResult<Self> {
        let must_not_exist = flags.contains(OpenFlags::EXCL);
        let must_exist = !flags.contains(OpenFlags::CREAT);
        if must_not_exist && must_exist {
            return Err(FsError::invalid("", "O_EXCL requires O_CREAT"));
        }
        Ok(Self {
            must_exist,
            read: !flags.contains(OpenFlags::WRONLY),
            write: flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR),
            truncate: flags.contains(OpenFlags::TRUNC),
            append: flags.contains(OpenFlags::APPEND),
            must_not_exist,
            binary: true,
        })
    }
}

bitflags! {
    /// Flags of [`FsCore::os_open`], numbered as on Linux
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        /// Delete the file when its descriptor is closed
        const TEMPORARY = 0o20000000;
    }
}

impl OpenFlags {
    pub const RDONLY: Self = Self::empty();
}

/// Options of [`FsCore::open`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenOptions {
    pub mode: String,
    /// -1 for the default buffer size, 0 for unbuffered (binary only),
    /// 1 for line buffering (text only), otherwise the buffer size
    pub buffering: i64,
    pub encoding: Option<String>,
    /// `None` translates newlines; `""` leaves them alone
    pub newline: Option<String>,
    pub closefd: bool,
    pub delete_on_close: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: "r".to_string(),
            buffering: -1,
            encoding: None,
            newline: None,
            closefd: true,
            delete_on_close: false,
        }
    }
}

impl OpenOptions {
    pub fn new(mode: &str) -> Self {
        Self { mode: mode.to_string(), ..Self::default() }
    }

    pub fn with_buffering(mut self, buffering: i64) -> Self {
        self.buffering = buffering;
        self
    }

    pub fn with_encoding(mut self, encoding: &str) -> Self {
        self.encoding = Some(encoding.to_string());
        self
    }

    pub fn with_newline(mut self, newline: &str) -> Self {
        self.newline = Some(newline.to_string());
        self
    }

    pub fn with_closefd(mut self, closefd: bool) -> Self {
        self.closefd = closefd;
        self
    }

    pub fn with_delete_on_close(mut self, delete_on_close: bool) -> Self {
        self.delete_on_close = delete_on_close;
        self
    }

    fn validate(&self, mode: &OpenMode, by_path: bool) -> FsResult<()> {
        if by_path && !self.closefd {
            return Err(FsError::invalid(&self.mode, "cannot use closefd=false with a file name"));
        }
        if mode.binary {
            if self.encoding.is_some() {
                return Err(FsError::invalid(&self.mode, "binary mode doesn't take an encoding"));
            }
            if self.newline.is_some() {
                return Err(FsError::invalid(&self.mode, "binary mode doesn't take a newline"));
            }
            return Ok(());
        }
        if self.buffering == 0 {
            return Err(FsError::invalid(&self.mode, "can't have unbuffered text I/O"));
        }
        if let Some(encoding) = &self.encoding {
            let normalized = encoding.to_lowercase().replace(['-', '_'], "");
            if normalized != "utf8" && normalized != "u8" {
                return Err(FsError::invalid(encoding, "unsupported encoding"));
            }
        }
        if let Some(newline) = &self.newline {
            if !["", "\n", "\r", "\r\n"].contains(&newline.as_str()) {
                return Err(FsError::invalid(newline, "illegal newline value"));
            }
        }
        Ok(())
    }
}

/// What [`FsCore::open`] opens
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenTarget<'a> {
    Path(&'a str),
    /// Another handle on an already open descriptor
    Fd(Fd),
}

impl<'a> From<&'a str> for OpenTarget<'a> {
    fn from(path: &'a str) -> Self {
        OpenTarget::Path(path)
    }
}

impl From<Fd> for OpenTarget<'_> {
    fn from(fd: Fd) -> Self {
        OpenTarget::Fd(fd)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandleKind {
    File,
    Directory,
}

/// Read position of an append handle, resolved lazily against the buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadCursor {
    At(u64),
    FromEnd(i64),
}

#[derive(Clone, Debug)]
pub(crate) struct OpenFile {
    id: HandleId,
    fd: Fd,
    node: NodeId,
    path: String,
    kind: HandleKind,
    can_read: bool,
    can_write: bool,
    append: bool,
    binary: bool,
    raw: bool,
    buffer: Vec<u8>,
    /// Write position (and read position unless appending)
    pos: usize,
    read_cursor: ReadCursor,
    flush_pos: usize,
    epoch: u64,
    dirty: bool,
    buffer_size: usize,
    line_buffering: bool,
    newline: Option<String>,
    /// Content changed since open; Windows stamps mtime on close
    changed: bool,
    closefd: bool,
    delete_on_close: bool,
}

impl OpenFile {
    fn read_position(&self) -> usize {
        match self.read_cursor {
            ReadCursor::At(pos) => pos as usize,
            ReadCursor::FromEnd(offset) => (self.buffer.len() as i64 + offset).max(0) as usize,
        }
    }

    fn write_at_pos(&mut self, data: &[u8]) {
        let end = self.pos + data.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.pos..end].copy_from_slice(data);
        self.pos = end;
        self.dirty = true;
    }

    fn snapshot(&self) -> BufferState {
        BufferState {
            buffer: self.buffer.clone(),
            pos: self.pos,
            flush_pos: self.flush_pos,
            epoch: self.epoch,
            dirty: self.dirty,
        }
    }

    fn restore(&mut self, state: BufferState) {
        self.buffer = state.buffer;
        self.pos = state.pos;
        self.flush_pos = state.flush_pos;
        self.epoch = state.epoch;
        self.dirty = state.dirty;
    }
}

#[derive(Clone)]
struct BufferState {
    buffer: Vec<u8>,
    pos: usize,
    flush_pos: usize,
    epoch: u64,
    dirty: bool,
}

/// Open handles and the descriptors they are grouped under
#[derive(Debug, Default)]
pub(crate) struct OpenFileTable {
    handles: HashMap<HandleId, OpenFile>,
    slots: Vec<Option<Vec<HandleId>>>,
    free: BinaryHeap<Reverse<Fd>>,
    last_handle: u64,
}

impl OpenFileTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_handle_id(&mut self) -> HandleId {
        self.last_handle += 1;
        HandleId::new(self.last_handle)
    }

    fn allocate_fd(&mut self, handle: HandleId) -> Fd {
        if let Some(Reverse(fd)) = self.free.pop() {
            self.slots[fd as usize] = Some(vec![handle]);
            return fd;
        }
        if self.slots.len() < FIRST_FD as usize {
            self.slots.resize(FIRST_FD as usize, None);
        }
        self.slots.push(Some(vec![handle]));
        (self.slots.len() - 1) as Fd
    }

    fn slot_mut(&mut self, fd: Fd) -> FsResult<&mut Vec<HandleId>> {
        usize::try_from(fd)
            .ok()
            .and_then(|index| self.slots.get_mut(index))
            .and_then(Option::as_mut)
            .ok_or(FsError::BadDescriptor { fd: fd as i64 })
    }

    pub(crate) fn primary(&self, fd: Fd) -> FsResult<HandleId> {
        usize::try_from(fd)
            .ok()
            .and_then(|index| self.slots.get(index))
            .and_then(Option::as_ref)
            .and_then(|handles| handles.first().copied())
            .ok_or(FsError::BadDescriptor { fd: fd as i64 })
    }

    /// Handles sharing `fd`, in the order they were opened.
    fn handles_on_fd(&self, fd: Fd) -> Vec<HandleId> {
        usize::try_from(fd)
            .ok()
            .and_then(|index| self.slots.get(index))
            .and_then(Option::as_ref)
            .cloned()
            .unwrap_or_default()
    }

    /// Frees the descriptor and forgets every handle on it.
    fn release_fd(&mut self, fd: Fd) {
        let Some(slot) = usize::try_from(fd).ok().and_then(|index| self.slots.get_mut(index)) else {
            return;
        };
        if let Some(handles) = slot.take() {
            for handle in handles {
                self.handles.remove(&handle);
            }
            self.free.push(Reverse(fd));
        }
    }

    /// Drops one handle, releasing its descriptor if it was the last one.
    fn detach(&mut self, handle: HandleId, fd: Fd) {
        self.handles.remove(&handle);
        if let Ok(slot) = self.slot_mut(fd) {
            slot.retain(|h| *h != handle);
            if slot.is_empty() {
                self.release_fd(fd);
            }
        }
    }

    pub(crate) fn references(&self, node: NodeId) -> bool {
        self.handles.values().any(|f| f.node == node)
    }

    fn handles_on(&self, node: NodeId) -> Vec<HandleId> {
        self.handles.values().filter(|f| f.node == node).map(|f| f.id).collect()
    }

    fn get(&self, handle: HandleId) -> FsResult<&OpenFile> {
        self.handles.get(&handle).ok_or_else(closed_file)
    }

    fn take(&mut self, handle: HandleId) -> FsResult<OpenFile> {
        self.handles.remove(&handle).ok_or_else(closed_file)
    }

    fn put(&mut self, file: OpenFile) {
        self.handles.insert(file.id, file);
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }
}

fn closed_file() -> FsError {
    FsError::invalid("", "I/O operation on closed file")
}

fn replace_bytes(data: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut rest = data;
    while !rest.is_empty() {
        if rest.starts_with(from) {
            out.extend_from_slice(to);
            rest = &rest[from.len()..];
        } else {
            out.push(rest[0]);
            rest = &rest[1..];
        }
    }
    out
}

/// Length of the first line of `data`, terminator included.
fn line_length(data: &[u8], binary: bool, newline: Option<&str>) -> usize {
    let universal = !binary && newline.is_none();
    let carriage_return_only = !binary && newline == Some("\r");
    for (i, byte) in data.iter().enumerate() {
        match byte {
            b'\n' if !carriage_return_only => return i + 1,
            b'\r' if carriage_return_only => return i + 1,
            b'\r' if universal => {
                let crlf = data.get(i + 1) == Some(&b'\n');
                return if crlf { i + 2 } else { i + 1 };
            }
            _ => {}
        }
    }
    data.len()
}

impl FsCore {
    pub fn open(&mut self, target: OpenTarget<'_>, options: &OpenOptions) -> FsResult<HandleId> {
        let mode = OpenMode::parse(&options.mode)?;
        self.open_with_mode(target, mode, options, None, false)
    }

    fn open_with_mode(
        &mut self,
        target: OpenTarget<'_>,
        mode: OpenMode,
        options: &OpenOptions,
        create_perm: Option<u32>,
        raw: bool,
    ) -> FsResult<HandleId> {
        options.validate(&mode, matches!(target, OpenTarget::Path(_)))?;
        let (existing, path, shared_fd, allow_update, delete_on_close) = match target {
            OpenTarget::Fd(fd) => {
                let file = self.open_files.get(self.open_files.primary(fd)?)?;
                (Some(file.node), file.path.clone(), Some(fd), file.can_write, file.delete_on_close)
            }
            OpenTarget::Path(path) => {
                self.check_path_arg(path)?;
                let node = if self.exists(path)? { Some(self.resolve(path, true)?) } else { None };
                (node, path.to_string(), None, true, options.delete_on_close)
            }
        };
        if mode.must_not_exist && (existing.is_some() || (!self.windows() && self.is_link(&path))) {
            return Err(FsError::already_exists(&path));
        }
        let node = match existing {
            Some(id) => {
                self.check_open_existing(id, &path, &mode)?;
                id
            }
            None if mode.must_exist => return Err(FsError::not_found(&path)),
            None => self.create_for_open(&path, create_perm)?,
        };
        if mode.truncate && shared_fd.is_none() {
            self.store_contents(node, Vec::new(), &path)?;
            let (now, windows) = (self.now(), self.windows());
            let stat = &mut self.node_mut(node)?.stat;
            stat.mtime_ns = now;
            if !windows {
                stat.ctime_ns = now;
            }
        }

        let node_ref = self.node(node)?;
        let buffer = node_ref.contents().map(<[u8]>::to_vec).unwrap_or_default();
        let epoch = node_ref.epoch();
        let buffer_size = match options.buffering {
            _ if raw => 0,
            n if n < 0 || n == 1 => DEFAULT_BUFFER_SIZE,
            n => n as usize,
        };
        let id = self.open_files.next_handle_id();
        let mut file = OpenFile {
            id,
            fd: 0,
            node,
            path,
            kind: HandleKind::File,
            can_read: mode.read,
            can_write: mode.write && allow_update,
            append: mode.append,
            binary: mode.binary,
            raw,
            pos: if mode.append { buffer.len() } else { 0 },
            read_cursor: ReadCursor::At(0),
            flush_pos: buffer.len(),
            buffer,
            epoch,
            dirty: false,
            buffer_size,
            line_buffering: options.buffering == 1 && !mode.binary,
            newline: options.newline.clone(),
            changed: false,
            closefd: options.closefd,
            delete_on_close,
        };
        file.fd = match shared_fd {
            Some(fd) => {
                self.open_files.slot_mut(fd)?.push(id);
                fd
            }
            None => self.open_files.allocate_fd(id),
        };
        trace!(handle = id.0, fd = file.fd, path = %file.path, mode = %options.mode, "opened file");
        self.open_files.put(file);
        Ok(id)
    }

    fn check_open_existing(&self, id: NodeId, path: &str, mode: &OpenMode) -> FsResult<()> {
        let node = self.node(id)?;
        if node.is_dir() {
            return Err(if self.windows() {
                FsError::permission_denied(path)
            } else {
                FsError::is_a_directory(path)
            });
        }
        if self.is_root_identity() {
            return Ok(());
        }
        let denied = if self.windows() {
            mode.write && node.stat.mode & PERM_WRITE == 0
        } else {
            (mode.read && !node.stat.has_permission(PERM_READ, self.uid, self.gid))
                || (mode.write && !node.stat.has_permission(PERM_WRITE, self.uid, self.gid))
        };
        if denied {
            return Err(FsError::permission_denied(path));
        }
        Ok(())
    }

    fn create_for_open(&mut self, path: &str, create_perm: Option<u32>) -> FsResult<NodeId> {
        if self.syntax.ends_with_separator(path) {
            return Err(if self.windows() {
                FsError::invalid(path, "trailing separator")
            } else if self.macos() {
                FsError::not_found(path)
            } else {
                FsError::is_a_directory(path)
            });
        }
        // a dangling symlink creates its target
        let real_path = self.resolve_path(path, true)?;
        let file = NewFile::default()
            .perm(create_perm.unwrap_or(PERM_DEF_FILE))
            .missing_dirs(false)
            .umask(true);
        self.create_file(&real_path, file)
    }

    fn with_open_file<T>(
        &mut self,
        handle: HandleId,
        op: impl FnOnce(&mut Self, &mut OpenFile) -> FsResult<T>,
    ) -> FsResult<T> {
        let mut file = self.open_files.take(handle)?;
        let result = op(self, &mut file);
        self.open_files.put(file);
        result
    }

    fn check_io(&self, file: &OpenFile) -> FsResult<()> {
        if file.kind == HandleKind::Directory {
            return Err(FsError::is_a_directory(&file.path));
        }
        if self.node(file.node)?.is_large_file() {
            return Err(FsError::LargeFile { path: file.path.clone() });
        }
        Ok(())
    }

    /// Reloads the buffer if another handle changed the node. Append
    /// handles keep their unflushed tail on top of the new contents.
    fn sync_io(&self, file: &mut OpenFile) {
        let Some(node) = self.nodes.get(&file.node) else {
            return;
        };
        if node.epoch() == file.epoch {
            return;
        }
        let contents = node.contents().unwrap_or_default().to_vec();
        if file.append {
            let tail = file.buffer.get(file.flush_pos..).map(<[u8]>::to_vec).unwrap_or_default();
            file.buffer = contents;
            file.flush_pos = file.buffer.len();
            file.buffer.extend_from_slice(&tail);
            file.pos = file.buffer.len();
        } else {
            file.buffer = contents;
        }
        file.epoch = node.epoch();
    }

    fn flush_file(&mut self, file: &mut OpenFile) -> FsResult<()> {
        if !file.can_write || file.kind == HandleKind::Directory || !file.dirty {
            return Ok(());
        }
        if self.node(file.node)?.is_large_file() {
            return Ok(());
        }
        if file.append {
            self.sync_io(file);
            file.pos = file.buffer.len();
        }
        let changed = self.store_contents(file.node, file.buffer.clone(), &file.path)?;
        file.flush_pos = file.pos;
        file.dirty = false;
        if changed {
            if self.windows() {
                file.changed = true;
            } else {
                let now = self.now();
                self.node_mut(file.node)?.stat.touch_modified(now);
            }
        }
        file.epoch = self.node(file.node)?.epoch();
        if changed {
            self.sync_appenders(file.node);
        }
        trace!(handle = file.id.0, size = file.buffer.len(), "flushed");
        Ok(())
    }

    fn sync_appenders(&mut self, node: NodeId) {
        for handle in self.open_files.handles_on(node) {
            if let Ok(mut other) = self.open_files.take(handle) {
                if other.append {
                    self.sync_io(&mut other);
                }
                self.open_files.put(other);
            }
        }
    }

    fn touch_access(&mut self, node: NodeId) {
        if self.windows() {
            return;
        }
        let now = self.now();
        if let Ok(node) = self.node_mut(node) {
            node.stat.atime_ns = now;
        }
    }

    fn translate_read(&self, file: &OpenFile, data: Vec<u8>) -> Vec<u8> {
        if file.binary || file.newline.is_some() {
            return data;
        }
        replace_bytes(&replace_bytes(&data, b"\r\n", b"\n"), b"\r", b"\n")
    }

    fn translate_write(&self, file: &OpenFile, data: &[u8]) -> Vec<u8> {
        if file.binary {
            return data.to_vec();
        }
        match file.newline.as_deref() {
            None if self.windows() => replace_bytes(data, b"\n", b"\r\n"),
            None | Some("") | Some("\n") => data.to_vec(),
            Some(newline) => replace_bytes(data, b"\n", newline.as_bytes()),
        }
    }

    /// Common preamble of the read operations. Returns false when the
    /// handle is not readable but the request is empty.
    fn prepare_read(&mut self, file: &mut OpenFile, requested: Option<usize>) -> FsResult<bool> {
        self.check_io(file)?;
        if !file.can_read {
            if requested == Some(0) {
                return Ok(false);
            }
            return Err(FsError::unsupported("File not open for reading"));
        }
        self.flush_file(file)?;
        self.sync_io(file);
        self.touch_access(file.node);
        Ok(true)
    }

    fn consume(&self, file: &mut OpenFile, length: impl FnOnce(&[u8]) -> usize) -> Vec<u8> {
        let start = if file.append { file.read_position() } else { file.pos };
        let available = file.buffer.get(start..).unwrap_or_default();
        let end = start + length(available).min(available.len());
        let data = file.buffer.get(start..end).unwrap_or_default().to_vec();
        if file.append {
            file.read_cursor = ReadCursor::At(end as u64);
        } else {
            file.pos = end;
        }
        self.translate_read(file, data)
    }

    /// Reads up to `size` bytes, or everything left when `None`.
    pub fn read(&mut self, handle: HandleId, size: Option<usize>) -> FsResult<Vec<u8>> {
        self.with_open_file(handle, |fs, file| {
            if !fs.prepare_read(file, size)? {
                return Ok(Vec::new());
            }
            let data = fs.consume(file, |rest| size.unwrap_or(rest.len()));
            trace!(handle = handle.0, len = data.len(), "read");
            Ok(data)
        })
    }

    pub fn read_to_end(&mut self, handle: HandleId) -> FsResult<Vec<u8>> {
        self.read(handle, None)
    }

    /// Reads one line, terminator included, at most `limit` bytes.
    pub fn readline(&mut self, handle: HandleId, limit: Option<usize>) -> FsResult<Vec<u8>> {
        self.with_open_file(handle, |fs, file| {
            if !fs.prepare_read(file, limit)? {
                return Ok(Vec::new());
            }
            let (binary, newline) = (file.binary, file.newline.clone());
            Ok(fs.consume(file, |rest| {
                let line = line_length(rest, binary, newline.as_deref());
                limit.map_or(line, |limit| line.min(limit))
            }))
        })
    }

    pub fn readlines(&mut self, handle: HandleId) -> FsResult<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        loop {
            let line = self.readline(handle, None)?;
            if line.is_empty() {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    /// Buffers `data`, flushing once the unflushed part outgrows the buffer
    /// or, with line buffering, on a newline. If the flush runs out of
    /// space the write is undone.
    pub fn write(&mut self, handle: HandleId, data: &[u8]) -> FsResult<usize> {
        self.with_open_file(handle, |fs, file| {
            fs.check_io(file)?;
            if !file.can_write {
                return Err(FsError::unsupported("File not open for writing"));
            }
            let bytes = fs.translate_write(file, data);
            if file.append {
                file.pos = file.buffer.len();
            }
            let before = file.snapshot();
            let old_pos = file.pos;
            file.write_at_pos(&bytes);
            let line_flush = file.line_buffering && bytes.contains(&b'\n');
            if file.pos.saturating_sub(file.flush_pos) > file.buffer_size || line_flush {
                let flush_all = file.pos - old_pos > file.buffer_size || line_flush;
                if !flush_all {
                    // flush what was buffered before, keep this write buffered
                    file.restore(before.clone());
                }
                if let Err(err) = fs.flush_file(file) {
                    file.restore(before);
                    return Err(err);
                }
                if !flush_all {
                    file.write_at_pos(&bytes);
                }
            }
            trace!(handle = handle.0, len = data.len(), "write");
            Ok(data.len())
        })
    }

    pub fn seek(&mut self, handle: HandleId, position: SeekFrom) -> FsResult<u64> {
        self.with_open_file(handle, |fs, file| {
            fs.flush_file(file)?;
            fs.sync_io(file);
            let path = file.path.clone();
            let invalid = || FsError::invalid(&path, "negative seek position");
            if file.append {
                file.read_cursor = match position {
                    SeekFrom::Start(offset) => ReadCursor::At(offset),
                    SeekFrom::Current(delta) => {
                        let target = file.read_position() as i64 + delta;
                        ReadCursor::At(u64::try_from(target).map_err(|_| invalid())?)
                    }
                    SeekFrom::End(delta) if file.buffer.len() as i64 + delta < 0 => {
                        return Err(invalid())
                    }
                    SeekFrom::End(delta) => ReadCursor::FromEnd(delta),
                };
                return Ok(file.read_position() as u64);
            }
            let target = match position {
                SeekFrom::Start(offset) => i64::try_from(offset).unwrap_or(i64::MAX),
                SeekFrom::Current(delta) => file.pos as i64 + delta,
                SeekFrom::End(delta) => file.buffer.len() as i64 + delta,
            };
            file.pos = usize::try_from(target).map_err(|_| invalid())?;
            file.flush_pos = file.flush_pos.min(file.pos);
            Ok(file.pos as u64)
        })
    }

    pub fn tell(&mut self, handle: HandleId) -> FsResult<u64> {
        self.with_open_file(handle, |fs, file| {
            fs.flush_file(file)?;
            let position = if file.append { file.read_position() } else { file.pos };
            Ok(position as u64)
        })
    }

    pub fn flush(&mut self, handle: HandleId) -> FsResult<()> {
        self.with_open_file(handle, |fs, file| fs.flush_file(file))
    }

    /// Truncates (or extends with NUL bytes) to `size`, defaulting to the
    /// current position. The position itself does not move.
    ///
    /// The handle's own buffer is stored before resizing, without first
    /// picking up content flushed by other handles, so a non-append handle
    /// writes back what it last saw. Append handles on the same file have
    /// their read cursors moved past the bytes a growing truncate adds.
    pub fn truncate(&mut self, handle: HandleId, size: Option<u64>) -> FsResult<u64> {
        self.with_open_file(handle, |fs, file| {
            fs.check_io(file)?;
            if !file.can_write {
                return Err(FsError::unsupported("File not open for writing"));
            }
            let current = if file.append { file.read_position() } else { file.pos };
            let size = size.map_or(current, |s| s as usize);
            file.buffer.truncate(size);
            file.dirty = true;
            fs.flush_file(file)?;
            fs.apply_size(file.node, size as u64, &file.path)?;

            let buffered = file.buffer.len();
            if buffered < size {
                file.buffer.resize(size, 0);
                file.flush_pos = size;
                let grown = (size - buffered) as u64;
                for other in fs.open_files.handles_on(file.node) {
                    if let Ok(mut other_file) = fs.open_files.take(other) {
                        if let (true, ReadCursor::At(pos)) = (other_file.append, other_file.read_cursor) {
                            other_file.read_cursor = ReadCursor::At(pos + grown);
                        }
                        fs.open_files.put(other_file);
                    }
                }
            } else {
                file.buffer.truncate(size);
            }
            if file.append {
                file.pos = file.buffer.len();
                file.flush_pos = file.pos;
            }
            let now = fs.now();
            let windows = fs.windows();
            let node = fs.node_mut(file.node)?;
            if windows {
                file.changed = true;
            } else {
                node.stat.touch_modified(now);
            }
            file.epoch = node.epoch();
            Ok(size as u64)
        })
    }

    /// Closes a handle: flushes, releases the descriptor (unless opened
    /// with `closefd` off) and deletes the file if requested. Closing twice
    /// is a no-op.
    pub fn close(&mut self, handle: HandleId) -> FsResult<()> {
        match self.open_files.get(handle) {
            Ok(file) => {
                let release = file.closefd;
                self.close_handle(handle, release)
            }
            Err(_) => Ok(()),
        }
    }

    fn close_handle(&mut self, handle: HandleId, release_fd: bool) -> FsResult<()> {
        let mut file = self.open_files.take(handle)?;
        let flush_result = if file.raw { Ok(()) } else { self.flush_file(&mut file) };
        if self.windows() && file.changed {
            let now = self.now();
            if let Ok(node) = self.node_mut(file.node) {
                node.stat.mtime_ns = now;
            }
        }
        if release_fd {
            for other in self.open_files.handles_on_fd(file.fd).into_iter().filter(|h| *h != handle) {
                if let Err(err) = self.flush(other) {
                    warn!(handle = other.0, error = %err, "flush of shared descriptor failed");
                }
            }
            self.open_files.release_fd(file.fd);
        } else {
            self.open_files.detach(handle, file.fd);
        }
        trace!(handle = handle.0, fd = file.fd, "closed file");

        let mut result = flush_result;
        if file.delete_on_close {
            if let Ok(path) = self.node_path(file.node) {
                let removed = self.remove_object(&path);
                result = result.and(removed);
            }
        }
        self.reap_if_orphaned(file.node);
        result
    }

    pub fn fileno(&self, handle: HandleId) -> FsResult<Fd> {
        Ok(self.open_files.get(handle)?.fd)
    }

    pub fn is_closed(&self, handle: HandleId) -> bool {
        self.open_files.get(handle).is_err()
    }

    /// Path the handle was opened with.
    pub fn handle_path(&self, handle: HandleId) -> FsResult<String> {
        Ok(self.open_files.get(handle)?.path.clone())
    }

    pub fn open_handle_count(&self) -> usize {
        self.open_files.len()
    }

    /// Low-level open returning a descriptor. I/O through it is unbuffered
    /// and binary. `perm` (umask applied) is used only if the file is
    /// created.
    pub fn os_open(&mut self, path: &str, flags: OpenFlags, perm: Option<u32>) -> FsResult<Fd> {
        let mode = OpenMode::from_flags(flags)?;
        self.check_path_arg(path)?;
        if !self.windows() && self.exists(path)? {
            let id = self.resolve(path, true)?;
            if self.node(id)?.is_dir() {
                if (!mode.must_exist && !self.macos()) || mode.write {
                    return Err(FsError::is_a_directory(path));
                }
                return Ok(self.open_directory(id, path));
            }
        }
        let default_perm = if self.windows() { PERM_DEF_FILE } else { PERM_DEF };
        let options = OpenOptions {
            mode: String::new(),
            buffering: 0,
            delete_on_close: flags.contains(OpenFlags::TEMPORARY),
            ..OpenOptions::default()
        };
        let handle = self.open_with_mode(
            OpenTarget::Path(path),
            mode,
            &options,
            Some(perm.unwrap_or(default_perm)),
            true,
        )?;
        self.fileno(handle)
    }

    fn open_directory(&mut self, node: NodeId, path: &str) -> Fd {
        let id = self.open_files.next_handle_id();
        let fd = self.open_files.allocate_fd(id);
        self.open_files.put(OpenFile {
            id,
            fd,
            node,
            path: path.to_string(),
            kind: HandleKind::Directory,
            can_read: false,
            can_write: false,
            append: false,
            binary: true,
            raw: true,
            buffer: Vec::new(),
            pos: 0,
            read_cursor: ReadCursor::At(0),
            flush_pos: 0,
            epoch: 0,
            dirty: false,
            buffer_size: 0,
            line_buffering: false,
            newline: None,
            changed: false,
            closefd: true,
            delete_on_close: false,
        });
        trace!(fd, path, "opened directory");
        fd
    }

    pub fn fd_read(&mut self, fd: Fd, size: usize) -> FsResult<Vec<u8>> {
        let handle = self.open_files.primary(fd)?;
        self.read(handle, Some(size))
    }

    pub fn fd_write(&mut self, fd: Fd, data: &[u8]) -> FsResult<usize> {
        let handle = self.open_files.primary(fd)?;
        self.write(handle, data)
    }

    pub fn fd_seek(&mut self, fd: Fd, position: SeekFrom) -> FsResult<u64> {
        let handle = self.open_files.primary(fd)?;
        self.seek(handle, position)
    }

    /// Closes a descriptor and every handle on it.
    pub fn fd_close(&mut self, fd: Fd) -> FsResult<()> {
        let handle = self.open_files.primary(fd)?;
        self.close_handle(handle, true)
    }

    pub fn ftruncate(&mut self, fd: Fd, length: u64) -> FsResult<()> {
        let handle = self.open_files.primary(fd)?;
        self.truncate(handle, Some(length)).map(|_| ())
    }

    pub fn fsync(&mut self, fd: Fd) -> FsResult<()> {
        let handle = self.open_files.primary(fd)?;
        self.flush(handle)
    }

    pub fn fstat(&self, fd: Fd) -> FsResult<StatResult> {
        let file = self.open_files.get(self.open_files.primary(fd)?)?;
        Ok(self.node(file.node)?.stat.to_result(self.stat_float_times, self.windows()))
    }
}
