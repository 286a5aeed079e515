// Raw cache file: densely packed native-endian f64 elements addressed by byte ranges.
// The file carries no header; interpretation lives entirely in caller-held ranges.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind, Result};

pub const ELEMENT_SIZE: u64 = std::mem::size_of::<f64>() as u64;

/// A `(start, length)` pair addressing one vector inside a cache file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct ByteRange {
    pub start_byte: u64,
    pub num_bytes: u64,
}

impl ByteRange {
    pub fn new(start_byte: u64, num_bytes: u64) -> Self {
        debug_assert!(num_bytes % ELEMENT_SIZE == 0, "byte range must hold whole elements");
        Self {
            start_byte,
            num_bytes,
        }
    }

    pub fn for_elements(start_byte: u64, elements: usize) -> Self {
        Self::new(start_byte, elements as u64 * ELEMENT_SIZE)
    }

    pub fn len(&self) -> usize {
        (self.num_bytes / ELEMENT_SIZE) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.num_bytes == 0
    }

    pub fn end_byte(&self) -> u64 {
        self.start_byte + self.num_bytes
    }

    pub fn element_offset(&self, idx: usize) -> u64 {
        self.start_byte + idx as u64 * ELEMENT_SIZE
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

impl OpenMode {
    fn covers(self, wanted: OpenMode) -> bool {
        self == OpenMode::ReadWrite || wanted == OpenMode::ReadOnly
    }
}

#[derive(Debug)]
pub struct CacheFile {
    path: PathBuf,
    handle: Option<(File, OpenMode)>,
    removed: bool,
}

impl CacheFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handle: None,
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Current file length in bytes, 0 when the file does not exist yet.
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path)
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    /// Opens the file unless an already-open handle covers `mode`.
    pub fn smart_open(&mut self, mode: OpenMode) -> Result<()> {
        if self.removed {
            return Err(Error::new(ErrorKind::Io)
                .with_message("cache file has been removed")
                .with_path(&self.path));
        }
        if let Some((_, open_mode)) = &self.handle {
            if open_mode.covers(mode) {
                return Ok(());
            }
            return Err(Error::new(ErrorKind::Io)
                .with_message("cache file is already open read-only")
                .with_path(&self.path));
        }

        let mut options = OpenOptions::new();
        options.read(true);
        if mode == OpenMode::ReadWrite {
            options.write(true).create(true);
        }
        let file = options.open(&self.path).map_err(|err| self.io_error(err))?;
        self.handle = Some((file, mode));
        Ok(())
    }

    pub fn close(&mut self) {
        self.handle = None;
    }

    /// Writes `bytes` at end-of-file and returns the offset they start at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let path = self.path.clone();
        let file = self.writable()?;
        let start = file
            .seek(SeekFrom::End(0))
            .map_err(|err| io_error(&path, err))?;
        file.write_all(bytes)
            .map_err(|err| io_error(&path, err).with_offset(start))?;
        Ok(start)
    }

    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let path = self.path.clone();
        let file = self.writable()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| io_error(&path, err).with_offset(offset))?;
        file.write_all(bytes)
            .map_err(|err| io_error(&path, err).with_offset(offset))?;
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let path = self.path.clone();
        let (file, _) = self.handle.as_mut().ok_or_else(|| not_open(&path))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| io_error(&path, err).with_offset(offset))?;
        file.read_exact(buf).map_err(|err| {
            let short = err.kind() == io::ErrorKind::UnexpectedEof;
            let err = io_error(&path, err).with_offset(offset);
            if short { err.with_message("short read") } else { err }
        })?;
        Ok(())
    }

    /// Closes any open handle and deletes the file. Returns whether a file was removed.
    pub fn remove(&mut self) -> io::Result<bool> {
        self.close();
        if self.removed {
            return Ok(false);
        }
        self.removed = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn writable(&mut self) -> Result<&mut File> {
        match &mut self.handle {
            Some((file, OpenMode::ReadWrite)) => Ok(file),
            Some((_, OpenMode::ReadOnly)) => Err(Error::new(ErrorKind::Io)
                .with_message("cache file is open read-only")
                .with_path(&self.path)),
            None => Err(not_open(&self.path)),
        }
    }

    fn io_error(&self, err: io::Error) -> Error {
        io_error(&self.path, err)
    }
}

fn io_error(path: &Path, err: io::Error) -> Error {
    Error::new(ErrorKind::Io).with_path(path).with_source(err)
}

fn not_open(path: &Path) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("cache file is not open")
        .with_path(path)
}

/// Reads elements from an existing cache file without taking ownership of it.
/// `num_bytes` of `None` reads to end of file.
pub fn read_file_range(path: &Path, start_byte: u64, num_bytes: Option<u64>) -> Result<(ByteRange, Vec<f64>)> {
    if !path.exists() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("cache file does not exist")
            .with_path(path));
    }
    let mut file = CacheFile::new(path);
    let size = file.size_bytes();
    if start_byte > size {
        return Err(Error::new(ErrorKind::IndexOutOfRange)
            .with_message(format!("start byte is past end of file ({size} bytes)"))
            .with_path(path)
            .with_offset(start_byte));
    }
    let num_bytes = num_bytes.unwrap_or(size - start_byte);
    if start_byte % ELEMENT_SIZE != 0 || num_bytes % ELEMENT_SIZE != 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("byte range must be aligned to whole elements")
            .with_path(path)
            .with_offset(start_byte));
    }

    if start_byte
        .checked_add(num_bytes)
        .is_none_or(|end| end > size)
    {
        return Err(Error::new(ErrorKind::Io)
            .with_message("short read")
            .with_path(path)
            .with_offset(start_byte));
    }

    let range = ByteRange::new(start_byte, num_bytes);
    let mut bytes = vec![0u8; num_bytes as usize];
    if !bytes.is_empty() {
        file.smart_open(OpenMode::ReadOnly)?;
        file.read_at(start_byte, &mut bytes)?;
        file.close();
    }
    let mut values = Vec::new();
    decode_elements(&bytes, &mut values);
    Ok((range, values))
}

pub fn encode_elements(data: &[f64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() * ELEMENT_SIZE as usize);
    for value in data {
        buf.extend_from_slice(&value.to_ne_bytes());
    }
    buf
}

pub fn decode_elements(bytes: &[u8], out: &mut Vec<f64>) {
    out.clear();
    out.reserve(bytes.len() / ELEMENT_SIZE as usize);
    for chunk in bytes.chunks_exact(ELEMENT_SIZE as usize) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        out.push(f64::from_ne_bytes(raw));
    }
}
