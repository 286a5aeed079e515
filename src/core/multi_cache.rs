//! Purpose: Share one cache file between many vectors logged in the same generation.
//! Exports: `MultiDataVectorCache`, `CacheSubscription`, `CheckedOutVector`, `ReturnRejected`, `Session`.
//! Role: Owns the file handle, batch sessions, the checkout table and subscriber counting.
//! Invariants: A failed call records the last error and leaves ranges and checkouts untouched.
//! Invariants: The file is deleted when the last subscription drops, or when the cache drops.
//! Invariants: Checkouts are keyed by loan id, never by byte range; overlapping loans are not detected.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::core::cache_file::{
    ByteRange, CacheFile, ELEMENT_SIZE, OpenMode, decode_elements, encode_elements,
};
use crate::core::error::{Error, ErrorKind, Result};

/// Batch session keeping the file handle open across calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Session {
    None,
    MultiAppend,
    MultiReadWrite,
    MultiRead,
}

impl Session {
    fn open_mode(self) -> OpenMode {
        match self {
            Session::MultiRead => OpenMode::ReadOnly,
            _ => OpenMode::ReadWrite,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CheckoutId(u64);

// Process-wide so a loan from one cache never matches an entry in another.
static NEXT_CHECKOUT_ID: AtomicU64 = AtomicU64::new(1);

impl CheckoutId {
    fn next() -> Self {
        Self(NEXT_CHECKOUT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An in-memory copy of a cached range, on loan until returned or abandoned.
#[derive(Debug)]
pub struct CheckedOutVector {
    id: CheckoutId,
    data: Vec<f64>,
}

impl CheckedOutVector {
    pub fn id(&self) -> CheckoutId {
        self.id
    }
}

impl Deref for CheckedOutVector {
    type Target = Vec<f64>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for CheckedOutVector {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

/// A refused write-back; the loan is handed back so the caller can fix it up or abandon it.
#[derive(Debug)]
pub struct ReturnRejected {
    error: Error,
    vector: CheckedOutVector,
}

impl ReturnRejected {
    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn into_parts(self) -> (Error, CheckedOutVector) {
        (self.error, self.vector)
    }
}

impl From<ReturnRejected> for Error {
    fn from(rejected: ReturnRejected) -> Self {
        rejected.error
    }
}

#[derive(Debug)]
struct CacheState {
    file: CacheFile,
    session: Session,
    checkouts: HashMap<CheckoutId, ByteRange>,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct MultiDataVectorCache {
    state: RefCell<CacheState>,
    subscribers: Cell<usize>,
}

impl MultiDataVectorCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            state: RefCell::new(CacheState {
                file: CacheFile::new(path),
                session: Session::None,
                checkouts: HashMap::new(),
                last_error: None,
            }),
            subscribers: Cell::new(0),
        }
    }

    pub fn shared(path: impl Into<PathBuf>) -> Rc<Self> {
        Rc::new(Self::new(path))
    }

    pub fn path(&self) -> PathBuf {
        self.state.borrow().file.path().to_path_buf()
    }

    /// Size of the backing file in bytes, including abandoned ranges.
    pub fn cache_size(&self) -> u64 {
        self.state.borrow().file.size_bytes()
    }

    pub fn session(&self) -> Session {
        self.state.borrow().session
    }

    pub fn is_removed(&self) -> bool {
        self.state.borrow().file.is_removed()
    }

    pub fn num_subscribers(&self) -> usize {
        self.subscribers.get()
    }

    pub fn num_checked_out(&self) -> usize {
        self.state.borrow().checkouts.len()
    }

    pub fn has_error(&self) -> bool {
        self.state.borrow().last_error.is_some()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.borrow().last_error.clone()
    }

    pub fn take_error(&self) -> Option<String> {
        self.state.borrow_mut().last_error.take()
    }

    /// Appends `data` at end of file and returns the range it now occupies.
    pub fn append_vector(&self, data: &[f64]) -> Result<ByteRange> {
        if data.is_empty() {
            return Err(self.record(
                Error::new(ErrorKind::Usage).with_message("cannot append an empty vector"),
            ));
        }
        let bytes = encode_elements(data);
        self.with_file(OpenMode::ReadWrite, |file| {
            let start = file.append(&bytes)?;
            Ok(ByteRange::new(start, bytes.len() as u64))
        })
    }

    /// Writes `data` starting at `start_byte`; callers keep it inside their own allocation.
    pub fn overwrite_range(&self, start_byte: u64, data: &[f64]) -> Result<u64> {
        let bytes = encode_elements(data);
        self.with_file(OpenMode::ReadWrite, |file| {
            file.write_at(start_byte, &bytes)?;
            Ok(bytes.len() as u64)
        })
    }

    pub fn read_range(&self, start_byte: u64, num_bytes: u64) -> Result<Vec<f64>> {
        let mut out = Vec::new();
        self.copy_data_to(start_byte, num_bytes, &mut out)?;
        Ok(out)
    }

    /// Reads exactly `num_bytes` into `out`, replacing its contents.
    pub fn copy_data_to(&self, start_byte: u64, num_bytes: u64, out: &mut Vec<f64>) -> Result<()> {
        if num_bytes % ELEMENT_SIZE != 0 {
            return Err(self.record(
                Error::new(ErrorKind::Usage)
                    .with_message("byte count is not a whole number of elements")
                    .with_offset(start_byte),
            ));
        }
        if num_bytes == 0 && !self.is_removed() {
            out.clear();
            return Ok(());
        }
        // Checked against the file before the buffer is sized from caller input.
        let available = self.cache_size();
        if start_byte
            .checked_add(num_bytes)
            .is_none_or(|end| end > available)
        {
            let message = if self.is_removed() {
                "cache file has been removed"
            } else {
                "short read"
            };
            return Err(self.record(
                Error::new(ErrorKind::Io)
                    .with_message(message)
                    .with_offset(start_byte),
            ));
        }
        let mut bytes = vec![0u8; num_bytes as usize];
        self.with_file(OpenMode::ReadOnly, |file| file.read_at(start_byte, &mut bytes))?;
        decode_elements(&bytes, out);
        Ok(())
    }

    pub fn peek(&self, byte: u64) -> Result<f64> {
        let mut raw = [0u8; ELEMENT_SIZE as usize];
        self.with_file(OpenMode::ReadOnly, |file| file.read_at(byte, &mut raw))?;
        Ok(f64::from_ne_bytes(raw))
    }

    pub fn poke(&self, byte: u64, value: f64) -> Result<()> {
        self.with_file(OpenMode::ReadWrite, |file| {
            file.write_at(byte, &value.to_ne_bytes())
        })
    }

    pub fn begin_multi_append(&self) -> Result<()> {
        self.begin_session(Session::MultiAppend)
    }

    pub fn end_multi_append(&self) {
        self.end_session(Session::MultiAppend);
    }

    pub fn begin_multi_read_write(&self) -> Result<()> {
        self.begin_session(Session::MultiReadWrite)
    }

    pub fn end_multi_read_write(&self) {
        self.end_session(Session::MultiReadWrite);
    }

    pub fn begin_multi_read(&self) -> Result<()> {
        self.begin_session(Session::MultiRead)
    }

    pub fn end_multi_read(&self) {
        self.end_session(Session::MultiRead);
    }

    /// Copies a range into memory and registers it as on loan.
    pub fn checkout(&self, start_byte: u64, num_bytes: u64) -> Result<CheckedOutVector> {
        let data = self.read_range(start_byte, num_bytes)?;
        let id = CheckoutId::next();
        self.state
            .borrow_mut()
            .checkouts
            .insert(id, ByteRange::new(start_byte, num_bytes));
        Ok(CheckedOutVector { id, data })
    }

    /// Writes a loan back to the range it came from and closes the loan.
    ///
    /// The loan must still hold exactly as many elements as were checked out. A
    /// rejected return leaves the checkout registered and hands the vector back.
    pub fn return_vector(&self, vector: CheckedOutVector) -> Result<(), ReturnRejected> {
        let range = self.state.borrow().checkouts.get(&vector.id).copied();
        let Some(range) = range else {
            let error = self.record(
                Error::new(ErrorKind::NotCheckedOut)
                    .with_message("vector has not been checked out from this cache"),
            );
            return Err(ReturnRejected { error, vector });
        };

        let returned_bytes = vector.len() as u64 * ELEMENT_SIZE;
        if returned_bytes != range.num_bytes {
            let error = self.record(
                Error::new(ErrorKind::SizeMismatch)
                    .with_message(format!(
                        "returned {returned_bytes} bytes for a {} byte checkout",
                        range.num_bytes
                    ))
                    .with_offset(range.start_byte),
            );
            return Err(ReturnRejected { error, vector });
        }

        if let Err(error) = self.overwrite_range(range.start_byte, &vector.data) {
            return Err(ReturnRejected { error, vector });
        }
        self.state.borrow_mut().checkouts.remove(&vector.id);
        Ok(())
    }

    /// Drops a loan without writing it back. Returns whether it was registered.
    pub fn abandon_checkout(&self, vector: CheckedOutVector) -> bool {
        self.state
            .borrow_mut()
            .checkouts
            .remove(&vector.id)
            .is_some()
    }

    /// Registers a new subscriber; the file lives until the last subscription drops.
    pub fn subscribe(self: &Rc<Self>) -> CacheSubscription {
        self.subscribers.set(self.subscribers.get() + 1);
        CacheSubscription {
            cache: Rc::clone(self),
        }
    }

    fn unsubscribe(&self) {
        let current = self.subscribers.get();
        if current == 0 {
            warn!(path = %self.path().display(), "cache subscriber count underflow");
            return;
        }
        self.subscribers.set(current - 1);
        if current == 1 {
            self.remove_cache_file();
        }
    }

    fn remove_cache_file(&self) {
        let mut state = self.state.borrow_mut();
        state.session = Session::None;
        remove_file_logged(&mut state.file);
    }

    fn begin_session(&self, session: Session) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.session == session {
            return Ok(());
        }
        if state.session != Session::None {
            let err = Error::new(ErrorKind::Busy)
                .with_message(format!(
                    "cannot begin {session:?} while {:?} is active",
                    state.session
                ))
                .with_path(state.file.path());
            state.last_error = Some(err.to_string());
            return Err(err);
        }
        if let Err(err) = state.file.smart_open(session.open_mode()) {
            state.last_error = Some(err.to_string());
            return Err(err);
        }
        state.session = session;
        debug!(path = %state.file.path().display(), ?session, "cache session started");
        Ok(())
    }

    fn end_session(&self, session: Session) {
        let mut state = self.state.borrow_mut();
        if state.session == session {
            state.session = Session::None;
            state.file.close();
        }
    }

    fn with_file<T>(
        &self,
        mode: OpenMode,
        op: impl FnOnce(&mut CacheFile) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.borrow_mut();
        let result = match state.file.smart_open(mode) {
            Ok(()) => op(&mut state.file),
            Err(err) => Err(err),
        };
        if state.session == Session::None {
            state.file.close();
        }
        if let Err(err) = &result {
            state.last_error = Some(err.to_string());
        }
        result
    }

    fn record(&self, err: Error) -> Error {
        let err = match err.path() {
            Some(_) => err,
            None => err.with_path(self.path()),
        };
        self.state.borrow_mut().last_error = Some(err.to_string());
        err
    }
}

impl Drop for MultiDataVectorCache {
    fn drop(&mut self) {
        remove_file_logged(&mut self.state.get_mut().file);
    }
}

fn remove_file_logged(file: &mut CacheFile) {
    let path = file.path().to_path_buf();
    match file.remove() {
        Ok(true) => debug!(path = %path.display(), "removed cache file"),
        Ok(false) => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove cache file"),
    }
}

/// A counted reference to a shared cache; dropping the last one deletes the file.
#[derive(Debug)]
pub struct CacheSubscription {
    cache: Rc<MultiDataVectorCache>,
}

impl CacheSubscription {
    pub fn cache(&self) -> &Rc<MultiDataVectorCache> {
        &self.cache
    }

    pub fn is_same_cache(&self, other: &Rc<MultiDataVectorCache>) -> bool {
        Rc::ptr_eq(&self.cache, other)
    }
}

impl Clone for CacheSubscription {
    fn clone(&self) -> Self {
        self.cache.subscribe()
    }
}

impl Deref for CacheSubscription {
    type Target = MultiDataVectorCache;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        self.cache.unsubscribe();
    }
}
