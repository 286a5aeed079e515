//! Purpose: A log vector that lives either in memory or in a region of a shared cache file.
//! Exports: `CachableDataVector`, `CacheSlot`.
//! Role: Uniform read/write surface over both representations; moves data between them.
//! Invariants: Exactly one representation is active; the `Storage` enum enforces it.
//! Invariants: A bound vector holds one `CacheSubscription` for as long as it is bound.
//! Invariants: Disk regions are never reclaimed; shorter data reuses the slot, longer data appends.
use std::fmt::Display;
use std::io::Write;
use std::rc::Rc;

use crate::core::cache_file::{ByteRange, ELEMENT_SIZE};
use crate::core::checkout::FullVectorOperation;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::multi_cache::{CacheSubscription, MultiDataVectorCache};

/// A region of a cache file: the bytes in use plus the bytes originally allocated.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheSlot {
    pub range: ByteRange,
    pub capacity_bytes: u64,
}

impl CacheSlot {
    fn allocated(range: ByteRange) -> Self {
        Self {
            range,
            capacity_bytes: range.num_bytes,
        }
    }

    fn fits(&self, elements: usize) -> bool {
        elements as u64 * ELEMENT_SIZE <= self.capacity_bytes
    }
}

#[derive(Debug)]
enum Storage {
    InMemory {
        data: Vec<f64>,
        // Disk copy left behind by `set_cached(false)`, reused when moving back.
        slot: Option<CacheSlot>,
    },
    Cached(CacheSlot),
}

#[derive(Debug)]
pub struct CachableDataVector {
    storage: Storage,
    cache: Option<CacheSubscription>,
    warning: Option<String>,
}

impl CachableDataVector {
    /// Creates a vector, optionally bound to `cache`.
    ///
    /// A bound vector subscribes to the cache. With `start_cached` the data goes
    /// straight to disk; if that fails it stays in memory and a warning is kept.
    pub fn new(data: Vec<f64>, cache: Option<Rc<MultiDataVectorCache>>, start_cached: bool) -> Self {
        let cache = cache.map(|cache| cache.subscribe());
        let mut vector = Self {
            storage: Storage::InMemory { data, slot: None },
            cache,
            warning: None,
        };
        if start_cached && vector.cache.is_some() {
            if let Err(err) = vector.move_to_cache() {
                vector.warning = Some(format!(
                    "failed to cache log data on disk, falling back to memory storage: {err}"
                ));
            }
        }
        vector
    }

    pub fn in_memory(data: Vec<f64>) -> Self {
        Self::new(data, None, false)
    }

    pub fn cache(&self) -> Option<&Rc<MultiDataVectorCache>> {
        self.cache.as_ref().map(CacheSubscription::cache)
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.storage, Storage::Cached(_))
    }

    /// The cached region, if the vector currently lives on disk.
    pub fn cached_range(&self) -> Option<ByteRange> {
        match &self.storage {
            Storage::Cached(slot) => Some(slot.range),
            Storage::InMemory { .. } => None,
        }
    }

    pub fn size(&self) -> usize {
        match &self.storage {
            Storage::InMemory { data, .. } => data.len(),
            Storage::Cached(slot) => slot.range.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn take_warning(&mut self) -> Option<String> {
        self.warning.take()
    }

    /// `true` moves the data to disk and frees memory; `false` copies it back into memory.
    pub fn set_cached(&mut self, cached: bool) -> Result<()> {
        if cached {
            self.move_to_cache()
        } else {
            self.copy_to_memory()
        }
    }

    pub fn copy_data_to(&self, out: &mut Vec<f64>) -> Result<()> {
        match &self.storage {
            Storage::InMemory { data, .. } => {
                out.clear();
                out.extend_from_slice(data);
                Ok(())
            }
            Storage::Cached(slot) => {
                let cache = self.bound_cache()?;
                if slot.range.is_empty() {
                    out.clear();
                    return Ok(());
                }
                cache.copy_data_to(slot.range.start_byte, slot.range.num_bytes, out)
            }
        }
    }

    pub fn to_vec(&self) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.size());
        self.copy_data_to(&mut out)?;
        Ok(out)
    }

    /// Writes the elements to `writer` separated by `separator`.
    pub fn stream_data_to(&self, writer: &mut impl Write, separator: &str) -> Result<()> {
        let scratch;
        let data = match &self.storage {
            Storage::InMemory { data, .. } => data.as_slice(),
            Storage::Cached(_) => {
                scratch = self.to_vec()?;
                scratch.as_slice()
            }
        };
        write_separated(writer, data, separator).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to stream data")
                .with_source(err)
        })
    }

    /// Replaces the contents, reusing the allocated disk slot when the new data fits.
    pub fn replace_data(&mut self, new_data: Vec<f64>) -> Result<()> {
        match &mut self.storage {
            Storage::InMemory { data, .. } => {
                *data = new_data;
                Ok(())
            }
            Storage::Cached(slot) => {
                let cache = bound(&self.cache)?;
                *slot = store(cache, Some(*slot), &new_data)?;
                Ok(())
            }
        }
    }

    pub fn peek(&self, idx: usize) -> Result<f64> {
        self.check_index(idx)?;
        match &self.storage {
            Storage::InMemory { data, .. } => Ok(data[idx]),
            Storage::Cached(slot) => self.bound_cache()?.peek(slot.range.element_offset(idx)),
        }
    }

    pub fn poke(&mut self, idx: usize, value: f64) -> Result<()> {
        self.check_index(idx)?;
        match &mut self.storage {
            Storage::InMemory { data, .. } => {
                data[idx] = value;
                Ok(())
            }
            Storage::Cached(slot) => bound(&self.cache)?.poke(slot.range.element_offset(idx), value),
        }
    }

    /// Starts a whole-vector operation; see [`FullVectorOperation`].
    pub fn begin_full_vector_operation(&mut self) -> Result<FullVectorOperation<'_>> {
        match &mut self.storage {
            Storage::InMemory { data, .. } => Ok(FullVectorOperation::in_memory(data)),
            Storage::Cached(slot) => {
                let cache = bound(&self.cache)?;
                let loan = cache.checkout(slot.range.start_byte, slot.range.num_bytes)?;
                Ok(FullVectorOperation::cached(cache, loan))
            }
        }
    }

    /// Rebinds the vector to another cache (or none), keeping its contents.
    pub fn switch_cache(&mut self, cache: Option<Rc<MultiDataVectorCache>>) -> Result<()> {
        let unchanged = match (&self.cache, &cache) {
            (Some(current), Some(next)) => current.is_same_cache(next),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return Ok(());
        }

        let was_cached = self.is_cached();
        if was_cached {
            self.copy_to_memory()?;
        }
        if let Storage::InMemory { slot, .. } = &mut self.storage {
            *slot = None;
        }
        self.cache = cache.map(|cache| cache.subscribe());
        if was_cached && self.cache.is_some() {
            self.move_to_cache()?;
        }
        Ok(())
    }

    fn move_to_cache(&mut self) -> Result<()> {
        let cache = bound(&self.cache)?;
        let next = match &self.storage {
            Storage::Cached(_) => return Ok(()),
            Storage::InMemory { data, slot } => store(cache, *slot, data)?,
        };
        self.storage = Storage::Cached(next);
        Ok(())
    }

    fn copy_to_memory(&mut self) -> Result<()> {
        let Storage::Cached(slot) = self.storage else {
            return Ok(());
        };
        let mut data = Vec::new();
        if !slot.range.is_empty() {
            bound(&self.cache)?.copy_data_to(slot.range.start_byte, slot.range.num_bytes, &mut data)?;
        }
        self.storage = Storage::InMemory {
            data,
            slot: Some(slot),
        };
        Ok(())
    }

    fn check_index(&self, idx: usize) -> Result<()> {
        let size = self.size();
        if idx >= size {
            return Err(Error::new(ErrorKind::IndexOutOfRange)
                .with_message(format!("index {idx} out of range for {size} elements")));
        }
        Ok(())
    }

    fn bound_cache(&self) -> Result<&MultiDataVectorCache> {
        bound(&self.cache)
    }
}

fn bound(cache: &Option<CacheSubscription>) -> Result<&MultiDataVectorCache> {
    cache
        .as_deref()
        .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("no cache bound to vector"))
}

// Writes `data` into `slot` when it fits, otherwise appends a fresh region.
fn store(cache: &MultiDataVectorCache, slot: Option<CacheSlot>, data: &[f64]) -> Result<CacheSlot> {
    match slot {
        Some(slot) if data.is_empty() => Ok(CacheSlot {
            range: ByteRange::new(slot.range.start_byte, 0),
            capacity_bytes: slot.capacity_bytes,
        }),
        Some(slot) if slot.fits(data.len()) => {
            let written = cache.overwrite_range(slot.range.start_byte, data)?;
            Ok(CacheSlot {
                range: ByteRange::new(slot.range.start_byte, written),
                capacity_bytes: slot.capacity_bytes,
            })
        }
        _ if data.is_empty() => Ok(CacheSlot::default()),
        _ => Ok(CacheSlot::allocated(cache.append_vector(data)?)),
    }
}

fn write_separated<T: Display>(writer: &mut impl Write, data: &[T], separator: &str) -> std::io::Result<()> {
    let mut first = true;
    for value in data {
        if !first {
            writer.write_all(separator.as_bytes())?;
        }
        write!(writer, "{value}")?;
        first = false;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::CachableDataVector;
    use crate::core::cache_file::ByteRange;
    use crate::core::error::ErrorKind;
    use crate::core::multi_cache::MultiDataVectorCache;

    #[test]
    fn start_cached_moves_data_to_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let vector = CachableDataVector::new(vec![1.0, 2.0, 3.0], Some(cache.clone()), true);
        assert!(vector.is_cached());
        assert_eq!(vector.size(), 3);
        assert_eq!(vector.cached_range(), Some(ByteRange::new(0, 24)));
        assert_eq!(cache.num_subscribers(), 1);
        assert_eq!(vector.to_vec().expect("read"), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn unbound_vector_stays_in_memory() {
        let mut vector = CachableDataVector::new(vec![1.0, 2.0], None, true);
        assert!(!vector.is_cached());
        let err = vector.set_cached(true).expect_err("no cache");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(vector.to_vec().expect("read"), vec![1.0, 2.0]);
    }

    #[test]
    fn failed_initial_cache_falls_back_with_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("missing").join("cf0"));
        let vector = CachableDataVector::new(vec![1.0], Some(cache), true);
        assert!(!vector.is_cached());
        assert!(vector.warning().expect("warning").contains("falling back"));
        let mut vector = vector;
        assert!(vector.take_warning().is_some());
        assert!(vector.warning().is_none());
        assert_eq!(vector.peek(0).expect("peek"), 1.0);
    }

    #[test]
    fn uncaching_copies_and_recaching_reuses_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let mut vector = CachableDataVector::new(vec![1.0, 2.0, 3.0], Some(cache.clone()), true);

        vector.set_cached(false).expect("to memory");
        assert!(!vector.is_cached());
        assert_eq!(cache.read_range(0, 24).expect("disk copy"), vec![1.0, 2.0, 3.0]);

        vector.replace_data(vec![7.0, 8.0]).expect("replace in memory");
        vector.set_cached(true).expect("to disk");
        assert_eq!(vector.cached_range(), Some(ByteRange::new(0, 16)));
        assert_eq!(cache.cache_size(), 24);
        assert_eq!(vector.to_vec().expect("read"), vec![7.0, 8.0]);
    }

    #[test]
    fn shorter_replace_stays_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let mut vector = CachableDataVector::new(vec![1.0, 2.0, 3.0], Some(cache.clone()), true);
        let neighbour = CachableDataVector::new(vec![4.0, 5.0], Some(cache.clone()), true);

        vector.replace_data(vec![9.0, 9.0]).expect("replace");
        assert_eq!(vector.cached_range(), Some(ByteRange::new(0, 16)));
        assert_eq!(cache.read_range(0, 16).expect("read"), vec![9.0, 9.0]);
        assert_eq!(neighbour.to_vec().expect("read"), vec![4.0, 5.0]);

        // The slack left by the shorter write is still usable.
        vector.replace_data(vec![6.0, 6.0, 6.0]).expect("regrow into slack");
        assert_eq!(vector.cached_range(), Some(ByteRange::new(0, 24)));
        assert_eq!(cache.cache_size(), 40);
    }

    #[test]
    fn longer_replace_appends_new_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let mut vector = CachableDataVector::new(vec![1.0, 2.0], Some(cache.clone()), true);

        vector.replace_data(vec![3.0, 4.0, 5.0]).expect("replace");
        assert_eq!(vector.cached_range(), Some(ByteRange::new(16, 24)));
        assert_eq!(cache.read_range(0, 16).expect("old bytes"), vec![1.0, 2.0]);
        assert_eq!(vector.to_vec().expect("read"), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn peek_poke_are_bounds_checked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let mut cached = CachableDataVector::new(vec![1.0, 2.0], Some(cache.clone()), true);
        let mut memory = CachableDataVector::in_memory(vec![1.0, 2.0]);

        cached.poke(1, 20.0).expect("poke cached");
        memory.poke(1, 20.0).expect("poke memory");
        assert_eq!(cached.peek(1).expect("peek"), 20.0);
        assert_eq!(memory.peek(1).expect("peek"), 20.0);

        for vector in [&mut cached, &mut memory] {
            assert_eq!(vector.peek(2).expect_err("oob").kind(), ErrorKind::IndexOutOfRange);
            assert_eq!(vector.poke(5, 0.0).expect_err("oob").kind(), ErrorKind::IndexOutOfRange);
        }
    }

    #[test]
    fn empty_vector_can_be_tagged_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let mut vector = CachableDataVector::new(Vec::new(), Some(cache.clone()), true);
        assert!(vector.is_cached());
        assert!(vector.is_empty());
        assert_eq!(vector.to_vec().expect("read"), Vec::<f64>::new());

        vector.replace_data(vec![1.0]).expect("grow from empty");
        assert_eq!(vector.cached_range(), Some(ByteRange::new(0, 8)));
    }

    #[test]
    fn stream_uses_separator() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let vector = CachableDataVector::new(vec![1.0, 2.5, -3.0], Some(cache), true);
        let mut out = Vec::new();
        vector.stream_data_to(&mut out, ", ").expect("stream");
        assert_eq!(String::from_utf8(out).expect("utf8"), "1, 2.5, -3");
    }

    #[test]
    fn switching_cache_moves_subscription_and_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let second = MultiDataVectorCache::shared(dir.path().join("cf1"));
        let mut vector = CachableDataVector::new(vec![1.0, 2.0], Some(first.clone()), true);

        vector.switch_cache(Some(second.clone())).expect("switch");
        assert!(vector.is_cached());
        assert_eq!(first.num_subscribers(), 0);
        assert!(!first.path().exists());
        assert_eq!(second.num_subscribers(), 1);
        assert_eq!(vector.to_vec().expect("read"), vec![1.0, 2.0]);

        vector.switch_cache(None).expect("unbind");
        assert!(!vector.is_cached());
        assert!(!second.path().exists());
        assert_eq!(vector.to_vec().expect("read"), vec![1.0, 2.0]);
    }

    #[test]
    fn dropping_last_vector_removes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let a = CachableDataVector::new(vec![1.0], Some(cache.clone()), true);
        let b = CachableDataVector::new(vec![2.0], Some(cache.clone()), true);
        drop(a);
        assert!(cache.path().exists());
        drop(b);
        assert!(!cache.path().exists());
    }
}
