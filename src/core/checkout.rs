//! Purpose: Scoped guard for whole-vector transforms over in-memory or cached vectors.
//! Exports: `FullVectorOperation`.
//! Role: Wraps the cache checkout/return loan so it cannot be forgotten or double-returned.
//! Invariants: The guard mutably borrows its vector; no other vector call can interleave.
//! Invariants: A cached guard writes back only when the element count is unchanged.
use std::ops::{Deref, DerefMut};

use tracing::warn;

use crate::core::error::Result;
use crate::core::multi_cache::{CheckedOutVector, MultiDataVectorCache};

enum Operation<'a> {
    InMemory(&'a mut Vec<f64>),
    Cached {
        cache: &'a MultiDataVectorCache,
        loan: Option<CheckedOutVector>,
    },
}

/// Exclusive access to a vector's full contents.
///
/// In memory the guard points straight at the live storage. For a cached
/// vector it holds a checked-out copy that is written back by [`finish`] or,
/// failing that, when the guard drops. A write-back whose length differs from
/// the checkout fails with `SizeMismatch` and leaves the file untouched.
///
/// [`finish`]: FullVectorOperation::finish
pub struct FullVectorOperation<'a> {
    op: Operation<'a>,
}

impl<'a> FullVectorOperation<'a> {
    pub(crate) fn in_memory(data: &'a mut Vec<f64>) -> Self {
        Self {
            op: Operation::InMemory(data),
        }
    }

    pub(crate) fn cached(cache: &'a MultiDataVectorCache, loan: CheckedOutVector) -> Self {
        Self {
            op: Operation::Cached {
                cache,
                loan: Some(loan),
            },
        }
    }

    pub fn is_checked_out(&self) -> bool {
        matches!(self.op, Operation::Cached { .. })
    }

    /// Ends the operation, writing a checked-out copy back to the cache.
    pub fn finish(mut self) -> Result<()> {
        self.write_back()
    }

    fn write_back(&mut self) -> Result<()> {
        let Operation::Cached { cache, loan } = &mut self.op else {
            return Ok(());
        };
        let Some(loan) = loan.take() else {
            return Ok(());
        };
        cache.return_vector(loan).map_err(|rejected| {
            let (err, loan) = rejected.into_parts();
            cache.abandon_checkout(loan);
            err
        })
    }
}

impl Deref for FullVectorOperation<'_> {
    type Target = Vec<f64>;

    fn deref(&self) -> &Self::Target {
        match &self.op {
            Operation::InMemory(data) => data,
            Operation::Cached { loan, .. } => loan.as_deref().unwrap_or(&EMPTY),
        }
    }
}

impl DerefMut for FullVectorOperation<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.op {
            Operation::InMemory(data) => data,
            Operation::Cached { loan, .. } => loan
                .as_deref_mut()
                .expect("checked-out vector is present until the operation ends"),
        }
    }
}

static EMPTY: Vec<f64> = Vec::new();

impl Drop for FullVectorOperation<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.write_back() {
            warn!(error = %err, "dropped full vector operation could not be written back");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::error::ErrorKind;
    use crate::core::multi_cache::MultiDataVectorCache;
    use crate::core::vector::CachableDataVector;

    #[test]
    fn in_memory_operation_edits_live_storage() {
        let mut vector = CachableDataVector::in_memory(vec![1.0, 2.0]);
        let mut op = vector.begin_full_vector_operation().expect("begin");
        assert!(!op.is_checked_out());
        op.iter_mut().for_each(|value| *value += 1.0);
        op.push(4.0);
        op.finish().expect("finish");
        assert_eq!(vector.to_vec().expect("read"), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn cached_operation_writes_back_on_finish() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let mut vector = CachableDataVector::new(vec![1.0, 2.0, 3.0], Some(cache.clone()), true);

        let mut op = vector.begin_full_vector_operation().expect("begin");
        assert!(op.is_checked_out());
        assert_eq!(cache.num_checked_out(), 1);
        op.iter_mut().for_each(|value| *value = -*value);
        op.finish().expect("finish");

        assert_eq!(cache.num_checked_out(), 0);
        assert_eq!(vector.to_vec().expect("read"), vec![-1.0, -2.0, -3.0]);
    }

    #[test]
    fn cached_operation_writes_back_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let mut vector = CachableDataVector::new(vec![1.0, 2.0], Some(cache.clone()), true);
        {
            let mut op = vector.begin_full_vector_operation().expect("begin");
            op[0] = 10.0;
        }
        assert_eq!(cache.num_checked_out(), 0);
        assert_eq!(vector.to_vec().expect("read"), vec![10.0, 2.0]);
    }

    #[test]
    fn resized_cached_operation_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = MultiDataVectorCache::shared(dir.path().join("cf0"));
        let mut vector = CachableDataVector::new(vec![1.0, 2.0, 3.0], Some(cache.clone()), true);

        let mut op = vector.begin_full_vector_operation().expect("begin");
        op.truncate(1);
        op[0] = 99.0;
        let err = op.finish().expect_err("size mismatch");
        assert_eq!(err.kind(), ErrorKind::SizeMismatch);

        assert_eq!(cache.num_checked_out(), 0);
        assert_eq!(vector.to_vec().expect("read"), vec![1.0, 2.0, 3.0]);
    }
}
