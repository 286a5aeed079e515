//! Purpose: Cache-directory and cache-file naming helpers.
//! Exports: `default_cache_dir`, `create_unused_handler_dir`, `cache_file_path`, `LOCK_FILE_NAME`.
//! Role: Keep handler and CLI path semantics aligned from one source.
//! Invariants: Default cache directory is `<system temp>/logcache`.
//! Invariants: Handler directories are `handler<N>`; cache files are `cf<N>`.

use std::io;
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = ".lock";

pub fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("logcache")
}

/// Creates the first `handler<N>` directory under `base` that does not exist yet.
///
/// `create_dir` fails with `AlreadyExists` when another handler won the race
/// for a name, so the search simply moves on to the next number.
pub fn create_unused_handler_dir(base: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(base)?;
    let mut n: u64 = 0;
    loop {
        let candidate = base.join(format!("handler{n}"));
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(err) => return Err(err),
        }
    }
}

pub fn cache_file_path(dir: &Path, counter: u64) -> PathBuf {
    dir.join(format!("cf{counter}"))
}

#[cfg(test)]
mod tests {
    use super::{cache_file_path, create_unused_handler_dir};

    #[test]
    fn handler_dirs_take_first_free_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("handler0")).expect("seed");
        let first = create_unused_handler_dir(dir.path()).expect("create");
        assert_eq!(first, dir.path().join("handler1"));
        let second = create_unused_handler_dir(dir.path()).expect("create");
        assert_eq!(second, dir.path().join("handler2"));
        assert!(second.is_dir());
    }

    #[test]
    fn cache_files_are_numbered() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(cache_file_path(dir.path(), 3), dir.path().join("cf3"));
    }
}
