//! Purpose: Top-level owner of logged variables, their generations, and per-generation caches.
//! Exports: `LogDataHandler`, `LogCacheConfig`.
//! Role: Glue between a data producer (one generation per run) and the cache core.
//! Invariants: One locked cache directory per handler; one cache file per generation.
//! Invariants: Registries that report themselves empty are removed after each sweep.
//! Invariants: Generation caches with no subscribers are dropped, deleting their files.
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use fs2::FileExt;
use libc::{EACCES, EPERM};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache_paths::{LOCK_FILE_NAME, cache_file_path, create_unused_handler_dir, default_cache_dir};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::multi_cache::MultiDataVectorCache;
use crate::core::registry::{GenerationRegistry, LogVariable, SharedLogVariable};
use crate::core::vector::CachableDataVector;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogCacheConfig {
    /// Base directory; each handler creates its own `handler<N>` below it.
    pub cache_dir: PathBuf,
    pub cache_to_disk: bool,
    /// Generations kept per variable before old unkept ones are purged.
    pub generation_limit: usize,
}

impl Default for LogCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache_to_disk: true,
            generation_limit: 100,
        }
    }
}

impl LogCacheConfig {
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn with_cache_to_disk(mut self, cache_to_disk: bool) -> Self {
        self.cache_to_disk = cache_to_disk;
        self
    }

    pub fn with_generation_limit(mut self, generation_limit: usize) -> Self {
        self.generation_limit = generation_limit;
        self
    }
}

pub struct LogDataHandler {
    config: LogCacheConfig,
    cache_dir: PathBuf,
    dir_lock: Option<File>,
    next_cache_file: u64,
    latest_generation: Option<i32>,
    open_generation: Option<i32>,
    caches: BTreeMap<i32, Rc<MultiDataVectorCache>>,
    variables: BTreeMap<String, GenerationRegistry>,
}

impl LogDataHandler {
    /// Creates a handler in a fresh `handler<N>` directory under `config.cache_dir`.
    pub fn new(config: LogCacheConfig) -> Result<Self> {
        let dir = create_unused_handler_dir(&config.cache_dir).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to create handler cache directory")
                .with_path(&config.cache_dir)
                .with_source(err)
        })?;
        Self::in_dir(config, dir)
    }

    /// Uses `dir` as the cache directory, failing with `Busy` if another handler holds it.
    pub fn in_dir(config: LogCacheConfig, dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = dir.into();
        std::fs::create_dir_all(&cache_dir).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_path(&cache_dir)
                .with_source(err)
        })?;
        let dir_lock = lock_cache_dir(&cache_dir)?;
        debug!(dir = %cache_dir.display(), "log data handler opened");
        Ok(Self {
            config,
            cache_dir,
            dir_lock: Some(dir_lock),
            next_cache_file: 0,
            latest_generation: None,
            open_generation: None,
            caches: BTreeMap::new(),
            variables: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &LogCacheConfig {
        &self.config
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Most recently started generation.
    pub fn current_generation(&self) -> Option<i32> {
        self.latest_generation
    }

    pub fn is_generation_open(&self) -> bool {
        self.open_generation.is_some()
    }

    pub fn get_or_create_generation_cache(&mut self, generation: i32) -> Rc<MultiDataVectorCache> {
        if let Some(cache) = self.caches.get(&generation) {
            return Rc::clone(cache);
        }
        let path = cache_file_path(&self.cache_dir, self.next_cache_file);
        self.next_cache_file += 1;
        debug!(generation, path = %path.display(), "generation cache created");
        let cache = MultiDataVectorCache::shared(path);
        self.caches.insert(generation, Rc::clone(&cache));
        cache
    }

    pub fn generation_cache(&self, generation: i32) -> Option<Rc<MultiDataVectorCache>> {
        self.caches.get(&generation).cloned()
    }

    pub fn num_generation_caches(&self) -> usize {
        self.caches.len()
    }

    /// Starts a new generation and returns its number.
    pub fn begin_generation(&mut self) -> Result<i32> {
        if let Some(open) = self.open_generation {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("previous generation has not been ended")
                .with_generation(open));
        }
        let generation = self.latest_generation.map_or(0, |latest| latest + 1);
        if self.config.cache_to_disk {
            let cache = self.get_or_create_generation_cache(generation);
            cache
                .begin_multi_append()
                .map_err(|err| err.with_generation(generation))?;
        }
        self.latest_generation = Some(generation);
        self.open_generation = Some(generation);
        Ok(generation)
    }

    /// Logs `data` as the open generation of variable `name`.
    pub fn insert_variable(&mut self, name: &str, data: Vec<f64>) -> Result<SharedLogVariable> {
        let Some(generation) = self.open_generation else {
            return Err(Error::new(ErrorKind::Usage).with_message("no generation is open"));
        };
        if data.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("variable {name} has no data"))
                .with_generation(generation));
        }

        let cache = self
            .config
            .cache_to_disk
            .then(|| self.get_or_create_generation_cache(generation));
        let mut vector = CachableDataVector::new(data, cache, self.config.cache_to_disk);
        if let Some(warning) = vector.take_warning() {
            warn!(variable = name, generation, "{warning}");
        }

        let variable = LogVariable::shared(name, vector);
        self.variables
            .entry(name.to_string())
            .or_insert_with(|| GenerationRegistry::new(name))
            .add_generation(generation, Rc::clone(&variable));
        Ok(variable)
    }

    /// Closes the open generation and applies the generation limit.
    /// Returns whether any old generation was purged.
    pub fn end_generation(&mut self) -> Result<bool> {
        let Some(generation) = self.open_generation.take() else {
            return Err(Error::new(ErrorKind::Usage).with_message("no generation is open"));
        };
        if let Some(cache) = self.caches.get(&generation) {
            cache.end_multi_append();
        }
        let purged = self.limit_generations();
        self.drop_unused_caches();
        Ok(purged)
    }

    /// Logs a whole generation in one call.
    pub fn log_generation<I, S>(&mut self, variables: I) -> Result<i32>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: AsRef<str>,
    {
        let generation = self.begin_generation()?;
        let inserted = variables
            .into_iter()
            .try_for_each(|(name, data)| self.insert_variable(name.as_ref(), data).map(|_| ()));
        let ended = self.end_generation();
        inserted?;
        ended?;
        Ok(generation)
    }

    /// Looks up one generation of a variable; a negative generation means the latest.
    pub fn variable(&self, name: &str, generation: i32) -> Option<SharedLogVariable> {
        self.variables.get(name)?.get_generation(generation)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn peek_variable(&self, name: &str, idx: usize) -> Result<f64> {
        self.latest_variable(name)?.peek(idx)
    }

    pub fn poke_variable(&self, name: &str, idx: usize, value: f64) -> Result<()> {
        self.latest_variable(name)?.poke(idx, value)
    }

    /// Removes every generation of `name`, kept ones included.
    pub fn delete_variable(&mut self, name: &str) -> bool {
        let Some(mut registry) = self.variables.remove(name) else {
            return false;
        };
        registry.remove_all_generations();
        drop(registry);
        self.drop_unused_caches();
        true
    }

    /// Force-removes `generation` from every variable. Returns whether anything was removed.
    pub fn remove_generation(&mut self, generation: i32) -> bool {
        let mut removed = false;
        let mut empty = Vec::new();
        for (name, registry) in self.variables.iter_mut() {
            let outcome = registry.remove_generation(generation, true);
            removed |= outcome.removed;
            if outcome.now_empty {
                empty.push(name.clone());
            }
        }
        self.remove_registries(empty);
        self.drop_unused_caches();
        removed
    }

    pub fn prevent_generation_auto_removal(&mut self, generation: i32) {
        for registry in self.variables.values_mut() {
            registry.prevent_auto_remove(generation);
        }
    }

    pub fn allow_generation_auto_removal(&mut self, generation: i32) {
        for registry in self.variables.values_mut() {
            registry.allow_auto_remove(generation);
        }
    }

    /// Purges generations older than `highest - generation_limit`, honoring kept ones.
    pub fn limit_generations(&mut self) -> bool {
        let limit = self.config.generation_limit;
        if self.num_generations() <= limit {
            return false;
        }
        let Some(highest) = self.highest_generation_number() else {
            return false;
        };
        let purge_end = highest.saturating_sub(i32::try_from(limit).unwrap_or(i32::MAX));

        let mut removed = 0;
        let mut empty = Vec::new();
        for (name, registry) in self.variables.iter_mut() {
            let outcome = registry.purge_old_generations(purge_end, limit);
            removed += outcome.removed;
            if outcome.now_empty {
                empty.push(name.clone());
            }
        }
        if removed > 0 {
            debug!(purge_end, removed, "old generations purged");
        }
        self.remove_registries(empty);
        self.drop_unused_caches();
        removed > 0
    }

    pub fn generation_numbers(&self) -> Vec<i32> {
        self.all_generations().into_iter().collect()
    }

    pub fn num_generations(&self) -> usize {
        self.all_generations().len()
    }

    pub fn lowest_generation_number(&self) -> Option<i32> {
        self.variables
            .values()
            .filter_map(GenerationRegistry::lowest_generation)
            .min()
    }

    pub fn highest_generation_number(&self) -> Option<i32> {
        self.variables
            .values()
            .filter_map(GenerationRegistry::highest_generation)
            .max()
    }

    /// Drops all variables and caches. Generation numbering continues where it was.
    pub fn clear(&mut self) {
        for registry in self.variables.values_mut() {
            registry.remove_all_generations();
        }
        self.variables.clear();
        if let Some(generation) = self.open_generation.take() {
            if let Some(cache) = self.caches.get(&generation) {
                cache.end_multi_append();
            }
        }
        self.caches.clear();
    }

    fn latest_variable(&self, name: &str) -> Result<SharedLogVariable> {
        self.variable(name, -1).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("no variable named {name}"))
        })
    }

    fn all_generations(&self) -> BTreeSet<i32> {
        self.variables
            .values()
            .flat_map(GenerationRegistry::generations)
            .collect()
    }

    fn remove_registries(&mut self, names: Vec<String>) {
        for name in names {
            self.variables.remove(&name);
        }
    }

    fn drop_unused_caches(&mut self) {
        let open = self.open_generation;
        self.caches
            .retain(|generation, cache| Some(*generation) == open || cache.num_subscribers() > 0);
    }
}

/// Clears all data and removes the lock file and the cache directory.
///
/// Variables still held elsewhere keep their `cf<N>` files, so the directory
/// is left in place. Nothing removes it once those holders drop; the empty
/// `handler<N>` directory stays until it is deleted by hand.
impl Drop for LogDataHandler {
    fn drop(&mut self) {
        self.clear();
        if let Some(lock) = self.dir_lock.take() {
            let _ = lock.unlock();
        }
        let lock_path = self.cache_dir.join(LOCK_FILE_NAME);
        if let Err(err) = std::fs::remove_file(&lock_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %lock_path.display(), error = %err, "failed to remove cache lock file");
            }
        }
        // Still populated when outside holders keep cached variables alive.
        if let Err(err) = std::fs::remove_dir(&self.cache_dir) {
            debug!(dir = %self.cache_dir.display(), error = %err, "cache directory left in place");
        }
    }
}

fn lock_cache_dir(dir: &Path) -> Result<File> {
    let path = dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
    file.try_lock_exclusive().map_err(|err| {
        Error::new(lock_error_kind(&err))
            .with_message("cache directory is in use by another handler")
            .with_path(dir)
            .with_source(err)
    })?;
    Ok(file)
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
