//! Purpose: Per-variable map from generation number to logged data, with retention policy.
//! Exports: `GenerationRegistry`, `LogVariable`, `SharedLogVariable`, `RemovalNotice`, `RemoveOutcome`, `PurgeOutcome`.
//! Role: Owns every generation handle of one variable; external holders get shared references.
//! Invariants: A handle's generation and owner are set when it is added, not when it is created.
//! Invariants: Kept generations are only removed by a forced removal.
//! Invariants: Emptiness is reported to the caller; the registry never removes itself.
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::vector::CachableDataVector;

pub type SharedLogVariable = Rc<LogVariable>;

/// Sent to removal listeners just before a generation is dropped from its registry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemovalNotice {
    pub variable: String,
    pub generation: i32,
}

type RemovalListener = Box<dyn Fn(&RemovalNotice)>;

/// One generation of one logged variable.
pub struct LogVariable {
    name: String,
    generation: Cell<Option<i32>>,
    owner: RefCell<Option<String>>,
    data: RefCell<CachableDataVector>,
    removed: Cell<bool>,
    listeners: RefCell<Vec<RemovalListener>>,
}

impl LogVariable {
    pub fn new(name: impl Into<String>, data: CachableDataVector) -> Self {
        Self {
            name: name.into(),
            generation: Cell::new(None),
            owner: RefCell::new(None),
            data: RefCell::new(data),
            removed: Cell::new(false),
            listeners: RefCell::new(Vec::new()),
        }
    }

    pub fn shared(name: impl Into<String>, data: CachableDataVector) -> SharedLogVariable {
        Rc::new(Self::new(name, data))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Generation number, once the handle has been added to a registry.
    pub fn generation(&self) -> Option<i32> {
        self.generation.get()
    }

    /// Name of the registry holding this handle.
    pub fn owner(&self) -> Option<String> {
        self.owner.borrow().clone()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.get()
    }

    pub fn data(&self) -> Ref<'_, CachableDataVector> {
        self.data.borrow()
    }

    /// Mutable access to the vector; fails with `Busy` while another borrow is live.
    pub fn data_mut(&self) -> Result<RefMut<'_, CachableDataVector>> {
        self.data.try_borrow_mut().map_err(|_| {
            Error::new(ErrorKind::Busy)
                .with_message(format!("variable {} is already in use", self.name))
        })
    }

    pub fn size(&self) -> usize {
        self.data.borrow().size()
    }

    pub fn to_vec(&self) -> Result<Vec<f64>> {
        self.data.borrow().to_vec()
    }

    pub fn peek(&self, idx: usize) -> Result<f64> {
        self.data.borrow().peek(idx)
    }

    pub fn poke(&self, idx: usize, value: f64) -> Result<()> {
        self.data_mut()?.poke(idx, value)
    }

    /// Registers a callback fired before this handle is removed from its registry.
    pub fn on_removal(&self, listener: impl Fn(&RemovalNotice) + 'static) {
        self.listeners.borrow_mut().push(Box::new(listener));
    }

    fn attach(&self, owner: &str, generation: i32) {
        self.generation.set(Some(generation));
        *self.owner.borrow_mut() = Some(owner.to_string());
        self.removed.set(false);
    }

    fn notify_removal(&self, generation: i32) {
        let notice = RemovalNotice {
            variable: self.name.clone(),
            generation,
        };
        for listener in self.listeners.borrow().iter() {
            listener(&notice);
        }
        self.removed.set(true);
    }
}

impl fmt::Debug for LogVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogVariable")
            .field("name", &self.name)
            .field("generation", &self.generation.get())
            .field("removed", &self.removed.get())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RemoveOutcome {
    pub removed: bool,
    /// The registry holds no generations anymore; the caller should drop it.
    pub now_empty: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PurgeOutcome {
    pub removed: usize,
    pub now_empty: bool,
}

impl PurgeOutcome {
    pub fn removed_any(&self) -> bool {
        self.removed > 0
    }
}

#[derive(Debug)]
pub struct GenerationRegistry {
    name: String,
    generations: BTreeMap<i32, SharedLogVariable>,
    keep: BTreeSet<i32>,
}

impl GenerationRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generations: BTreeMap::new(),
            keep: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    pub fn num_generations(&self) -> usize {
        self.generations.len()
    }

    pub fn generations(&self) -> impl Iterator<Item = i32> + '_ {
        self.generations.keys().copied()
    }

    pub fn has_generation(&self, generation: i32) -> bool {
        self.generations.contains_key(&generation)
    }

    pub fn lowest_generation(&self) -> Option<i32> {
        self.generations.keys().next().copied()
    }

    pub fn highest_generation(&self) -> Option<i32> {
        self.generations.keys().next_back().copied()
    }

    /// Looks up a generation; a negative number means the most recent one.
    pub fn get_generation(&self, generation: i32) -> Option<SharedLogVariable> {
        if generation < 0 {
            return self.generations.values().next_back().cloned();
        }
        self.generations.get(&generation).cloned()
    }

    /// Inserts or replaces `generation`, stamping the handle with its number and owner.
    pub fn add_generation(
        &mut self,
        generation: i32,
        variable: SharedLogVariable,
    ) -> Option<SharedLogVariable> {
        variable.attach(&self.name, generation);
        self.generations.insert(generation, variable)
    }

    pub fn remove_generation(&mut self, generation: i32, force: bool) -> RemoveOutcome {
        if self.keep.contains(&generation) && !force {
            return RemoveOutcome {
                removed: false,
                now_empty: self.generations.is_empty(),
            };
        }
        if force {
            self.keep.remove(&generation);
        }

        let mut removed = false;
        if let Some(variable) = self.generations.get(&generation).cloned() {
            variable.notify_removal(generation);
            self.generations.remove(&generation);
            removed = true;
        }
        RemoveOutcome {
            removed,
            now_empty: self.generations.is_empty(),
        }
    }

    /// Removes the oldest generations up to `purge_end`, leaving at least
    /// `n_gens_to_keep` generations beside the kept ones.
    pub fn purge_old_generations(&mut self, purge_end: i32, n_gens_to_keep: usize) -> PurgeOutcome {
        let threshold = n_gens_to_keep + self.keep.len();
        let snapshot: Vec<i32> = self.generations.keys().copied().collect();
        let mut removed = 0;
        for generation in snapshot {
            if generation > purge_end || self.generations.len() <= threshold {
                break;
            }
            if self.remove_generation(generation, false).removed {
                removed += 1;
            }
        }
        PurgeOutcome {
            removed,
            now_empty: self.generations.is_empty(),
        }
    }

    pub fn remove_generations_older_than(&mut self, generation: i32) -> PurgeOutcome {
        let snapshot: Vec<i32> = self.generations.range(..generation).map(|(older, _)| *older).collect();
        let mut removed = 0;
        for older in snapshot {
            if self.remove_generation(older, false).removed {
                removed += 1;
            }
        }
        PurgeOutcome {
            removed,
            now_empty: self.generations.is_empty(),
        }
    }

    /// Force-removes every generation, kept ones included.
    pub fn remove_all_generations(&mut self) -> usize {
        let snapshot: Vec<i32> = self.generations.keys().copied().collect();
        let mut removed = 0;
        for generation in snapshot {
            if self.remove_generation(generation, true).removed {
                removed += 1;
            }
        }
        self.keep.clear();
        removed
    }

    pub fn prevent_auto_remove(&mut self, generation: i32) {
        self.keep.insert(generation);
    }

    pub fn allow_auto_remove(&mut self, generation: i32) {
        self.keep.remove(&generation);
    }

    pub fn is_kept(&self, generation: i32) -> bool {
        self.keep.contains(&generation)
    }

    pub fn kept_generations(&self) -> impl Iterator<Item = i32> + '_ {
        self.keep.iter().copied()
    }
}
