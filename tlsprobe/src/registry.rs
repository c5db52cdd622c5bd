//! # Binary Registry
//!
//! Reference-counted record of which processes run which binaries and which
//! hooks are installed on each binary.
//!
//! ## Invariant
//!
//! Whenever the lock is released:
//! - every pid in `processes` points at an entry of `binaries` with a
//!   process count of at least 1
//! - every entry's process count equals the number of pids pointing at it
//!
//! Entries whose count drops to zero are removed in the same critical
//! section, handing their hooks to the caller for teardown.
//!
//! ## Generations
//!
//! Each entry gets a registry-wide unique [`Generation`] when it is created.
//! Background work carries the generation it was started for, and every
//! mutation it performs is checked against the entry's current generation so
//! that a late task for an unloaded binary never touches a newer entry for the
//! same identity.
//!
//! ## Shutdown
//!
//! [`BinaryRegistry::close`] refuses every later registration and makes all
//! generations stale, so work still in flight rolls itself back instead of
//! installing hooks nobody will remove.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use crate::domain::{BinaryId, Generation, HookHandle, Pid};

#[derive(Debug)]
struct RunningBinary {
    handles: Vec<HookHandle>,
    process_count: usize,
    generation: Generation,
}

#[derive(Debug, Default)]
struct State {
    binaries: HashMap<BinaryId, RunningBinary>,
    processes: HashMap<Pid, BinaryId>,
    last_generation: u64,
    closed: bool,
}

/// Result of [`BinaryRegistry::register_process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The pid was added. A `previous_count` of 0 makes the caller the owner
    /// of analysis and attachment for `generation`.
    Added { previous_count: usize, generation: Generation },
    /// The pid is already tracked (running the returned binary); nothing changed
    AlreadyTracked(BinaryId),
    /// The registry is closed; nothing changed
    Refused,
}

/// Result of [`BinaryRegistry::deregister_process`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deregistration {
    pub id: BinaryId,
    pub new_count: usize,
    pub generation: Generation,
    /// Hooks of the binary, non-empty only when `new_count` is 0
    pub handles: Vec<HookHandle>,
}

/// Shared registry of running binaries
#[derive(Debug, Default)]
pub struct BinaryRegistry {
    state: RwLock<State>,
}

impl BinaryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `pid` as a process running `id`
    pub fn register_process(&self, pid: Pid, id: BinaryId) -> Registration {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Registration::Refused;
        }
        if let Some(current) = state.processes.get(&pid) {
            return Registration::AlreadyTracked(*current);
        }

        let next = Generation(state.last_generation + 1);
        let bin = state.binaries.entry(id).or_insert(RunningBinary {
            handles: Vec::new(),
            process_count: 0,
            generation: next,
        });
        let previous_count = bin.process_count;
        bin.process_count += 1;
        let generation = bin.generation;
        if generation == next {
            state.last_generation = next.0;
        }
        state.processes.insert(pid, id);

        Registration::Added { previous_count, generation }
    }

    /// Stop counting `pid`
    ///
    /// Returns `None` if the pid is not tracked. When the binary's count
    /// reaches zero its entry is removed and its hooks are returned; the caller
    /// detaches them after the lock has been released.
    pub fn deregister_process(&self, pid: Pid) -> Option<Deregistration> {
        // Cheap shared check first, exits of untracked pids are the common case
        if !self.state.read().unwrap_or_else(PoisonError::into_inner).processes.contains_key(&pid) {
            return None;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        Self::remove_process(&mut state, pid)
    }

    /// Like [`Self::deregister_process`], but only if `pid` still counts
    /// towards `generation` of `id`
    ///
    /// Used by background work undoing its own registration, which must not
    /// remove a pid that has since been registered again for a newer entry.
    pub fn deregister_owned(&self, pid: Pid, id: BinaryId, generation: Generation) -> Option<Deregistration> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let owned = state.processes.get(&pid) == Some(&id)
            && state.binaries.get(&id).is_some_and(|bin| bin.generation == generation);
        if !owned {
            return None;
        }
        Self::remove_process(&mut state, pid)
    }

    fn remove_process(state: &mut State, pid: Pid) -> Option<Deregistration> {
        let id = state.processes.remove(&pid)?;
        let bin = state.binaries.get_mut(&id)?;
        bin.process_count -= 1;

        let new_count = bin.process_count;
        let generation = bin.generation;
        let handles = if new_count == 0 {
            state.binaries.remove(&id).map(|bin| bin.handles).unwrap_or_default()
        } else {
            Vec::new()
        };

        Some(Deregistration { id, new_count, generation, handles })
    }

    /// Record the hooks installed for `generation` of `id`
    ///
    /// Returns `false` (and keeps nothing) if the binary was unloaded in the
    /// meantime or belongs to a newer generation. The caller owns the handles
    /// in that case and must detach them.
    #[must_use]
    pub fn store_handles(&self, id: BinaryId, generation: Generation, handles: Vec<HookHandle>) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let closed = state.closed;
        match state.binaries.get_mut(&id) {
            Some(bin) if !closed && bin.process_count > 0 && bin.generation == generation => {
                bin.handles = handles;
                true
            }
            _ => false,
        }
    }

    /// True while `generation` is the live entry of `id`
    #[must_use]
    pub fn is_current(&self, id: BinaryId, generation: Generation) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        !state.closed
            && state.binaries.get(&id).is_some_and(|bin| bin.process_count > 0 && bin.generation == generation)
    }

    /// Refuse new registrations and invalidate every generation
    ///
    /// Tracked pids stay registered until deregistered so that their hooks are
    /// still handed back for teardown.
    pub fn close(&self) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).closed = true;
    }


    #[must_use]
    pub fn binary_of(&self, pid: Pid) -> Option<BinaryId> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).processes.get(&pid).copied()
    }

    /// Snapshot of every tracked pid
    #[must_use]
    pub fn tracked_pids(&self) -> HashSet<Pid> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).processes.keys().copied().collect()
    }

    /// Number of processes running `id` (0 when not registered)
    #[must_use]
    pub fn process_count(&self, id: BinaryId) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.binaries.get(&id).map_or(0, |bin| bin.process_count)
    }

    /// Hooks currently recorded for `id`
    #[must_use]
    pub fn handles(&self, id: BinaryId) -> Vec<HookHandle> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.binaries.get(&id).map(|bin| bin.handles.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn binary_count(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).binaries.len()
    }

    /// Verify the reference counts against the process map
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts: HashMap<BinaryId, usize> = HashMap::new();
        for id in state.processes.values() {
            *counts.entry(*id).or_default() += 1;
        }
        counts.len() == state.binaries.len()
            && state.binaries.iter().all(|(id, bin)| {
                bin.process_count > 0 && counts.get(id) == Some(&bin.process_count)
            })
    }
}
