//! Caller-owned cache shared by all attention modules of one decoding session.
//!
//! The bag maps a [`ModuleId`] to that module's [`AttentionState`] and tracks
//! how many positions the session has processed so far. Attention modules
//! read and write their own entry; the caller (usually the decoder stack)
//! advances the step once every layer has seen the new positions.

use std::{cell::Cell, collections::HashMap, marker::PhantomData};

use crate::core::AttentionError;

use super::state::{AttentionState, ModuleId};

/// Incremental decoding state for a single session.
///
/// The type is `Send` but deliberately `!Sync`: concurrent sessions must use
/// distinct bags.
#[derive(Debug, Default)]
pub struct IncrementalStateBag {
    step: usize,
    max_num_steps: Option<usize>,
    states: HashMap<ModuleId, AttentionState>,
    _not_sync: PhantomData<Cell<()>>,
}

/// Step and cached entries of a bag at one point in time.
///
/// Cached tensors share storage with the bag, so taking a snapshot copies no
/// key or value data.
#[derive(Debug, Clone)]
pub struct BagSnapshot {
    step: usize,
    states: HashMap<ModuleId, AttentionState>,
}

impl BagSnapshot {
    pub fn step(&self) -> usize {
        self.step
    }
}

impl IncrementalStateBag {
    /// Creates an empty bag; `max_num_steps` bounds the session length.
    pub fn new(max_num_steps: Option<usize>) -> Self {
        Self {
            step: 0,
            max_num_steps,
            states: HashMap::new(),
            _not_sync: PhantomData,
        }
    }

    /// Number of positions processed so far.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn max_num_steps(&self) -> Option<usize> {
        self.max_num_steps
    }

    /// Positions that may still be processed, `None` when unbounded.
    pub fn remaining_steps(&self) -> Option<usize> {
        self.max_num_steps
            .map(|max| max.saturating_sub(self.step))
    }

    /// Advances the step counter by `delta` positions.
    pub fn increment_step(&mut self, delta: usize) -> Result<(), AttentionError> {
        let next = self.step + delta;
        if let Some(max) = self.max_num_steps {
            if next > max {
                return Err(AttentionError::state(format!(
                    "cannot advance to step {next}, bag allows at most {max} steps"
                )));
            }
        }
        log::debug!("state bag step {} -> {}", self.step, next);
        self.step = next;
        Ok(())
    }

    pub fn get_state(&self, id: ModuleId) -> Option<&AttentionState> {
        self.states.get(&id)
    }

    /// Stores `state` for `id`, replacing any previous entry.
    pub fn set_state(&mut self, id: ModuleId, state: AttentionState) {
        self.states.insert(id, state);
    }

    pub fn take_state(&mut self, id: ModuleId) -> Option<AttentionState> {
        self.states.remove(&id)
    }

    /// Drops the entry for `id`; returns whether one existed.
    pub fn remove_state(&mut self, id: ModuleId) -> bool {
        self.states.remove(&id).is_some()
    }

    /// Drops every cached state and rewinds the step counter to zero.
    pub fn clear(&mut self) {
        self.states.clear();
        self.step = 0;
    }

    /// Records the current step and entries for a later [`Self::restore`].
    pub fn snapshot(&self) -> BagSnapshot {
        BagSnapshot {
            step: self.step,
            states: self.states.clone(),
        }
    }

    /// Rewinds the bag to `snapshot`, discarding everything cached since.
    pub fn restore(&mut self, snapshot: BagSnapshot) {
        log::debug!(
            "state bag restored to step {} with {} entries",
            snapshot.step,
            snapshot.states.len()
        );
        self.step = snapshot.step;
        self.states = snapshot.states;
    }

    /// Number of modules with cached state.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
