use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};

use crate::domain::{KilnError, SourceIdentity, Tier};

use super::artifact::CompiledArtifact;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::entry";

pub type BuildResult = Result<Arc<CompiledArtifact>, KilnError>;

/// A build in progress, awaited by every caller that asked for the entry.
pub(crate) type Flight = Shared<BoxFuture<'static, BuildResult>>;

pub(crate) enum EntryState {
    Empty,
    Building { flight: Flight, generation: u64 },
    Built(Arc<CompiledArtifact>),
    Invalidated,
}

/// Observable state of an entry, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Empty,
    Building,
    Built,
    Invalidated,
}

pub struct CacheEntry {
    identity: SourceIdentity,
    tier: Tier,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    pub(crate) fn new(identity: SourceIdentity, tier: Tier) -> Self {
        Self {
            identity,
            tier,
            state: Mutex::new(EntryState::Empty),
        }
    }

    pub fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn status(&self) -> EntryStatus {
        match &*mutex_lock(&self.state, SOURCE, "status") {
            EntryState::Empty => EntryStatus::Empty,
            EntryState::Building { .. } => EntryStatus::Building,
            EntryState::Built(_) => EntryStatus::Built,
            EntryState::Invalidated => EntryStatus::Invalidated,
        }
    }

    pub(crate) fn with_state<R>(&self, op: &'static str, f: impl FnOnce(&mut EntryState) -> R) -> R {
        let mut state = mutex_lock(&self.state, SOURCE, op);
        f(&mut state)
    }

    /// Store a finished build, unless the entry moved on since it started.
    ///
    /// Returns whether the result was published.
    pub(crate) fn publish(&self, generation: u64, result: &BuildResult) -> bool {
        self.with_state("publish", |state| {
            let current = matches!(
                state,
                EntryState::Building { generation: g, .. } if *g == generation
            );
            if current {
                *state = match result {
                    Ok(artifact) => EntryState::Built(Arc::clone(artifact)),
                    Err(_) => EntryState::Empty,
                };
            }
            current
        })
    }

    /// Drop any built or in-flight artifact. Returns false when there was
    /// nothing to drop.
    pub(crate) fn invalidate(&self) -> bool {
        self.with_state("invalidate", |state| match state {
            EntryState::Empty | EntryState::Invalidated => false,
            EntryState::Building { .. } | EntryState::Built(_) => {
                *state = EntryState::Invalidated;
                true
            }
        })
    }
}
