//! Core identity, state, and transition types shared by every component.

use thiserror::Error;

mod limits;
mod state;
mod subject;
mod transition;

pub use limits::Limits;
pub use state::{ColumnValue, DictMapState, EvictionSide, ListState, SetState, StreamState, StringState};
pub use subject::{Alias, CorrelationId, ServiceKey, Subject, Tags, TopicKey};
pub use transition::{ListTransition, SetTransition, StreamStateTransition};

#[derive(Debug, Error)]
#[error("invalid {kind} key {raw:?}: {reason}")]
pub struct InvalidKey {
    pub kind: &'static str,
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    InvalidKey(#[from] InvalidKey),
}

/// One upstream payload for a subject: a full snapshot or a delta.
///
/// Endpoints emit a snapshot on first attach and after reset, transitions
/// otherwise; both coalesce in the same per-subscription buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamUpdate {
    Snapshot(StreamState),
    Transition(StreamStateTransition),
}

impl StreamUpdate {
    pub fn applicable_to(&self, current: Option<&StreamState>) -> bool {
        match self {
            StreamUpdate::Snapshot(_) => true,
            StreamUpdate::Transition(t) => t.applicable_to(current),
        }
    }

    /// Folds this update into `current`, yielding the successor state.
    pub fn apply(&self, current: Option<&StreamState>) -> Option<StreamState> {
        match self {
            StreamUpdate::Snapshot(state) => Some(state.clone()),
            StreamUpdate::Transition(t) => t.apply(current),
        }
    }
}
