//! Resumable per-transaction state replayed to reconnecting clients.

use serde::{Deserialize, Serialize};

/// Kind of instruction kept for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResumableKind {
    IoCall,
    LoadingState,
    Redirect,
}

/// Last instruction of each kind sent for a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumableState {
    pub io_call: Option<serde_json::Value>,
    pub loading_state: Option<serde_json::Value>,
    pub redirect: Option<serde_json::Value>,
}

impl ResumableState {
    /// Stores `value`, superseding the previous instruction of that kind.
    pub fn set(&mut self, kind: ResumableKind, value: serde_json::Value) {
        match kind {
            ResumableKind::IoCall => self.io_call = Some(value),
            ResumableKind::LoadingState => self.loading_state = Some(value),
            ResumableKind::Redirect => self.redirect = Some(value),
        }
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.io_call.is_none() && self.loading_state.is_none() && self.redirect.is_none()
    }

    /// Pending instructions in replay order: render, loading, redirect.
    pub fn replay_order(&self) -> impl Iterator<Item = (ResumableKind, &serde_json::Value)> {
        [
            (ResumableKind::IoCall, self.io_call.as_ref()),
            (ResumableKind::LoadingState, self.loading_state.as_ref()),
            (ResumableKind::Redirect, self.redirect.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, value)| value.map(|v| (kind, v)))
    }
}
