//! Remap boundary: the contract between the event core and whatever
//! decides what a key should turn into.
//!
//! The collaborator never touches the display connection. It receives
//! decoded keys and window snapshots and answers with the keys to inject;
//! the dispatcher does the injecting. Both an `Err` and a panic coming
//! out of a collaborator are contained here, so one bad rule cannot take
//! the remapper down.

pub mod config;
pub mod rules;

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};

use crate::keys::{Direction, KeyIdentity};
use crate::window::WindowInfo;

pub use config::{Config, ConfigError, ReleasePolicy};
pub use rules::RuleHandler;

/// Remap collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum RemapError {
    #[error("remap handler failed: {0}")]
    Handler(String),
    #[error("remap handler panicked: {0}")]
    Panicked(String),
}

/// One key to synthesize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyAction {
    pub key: KeyIdentity,
    pub direction: Direction,
}

impl KeyAction {
    pub fn press(key: KeyIdentity) -> Self {
        Self {
            key,
            direction: Direction::Press,
        }
    }

    pub fn release(key: KeyIdentity) -> Self {
        Self {
            key,
            direction: Direction::Release,
        }
    }
}

/// The keys to synthesize for one input event, in order. Empty means
/// swallow the input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapDecision {
    pub actions: Vec<KeyAction>,
}

impl RemapDecision {
    pub fn swallow() -> Self {
        Self::default()
    }

    /// Press then release `key`.
    pub fn tap(key: KeyIdentity) -> Self {
        Self {
            actions: vec![KeyAction::press(key), KeyAction::release(key)],
        }
    }

    pub fn push(&mut self, action: KeyAction) {
        self.actions.push(action);
    }

    pub fn extend(&mut self, other: RemapDecision) {
        self.actions.extend(other.actions);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// A remap policy, injected into the dispatcher at startup.
pub trait RemapHandler {
    /// Keys that should be grabbed while `window` has focus.
    fn grabs_for(&self, window: &WindowInfo) -> BTreeSet<KeyIdentity>;

    /// Decide what a grabbed key turns into.
    fn handle_key(
        &mut self,
        key: &KeyIdentity,
        direction: Direction,
        window: &WindowInfo,
    ) -> Result<RemapDecision, RemapError>;

    /// The focused window or one of its properties changed.
    fn handle_property_change(&mut self, window: &WindowInfo) -> Result<(), RemapError>;

    /// The keyboard mapping changed.
    fn handle_mapping_change(&mut self) -> Result<(), RemapError>;
}

/// Run a collaborator call, turning a panic into [`RemapError::Panicked`].
pub fn contain<T>(call: impl FnOnce() -> Result<T, RemapError>) -> Result<T, RemapError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".into());
            Err(RemapError::Panicked(message))
        }
    }
}
