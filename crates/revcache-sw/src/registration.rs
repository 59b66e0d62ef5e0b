//! Worker registration and lifecycle state.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::error::{SwError, SwResult};

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Created, nothing run yet.
    #[default]
    Parsed,
    /// Install in progress.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activation in progress.
    Activating,
    /// Active and handling requests.
    Activated,
    /// Deregistered or failed to install.
    Redundant,
}

impl WorkerState {
    fn can_become(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
        ) || (next == Redundant && self != Redundant)
    }
}

/// Registration of the single running worker version.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,
    state: watch::Sender<WorkerState>,
}

impl Registration {
    pub fn new(scope: Url) -> Self {
        let (state, _) = watch::channel(WorkerState::Parsed);
        Self { scope, state }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Move to `next`, rejecting out-of-order transitions.
    pub fn transition(&self, next: WorkerState) -> SwResult<()> {
        let mut rejected = None;
        self.state.send_if_modified(|state| {
            let current = *state;
            if current.can_become(next) {
                debug!(scope = %self.scope, from = ?current, to = ?next, "Worker state");
                *state = next;
                true
            } else {
                rejected = Some(current);
                false
            }
        });
        match rejected {
            Some(current) => Err(SwError::State(format!(
                "cannot move from {current:?} to {next:?}"
            ))),
            None => Ok(()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == WorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state() == WorkerState::Redundant
    }

    /// Deregister. Returns false if already redundant.
    pub fn unregister(&self) -> bool {
        self.transition(WorkerState::Redundant).is_ok()
    }
}
