//! Namespace router: bidirectional action-name rewriting and request
//! correlation.
//!
//! Two independent tables, both owned by the relay actor:
//!
//! - exposed action name -> owning game id, consulted when the upstream
//!   executes an action;
//! - request id -> game id, recording which session must answer each
//!   in-flight upstream request.
//!
//! Lookups are point-in-time: a resolve racing an in-flight unregister
//! simply misses, and the caller answers upstream with a failure result.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::naming::exposed_name;

/// Why an action registration was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterError {
    /// The exposed name is already owned by another game.
    NameConflict { exposed: String, owner: String },
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::NameConflict { exposed, owner } => {
                write!(f, "action name '{exposed}' is already registered by '{owner}'")
            }
        }
    }
}

/// Why a request correlation was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindError {
    /// The request id is already bound to a live request.
    DuplicateRequest,
}

/// State removed by [`NamespaceRouter::purge_session`].
#[derive(Debug, Default)]
pub struct PurgedSession {
    /// Exposed names that were unregistered.
    pub exposed_names: Vec<String>,
    /// Request ids that were still awaiting a result from the game.
    pub orphaned_requests: Vec<String>,
}

#[derive(Default)]
pub struct NamespaceRouter {
    actions: HashMap<String, String>,
    requests: HashMap<String, String>,
}

impl NamespaceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The name a game's action is exposed under: prefixed when the session
    /// multiplexes, raw otherwise.
    pub fn exposed_for(&self, game_id: &str, raw_name: &str, multiplexing: bool) -> String {
        if multiplexing {
            exposed_name(game_id, raw_name)
        } else {
            raw_name.to_string()
        }
    }

    /// Map an action into the upstream namespace and return its exposed
    /// name. Re-registering a name the same game already owns is allowed
    /// (replacement); a name owned by another game is a conflict.
    pub fn register(
        &mut self,
        game_id: &str,
        raw_name: &str,
        multiplexing: bool,
    ) -> Result<String, RegisterError> {
        let exposed = self.exposed_for(game_id, raw_name, multiplexing);
        if let Some(owner) = self.actions.get(&exposed) {
            if owner != game_id {
                return Err(RegisterError::NameConflict {
                    exposed,
                    owner: owner.clone(),
                });
            }
        }
        self.actions.insert(exposed.clone(), game_id.to_string());
        Ok(exposed)
    }

    /// Remove a mapping owned by `game_id`, returning the exposed name that
    /// disappeared, or `None` if the game did not own it.
    pub fn unregister(
        &mut self,
        game_id: &str,
        raw_name: &str,
        multiplexing: bool,
    ) -> Option<String> {
        let exposed = self.exposed_for(game_id, raw_name, multiplexing);
        match self.actions.get(&exposed) {
            Some(owner) if owner == game_id => {
                self.actions.remove(&exposed);
                Some(exposed)
            }
            _ => None,
        }
    }

    /// Which game owns an exposed name, if any.
    pub fn resolve(&self, exposed: &str) -> Option<&str> {
        self.actions.get(exposed).map(String::as_str)
    }

    /// Record that `request_id` must be answered by `game_id`. At most one
    /// live correlation may exist per id.
    pub fn bind(&mut self, request_id: &str, game_id: &str) -> Result<(), BindError> {
        if self.requests.contains_key(request_id) {
            return Err(BindError::DuplicateRequest);
        }
        self.requests
            .insert(request_id.to_string(), game_id.to_string());
        Ok(())
    }

    /// Remove and return a correlation. A second release of the same id
    /// misses, which is how late duplicate results are detected.
    pub fn release(&mut self, request_id: &str) -> Option<String> {
        self.requests.remove(request_id)
    }

    /// Drop every table entry pointing at `game_id`. The caller owes the
    /// upstream a synthetic failure result for each orphaned request.
    pub fn purge_session(&mut self, game_id: &str) -> PurgedSession {
        let exposed_names: Vec<String> = self
            .actions
            .iter()
            .filter(|(_, owner)| *owner == game_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exposed_names {
            self.actions.remove(name);
        }

        let orphaned_requests: Vec<String> = self
            .requests
            .iter()
            .filter(|(_, owner)| *owner == game_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &orphaned_requests {
            self.requests.remove(id);
        }

        debug!(
            game = %game_id,
            actions = exposed_names.len(),
            requests = orphaned_requests.len(),
            "purged session state"
        );
        PurgedSession {
            exposed_names,
            orphaned_requests,
        }
    }

    /// Remove every live correlation, returning `(request id, game id)`
    /// pairs. Used when the relay itself terminates.
    pub fn drain_requests(&mut self) -> Vec<(String, String)> {
        self.requests.drain().collect()
    }
}
