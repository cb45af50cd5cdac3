//! Collaborator seams for talking to the platform.
//!
//! The executor performs one action for one identity; the session checker
//! owns identity authorization state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ActionSpec, Identity};
use crate::store::Store;

/// Successful result of one platform action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Platform-specific detail (message id, new link).
    pub detail: Option<String>,
}

/// Classified failure of one platform action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Network hiccup or unexpected response; skip this attempt.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The platform refused the action.
    #[error("rejected by platform: {0}")]
    Rejected(String),

    /// Join refused because the identity is subscribed to too many resources.
    #[error("subscription cap reached")]
    SubscriptionCap,

    /// The identity's session is gone.
    #[error("session lost")]
    SessionLost,

    /// Explicit platform cooldown.
    #[error("flood wait for {}s", .retry_after.as_secs())]
    FloodWait { retry_after: Duration },
}

/// Performs actions against the external platform.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, identity: &Identity, action: &ActionSpec) -> Result<ActionOutcome, ActionError>;
}

/// Owns identity authorization state.
///
/// `session_lost` is called when an action reports that the session is gone;
/// implementations mark the identity unauthorized and raise an alert.
#[async_trait]
pub trait SessionChecker: Send + Sync {
    async fn is_authorized(&self, identity: &Identity) -> bool;

    async fn session_lost(&self, identity: &Identity);
}

/// Session checker backed by the store's authorization flag.
pub struct StoreSessionChecker<S: Store> {
    store: Arc<S>,
}

impl<S: Store> StoreSessionChecker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store + 'static> SessionChecker for StoreSessionChecker<S> {
    async fn is_authorized(&self, identity: &Identity) -> bool {
        match self.store.identity(&identity.id).await {
            Ok(Some(current)) => current.authorized,
            Ok(None) => false,
            Err(e) => {
                log::warn!("Session check for {} could not read store: {}", identity.id, e);
                false
            }
        }
    }

    async fn session_lost(&self, identity: &Identity) {
        if !self.is_authorized(identity).await {
            return;
        }
        if let Err(e) = self.store.set_authorized(&identity.id, false).await {
            log::error!("Failed to de-authorize {}: {}", identity.id, e);
            return;
        }
        log::error!("ALERT: identity {} lost its session and was de-authorized", identity.id);
    }
}
