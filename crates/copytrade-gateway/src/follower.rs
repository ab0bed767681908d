//! Desired-state records and the store they are read from.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Account state of a follower in the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowerState {
    /// Trading is mirrored for this follower.
    #[default]
    Active,
    /// Temporarily paused by an operator or risk rule.
    Suspended,
    /// Account closed.
    Closed,
}

/// A follower account as stored in the desired-state collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follower {
    /// Unique follower id.
    pub id: String,
    /// Broker login, used directly when no vault reference is set.
    #[serde(default)]
    pub ibkr_username: Option<String>,
    /// Reference into the credential vault.
    #[serde(default)]
    pub vault_secret_ref: Option<String>,
    /// Whether the follower wants a running gateway.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Account state.
    #[serde(default)]
    pub state: FollowerState,
}

fn default_enabled() -> bool {
    true
}

impl Follower {
    /// Create an enabled, active follower with no credentials configured.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ibkr_username: None,
            vault_secret_ref: None,
            enabled: true,
            state: FollowerState::Active,
        }
    }

    /// Set the inline broker username.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.ibkr_username = Some(username.into());
        self
    }

    /// Set the vault secret reference.
    #[must_use]
    pub fn with_vault_ref(mut self, secret_ref: impl Into<String>) -> Self {
        self.vault_secret_ref = Some(secret_ref.into());
        self
    }

    /// Set the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the account state.
    #[must_use]
    pub fn with_state(mut self, state: FollowerState) -> Self {
        self.state = state;
        self
    }

    /// Whether this follower belongs in the desired running set.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.enabled && self.state == FollowerState::Active
    }
}

/// Errors from the desired-state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("follower store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded.
    #[error("malformed follower record {id}: {reason}")]
    Malformed {
        /// Record id.
        id: String,
        /// Decode failure.
        reason: String,
    },
}

/// Source of desired state.
#[async_trait]
pub trait FollowerStore: Send + Sync {
    /// Followers with `enabled == true` and `state == Active`.
    async fn find_enabled_followers(&self) -> Result<Vec<Follower>, StoreError>;

    /// Fetch one follower by id, regardless of eligibility.
    async fn get_follower(&self, follower_id: &str) -> Result<Option<Follower>, StoreError>;
}

/// In-memory [`FollowerStore`] seeded from configuration.
///
/// Desired state can be edited at runtime; the next reconciliation pass
/// picks the change up.
#[derive(Debug, Default)]
pub struct StaticFollowerStore {
    followers: RwLock<BTreeMap<String, Follower>>,
}

impl StaticFollowerStore {
    /// Create a store holding `followers`. Later entries win on duplicate ids.
    #[must_use]
    pub fn new(followers: impl IntoIterator<Item = Follower>) -> Self {
        Self {
            followers: RwLock::new(
                followers
                    .into_iter()
                    .map(|follower| (follower.id.clone(), follower))
                    .collect(),
            ),
        }
    }

    /// Replace the whole follower set.
    pub async fn set_followers(&self, followers: impl IntoIterator<Item = Follower>) {
        let mut map = self.followers.write().await;
        map.clear();
        map.extend(followers.into_iter().map(|f| (f.id.clone(), f)));
    }

    /// Insert or replace one follower.
    pub async fn upsert(&self, follower: Follower) {
        self.followers
            .write()
            .await
            .insert(follower.id.clone(), follower);
    }

    /// Flip the enabled flag of a follower. Returns `false` if unknown.
    pub async fn set_enabled(&self, follower_id: &str, enabled: bool) -> bool {
        match self.followers.write().await.get_mut(follower_id) {
            Some(follower) => {
                follower.enabled = enabled;
                true
            },
            None => false,
        }
    }

    /// Remove a follower.
    pub async fn remove(&self, follower_id: &str) -> Option<Follower> {
        self.followers.write().await.remove(follower_id)
    }

    /// Number of followers held, eligible or not.
    pub async fn len(&self) -> usize {
        self.followers.read().await.len()
    }

    /// Whether the store holds no followers.
    pub async fn is_empty(&self) -> bool {
        self.followers.read().await.is_empty()
    }
}

#[async_trait]
impl FollowerStore for StaticFollowerStore {
    async fn find_enabled_followers(&self) -> Result<Vec<Follower>, StoreError> {
        Ok(self
            .followers
            .read()
            .await
            .values()
            .filter(|f| f.is_eligible())
            .cloned()
            .collect())
    }

    async fn get_follower(&self, follower_id: &str) -> Result<Option<Follower>, StoreError> {
        Ok(self.followers.read().await.get(follower_id).cloned())
    }
}
