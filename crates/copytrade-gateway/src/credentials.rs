//! Credential resolution for gateway launches.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::backoff::{BackoffPolicy, RetryOutcome, retry};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventSink, GatewayEvent};
use crate::follower::Follower;
use crate::vault::{Credentials, VaultClient};

/// Turns a follower record into a broker login.
///
/// A follower with a vault reference is resolved through the vault with
/// retries. Without one, the stored username is passed through and the
/// container is left to complete login on its own.
pub struct CredentialResolver {
    vault: Option<Arc<dyn VaultClient>>,
    policy: BackoffPolicy,
    events: EventSink,
}

impl CredentialResolver {
    /// Create a resolver. `vault` may be `None` when every follower carries
    /// an inline username.
    #[must_use]
    pub fn new(vault: Option<Arc<dyn VaultClient>>, policy: BackoffPolicy, events: EventSink) -> Self {
        Self {
            vault,
            policy,
            events,
        }
    }

    /// Resolve credentials for `follower`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CredentialResolutionFailed`] when the vault
    /// fails every attempt, when a vault reference is set but no vault is
    /// configured, or when the follower has neither a vault reference nor a
    /// username.
    pub async fn resolve(&self, follower: &Follower) -> GatewayResult<Credentials> {
        let Some(secret_ref) = follower.vault_secret_ref.as_deref() else {
            return match follower.ibkr_username.as_deref() {
                Some(username) => {
                    debug!(follower_id = %follower.id, "Using stored username without vault lookup");
                    Ok(Credentials::username_only(username))
                },
                None => Err(GatewayError::CredentialResolutionFailed {
                    follower_id: follower.id.clone(),
                    attempts: 0,
                    reason: "no vault reference and no username".into(),
                }),
            };
        };

        let Some(vault) = self.vault.as_ref() else {
            return Err(GatewayError::CredentialResolutionFailed {
                follower_id: follower.id.clone(),
                attempts: 0,
                reason: "vault reference set but no vault configured".into(),
            });
        };

        let outcome = retry(&self.policy, |attempt| {
            let vault = Arc::clone(vault);
            let follower_id = follower.id.clone();
            async move {
                vault.get_credentials(secret_ref).await.inspect_err(|e| {
                    warn!(%follower_id, attempt, error = %e, "Vault lookup failed");
                })
            }
        })
        .await;

        match outcome {
            RetryOutcome::Success { value, attempts } => {
                debug!(follower_id = %follower.id, attempts, "Resolved credentials from vault");
                Ok(value)
            },
            RetryOutcome::Exhausted { error: e, attempts } => {
                error!(
                    follower_id = %follower.id,
                    attempts,
                    error = %e,
                    "Vault unavailable, abandoning launch for this cycle"
                );
                self.events.emit(GatewayEvent::CredentialsUnavailable {
                    follower_id: follower.id.clone(),
                    reason: e.to_string(),
                });
                Err(GatewayError::CredentialResolutionFailed {
                    follower_id: follower.id.clone(),
                    attempts,
                    reason: e.to_string(),
                })
            },
            RetryOutcome::Aborted { attempts } => Err(GatewayError::CredentialResolutionFailed {
                follower_id: follower.id.clone(),
                attempts,
                reason: "aborted".into(),
            }),
        }
    }
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("has_vault", &self.vault.is_some())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
