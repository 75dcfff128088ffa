// Access guard: authentication and authorization for listing mutations and operator actions.
//
// Purpose
// - Authenticate bearer tokens against the currently trusted key set.
// - Decide whether a principal may perform an action on a resource.
//
// Responsibilities
// - Owners may mutate their own listings, elevated roles may mutate any listing.
// - Operator actions on the sync queue require an elevated role.
// - The trusted key set can be swapped at runtime without blocking verification.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::modules::access::core::principal::Principal;
use crate::modules::access::core::token_verifier::{KeySet, TokenError, TokenVerifier};

pub const DEFAULT_ELEVATED_ROLE: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateListing,
    UpdateListing,
    DeleteListing,
    OperateSync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// A listing owned by `owner_id`. For creates, the owner the new listing will have.
    Listing { owner_id: String },
    SyncQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DenyReason {
    #[error("only the owner or an elevated role may change this listing")]
    NotOwner,

    #[error("an elevated role is required")]
    ElevatedRoleRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny(DenyReason),
}

impl AccessDecision {
    pub fn into_result(self) -> Result<(), DenyReason> {
        match self {
            AccessDecision::Allow => Ok(()),
            AccessDecision::Deny(reason) => Err(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    pub elevated_roles: BTreeSet<String>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            elevated_roles: BTreeSet::from([DEFAULT_ELEVATED_ROLE.to_string()]),
        }
    }
}

impl AccessPolicy {
    pub fn new(elevated_roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            elevated_roles: elevated_roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_elevated(&self, principal: &Principal) -> bool {
        principal.has_any_role(&self.elevated_roles)
    }

    pub fn authorize(&self, principal: &Principal, action: Action, resource: &Resource) -> AccessDecision {
        if self.is_elevated(principal) {
            return AccessDecision::Allow;
        }
        match (action, resource) {
            (Action::OperateSync, _) | (_, Resource::SyncQueue) => {
                AccessDecision::Deny(DenyReason::ElevatedRoleRequired)
            }
            (_, Resource::Listing { owner_id }) if *owner_id == principal.subject => AccessDecision::Allow,
            (_, Resource::Listing { .. }) => AccessDecision::Deny(DenyReason::NotOwner),
        }
    }
}

pub struct AccessGuard {
    verifier: RwLock<Arc<TokenVerifier>>,
    policy: AccessPolicy,
}

impl AccessGuard {
    pub fn new(verifier: TokenVerifier, policy: AccessPolicy) -> Self {
        Self {
            verifier: RwLock::new(Arc::new(verifier)),
            policy,
        }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Verify the bearer token of a request. A missing token is an authentication failure.
    pub fn authenticate(&self, token: Option<&str>, now: DateTime<Utc>) -> Result<Principal, TokenError> {
        let token = token.ok_or(TokenError::Missing)?;
        self.current_verifier().verify(token, now)
    }

    pub fn authorize(&self, principal: &Principal, action: Action, resource: &Resource) -> AccessDecision {
        self.policy.authorize(principal, action, resource)
    }

    /// Swap the trusted key set. Verifications already in progress finish with the old set.
    pub fn replace_keys(&self, keys: KeySet) {
        let mut verifier = self.verifier.write().unwrap_or_else(PoisonError::into_inner);
        let next = verifier.with_keys(keys);
        tracing::info!(kids = ?kid_names(&next), "trusted signing keys replaced");
        *verifier = Arc::new(next);
    }

    pub fn kids(&self) -> Vec<String> {
        kid_names(&self.current_verifier())
    }

    fn current_verifier(&self) -> Arc<TokenVerifier> {
        self.verifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn kid_names(verifier: &TokenVerifier) -> Vec<String> {
    verifier.kids().into_iter().map(str::to_string).collect()
}
