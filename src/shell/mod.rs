// Composition root for the marketplace catalog core.
//
// Responsibilities
// - Build the access guard from the configured signing keys.
// - Instantiate the configured listing store backend and the search index.
// - Wire them into the request handlers, the reconciler and the drift sweeper.
// - Let the running process trust a new signing key set.

pub mod config;
pub mod graphql;
pub mod http;
pub mod state;
pub mod workers;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::modules::access::core::access_guard::{AccessGuard, AccessPolicy};
use crate::modules::access::core::token_verifier::{KeySet, TokenVerifier, TrustedKey};
use crate::modules::sync::drift_sweep::DriftSweeper;
use crate::modules::sync::reconciler::Reconciler;
use crate::shared::infrastructure::change_outbox::ChangeOutbox;
use crate::shared::infrastructure::listing_store::ListingStore;
use crate::shared::infrastructure::listing_store::in_memory::InMemoryListingStore;
use crate::shared::infrastructure::listing_store::sqlite::SqliteListingStore;
use crate::shared::infrastructure::search_index::SearchIndex;
use crate::shared::infrastructure::search_index::in_memory::InMemorySearchIndex;
use crate::shell::config::{AuthConfig, Config, StoreBackend};
use crate::shell::state::AppState;
use crate::shell::workers::{SyncWorkers, WorkerIntervals};

pub struct Composition {
    pub state: AppState,
    pub reconciler: Arc<Reconciler<dyn ChangeOutbox, dyn SearchIndex>>,
    pub sweeper: Arc<DriftSweeper<dyn ListingStore, dyn ChangeOutbox, dyn SearchIndex>>,
}

impl Composition {
    pub fn spawn_workers(&self, config: &Config) -> SyncWorkers {
        SyncWorkers::spawn(
            self.reconciler.clone(),
            self.sweeper.clone(),
            self.state.outbox.clone(),
            WorkerIntervals {
                poll_interval: Duration::from_millis(config.sync.poll_interval_ms),
                sweep_interval: Duration::from_millis(config.sync.sweep_interval_ms),
                delivered_retention: Duration::from_millis(config.sync.delivered_retention_ms),
            },
        )
    }

    /// Trust the signing keys of `auth` from now on.
    pub fn rotate_keys(&self, auth: &AuthConfig) -> Result<()> {
        rotate_keys(&self.state.guard, auth)
    }
}

fn key_set(auth: &AuthConfig) -> Result<KeySet> {
    let keys = auth
        .signing_keys
        .iter()
        .map(|key| TrustedKey::from_secret(key.kid.clone(), key.secret.as_bytes()))
        .collect();
    KeySet::new(keys).context("invalid signing key set")
}

pub fn build_guard(auth: &AuthConfig) -> Result<AccessGuard> {
    let verifier = TokenVerifier::new(key_set(auth)?).with_leeway(auth.leeway_secs);
    Ok(AccessGuard::new(verifier, AccessPolicy::new(auth.elevated_roles.iter().cloned())))
}

/// Swap the keys a running guard trusts. An invalid key set leaves the current keys in place.
pub fn rotate_keys(guard: &AccessGuard, auth: &AuthConfig) -> Result<()> {
    guard.replace_keys(key_set(auth)?);
    Ok(())
}

pub async fn compose(config: &Config) -> Result<Composition> {
    let guard = Arc::new(build_guard(&config.auth)?);
    let search_index: Arc<dyn SearchIndex> = Arc::new(InMemorySearchIndex::new());

    let state = match config.store.backend {
        StoreBackend::Memory => {
            tracing::info!("using the in-memory listing store");
            AppState::new(Arc::new(InMemoryListingStore::new()), search_index.clone(), guard)
        }
        StoreBackend::Sqlite => {
            let path = &config.store.sqlite_path;
            tracing::info!(path = %path.display(), "using the sqlite listing store");
            let store = SqliteListingStore::open(path)
                .await
                .with_context(|| format!("cannot start the sqlite listing store at {}", path.display()))?;
            AppState::new(Arc::new(store), search_index.clone(), guard)
        }
    };

    let reconciler = Arc::new(Reconciler::new(
        state.outbox.clone(),
        search_index.clone(),
        config.sync.reconciler_settings(),
    ));
    let sweeper = Arc::new(DriftSweeper::new(
        state.store.clone(),
        state.outbox.clone(),
        search_index,
        config.sync.sweep_sample_size,
    ));
    Ok(Composition {
        state,
        reconciler,
        sweeper,
    })
}

#[cfg(test)]
mod composition_tests {
    use super::*;
    use crate::shell::config::parse_signing_keys;
    use crate::tests::fixtures::tokens::{KID, SECRET, owner_token};
    use chrono::Utc;

    fn config() -> Config {
        let mut config = Config::default();
        let secret = std::str::from_utf8(SECRET).unwrap();
        config.auth.signing_keys = parse_signing_keys(&format!("{KID}:{secret}")).unwrap();
        config
    }

    #[test]
    fn it_should_build_a_guard_that_accepts_tokens_signed_with_a_configured_key() {
        let guard = build_guard(&config().auth).unwrap();
        let principal = guard.authenticate(Some(&owner_token("user-1")), Utc::now()).unwrap();
        assert_eq!(principal.subject, "user-1");
    }

    #[tokio::test]
    async fn it_should_rotate_the_trusted_keys_of_a_running_composition() {
        let composition = compose(&config()).await.unwrap();
        let old_token = owner_token("user-1");

        let mut rotated = config().auth;
        rotated.signing_keys = parse_signing_keys("key-next:next-secret").unwrap();
        composition.rotate_keys(&rotated).unwrap();

        assert_eq!(composition.state.guard.kids(), vec!["key-next".to_string()]);
        assert!(composition.state.guard.authenticate(Some(&old_token), Utc::now()).is_err());
    }

    #[tokio::test]
    async fn it_should_keep_the_current_keys_when_a_rotation_is_invalid() {
        let composition = compose(&config()).await.unwrap();
        let mut invalid = config().auth;
        invalid.signing_keys.clear();

        assert!(composition.rotate_keys(&invalid).is_err());
        assert_eq!(composition.state.guard.kids(), vec![KID.to_string()]);
        assert!(
            composition
                .state
                .guard
                .authenticate(Some(&owner_token("user-1")), Utc::now())
                .is_ok()
        );
    }

    #[test]
    fn it_should_refuse_duplicate_key_ids() {
        let mut auth = config().auth;
        auth.signing_keys = parse_signing_keys("a:one,a:two").unwrap();
        assert!(build_guard(&auth).is_err());
    }

    #[tokio::test]
    async fn it_should_compose_the_in_memory_backend() {
        let composition = compose(&config()).await.unwrap();
        assert!(composition.state.store.get("missing").await.unwrap().is_none());
        let report = composition.reconciler.drain_once(Utc::now()).await.unwrap();
        assert!(report.is_idle());
    }

    #[tokio::test]
    async fn it_should_compose_the_sqlite_backend() {
        let directory = tempfile::tempdir().unwrap();
        let mut config = config();
        config.store.backend = StoreBackend::Sqlite;
        config.store.sqlite_path = directory.path().join("catalog.db");

        let composition = compose(&config).await.unwrap();
        let report = composition.sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.scanned, 0);
    }
}
