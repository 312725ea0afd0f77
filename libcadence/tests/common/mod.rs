//! Shared setup for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use libcadence::platforms::mock::MockAdapter;
use libcadence::platforms::{AdapterRegistry, IssuedCredential};
use libcadence::vault::AgeVault;
use libcadence::{Account, CadenceService, Config, Database};
use secrecy::SecretString;
use tempfile::TempDir;

pub struct Harness {
    pub service: CadenceService,
    pub db: Arc<Database>,
    pub alpha: Arc<MockAdapter>,
    pub beta: Arc<MockAdapter>,
    _dir: TempDir,
}

/// Two accounts, `a` on platform `alpha` and `b` on `beta`, both connected
/// with credentials valid for an hour
pub async fn harness() -> Harness {
    harness_with(MockAdapter::new("alpha")).await
}

/// Same as [`harness`] with a custom `alpha` adapter, e.g. a slow one
pub async fn harness_with(alpha: MockAdapter) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default_config();
    config.database.path = dir.path().join("cadence.db").to_string_lossy().into_owned();

    let db = Arc::new(Database::new(&config.database.path).await.unwrap());
    let alpha = Arc::new(alpha);
    let beta = Arc::new(MockAdapter::new("beta"));

    let mut registry = AdapterRegistry::new();
    registry.register(alpha.clone());
    registry.register(beta.clone());

    let service =
        CadenceService::from_parts(config, db.clone(), Arc::new(AgeVault::generate()), Arc::new(registry));

    for (id, platform) in [("a", "alpha"), ("b", "beta")] {
        service.add_account(&Account::new(id, platform)).await.unwrap();
        service
            .broker()
            .store_credential(id, &credential(&format!("{}-token", id), Some("refresh"), 3600))
            .await
            .unwrap();
    }

    Harness {
        service,
        db,
        alpha,
        beta,
        _dir: dir,
    }
}

pub fn credential(access: &str, refresh: Option<&str>, expires_in_secs: i64) -> IssuedCredential {
    IssuedCredential {
        access_token: SecretString::from(access.to_string()),
        refresh_token: refresh.map(|r| SecretString::from(r.to_string())),
        expires_at: Some(Utc::now() + Duration::seconds(expires_in_secs)),
    }
}
