//! Token broker
//!
//! Hands out a currently valid bearer credential for an account, refreshing
//! it through the account's platform adapter when it is close to expiry.
//! Rotated credentials are sealed with the vault before they are stored.
//!
//! Refreshes for one account are serialized with an in-process lock, and the
//! write is a compare-and-swap on `credential_version`, so a rotation that
//! raced with another writer never overwrites the newer pair.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use sqlx::Row;
use tracing::{info, warn};

use crate::db::{from_opt_ts, Database};
use crate::error::{AdapterError, CadenceError, DbError, PublishError, Result, ScheduleError};
use crate::locks::KeyedLocks;
use crate::platforms::{AdapterRegistry, IssuedCredential};
use crate::types::{Account, AccountStatus};
use crate::vault::Vault;

/// Credentials closer than this to expiry are refreshed before use
pub const REFRESH_BUFFER_SECS: i64 = 5 * 60;

/// Sealed credential columns of one account row
pub(crate) struct SealedCredential {
    access: Option<Vec<u8>>,
    refresh: Option<Vec<u8>>,
    expires_at: Option<DateTime<Utc>>,
    version: i64,
}

pub struct TokenBroker {
    db: Arc<Database>,
    vault: Arc<dyn Vault>,
    registry: Arc<AdapterRegistry>,
    locks: KeyedLocks,
}

impl TokenBroker {
    pub fn new(db: Arc<Database>, vault: Arc<dyn Vault>, registry: Arc<AdapterRegistry>) -> Self {
        Self {
            db,
            vault,
            registry,
            locks: KeyedLocks::new(),
        }
    }

    /// A bearer credential valid for at least the refresh buffer.
    ///
    /// Fails with [`PublishError::CredentialUnavailable`]; `terminal` is set
    /// when retrying cannot help until the account is reconnected.
    pub async fn get_valid_credential(&self, account_id: &str) -> Result<SecretString> {
        let lock = self.locks.get(account_id);
        let _guard = lock.lock().await;

        let account = self.load_account(account_id).await?;
        let sealed = load_sealed(&self.db, account_id).await?;

        let access = match &sealed.access {
            Some(access) => access,
            None => return Err(unavailable(account_id, "NotConnected", "no credential stored", true)),
        };

        let now = Utc::now();
        let fresh = sealed
            .expires_at
            .map_or(true, |expires| expires - now > Duration::seconds(REFRESH_BUFFER_SECS));
        if fresh {
            return self.open(account_id, access);
        }

        let Some(refresh) = &sealed.refresh else {
            if sealed.expires_at.is_some_and(|expires| expires <= now) {
                self.db
                    .set_account_status(account_id, AccountStatus::Expired)
                    .await?;
                warn!(account_id, "credential expired and no refresh secret is stored");
                return Err(unavailable(
                    account_id,
                    "CredentialExpired",
                    "credential expired; reconnect the account",
                    true,
                ));
            }
            // Inside the buffer but still valid, and nothing to refresh with
            return self.open(account_id, access);
        };

        let adapter = self.registry.get(&account.platform).ok_or_else(|| {
            unavailable(
                account_id,
                "PlatformUnavailable",
                &format!("no adapter registered for '{}'", account.platform),
                true,
            )
        })?;

        let refresh_secret = self.open(account_id, refresh)?;
        match adapter.refresh(&refresh_secret).await {
            Ok(issued) => {
                let rotated = self
                    .rotate(account_id, &sealed, &issued)
                    .await
                    .map_err(|e| vault_failure(account_id, e))?;
                if rotated {
                    info!(account_id, expires_at = ?issued.expires_at, "refreshed credential");
                    Ok(issued.access_token)
                } else {
                    // Someone else rotated first; use what they stored
                    let current = load_sealed(&self.db, account_id).await?;
                    match current.access {
                        Some(access) => self.open(account_id, &access),
                        None => Err(unavailable(
                            account_id,
                            "RefreshUnavailable",
                            "credential changed during refresh",
                            false,
                        )),
                    }
                }
            }
            Err(AdapterError::InvalidGrant { message }) => {
                self.expire(account_id).await?;
                warn!(account_id, %message, "refresh grant rejected; account expired");
                Err(unavailable(account_id, "InvalidGrant", &message, true))
            }
            Err(AdapterError::Client { code, message }) => {
                self.expire(account_id).await?;
                warn!(account_id, %code, %message, "refresh rejected; account expired");
                Err(unavailable(account_id, &code, &message, true))
            }
            Err(e) => {
                warn!(account_id, error = %e, "refresh failed transiently");
                Err(unavailable(account_id, "RefreshUnavailable", &e.to_string(), false))
            }
        }
    }

    /// Exchange an authorization code and store the resulting credential.
    ///
    /// This is the reconnect path: the account returns to `active`.
    pub async fn connect_account(&self, account_id: &str, code: &str) -> Result<Account> {
        let lock = self.locks.get(account_id);
        let _guard = lock.lock().await;

        let account = self.load_account(account_id).await?;
        let adapter = self.registry.get(&account.platform).ok_or_else(|| {
            unavailable(
                account_id,
                "PlatformUnavailable",
                &format!("no adapter registered for '{}'", account.platform),
                true,
            )
        })?;

        let issued = adapter
            .exchange_for_credential(code)
            .await
            .map_err(|e| unavailable(account_id, "ExchangeFailed", &e.to_string(), true))?;

        self.replace(account_id, &issued).await?;
        info!(account_id, platform = %account.platform, "account connected");
        self.load_account(account_id).await
    }

    /// Store a credential pair obtained out of band and reactivate the account
    pub async fn store_credential(&self, account_id: &str, issued: &IssuedCredential) -> Result<()> {
        let lock = self.locks.get(account_id);
        let _guard = lock.lock().await;

        self.load_account(account_id).await?;
        self.replace(account_id, issued).await
    }

    fn open(&self, account_id: &str, sealed: &[u8]) -> Result<SecretString> {
        self.vault.open(sealed).map_err(|e| vault_failure(account_id, e))
    }

    async fn load_account(&self, account_id: &str) -> Result<Account> {
        Ok(self
            .db
            .get_account(account_id)
            .await?
            .ok_or_else(|| ScheduleError::UnknownAccount(account_id.to_string()))?)
    }

    fn seal_pair(&self, issued: &IssuedCredential) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        use secrecy::ExposeSecret;

        let access = self.vault.seal(issued.access_token.expose_secret())?;
        let refresh = issued
            .refresh_token
            .as_ref()
            .map(|r| self.vault.seal(r.expose_secret()))
            .transpose()?;
        Ok((access, refresh))
    }

    /// Compare-and-swap the rotated pair. A platform that did not issue a new
    /// refresh secret keeps the old one.
    async fn rotate(
        &self,
        account_id: &str,
        previous: &SealedCredential,
        issued: &IssuedCredential,
    ) -> Result<bool> {
        let (access, refresh) = self.seal_pair(issued)?;
        let refresh = refresh.or_else(|| previous.refresh.clone());

        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET sealed_access = ?, sealed_refresh = ?, credential_expires_at = ?,
                credential_version = credential_version + 1, status = 'active', updated_at = ?
            WHERE id = ? AND credential_version = ?
            "#,
        )
        .bind(access)
        .bind(refresh)
        .bind(issued.expires_at.map(|t| t.timestamp()))
        .bind(Utc::now().timestamp())
        .bind(account_id)
        .bind(previous.version)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn replace(&self, account_id: &str, issued: &IssuedCredential) -> Result<()> {
        let (access, refresh) = self.seal_pair(issued)?;

        sqlx::query(
            r#"
            UPDATE accounts
            SET sealed_access = ?, sealed_refresh = ?, credential_expires_at = ?,
                credential_version = credential_version + 1, status = 'active', updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access)
        .bind(refresh)
        .bind(issued.expires_at.map(|t| t.timestamp()))
        .bind(Utc::now().timestamp())
        .bind(account_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Mark the account expired and drop the refresh secret the platform
    /// refused, so no further refresh is attempted until reconnect
    async fn expire(&self, account_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET status = 'expired', sealed_refresh = NULL,
                credential_version = credential_version + 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(account_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

fn unavailable(
    account_id: &str,
    code: &str,
    message: &str,
    terminal: bool,
) -> CadenceError {
    PublishError::CredentialUnavailable {
        account_id: account_id.to_string(),
        code: code.to_string(),
        message: message.to_string(),
        terminal,
    }
    .into()
}

/// A stored secret the vault cannot open or seal makes this account
/// unusable until it is reconnected; siblings are unaffected
fn vault_failure(account_id: &str, err: CadenceError) -> CadenceError {
    match err {
        CadenceError::Credential(e) => {
            warn!(account_id, error = %e, "vault failure while serving credential");
            unavailable(account_id, "CredentialUnavailable", &e.to_string(), true)
        }
        other => other,
    }
}

pub(crate) async fn load_sealed(db: &Database, account_id: &str) -> Result<SealedCredential> {
    let row = sqlx::query(
        r#"
        SELECT sealed_access, sealed_refresh, credential_expires_at, credential_version
        FROM accounts WHERE id = ?
        "#,
    )
    .bind(account_id)
    .fetch_optional(db.pool())
    .await
    .map_err(DbError::SqlxError)?
    .ok_or_else(|| ScheduleError::UnknownAccount(account_id.to_string()))?;

    Ok(SealedCredential {
        access: row.try_get("sealed_access").map_err(DbError::SqlxError)?,
        refresh: row.try_get("sealed_refresh").map_err(DbError::SqlxError)?,
        expires_at: from_opt_ts(row.try_get("credential_expires_at").map_err(DbError::SqlxError)?)?,
        version: row.try_get("credential_version").map_err(DbError::SqlxError)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockAdapter;
    use crate::vault::AgeVault;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    struct Fixture {
        db: Arc<Database>,
        broker: TokenBroker,
        adapter: Arc<MockAdapter>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::new(dir.path().join("broker.db").to_str().unwrap())
                .await
                .unwrap(),
        );
        db.upsert_account(&Account::new("acct", "mock")).await.unwrap();

        let adapter = Arc::new(MockAdapter::new("mock"));
        let mut registry = AdapterRegistry::new();
        registry.register(adapter.clone());

        let broker = TokenBroker::new(
            db.clone(),
            Arc::new(AgeVault::generate()),
            Arc::new(registry),
        );
        Fixture {
            db,
            broker,
            adapter,
            _dir: dir,
        }
    }

    fn issued(access: &str, refresh: Option<&str>, expires_in: Option<i64>) -> IssuedCredential {
        IssuedCredential {
            access_token: SecretString::from(access.to_string()),
            refresh_token: refresh.map(|r| SecretString::from(r.to_string())),
            expires_at: expires_in.map(|s| Utc::now() + Duration::seconds(s)),
        }
    }

    fn terminal_code(err: CadenceError) -> (String, bool) {
        match err {
            CadenceError::Publish(PublishError::CredentialUnavailable { code, terminal, .. }) => {
                (code, terminal)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_fresh_credential_returned_without_refresh() {
        let f = fixture().await;
        f.broker
            .store_credential("acct", &issued("live", Some("r"), Some(3600)))
            .await
            .unwrap();

        let token = f.broker.get_valid_credential("acct").await.unwrap();
        assert_eq!(token.expose_secret(), "live");
        assert_eq!(f.adapter.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_non_expiring_credential() {
        let f = fixture().await;
        f.broker
            .store_credential("acct", &issued("forever", None, None))
            .await
            .unwrap();

        let token = f.broker.get_valid_credential("acct").await.unwrap();
        assert_eq!(token.expose_secret(), "forever");
    }

    #[tokio::test]
    async fn test_near_expiry_refreshes_and_persists() {
        let f = fixture().await;
        f.broker
            .store_credential("acct", &issued("old", Some("r"), Some(60)))
            .await
            .unwrap();
        let before = load_sealed(&f.db, "acct").await.unwrap().version;

        let token = f.broker.get_valid_credential("acct").await.unwrap();
        assert_eq!(token.expose_secret(), "refreshed-access-1");
        assert_eq!(f.adapter.refresh_count(), 1);

        let after = load_sealed(&f.db, "acct").await.unwrap();
        assert_eq!(after.version, before + 1);

        // Stored pair is now fresh, so no second refresh
        let again = f.broker.get_valid_credential("acct").await.unwrap();
        assert_eq!(again.expose_secret(), "refreshed-access-1");
        assert_eq!(f.adapter.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_grant_expires_account_and_drops_refresh() {
        let f = fixture().await;
        f.broker
            .store_credential("acct", &issued("old", Some("r"), Some(-10)))
            .await
            .unwrap();
        f.adapter.push_refresh(Err(AdapterError::InvalidGrant {
            message: "revoked".to_string(),
        }));

        let err = f.broker.get_valid_credential("acct").await.unwrap_err();
        assert_eq!(terminal_code(err), ("InvalidGrant".to_string(), true));

        let account = f.db.get_account("acct").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Expired);

        // No further refresh attempts until reconnect
        let err = f.broker.get_valid_credential("acct").await.unwrap_err();
        assert_eq!(terminal_code(err), ("CredentialExpired".to_string(), true));
        assert_eq!(f.adapter.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_keeps_status() {
        let f = fixture().await;
        f.broker
            .store_credential("acct", &issued("old", Some("r"), Some(10)))
            .await
            .unwrap();
        f.adapter.push_refresh(Err(AdapterError::Transport("timeout".to_string())));

        let err = f.broker.get_valid_credential("acct").await.unwrap_err();
        assert_eq!(terminal_code(err), ("RefreshUnavailable".to_string(), false));
        assert_eq!(
            f.db.get_account("acct").await.unwrap().unwrap().status,
            AccountStatus::Active
        );
    }

    #[tokio::test]
    async fn test_expired_without_refresh_secret_skips_adapter() {
        let f = fixture().await;
        f.broker
            .store_credential("acct", &issued("old", None, Some(-10)))
            .await
            .unwrap();

        let err = f.broker.get_valid_credential("acct").await.unwrap_err();
        assert_eq!(terminal_code(err), ("CredentialExpired".to_string(), true));
        assert_eq!(f.adapter.refresh_count(), 0);
        assert_eq!(
            f.db.get_account("acct").await.unwrap().unwrap().status,
            AccountStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_not_connected() {
        let f = fixture().await;
        let err = f.broker.get_valid_credential("acct").await.unwrap_err();
        assert_eq!(terminal_code(err), ("NotConnected".to_string(), true));
    }

    #[tokio::test]
    async fn test_connect_account_reactivates() {
        let f = fixture().await;
        f.db.set_account_status("acct", AccountStatus::Expired)
            .await
            .unwrap();

        let account = f.broker.connect_account("acct", "code42").await.unwrap();
        assert_eq!(account.status, AccountStatus::Active);
        assert!(account.credential_expires_at.is_some());
        assert_eq!(f.adapter.exchange_count(), 1);

        let token = f.broker.get_valid_credential("acct").await.unwrap();
        assert_eq!(token.expose_secret(), "code42-access-1");
    }

    #[tokio::test]
    async fn test_concurrent_refresh_happens_once() {
        let f = fixture().await;
        f.broker
            .store_credential("acct", &issued("old", Some("r"), Some(30)))
            .await
            .unwrap();
        let broker = Arc::new(f.broker);

        let mut handles = vec![];
        for _ in 0..4 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                broker.get_valid_credential("acct").await
            }));
        }
        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.expose_secret(), "refreshed-access-1");
        }
        assert_eq!(f.adapter.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_stored_credentials_are_sealed() {
        let f = fixture().await;
        f.broker
            .store_credential("acct", &issued("plain-token", Some("plain-refresh"), None))
            .await
            .unwrap();

        let sealed = load_sealed(&f.db, "acct").await.unwrap();
        let access = sealed.access.unwrap();
        assert!(!access.windows(11).any(|w| w == b"plain-token"));
    }

    #[tokio::test]
    async fn test_unopenable_secret_is_terminal_for_the_account() {
        let f = fixture().await;
        f.broker
            .store_credential("acct", &issued("sealed-elsewhere", None, Some(3600)))
            .await
            .unwrap();

        // Same rows, different identity
        let registry = Arc::new(AdapterRegistry::new());
        let other = TokenBroker::new(f.db.clone(), Arc::new(AgeVault::generate()), registry);

        let (code, terminal) = terminal_code(other.get_valid_credential("acct").await.unwrap_err());
        assert_eq!(code, "CredentialUnavailable");
        assert!(terminal);
        assert_eq!(
            f.db.get_account("acct").await.unwrap().unwrap().status,
            AccountStatus::Active
        );
    }
}
