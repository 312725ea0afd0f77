//! Database operations for Cadence

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteRow};
use sqlx::Row;

use crate::error::{DbError, Result};
use crate::types::{
    Account, AccountStatus, ContentItem, ContentStatus, OutcomeStatus, Payload, PayloadOverride,
    PublishOutcome, RecurrenceRule, SlotTime,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(DbError::SqlxError)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ----- accounts -----

    /// Insert an account or update its platform and display name
    pub async fn upsert_account(&self, account: &Account) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO accounts (id, platform, display_name, status, credential_expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                platform = excluded.platform,
                display_name = excluded.display_name,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.id)
        .bind(&account.platform)
        .bind(&account.display_name)
        .bind(account.status.as_str())
        .bind(account.credential_expires_at.map(|t| t.timestamp()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT id, platform, display_name, status, credential_expires_at
            FROM accounts WHERE id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| account_from_row(&r)).transpose()
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            r#"
            SELECT id, platform, display_name, status, credential_expires_at
            FROM accounts ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(account_from_row).collect()
    }

    pub async fn set_account_status(&self, account_id: &str, status: AccountStatus) -> Result<()> {
        sqlx::query("UPDATE accounts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ----- recurrence rules -----

    /// Create or replace an account's recurrence rule
    pub async fn put_rule(&self, rule: &RecurrenceRule) -> Result<()> {
        let times = serde_json::to_string(&rule.times).map_err(DbError::from)?;
        let weekdays = serde_json::to_string(&rule.weekdays).map_err(DbError::from)?;

        sqlx::query(
            r#"
            INSERT INTO recurrence_rules (account_id, times, weekdays, timezone, max_per_day, paused, skip_next, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                times = excluded.times,
                weekdays = excluded.weekdays,
                timezone = excluded.timezone,
                max_per_day = excluded.max_per_day,
                paused = excluded.paused,
                skip_next = excluded.skip_next,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rule.account_id)
        .bind(times)
        .bind(weekdays)
        .bind(&rule.timezone)
        .bind(rule.max_per_day.map(i64::from))
        .bind(rule.paused)
        .bind(rule.skip_next)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_rule(&self, account_id: &str) -> Result<Option<RecurrenceRule>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, times, weekdays, timezone, max_per_day, paused, skip_next
            FROM recurrence_rules WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| rule_from_row(&r)).transpose()
    }

    /// Returns false when the account has no rule
    pub async fn set_rule_paused(&self, account_id: &str, paused: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE recurrence_rules SET paused = ?, updated_at = ? WHERE account_id = ?",
        )
        .bind(paused)
        .bind(Utc::now().timestamp())
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns false when the account has no rule
    pub async fn set_skip_next(&self, account_id: &str, skip: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE recurrence_rules SET skip_next = ?, updated_at = ? WHERE account_id = ?",
        )
        .bind(skip)
        .bind(Utc::now().timestamp())
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Clear `skip_next` if it is set. Returns whether this call consumed it.
    pub async fn consume_skip_next(&self, account_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recurrence_rules SET skip_next = 0, updated_at = ?
            WHERE account_id = ? AND skip_next = 1
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ----- content items -----

    pub async fn create_content(&self, item: &ContentItem) -> Result<()> {
        let body = serde_json::to_string(&item.body).map_err(DbError::from)?;
        let targets = serde_json::to_string(&item.targets).map_err(DbError::from)?;
        let variants = serde_json::to_string(&item.variants).map_err(DbError::from)?;

        sqlx::query(
            r#"
            INSERT INTO content_items (id, body, targets, variants, status, due_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(body)
        .bind(targets)
        .bind(variants)
        .bind(item.status.as_str())
        .bind(item.due_at.map(|t| t.timestamp()))
        .bind(item.created_at.timestamp())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_content(&self, content_id: &str) -> Result<Option<ContentItem>> {
        let row = sqlx::query(
            r#"
            SELECT id, body, targets, variants, status, due_at, last_error_code, last_error_message, created_at
            FROM content_items WHERE id = ?
            "#,
        )
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| content_from_row(&r)).transpose()
    }

    pub async fn set_content_status(&self, content_id: &str, status: ContentStatus) -> Result<()> {
        sqlx::query("UPDATE content_items SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(content_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Compare-and-set the item status. Returns false if the item was not in
    /// `from`, which means someone else moved it first.
    pub async fn transition_content(
        &self,
        content_id: &str,
        from: ContentStatus,
        to: ContentStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE content_items SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(Utc::now().timestamp())
        .bind(content_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Move the item to `failed` with its first failure, if it is still in `from`
    pub async fn fail_content(
        &self,
        content_id: &str,
        from: ContentStatus,
        code: &str,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE content_items
            SET status = 'failed', last_error_code = ?, last_error_message = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(code)
        .bind(message)
        .bind(Utc::now().timestamp())
        .bind(content_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Record the item's failure fields without changing its status
    pub async fn set_content_error(&self, content_id: &str, code: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE content_items SET last_error_code = ?, last_error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(code)
        .bind(message)
        .bind(Utc::now().timestamp())
        .bind(content_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// List items in a given status, oldest first
    pub async fn list_content_by_status(&self, status: ContentStatus) -> Result<Vec<ContentItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, body, targets, variants, status, due_at, last_error_code, last_error_message, created_at
            FROM content_items WHERE status = ? ORDER BY created_at, id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(content_from_row).collect()
    }

    // ----- publish outcomes -----

    /// Insert or replace the latest outcome for (content, account)
    pub async fn upsert_outcome(&self, outcome: &PublishOutcome) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publish_outcomes
                (content_id, account_id, status, platform_id, platform_url, error_code, error_message, attempted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_id, account_id) DO UPDATE SET
                status = excluded.status,
                platform_id = excluded.platform_id,
                platform_url = excluded.platform_url,
                error_code = excluded.error_code,
                error_message = excluded.error_message,
                attempted_at = excluded.attempted_at
            "#,
        )
        .bind(&outcome.content_id)
        .bind(&outcome.account_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.platform_id)
        .bind(&outcome.platform_url)
        .bind(&outcome.error_code)
        .bind(&outcome.error_message)
        .bind(outcome.attempted_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// All outcomes for an item, keyed by account id
    pub async fn get_outcomes(&self, content_id: &str) -> Result<HashMap<String, PublishOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT content_id, account_id, status, platform_id, platform_url, error_code, error_message, attempted_at
            FROM publish_outcomes WHERE content_id = ?
            "#,
        )
        .bind(content_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut outcomes = HashMap::with_capacity(rows.len());
        for row in &rows {
            let outcome = outcome_from_row(row)?;
            outcomes.insert(outcome.account_id.clone(), outcome);
        }
        Ok(outcomes)
    }
}

pub(crate) fn from_ts(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DbError::Corrupt(format!("timestamp out of range: {}", secs)).into())
}

pub(crate) fn from_opt_ts(secs: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    secs.map(from_ts).transpose()
}

fn account_from_row(r: &SqliteRow) -> Result<Account> {
    let status: String = r.try_get("status").map_err(DbError::SqlxError)?;
    Ok(Account {
        id: r.try_get("id").map_err(DbError::SqlxError)?,
        platform: r.try_get("platform").map_err(DbError::SqlxError)?,
        display_name: r.try_get("display_name").map_err(DbError::SqlxError)?,
        status: AccountStatus::parse(&status)
            .ok_or_else(|| DbError::Corrupt(format!("account status '{}'", status)))?,
        credential_expires_at: from_opt_ts(
            r.try_get("credential_expires_at").map_err(DbError::SqlxError)?,
        )?,
    })
}

fn rule_from_row(r: &SqliteRow) -> Result<RecurrenceRule> {
    let times: String = r.try_get("times").map_err(DbError::SqlxError)?;
    let weekdays: String = r.try_get("weekdays").map_err(DbError::SqlxError)?;
    let max_per_day: Option<i64> = r.try_get("max_per_day").map_err(DbError::SqlxError)?;

    Ok(RecurrenceRule {
        account_id: r.try_get("account_id").map_err(DbError::SqlxError)?,
        times: serde_json::from_str::<Vec<SlotTime>>(&times).map_err(DbError::from)?,
        weekdays: serde_json::from_str(&weekdays).map_err(DbError::from)?,
        timezone: r.try_get("timezone").map_err(DbError::SqlxError)?,
        max_per_day: max_per_day.map(|m| m.max(0) as u32),
        paused: r.try_get("paused").map_err(DbError::SqlxError)?,
        skip_next: r.try_get("skip_next").map_err(DbError::SqlxError)?,
    })
}

fn content_from_row(r: &SqliteRow) -> Result<ContentItem> {
    let body: String = r.try_get("body").map_err(DbError::SqlxError)?;
    let targets: String = r.try_get("targets").map_err(DbError::SqlxError)?;
    let variants: String = r.try_get("variants").map_err(DbError::SqlxError)?;
    let status: String = r.try_get("status").map_err(DbError::SqlxError)?;

    Ok(ContentItem {
        id: r.try_get("id").map_err(DbError::SqlxError)?,
        body: serde_json::from_str::<Payload>(&body).map_err(DbError::from)?,
        targets: serde_json::from_str(&targets).map_err(DbError::from)?,
        variants: serde_json::from_str::<HashMap<String, PayloadOverride>>(&variants)
            .map_err(DbError::from)?,
        status: ContentStatus::parse(&status)
            .ok_or_else(|| DbError::Corrupt(format!("content status '{}'", status)))?,
        due_at: from_opt_ts(r.try_get("due_at").map_err(DbError::SqlxError)?)?,
        last_error_code: r.try_get("last_error_code").map_err(DbError::SqlxError)?,
        last_error_message: r.try_get("last_error_message").map_err(DbError::SqlxError)?,
        created_at: from_ts(r.try_get("created_at").map_err(DbError::SqlxError)?)?,
    })
}

fn outcome_from_row(r: &SqliteRow) -> Result<PublishOutcome> {
    let status: String = r.try_get("status").map_err(DbError::SqlxError)?;
    let status = match status.as_str() {
        "published" => OutcomeStatus::Published,
        "failed" => OutcomeStatus::Failed,
        other => return Err(DbError::Corrupt(format!("outcome status '{}'", other)).into()),
    };

    Ok(PublishOutcome {
        content_id: r.try_get("content_id").map_err(DbError::SqlxError)?,
        account_id: r.try_get("account_id").map_err(DbError::SqlxError)?,
        status,
        platform_id: r.try_get("platform_id").map_err(DbError::SqlxError)?,
        platform_url: r.try_get("platform_url").map_err(DbError::SqlxError)?,
        error_code: r.try_get("error_code").map_err(DbError::SqlxError)?,
        error_message: r.try_get("error_message").map_err(DbError::SqlxError)?,
        attempted_at: from_ts(r.try_get("attempted_at").map_err(DbError::SqlxError)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CadenceError;
    use tempfile::TempDir;

    async fn test_db() -> (Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cadence.db");
        let db = Database::new(path.to_str().unwrap()).await.unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn test_database_initialization_with_invalid_path() {
        #[cfg(unix)]
        let invalid_path = "/tmp/cadence\0invalid.db";
        #[cfg(windows)]
        let invalid_path = "C:\\invalid<>path\\cadence.db";

        let result = Database::new(invalid_path).await;
        assert!(matches!(result, Err(CadenceError::Database(_))));
    }

    #[tokio::test]
    async fn test_database_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("cadence.db");
        Database::new(path.to_str().unwrap()).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_account_round_trip_and_status() {
        let (db, _dir) = test_db().await;
        db.upsert_account(&Account::new("alice", "mock")).await.unwrap();

        let account = db.get_account("alice").await.unwrap().unwrap();
        assert_eq!(account.platform, "mock");
        assert_eq!(account.status, AccountStatus::Active);

        db.set_account_status("alice", AccountStatus::Revoked).await.unwrap();
        let account = db.get_account("alice").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Revoked);

        // Re-upsert keeps status
        db.upsert_account(&Account::new("alice", "webhook")).await.unwrap();
        let account = db.get_account("alice").await.unwrap().unwrap();
        assert_eq!(account.platform, "webhook");
        assert_eq!(account.status, AccountStatus::Revoked);

        assert!(db.get_account("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rule_round_trip() {
        let (db, _dir) = test_db().await;
        db.upsert_account(&Account::new("alice", "mock")).await.unwrap();

        let rule = RecurrenceRule::new("alice", "America/New_York")
            .with_times([SlotTime::new(9, 0).unwrap(), SlotTime::new(18, 30).unwrap()])
            .with_weekdays([1, 3, 5])
            .with_max_per_day(2);
        db.put_rule(&rule).await.unwrap();

        let loaded = db.get_rule("alice").await.unwrap().unwrap();
        assert_eq!(loaded, rule);
    }

    #[tokio::test]
    async fn test_skip_next_consumed_once() {
        let (db, _dir) = test_db().await;
        db.upsert_account(&Account::new("alice", "mock")).await.unwrap();
        db.put_rule(&RecurrenceRule::new("alice", "UTC")).await.unwrap();

        assert!(!db.consume_skip_next("alice").await.unwrap());
        assert!(db.set_skip_next("alice", true).await.unwrap());
        assert!(db.consume_skip_next("alice").await.unwrap());
        assert!(!db.consume_skip_next("alice").await.unwrap());

        assert!(!db.set_skip_next("nobody", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_content_round_trip() {
        let (db, _dir) = test_db().await;
        let item = ContentItem::new(Payload::text("hello"), vec!["a".into(), "b".into()])
            .with_variant(
                "b",
                PayloadOverride {
                    text: Some("hi".into()),
                    ..Default::default()
                },
            );
        db.create_content(&item).await.unwrap();

        let loaded = db.get_content(&item.id).await.unwrap().unwrap();
        assert_eq!(loaded.targets, item.targets);
        assert_eq!(loaded.variants, item.variants);
        assert_eq!(loaded.status, ContentStatus::Draft);
        assert_eq!(loaded.created_at.timestamp(), item.created_at.timestamp());
    }

    #[tokio::test]
    async fn test_transition_content_is_compare_and_set() {
        let (db, _dir) = test_db().await;
        let item = ContentItem::new(Payload::text("hello"), vec!["a".into()]);
        db.create_content(&item).await.unwrap();

        assert!(!db
            .transition_content(&item.id, ContentStatus::Publishing, ContentStatus::Published)
            .await
            .unwrap());
        assert!(db
            .transition_content(&item.id, ContentStatus::Draft, ContentStatus::Scheduled)
            .await
            .unwrap());

        assert!(!db
            .fail_content(&item.id, ContentStatus::Publishing, "ServerError", "boom")
            .await
            .unwrap());
        let loaded = db.get_content(&item.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ContentStatus::Scheduled);
        assert!(loaded.last_error_code.is_none());
    }

    #[tokio::test]
    async fn test_outcome_upsert_keeps_latest() {
        let (db, _dir) = test_db().await;
        db.upsert_account(&Account::new("a", "mock")).await.unwrap();
        let item = ContentItem::new(Payload::text("hello"), vec!["a".into()]);
        db.create_content(&item).await.unwrap();

        db.upsert_outcome(&PublishOutcome::failed(&item.id, "a", "ServerError", "503".into()))
            .await
            .unwrap();
        db.upsert_outcome(&PublishOutcome::published(&item.id, "a", "p-1".into(), None))
            .await
            .unwrap();

        let outcomes = db.get_outcomes(&item.id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes["a"];
        assert_eq!(outcome.status, OutcomeStatus::Published);
        assert_eq!(outcome.platform_id.as_deref(), Some("p-1"));
        assert!(outcome.error_code.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_content_creation() {
        let (db, _dir) = test_db().await;

        let mut handles = vec![];
        for i in 0..5 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let item = ContentItem::new(Payload::text(format!("post {}", i)), vec![]);
                db.create_content(&item).await.map(|_| item.id)
            }));
        }

        for handle in handles {
            let id = handle.await.unwrap().unwrap();
            assert!(db.get_content(&id).await.unwrap().is_some());
        }
    }
}
