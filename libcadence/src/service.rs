//! Service facade
//!
//! `CadenceService` wires the allocator, broker, orchestrator and job queue
//! around one shared database so the binaries (and tests) work against a
//! single entry point. Every operation that changes an item's bookings also
//! brings the item's publish job in line with its new due time.
//!
//! ```no_run
//! use chrono::Utc;
//! use libcadence::allocator::ScheduleMode;
//! use libcadence::service::CadenceService;
//! use libcadence::types::Payload;
//!
//! # async fn example() -> libcadence::Result<()> {
//! let service = CadenceService::new().await?;
//! let item = service
//!     .create_content(Payload::text("weekly digest"), vec!["blog".to_string()])
//!     .await?;
//! let report = service
//!     .schedule(&item.id, Utc::now(), ScheduleMode::Independent)
//!     .await?;
//! println!("due at {:?}", report.earliest_due);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::allocator::{Allocator, ScheduleMode, ScheduleReport};
use crate::broker::TokenBroker;
use crate::config::Config;
use crate::db::Database;
use crate::error::{ConfigError, Result, ScheduleError};
use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::platforms::AdapterRegistry;
use crate::runner::{JobQueue, JobRunner};
use crate::types::{Account, ContentItem, ContentStatus, Payload, QueueSlot, RecurrenceRule};
use crate::vault::{AgeVault, Vault};

pub struct CadenceService {
    config: Arc<Config>,
    db: Arc<Database>,
    allocator: Allocator,
    broker: Arc<TokenBroker>,
    orchestrator: Arc<Orchestrator>,
    jobs: JobQueue,
}

impl CadenceService {
    /// Load configuration from the default location and open everything
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// Open the database, vault identity and configured adapters
    pub async fn from_config(config: Config) -> Result<Self> {
        let db_path = config.database_path();
        let db_path = db_path.to_str().ok_or_else(|| ConfigError::InvalidValue {
            field: "database.path".to_string(),
            reason: "path is not valid UTF-8".to_string(),
        })?;
        let db = Arc::new(Database::new(db_path).await?);
        let vault: Arc<dyn Vault> = Arc::new(AgeVault::load_or_create(&config.identity_path())?);
        let registry = Arc::new(AdapterRegistry::from_config(&config)?);

        Ok(Self::from_parts(config, db, vault, registry))
    }

    /// Assemble a service from already-built parts
    pub fn from_parts(
        config: Config,
        db: Arc<Database>,
        vault: Arc<dyn Vault>,
        registry: Arc<AdapterRegistry>,
    ) -> Self {
        let broker = Arc::new(TokenBroker::new(db.clone(), vault, registry.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            broker.clone(),
            registry,
            &config.scheduler,
        ));

        Self {
            allocator: Allocator::new(db.clone(), config.scheduler.search_horizon_days),
            jobs: JobQueue::new(db.clone()),
            config: Arc::new(config),
            db,
            broker,
            orchestrator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn broker(&self) -> &TokenBroker {
        &self.broker
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    /// A job runner sharing this service's orchestrator
    pub fn runner(&self) -> JobRunner {
        JobRunner::new(self.db.clone(), self.orchestrator.clone(), &self.config.scheduler)
    }

    // ----- accounts and rules -----

    pub async fn add_account(&self, account: &Account) -> Result<()> {
        self.db.upsert_account(account).await
    }

    /// Create or replace an account's recurrence rule
    pub async fn set_rule(&self, rule: &RecurrenceRule) -> Result<()> {
        rule.validate()?;
        if self.db.get_account(&rule.account_id).await?.is_none() {
            return Err(ScheduleError::UnknownAccount(rule.account_id.clone()).into());
        }
        self.db.put_rule(rule).await
    }

    pub async fn rule(&self, account_id: &str) -> Result<RecurrenceRule> {
        self.db
            .get_rule(account_id)
            .await?
            .ok_or_else(|| ScheduleError::NoScheduleConfigured(account_id.to_string()).into())
    }

    /// Pausing holds dispatch for the account; bookings are kept
    pub async fn set_paused(&self, account_id: &str, paused: bool) -> Result<()> {
        if !self.db.set_rule_paused(account_id, paused).await? {
            return Err(ScheduleError::NoScheduleConfigured(account_id.to_string()).into());
        }
        Ok(())
    }

    /// The next booking for the account passes over one candidate
    pub async fn skip_next(&self, account_id: &str) -> Result<()> {
        if !self.db.set_skip_next(account_id, true).await? {
            return Err(ScheduleError::NoScheduleConfigured(account_id.to_string()).into());
        }
        Ok(())
    }

    // ----- content -----

    pub async fn create_content(&self, body: Payload, targets: Vec<String>) -> Result<ContentItem> {
        let item = ContentItem::new(body, targets);
        self.add_content(&item).await?;
        Ok(item)
    }

    /// Store a fully built draft item
    pub async fn add_content(&self, item: &ContentItem) -> Result<()> {
        if item.body.text.trim().is_empty() && item.body.media.is_empty() {
            return Err(crate::error::CadenceError::InvalidInput(
                "content cannot be empty".to_string(),
            ));
        }
        self.db.create_content(item).await
    }

    pub async fn content(&self, content_id: &str) -> Result<ContentItem> {
        self.db
            .get_content(content_id)
            .await?
            .ok_or_else(|| ScheduleError::UnknownContent(content_id.to_string()).into())
    }

    // ----- bookings -----

    pub async fn schedule(
        &self,
        content_id: &str,
        from: DateTime<Utc>,
        mode: ScheduleMode,
    ) -> Result<ScheduleReport> {
        let report = self.allocator.schedule_item(content_id, from, mode).await?;
        self.sync_job(content_id).await?;
        Ok(report)
    }

    pub async fn publish_now(&self, content_id: &str) -> Result<ScheduleReport> {
        let report = self.allocator.publish_now(content_id, Utc::now()).await?;
        self.sync_job(content_id).await?;
        Ok(report)
    }

    pub async fn reorder(&self, account_id: &str, order: &[String]) -> Result<Vec<QueueSlot>> {
        let slots = self.allocator.reorder(account_id, order, Utc::now()).await?;
        for content_id in order {
            self.sync_job(content_id).await?;
        }
        Ok(slots)
    }

    /// Cancel the account's upcoming bookings; returns the affected items
    pub async fn clear_queue(&self, account_id: &str) -> Result<Vec<String>> {
        let affected = self.allocator.clear_queue(account_id, Utc::now()).await?;
        for content_id in &affected {
            self.sync_job(content_id).await?;
        }
        Ok(affected)
    }

    pub async fn unbind(&self, slot_id: &str) -> Result<Option<String>> {
        let content_id = self.allocator.unbind(slot_id).await?;
        if let Some(content_id) = &content_id {
            self.sync_job(content_id).await?;
        }
        Ok(content_id)
    }

    pub async fn preview(
        &self,
        account_id: &str,
        count: usize,
        from: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.allocator.preview_upcoming(account_id, count, from).await
    }

    pub async fn queue(&self, account_id: &str) -> Result<Vec<QueueSlot>> {
        self.allocator.list_queue(account_id).await
    }

    /// Run one final orchestrator pass right away, outside the job runner
    pub async fn run_now(&self, content_id: &str) -> Result<RunOutcome> {
        self.orchestrator.run(content_id).await
    }

    /// Point the item's job at its due time, or cancel it if the item has
    /// nothing booked any more
    async fn sync_job(&self, content_id: &str) -> Result<()> {
        let item = self.content(content_id).await?;
        match (item.status, item.due_at) {
            (ContentStatus::Scheduled | ContentStatus::Queued, Some(due)) => {
                self.jobs.schedule_at(content_id, due).await?;
            }
            (ContentStatus::Draft, _) => {
                if self.jobs.cancel(content_id).await? {
                    debug!(content_id, "canceled job of unbooked item");
                }
            }
            _ => {}
        }
        Ok(())
    }
}
