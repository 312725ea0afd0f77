//! Publish orchestration
//!
//! Drives one content item through its target accounts, in stored order, and
//! records a publish outcome per account.
//!
//! Per-account failures are contained: a rejected publish or an unusable
//! account fails that account and the pass continues. Two things end a pass
//! early:
//!
//! - a rate limit defers the whole item; it returns to `scheduled` and the
//!   job runner re-fires it after the retry-after delay
//! - a server or transport error on a non-final attempt is returned to the
//!   job runner, which retries the whole item with backoff
//!
//! Accounts that already hold an outcome are never called again, so a pass
//! can be repeated safely. A target without an open booking (unbound or
//! cleared) is not published at all.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::TokenBroker;
use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::error::{AdapterError, CadenceError, DbError, PublishError, Result, ScheduleError};
use crate::platforms::{AdapterRegistry, Published};
use crate::slots;
use crate::types::{Account, ContentItem, ContentStatus, OutcomeStatus, PublishOutcome, SlotStatus};

/// Which try of the whole item this is, as counted by the job runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub max: u32,
}

impl Attempt {
    pub fn new(number: u32, max: u32) -> Self {
        Self { number, max }
    }

    /// A lone attempt with no retries after it
    pub fn single() -> Self {
        Self::new(1, 1)
    }

    /// On the final attempt retryable failures are recorded instead of returned
    pub fn is_final(&self) -> bool {
        self.number >= self.max
    }
}

/// Why an item went back to `scheduled` without a terminal status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferReason {
    RateLimited {
        account_id: String,
        retry_after_secs: u64,
    },
    /// Accounts whose recurrence rule is paused
    Paused { accounts: Vec<String> },
    /// Accounts whose booked slot is still in the future
    AwaitingSlot { accounts: Vec<String> },
}

/// How one orchestrator pass ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Published { succeeded: usize, failed: usize },
    Failed { code: String, message: String },
    Deferred { run_at: DateTime<Utc>, reason: DeferReason },
    /// The item was moved by someone else during the pass; nothing committed
    Superseded,
}

pub struct Orchestrator {
    db: Arc<Database>,
    broker: Arc<TokenBroker>,
    registry: Arc<AdapterRegistry>,
    default_retry_after: u64,
    pause_recheck: u64,
}

/// Tally of one pass over the targets
#[derive(Default)]
struct Pass {
    succeeded: usize,
    /// (code, message) of each failed account, in target order
    failures: Vec<(String, String)>,
    paused: Vec<String>,
    awaiting: Vec<String>,
    next_slot: Option<DateTime<Utc>>,
    deferral: Option<(String, u64)>,
}

/// Classify an adapter failure into the publish taxonomy
pub fn classify(err: AdapterError, default_retry_after: u64) -> PublishError {
    match err {
        AdapterError::RateLimited { retry_after_secs } => PublishError::RateLimited {
            retry_after_secs: retry_after_secs.unwrap_or(default_retry_after),
        },
        AdapterError::Client { code, message } => PublishError::ClientError { code, message },
        AdapterError::InvalidGrant { message } => PublishError::ClientError {
            code: "InvalidGrant".to_string(),
            message,
        },
        AdapterError::Server { status, message } => PublishError::ServerError {
            message: format!("HTTP {}: {}", status, message),
        },
        AdapterError::Transport(message) => PublishError::ServerError { message },
    }
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        broker: Arc<TokenBroker>,
        registry: Arc<AdapterRegistry>,
        scheduler: &SchedulerConfig,
    ) -> Self {
        Self {
            db,
            broker,
            registry,
            default_retry_after: scheduler.default_retry_after,
            pause_recheck: scheduler.pause_recheck,
        }
    }

    /// Run one final pass; retryable failures are recorded, not returned
    pub async fn run(&self, content_id: &str) -> Result<RunOutcome> {
        self.run_attempt(content_id, Attempt::single()).await
    }

    /// Run one pass as part of the job runner's retry sequence.
    ///
    /// # Errors
    ///
    /// - [`PublishError::NotPublishable`] if the item is not scheduled,
    ///   queued or publishing
    /// - a retryable [`PublishError`] when a non-final attempt hit a server,
    ///   transport or transient credential failure
    pub async fn run_attempt(&self, content_id: &str, attempt: Attempt) -> Result<RunOutcome> {
        let item = self
            .db
            .get_content(content_id)
            .await?
            .ok_or_else(|| ScheduleError::UnknownContent(content_id.to_string()))?;

        if !item.status.is_publishable() {
            return Err(PublishError::NotPublishable {
                content_id: content_id.to_string(),
                status: item.status.to_string(),
            }
            .into());
        }

        if item.targets.is_empty() {
            let failed = self
                .db
                .fail_content(content_id, item.status, "NoTargets", "item has no target accounts")
                .await?;
            if !failed {
                return Ok(RunOutcome::Superseded);
            }
            warn!(content_id, "item has no targets");
            return Ok(RunOutcome::Failed {
                code: "NoTargets".to_string(),
                message: "item has no target accounts".to_string(),
            });
        }

        if item.status != ContentStatus::Publishing
            && !self
                .db
                .transition_content(content_id, item.status, ContentStatus::Publishing)
                .await?
        {
            debug!(content_id, "item moved before publishing started");
            return Ok(RunOutcome::Superseded);
        }
        info!(content_id, attempt = attempt.number, max_attempts = attempt.max, "publishing");

        let pass = self.attempt_targets(&item, attempt).await?;
        self.finish(&item, pass).await
    }

    async fn attempt_targets(&self, item: &ContentItem, attempt: Attempt) -> Result<Pass> {
        let content_id = item.id.as_str();
        let outcomes = self.db.get_outcomes(content_id).await?;
        let now = Utc::now();
        let mut pass = Pass::default();

        for account_id in &item.targets {
            let account_id = account_id.as_str();

            // Recorded outcomes are final for their account
            match outcomes.get(account_id) {
                Some(outcome) if outcome.status == OutcomeStatus::Published => {
                    debug!(content_id, account_id, "already published");
                    pass.succeeded += 1;
                    continue;
                }
                Some(outcome) => {
                    debug!(content_id, account_id, "already failed");
                    pass.failures.push((
                        outcome.error_code.clone().unwrap_or_else(|| "Unknown".to_string()),
                        outcome.error_message.clone().unwrap_or_default(),
                    ));
                    continue;
                }
                None => {}
            }

            let slot = {
                let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
                slots::open_slot_for(&mut conn, content_id, account_id).await?
            };
            let Some(slot) = slot else {
                debug!(content_id, account_id, "no open booking, not publishing");
                continue;
            };

            if slot.status == SlotStatus::Reserved && slot.slot_at > now {
                pass.awaiting.push(account_id.to_string());
                pass.next_slot = Some(pass.next_slot.map_or(slot.slot_at, |n| n.min(slot.slot_at)));
                continue;
            }

            if slot.status == SlotStatus::Reserved {
                let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
                if !slots::transition(&mut conn, &slot.id, SlotStatus::Reserved, SlotStatus::InProgress)
                    .await?
                {
                    // Unbound or cleared since we looked
                    debug!(content_id, account_id, slot_id = %slot.id, "slot released during pass");
                    continue;
                }
            }
            let slot_id = slot.id.as_str();

            let account = match self.db.get_account(account_id).await? {
                Some(account) if account.status.can_attempt() => account,
                found => {
                    let err = PublishError::AccountNotActive {
                        account_id: account_id.to_string(),
                        status: found.map_or_else(|| "unknown".to_string(), |a| a.status.to_string()),
                    };
                    self.record_failure(content_id, account_id, slot_id, &err).await?;
                    pass.failures.push((err.code().to_string(), err.to_string()));
                    continue;
                }
            };

            if self
                .db
                .get_rule(account_id)
                .await?
                .is_some_and(|rule| rule.paused)
            {
                info!(content_id, account_id, "account paused, holding its slot");
                self.settle_slot(slot_id, SlotStatus::Reserved).await?;
                pass.paused.push(account_id.to_string());
                continue;
            }

            match self.attempt_account(item, &account).await {
                Ok(published) => {
                    info!(
                        content_id,
                        account_id,
                        platform_id = %published.platform_id,
                        "published"
                    );
                    self.db
                        .upsert_outcome(&PublishOutcome::published(
                            content_id,
                            account_id,
                            published.platform_id,
                            published.platform_url,
                        ))
                        .await?;
                    self.settle_slot(slot_id, SlotStatus::Completed).await?;
                    pass.succeeded += 1;
                }
                Err(CadenceError::Publish(PublishError::RateLimited { retry_after_secs })) => {
                    warn!(content_id, account_id, retry_after_secs, "rate limited, deferring item");
                    self.settle_slot(slot_id, SlotStatus::Reserved).await?;
                    pass.deferral = Some((account_id.to_string(), retry_after_secs));
                    break;
                }
                Err(CadenceError::Publish(err)) if err.is_retryable() && !attempt.is_final() => {
                    warn!(
                        content_id,
                        account_id,
                        attempt = attempt.number,
                        error = %err,
                        "retryable failure, item will be retried"
                    );
                    self.settle_slot(slot_id, SlotStatus::Reserved).await?;
                    self.db.set_content_error(content_id, err.code(), &err.to_string()).await?;
                    return Err(err.into());
                }
                Err(CadenceError::Publish(err)) => {
                    self.record_failure(content_id, account_id, slot_id, &err).await?;
                    pass.failures.push((err.code().to_string(), err.to_string()));
                }
                Err(other) => {
                    self.settle_slot(slot_id, SlotStatus::Reserved).await?;
                    return Err(other);
                }
            }
        }

        Ok(pass)
    }

    async fn attempt_account(&self, item: &ContentItem, account: &Account) -> Result<Published> {
        let adapter = self.registry.get(&account.platform).ok_or_else(|| {
            PublishError::ClientError {
                code: "PlatformUnavailable".to_string(),
                message: format!("no adapter registered for '{}'", account.platform),
            }
        })?;

        let credential = self.broker.get_valid_credential(&account.id).await?;
        let payload = item.payload_for(&account.id);

        adapter
            .publish(&credential, &payload)
            .await
            .map_err(|e| classify(e, self.default_retry_after).into())
    }

    async fn record_failure(
        &self,
        content_id: &str,
        account_id: &str,
        slot_id: &str,
        err: &PublishError,
    ) -> Result<()> {
        warn!(content_id, account_id, code = err.code(), error = %err, "account failed");
        self.db
            .upsert_outcome(&PublishOutcome::failed(
                content_id,
                account_id,
                err.code(),
                err.to_string(),
            ))
            .await?;
        self.settle_slot(slot_id, SlotStatus::Failed).await
    }

    /// Move an in-progress slot on; reserved again means "try later"
    async fn settle_slot(&self, slot_id: &str, to: SlotStatus) -> Result<()> {
        let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
        if !slots::transition(&mut conn, slot_id, SlotStatus::InProgress, to).await? {
            debug!(slot_id, to = %to, "slot not in progress");
        }
        Ok(())
    }

    async fn finish(&self, item: &ContentItem, pass: Pass) -> Result<RunOutcome> {
        let content_id = item.id.as_str();
        let now = Utc::now();

        if let Some((account_id, retry_after_secs)) = pass.deferral {
            let run_at = now + Duration::seconds(retry_after_secs as i64);
            return self
                .defer(
                    content_id,
                    run_at,
                    DeferReason::RateLimited {
                        account_id,
                        retry_after_secs,
                    },
                )
                .await;
        }

        if !pass.paused.is_empty() || !pass.awaiting.is_empty() {
            // Paused accounts are rechecked later; a due slot never waits on them
            let recheck = (!pass.paused.is_empty())
                .then(|| now + Duration::seconds(self.pause_recheck as i64));
            let run_at = match (recheck, pass.next_slot) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => now,
            };
            let reason = if pass.paused.is_empty() {
                DeferReason::AwaitingSlot {
                    accounts: pass.awaiting,
                }
            } else {
                DeferReason::Paused {
                    accounts: pass.paused,
                }
            };
            return self.defer(content_id, run_at, reason).await;
        }

        let failed = pass.failures.len();
        if pass.succeeded > 0 {
            if !self
                .db
                .transition_content(content_id, ContentStatus::Publishing, ContentStatus::Published)
                .await?
            {
                return Ok(RunOutcome::Superseded);
            }
            info!(content_id, succeeded = pass.succeeded, failed, "item published");
            return Ok(RunOutcome::Published {
                succeeded: pass.succeeded,
                failed,
            });
        }

        let Some((code, message)) = pass.failures.into_iter().next() else {
            // Every booking was released before it could be attempted
            return self.release(content_id).await;
        };
        if !self
            .db
            .fail_content(content_id, ContentStatus::Publishing, &code, &message)
            .await?
        {
            return Ok(RunOutcome::Superseded);
        }
        warn!(content_id, %code, "item failed on every target");
        Ok(RunOutcome::Failed { code, message })
    }

    /// Hand an item whose bookings all went away back to the allocator
    async fn release(&self, content_id: &str) -> Result<RunOutcome> {
        if self
            .db
            .transition_content(content_id, ContentStatus::Publishing, ContentStatus::Scheduled)
            .await?
        {
            let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
            slots::recompute_due(&mut conn, content_id).await?;
        }
        info!(content_id, "bookings released during pass, nothing published");
        Ok(RunOutcome::Superseded)
    }

    async fn defer(
        &self,
        content_id: &str,
        run_at: DateTime<Utc>,
        reason: DeferReason,
    ) -> Result<RunOutcome> {
        if !self
            .db
            .transition_content(content_id, ContentStatus::Publishing, ContentStatus::Scheduled)
            .await?
        {
            return Ok(RunOutcome::Superseded);
        }
        let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
        slots::recompute_due(&mut conn, content_id).await?;

        info!(content_id, run_at = %run_at, ?reason, "item deferred");
        Ok(RunOutcome::Deferred { run_at, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_defaults() {
        assert_eq!(
            classify(AdapterError::RateLimited { retry_after_secs: None }, 60),
            PublishError::RateLimited { retry_after_secs: 60 }
        );
        assert_eq!(
            classify(AdapterError::RateLimited { retry_after_secs: Some(30) }, 60),
            PublishError::RateLimited { retry_after_secs: 30 }
        );
    }

    #[test]
    fn test_classify_retryability() {
        assert!(classify(AdapterError::Transport("reset".into()), 60).is_retryable());
        assert!(classify(
            AdapterError::Server {
                status: 503,
                message: "down".into()
            },
            60
        )
        .is_retryable());

        let client = classify(
            AdapterError::Client {
                code: "TooLong".into(),
                message: "500 chars max".into(),
            },
            60,
        );
        assert!(!client.is_retryable());
        assert_eq!(client.code(), "TooLong");
    }

    #[test]
    fn test_attempt_finality() {
        assert!(Attempt::single().is_final());
        assert!(!Attempt::new(1, 4).is_final());
        assert!(Attempt::new(4, 4).is_final());
    }
}
