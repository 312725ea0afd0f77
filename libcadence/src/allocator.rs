//! Slot allocation
//!
//! Turns an account's recurrence rule into concrete queue slot bookings. The
//! candidate walk for one booking is:
//!
//! 1. take the next rule instant at or after the cursor
//! 2. if the candidate's local day already holds `max_per_day` bookings, move
//!    the cursor to the start of the next local day
//! 3. if `skip_next` is set, consume it and pass over the candidate
//! 4. if the instant is already booked, move past it
//! 5. insert the slot; a uniqueness collision means another writer won the
//!    instant, so move past it and keep walking
//!
//! The walk is bounded by the search horizon. Allocation for one account is
//! serialized in-process so daily caps hold under concurrent requests; the
//! storage uniqueness index guards instants across processes.
//!
//! "Publish now" does not walk the rule: it books the current second (or the
//! closest free one before it) and is exempt from `max_per_day`. Those
//! bookings still occupy the day for later rule-based bookings.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{CadenceError, DbError, Result, ScheduleError};
use crate::locks::KeyedLocks;
use crate::recurrence::{local_date, local_day_bounds, next_instant, next_instants};
use crate::slots;
use crate::types::{Account, ContentItem, ContentStatus, QueueSlot, RecurrenceRule};

/// Upper bound on candidates examined for one booking
const MAX_CANDIDATES: usize = 10_000;

/// How multi-account scheduling picks each account's starting point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// Every account searches from the same starting instant
    #[default]
    Independent,
    /// Each account starts at or after the previous account's booking
    Sequential,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedAccount {
    pub account_id: String,
    pub reason: String,
}

/// Result of booking one content item across its targets
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleReport {
    pub content_id: String,
    pub booked: Vec<QueueSlot>,
    pub skipped: Vec<SkippedAccount>,
    pub earliest_due: Option<DateTime<Utc>>,
}

pub struct Allocator {
    db: Arc<Database>,
    horizon_days: i64,
    locks: KeyedLocks,
}

impl Allocator {
    pub fn new(db: Arc<Database>, horizon_days: i64) -> Self {
        Self {
            db,
            horizon_days,
            locks: KeyedLocks::new(),
        }
    }

    /// Book the next free slot for `account_id` and bind it to `content_id`.
    ///
    /// Does not touch the item's status or due time; see [`schedule_item`].
    ///
    /// [`schedule_item`]: Allocator::schedule_item
    pub async fn reserve_next(
        &self,
        account_id: &str,
        content_id: &str,
        from: DateTime<Utc>,
    ) -> Result<QueueSlot> {
        let lock = self.locks.get(account_id);
        let _guard = lock.lock().await;

        let (_, rule) = self.load_schedulable(account_id).await?;
        let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
        self.reserve_locked(&mut conn, &rule, content_id, from, true)
            .await
    }

    async fn load_schedulable(&self, account_id: &str) -> Result<(Account, RecurrenceRule)> {
        let account = self
            .db
            .get_account(account_id)
            .await?
            .ok_or_else(|| ScheduleError::UnknownAccount(account_id.to_string()))?;

        if !account.status.can_allocate() {
            return Err(ScheduleError::AccountNotActive {
                account_id: account_id.to_string(),
                status: account.status.to_string(),
            }
            .into());
        }

        let rule = self
            .db
            .get_rule(account_id)
            .await?
            .filter(|rule| !rule.times.is_empty())
            .ok_or_else(|| ScheduleError::NoScheduleConfigured(account_id.to_string()))?;

        Ok((account, rule))
    }

    async fn reserve_locked(
        &self,
        conn: &mut SqliteConnection,
        rule: &RecurrenceRule,
        content_id: &str,
        from: DateTime<Utc>,
        consume_skip: bool,
    ) -> Result<QueueSlot> {
        let account_id = rule.account_id.as_str();
        let tz = rule.tz()?;
        let limit = from + Duration::days(self.horizon_days);
        let exhausted = || ScheduleError::NoSlotAvailable {
            account_id: account_id.to_string(),
            horizon_days: self.horizon_days,
        };

        let mut cursor = from;
        let mut skip_pending = consume_skip && rule.skip_next;

        for _ in 0..MAX_CANDIDATES {
            let candidate = match next_instant(rule, cursor)? {
                Some(candidate) if candidate < limit => candidate,
                _ => return Err(exhausted().into()),
            };

            if let Some(cap) = rule.max_per_day {
                let (day_start, day_end) = local_day_bounds(&tz, local_date(&tz, candidate));
                let booked = slots::count_between(conn, account_id, day_start, day_end).await?;
                if booked >= i64::from(cap) {
                    debug!(account_id, slot_at = %candidate, booked, cap, "local day is full");
                    cursor = day_end.max(candidate + Duration::seconds(1));
                    continue;
                }
            }

            if skip_pending {
                skip_pending = false;
                if self.db.consume_skip_next(account_id).await? {
                    info!(account_id, slot_at = %candidate, "skipped one slot");
                    cursor = candidate + Duration::seconds(1);
                    continue;
                }
            }

            if slots::is_taken(conn, account_id, candidate).await? {
                debug!(account_id, slot_at = %candidate, "slot already booked");
                cursor = candidate + Duration::seconds(1);
                continue;
            }

            let slot = QueueSlot::reserve(account_id, candidate, Some(content_id));
            if slots::insert_slot(conn, &slot).await? {
                info!(account_id, content_id, slot_at = %candidate, "reserved slot");
                return Ok(slot);
            }

            debug!(account_id, slot_at = %candidate, "lost race for slot");
            cursor = candidate + Duration::seconds(1);
        }

        Err(exhausted().into())
    }

    /// Book one slot per target account and update the item's due time.
    ///
    /// Accounts that cannot be scheduled are reported in `skipped`; the call
    /// only fails outright when no target ends up with a booking. Targets that
    /// already hold an open slot for the item keep it.
    pub async fn schedule_item(
        &self,
        content_id: &str,
        from: DateTime<Utc>,
        mode: ScheduleMode,
    ) -> Result<ScheduleReport> {
        let item = self.load_item_for_booking(content_id).await?;

        let mut booked = Vec::new();
        let mut skipped = Vec::new();
        let mut first_error = None;
        let mut has_existing = false;
        let mut watermark = from;

        for account_id in &item.targets {
            let start = match mode {
                ScheduleMode::Independent => from,
                ScheduleMode::Sequential => watermark,
            };

            let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
            if let Some(existing) = slots::open_slot_for(&mut conn, content_id, account_id).await? {
                debug!(content_id, account_id = %account_id, slot_at = %existing.slot_at, "target already booked");
                has_existing = true;
                watermark = watermark.max(existing.slot_at);
                continue;
            }
            drop(conn);

            match self.reserve_next(account_id, content_id, start).await {
                Ok(slot) => {
                    watermark = watermark.max(slot.slot_at);
                    booked.push(slot);
                }
                Err(CadenceError::Schedule(e)) => {
                    warn!(content_id, account_id = %account_id, error = %e, "target not scheduled");
                    skipped.push(SkippedAccount {
                        account_id: account_id.clone(),
                        reason: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        if booked.is_empty() && !has_existing {
            return Err(first_error
                .unwrap_or_else(|| {
                    ScheduleError::NoScheduleConfigured(format!("{} (no targets)", content_id))
                })
                .into());
        }

        let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
        let earliest_due = slots::recompute_due(&mut conn, content_id).await?;
        info!(content_id, booked = booked.len(), due_at = ?earliest_due, "scheduled item");

        Ok(ScheduleReport {
            content_id: content_id.to_string(),
            booked,
            skipped,
            earliest_due,
        })
    }

    /// Book every target at `now`, bypassing the recurrence rules.
    ///
    /// Existing reserved slots for the item are released and the new
    /// bookings made in one transaction; if no target can be booked nothing
    /// changes and the item keeps its schedule. If an account already has a
    /// booking at `now`, the closest free earlier second is used so the
    /// booking is due immediately.
    ///
    /// Immediate bookings are an explicit override: they ignore the rule's
    /// times and `max_per_day`, but they do count toward the cap for later
    /// rule-based bookings on the same local day.
    pub async fn publish_now(&self, content_id: &str, now: DateTime<Utc>) -> Result<ScheduleReport> {
        let item = self.load_item_for_booking(content_id).await?;

        let mut accounts = item.targets.clone();
        accounts.sort();
        accounts.dedup();
        let mut guards = Vec::with_capacity(accounts.len());
        for account_id in &accounts {
            guards.push(self.locks.get(account_id).lock_owned().await);
        }

        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;
        slots::cancel_for_content(&mut tx, content_id).await?;

        let mut booked = Vec::new();
        let mut skipped = Vec::new();
        let mut first_error = None;

        for account_id in &item.targets {
            let outcome = match self.db.get_account(account_id).await? {
                Some(account) if account.status.can_allocate() => {
                    book_near(&mut tx, account_id, content_id, now).await
                }
                Some(account) => Err(ScheduleError::AccountNotActive {
                    account_id: account_id.clone(),
                    status: account.status.to_string(),
                }
                .into()),
                None => Err(ScheduleError::UnknownAccount(account_id.clone()).into()),
            };

            match outcome {
                Ok(slot) => {
                    info!(content_id, account_id = %account_id, slot_at = %slot.slot_at, "booked immediate slot");
                    booked.push(slot);
                }
                Err(CadenceError::Schedule(e)) => {
                    warn!(content_id, account_id = %account_id, error = %e, "target not booked");
                    skipped.push(SkippedAccount {
                        account_id: account_id.clone(),
                        reason: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        if booked.is_empty() {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return Err(first_error
                .unwrap_or_else(|| {
                    ScheduleError::NoScheduleConfigured(format!("{} (no targets)", content_id))
                })
                .into());
        }

        let earliest_due = slots::recompute_due(&mut tx, content_id).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        drop(guards);

        Ok(ScheduleReport {
            content_id: content_id.to_string(),
            booked,
            skipped,
            earliest_due,
        })
    }

    async fn load_item_for_booking(&self, content_id: &str) -> Result<ContentItem> {
        let item = self
            .db
            .get_content(content_id)
            .await?
            .ok_or_else(|| ScheduleError::UnknownContent(content_id.to_string()))?;

        if !matches!(item.status, ContentStatus::Draft | ContentStatus::Scheduled) {
            return Err(ScheduleError::NotSchedulable {
                content_id: content_id.to_string(),
                status: item.status.to_string(),
            }
            .into());
        }
        Ok(item)
    }

    /// Rebook an account's upcoming reserved slots in a new item order.
    ///
    /// `order` must name exactly the items currently holding reserved slots
    /// at or after `now`. The items are walked through the rule's own
    /// candidate sequence from `now`, so the earliest instant goes to the
    /// first item. `skip_next` is left untouched.
    pub async fn reorder(
        &self,
        account_id: &str,
        order: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueSlot>> {
        let lock = self.locks.get(account_id);
        let _guard = lock.lock().await;

        let (_, rule) = self.load_schedulable(account_id).await?;
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let mut current = slots::cancel_reserved_from(&mut tx, account_id, now).await?;
        let mut requested = order.to_vec();
        current.sort();
        requested.sort();
        if current != requested {
            return Err(ScheduleError::InvalidOrder(format!(
                "expected the {} queued item(s) of {} exactly once each",
                current.len(),
                account_id
            ))
            .into());
        }

        let mut rebooked = Vec::with_capacity(order.len());
        let mut cursor = now;
        for content_id in order {
            let slot = self
                .reserve_locked(&mut tx, &rule, content_id, cursor, false)
                .await?;
            cursor = slot.slot_at + Duration::seconds(1);
            rebooked.push(slot);
        }

        for content_id in order {
            slots::recompute_due(&mut tx, content_id).await?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        info!(account_id, items = order.len(), "reordered queue");
        Ok(rebooked)
    }

    /// Cancel an account's reserved slots at or after `now`.
    ///
    /// Returns the affected items after their due time was recomputed; items
    /// left without bookings are back in `draft`.
    pub async fn clear_queue(&self, account_id: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let lock = self.locks.get(account_id);
        let _guard = lock.lock().await;

        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;
        let affected = slots::cancel_reserved_from(&mut tx, account_id, now).await?;
        for content_id in &affected {
            slots::recompute_due(&mut tx, content_id).await?;
        }
        tx.commit().await.map_err(DbError::SqlxError)?;

        info!(account_id, items = affected.len(), "cleared queue");
        Ok(affected)
    }

    /// Cancel a single reserved slot, returning the item it was bound to
    pub async fn unbind(&self, slot_id: &str) -> Result<Option<String>> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;
        let content_id = slots::cancel_slot(&mut tx, slot_id)
            .await?
            .ok_or_else(|| ScheduleError::UnknownSlot(slot_id.to_string()))?;

        if let Some(content_id) = &content_id {
            slots::recompute_due(&mut tx, content_id).await?;
        }
        tx.commit().await.map_err(DbError::SqlxError)?;

        info!(slot_id, content_id = ?content_id, "unbound slot");
        Ok(content_id)
    }

    /// The next `count` instants a booking request from `from` would get,
    /// honouring the daily cap, existing bookings and a pending skip.
    /// Nothing is written.
    pub async fn preview_upcoming(
        &self,
        account_id: &str,
        count: usize,
        from: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let (_, rule) = self.load_schedulable(account_id).await?;
        let tz = rule.tz()?;
        let limit = from + Duration::days(self.horizon_days);
        let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;

        let mut planned: HashMap<NaiveDate, i64> = HashMap::new();
        let mut skip_pending = rule.skip_next;
        let mut preview = Vec::with_capacity(count);

        let candidates = next_instants(&rule, from, MAX_CANDIDATES)?;
        for candidate in candidates.into_iter().take_while(|c| *c < limit) {
            if preview.len() >= count {
                break;
            }

            let day = local_date(&tz, candidate);
            if let Some(cap) = rule.max_per_day {
                let (day_start, day_end) = local_day_bounds(&tz, day);
                let stored = slots::count_between(&mut conn, account_id, day_start, day_end).await?;
                let extra = planned.get(&day).copied().unwrap_or(0);
                if stored + extra >= i64::from(cap) {
                    continue;
                }
            }

            if skip_pending {
                skip_pending = false;
                continue;
            }

            if slots::is_taken(&mut conn, account_id, candidate).await? {
                continue;
            }

            *planned.entry(day).or_insert(0) += 1;
            preview.push(candidate);
        }

        Ok(preview)
    }

    /// Open (reserved or in-progress) slots for an account
    pub async fn list_queue(&self, account_id: &str) -> Result<Vec<QueueSlot>> {
        let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
        slots::list_open(&mut conn, account_id).await
    }
}

/// Book the first free second at or shortly before `now`
async fn book_near(
    conn: &mut SqliteConnection,
    account_id: &str,
    content_id: &str,
    now: DateTime<Utc>,
) -> Result<QueueSlot> {
    const NEAR_WINDOW_SECS: i64 = 60;

    for offset in 0..NEAR_WINDOW_SECS {
        let slot = QueueSlot::reserve(
            account_id,
            now - Duration::seconds(offset),
            Some(content_id),
        );
        if slots::insert_slot(conn, &slot).await? {
            return Ok(slot);
        }
    }

    Err(ScheduleError::NoSlotAvailable {
        account_id: account_id.to_string(),
        horizon_days: 0,
    }
    .into())
}
