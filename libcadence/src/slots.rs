//! Queue slot ledger
//!
//! One row per (account, instant) booking. Rows move through
//! `reserved -> in_progress -> completed | failed` or are canceled; they are
//! never deleted. A partial unique index keeps at most one non-canceled slot
//! per (account, instant), and inserts report a collision instead of failing.
//!
//! Functions take a connection rather than the pool so callers can group them
//! in a transaction.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use crate::db::{from_opt_ts, from_ts};
use crate::error::{DbError, Result};
use crate::types::{QueueSlot, SlotStatus};

const SLOT_COLUMNS: &str = "id, account_id, slot_at, content_id, status, completed_at";

/// Insert a reserved slot. Returns `false` if the instant is already taken.
pub async fn insert_slot(conn: &mut SqliteConnection, slot: &QueueSlot) -> Result<bool> {
    let now = Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        INSERT INTO queue_slots (id, account_id, slot_at, content_id, status, completed_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&slot.id)
    .bind(&slot.account_id)
    .bind(slot.slot_at.timestamp())
    .bind(&slot.content_id)
    .bind(slot.status.as_str())
    .bind(slot.completed_at.map(|t| t.timestamp()))
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
        Err(e) => Err(DbError::SqlxError(e).into()),
    }
}

/// Whether a non-canceled slot exists at exactly this instant
pub async fn is_taken(
    conn: &mut SqliteConnection,
    account_id: &str,
    slot_at: DateTime<Utc>,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM queue_slots WHERE account_id = ? AND slot_at = ? AND status <> 'canceled'",
    )
    .bind(account_id)
    .bind(slot_at.timestamp())
    .fetch_one(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(count > 0)
}

/// Count non-canceled slots in `[start, end)`
pub async fn count_between(
    conn: &mut SqliteConnection,
    account_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM queue_slots
        WHERE account_id = ? AND slot_at >= ? AND slot_at < ? AND status <> 'canceled'
        "#,
    )
    .bind(account_id)
    .bind(start.timestamp())
    .bind(end.timestamp())
    .fetch_one(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(count)
}

pub async fn get_slot(conn: &mut SqliteConnection, slot_id: &str) -> Result<Option<QueueSlot>> {
    let row = sqlx::query(&format!("SELECT {} FROM queue_slots WHERE id = ?", SLOT_COLUMNS))
        .bind(slot_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::SqlxError)?;

    row.map(|r| slot_from_row(&r)).transpose()
}

/// Non-canceled, not yet finished slots for an account, in time order
pub async fn list_open(conn: &mut SqliteConnection, account_id: &str) -> Result<Vec<QueueSlot>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM queue_slots
        WHERE account_id = ? AND status IN ('reserved', 'in_progress')
        ORDER BY slot_at
        "#,
        SLOT_COLUMNS
    ))
    .bind(account_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    rows.iter().map(slot_from_row).collect()
}

/// Reserved slots at or after `from`, in time order
pub async fn list_reserved_from(
    conn: &mut SqliteConnection,
    account_id: &str,
    from: DateTime<Utc>,
) -> Result<Vec<QueueSlot>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM queue_slots
        WHERE account_id = ? AND status = 'reserved' AND slot_at >= ?
        ORDER BY slot_at
        "#,
        SLOT_COLUMNS
    ))
    .bind(account_id)
    .bind(from.timestamp())
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    rows.iter().map(slot_from_row).collect()
}

/// Every slot ever bound to an item, any status
pub async fn list_for_content(
    conn: &mut SqliteConnection,
    content_id: &str,
) -> Result<Vec<QueueSlot>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM queue_slots WHERE content_id = ? ORDER BY slot_at, account_id",
        SLOT_COLUMNS
    ))
    .bind(content_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    rows.iter().map(slot_from_row).collect()
}

/// The earliest open slot binding `content_id` to `account_id`
pub async fn open_slot_for(
    conn: &mut SqliteConnection,
    content_id: &str,
    account_id: &str,
) -> Result<Option<QueueSlot>> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {} FROM queue_slots
        WHERE content_id = ? AND account_id = ? AND status IN ('reserved', 'in_progress')
        ORDER BY slot_at LIMIT 1
        "#,
        SLOT_COLUMNS
    ))
    .bind(content_id)
    .bind(account_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    row.map(|r| slot_from_row(&r)).transpose()
}

/// Compare-and-set a slot's status. Finishing states stamp `completed_at`.
pub async fn transition(
    conn: &mut SqliteConnection,
    slot_id: &str,
    from: SlotStatus,
    to: SlotStatus,
) -> Result<bool> {
    let now = Utc::now().timestamp();
    let completed_at = matches!(to, SlotStatus::Completed | SlotStatus::Failed).then_some(now);

    let result = sqlx::query(
        r#"
        UPDATE queue_slots SET status = ?, completed_at = COALESCE(?, completed_at), updated_at = ?
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(to.as_str())
    .bind(completed_at)
    .bind(now)
    .bind(slot_id)
    .bind(from.as_str())
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(result.rows_affected() > 0)
}

/// Cancel one reserved slot, returning the item it was bound to
pub async fn cancel_slot(
    conn: &mut SqliteConnection,
    slot_id: &str,
) -> Result<Option<Option<String>>> {
    let row = sqlx::query(
        r#"
        UPDATE queue_slots SET status = 'canceled', updated_at = ?
        WHERE id = ? AND status = 'reserved'
        RETURNING content_id
        "#,
    )
    .bind(Utc::now().timestamp())
    .bind(slot_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    row.map(|r| r.try_get::<Option<String>, _>("content_id"))
        .transpose()
        .map_err(|e| DbError::SqlxError(e).into())
}

/// Cancel an account's reserved slots at or after `from`.
///
/// Returns the distinct items that lost a booking.
pub async fn cancel_reserved_from(
    conn: &mut SqliteConnection,
    account_id: &str,
    from: DateTime<Utc>,
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        UPDATE queue_slots SET status = 'canceled', updated_at = ?
        WHERE account_id = ? AND status = 'reserved' AND slot_at >= ?
        RETURNING content_id
        "#,
    )
    .bind(Utc::now().timestamp())
    .bind(account_id)
    .bind(from.timestamp())
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    let mut affected = Vec::new();
    for row in &rows {
        let content_id: Option<String> = row.try_get("content_id").map_err(DbError::SqlxError)?;
        if let Some(id) = content_id {
            if !affected.contains(&id) {
                affected.push(id);
            }
        }
    }
    Ok(affected)
}

/// Cancel every reserved slot bound to an item
pub async fn cancel_for_content(conn: &mut SqliteConnection, content_id: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE queue_slots SET status = 'canceled', updated_at = ?
        WHERE content_id = ? AND status = 'reserved'
        "#,
    )
    .bind(Utc::now().timestamp())
    .bind(content_id)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(result.rows_affected())
}

/// Recompute an item's earliest due instant from its open slots.
///
/// A draft item that gained a booking becomes `scheduled`; a scheduled or
/// queued item that lost its last booking reverts to `draft`, and so does a
/// `publishing` item none of whose slots was attempted yet. Items in any
/// other state keep their status.
pub async fn recompute_due(
    conn: &mut SqliteConnection,
    content_id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let due: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT MIN(slot_at) FROM queue_slots
        WHERE content_id = ? AND status IN ('reserved', 'in_progress')
        "#,
    )
    .bind(content_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    let now = Utc::now().timestamp();
    match due {
        Some(ts) => {
            sqlx::query(
                r#"
                UPDATE content_items
                SET due_at = ?,
                    status = CASE WHEN status = 'draft' THEN 'scheduled' ELSE status END,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(ts)
            .bind(now)
            .bind(content_id)
            .execute(&mut *conn)
            .await
            .map_err(DbError::SqlxError)?;
        }
        None => {
            sqlx::query(
                r#"
                UPDATE content_items
                SET due_at = NULL,
                    status = CASE
                        WHEN status IN ('scheduled', 'queued') THEN 'draft'
                        WHEN status = 'publishing' AND NOT EXISTS (
                            SELECT 1 FROM queue_slots
                            WHERE content_id = ? AND status IN ('completed', 'failed')
                        ) THEN 'draft'
                        ELSE status
                    END,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(content_id)
            .bind(now)
            .bind(content_id)
            .execute(&mut *conn)
            .await
            .map_err(DbError::SqlxError)?;
        }
    }

    from_opt_ts(due)
}

fn slot_from_row(r: &SqliteRow) -> Result<QueueSlot> {
    let status: String = r.try_get("status").map_err(DbError::SqlxError)?;
    Ok(QueueSlot {
        id: r.try_get("id").map_err(DbError::SqlxError)?,
        account_id: r.try_get("account_id").map_err(DbError::SqlxError)?,
        slot_at: from_ts(r.try_get("slot_at").map_err(DbError::SqlxError)?)?,
        content_id: r.try_get("content_id").map_err(DbError::SqlxError)?,
        status: SlotStatus::parse(&status)
            .ok_or_else(|| DbError::Corrupt(format!("slot status '{}'", status)))?,
        completed_at: from_opt_ts(r.try_get("completed_at").map_err(DbError::SqlxError)?)?,
    })
}
