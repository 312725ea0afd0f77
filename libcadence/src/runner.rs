//! Delayed publish jobs
//!
//! [`JobQueue`] is the durable job table: one job per content item, keyed
//! `publish:<content id>`, so scheduling the same item twice moves its one job
//! instead of creating a second. Jobs are claimed atomically and delivered at
//! least once; a job left `running` by a crash is returned to `pending` by
//! [`JobQueue::recover_stale`].
//!
//! [`JobRunner`] executes due jobs through the orchestrator with bounded
//! concurrency and turns each pass into the job's next state:
//!
//! | pass result                      | job                                  |
//! |----------------------------------|--------------------------------------|
//! | published / failed / superseded  | `done`                               |
//! | deferred                         | `pending` at the deferral instant, attempts unchanged |
//! | retryable error, attempts left   | `pending` after exponential backoff  |
//! | any other error                  | `failed`; a publishable item is failed too |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::db::{from_ts, Database};
use crate::error::{CadenceError, DbError, PublishError, Result};
use crate::orchestrator::{Attempt, Orchestrator, RunOutcome};
use crate::types::ContentStatus;

const JOB_PREFIX: &str = "publish:";

/// Stable job key for a content item
pub fn job_id(content_id: &str) -> String {
    format!("{}{}", JOB_PREFIX, content_id)
}

/// Delay before retry number `attempts + 1`: `initial * 2^(attempts - 1)`
pub fn backoff(initial_secs: u64, attempts: u32) -> StdDuration {
    let exp = attempts.saturating_sub(1).min(16);
    StdDuration::from_secs(initial_secs.saturating_mul(1u64 << exp))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: String,
    pub content_id: String,
    pub run_at: DateTime<Utc>,
    /// Failed tries so far; deferrals are not counted
    pub attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
}

fn job_from_row(r: &SqliteRow) -> Result<Job> {
    let status: String = r.try_get("status").map_err(DbError::SqlxError)?;
    let attempts: i64 = r.try_get("attempts").map_err(DbError::SqlxError)?;
    Ok(Job {
        id: r.try_get("id").map_err(DbError::SqlxError)?,
        content_id: r.try_get("content_id").map_err(DbError::SqlxError)?,
        run_at: from_ts(r.try_get("run_at").map_err(DbError::SqlxError)?)?,
        attempts: attempts.clamp(0, u32::MAX as i64) as u32,
        status: JobStatus::parse(&status)
            .ok_or_else(|| DbError::Corrupt(format!("job status '{}'", status)))?,
        last_error: r.try_get("last_error").map_err(DbError::SqlxError)?,
    })
}

/// The durable job table
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<Database>,
}

impl JobQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Schedule the item's job for `at`, creating it if needed.
    ///
    /// A job that is currently running is left alone; its pass decides what
    /// happens next.
    pub async fn schedule_at(&self, content_id: &str, at: DateTime<Utc>) -> Result<String> {
        let id = job_id(content_id);
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, content_id, run_at, attempts, status, created_at, updated_at)
            VALUES (?, ?, ?, 0, 'pending', ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                run_at = excluded.run_at,
                attempts = 0,
                status = 'pending',
                last_error = NULL,
                updated_at = excluded.updated_at
            WHERE jobs.status <> 'running'
            "#,
        )
        .bind(&id)
        .bind(content_id)
        .bind(at.timestamp())
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        debug!(job_id = %id, run_at = %at, "job scheduled");
        Ok(id)
    }

    /// Move a pending job to a new instant. Returns false if no pending job
    /// has that id.
    pub async fn reschedule(&self, job_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET run_at = ?, updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(at.timestamp())
        .bind(Utc::now().timestamp())
        .bind(job_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancel the item's job unless it already finished
    pub async fn cancel(&self, content_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'canceled', updated_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(job_id(content_id))
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, content_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, content_id, run_at, attempts, status, last_error FROM jobs WHERE id = ?",
        )
        .bind(job_id(content_id))
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Pending jobs, soonest first
    pub async fn list_pending(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, content_id, run_at, attempts, status, last_error
            FROM jobs WHERE status = 'pending' ORDER BY run_at, id
            "#,
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    /// Return jobs left `running` by a previous process to `pending`
    pub async fn recover_stale(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', updated_at = ? WHERE status = 'running'",
        )
        .bind(Utc::now().timestamp())
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() > 0 {
            warn!(count = result.rows_affected(), "recovered jobs interrupted mid-run");
        }
        Ok(result.rows_affected())
    }

    /// Atomically claim up to `limit` due jobs (`None` for all of them).
    ///
    /// Claimed items move from `scheduled` to `queued`.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: Option<usize>) -> Result<Vec<Job>> {
        let limit = limit.map_or(-1, |l| l as i64);
        let rows = sqlx::query(
            r#"
            UPDATE jobs SET status = 'running', updated_at = ?
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'pending' AND run_at <= ?
                ORDER BY run_at, id
                LIMIT ?
            )
            RETURNING id, content_id, run_at, attempts, status, last_error
            "#,
        )
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));

        for job in &jobs {
            self.db
                .transition_content(&job.content_id, ContentStatus::Scheduled, ContentStatus::Queued)
                .await?;
        }
        Ok(jobs)
    }

    async fn finish(&self, job_id: &str, status: JobStatus, last_error: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(Utc::now().timestamp())
        .bind(job_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn requeue(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'pending', run_at = ?, attempts = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(run_at.timestamp())
        .bind(i64::from(attempts))
        .bind(last_error)
        .bind(Utc::now().timestamp())
        .bind(job_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

/// Executes due jobs through the orchestrator
pub struct JobRunner {
    db: Arc<Database>,
    queue: JobQueue,
    orchestrator: Arc<Orchestrator>,
    concurrency: usize,
    max_attempts: u32,
    initial_backoff: u64,
    poll_interval: u64,
}

impl JobRunner {
    pub fn new(db: Arc<Database>, orchestrator: Arc<Orchestrator>, scheduler: &SchedulerConfig) -> Self {
        Self {
            queue: JobQueue::new(db.clone()),
            db,
            orchestrator,
            concurrency: scheduler.concurrency.max(1),
            max_attempts: scheduler.max_attempts.max(1),
            initial_backoff: scheduler.initial_backoff,
            poll_interval: scheduler.poll_interval.max(1),
        }
    }

    /// Override the configured poll interval
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval = secs.max(1);
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Run one claimed job and record what its pass means for the job
    pub async fn execute(&self, job: Job) -> Result<JobStatus> {
        let attempt = Attempt::new(job.attempts + 1, self.max_attempts);
        let content_id = job.content_id.as_str();

        match self.orchestrator.run_attempt(content_id, attempt).await {
            Ok(RunOutcome::Deferred { run_at, .. }) => {
                self.queue
                    .requeue(&job.id, run_at, job.attempts, job.last_error.as_deref())
                    .await?;
                Ok(JobStatus::Pending)
            }
            Ok(outcome) => {
                debug!(content_id, ?outcome, "job done");
                self.queue.finish(&job.id, JobStatus::Done, None).await?;
                Ok(JobStatus::Done)
            }
            Err(e) if e.is_retryable() && !attempt.is_final() => {
                let delay = backoff(self.initial_backoff, attempt.number);
                let run_at = Utc::now() + Duration::seconds(delay.as_secs() as i64);
                warn!(
                    content_id,
                    attempt = attempt.number,
                    max_attempts = attempt.max,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "pass failed, retrying"
                );
                let message = e.to_string();
                self.queue
                    .requeue(&job.id, run_at, attempt.number, Some(&message))
                    .await?;
                Ok(JobStatus::Pending)
            }
            Err(e) => {
                let message = e.to_string();
                error!(content_id, error = %e, "job failed");
                self.queue.finish(&job.id, JobStatus::Failed, Some(&message)).await?;
                self.abandon_item(content_id, &e).await?;
                Ok(JobStatus::Failed)
            }
        }
    }

    /// Give a still-publishable item a terminal status after its job died
    async fn abandon_item(&self, content_id: &str, err: &CadenceError) -> Result<()> {
        let code = match err {
            CadenceError::Publish(PublishError::NotPublishable { .. }) => return Ok(()),
            CadenceError::Publish(e) => e.code().to_string(),
            _ => "InternalError".to_string(),
        };
        let message = err.to_string();

        for from in [ContentStatus::Publishing, ContentStatus::Queued, ContentStatus::Scheduled] {
            if self.db.fail_content(content_id, from, &code, &message).await? {
                warn!(content_id, %code, "item failed after its job gave up");
                break;
            }
        }
        Ok(())
    }

    /// Run every job that is due now and wait for them to finish
    pub async fn run_once(&self) -> Result<usize> {
        let jobs = self.queue.claim_due(Utc::now(), None).await?;
        let count = jobs.len();
        if count == 0 {
            return Ok(0);
        }
        info!(count, "running due jobs");

        let results: Vec<Result<JobStatus>> = stream::iter(jobs)
            .map(|job| self.execute(job))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for result in results {
            if let Err(e) = result {
                error!(error = %e, "error recording job result");
            }
        }
        Ok(count)
    }

    /// Poll for due jobs until `shutdown` is set, keeping at most
    /// `concurrency` jobs in flight. In-flight jobs finish before returning.
    pub async fn run_until(self: Arc<Self>, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.queue.recover_stale().await?;
        let permits = Arc::new(Semaphore::new(self.concurrency));
        info!(
            concurrency = self.concurrency,
            poll_interval = self.poll_interval,
            "job runner started"
        );

        while !shutdown.load(Ordering::Relaxed) {
            let available = permits.available_permits();
            if available > 0 {
                match self.queue.claim_due(Utc::now(), Some(available)).await {
                    Ok(jobs) => {
                        for job in jobs {
                            let permit = match permits.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };
                            let runner = self.clone();
                            tokio::spawn(async move {
                                let content_id = job.content_id.clone();
                                if let Err(e) = runner.execute(job).await {
                                    error!(content_id = %content_id, error = %e, "error recording job result");
                                }
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => error!(error = %e, "error claiming due jobs"),
                }
            }

            for _ in 0..self.poll_interval {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                tokio::time::sleep(StdDuration::from_secs(1)).await;
            }
        }

        info!("shutdown requested, waiting for in-flight jobs");
        // The semaphore is never closed, so this only waits
        let _all = permits.acquire_many(self.concurrency as u32).await;
        info!("job runner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentItem, Payload};
    use tempfile::TempDir;

    #[test]
    fn test_backoff_doubles_from_initial() {
        assert_eq!(backoff(2, 1), StdDuration::from_secs(2));
        assert_eq!(backoff(2, 2), StdDuration::from_secs(4));
        assert_eq!(backoff(2, 3), StdDuration::from_secs(8));
        assert_eq!(backoff(0, 3), StdDuration::ZERO);
    }

    #[test]
    fn test_job_id_is_stable() {
        assert_eq!(job_id("abc"), "publish:abc");
    }

    async fn queue_with_item() -> (JobQueue, Arc<Database>, String, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::new(dir.path().join("jobs.db").to_str().unwrap())
                .await
                .unwrap(),
        );
        let item = ContentItem::new(Payload::text("hello"), vec![]);
        db.create_content(&item).await.unwrap();
        (JobQueue::new(db.clone()), db, item.id, dir)
    }

    #[tokio::test]
    async fn test_schedule_twice_keeps_one_job() {
        let (queue, _db, content_id, _dir) = queue_with_item().await;
        let t1 = Utc::now() + Duration::hours(1);
        let t2 = Utc::now() + Duration::hours(2);

        let first = queue.schedule_at(&content_id, t1).await.unwrap();
        let second = queue.schedule_at(&content_id, t2).await.unwrap();
        assert_eq!(first, second);

        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].run_at.timestamp(), t2.timestamp());
    }

    #[tokio::test]
    async fn test_claim_due_is_exclusive() {
        let (queue, db, content_id, _dir) = queue_with_item().await;
        db.set_content_status(&content_id, ContentStatus::Scheduled)
            .await
            .unwrap();
        queue
            .schedule_at(&content_id, Utc::now() - Duration::seconds(5))
            .await
            .unwrap();

        let claimed = queue.claim_due(Utc::now(), None).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, JobStatus::Running);
        assert!(queue.claim_due(Utc::now(), None).await.unwrap().is_empty());

        let item = db.get_content(&content_id).await.unwrap().unwrap();
        assert_eq!(item.status, ContentStatus::Queued);
    }

    #[tokio::test]
    async fn test_future_jobs_not_claimed() {
        let (queue, _db, content_id, _dir) = queue_with_item().await;
        queue
            .schedule_at(&content_id, Utc::now() + Duration::minutes(10))
            .await
            .unwrap();
        assert!(queue.claim_due(Utc::now(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_stale_and_cancel() {
        let (queue, _db, content_id, _dir) = queue_with_item().await;
        queue
            .schedule_at(&content_id, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        queue.claim_due(Utc::now(), None).await.unwrap();

        assert_eq!(queue.recover_stale().await.unwrap(), 1);
        let job = queue.get(&content_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        assert!(queue.cancel(&content_id).await.unwrap());
        assert!(!queue.cancel(&content_id).await.unwrap());
        assert_eq!(
            queue.get(&content_id).await.unwrap().unwrap().status,
            JobStatus::Canceled
        );
        assert!(!queue
            .reschedule(&job_id(&content_id), Utc::now())
            .await
            .unwrap());
    }
}
