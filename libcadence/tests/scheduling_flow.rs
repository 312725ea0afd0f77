//! Booking through the service facade and running the booked jobs

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{TimeZone, Utc};
use common::harness;
use libcadence::runner::{job_id, JobStatus};
use libcadence::{
    CadenceError, ContentStatus, Payload, RecurrenceRule, ScheduleError, ScheduleMode, SlotTime,
};

fn daily(account: &str, times: &[(u8, u8)]) -> RecurrenceRule {
    RecurrenceRule::new(account, "UTC")
        .with_times(times.iter().map(|(h, m)| SlotTime::new(*h, *m).unwrap()))
}

#[tokio::test]
async fn test_schedule_creates_job_at_due_time() {
    let h = harness().await;
    h.service.set_rule(&daily("a", &[(9, 0), (17, 0)])).await.unwrap();
    h.service.set_rule(&daily("b", &[(12, 0)])).await.unwrap();

    let item = h
        .service
        .create_content(Payload::text("weekly"), vec!["a".into(), "b".into()])
        .await
        .unwrap();
    let from = Utc.with_ymd_and_hms(2030, 1, 7, 10, 0, 0).unwrap();
    let report = h
        .service
        .schedule(&item.id, from, ScheduleMode::Independent)
        .await
        .unwrap();

    let due = Utc.with_ymd_and_hms(2030, 1, 7, 12, 0, 0).unwrap();
    assert_eq!(report.earliest_due, Some(due));
    assert_eq!(report.booked.len(), 2);

    let job = h.service.jobs().get(&item.id).await.unwrap().unwrap();
    assert_eq!(job.id, job_id(&item.id));
    assert_eq!(job.run_at, due);
    assert_eq!(job.status, JobStatus::Pending);

    let stored = h.service.content(&item.id).await.unwrap();
    assert_eq!(stored.status, ContentStatus::Scheduled);
    assert_eq!(stored.due_at, Some(due));
}

#[tokio::test]
async fn test_sequential_schedule_staggers_accounts() {
    let h = harness().await;
    h.service.set_rule(&daily("a", &[(9, 0), (15, 0)])).await.unwrap();
    h.service.set_rule(&daily("b", &[(8, 0), (14, 0)])).await.unwrap();

    let item = h
        .service
        .create_content(Payload::text("relay"), vec!["a".into(), "b".into()])
        .await
        .unwrap();
    let from = Utc.with_ymd_and_hms(2030, 1, 7, 7, 0, 0).unwrap();
    let report = h
        .service
        .schedule(&item.id, from, ScheduleMode::Sequential)
        .await
        .unwrap();

    let times: Vec<_> = report.booked.iter().map(|s| s.slot_at).collect();
    assert_eq!(
        times,
        vec![
            Utc.with_ymd_and_hms(2030, 1, 7, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2030, 1, 7, 14, 0, 0).unwrap(),
        ]
    );
}

#[tokio::test]
async fn test_clear_queue_cancels_jobs() {
    let h = harness().await;
    h.service.set_rule(&daily("a", &[(9, 0)])).await.unwrap();
    let from = Utc.with_ymd_and_hms(2030, 1, 7, 0, 0, 0).unwrap();

    let mut ids = Vec::new();
    for text in ["one", "two"] {
        let item = h
            .service
            .create_content(Payload::text(text), vec!["a".into()])
            .await
            .unwrap();
        h.service
            .schedule(&item.id, from, ScheduleMode::Independent)
            .await
            .unwrap();
        ids.push(item.id);
    }
    assert_eq!(h.service.queue("a").await.unwrap().len(), 2);

    let mut affected = h.service.clear_queue("a").await.unwrap();
    affected.sort();
    ids.sort();
    assert_eq!(affected, ids);

    for id in &ids {
        let item = h.service.content(id).await.unwrap();
        assert_eq!(item.status, ContentStatus::Draft);
        assert_eq!(item.due_at, None);
        let job = h.service.jobs().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
    }
    assert!(h.service.queue("a").await.unwrap().is_empty());
    assert!(h.service.jobs().list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reorder_moves_jobs_with_slots() {
    let h = harness().await;
    h.service.set_rule(&daily("a", &[(9, 0)])).await.unwrap();
    let from = Utc.with_ymd_and_hms(2030, 1, 7, 0, 0, 0).unwrap();

    let mut ids = Vec::new();
    for text in ["first", "second"] {
        let item = h
            .service
            .create_content(Payload::text(text), vec!["a".into()])
            .await
            .unwrap();
        h.service
            .schedule(&item.id, from, ScheduleMode::Independent)
            .await
            .unwrap();
        ids.push(item.id);
    }

    let day_one = Utc.with_ymd_and_hms(2030, 1, 7, 9, 0, 0).unwrap();
    assert_eq!(h.service.jobs().get(&ids[0]).await.unwrap().unwrap().run_at, day_one);

    // Rebooking walks the rule from the present, so only the order is fixed
    let reversed = vec![ids[1].clone(), ids[0].clone()];
    let rebooked = h.service.reorder("a", &reversed).await.unwrap();
    assert_eq!(rebooked[0].content_id.as_deref(), Some(ids[1].as_str()));

    let first = h.service.jobs().get(&ids[1]).await.unwrap().unwrap();
    let second = h.service.jobs().get(&ids[0]).await.unwrap().unwrap();
    assert!(first.run_at < second.run_at);
    assert_eq!(first.run_at, rebooked[0].slot_at);
    assert_eq!(
        h.service.content(&ids[0]).await.unwrap().due_at,
        Some(second.run_at)
    );
}

#[tokio::test]
async fn test_rule_management_errors() {
    let h = harness().await;

    let err = h.service.set_rule(&daily("ghost", &[(9, 0)])).await.unwrap_err();
    assert!(matches!(
        err,
        CadenceError::Schedule(ScheduleError::UnknownAccount(ref id)) if id == "ghost"
    ));

    let err = h.service.set_paused("a", true).await.unwrap_err();
    assert!(matches!(
        err,
        CadenceError::Schedule(ScheduleError::NoScheduleConfigured(_))
    ));
    assert!(h.service.skip_next("a").await.is_err());

    let bad_tz = RecurrenceRule::new("a", "Nowhere/Special");
    assert!(matches!(
        h.service.set_rule(&bad_tz).await,
        Err(CadenceError::Schedule(ScheduleError::InvalidRule(_)))
    ));

    h.service.set_rule(&daily("a", &[(9, 0)])).await.unwrap();
    h.service.skip_next("a").await.unwrap();
    assert!(h.service.rule("a").await.unwrap().skip_next);
}

#[tokio::test]
async fn test_preview_reflects_skip_without_consuming_it() {
    let h = harness().await;
    h.service.set_rule(&daily("a", &[(9, 0)])).await.unwrap();
    h.service.skip_next("a").await.unwrap();

    let from = Utc.with_ymd_and_hms(2030, 1, 7, 0, 0, 0).unwrap();
    let preview = h.service.preview("a", 2, from).await.unwrap();
    assert_eq!(
        preview,
        vec![
            Utc.with_ymd_and_hms(2030, 1, 8, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2030, 1, 9, 9, 0, 0).unwrap(),
        ]
    );
    assert!(h.service.rule("a").await.unwrap().skip_next);
}

#[tokio::test]
async fn test_empty_content_rejected() {
    let h = harness().await;
    let err = h
        .service
        .create_content(Payload::text("   "), vec!["a".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::InvalidInput(_)));
}

#[tokio::test]
async fn test_run_once_publishes_due_items() {
    let h = harness().await;
    let mut ids = Vec::new();
    for i in 0..6 {
        let item = h
            .service
            .create_content(Payload::text(format!("post {}", i)), vec!["a".into(), "b".into()])
            .await
            .unwrap();
        h.service.publish_now(&item.id).await.unwrap();
        ids.push(item.id);
    }

    assert_eq!(h.service.runner().run_once().await.unwrap(), 6);

    for id in &ids {
        assert_eq!(
            h.service.content(id).await.unwrap().status,
            ContentStatus::Published
        );
        assert_eq!(
            h.service.jobs().get(id).await.unwrap().unwrap().status,
            JobStatus::Done
        );
    }
    assert_eq!(h.alpha.publish_count(), 6);
    assert_eq!(h.beta.publish_count(), 6);

    // Nothing left to claim
    assert_eq!(h.service.runner().run_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_retries_exhaust_into_recorded_failure() {
    let h = harness().await;
    for _ in 0..4 {
        h.alpha.fail_next(500);
    }
    let item = h
        .service
        .create_content(Payload::text("flaky"), vec!["a".into()])
        .await
        .unwrap();
    h.service.publish_now(&item.id).await.unwrap();

    let runner = h.service.runner();
    for attempt in 1..=4u32 {
        assert_eq!(runner.run_once().await.unwrap(), 1, "attempt {}", attempt);
        let job = h.service.jobs().get(&item.id).await.unwrap().unwrap();
        if attempt < 4 {
            assert_eq!(job.attempts, attempt);
            assert_eq!(job.status, JobStatus::Pending);
            // Skip the backoff wait
            assert!(h.service.jobs().reschedule(&job.id, Utc::now()).await.unwrap());
        } else {
            assert_eq!(job.status, JobStatus::Done);
        }
    }

    let stored = h.service.content(&item.id).await.unwrap();
    assert_eq!(stored.status, ContentStatus::Failed);
    assert_eq!(stored.last_error_code.as_deref(), Some("ServerError"));
    assert_eq!(h.alpha.publish_count(), 4);
}

#[tokio::test]
async fn test_runner_loop_publishes_and_stops() {
    let h = harness().await;
    let runner = Arc::new(h.service.runner().with_poll_interval(1));
    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(runner.run_until(shutdown.clone()));

    let item = h
        .service
        .create_content(Payload::text("looped"), vec!["b".into()])
        .await
        .unwrap();
    h.service.publish_now(&item.id).await.unwrap();

    let mut published = false;
    for _ in 0..50 {
        if h.service.content(&item.id).await.unwrap().status == ContentStatus::Published {
            published = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(100)).await;
    }
    assert!(published, "runner loop did not publish the item");

    shutdown.store(true, Ordering::Relaxed);
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("runner did not stop")
        .unwrap()
        .unwrap();
}
