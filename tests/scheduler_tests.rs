mod common;

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{SOURCE_LIMIT, TestService, submission, submission_with_limits};
use runjail::report::Verdict;
use runjail::rules::LimitError;
use runjail::scheduler::{Scheduler, SubmitError};

/// Waits until every queued ticket was picked up by a worker
async fn wait_until_drained(scheduler: &Scheduler) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.queued() > 0 {
        assert!(Instant::now() < deadline, "no worker picked up the queued job");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_language_is_rejected() {
    let service = TestService::start(1, 1);
    let err = service
        .scheduler
        .submit(submission("cobol", "DISPLAY 'HI'."))
        .await
        .unwrap_err();

    assert_eq!(err, SubmitError::UnknownLanguage("cobol".to_string()));
    assert!(service.scratch_is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_source_too_large() {
    let service = TestService::start(1, 1);
    let source = "#".repeat(SOURCE_LIMIT as usize + 1);
    let err = service.scheduler.enqueue(submission("sh", &source)).unwrap_err();

    assert_eq!(
        err,
        SubmitError::SourceTooLarge {
            size: SOURCE_LIMIT + 1,
            limit: SOURCE_LIMIT,
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overrides_only_tighten() {
    let service = TestService::start(1, 1);

    let err = service
        .scheduler
        .enqueue(submission_with_limits("sh", "true", json!({ "cpu_time_sec": 100.0 })))
        .unwrap_err();
    assert!(matches!(
        err,
        SubmitError::InvalidLimits(LimitError::AboveRule { field: "cpu_time_sec", .. })
    ));

    let err = service
        .scheduler
        .enqueue(submission_with_limits("sh", "true", json!({ "processes": 0 })))
        .unwrap_err();
    assert_eq!(err, SubmitError::InvalidLimits(LimitError::NotPositive("processes")));

    let result = service
        .scheduler
        .submit(submission_with_limits("sh", "echo ok", json!({ "output_bytes": 2 })))
        .await
        .unwrap();
    assert_eq!(result.verdict, Verdict::OutputLimitExceeded);
    assert_eq!(result.stdout, "ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_full_and_cancel() {
    let service = TestService::start(1, 1);
    let scheduler = &service.scheduler;

    let running = scheduler.enqueue(submission("sh", "sleep 0.5; echo first")).unwrap();
    wait_until_drained(scheduler).await;
    let queued = scheduler.enqueue(submission("sh", "echo second")).unwrap();

    // one running plus one waiting fills the pool
    let err = scheduler.enqueue(submission("sh", "echo third")).unwrap_err();
    assert_eq!(err, SubmitError::QueueFull);

    assert!(scheduler.cancel(queued.id()));
    assert!(!scheduler.cancel(queued.id()));
    assert!(!scheduler.cancel(running.id()));
    assert_eq!(queued.wait().await.unwrap_err(), SubmitError::Canceled);

    // the canceled ticket's slot is free again
    let next = scheduler.enqueue(submission("sh", "echo fourth")).unwrap();

    let first = running.wait().await.unwrap();
    assert_eq!(first.verdict, Verdict::Success);
    assert_eq!(first.stdout, "first\n");
    assert_eq!(next.wait().await.unwrap().stdout, "fourth\n");
    assert!(service.scratch_is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fifo_order() {
    let service = TestService::start(1, 8);
    let scheduler = &service.scheduler;

    let tickets: Vec<_> = (0..4)
        .map(|i| {
            scheduler
                .enqueue(submission("sh", &format!("date +%s%N; echo {i}")))
                .unwrap()
        })
        .collect();

    let mut finished = Vec::new();
    for ticket in tickets {
        let result = ticket.wait().await.unwrap();
        let mut lines = result.stdout.lines();
        let stamp: u128 = lines.next().unwrap().parse().unwrap();
        finished.push((stamp, lines.next().unwrap().to_string()));
    }

    let mut by_start = finished.clone();
    by_start.sort();
    assert_eq!(by_start, finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_fails_queued_and_finishes_running() {
    let service = TestService::start(1, 4);
    let scheduler = &service.scheduler;

    let running = scheduler.enqueue(submission("sh", "sleep 0.3; echo done")).unwrap();
    wait_until_drained(scheduler).await;
    let queued = scheduler.enqueue(submission("sh", "echo never")).unwrap();

    scheduler.shutdown();

    assert_eq!(queued.wait().await.unwrap_err(), SubmitError::ShuttingDown);
    assert_eq!(
        scheduler.enqueue(submission("sh", "echo late")).unwrap_err(),
        SubmitError::ShuttingDown
    );

    let result = running.wait().await.unwrap();
    assert_eq!(result.verdict, Verdict::Success);
    assert_eq!(result.stdout, "done\n");

    tokio::time::timeout(Duration::from_secs(5), scheduler.join())
        .await
        .unwrap();
    assert!(service.scratch_is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_submission_is_withdrawn() {
    let service = TestService::start(1, 1);
    let scheduler = &service.scheduler;

    let running = scheduler.enqueue(submission("sh", "sleep 0.5; echo first")).unwrap();
    wait_until_drained(scheduler).await;

    // the submitter goes away while its job still waits for the worker
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        scheduler.submit(submission("sh", "echo abandoned")),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(scheduler.queued(), 0);

    // its admission slot is free again
    let next = scheduler.enqueue(submission("sh", "echo next")).unwrap();
    assert_eq!(running.wait().await.unwrap().stdout, "first\n");
    assert_eq!(next.wait().await.unwrap().stdout, "next\n");
    assert!(service.scratch_is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_size_bounds_concurrency() {
    let service = TestService::start(2, 3);
    let scheduler = &service.scheduler;

    let mut tickets = Vec::new();
    let mut refused = 0;
    for _ in 0..8 {
        match scheduler.enqueue(submission("sh", "date +%s%N; sleep 0.2; date +%s%N")) {
            Ok(ticket) => tickets.push(ticket),
            Err(SubmitError::QueueFull) => refused += 1,
            Err(e) => panic!("unexpected refusal: {e}"),
        }
    }
    assert_eq!(tickets.len(), 5);
    assert_eq!(refused, 3);

    // (timestamp, +1 for a start, -1 for an end)
    let mut events: Vec<(u128, i32)> = Vec::new();
    for ticket in tickets {
        let result = ticket.wait().await.unwrap();
        assert_eq!(result.verdict, Verdict::Success);
        let stamps: Vec<u128> = result.stdout.lines().map(|l| l.parse().unwrap()).collect();
        events.push((stamps[0], 1));
        events.push((stamps[1], -1));
    }
    // ends sort before starts at the same instant
    events.sort();

    let mut running = 0;
    let mut peak = 0;
    for (_, delta) in events {
        running += delta;
        peak = peak.max(running);
    }
    assert!(peak <= 2, "{peak} jobs ran at once on 2 workers");
    assert!(peak >= 1);
}
