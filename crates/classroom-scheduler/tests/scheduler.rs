use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration as StdDuration,
};

use anyhow::bail;
use chrono::{Duration, Utc};
use classroom_core::config::SchedulerConfig;
use classroom_scheduler::{
    JobFilter, JobOptions, JobRequest, JobStore, NewJob, Priority, Scheduler, SqliteJobStore,
};
use serde_json::json;
use tokio::sync::Semaphore;

fn config(worker: &str) -> SchedulerConfig {
    SchedulerConfig {
        worker_id: Some(worker.to_string()),
        poll_interval_secs: 1,
        jitter_ms: 0,
        ..SchedulerConfig::default()
    }
}

fn shared_store() -> Arc<SqliteJobStore> {
    Arc::new(SqliteJobStore::in_memory().unwrap())
}

fn counting(scheduler: &Scheduler, name: &str, options: JobOptions) -> Arc<AtomicUsize> {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    scheduler.define(
        name,
        move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
        options,
    );
    runs
}

/// Handler that blocks until `gate` hands out a permit.
fn gated(scheduler: &Scheduler, name: &str, options: JobOptions, gate: Arc<Semaphore>) {
    scheduler.define(
        name,
        move |_job| {
            let gate = Arc::clone(&gate);
            async move {
                gate.acquire().await?.forget();
                Ok::<_, anyhow::Error>(())
            }
        },
        options,
    );
}

#[tokio::test]
async fn two_workers_never_claim_the_same_job() {
    let store = shared_store();
    let a = Scheduler::new(store.clone(), &config("worker-a"));
    let b = Scheduler::new(store.clone(), &config("worker-b"));
    let runs_a = counting(&a, "class_go_live", JobOptions::default().concurrency(50));
    let runs_b = counting(&b, "class_go_live", JobOptions::default().concurrency(50));

    let now = Utc::now();
    for i in 0..20 {
        a.schedule(now, "class_go_live", json!({ "classId": format!("c{i}") }))
            .unwrap();
    }

    let dispatched_a = a.tick_at(now).unwrap();
    let dispatched_b = b.tick_at(now).unwrap();
    a.drain().await;
    b.drain().await;

    assert_eq!(dispatched_a + dispatched_b, 20);
    assert_eq!(
        runs_a.load(Ordering::SeqCst) + runs_b.load(Ordering::SeqCst),
        20
    );
    assert!(store.find(&JobFilter::all()).unwrap().is_empty());
}

#[tokio::test]
async fn claim_race_has_exactly_one_winner() {
    let store = shared_store();
    let a = Scheduler::new(store.clone(), &config("worker-a"));
    let now = Utc::now();
    let job = a
        .schedule(now, "class_go_live", json!({ "classId": "c1" }))
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let id = job.id.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            store.claim(&id, &format!("w{i}"), now).unwrap()
        }));
    }
    let mut winners = 0;
    for h in handles {
        if h.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn expired_lock_is_recovered_and_runs_once() {
    let store = shared_store();
    let survivor = Scheduler::new(store.clone(), &config("survivor"));
    let options = JobOptions::default().lock_lifetime(StdDuration::from_secs(60));
    let runs = counting(&survivor, "class_go_live", options);

    let now = Utc::now();
    let job = survivor
        .schedule(now, "class_go_live", json!({ "classId": "c1" }))
        .unwrap();
    // a worker claims and then dies without reporting
    assert!(store.claim(&job.id, "crashed", now).unwrap());

    assert_eq!(survivor.tick_at(now + Duration::seconds(30)).unwrap(), 0);
    assert_eq!(survivor.tick_at(now + Duration::seconds(61)).unwrap(), 1);
    survivor.drain().await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // the crashed worker coming back cannot record a second outcome
    assert!(!store.complete(&job.id, "crashed", Utc::now(), None).unwrap());
    assert_eq!(survivor.tick_at(now + Duration::hours(1)).unwrap(), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_job_stays_put() {
    let store = shared_store();
    let scheduler = Scheduler::new(store.clone(), &config("w"));
    scheduler.define(
        "class_go_live",
        |_job| async { bail!("class store unavailable") },
        JobOptions::default(),
    );

    let now = Utc::now();
    let job = scheduler
        .schedule(now, "class_go_live", json!({ "classId": "c1" }))
        .unwrap();
    assert_eq!(scheduler.tick_at(now).unwrap(), 1);
    scheduler.drain().await;

    let failed = store.get(&job.id).unwrap().unwrap();
    assert_eq!(failed.fail_reason.as_deref(), Some("class store unavailable"));
    assert_eq!(failed.fail_count, 1);
    assert_eq!(failed.next_run_at, job.next_run_at);
    assert!(failed.locked_by.is_none());

    assert_eq!(scheduler.tick_at(now + Duration::hours(1)).unwrap(), 0);
}

#[tokio::test]
async fn handler_panic_is_recorded_as_failure() {
    let store = shared_store();
    let scheduler = Scheduler::new(store.clone(), &config("w"));
    scheduler.define(
        "class_go_live",
        |_job| async { panic!("handler bug") },
        JobOptions::default(),
    );

    let now = Utc::now();
    let job = scheduler
        .schedule(now, "class_go_live", json!({ "classId": "c1" }))
        .unwrap();
    scheduler.tick_at(now).unwrap();
    scheduler.drain().await;

    let failed = store.get(&job.id).unwrap().unwrap();
    assert!(failed.fail_reason.unwrap().contains("handler bug"));
}

#[tokio::test]
async fn opt_in_retries_back_off_then_settle() {
    let store = shared_store();
    let scheduler = Scheduler::new(store.clone(), &config("w"));
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    scheduler.define(
        "class_send_reminder",
        move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                bail!("smtp down")
            }
        },
        JobOptions::default().max_retries(1),
    );

    let now = Utc::now();
    let job = scheduler
        .schedule(now, "class_send_reminder", json!({ "classId": "c1" }))
        .unwrap();
    scheduler.tick_at(now).unwrap();
    scheduler.drain().await;

    let retrying = store.get(&job.id).unwrap().unwrap();
    assert!(retrying.next_run_at >= now + Duration::seconds(59));
    assert_eq!(scheduler.tick_at(now + Duration::seconds(30)).unwrap(), 0);

    scheduler.tick_at(now + Duration::minutes(5)).unwrap();
    scheduler.drain().await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let settled = store.get(&job.id).unwrap().unwrap();
    assert_eq!(settled.fail_count, 2);
    assert_eq!(scheduler.tick_at(now + Duration::days(1)).unwrap(), 0);
}

#[tokio::test]
async fn recurring_job_advances_instead_of_deleting() {
    let store = shared_store();
    let scheduler = Scheduler::new(store.clone(), &config("w"));
    let runs = counting(&scheduler, "cleanup", JobOptions::default());

    let job = scheduler.every("0 0 3 * * *", "cleanup", json!({})).unwrap();
    let again = scheduler.every("0 0 3 * * *", "cleanup", json!({})).unwrap();
    assert_eq!(job.id, again.id);

    assert_eq!(scheduler.tick_at(job.next_run_at).unwrap(), 1);
    scheduler.drain().await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // ticked at the due instant, ahead of the wall clock: the next run is the
    // following day's slot, not the one just run
    let advanced = store.get(&job.id).unwrap().unwrap();
    assert!(advanced.next_run_at > job.next_run_at);
    assert_eq!(advanced.next_run_at, job.next_run_at + Duration::days(1));
    assert!(advanced.locked_by.is_none());
    assert!(advanced.last_finished_at.is_some());
}

#[tokio::test]
async fn invalid_cron_is_rejected() {
    let scheduler = Scheduler::new(shared_store(), &config("w"));
    assert!(scheduler.every("not a cron", "cleanup", json!({})).is_err());
}

#[tokio::test]
async fn per_name_cap_leaves_excess_jobs_unclaimed() {
    let store = shared_store();
    let scheduler = Scheduler::new(store.clone(), &config("w"));
    let gate = Arc::new(Semaphore::new(0));
    gated(
        &scheduler,
        "class_go_live",
        JobOptions::default().concurrency(2),
        Arc::clone(&gate),
    );

    let now = Utc::now();
    for i in 0..5 {
        scheduler
            .schedule(now, "class_go_live", json!({ "classId": format!("c{i}") }))
            .unwrap();
    }

    assert_eq!(scheduler.tick_at(now).unwrap(), 2);
    assert_eq!(scheduler.tick_at(now).unwrap(), 0);
    let unclaimed = store
        .find(&JobFilter::all())
        .unwrap()
        .into_iter()
        .filter(|j| j.locked_by.is_none())
        .count();
    assert_eq!(unclaimed, 3);

    gate.add_permits(5);
    scheduler.drain().await;
    assert_eq!(scheduler.tick_at(now).unwrap(), 2);
    scheduler.drain().await;
    assert_eq!(scheduler.tick_at(now).unwrap(), 1);
    scheduler.drain().await;
    assert!(store.find(&JobFilter::all()).unwrap().is_empty());
}

#[tokio::test]
async fn global_cap_spans_job_names() {
    let store = shared_store();
    let config = SchedulerConfig {
        max_concurrency: 1,
        ..config("w")
    };
    let scheduler = Scheduler::new(store, &config);
    let gate = Arc::new(Semaphore::new(0));
    gated(&scheduler, "a", JobOptions::default(), Arc::clone(&gate));
    gated(&scheduler, "b", JobOptions::default(), Arc::clone(&gate));

    let now = Utc::now();
    scheduler.schedule(now, "a", json!({})).unwrap();
    scheduler.schedule(now, "b", json!({})).unwrap();

    assert_eq!(scheduler.tick_at(now).unwrap(), 1);
    assert_eq!(scheduler.tick_at(now).unwrap(), 0);
    gate.add_permits(2);
    scheduler.drain().await;
    assert_eq!(scheduler.tick_at(now).unwrap(), 1);
    scheduler.drain().await;
}

#[tokio::test]
async fn undefined_names_are_left_for_other_workers() {
    let store = shared_store();
    let scheduler = Scheduler::new(store.clone(), &config("w"));
    counting(&scheduler, "a", JobOptions::default());

    let now = Utc::now();
    scheduler.schedule(now, "unknown", json!({})).unwrap();
    assert_eq!(scheduler.tick_at(now).unwrap(), 0);
    assert_eq!(store.find(&JobFilter::all()).unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_does_not_touch_running_jobs() {
    let store = shared_store();
    let scheduler = Scheduler::new(store.clone(), &config("w"));
    let gate = Arc::new(Semaphore::new(0));
    gated(
        &scheduler,
        "class_go_live",
        JobOptions::default(),
        Arc::clone(&gate),
    );

    let now = Utc::now();
    scheduler
        .schedule(now, "class_go_live", json!({ "classId": "c1" }))
        .unwrap();
    scheduler
        .schedule(
            now + Duration::hours(1),
            "class_go_live",
            json!({ "classId": "c1" }),
        )
        .unwrap();
    assert_eq!(scheduler.tick_at(now).unwrap(), 1);

    assert_eq!(scheduler.cancel(&JobFilter::for_class("c1")).unwrap(), 1);
    gate.add_permits(1);
    scheduler.drain().await;
    assert!(store.find(&JobFilter::for_class("c1")).unwrap().is_empty());
}

#[tokio::test]
async fn replace_swaps_the_job_set() {
    let store = shared_store();
    let scheduler = Scheduler::new(store.clone(), &config("w"));
    let now = Utc::now();
    for name in ["a", "b"] {
        scheduler
            .schedule(now, name, json!({ "classId": "c1" }))
            .unwrap();
    }
    scheduler
        .schedule(now, "a", json!({ "classId": "c2" }))
        .unwrap();

    let later = now + Duration::days(1);
    let inserted = scheduler
        .replace(
            &JobFilter::for_class("c1"),
            vec![
                JobRequest::new("a", later, json!({ "classId": "c1" })),
                JobRequest::new("b", later, json!({ "classId": "c1" })),
                JobRequest::new("c", later, json!({ "classId": "c1" })),
            ],
        )
        .unwrap();
    assert_eq!(inserted.len(), 3);

    let c1 = scheduler.jobs(&JobFilter::for_class("c1")).unwrap();
    assert_eq!(c1.len(), 3);
    assert!(c1.iter().all(|j| j.next_run_at > now));
    assert_eq!(scheduler.jobs(&JobFilter::for_class("c2")).unwrap().len(), 1);
}

#[tokio::test]
async fn stop_waits_for_in_flight_jobs() {
    let store = shared_store();
    let scheduler = Scheduler::new(store.clone(), &config("w"));
    let done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&done);
    scheduler.define(
        "slow",
        move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(StdDuration::from_millis(100)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
        JobOptions::default(),
    );
    scheduler.schedule(Utc::now(), "slow", json!({})).unwrap();

    scheduler.start();
    scheduler.start();
    // first tick happens immediately; give it a moment to dispatch
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    scheduler.stop().await;

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(store.find(&JobFilter::all()).unwrap().is_empty());
}

#[tokio::test]
async fn redefining_a_name_replaces_the_handler() {
    let scheduler = Scheduler::new(shared_store(), &config("w"));
    let first = counting(&scheduler, "a", JobOptions::default());
    let second = counting(&scheduler, "a", JobOptions::default());

    let now = Utc::now();
    scheduler.schedule(now, "a", json!({})).unwrap();
    scheduler.tick_at(now).unwrap();
    scheduler.drain().await;

    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn capped_name_does_not_crowd_out_other_names() {
    let store = shared_store();
    let scheduler = Scheduler::new(
        store.clone(),
        &SchedulerConfig {
            batch_size: 2,
            ..config("w")
        },
    );
    let gate = Arc::new(Semaphore::new(0));
    gated(
        &scheduler,
        "class_end_session",
        JobOptions::default().priority(Priority::High).concurrency(1),
        Arc::clone(&gate),
    );
    let reminders = counting(&scheduler, "class_send_reminder", JobOptions::default());

    let now = Utc::now();
    for i in 0..4 {
        scheduler
            .schedule(now, "class_end_session", json!({ "classId": format!("c{i}") }))
            .unwrap();
    }
    scheduler
        .schedule(now, "class_send_reminder", json!({ "classId": "c9" }))
        .unwrap();

    // high-priority rows fill the first batch; one of them fits the cap
    assert_eq!(scheduler.tick_at(now).unwrap(), 1);
    // the capped name is skipped, so the reminder reaches the batch
    assert_eq!(scheduler.tick_at(now).unwrap(), 1);

    gate.add_permits(4);
    scheduler.drain().await;
    assert_eq!(reminders.load(Ordering::SeqCst), 1);
}

fn file_store(path: &std::path::Path) -> SqliteJobStore {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.busy_timeout(StdDuration::from_secs(5)).unwrap();
    conn.execute_batch("PRAGMA journal_mode=WAL;").unwrap();
    SqliteJobStore::new(conn).unwrap()
}

#[test]
fn concurrent_recurring_registration_shares_one_row() {
    let path = std::env::temp_dir().join(format!("classroom-jobs-{}.db", uuid::Uuid::new_v4()));
    let stores = [Arc::new(file_store(&path)), Arc::new(file_store(&path))];

    for round in 0..25 {
        let name = format!("cleanup-{round}");
        let barrier = Arc::new(std::sync::Barrier::new(stores.len()));
        let workers: Vec<_> = stores
            .iter()
            .map(|store| {
                let store = Arc::clone(store);
                let barrier = Arc::clone(&barrier);
                let job = NewJob {
                    name: name.clone(),
                    payload: json!({}),
                    next_run_at: Utc::now() + Duration::hours(1),
                    repeat_cron: Some("0 0 3 * * *".into()),
                    priority: Priority::Low,
                    lock_lifetime_ms: 60_000,
                    max_retries: 0,
                };
                std::thread::spawn(move || {
                    barrier.wait();
                    store.upsert_recurring(job, Utc::now())
                })
            })
            .collect();

        for worker in workers {
            let result = worker.join().unwrap();
            assert!(result.is_ok(), "round {round}: {:?}", result.err());
        }
        let rows = stores[0].find(&JobFilter::all().named(&name)).unwrap();
        assert_eq!(rows.len(), 1, "round {round}");
    }

    drop(stores);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}
