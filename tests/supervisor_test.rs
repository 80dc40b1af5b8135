mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Transaction};
use serde_json::json;
use spiteflow::processor::{Projection, Reaction};
use spiteflow::{
    CheckpointTracker, Emitter, Error, Event, EventId, EventStore, EventStreamProcessor,
    EventTypes, LockMode, NewEvent, ProcessorConfig, ProcessorSpec, Projector, Reactor,
    RetryPolicy, Supervisor, SupervisorConfig, UnitOutcome,
};

/// Counts deposits per account and fails a fixed number of times on one event.
struct Ledger {
    fail_on: u64,
    failures_left: Arc<AtomicUsize>,
}

impl Projection for Ledger {
    fn project(&mut self, event: &Event, tx: &Transaction<'_>) -> spiteflow::Result<()> {
        tx.execute(
            "INSERT INTO deposits (account, n) VALUES (?1, 1)
             ON CONFLICT(account) DO UPDATE SET n = n + 1",
            params![event.aggregate_id.as_str()],
        )?;
        if event.id.as_raw() == self.fail_on
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::Runtime("downstream timeout".to_string()));
        }
        Ok(())
    }
}

fn ledger(store: &EventStore, fail_on: u64, failures: usize) -> (EventStreamProcessor<Projector<Ledger>>, Arc<AtomicUsize>) {
    let failures_left = Arc::new(AtomicUsize::new(failures));
    let spec = ProcessorSpec::new("ledger").processes(["deposited"]).table(
        "deposits",
        "CREATE TABLE IF NOT EXISTS deposits (account TEXT PRIMARY KEY, n INTEGER NOT NULL)",
    );
    let projector = Projector::new(
        spec,
        Ledger {
            fail_on,
            failures_left: Arc::clone(&failures_left),
        },
    );
    let config = ProcessorConfig::default().with_wait_timeout(Duration::from_millis(20));
    let processor = EventStreamProcessor::new(store, projector, config).unwrap();
    (processor, failures_left)
}

fn deposits(store: &EventStore, account: &str) -> i64 {
    store
        .with_connection(|conn| {
            Ok(conn
                .query_row("SELECT n FROM deposits WHERE account = ?1", params![account], |r| r.get(0))
                .unwrap_or(0))
        })
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn constant_retry_resumes_from_unadvanced_checkpoint() {
    let (_dir, path) = common::create_temp_db_file("retry.db");
    let store = common::open_store(&path);
    common::append_n(&store, "acct-1", "deposited", 3);

    let (processor, failures_left) = ledger(&store, 2, 2);
    let supervisor = Supervisor::new(
        SupervisorConfig::default().with_retry(RetryPolicy::Constant {
            delay: Duration::from_millis(10),
        }),
    )
    .with_unit(processor);

    let observer = store.try_clone().unwrap();
    let trigger = async move {
        common::eventually(Duration::from_secs(10), Duration::from_millis(10), || {
            (deposits(&observer, "acct-1") == 3).then_some(())
        })
        .await;
    };
    let exits = tokio::time::timeout(Duration::from_secs(20), supervisor.run_until(trigger))
        .await
        .expect("supervisor should stop")
        .unwrap();

    assert_eq!(failures_left.load(Ordering::SeqCst), 0, "both failures were retried");
    assert_eq!(deposits(&store, "acct-1"), 3, "event 2 applied exactly once");
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].name, "ledger");
    assert!(matches!(exits[0].outcome, UnitOutcome::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_retry_policy_stops_at_first_failure() {
    let (_dir, path) = common::create_temp_db_file("no_retry.db");
    let store = common::open_store(&path);
    common::append_n(&store, "acct-1", "deposited", 3);

    let (processor, failures_left) = ledger(&store, 2, 1);
    let tracker = processor.tracker().clone();
    let supervisor = Supervisor::new(SupervisorConfig::default()).with_unit(processor);

    let exits = tokio::time::timeout(
        Duration::from_secs(10),
        supervisor.run_until(std::future::pending::<()>()),
    )
    .await
    .expect("a unit that gives up ends the run")
    .unwrap();

    assert_eq!(failures_left.load(Ordering::SeqCst), 0);
    match &exits[0].outcome {
        UnitOutcome::Failed(err) => assert_eq!(err.offending_event(), Some(EventId::from_raw(2))),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(tracker.last_processed("ledger").unwrap(), EventId::FIRST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn locked_out_processor_is_not_retried() {
    let (_dir, path) = common::create_temp_db_file("locked.db");
    let store = common::open_store(&path);

    let (mut holder, _) = ledger(&store, 0, 0);
    holder.setup().unwrap();

    let (contender, _) = ledger(&store, 0, 0);
    let supervisor = Supervisor::new(
        SupervisorConfig::default().with_retry(RetryPolicy::Exponential {
            base: Duration::from_millis(5),
            max: Duration::from_millis(50),
        }),
    )
    .with_unit(contender);

    let exits = tokio::time::timeout(
        Duration::from_secs(10),
        supervisor.run_until(std::future::pending::<()>()),
    )
    .await
    .expect("fatal errors end the unit")
    .unwrap();

    assert!(matches!(
        exits[0].outcome,
        UnitOutcome::Failed(Error::UnableToLockProcessor { .. })
    ));
    drop(holder);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lock_taken_over_during_backoff_ends_the_unit() {
    let (_dir, path) = common::create_temp_db_file("takeover.db");
    let store = common::open_store(&path);
    common::append_n(&store, "acct-1", "deposited", 3);

    let (processor, failures_left) = ledger(&store, 2, 1);
    let supervisor = Supervisor::new(
        SupervisorConfig::default().with_retry(RetryPolicy::Constant {
            delay: Duration::from_millis(300),
        }),
    )
    .with_unit(processor);
    let running = tokio::spawn(supervisor.run_until(std::future::pending::<()>()));

    common::eventually(Duration::from_secs(10), Duration::from_millis(5), || {
        (failures_left.load(Ordering::SeqCst) == 0).then_some(())
    })
    .await;

    // While the unit sleeps, its lock goes stale and another instance takes it.
    store
        .with_connection(|conn| {
            conn.execute("UPDATE cooperative_locks SET heartbeat_at_ms = 0", [])?;
            Ok(())
        })
        .unwrap();
    let rival = CheckpointTracker::new(
        Arc::new(store.try_clone().unwrap()),
        LockMode::Exclusive,
        Duration::from_secs(30),
    );
    let _rival_lock = rival.setup("ledger").unwrap();

    let exits = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("a lost lock ends the unit")
        .unwrap()
        .unwrap();

    assert!(matches!(
        exits[0].outcome,
        UnitOutcome::Failed(Error::UnableToLockProcessor { .. })
    ));
    assert_eq!(deposits(&store, "acct-1"), 1, "nothing applied after the lock was lost");
    assert_eq!(rival.last_processed("ledger").unwrap(), EventId::FIRST);
}

struct Welcome;

impl Reaction for Welcome {
    fn react(&mut self, event: &Event, emit: &mut Emitter<'_>) -> spiteflow::Result<()> {
        emit.emit(event.aggregate_id.clone(), "welcome_sent", json!({}))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_handle_stops_every_unit() {
    let (_dir, path) = common::create_temp_db_file("handle.db");
    let store = common::open_store(&path);

    let reactor = Reactor::new(
        ProcessorSpec::new("welcome")
            .processes(["user_registered"])
            .emits(["welcome_sent"]),
        Welcome,
    );
    let config = ProcessorConfig::default().with_wait_timeout(Duration::from_millis(20));
    let reactor = EventStreamProcessor::new(&store, reactor, config).unwrap();
    let (projector, _) = ledger(&store, 0, 0);

    let supervisor = Supervisor::new(SupervisorConfig::default())
        .with_unit(reactor)
        .with_unit(projector);
    let handle = supervisor.shutdown_handle();
    let running = tokio::spawn(supervisor.run_until(std::future::pending::<()>()));

    for user in ["u1", "u2", "u3"] {
        store
            .append(vec![NewEvent::new(user, "user_registered", json!({}))], None)
            .unwrap();
    }
    common::append_n(&store, "acct-9", "deposited", 2);

    common::eventually(Duration::from_secs(10), Duration::from_millis(10), || {
        let welcomes = store
            .read_from(EventId::FIRST, &EventTypes::only(["welcome_sent"]), 100)
            .unwrap();
        (welcomes.len() == 3 && deposits(&store, "acct-9") == 2).then_some(())
    })
    .await;

    handle.request();
    let exits = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("units should stop")
        .unwrap()
        .unwrap();

    assert_eq!(exits.len(), 2);
    assert!(exits.iter().all(|exit| matches!(exit.outcome, UnitOutcome::Stopped)));
}
