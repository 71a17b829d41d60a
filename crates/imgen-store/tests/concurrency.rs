//! Concurrency properties of the store under real thread interleavings.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Duration;
use imgen_core::{
    CreditSource, EventKey, GenerationJob, GenerationRequest, JobState, JobTransition,
    PaymentIntent, PaymentState, UserId,
};
use imgen_store::{IntentTransition, RocksStore, Store, StoreError};
use tempfile::TempDir;

fn create_test_store() -> (RocksStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = RocksStore::open(dir.path()).unwrap();
    (store, dir)
}

fn funded(store: &RocksStore, balance: i64) -> UserId {
    let user_id = UserId::generate();
    store
        .credit(&user_id, balance, CreditSource::Grant, None)
        .unwrap();
    user_id
}

#[test]
fn concurrent_submissions_never_overspend() {
    let (store, _dir) = create_test_store();
    let user_id = funded(&store, 1_000);
    let admitted = AtomicUsize::new(0);
    let rejected = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..32 {
            s.spawn(|| {
                let job = GenerationJob::new(user_id, "kie", GenerationRequest::new("x"), 150);
                match store.create_job(&job) {
                    Ok(_) => admitted.fetch_add(1, Ordering::SeqCst),
                    Err(StoreError::InsufficientCredits { .. }) => {
                        rejected.fetch_add(1, Ordering::SeqCst)
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                };
            });
        }
    });

    // 1000 / 150 = 6 jobs fit.
    assert_eq!(admitted.load(Ordering::SeqCst), 6);
    assert_eq!(rejected.load(Ordering::SeqCst), 26);

    let account = store.get_account(&user_id).unwrap().unwrap();
    assert_eq!(account.balance, 100);
    assert_eq!(account.held, 900);
    assert_eq!(store.list_live_jobs().unwrap().len(), 6);
}

#[test]
fn racing_terminal_transitions_apply_one_effect() {
    let (store, _dir) = create_test_store();
    let user_id = funded(&store, 500);

    let job = GenerationJob::new(user_id, "kie", GenerationRequest::new("x"), 200);
    store.create_job(&job).unwrap();
    store
        .transition_job(
            &job.id,
            JobState::Created,
            &JobTransition::to(JobState::Submitting),
            None,
        )
        .unwrap();
    store
        .transition_job(
            &job.id,
            JobState::Submitting,
            &JobTransition::accepted("task-race"),
            None,
        )
        .unwrap();

    let job_id = job.id;
    let event = EventKey::provider_task("kie", "task-race");
    let wins = AtomicUsize::new(0);
    let losses = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for i in 0..16 {
            let (wins, losses, store, event) = (&wins, &losses, &store, &event);
            s.spawn(move || {
                // Half the pollers see success, half see failure.
                let transition = if i % 2 == 0 {
                    JobTransition::succeeded("https://x/y.png")
                } else {
                    JobTransition::failed("provider said no")
                };
                match store.transition_job(&job_id, JobState::Waiting, &transition, Some(event)) {
                    Ok(_) => wins.fetch_add(1, Ordering::SeqCst),
                    Err(StoreError::StaleTransition { .. } | StoreError::DuplicateEvent { .. }) => {
                        losses.fetch_add(1, Ordering::SeqCst)
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                };
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert_eq!(losses.load(Ordering::SeqCst), 15);

    let job = store.get_job(&job_id).unwrap().unwrap();
    let account = store.get_account(&user_id).unwrap().unwrap();
    assert_eq!(account.held, 0);
    match job.state {
        JobState::Succeeded => assert_eq!(account.balance, 300),
        JobState::Failed => assert_eq!(account.balance, 500),
        other => panic!("job not terminal: {other:?}"),
    }
}

#[test]
fn concurrent_event_records_insert_once() {
    let (store, _dir) = create_test_store();
    let event = EventKey::payment("evt-dup");
    let firsts = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..16 {
            s.spawn(|| {
                if store.record_event(&event).unwrap() {
                    firsts.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(firsts.load(Ordering::SeqCst), 1);
}

#[test]
fn payment_credit_and_job_hold_on_same_account_serialize() {
    let (store, _dir) = create_test_store();
    let user_id = funded(&store, 1);
    let intent =
        PaymentIntent::with_token(user_id, 1_000, Duration::minutes(5), "PAY-RACE0001").unwrap();
    store.create_payment_intent(&intent).unwrap();
    store
        .transition_payment_intent(
            &intent.id,
            PaymentState::Pending,
            &IntentTransition {
                to: PaymentState::Matched,
                event: Some(EventKey::payment("evt-race")),
                received_amount: Some(1_000),
            },
        )
        .unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            store.complete_payment_intent(&intent.id).unwrap();
        });
        s.spawn(|| {
            for _ in 0..50 {
                let _ = store.hold(&user_id, 1, None);
                let _ = store.release_hold(&user_id, 1, None);
            }
        });
    });

    let account = store.get_account(&user_id).unwrap().unwrap();
    // Every hold was either rejected or paired with a release.
    assert_eq!(account.total(), 1_001);
    assert_eq!(account.lifetime_purchased, 1_000);
}
