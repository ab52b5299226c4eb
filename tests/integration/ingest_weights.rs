#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::{Arc, Once};
use std::time::Duration;

use dagstore::store::{CounterMetrics, HealthStatus};
use dagstore::{
    Goff, Hash, Owner, PutOutcome, Record, RecordSpec, Result, Selector, Store, StoreOptions,
};
use tempfile::{tempdir, TempDir};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn record(selector: u8, links: &[Hash], timestamp: u64, work: u64) -> Record {
    Record::new(RecordSpec {
        owner: Owner([7u8; 32]),
        selectors: &[Selector([selector; 32])],
        links,
        value: &[selector, timestamp as u8],
        timestamp,
        work,
    })
}

fn open_store() -> Result<(TempDir, Store)> {
    init_tracing();
    let dir = tempdir()?;
    let store = Store::open(
        StoreOptions::new(dir.path()).retry_sweep_interval(Duration::from_millis(20)),
    )?;
    Ok((dir, store))
}

fn weight(store: &Store, record: &Record) -> Result<u128> {
    Ok(store.weight_of(&record.hash())?.expect("record stored"))
}

#[test]
fn diamond_weight_is_own_contribution_plus_referrer_weights() -> Result<()> {
    let (_dir, store) = open_store()?;
    let genesis = record(1, &[], 1, 10);
    let a = record(2, &[genesis.hash()], 2, 5);
    let b = record(3, &[genesis.hash()], 3, 7);
    let c = record(4, &[a.hash(), b.hash()], 4, 11);
    for rec in [&genesis, &a, &b, &c] {
        store.put(rec)?;
    }
    assert!(store.wait_idle(Duration::from_secs(10)));

    assert_eq!(weight(&store, &c)?, 11);
    assert_eq!(weight(&store, &a)?, 5 + 11);
    assert_eq!(weight(&store, &b)?, 7 + 11);
    // c reaches genesis through a and through b.
    assert_eq!(weight(&store, &genesis)?, 10 + 5 + 7 + 2 * 11);
    assert_eq!(
        weight(&store, &genesis)?,
        genesis.contribution() + weight(&store, &a)? + weight(&store, &b)?
    );
    assert_eq!(
        weight(&store, &a)?,
        a.contribution() + weight(&store, &c)?
    );
    assert_eq!(store.pending_count()?, 0);
    assert_eq!(store.pending_hole_count()?, 0);
    for goff in 0..4 {
        assert!(store.is_applied(Goff(goff)));
    }
    Ok(())
}

#[test]
fn genesis_gains_the_sum_of_child_contributions() -> Result<()> {
    let (_dir, store) = open_store()?;
    let genesis = record(1, &[], 1, 10);
    let a = record(2, &[genesis.hash()], 2, 40);
    let b = record(3, &[genesis.hash()], 3, 2);
    store.put(&genesis)?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    let before = weight(&store, &genesis)?;
    assert_eq!(before, genesis.contribution());

    store.put(&a)?;
    store.put(&b)?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(
        weight(&store, &genesis)? - before,
        a.contribution() + b.contribution()
    );
    assert_eq!(weight(&store, &genesis)?, 52);
    Ok(())
}

#[test]
fn duplicate_put_does_not_add_weight() -> Result<()> {
    let (_dir, store) = open_store()?;
    let genesis = record(1, &[], 1, 3);
    let child = record(2, &[genesis.hash()], 2, 4);
    store.put(&genesis)?;
    store.put(&child)?;
    assert_eq!(
        store.put(&child)?,
        PutOutcome::Duplicate { goff: Goff(1) }
    );
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(
        store.put(&genesis)?,
        PutOutcome::Duplicate { goff: Goff(0) }
    );
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(weight(&store, &genesis)?, 7);
    assert_eq!(store.status()?.record_count, 2);
    Ok(())
}

#[test]
fn lookups_and_history() -> Result<()> {
    let (_dir, store) = open_store()?;
    let first = record(9, &[], 100, 1);
    let second = record(9, &[first.hash()], 200, 1);
    store.put(&second)?;
    store.put(&first)?;

    let meta = store.get_by_hash(&first.hash())?.expect("first stored");
    assert_eq!(meta.goff, Goff(1));
    assert_eq!(meta.id, first.id());
    assert_eq!(store.get_record(&second.hash())?, Some(second.clone()));
    assert!(store.get_by_hash(&Hash([0xAB; 32]))?.is_none());

    let history: Vec<Hash> = store
        .get_history_by_id(&first.id())?
        .into_iter()
        .map(|m| m.hash)
        .collect();
    assert_eq!(history, vec![first.hash(), second.hash()]);
    assert_eq!(store.get_max_goff()?, Some(Goff(1)));
    Ok(())
}

#[test]
fn authoritative_prefers_weight_then_smaller_hash() -> Result<()> {
    let (_dir, store) = open_store()?;
    let left = record(5, &[], 10, 1);
    let right = record(5, &[], 20, 1);
    store.put(&left)?;
    store.put(&right)?;
    assert!(store.wait_idle(Duration::from_secs(10)));

    let tie = store.authoritative(&left.id())?.expect("revisions applied");
    assert_eq!(tie.record.hash, left.hash().min(right.hash()));

    let lighter = if tie.record.hash == left.hash() {
        &right
    } else {
        &left
    };
    store.put(&record(6, &[lighter.hash()], 30, 50))?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    let winner = store.authoritative(&left.id())?.expect("revisions applied");
    assert_eq!(winner.record.hash, lighter.hash());
    assert_eq!(winner.weight, 51);
    Ok(())
}

#[test]
fn status_and_state_hash_track_ingestion() -> Result<()> {
    let (_dir, store) = open_store()?;
    let empty = store.hash_state()?;
    assert_eq!(empty.record_count, 0);

    let genesis = record(1, &[], 1, 2);
    let child = record(2, &[genesis.hash()], 2, 3);
    store.put(&genesis)?;
    store.put(&child)?;
    assert!(store.wait_idle(Duration::from_secs(10)));

    let status = store.status()?;
    assert_eq!(status.max_goff, Some(1));
    assert_eq!(status.record_count, 2);
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.wanted_count, 0);
    assert!(status.total_size > 0);
    assert_eq!(status.health.status, HealthStatus::Healthy);
    let json = serde_json::to_string(&status).expect("status serializes");
    assert!(json.contains("record_count"));

    let state = store.hash_state()?;
    assert_eq!(state.record_count, 2);
    assert_eq!(state.weight_sum, 5 + 3);
    assert_ne!(state.digest, empty.digest);
    assert_eq!(state, store.hash_state()?);
    Ok(())
}

#[test]
fn metrics_observe_admission_and_application() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let metrics = Arc::new(CounterMetrics::default());
    let store = Store::open(StoreOptions::new(dir.path()).metrics(metrics.clone()))?;
    let genesis = record(1, &[], 1, 1);
    store.put(&genesis)?;
    store.put(&record(2, &[genesis.hash()], 2, 1))?;
    store.put(&genesis)?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(metrics.admitted.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.duplicates.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.applied.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.slots_touched.load(Ordering::Relaxed), 3);
    Ok(())
}
