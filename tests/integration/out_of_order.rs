#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::time::Duration;

use dagstore::{Goff, Hash, Owner, Record, RecordSpec, Result, Selector, Store, StoreOptions};
use tempfile::tempdir;

fn record(tag: u8, links: &[Hash], work: u64) -> Record {
    Record::new(RecordSpec {
        owner: Owner([tag; 32]),
        selectors: &[Selector([tag; 32])],
        links,
        value: &[tag],
        timestamp: 1_000 + tag as u64,
        work,
    })
}

/// genesis <- a <- b <- d, genesis <- c <- d
fn sample_dag() -> Vec<Record> {
    let genesis = record(1, &[], 1);
    let a = record(2, &[genesis.hash()], 2);
    let b = record(3, &[a.hash()], 3);
    let c = record(4, &[genesis.hash()], 4);
    let d = record(5, &[b.hash(), c.hash()], 5);
    vec![genesis, a, b, c, d]
}

fn weights(store: &Store, records: &[Record]) -> Result<BTreeMap<Hash, u128>> {
    let mut out = BTreeMap::new();
    for rec in records {
        out.insert(rec.hash(), store.weight_of(&rec.hash())?.expect("stored"));
    }
    Ok(out)
}

fn ingest(order: &[usize], records: &[Record]) -> Result<BTreeMap<Hash, u128>> {
    let dir = tempdir()?;
    let store = Store::open(StoreOptions::new(dir.path()))?;
    for &idx in order {
        store.put(&records[idx])?;
    }
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(store.pending_count()?, 0);
    assert_eq!(store.pending_hole_count()?, 0);
    assert!(store.list_wanted()?.is_empty());
    weights(&store, records)
}

#[test]
fn child_before_parent_waits_then_applies() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(StoreOptions::new(dir.path()))?;
    let parent = record(1, &[], 10);
    let child = record(2, &[parent.hash()], 20);

    store.put(&child)?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert!(store.list_wanted()?.contains(&parent.hash()));
    assert_eq!(store.pending_count()?, 1);
    assert!(!store.is_applied(Goff(0)));
    assert_eq!(store.weight_of(&child.hash())?, Some(0));

    store.put(&parent)?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert!(store.list_wanted()?.is_empty());
    assert_eq!(store.pending_count()?, 0);
    assert_eq!(store.weight_of(&child.hash())?, Some(20));
    assert_eq!(store.weight_of(&parent.hash())?, Some(30));
    Ok(())
}

#[test]
fn arrival_order_does_not_change_weights() -> Result<()> {
    let records = sample_dag();
    let in_order = ingest(&[0, 1, 2, 3, 4], &records)?;
    let reversed = ingest(&[4, 3, 2, 1, 0], &records)?;
    let shuffled = ingest(&[2, 4, 0, 3, 1], &records)?;
    assert_eq!(in_order, reversed);
    assert_eq!(in_order, shuffled);

    let genesis = records[0].hash();
    assert_eq!(in_order[&genesis], 1 + 2 + 3 + 4 + 5);
    assert_eq!(in_order[&records[1].hash()], 2 + 3 + 5);
    Ok(())
}

#[test]
fn pending_link_in_same_batch_releases_waiter() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(StoreOptions::new(dir.path()).start_worker(false))?;
    let parent = record(1, &[], 3);
    let child = record(2, &[parent.hash()], 4);
    // child gets goff 0 and is evaluated before its parent at goff 1.
    store.put(&child)?;
    store.put(&parent)?;
    assert_eq!(store.pending_count()?, 2);

    store.start_worker()?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(store.pending_hole_count()?, 0);
    assert_eq!(store.weight_of(&parent.hash())?, Some(7));
    assert_eq!(store.weight_of(&child.hash())?, Some(4));
    Ok(())
}

#[test]
fn wanted_requests_are_counted() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(StoreOptions::new(dir.path()).start_worker(false))?;
    let missing = record(1, &[], 1);
    store.put(&record(2, &[missing.hash()], 1))?;
    assert!(store.mark_wanted_requested(&missing.hash())?);
    assert!(store.mark_wanted_requested(&missing.hash())?);
    assert!(!store.mark_wanted_requested(&Hash([0xEE; 32]))?);
    let requests = store
        .meta()
        .with_tracker(|tracker| tracker.wanted_requests(&missing.hash()))?;
    assert_eq!(requests.map(|(retries, _)| retries), Some(2));
    Ok(())
}

#[test]
fn partially_filled_gap_is_split() -> Result<()> {
    use dagstore::store::Hole;
    use dagstore::GoffRange;

    let dir = tempdir()?;
    let store = Store::open(StoreOptions::new(dir.path()).start_worker(false))?;
    store
        .meta()
        .record_hole(&Hole::gap(GoffRange::new(Goff(10), Goff(20))?))?;
    assert!(store
        .meta()
        .resolve_hole(GoffRange::new(Goff(14), Goff(16))?)?
        .is_empty());
    let ranges: Vec<GoffRange> = store.holes()?.into_iter().map(|h| h.range).collect();
    assert_eq!(
        ranges,
        vec![
            GoffRange::new(Goff(10), Goff(13))?,
            GoffRange::new(Goff(17), Goff(20))?,
        ]
    );
    assert_eq!(store.pending_hole_count()?, 2);
    Ok(())
}
