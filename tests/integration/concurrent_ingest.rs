#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dagstore::{Goff, Hash, Owner, Record, RecordSpec, Result, Selector, Store, StoreOptions};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const THREADS: usize = 6;
const RECORDS: usize = 120;

/// Random DAG where record `i` links to up to three earlier records.
fn random_dag(seed: u64) -> Vec<Record> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut records: Vec<Record> = Vec::with_capacity(RECORDS);
    for i in 0..RECORDS {
        let mut links = BTreeSet::new();
        if i > 0 {
            for _ in 0..rng.gen_range(1..=3) {
                links.insert(records[rng.gen_range(0..i)].hash());
            }
        }
        let links: Vec<Hash> = links.into_iter().collect();
        let tag = (i as u32).to_le_bytes();
        records.push(Record::new(RecordSpec {
            owner: Owner([9u8; 32]),
            selectors: &[Selector([(i % 251) as u8; 32])],
            links: &links,
            value: &tag,
            timestamp: 10_000 + i as u64,
            work: rng.gen_range(0..1_000),
        }));
    }
    records
}

fn weights(store: &Store, records: &[Record]) -> Result<BTreeMap<Hash, u128>> {
    let mut out = BTreeMap::new();
    for rec in records {
        out.insert(rec.hash(), store.weight_of(&rec.hash())?.expect("stored"));
    }
    Ok(out)
}

#[test]
fn parallel_writers_match_sequential_ingest() -> Result<()> {
    let records = random_dag(7);

    let sequential_dir = tempdir()?;
    let sequential = Store::open(StoreOptions::new(sequential_dir.path()))?;
    for rec in &records {
        sequential.put(rec)?;
    }
    assert!(sequential.wait_idle(Duration::from_secs(30)));
    let expected = weights(&sequential, &records)?;

    let dir = tempdir()?;
    let store = Arc::new(Store::open(
        StoreOptions::new(dir.path()).shard_count(7).growth_chunk_slots(16),
    )?);
    let records = Arc::new(records);
    let mut handles = Vec::new();
    for t in 0..THREADS {
        let store = Arc::clone(&store);
        let records = Arc::clone(&records);
        handles.push(thread::spawn(move || -> Result<Vec<Goff>> {
            // Stride backwards so children usually arrive before parents.
            let mut goffs = Vec::new();
            for idx in (0..RECORDS).rev().filter(|idx| idx % THREADS == t) {
                goffs.push(store.put(&records[idx])?.goff());
            }
            Ok(goffs)
        }));
    }
    let mut assigned = BTreeSet::new();
    for handle in handles {
        for goff in handle.join().expect("writer thread")? {
            assert!(assigned.insert(goff), "goff {goff} assigned twice");
        }
    }
    let dense: BTreeSet<Goff> = (0..RECORDS as u64).map(Goff).collect();
    assert_eq!(assigned, dense);

    assert!(store.wait_idle(Duration::from_secs(30)));
    assert_eq!(store.pending_count()?, 0);
    assert_eq!(store.pending_hole_count()?, 0);
    assert!(store.list_wanted()?.is_empty());
    assert_eq!(weights(&store, &records)?, expected);
    assert_eq!(
        store.hash_state()?.weight_sum,
        sequential.hash_state()?.weight_sum
    );
    Ok(())
}

#[test]
fn racing_duplicates_store_once() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(Store::open(StoreOptions::new(dir.path()))?);
    let record = Arc::new(Record::new(RecordSpec {
        owner: Owner([1u8; 32]),
        selectors: &[Selector([1u8; 32])],
        links: &[],
        value: b"once",
        timestamp: 1,
        work: 9,
    }));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let record = Arc::clone(&record);
            thread::spawn(move || store.put(&record))
        })
        .collect();
    let mut stored = 0;
    for handle in handles {
        let outcome = handle.join().expect("writer thread")?;
        assert_eq!(outcome.goff(), Goff(0));
        if !outcome.is_duplicate() {
            stored += 1;
        }
    }
    assert_eq!(stored, 1);
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(store.weight_of(&record.hash())?, Some(9));
    assert_eq!(store.status()?.record_count, 1);
    Ok(())
}
