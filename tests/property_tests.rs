#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use dagstore::{Hash, Owner, Record, RecordSpec, Selector, Store, StoreOptions};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Node `i` links to the earlier nodes listed in `links[i]`.
#[derive(Debug, Clone)]
struct DagShape {
    links: Vec<BTreeSet<usize>>,
    work: Vec<u64>,
}

fn arb_dag() -> impl Strategy<Value = DagShape> {
    (1usize..20).prop_flat_map(|n| {
        let links = (0..n)
            .map(|i| {
                if i == 0 {
                    Just(BTreeSet::new()).boxed()
                } else {
                    prop::collection::btree_set(0..i, 0..=3.min(i)).boxed()
                }
            })
            .collect::<Vec<_>>();
        (links, prop::collection::vec(0u64..1_000, n))
            .prop_map(|(links, work)| DagShape { links, work })
    })
}

fn build(shape: &DagShape) -> Vec<Record> {
    let mut records: Vec<Record> = Vec::with_capacity(shape.links.len());
    for (i, links) in shape.links.iter().enumerate() {
        let hashes: Vec<Hash> = links.iter().map(|&j| records[j].hash()).collect();
        let tag = (i as u32).to_le_bytes();
        records.push(Record::new(RecordSpec {
            owner: Owner([2u8; 32]),
            selectors: &[Selector([i as u8; 32])],
            links: &hashes,
            value: &tag,
            timestamp: 100 + i as u64,
            work: shape.work[i],
        }));
    }
    records
}

/// Weight of `i`: its own work plus the weight of every node linking to it.
fn expected(shape: &DagShape) -> Vec<u128> {
    let n = shape.links.len();
    let mut weights: Vec<u128> = shape.work.iter().map(|&w| w as u128).collect();
    for i in (0..n).rev() {
        for &j in &shape.links[i] {
            weights[j] += weights[i];
        }
    }
    weights
}

fn ingest(records: &[Record], order: &[usize]) -> BTreeMap<Hash, u128> {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    for &idx in order {
        store.put(&records[idx]).unwrap();
    }
    assert!(store.wait_idle(Duration::from_secs(30)));
    assert_eq!(store.pending_count().unwrap(), 0);
    records
        .iter()
        .map(|rec| (rec.hash(), store.weight_of(&rec.hash()).unwrap().unwrap()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_weights_independent_of_arrival_order(shape in arb_dag(), seed in any::<u64>()) {
        let records = build(&shape);
        let in_order: Vec<usize> = (0..records.len()).collect();
        let mut shuffled = in_order.clone();
        shuffled.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));

        let a = ingest(&records, &in_order);
        let b = ingest(&records, &shuffled);
        prop_assert_eq!(&a, &b);

        let want = expected(&shape);
        for (i, rec) in records.iter().enumerate() {
            prop_assert_eq!(a[&rec.hash()], want[i]);
        }
    }

    #[test]
    fn prop_weight_never_below_contribution(shape in arb_dag()) {
        let records = build(&shape);
        let order: Vec<usize> = (0..records.len()).rev().collect();
        let weights = ingest(&records, &order);
        for rec in &records {
            prop_assert!(weights[&rec.hash()] >= rec.contribution());
        }
    }
}
