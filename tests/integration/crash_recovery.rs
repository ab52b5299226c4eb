#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{abort, Command};
use std::time::Duration;

use dagstore::{Hash, Owner, Record, RecordSpec, Result, Selector, Store, StoreOptions};
use tempfile::tempdir;

const CRASH_DIR_ENV: &str = "DAGSTORE_CRASH_DIR";

/// Ten records; every record links to the previous one and, where possible,
/// the one before that.
fn braid() -> Vec<Record> {
    let mut records: Vec<Record> = Vec::new();
    for i in 0..10u8 {
        let links: Vec<Hash> = records
            .iter()
            .rev()
            .take(2)
            .map(|rec| rec.hash())
            .collect();
        records.push(Record::new(RecordSpec {
            owner: Owner([3u8; 32]),
            selectors: &[Selector([i; 32])],
            links: &links,
            value: &[i],
            timestamp: 500 + i as u64,
            work: 1 + i as u64,
        }));
    }
    records
}

fn weights(store: &Store) -> Result<BTreeMap<Hash, u128>> {
    let mut out = BTreeMap::new();
    for rec in braid() {
        out.insert(rec.hash(), store.weight_of(&rec.hash())?.expect("stored"));
    }
    Ok(out)
}

fn reference_weights() -> Result<BTreeMap<Hash, u128>> {
    let dir = tempdir()?;
    let store = Store::open(StoreOptions::new(dir.path()))?;
    for rec in braid() {
        store.put(&rec)?;
    }
    assert!(store.wait_idle(Duration::from_secs(10)));
    weights(&store)
}

fn run_child(dir: &Path, child_test: &str) -> Result<()> {
    let status = Command::new(std::env::current_exe()?)
        .env(CRASH_DIR_ENV, dir)
        .arg("--nocapture")
        .arg("--ignored")
        .arg("--exact")
        .arg(child_test)
        .status()?;
    assert!(!status.success(), "child should abort");
    Ok(())
}

fn crash_dir() -> PathBuf {
    PathBuf::from(std::env::var(CRASH_DIR_ENV).expect("missing DAGSTORE_CRASH_DIR"))
}

#[test]
fn abort_before_weight_application_replays_pending() -> Result<()> {
    let dir = tempdir()?;
    run_child(dir.path(), "crash_child_admit_then_abort")?;

    let store = Store::open(StoreOptions::new(dir.path()))?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(store.pending_count()?, 0);
    assert_eq!(weights(&store)?, reference_weights()?);
    Ok(())
}

#[test]
fn abort_after_weight_application_rebuilds_without_double_counting() -> Result<()> {
    let dir = tempdir()?;
    run_child(dir.path(), "crash_child_apply_then_abort")?;

    let store = Store::open(StoreOptions::new(dir.path()))?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(store.pending_count()?, 0);
    assert_eq!(weights(&store)?, reference_weights()?);
    Ok(())
}

#[test]
fn clean_restart_applies_leftover_pending() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = Store::open(StoreOptions::new(dir.path()).start_worker(false))?;
        for rec in braid() {
            store.put(&rec)?;
        }
        assert_eq!(store.pending_count()?, 10);
        store.close()?;
    }
    let store = Store::open(StoreOptions::new(dir.path()))?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(store.pending_count()?, 0);
    assert_eq!(weights(&store)?, reference_weights()?);
    Ok(())
}

#[test]
fn reopen_after_clean_close_keeps_weights() -> Result<()> {
    let dir = tempdir()?;
    let before = {
        let store = Store::open(StoreOptions::new(dir.path()))?;
        for rec in braid() {
            store.put(&rec)?;
        }
        assert!(store.wait_idle(Duration::from_secs(10)));
        let state = store.hash_state()?;
        store.close()?;
        state
    };
    let store = Store::open(StoreOptions::new(dir.path()))?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(store.hash_state()?, before);
    Ok(())
}

#[test]
fn lost_weight_file_is_rebuilt_from_metadata() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = Store::open(StoreOptions::new(dir.path()))?;
        for rec in braid() {
            store.put(&rec)?;
        }
        assert!(store.wait_idle(Duration::from_secs(10)));
        store.close()?;
    }
    fs::remove_file(StoreOptions::new(dir.path()).weights_path())?;

    let store = Store::open(StoreOptions::new(dir.path()))?;
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(weights(&store)?, reference_weights()?);
    Ok(())
}

#[test]
#[ignore]
fn crash_child_admit_then_abort() -> Result<()> {
    let store = Store::open(StoreOptions::new(crash_dir()).start_worker(false))?;
    for rec in braid() {
        store.put(&rec)?;
    }
    assert_eq!(store.pending_count()?, 10);
    abort();
}

#[test]
#[ignore]
fn crash_child_apply_then_abort() -> Result<()> {
    let store = Store::open(StoreOptions::new(crash_dir()))?;
    for rec in braid() {
        store.put(&rec)?;
    }
    assert!(store.wait_idle(Duration::from_secs(10)));
    assert_eq!(store.pending_count()?, 0);
    abort();
}
