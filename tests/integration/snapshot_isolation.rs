#![allow(missing_docs)]

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use vesper::storage::{Durability, Env, EnvOptions};
use vesper::types::Result;

fn options() -> EnvOptions {
    EnvOptions::default()
        .page_size(512)
        .durability(Durability::Full)
}

#[test]
fn reader_is_unaffected_by_later_commits() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("kv")?;
    for i in 0..50u32 {
        tx.put(&tree, &i.to_be_bytes(), b"v1")?;
    }
    tx.commit()?;

    let reader = env.begin_read()?;
    let reader_tree = reader.open_tree("kv")?;

    // A write commits while the reader is alive.
    let mut tx = env.begin_write()?;
    let tree = tx.open_tree("kv")?;
    for i in 0..50u32 {
        if i % 2 == 0 {
            tx.put(&tree, &i.to_be_bytes(), b"v2")?;
        } else {
            tx.delete(&tree, &i.to_be_bytes())?;
        }
    }
    tx.commit()?;

    // The reader's view is frozen at its snapshot.
    for i in 0..50u32 {
        assert_eq!(
            reader.get(&reader_tree, &i.to_be_bytes())?,
            Some(b"v1".to_vec()),
            "key {i} changed under the reader"
        );
    }
    let scanned: Vec<_> = reader
        .iter(&reader_tree)?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(scanned.len(), 50);

    // A fresh reader sees the new state.
    let fresh = env.begin_read()?;
    let fresh_tree = fresh.open_tree("kv")?;
    assert_eq!(fresh.get(&fresh_tree, &0u32.to_be_bytes())?, Some(b"v2".to_vec()));
    assert_eq!(fresh.get(&fresh_tree, &1u32.to_be_bytes())?, None);
    Ok(())
}

#[test]
fn snapshot_survives_flush_of_later_commits() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("kv")?;
    tx.put(&tree, b"key", b"old")?;
    tx.commit()?;

    let reader = env.begin_read()?;
    let reader_tree = reader.open_tree("kv")?;

    let mut tx = env.begin_write()?;
    let tree = tx.open_tree("kv")?;
    tx.put(&tree, b"key", b"new")?;
    tx.commit()?;

    // Checkpoint runs concurrently with the reader; it must stop short of
    // anything the reader could observe differently.
    env.flush()?;
    assert_eq!(reader.get(&reader_tree, b"key")?, Some(b"old".to_vec()));

    drop(reader);
    env.flush()?;
    let fresh = env.begin_read()?;
    let tree = fresh.open_tree("kv")?;
    assert_eq!(fresh.get(&tree, b"key")?, Some(b"new".to_vec()));
    Ok(())
}

#[test]
fn concurrent_readers_see_their_own_snapshots() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("counter")?;
    tx.put(&tree, b"n", &0u64.to_be_bytes())?;
    tx.commit()?;

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let reader_env = env.clone();
    let reader = thread::spawn(move || -> Result<u64> {
        let mut observed = 0u64;
        while stop_rx.try_recv().is_err() {
            let read = reader_env.begin_read()?;
            let tree = read.open_tree("counter")?;
            let first = u64::from_be_bytes(
                read.get(&tree, b"n")?.expect("counter present")[..8]
                    .try_into()
                    .unwrap(),
            );
            // Within one snapshot the value must be stable across reads.
            let second = u64::from_be_bytes(
                read.get(&tree, b"n")?.expect("counter present")[..8]
                    .try_into()
                    .unwrap(),
            );
            assert_eq!(first, second);
            observed = observed.max(first);
            thread::sleep(Duration::from_millis(1));
        }
        Ok(observed)
    });

    for value in 1..=50u64 {
        let mut tx = env.begin_write()?;
        let tree = tx.open_tree("counter")?;
        tx.put(&tree, b"n", &value.to_be_bytes())?;
        tx.commit()?;
        if value % 10 == 0 {
            env.flush()?;
        }
    }
    stop_tx.send(()).expect("stop reader");
    let observed = reader.join().expect("reader thread")?;
    assert!(observed <= 50);
    Ok(())
}
