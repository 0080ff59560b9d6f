#![allow(missing_docs)]

use tempfile::tempdir;
use vesper::storage::{Durability, Env, EnvOptions};
use vesper::types::Result;

fn options() -> EnvOptions {
    EnvOptions::default()
        .page_size(512)
        .durability(Durability::Full)
}

#[test]
fn live_allocations_match_distinct_dirty_pages() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    // Five commits, each creating a fresh one-leaf tree: one distinct page
    // per commit, nothing freed, nothing superseded.
    for n in 0..5u32 {
        let mut tx = env.begin_write()?;
        let tree = tx.create_tree(&format!("tree-{n}"))?;
        tx.put(&tree, b"k", b"v")?;
        tx.commit()?;
    }
    let stats = env.stats();
    assert_eq!(stats.scratch.live_allocations, 5);
    assert_eq!(stats.scratch.pending_free, 0);
    Ok(())
}

#[test]
fn superseded_pages_leave_the_live_count_without_readers() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("kv")?;
    tx.put(&tree, b"key", b"v0")?;
    tx.commit()?;
    assert_eq!(env.stats().scratch.live_allocations, 1);

    // Each overwrite rewrites the leaf and the free-list page. With no
    // readers the superseded versions are freed eagerly, so the live count
    // tracks only the newest committed images.
    for n in 0..10u32 {
        let mut tx = env.begin_write()?;
        let tree = tx.open_tree("kv")?;
        tx.put(&tree, b"key", format!("v{n}").as_bytes())?;
        tx.commit()?;
    }
    let stats = env.stats();
    assert!(
        stats.scratch.live_allocations <= 3,
        "only the newest leaf and free-list images may stay live, got {}",
        stats.scratch.live_allocations
    );
    assert!(stats.scratch.pending_free > 0);
    Ok(())
}

#[test]
fn flush_without_readers_drains_the_pool() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    for n in 0..8u32 {
        let mut tx = env.begin_write()?;
        let tree = tx.create_tree("kv")?;
        tx.put(&tree, &n.to_be_bytes(), &[n as u8; 32])?;
        tx.commit()?;
    }
    assert!(env.stats().scratch.live_allocations > 0);

    assert!(env.flush()?);
    let stats = env.stats();
    assert_eq!(stats.scratch.live_allocations, 0);
    assert_eq!(stats.scratch.pending_free, 0, "no readers pin any generation");
    Ok(())
}

#[test]
fn active_reader_defers_reclamation() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("kv")?;
    tx.put(&tree, b"a", b"1")?;
    tx.commit()?;

    let reader = env.begin_read()?;
    let reader_tree = reader.open_tree("kv")?;

    let mut tx = env.begin_write()?;
    let tree = tx.open_tree("kv")?;
    tx.put(&tree, b"a", b"2")?;
    tx.commit()?;

    // The checkpoint stops at the reader's snapshot; the newer version must
    // stay in scratch and the reader's view must stay intact.
    env.flush()?;
    let stats = env.stats();
    assert!(stats.scratch.live_allocations > 0);
    assert_eq!(reader.get(&reader_tree, b"a")?, Some(b"1".to_vec()));

    drop(reader);
    env.flush()?;
    let stats = env.stats();
    assert_eq!(stats.scratch.live_allocations, 0);
    assert_eq!(stats.scratch.pending_free, 0);
    Ok(())
}

#[test]
fn rollback_leaves_no_scratch_behind() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    {
        let mut tx = env.begin_write()?;
        let tree = tx.create_tree("kv")?;
        for n in 0..50u32 {
            tx.put(&tree, &n.to_be_bytes(), &[0xAB; 40])?;
        }
        // Dropped without commit.
    }
    let stats = env.stats();
    assert_eq!(stats.scratch.live_allocations, 0);
    assert_eq!(stats.last_committed.0, 0);

    // The writer slot is free again and sees none of the rolled-back data.
    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("kv")?;
    assert_eq!(tx.get(&tree, &0u32.to_be_bytes())?, None);
    tx.put(&tree, b"fresh", b"value")?;
    tx.commit()?;
    Ok(())
}
