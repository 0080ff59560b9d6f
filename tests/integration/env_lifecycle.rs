#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use vesper::storage::{Durability, Env, EnvOptions};
use vesper::types::{Result, TxId};

fn options() -> EnvOptions {
    EnvOptions::default()
        .page_size(512)
        .durability(Durability::Full)
}

#[test]
fn transaction_ids_increase_without_gaps() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;
    let mut last = TxId(0);
    for i in 0..20u32 {
        let mut tx = env.begin_write()?;
        let tree = tx.create_tree("seq")?;
        tx.put(&tree, &i.to_be_bytes(), b"v")?;
        let id = tx.commit()?;
        assert_eq!(id.0, last.0 + 1, "ids are dense and increasing");
        last = id;
    }

    // A rolled-back transaction consumes no id.
    {
        let mut tx = env.begin_write()?;
        let tree = tx.open_tree("seq")?;
        tx.put(&tree, b"rollback", b"x")?;
    }
    let mut tx = env.begin_write()?;
    let tree = tx.open_tree("seq")?;
    tx.put(&tree, b"after", b"y")?;
    assert_eq!(tx.commit()?, TxId(last.0 + 1));
    Ok(())
}

#[test]
fn empty_commit_is_a_no_op() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;
    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("t")?;
    tx.put(&tree, b"k", b"v")?;
    let first = tx.commit()?;

    let tx = env.begin_write()?;
    let id = tx.commit()?;
    assert_eq!(id, first, "nothing to write, nothing to assign");
    assert_eq!(env.stats().last_committed, first);
    Ok(())
}

#[test]
fn second_writer_blocks_until_the_first_finishes() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("t")?;
    tx.put(&tree, b"holder", b"1")?;

    let entered = Arc::new(AtomicBool::new(false));
    let entered_clone = Arc::clone(&entered);
    let env_clone = env.clone();
    let waiter = thread::spawn(move || -> Result<TxId> {
        let mut tx = env_clone.begin_write()?;
        entered_clone.store(true, Ordering::SeqCst);
        let tree = tx.open_tree("t")?;
        tx.put(&tree, b"waiter", b"2")?;
        tx.commit()
    });

    thread::sleep(Duration::from_millis(100));
    assert!(
        !entered.load(Ordering::SeqCst),
        "second writer must block while the slot is held"
    );
    let first = tx.commit()?;
    let second = waiter.join().expect("waiter thread")?;
    assert!(entered.load(Ordering::SeqCst));
    assert_eq!(second.0, first.0 + 1);

    let read = env.begin_read()?;
    let tree = read.open_tree("t")?;
    assert_eq!(read.get(&tree, b"holder")?, Some(b"1".to_vec()));
    assert_eq!(read.get(&tree, b"waiter")?, Some(b"2".to_vec()));
    Ok(())
}

#[test]
fn try_begin_write_reports_a_held_slot() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    let holder = env.begin_write()?;
    assert!(env.try_begin_write()?.is_none(), "slot is taken");
    drop(holder);
    let mut tx = env.try_begin_write()?.expect("slot is free");
    let tree = tx.create_tree("t")?;
    tx.put(&tree, b"k", b"v")?;
    tx.commit()?;
    Ok(())
}

#[test]
fn stats_track_readers_and_checkpoints() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("t")?;
    tx.put(&tree, b"k", b"v")?;
    tx.commit()?;

    assert_eq!(env.stats().active_readers, 0);
    let reader = env.begin_read()?;
    let stats = env.stats();
    assert_eq!(stats.active_readers, 1);
    assert_eq!(stats.oldest_reader_snapshot, Some(TxId(1)));
    drop(reader);

    assert!(env.flush()?);
    let stats = env.stats();
    assert_eq!(stats.last_checkpointed, TxId(1));
    assert!(!env.flush()?, "nothing further to checkpoint");
    Ok(())
}

#[test]
fn options_file_overrides_apply_at_open() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(
        dir.path().join("vesper.toml"),
        "durability = \"lazy\"\ncompress_journal = false\n",
    )
    .unwrap();

    let env = Env::open(dir.path(), options())?;
    assert_eq!(env.options().durability, Durability::Lazy);
    assert!(!env.options().compress_journal);

    // Lazy commits still publish and survive a clean shutdown.
    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("t")?;
    tx.put(&tree, b"k", b"v")?;
    tx.commit()?;
    drop(env);

    let env = Env::open(dir.path(), options())?;
    let read = env.begin_read()?;
    let tree = read.open_tree("t")?;
    assert_eq!(read.get(&tree, b"k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn background_flusher_checkpoints_on_its_own() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(
        dir.path(),
        options().flush_interval(Some(Duration::from_millis(25))),
    )?;

    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("t")?;
    tx.put(&tree, b"k", b"v")?;
    tx.commit()?;

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if env.stats().last_checkpointed == TxId(1) {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "background flusher never checkpointed"
        );
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}
