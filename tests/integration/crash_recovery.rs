#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use tempfile::tempdir;
use vesper::storage::{Durability, Env, EnvOptions};
use vesper::types::{Result, TxId, VesperError};

fn options() -> EnvOptions {
    init_tracing();
    EnvOptions::default()
        .page_size(512)
        .durability(Durability::Full)
        .compress_journal(false)
}

// RUST_LOG=vesper=debug surfaces recovery decisions while debugging.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Snapshots the environment directory while it is still open, which is what
// the disk would hold if the process died at this instant.
fn crash_copy(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).expect("create crash copy dir");
    copy_tree(src, dst);
}

fn copy_tree(src: &Path, dst: &Path) {
    for entry in fs::read_dir(src).expect("read dir") {
        let entry = entry.expect("dir entry");
        let target = dst.join(entry.file_name());
        let path = entry.path();
        if path.is_dir() {
            fs::create_dir_all(&target).expect("create subdir");
            copy_tree(&path, &target);
        } else if entry.file_name() != "vesper.lock" {
            fs::copy(&path, &target).expect("copy file");
        }
    }
}

fn journal_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = fs::read_dir(dir.join("journal"))
        .expect("journal dir")
        .map(|e| e.expect("entry").path())
        .filter(|p| p.extension().is_some_and(|e| e == "journal"))
        .collect();
    files.sort();
    files
}

#[test]
fn unflushed_commits_recover_from_the_journal() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let crash = tempdir().expect("crash dir");

    let env = Env::open(dir.path(), options())?;
    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("docs")?;
    for i in 0..100u32 {
        tx.put(&tree, &i.to_be_bytes(), format!("value-{i}").as_bytes())?;
    }
    let committed = tx.commit()?;
    assert_eq!(committed, TxId(1));
    // No flush: the data lives only in the journal.
    assert_eq!(env.stats().last_checkpointed, TxId(0));
    crash_copy(dir.path(), crash.path());
    drop(env);

    let reopened = Env::open(crash.path(), options())?;
    let stats = reopened.stats();
    assert_eq!(stats.last_committed, TxId(1));
    assert_eq!(stats.last_checkpointed, TxId(1), "recovery checkpoints the tail");
    let read = reopened.begin_read()?;
    let tree = read.open_tree("docs")?;
    for i in 0..100u32 {
        assert_eq!(
            read.get(&tree, &i.to_be_bytes())?,
            Some(format!("value-{i}").into_bytes())
        );
    }
    Ok(())
}

#[test]
fn torn_tail_rolls_back_to_the_last_full_record() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let crash = tempdir().expect("crash dir");

    let env = Env::open(dir.path(), options())?;
    for tx_no in 0..3u32 {
        let mut tx = env.begin_write()?;
        let tree = tx.create_tree("docs")?;
        tx.put(&tree, &tx_no.to_be_bytes(), b"payload")?;
        tx.commit()?;
    }
    crash_copy(dir.path(), crash.path());
    drop(env);

    // Tear bytes off the journal tail, mid-record.
    let files = journal_files(crash.path());
    let last = files.last().expect("journal file");
    let len = fs::metadata(last).expect("metadata").len();
    let file = fs::OpenOptions::new()
        .write(true)
        .open(last)
        .expect("open journal");
    file.set_len(len - 100).expect("truncate");
    drop(file);

    let reopened = Env::open(crash.path(), options())?;
    let stats = reopened.stats();
    assert_eq!(stats.last_committed, TxId(2), "third record was torn away");
    let read = reopened.begin_read()?;
    let tree = read.open_tree("docs")?;
    assert_eq!(read.get(&tree, &0u32.to_be_bytes())?, Some(b"payload".to_vec()));
    assert_eq!(read.get(&tree, &1u32.to_be_bytes())?, Some(b"payload".to_vec()));
    assert_eq!(read.get(&tree, &2u32.to_be_bytes())?, None);
    Ok(())
}

#[test]
fn corrupted_record_is_treated_as_a_torn_tail() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let crash = tempdir().expect("crash dir");

    let env = Env::open(dir.path(), options())?;
    for tx_no in 0..2u32 {
        let mut tx = env.begin_write()?;
        let tree = tx.create_tree("docs")?;
        tx.put(&tree, &tx_no.to_be_bytes(), vec![tx_no as u8; 300].as_slice())?;
        tx.commit()?;
    }
    crash_copy(dir.path(), crash.path());
    drop(env);

    // Flip one byte inside the second record's payload; the content hash
    // must reject it exactly like a missing tail.
    let files = journal_files(crash.path());
    let last = files.last().expect("journal file");
    let bytes = fs::read(last).expect("read journal");
    let mut tampered = bytes.clone();
    let idx = tampered.len() - 64;
    tampered[idx] ^= 0xFF;
    fs::write(last, &tampered).expect("write tampered journal");

    let reopened = Env::open(crash.path(), options())?;
    assert_eq!(reopened.stats().last_committed, TxId(1));
    let read = reopened.begin_read()?;
    let tree = read.open_tree("docs")?;
    assert_eq!(
        read.get(&tree, &0u32.to_be_bytes())?,
        Some(vec![0u8; 300]),
        "first record survives"
    );
    assert_eq!(read.get(&tree, &1u32.to_be_bytes())?, None);
    Ok(())
}

#[test]
fn recovery_is_idempotent() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let crash = tempdir().expect("crash dir");

    let env = Env::open(dir.path(), options())?;
    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("docs")?;
    tx.put(&tree, b"stable", b"bytes")?;
    tx.commit()?;
    crash_copy(dir.path(), crash.path());
    drop(env);

    for _ in 0..2 {
        let env = Env::open(crash.path(), options())?;
        let read = env.begin_read()?;
        let tree = read.open_tree("docs")?;
        assert_eq!(read.get(&tree, b"stable")?, Some(b"bytes".to_vec()));
        drop(read);
        drop(env);
    }
    Ok(())
}

#[test]
fn checkpointed_page_corruption_is_detected() -> Result<()> {
    let dir = tempdir().expect("tmpdir");

    {
        let env = Env::open(dir.path(), options())?;
        let mut tx = env.begin_write()?;
        let tree = tx.create_tree("docs")?;
        tx.put(&tree, b"key", b"value")?;
        tx.commit()?;
        env.flush()?;
    }

    // Flip a payload byte of page 1 (the tree leaf) in the data file.
    let data = dir.path().join("data.vesper");
    let mut bytes = fs::read(&data).expect("read data file");
    bytes[512 + 100] ^= 0xFF;
    fs::write(&data, &bytes).expect("write data file");

    let env = Env::open(dir.path(), options())?;
    let read = env.begin_read()?;
    let tree = read.open_tree("docs")?;
    let err = read.get(&tree, b"key").unwrap_err();
    assert!(matches!(err, VesperError::Corruption(_)));
    Ok(())
}
