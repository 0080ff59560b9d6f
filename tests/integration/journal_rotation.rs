#![allow(missing_docs)]

use tempfile::tempdir;
use vesper::storage::{Durability, Env, EnvOptions};
use vesper::types::Result;

// Small pages and a tight journal budget force rotations quickly. With
// 512-byte pages a first commit serializes to roughly 640 bytes (one leaf)
// and later commits to roughly 1.2 KiB (copied leaf plus free-list page).
fn options(max_journal: u64) -> EnvOptions {
    EnvOptions::default()
        .page_size(512)
        .durability(Durability::Full)
        .compress_journal(false)
        .max_journal_file_size(max_journal)
}

fn commit_one(env: &Env, key: u32) -> Result<()> {
    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("kv")?;
    tx.put(&tree, &key.to_be_bytes(), &[key as u8; 16])?;
    tx.commit()?;
    Ok(())
}

#[test]
fn current_file_retires_exactly_at_the_threshold() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    // Budget below a single record: every commit fills its file.
    let env = Env::open(dir.path(), options(600))?;

    commit_one(&env, 0)?;
    let stats = env.stats();
    assert_eq!(
        stats.journal.current_seq, None,
        "crossing the threshold must clear the current file"
    );
    assert_eq!(stats.journal.rotations, 1);
    assert_eq!(stats.journal.file_count, 1);

    commit_one(&env, 1)?;
    let stats = env.stats();
    assert_eq!(stats.journal.current_seq, None);
    assert_eq!(stats.journal.file_count, 2);
    Ok(())
}

#[test]
fn file_count_matches_expected_rotations() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    // Roughly two records per file.
    let env = Env::open(dir.path(), options(2400))?;

    for key in 0..10u32 {
        commit_one(&env, key)?;
    }
    let stats = env.stats();
    assert!(
        (4..=6).contains(&stats.journal.file_count),
        "expected about five two-record files, got {}",
        stats.journal.file_count
    );
    assert!(stats.journal.rotations >= 4);
    assert_eq!(stats.journal.records_appended, 10);

    // A checkpoint retires everything already applied.
    env.flush()?;
    let stats = env.stats();
    assert!(stats.journal.file_count <= 1, "only the active file may remain");
    assert!(stats.journal.recycled >= 4);
    Ok(())
}

#[test]
fn rotated_files_replay_in_order_after_a_restart() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let env = Env::open(dir.path(), options(2400))?;
        for key in 0..10u32 {
            commit_one(&env, key)?;
        }
        // Dropping the environment checkpoints; reopen must still see all
        // ten keys regardless of which files were recycled.
    }
    let env = Env::open(dir.path(), options(2400))?;
    let read = env.begin_read()?;
    let tree = read.open_tree("kv")?;
    for key in 0..10u32 {
        assert_eq!(
            read.get(&tree, &key.to_be_bytes())?,
            Some(vec![key as u8; 16])
        );
    }
    Ok(())
}

#[test]
fn oversized_record_still_commits_alone() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    // The budget is smaller than any record; each gets its own file.
    let env = Env::open(dir.path(), options(600))?;
    for key in 0..3u32 {
        commit_one(&env, key)?;
    }
    let read = env.begin_read()?;
    let tree = read.open_tree("kv")?;
    for key in 0..3u32 {
        assert!(read.get(&tree, &key.to_be_bytes())?.is_some());
    }
    assert_eq!(env.stats().journal.file_count, 3);
    Ok(())
}
