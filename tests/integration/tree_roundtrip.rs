#![allow(missing_docs)]

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use vesper::storage::{Durability, Env, EnvOptions};
use vesper::types::Result;

fn options() -> EnvOptions {
    EnvOptions::default()
        .page_size(512)
        .durability(Durability::Full)
}

#[test]
fn committed_pairs_survive_a_full_restart_in_key_order() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut model = BTreeMap::new();
    for _ in 0..500 {
        let key: [u8; 8] = rng.gen();
        let value: Vec<u8> = (0..rng.gen_range(1..50)).map(|_| rng.gen()).collect();
        model.insert(key.to_vec(), value);
    }

    {
        let env = Env::open(dir.path(), options())?;
        let mut tx = env.begin_write()?;
        let tree = tx.create_tree("docs")?;
        for (key, value) in &model {
            tx.put(&tree, key, value)?;
        }
        tx.commit()?;
    }

    let env = Env::open(dir.path(), options())?;
    let read = env.begin_read()?;
    let tree = read.open_tree("docs")?;
    let stats = read.tree_stats(&tree)?;
    assert_eq!(stats.entry_count, model.len() as u64);
    let scanned: Vec<_> = read.iter(&tree)?.collect::<Result<Vec<_>>>()?;
    let expected: Vec<_> = model.into_iter().collect();
    assert_eq!(scanned, expected);
    Ok(())
}

#[test]
fn large_values_roundtrip_through_overflow_pages() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let big: Vec<u8> = (0..10_000).map(|_| rng.gen()).collect();

    {
        let env = Env::open(dir.path(), options())?;
        let mut tx = env.begin_write()?;
        let tree = tx.create_tree("blobs")?;
        tx.put(&tree, b"big", &big)?;
        tx.put(&tree, b"small", b"s")?;
        tx.commit()?;
        env.flush()?;
    }

    let env = Env::open(dir.path(), options())?;
    let read = env.begin_read()?;
    let tree = read.open_tree("blobs")?;
    assert_eq!(read.get(&tree, b"big")?, Some(big));
    assert_eq!(read.get(&tree, b"small")?, Some(b"s".to_vec()));
    Ok(())
}

#[test]
fn tree_catalog_survives_restart_without_a_checkpoint() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let env = Env::open(dir.path(), options())?;
        let mut tx = env.begin_write()?;
        tx.create_tree("alpha")?;
        tx.create_tree("beta")?;
        let gamma = tx.create_tree("gamma")?;
        tx.put(&gamma, b"k", b"v")?;
        tx.commit()?;

        let mut tx = env.begin_write()?;
        assert!(tx.delete_tree("beta")?);
        tx.commit()?;
    }

    let env = Env::open(dir.path(), options())?;
    let read = env.begin_read()?;
    assert_eq!(read.tree_names(), vec!["alpha", "gamma"]);
    assert!(read.open_tree("beta").is_err());
    let gamma = read.open_tree("gamma")?;
    assert_eq!(read.get(&gamma, b"k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn freed_pages_are_reused_after_restart() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let env = Env::open(dir.path(), options())?;
        // Churn produces free pages via copy-on-write.
        for round in 0..10u32 {
            let mut tx = env.begin_write()?;
            let tree = tx.create_tree("churn")?;
            for i in 0..20u32 {
                tx.put(&tree, &i.to_be_bytes(), &round.to_be_bytes())?;
            }
            tx.commit()?;
        }
        env.flush()?;
    }

    let env = Env::open(dir.path(), options())?;
    // Writing the same amount again should draw from the free list instead
    // of growing the file: the data file stops getting longer.
    let len_before = std::fs::metadata(dir.path().join("data.vesper"))
        .expect("data file")
        .len();
    for round in 0..10u32 {
        let mut tx = env.begin_write()?;
        let tree = tx.open_tree("churn")?;
        for i in 0..20u32 {
            tx.put(&tree, &i.to_be_bytes(), &round.to_be_bytes())?;
        }
        tx.commit()?;
    }
    env.flush()?;
    let len_after = std::fs::metadata(dir.path().join("data.vesper"))
        .expect("data file")
        .len();
    assert!(
        len_after <= len_before.saturating_mul(2),
        "rewrites should reuse freed pages rather than growing the file \
         ({len_before} -> {len_after})"
    );
    Ok(())
}

#[test]
fn deleting_and_recreating_a_tree_starts_empty() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let env = Env::open(dir.path(), options())?;

    let mut tx = env.begin_write()?;
    let tree = tx.create_tree("t")?;
    tx.put(&tree, b"k", b"v")?;
    tx.commit()?;

    let mut tx = env.begin_write()?;
    assert!(tx.delete_tree("t")?);
    let tree = tx.create_tree("t")?;
    assert_eq!(tx.get(&tree, b"k")?, None);
    tx.commit()?;

    let read = env.begin_read()?;
    let tree = read.open_tree("t")?;
    assert_eq!(read.get(&tree, b"k")?, None);
    assert_eq!(read.tree_stats(&tree)?.entry_count, 0);
    Ok(())
}
