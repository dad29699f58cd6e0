//! Scenario tests for the persistent B+ tree

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use super::*;
use crate::config::BTreeOptions;
use crate::file::CacheMetrics;

/// Small pages give a fan-out of 30 for i32 keys, so trees get deep quickly
const SMALL_PAGE: usize = 256;

fn small_options() -> BTreeOptions {
    BTreeOptions::default().page_size(SMALL_PAGE).cache_size(16)
}

fn setup_tree<K: FixedKey>(options: BTreeOptions) -> (TempDir, PathBuf, BTree<K>) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.btree");
    let mut tree = BTree::new(&path, options).unwrap();
    assert!(tree.open().unwrap());
    (temp_dir, path, tree)
}

fn reopen<K: FixedKey>(path: &Path, options: BTreeOptions) -> BTree<K> {
    let mut tree = BTree::new(path, options).unwrap();
    assert!(tree.open().unwrap());
    tree
}

fn all_pairs<K: FixedKey>(tree: &mut BTree<K>) -> Vec<KeyPair<K>> {
    let mut out = Vec::new();
    tree.get_all_keys(&mut out).unwrap();
    out
}

fn offsets_for(tree: &mut BTree<i32>, low: i32, high: i32) -> Vec<i32> {
    let mut out = Vec::new();
    tree.search_offsets(&low, &high, &mut out).unwrap();
    out
}

#[test]
fn test_new_tree_is_empty() {
    let (_temp_dir, path, mut tree) = setup_tree::<i32>(small_options());

    assert!(tree.is_open());
    assert_eq!(tree.count().unwrap(), 0);
    assert_eq!(tree.height().unwrap(), 0);
    assert_eq!(tree.page_count().unwrap(), 1);
    assert!(all_pairs(&mut tree).is_empty());
    assert_eq!(tree.get_minimum().unwrap(), None);
    assert_eq!(tree.get_maximum().unwrap(), None);

    // Header is written immediately
    assert_eq!(fs::metadata(&path).unwrap().len(), SMALL_PAGE as u64);
}

#[test]
fn test_invalid_page_size() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.btree");

    let too_small = BTreeOptions::default().page_size(128);
    assert!(matches!(
        BTree::<i32>::new(&path, too_small),
        Err(BTreeError::InvalidPageSize { page_size: 128, key_size: 4 })
    ));

    // 256-byte pages cannot hold four 64-byte keys per leaf
    type Wide = CompoundKey<u64, u64>;
    type Wider = CompoundKey<Wide, Wide>;
    type Widest = CompoundKey<Wider, Wider>;
    assert_eq!(Widest::SIZE, 64);
    assert!(BTree::<Widest>::new(&path, small_options()).is_err());
    assert!(BTree::<Wider>::new(&path, small_options()).is_ok());
}

#[test]
fn test_operations_require_open_tree() {
    let temp_dir = TempDir::new().unwrap();
    let mut tree = BTree::<i32>::new(temp_dir.path().join("test.btree"), small_options()).unwrap();

    assert!(!tree.is_open());
    assert!(matches!(tree.insert_key(1, 1), Err(BTreeError::NotOpen)));
    assert!(matches!(tree.delete_key(&1, 1), Err(BTreeError::NotOpen)));
    assert!(matches!(tree.count(), Err(BTreeError::NotOpen)));
    assert!(matches!(tree.keys(), Err(BTreeError::NotOpen)));
    assert!(matches!(tree.clear(), Err(BTreeError::NotOpen)));
    assert!(matches!(tree.close(), Err(BTreeError::NotOpen)));

    assert!(tree.open().unwrap());
    assert!(matches!(tree.open(), Err(BTreeError::AlreadyOpen)));
}

#[test]
fn test_sequential_inserts_enumerate_in_order() {
    let (_temp_dir, _path, mut tree) = setup_tree::<i32>(small_options());

    for i in 0..5000 {
        tree.insert_key(i, i).unwrap();
    }

    assert_eq!(tree.count().unwrap(), 5000);
    assert!(tree.height().unwrap() >= 3);

    let pairs = all_pairs(&mut tree);
    assert_eq!(pairs.len(), 5000);
    for (i, pair) in pairs.iter().enumerate() {
        assert_eq!(pair, &KeyPair::new(i as i32, i as i32));
    }

    assert_eq!(tree.get_minimum().unwrap(), Some(KeyPair::new(0, 0)));
    assert_eq!(tree.get_maximum().unwrap(), Some(KeyPair::new(4999, 4999)));
}

#[test]
fn test_reverse_inserts_enumerate_in_order() {
    let (_temp_dir, _path, mut tree) = setup_tree::<i64>(small_options());

    for i in (0..3000i64).rev() {
        tree.insert_key(i * 3, i as i32).unwrap();
    }

    let keys: Vec<i64> = tree.keys().unwrap().map(|p| p.unwrap().key).collect();
    assert_eq!(keys, (0..3000i64).map(|i| i * 3).collect::<Vec<_>>());
}

#[test]
fn test_duplicate_keys_then_clear() {
    let (_temp_dir, path, mut tree) = setup_tree::<i32>(BTreeOptions::default());

    tree.insert_key(1, 1).unwrap();
    for offset in 0..10_000 {
        tree.insert_key(2, offset).unwrap();
    }
    tree.insert_key(3, 3).unwrap();
    assert_eq!(tree.count().unwrap(), 10_002);

    let mut offsets = offsets_for(&mut tree, 2, 2);
    assert_eq!(offsets.len(), 10_000);
    offsets.sort_unstable();
    assert_eq!(offsets, (0..10_000).collect::<Vec<_>>());

    assert_eq!(offsets_for(&mut tree, 1, 1), vec![1]);
    assert_eq!(offsets_for(&mut tree, 3, 3), vec![3]);

    tree.clear().unwrap();
    assert_eq!(tree.count().unwrap(), 0);
    assert!(offsets_for(&mut tree, 2, 2).is_empty());
    assert_eq!(fs::metadata(&path).unwrap().len(), 8192);

    // Still usable after clear
    tree.insert_key(2, 7).unwrap();
    assert_eq!(offsets_for(&mut tree, 2, 2), vec![7]);
}

#[test]
fn test_delete_exact_pair_among_duplicates() {
    let (_temp_dir, _path, mut tree) = setup_tree::<i32>(small_options());

    // Enough duplicates to span several leaves
    for offset in 0..200 {
        tree.insert_key(5, offset).unwrap();
    }
    tree.insert_key(4, 0).unwrap();
    tree.insert_key(6, 0).unwrap();

    assert!(tree.delete_key(&5, 150).unwrap());
    assert!(!tree.delete_key(&5, 150).unwrap());
    assert!(!tree.delete_key(&5, 1000).unwrap());
    assert!(!tree.delete_key(&7, 0).unwrap());
    assert_eq!(tree.count().unwrap(), 201);

    let offsets = offsets_for(&mut tree, 5, 5);
    assert_eq!(offsets.len(), 199);
    assert!(!offsets.contains(&150));
    assert!(offsets.contains(&149));
    assert!(offsets.contains(&151));
}

#[test]
fn test_range_queries() {
    let (_temp_dir, _path, mut tree) = setup_tree::<i32>(small_options());

    for i in 0..100 {
        tree.insert_key(i * 10, i).unwrap();
    }

    assert_eq!(offsets_for(&mut tree, 25, 55), vec![3, 4, 5]);
    assert_eq!(offsets_for(&mut tree, 30, 30), vec![3]);
    assert_eq!(offsets_for(&mut tree, -100, 5), vec![0]);
    assert_eq!(offsets_for(&mut tree, 985, 5000), vec![99]);

    // Empty, out-of-domain and reversed ranges
    assert!(offsets_for(&mut tree, 31, 39).is_empty());
    assert!(offsets_for(&mut tree, 2000, 3000).is_empty());
    assert!(offsets_for(&mut tree, 50, 20).is_empty());

    let mut pairs = Vec::new();
    tree.search_for_range(&100, &120, &mut pairs).unwrap();
    assert_eq!(
        pairs,
        vec![KeyPair::new(100, 10), KeyPair::new(110, 11), KeyPair::new(120, 12)]
    );
}

#[test]
fn test_range_iterator_is_restartable() {
    let (_temp_dir, _path, mut tree) = setup_tree::<i32>(small_options());

    for i in 0..500 {
        tree.insert_key(i % 50, i).unwrap();
    }

    let first: Vec<_> = tree.range(&10, &12).unwrap().map(|p| p.unwrap()).collect();
    let second: Vec<_> = tree.range(&10, &12).unwrap().map(|p| p.unwrap()).collect();
    assert_eq!(first.len(), 30);
    assert_eq!(first, second);
    assert!(first.windows(2).all(|w| w[0] <= w[1]));

    // Stopping early leaves the tree usable
    let partial: Vec<_> = tree.keys().unwrap().take(3).collect();
    assert_eq!(partial.len(), 3);
    tree.insert_key(11, 9999).unwrap();
    assert_eq!(tree.range(&11, &11).unwrap().count(), 11);
}

#[test]
fn test_close_reopen_round_trip() {
    let (_temp_dir, path, mut tree) = setup_tree::<i32>(small_options());

    for i in 0..3000 {
        tree.insert_key((i * 7919) % 1000, i).unwrap();
    }
    for i in (0..3000).step_by(3) {
        assert!(tree.delete_key(&((i * 7919) % 1000), i).unwrap());
    }

    let count = tree.count().unwrap();
    let pairs = all_pairs(&mut tree);
    let range = offsets_for(&mut tree, 100, 200);
    let height = tree.height().unwrap();
    tree.close().unwrap();
    assert!(!tree.is_open());

    let mut tree = reopen::<i32>(&path, small_options());
    assert_eq!(tree.count().unwrap(), count);
    assert_eq!(tree.height().unwrap(), height);
    assert_eq!(all_pairs(&mut tree), pairs);
    assert_eq!(offsets_for(&mut tree, 100, 200), range);
}

#[test]
fn test_tiny_cache_across_reopen_cycles() {
    const TOTAL: i32 = 50_000;
    const BATCH: i32 = 15_000;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.btree");
    let options = BTreeOptions::default().page_size(4096);

    let mut tree = BTree::<i32>::new(&path, options).unwrap();
    tree.set_cache_size(2).unwrap();
    assert!(tree.open().unwrap());
    for i in 0..TOTAL {
        tree.insert_key(i, i).unwrap();
    }
    tree.close().unwrap();

    for cycle in 0..2 {
        assert!(tree.open().unwrap());
        assert_eq!(tree.cache_size(), 2);
        let start = cycle * BATCH;
        for i in start..start + BATCH {
            assert!(tree.delete_key(&i, i).unwrap());
        }
        tree.close().unwrap();
    }

    assert!(tree.open().unwrap());
    assert_eq!(tree.count().unwrap(), (TOTAL - 2 * BATCH) as usize);
    for i in (0..TOTAL).step_by(97) {
        let hits = offsets_for(&mut tree, i, i);
        if i < 2 * BATCH {
            assert!(hits.is_empty(), "key {i} should be deleted");
        } else {
            assert_eq!(hits, vec![i], "key {i} should be found exactly once");
        }
    }

    // Third batch on the same open instance
    for i in 2 * BATCH..3 * BATCH {
        assert!(tree.delete_key(&i, i).unwrap());
    }
    tree.close().unwrap();

    let mut tree = reopen::<i32>(&path, options);
    let pairs = all_pairs(&mut tree);
    assert_eq!(pairs.len(), (TOTAL - 3 * BATCH) as usize);
    for (pair, i) in pairs.iter().zip(3 * BATCH..TOTAL) {
        assert_eq!(pair, &KeyPair::new(i, i));
    }
}

/// Expand a multiset of pairs into the sequence the tree should yield
fn expand_model<K: FixedKey>(model: &BTreeMap<(K, i32), usize>) -> Vec<KeyPair<K>> {
    model
        .iter()
        .flat_map(|((key, offset), &copies)| {
            std::iter::repeat_n(KeyPair::new(key.clone(), *offset), copies)
        })
        .collect()
}

/// Apply one random insert or delete to both the tree and the multiset model
fn random_step(
    tree: &mut BTree<i64>,
    model: &mut BTreeMap<(i64, i32), usize>,
    rng: &mut StdRng,
    keys: i64,
    offsets: i32,
) {
    let key = rng.random_range(0..keys);
    let offset = rng.random_range(0..offsets);

    if rng.random_bool(0.6) {
        tree.insert_key(key, offset).unwrap();
        *model.entry((key, offset)).or_insert(0) += 1;
    } else {
        let present = match model.get_mut(&(key, offset)) {
            Some(copies) => {
                *copies -= 1;
                if *copies == 0 {
                    model.remove(&(key, offset));
                }
                true
            }
            None => false,
        };
        assert_eq!(
            tree.delete_key(&key, offset).unwrap(),
            present,
            "delete ({key}, {offset})"
        );
    }
}

fn model_len(model: &BTreeMap<(i64, i32), usize>) -> usize {
    model.values().sum()
}

#[test]
fn test_random_workload_matches_model() {
    let (_temp_dir, path, mut tree) =
        setup_tree::<i64>(BTreeOptions::default().page_size(SMALL_PAGE).cache_size(4));
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model: BTreeMap<(i64, i32), usize> = BTreeMap::new();

    for step in 0..20_000 {
        random_step(&mut tree, &mut model, &mut rng, 500, 40);

        if step % 2500 == 0 {
            assert_eq!(tree.count().unwrap(), model_len(&model));
        }
    }

    let expected = expand_model(&model);
    assert_eq!(all_pairs(&mut tree), expected);

    let mut ranged = Vec::new();
    tree.search_for_range(&100, &199, &mut ranged).unwrap();
    let expected_range: Vec<_> = expected
        .iter()
        .filter(|p| (100..=199).contains(&p.key))
        .cloned()
        .collect();
    assert_eq!(ranged, expected_range);

    tree.close().unwrap();
    let mut tree = reopen::<i64>(&path, BTreeOptions::default().page_size(SMALL_PAGE));
    assert_eq!(all_pairs(&mut tree), expected);
}

#[test]
fn test_repeated_identical_pairs_across_leaves() {
    let options = BTreeOptions::default().page_size(SMALL_PAGE).cache_size(2);
    let (_temp_dir, path, mut tree) = setup_tree::<i64>(options);
    let mut rng = StdRng::seed_from_u64(0);
    let mut model: BTreeMap<(i64, i32), usize> = BTreeMap::new();

    // Few distinct pairs, so copies of one pair span several leaves
    for step in 1..=30_000 {
        random_step(&mut tree, &mut model, &mut rng, 60, 8);

        if step % 5000 == 0 {
            assert_eq!(tree.count().unwrap(), model_len(&model), "step {step}");
            tree.close().unwrap();
            tree = reopen::<i64>(&path, options);
        }
    }

    assert_eq!(all_pairs(&mut tree), expand_model(&model));

    // Every stored copy must be removable, and nothing beyond them
    let drained: Vec<(i64, i32, usize)> = model.iter().map(|(&(k, o), &n)| (k, o, n)).collect();
    for (key, offset, copies) in drained {
        for _ in 0..copies {
            assert!(tree.delete_key(&key, offset).unwrap(), "delete ({key}, {offset})");
        }
        assert!(!tree.delete_key(&key, offset).unwrap());
    }
    assert_eq!(tree.count().unwrap(), 0);
    assert_eq!(tree.height().unwrap(), 0);
}

#[test]
fn test_delete_reaches_copies_right_of_separator() {
    let (_temp_dir, _path, mut tree) = setup_tree::<i32>(small_options());
    let per_leaf = leaf_capacity::<i32>(SMALL_PAGE);

    // Fill well past one leaf with a single pair, then free the leftmost copies
    let copies = (per_leaf * 4) as i32;
    for _ in 0..copies {
        tree.insert_key(7, 7).unwrap();
    }
    assert!(tree.height().unwrap() > 1);

    for remaining in (0..copies).rev() {
        assert!(tree.delete_key(&7, 7).unwrap());
        assert_eq!(tree.count().unwrap(), remaining as usize);
    }
    assert!(!tree.delete_key(&7, 7).unwrap());
    assert!(all_pairs(&mut tree).is_empty());
}

#[test]
fn test_delete_everything_collapses_tree() {
    let (_temp_dir, _path, mut tree) = setup_tree::<i32>(small_options());

    for i in 0..2000 {
        tree.insert_key(i, -i).unwrap();
    }
    for i in 0..2000 {
        assert!(tree.delete_key(&i, -i).unwrap());
        if i % 250 == 0 {
            assert_eq!(tree.get_minimum().unwrap(), Some(KeyPair::new(i + 1, -(i + 1))));
        }
    }

    assert_eq!(tree.count().unwrap(), 0);
    assert_eq!(tree.height().unwrap(), 0);
    assert!(all_pairs(&mut tree).is_empty());
}

#[test]
fn test_freed_pages_are_reused() {
    let (_temp_dir, path, mut tree) = setup_tree::<i32>(small_options());

    for i in 0..3000 {
        tree.insert_key(i, i).unwrap();
    }
    let high_water = tree.page_count().unwrap();

    for i in 0..3000 {
        tree.delete_key(&i, i).unwrap();
    }
    for i in 0..3000 {
        tree.insert_key(i, i).unwrap();
    }
    assert_eq!(tree.page_count().unwrap(), high_water);

    tree.close().unwrap();
    assert_eq!(
        fs::metadata(&path).unwrap().len(),
        (high_water * SMALL_PAGE) as u64
    );
}

#[test]
fn test_compound_keys() {
    let (_temp_dir, _path, mut tree) = setup_tree::<CompoundKey<i32, i64>>(small_options());

    for doc in 0..20 {
        for term in 0..30i64 {
            tree.insert_key(CompoundKey::new(doc, term), (doc * 100) + term as i32)
                .unwrap();
        }
    }

    let mut pairs = Vec::new();
    tree.search_for_range(
        &CompoundKey::new(7, 0),
        &CompoundKey::new(7, i64::MAX),
        &mut pairs,
    )
    .unwrap();
    assert_eq!(pairs.len(), 30);
    assert!(pairs.iter().all(|p| p.key.first == 7));
    assert_eq!(pairs[0].offset, 700);

    assert_eq!(
        tree.get_maximum().unwrap(),
        Some(KeyPair::new(CompoundKey::new(19, 29), 1929))
    );
}

#[test]
fn test_set_cache_size_while_open() {
    let temp_dir = TempDir::new().unwrap();
    let metrics = CacheMetrics::new();
    let mut tree = BTree::<i32>::with_metrics(
        temp_dir.path().join("test.btree"),
        small_options(),
        Arc::clone(&metrics),
    )
    .unwrap();
    assert!(tree.open().unwrap());

    for i in 0..2000 {
        tree.insert_key(i, i).unwrap();
    }
    assert_eq!(metrics.objects_count(), 16);
    assert_eq!(metrics.used_memory(), 16 * SMALL_PAGE);

    tree.set_cache_size(3).unwrap();
    assert_eq!(metrics.objects_count(), 3);
    assert_eq!(offsets_for(&mut tree, 1234, 1234), vec![1234]);

    tree.set_cache_size(0).unwrap();
    assert_eq!(tree.cache_size(), 1);
    assert_eq!(all_pairs(&mut tree).len(), 2000);

    tree.close().unwrap();
    assert_eq!(metrics.objects_count(), 0);
    assert_eq!(metrics.used_memory(), 0);
}

#[test]
fn test_shared_metrics_sum_across_trees() {
    let temp_dir = TempDir::new().unwrap();
    let metrics = CacheMetrics::new();

    let mut trees: Vec<BTree<i32>> = (0..3)
        .map(|n| {
            let mut tree = BTree::with_metrics(
                temp_dir.path().join(format!("tree{n}.btree")),
                small_options(),
                Arc::clone(&metrics),
            )
            .unwrap();
            assert!(tree.open().unwrap());
            tree
        })
        .collect();

    for tree in &mut trees {
        tree.insert_key(1, 1).unwrap();
    }
    assert_eq!(metrics.objects_count(), 3);

    drop(trees);
    assert_eq!(metrics.objects_count(), 0);
}

#[test]
fn test_open_rejects_invalid_files() {
    let temp_dir = TempDir::new().unwrap();

    // Garbage header
    let garbage = temp_dir.path().join("garbage.btree");
    fs::write(&garbage, vec![0xAB; SMALL_PAGE * 2]).unwrap();
    let mut tree = BTree::<i32>::new(&garbage, small_options()).unwrap();
    assert!(!tree.open().unwrap());
    assert!(!tree.is_open());

    // Valid tree opened with another page size
    let path = temp_dir.path().join("valid.btree");
    {
        let mut tree = reopen::<i32>(&path, small_options());
        tree.insert_key(1, 1).unwrap();
    }
    let mut tree = BTree::<i32>::new(&path, BTreeOptions::default().page_size(512)).unwrap();
    assert!(!tree.open().unwrap());

    // Valid tree opened with another key size
    let mut tree = BTree::<i64>::new(&path, small_options()).unwrap();
    assert!(!tree.open().unwrap());

    // Truncated to a partial page
    let bytes = fs::read(&path).unwrap();
    let truncated = temp_dir.path().join("truncated.btree");
    fs::write(&truncated, &bytes[..SMALL_PAGE + 10]).unwrap();
    let mut tree = BTree::<i32>::new(&truncated, small_options()).unwrap();
    assert!(!tree.open().unwrap());

    // Missing pages
    fs::write(&truncated, &bytes[..SMALL_PAGE]).unwrap();
    let mut tree = BTree::<i32>::new(&truncated, small_options()).unwrap();
    assert!(!tree.open().unwrap());

    // The original is untouched
    let mut tree = reopen::<i32>(&path, small_options());
    assert_eq!(tree.count().unwrap(), 1);
}

#[test]
fn test_corrupted_node_fails_fast() {
    let (_temp_dir, path, mut tree) = setup_tree::<i32>(small_options());

    for i in 0..500 {
        tree.insert_key(i, i).unwrap();
    }
    tree.close().unwrap();

    // Overwrite the node type of page 1 with an unknown tag
    let mut bytes = fs::read(&path).unwrap();
    bytes[SMALL_PAGE] = 0x7F;
    fs::write(&path, &bytes).unwrap();

    let mut tree = reopen::<i32>(&path, small_options());
    let result: BTreeResult<Vec<_>> = tree.keys().unwrap().collect();
    assert!(matches!(
        result,
        Err(BTreeError::CorruptedPage { page_id: 1, .. })
    ));
}

#[test]
fn test_dispose_is_idempotent_and_drop_persists() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.btree");

    let mut tree = reopen::<i32>(&path, small_options());
    tree.insert_key(42, 4).unwrap();
    tree.dispose().unwrap();
    tree.dispose().unwrap();
    assert!(!tree.is_open());

    {
        let mut tree = reopen::<i32>(&path, small_options());
        tree.insert_key(43, 5).unwrap();
        // Dropped without close
    }

    let mut tree = reopen::<i32>(&path, small_options());
    assert_eq!(
        all_pairs(&mut tree),
        vec![KeyPair::new(42, 4), KeyPair::new(43, 5)]
    );
}
