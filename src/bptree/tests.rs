use super::*;

use anyhow::{ensure, Result};
use rand::prelude::*;
use rand::rngs::StdRng;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tempfile::TempDir;

//-------------------------------------------------------------------------

type TestTree = BpTree<u64, Vec<u64>>;

struct Fixture {
    file: Arc<VolumeFile>,
    tree: TestTree,
    _temp_dir: TempDir,
}

impl Fixture {
    fn new(order: usize) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("volume");
        VolumeFile::create(&path)?;
        let file = Arc::new(VolumeFile::open(&path)?);
        let tree = TestTree::create_with_order(file.clone(), order)?;
        Ok(Fixture {
            file,
            tree,
            _temp_dir: temp_dir,
        })
    }
}

// Values vary in length so leaf records change size class and relocate.
fn value_for(key: u64) -> Vec<u64> {
    let len = (key % 7) as usize;
    vec![key; len]
}

//-------------------------------------------------------------------------

fn walk(
    tree: &TestTree,
    id: RecordId,
    height: u64,
    parent_id: RecordId,
    leaves: &mut Vec<RecordId>,
) -> Result<()> {
    let order = tree.meta.order as usize;

    if height == 0 {
        let leaf = tree.read_leaf(id)?;
        ensure!(leaf.parent == parent_id, "leaf parent pointer is stale");
        if tree.meta.leaf_count > 1 {
            ensure!(leaf.entries.len() >= order / 2 && leaf.entries.len() <= order);
        }
        leaves.push(id);
        return Ok(());
    }

    let node = tree.read_internal(id)?;
    ensure!(node.parent == parent_id, "internal parent pointer is stale");
    if id == tree.meta.root {
        ensure!(!node.entries.is_empty());
    } else {
        ensure!(node.entries.len() >= order / 2 && node.entries.len() <= order);
    }

    for (_k, child) in &node.entries {
        walk(tree, *child, height - 1, id, leaves)?;
    }
    Ok(())
}

fn check_tree(tree: &TestTree, model: &BTreeMap<u64, Vec<u64>>) -> Result<()> {
    let mut leaves = Vec::new();
    walk(tree, tree.meta.root, tree.meta.height, NO_RECORD, &mut leaves)?;
    ensure!(leaves.len() == tree.meta.leaf_count as usize);

    // The leaf chain covers every leaf in tree order and yields the model's
    // keys in sorted order.
    let mut keys = Vec::new();
    let mut prev_id = NO_RECORD;
    for (i, id) in leaves.iter().enumerate() {
        let leaf = tree.read_leaf(*id)?;
        ensure!(leaf.prev == prev_id, "leaf prev link broken");
        if i + 1 < leaves.len() {
            ensure!(leaf.next == leaves[i + 1], "leaf next link broken");
        } else {
            ensure!(leaf.next == NO_RECORD);
        }
        for (k, v) in &leaf.entries {
            ensure!(model.get(k) == Some(v), "value mismatch for key {}", k);
            keys.push(*k);
        }
        prev_id = *id;
    }

    let expected: Vec<u64> = model.keys().cloned().collect();
    ensure!(keys == expected, "key set diverged from model");
    Ok(())
}

//-------------------------------------------------------------------------

#[test]
fn test_empty_tree() -> Result<()> {
    let fix = Fixture::new(4)?;
    ensure!(fix.tree.get_first()?.is_none());
    ensure!(fix.tree.search(&42)?.is_none());
    Ok(())
}

#[test]
fn test_insert_and_search() -> Result<()> {
    let mut fix = Fixture::new(4)?;
    ensure!(fix.tree.insert(5, value_for(5))?);
    ensure!(fix.tree.insert(3, value_for(3))?);
    ensure!(fix.tree.insert(9, value_for(9))?);

    let (v, ord) = fix.tree.search(&5)?.unwrap();
    ensure!(ord == Ordering::Equal);
    ensure!(v == value_for(5));

    // lower bound with the comparison sign
    let (v, ord) = fix.tree.search(&4)?.unwrap();
    ensure!(ord == Ordering::Greater);
    ensure!(v == value_for(5));

    ensure!(fix.tree.search(&10)?.is_none());
    Ok(())
}

#[test]
fn test_insert_rejects_duplicate() -> Result<()> {
    let mut fix = Fixture::new(4)?;
    ensure!(fix.tree.insert(1, vec![])?);
    ensure!(!fix.tree.insert(1, vec![9])?);
    Ok(())
}

#[test]
fn test_remove_absent() -> Result<()> {
    let mut fix = Fixture::new(4)?;
    ensure!(!fix.tree.remove(&1)?);
    ensure!(fix.tree.insert(1, vec![])?);
    ensure!(fix.tree.remove(&1)?);
    ensure!(!fix.tree.remove(&1)?);
    Ok(())
}

#[test]
fn test_get_first() -> Result<()> {
    let mut fix = Fixture::new(4)?;
    for k in [50u64, 20, 80, 10, 60] {
        fix.tree.insert(k, value_for(k))?;
    }
    let (k, v) = fix.tree.get_first()?.unwrap();
    ensure!(k == 10);
    ensure!(v == value_for(10));

    fix.tree.remove(&10)?;
    let (k, _) = fix.tree.get_first()?.unwrap();
    ensure!(k == 20);
    Ok(())
}

#[test]
fn test_sequential_fill_and_drain() -> Result<()> {
    let mut fix = Fixture::new(4)?;
    let mut model = BTreeMap::new();

    for k in 0..200u64 {
        ensure!(fix.tree.insert(k, value_for(k))?);
        model.insert(k, value_for(k));
    }
    check_tree(&fix.tree, &model)?;

    for k in 0..200u64 {
        ensure!(fix.tree.remove(&k)?);
        model.remove(&k);
        if k % 20 == 0 {
            check_tree(&fix.tree, &model)?;
        }
    }
    check_tree(&fix.tree, &model)?;
    ensure!(fix.tree.get_first()?.is_none());

    // back to the initial shape
    ensure!(fix.tree.meta.height == 1);
    ensure!(fix.tree.meta.internal_count == 1);
    ensure!(fix.tree.meta.leaf_count == 1);
    Ok(())
}

#[test]
fn test_random_churn_against_model() -> Result<()> {
    let mut fix = Fixture::new(4)?;
    let mut model = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for round in 0..2000 {
        let key = rng.gen_range(0..500u64);
        if rng.gen_bool(0.6) {
            let inserted = fix.tree.insert(key, value_for(key))?;
            ensure!(inserted == !model.contains_key(&key));
            model.insert(key, value_for(key));
        } else {
            let removed = fix.tree.remove(&key)?;
            ensure!(removed == model.remove(&key).is_some());
        }

        if round % 100 == 0 {
            check_tree(&fix.tree, &model)?;
        }
    }
    check_tree(&fix.tree, &model)?;

    // every surviving key is searchable with an exact match
    for (k, v) in &model {
        let (found, ord) = fix.tree.search(k)?.unwrap();
        ensure!(ord == Ordering::Equal);
        ensure!(found == *v);
    }
    Ok(())
}

#[test]
fn test_full_order_splits() -> Result<()> {
    // Default order: leaves split at 100 entries.
    let mut fix = Fixture::new(BP_ORDER)?;
    let mut model = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(7);

    let mut keys: Vec<u64> = (0..1200).collect();
    keys.shuffle(&mut rng);
    for k in keys {
        fix.tree.insert(k, value_for(k))?;
        model.insert(k, value_for(k));
    }
    check_tree(&fix.tree, &model)?;

    for k in (0..1200u64).step_by(3) {
        fix.tree.remove(&k)?;
        model.remove(&k);
    }
    check_tree(&fix.tree, &model)?;
    Ok(())
}

#[test]
fn test_reopen_from_record_id() -> Result<()> {
    let mut fix = Fixture::new(4)?;
    let mut model = BTreeMap::new();
    for k in 0..100u64 {
        fix.tree.insert(k, value_for(k))?;
        model.insert(k, value_for(k));
    }

    let meta_id = fix.tree.record_id();
    let reopened = TestTree::open(fix.file.clone(), meta_id)?;
    check_tree(&reopened, &model)?;

    let (v, ord) = reopened.search(&57)?.unwrap();
    ensure!(ord == Ordering::Equal);
    ensure!(v == value_for(57));
    Ok(())
}

//-------------------------------------------------------------------------
