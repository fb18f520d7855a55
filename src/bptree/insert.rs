use super::*;

//-------------------------------------------------------------------------

fn insert_sorted<K: Ord, T>(entries: &mut Vec<(K, T)>, key: K, value: T) {
    let i = upper_bound(entries, &key);
    entries.insert(i, (key, value));
}

/// Inserts a separator into an internal node with room to spare.  The new
/// child sits to the right of the displaced one, so the displaced entry keeps
/// its child and the successor takes the new one.
fn insert_separator<K: Ord>(node: &mut Internal<K>, key: K, child: RecordId) {
    let n = node.entries.len();
    let i = upper_bound(&node.entries[..n - 1], &key);
    let displaced = node.entries[i].1;
    node.entries.insert(i, (key, displaced));
    node.entries[i + 1].1 = child;
}

//-------------------------------------------------------------------------

impl<K, V> BpTree<K, V>
where
    K: Pack + Ord + Clone + Default,
    V: Pack + Clone,
{
    /// Returns false when the key is already present.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        let parent_id = self.search_index(&key)?;
        let leaf_id = self.search_leaf_from(parent_id, &key)?;
        let mut leaf = self.read_leaf(leaf_id)?;

        if leaf.entries.binary_search_by(|(k, _)| k.cmp(&key)).is_ok() {
            return Ok(false);
        }

        if leaf.entries.len() == self.meta.order as usize {
            self.split_leaf(leaf, leaf_id, parent_id, key, value)?;
        } else {
            insert_sorted(&mut leaf.entries, key, value);
            self.write_leaf(&leaf, leaf_id)?;
        }

        self.save_meta()?;
        Ok(true)
    }

    fn split_leaf(
        &mut self,
        mut leaf: Leaf<K, V>,
        leaf_id: RecordId,
        parent_id: RecordId,
        key: K,
        value: V,
    ) -> Result<()> {
        // Split at the midpoint, nudged so the new key lands on the correct
        // side.
        let mut point = leaf.entries.len() / 2;
        let place_right = key > leaf.entries[point].0;
        if place_right {
            point += 1;
        }

        let old_next = leaf.next;
        let mut new_leaf = Leaf {
            parent: leaf.parent,
            next: old_next,
            prev: NO_RECORD,
            entries: leaf.entries.split_off(point),
        };

        if place_right {
            insert_sorted(&mut new_leaf.entries, key, value);
        } else {
            insert_sorted(&mut leaf.entries, key, value);
        }

        // The shrunken left half goes first: its save may relocate it, and
        // the new sibling's prev must name the final id.
        let left_id = self.write_leaf(&leaf, leaf_id)?;
        new_leaf.prev = left_id;
        let right_id = self.write_leaf(&new_leaf, NO_RECORD)?;

        leaf.next = right_id;
        self.rewrite_leaf(&leaf, left_id)?;
        if old_next != NO_RECORD {
            let mut sib = self.read_leaf(old_next)?;
            sib.prev = right_id;
            self.rewrite_leaf(&sib, old_next)?;
        }

        self.meta.leaf_count += 1;

        let split_key = new_leaf.entries[0].0.clone();
        self.insert_into_parent(parent_id, split_key, left_id, right_id)
    }

    /// Records a split in the parent at `parent_id`: `left` kept its entry,
    /// `right` is new and sits immediately after it.  NO_RECORD means the
    /// root itself split and the tree grows a level.
    fn insert_into_parent(
        &mut self,
        parent_id: RecordId,
        key: K,
        left: RecordId,
        right: RecordId,
    ) -> Result<()> {
        if parent_id == NO_RECORD {
            let root = Internal {
                parent: NO_RECORD,
                next: NO_RECORD,
                prev: NO_RECORD,
                entries: vec![(key.clone(), left), (key, right)],
            };
            let root_id = self.write_internal(&root, NO_RECORD)?;

            self.patch_parent(left, root_id)?;
            self.patch_parent(right, root_id)?;

            self.meta.root = root_id;
            self.meta.height += 1;
            self.meta.internal_count += 1;
            return Ok(());
        }

        let mut node = self.read_internal(parent_id)?;

        if node.entries.len() == self.meta.order as usize {
            self.split_internal(node, parent_id, key, right)
        } else {
            insert_separator(&mut node, key, right);
            self.write_internal(&node, parent_id)?;
            Ok(())
        }
    }

    fn split_internal(
        &mut self,
        mut node: Internal<K>,
        node_id: RecordId,
        key: K,
        child: RecordId,
    ) -> Result<()> {
        let mut point = (node.entries.len() - 1) / 2;
        let place_right = key > node.entries[point].0;
        if place_right {
            point += 1;
            // keep the new key off the promoted slot
            if key < node.entries[point].0 {
                point -= 1;
            }
        }
        let middle_key = node.entries[point].0.clone();

        let old_next = node.next;
        let mut new_node = Internal {
            parent: node.parent,
            next: old_next,
            prev: NO_RECORD,
            entries: node.entries.split_off(point + 1),
        };
        // the promoted key stays behind as the left half's unused last key

        if place_right {
            insert_separator(&mut new_node, key, child);
        } else {
            insert_separator(&mut node, key, child);
        }

        let left_id = self.write_internal(&node, node_id)?;
        new_node.prev = left_id;
        let right_id = self.write_internal(&new_node, NO_RECORD)?;

        node.next = right_id;
        self.rewrite_internal(&node, left_id)?;
        if old_next != NO_RECORD {
            let mut sib = self.read_internal(old_next)?;
            sib.prev = right_id;
            self.rewrite_internal(&sib, old_next)?;
        }

        // entries moved right now live under the new node
        for (_k, c) in &new_node.entries {
            self.patch_parent(*c, right_id)?;
        }

        self.meta.internal_count += 1;
        self.insert_into_parent(node.parent, middle_key, left_id, right_id)
    }
}

//-------------------------------------------------------------------------
