use super::*;

//-------------------------------------------------------------------------

impl<K, V> BpTree<K, V>
where
    K: Pack + Ord + Clone + Default,
    V: Pack + Clone,
{
    /// Returns false when the key is absent.
    pub fn remove(&mut self, key: &K) -> Result<bool> {
        let parent_id = self.search_index(key)?;
        let parent = self.read_internal(parent_id)?;
        let i = upper_bound(&parent.entries[..parent.entries.len() - 1], key);
        let leaf_id = parent.entries[i].1;
        let is_last_child = i == parent.entries.len() - 1;
        drop(parent);

        let mut leaf = self.read_leaf(leaf_id)?;
        let pos = match leaf.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(pos) => pos,
            Err(_) => return Ok(false),
        };
        leaf.entries.remove(pos);

        let min_n = if self.meta.leaf_count == 1 {
            0
        } else {
            self.meta.order as usize / 2
        };

        if leaf.entries.len() < min_n {
            let mut borrowed = false;
            if leaf.prev != NO_RECORD {
                borrowed = self.borrow_from_leaf(false, &mut leaf)?;
            }
            if !borrowed && leaf.next != NO_RECORD {
                borrowed = self.borrow_from_leaf(true, &mut leaf)?;
            }

            if borrowed {
                self.write_leaf(&leaf, leaf_id)?;
            } else if is_last_child {
                self.merge_leaf_into_prev(leaf, leaf_id)?;
            } else {
                self.merge_next_into_leaf(leaf, leaf_id)?;
            }
        } else {
            self.write_leaf(&leaf, leaf_id)?;
        }

        self.save_meta()?;
        Ok(true)
    }

    //-------------------------------

    /// Moves one record from a sibling into `borrower` when the sibling can
    /// spare it, adjusting the separating key in the parent.  The caller
    /// writes the borrower back.
    fn borrow_from_leaf(&mut self, from_right: bool, borrower: &mut Leaf<K, V>) -> Result<bool> {
        let lender_id = if from_right {
            borrower.next
        } else {
            borrower.prev
        };
        let mut lender = self.read_leaf(lender_id)?;

        if lender.entries.len() <= self.meta.order as usize / 2 {
            return Ok(false);
        }

        if from_right {
            let old_key = borrower.entries[0].0.clone();
            let new_key = lender.entries[1].0.clone();
            let pid = borrower.parent;
            let new_pid = self.change_parent_child(pid, &old_key, &new_key)?;
            if new_pid != pid {
                if borrower.parent == pid {
                    borrower.parent = new_pid;
                }
                if lender.parent == pid {
                    lender.parent = new_pid;
                }
            }

            borrower.entries.push(lender.entries.remove(0));
        } else {
            let old_key = lender.entries[0].0.clone();
            let lent = lender.entries.pop().unwrap();
            let pid = lender.parent;
            let new_pid = self.change_parent_child(pid, &old_key, &lent.0)?;
            if new_pid != pid {
                if borrower.parent == pid {
                    borrower.parent = new_pid;
                }
                if lender.parent == pid {
                    lender.parent = new_pid;
                }
            }

            borrower.entries.insert(0, lent);
        }

        self.write_leaf(&lender, lender_id)?;
        Ok(true)
    }

    /// merge | prev | leaf |
    fn merge_leaf_into_prev(&mut self, mut leaf: Leaf<K, V>, leaf_id: RecordId) -> Result<()> {
        let prev_id = leaf.prev;
        let mut prev = self.read_leaf(prev_id)?;
        let index_key = prev.entries[0].0.clone();

        prev.entries.append(&mut leaf.entries);
        prev.next = leaf.next;
        if leaf.next != NO_RECORD {
            let mut sib = self.read_leaf(leaf.next)?;
            sib.prev = prev_id;
            self.rewrite_leaf(&sib, leaf.next)?;
        }

        self.file.free_record(leaf_id)?;
        self.write_leaf(&prev, prev_id)?;
        self.meta.leaf_count -= 1;

        self.remove_from_index(leaf.parent, &index_key)
    }

    /// merge | leaf | next |
    fn merge_next_into_leaf(&mut self, mut leaf: Leaf<K, V>, leaf_id: RecordId) -> Result<()> {
        let next_id = leaf.next;
        let mut next = self.read_leaf(next_id)?;
        let index_key = leaf.entries[0].0.clone();

        leaf.entries.append(&mut next.entries);
        leaf.next = next.next;
        if next.next != NO_RECORD {
            let mut sib = self.read_leaf(next.next)?;
            sib.prev = leaf_id;
            self.rewrite_leaf(&sib, next.next)?;
        }

        self.file.free_record(next_id)?;
        self.write_leaf(&leaf, leaf_id)?;
        self.meta.leaf_count -= 1;

        self.remove_from_index(leaf.parent, &index_key)
    }

    //-------------------------------

    /// Drops the separator located by `key` from the internal node at
    /// `node_id`, rebalancing upward as needed.
    fn remove_from_index(&mut self, node_id: RecordId, key: &K) -> Result<()> {
        let mut node = self.read_internal(node_id)?;
        let index_key = node.entries[0].0.clone();

        let n = node.entries.len();
        let i = upper_bound(&node.entries[..n - 1], key);
        if i + 1 < n {
            node.entries[i + 1].1 = node.entries[i].1;
        }
        node.entries.remove(i);

        // A root down to one child hands the tree over to it.
        if node.entries.len() == 1 && self.meta.root == node_id && self.meta.internal_count != 1 {
            let child = node.entries[0].1;
            self.file.free_record(node_id)?;
            self.meta.internal_count -= 1;
            self.meta.height -= 1;
            self.meta.root = child;
            self.patch_parent(child, NO_RECORD)?;
            return self.save_meta();
        }

        let min_n = if self.meta.root == node_id {
            1
        } else {
            self.meta.order as usize / 2
        };

        if node.entries.len() < min_n {
            let parent = self.read_internal(node.parent)?;
            let first_child = parent.entries[0].1;
            let last_child = parent.entries[parent.entries.len() - 1].1;
            drop(parent);

            let mut borrowed = false;
            if node_id != first_child {
                borrowed = self.borrow_from_internal(false, &mut node, node_id)?;
            }
            if !borrowed && node_id != last_child {
                borrowed = self.borrow_from_internal(true, &mut node, node_id)?;
            }

            if borrowed {
                self.write_internal(&node, node_id)?;
            } else if node_id == last_child {
                // merge | prev | node |
                let prev_id = node.prev;
                let mut prev = self.read_internal(prev_id)?;

                for (_k, child) in &node.entries {
                    self.patch_parent(*child, prev_id)?;
                }
                prev.entries.append(&mut node.entries);
                prev.next = node.next;
                if node.next != NO_RECORD {
                    let mut sib = self.read_internal(node.next)?;
                    sib.prev = prev_id;
                    self.rewrite_internal(&sib, node.next)?;
                }

                self.file.free_record(node_id)?;
                self.write_internal(&prev, prev_id)?;
                self.meta.internal_count -= 1;

                self.remove_from_index(node.parent, &index_key)?;
            } else {
                // merge | node | next |
                let next_id = node.next;
                let mut next = self.read_internal(next_id)?;

                for (_k, child) in &next.entries {
                    self.patch_parent(*child, node_id)?;
                }
                node.entries.append(&mut next.entries);
                node.next = next.next;
                if next.next != NO_RECORD {
                    let mut sib = self.read_internal(next.next)?;
                    sib.prev = node_id;
                    self.rewrite_internal(&sib, next.next)?;
                }

                self.file.free_record(next_id)?;
                self.write_internal(&node, node_id)?;
                self.meta.internal_count -= 1;

                self.remove_from_index(node.parent, &index_key)?;
            }
        } else {
            self.write_internal(&node, node_id)?;
        }
        Ok(())
    }

    fn borrow_from_internal(
        &mut self,
        from_right: bool,
        borrower: &mut Internal<K>,
        borrower_id: RecordId,
    ) -> Result<bool> {
        let lender_id = if from_right {
            borrower.next
        } else {
            borrower.prev
        };
        let mut lender = self.read_internal(lender_id)?;

        if lender.entries.len() <= self.meta.order as usize / 2 {
            return Ok(false);
        }

        if from_right {
            // The separator covering the borrower advances to the lender's
            // first key; the lender's first child crosses over.
            let pid = borrower.parent;
            let mut parent = self.read_internal(pid)?;
            let pn = parent.entries.len();
            let i = lower_bound(
                &parent.entries[..pn - 1],
                &borrower.entries[borrower.entries.len() - 1].0,
            );
            parent.entries[i].0 = lender.entries[0].0.clone();
            let new_pid = self.write_internal(&parent, pid)?;
            if new_pid != pid {
                if borrower.parent == pid {
                    borrower.parent = new_pid;
                }
                if lender.parent == pid {
                    lender.parent = new_pid;
                }
            }

            let lent = lender.entries.remove(0);
            self.patch_parent(lent.1, borrower_id)?;
            borrower.entries.push(lent);
        } else {
            // The old separator drops onto the borrower's first entry; the
            // lender's new last key becomes the separator.
            let pid = lender.parent;
            let mut parent = self.read_internal(pid)?;
            let pn = parent.entries.len();
            let i = upper_bound(&parent.entries[..pn - 1], &lender.entries[0].0);
            let sep = parent.entries[i].0.clone();
            parent.entries[i].0 = lender.entries[lender.entries.len() - 2].0.clone();
            let new_pid = self.write_internal(&parent, pid)?;
            if new_pid != pid {
                if borrower.parent == pid {
                    borrower.parent = new_pid;
                }
                if lender.parent == pid {
                    lender.parent = new_pid;
                }
            }

            borrower.entries[0].0 = sep;
            let lent = lender.entries.pop().unwrap();
            self.patch_parent(lent.1, borrower_id)?;
            borrower.entries.insert(0, lent);
        }

        self.write_internal(&lender, lender_id)?;
        Ok(true)
    }

    /// Replaces the separator keyed by `old` in the parent chain; when the
    /// match is the node's last slot the true separator lives further up.
    fn change_parent_child(&mut self, parent_id: RecordId, old: &K, new: &K) -> Result<RecordId> {
        let mut node = self.read_internal(parent_id)?;
        let n = node.entries.len();
        let i = upper_bound(&node.entries[..n - 1], old);
        node.entries[i].0 = new.clone();
        let new_id = self.write_internal(&node, parent_id)?;

        if i == n - 1 && node.parent != NO_RECORD {
            self.change_parent_child(node.parent, old, new)?;
        }
        Ok(new_id)
    }
}

//-------------------------------------------------------------------------
