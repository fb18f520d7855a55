mod insert;
mod remove;

#[cfg(test)]
mod tests;

use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::errors::Result;
use crate::pack::{pack_to_vec, Pack};
use crate::volume_file::{RecordId, VolumeFile, NO_RECORD};

//-------------------------------------------------------------------------

pub const BP_ORDER: usize = 100;

// A node's parent pointer is the leading 8 bytes of its record.  Both
// repoint-the-children passes and the relocation fix-ups patch it with a
// bounded in-place write, so it must stay the first packed field.

pub(crate) struct Internal<K> {
    parent: RecordId,
    next: RecordId,
    prev: RecordId,
    entries: Vec<(K, RecordId)>,
}

pub(crate) struct Leaf<K, V> {
    parent: RecordId,
    next: RecordId,
    prev: RecordId,
    entries: Vec<(K, V)>,
}

impl<K: Pack> Pack for Internal<K> {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.parent.pack(w)?;
        self.next.pack(w)?;
        self.prev.pack(w)?;
        self.entries.pack(w)
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let parent = RecordId::unpack(r)?;
        let next = RecordId::unpack(r)?;
        let prev = RecordId::unpack(r)?;
        let entries = Vec::unpack(r)?;
        Ok(Self {
            parent,
            next,
            prev,
            entries,
        })
    }
}

impl<K: Pack, V: Pack> Pack for Leaf<K, V> {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.parent.pack(w)?;
        self.next.pack(w)?;
        self.prev.pack(w)?;
        self.entries.pack(w)
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let parent = RecordId::unpack(r)?;
        let next = RecordId::unpack(r)?;
        let prev = RecordId::unpack(r)?;
        let entries = Vec::unpack(r)?;
        Ok(Self {
            parent,
            next,
            prev,
            entries,
        })
    }
}

//-------------------------------------------------------------------------

struct Meta {
    order: u64,
    internal_count: u64,
    leaf_count: u64,

    // height counts the internal levels; leaves sit below it
    height: u64,
    root: RecordId,
}

impl Pack for Meta {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.order.pack(w)?;
        self.internal_count.pack(w)?;
        self.leaf_count.pack(w)?;
        self.height.pack(w)?;
        self.root.pack(w)
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let order = u64::unpack(r)?;
        let internal_count = u64::unpack(r)?;
        let leaf_count = u64::unpack(r)?;
        let height = u64::unpack(r)?;
        let root = RecordId::unpack(r)?;
        Ok(Self {
            order,
            internal_count,
            leaf_count,
            height,
            root,
        })
    }
}

//-------------------------------------------------------------------------

/// First index whose key is strictly greater than `key`.
pub(crate) fn upper_bound<K: Ord, T>(entries: &[(K, T)], key: &K) -> usize {
    entries.partition_point(|(k, _)| k <= key)
}

/// First index whose key is not less than `key`.
pub(crate) fn lower_bound<K: Ord, T>(entries: &[(K, T)], key: &K) -> usize {
    entries.partition_point(|(k, _)| k < key)
}

//-------------------------------------------------------------------------

/// A B+-tree whose nodes are records in the enclosing VolumeFile.  Values
/// are variable size: a node serializes as one record and is re-resized on
/// every change, so a write can relocate the record.  Every save repairs the
/// pointers that named the old record (meta root, parent entry, sibling
/// links, children's parent back-pointers).
///
/// Internal nodes hold `n` child entries; the first `n - 1` keys are
/// separators, the last key is unused.
pub struct BpTree<K, V> {
    file: Arc<VolumeFile>,
    meta: Meta,
    meta_record_id: RecordId,
    _key: PhantomData<K>,
    _value: PhantomData<V>,
}

impl<K, V> BpTree<K, V>
where
    K: Pack + Ord + Clone + Default,
    V: Pack + Clone,
{
    pub fn create(file: Arc<VolumeFile>) -> Result<Self> {
        Self::create_with_order(file, BP_ORDER)
    }

    pub(crate) fn create_with_order(file: Arc<VolumeFile>, order: usize) -> Result<Self> {
        let leaf: Leaf<K, V> = Leaf {
            parent: NO_RECORD,
            next: NO_RECORD,
            prev: NO_RECORD,
            entries: Vec::new(),
        };
        let leaf_id = file.allocate_record(&pack_to_vec(&leaf)?)?;

        // The sole child entry's key is never compared.
        let root = Internal {
            parent: NO_RECORD,
            next: NO_RECORD,
            prev: NO_RECORD,
            entries: vec![(K::default(), leaf_id)],
        };
        let root_id = file.allocate_record(&pack_to_vec(&root)?)?;

        let meta = Meta {
            order: order as u64,
            internal_count: 1,
            leaf_count: 1,
            height: 1,
            root: root_id,
        };
        let meta_record_id = file.allocate_record(&pack_to_vec(&meta)?)?;

        let tree = Self {
            file,
            meta,
            meta_record_id,
            _key: PhantomData,
            _value: PhantomData,
        };
        tree.patch_parent(leaf_id, root_id)?;
        Ok(tree)
    }

    pub fn open(file: Arc<VolumeFile>, meta_record_id: RecordId) -> Result<Self> {
        let meta = file.read_record(meta_record_id, |r| Meta::unpack(r))?;
        Ok(Self {
            file,
            meta,
            meta_record_id,
            _key: PhantomData,
            _value: PhantomData,
        })
    }

    pub fn record_id(&self) -> RecordId {
        self.meta_record_id
    }

    //-------------------------------

    /// Lower-bound lookup: the value at the smallest key >= `key`, along
    /// with how that key compares to the requested one.
    pub fn search(&self, key: &K) -> Result<Option<(V, Ordering)>> {
        let leaf_id = self.search_leaf_from(self.search_index(key)?, key)?;
        let leaf = self.read_leaf(leaf_id)?;

        let i = lower_bound(&leaf.entries, key);
        if i < leaf.entries.len() {
            let (k, v) = &leaf.entries[i];
            Ok(Some((v.clone(), k.cmp(key))))
        } else {
            Ok(None)
        }
    }

    pub fn get_first(&self) -> Result<Option<(K, V)>> {
        let mut id = self.meta.root;
        for _ in 0..self.meta.height {
            let node = self.read_internal(id)?;
            id = node.entries[0].1;
        }

        let leaf = self.read_leaf(id)?;
        Ok(leaf.entries.first().cloned())
    }

    //-------------------------------

    /// Descends to the internal node one level above the leaves.
    fn search_index(&self, key: &K) -> Result<RecordId> {
        let mut id = self.meta.root;
        let mut height = self.meta.height;
        while height > 1 {
            let node = self.read_internal(id)?;
            let i = upper_bound(&node.entries[..node.entries.len() - 1], key);
            id = node.entries[i].1;
            height -= 1;
        }
        Ok(id)
    }

    fn search_leaf_from(&self, index_id: RecordId, key: &K) -> Result<RecordId> {
        let node = self.read_internal(index_id)?;
        let i = upper_bound(&node.entries[..node.entries.len() - 1], key);
        Ok(node.entries[i].1)
    }

    //-------------------------------

    fn read_internal(&self, id: RecordId) -> Result<Internal<K>> {
        self.file.read_record(id, |r| Internal::unpack(r))
    }

    fn read_leaf(&self, id: RecordId) -> Result<Leaf<K, V>> {
        self.file.read_record(id, |r| Leaf::unpack(r))
    }

    fn save_meta(&mut self) -> Result<()> {
        // Fixed size, so the record never moves.
        let id = self.file.resize_record(self.meta_record_id, &pack_to_vec(&self.meta)?)?;
        debug_assert_eq!(id, self.meta_record_id);
        Ok(())
    }

    /// Writes a node, allocating when `id` is NO_RECORD.  On relocation every
    /// stored pointer to the old record is repaired.  Returns the final id.
    fn write_internal(&mut self, node: &Internal<K>, id: RecordId) -> Result<RecordId> {
        let buf = pack_to_vec(node)?;
        if id == NO_RECORD {
            return self.file.allocate_record(&buf);
        }

        let new_id = self.file.resize_record(id, &buf)?;
        if new_id != id {
            self.internal_moved(node, id, new_id)?;
        }
        Ok(new_id)
    }

    fn write_leaf(&mut self, leaf: &Leaf<K, V>, id: RecordId) -> Result<RecordId> {
        let buf = pack_to_vec(leaf)?;
        if id == NO_RECORD {
            return self.file.allocate_record(&buf);
        }

        let new_id = self.file.resize_record(id, &buf)?;
        if new_id != id {
            self.leaf_moved(leaf, id, new_id)?;
        }
        Ok(new_id)
    }

    /// Same-length rewrite for pointer-only updates; must not change the
    /// serialized size.
    fn rewrite_internal(&self, node: &Internal<K>, id: RecordId) -> Result<()> {
        self.file.write_record(id, &pack_to_vec(node)?)
    }

    fn rewrite_leaf(&self, leaf: &Leaf<K, V>, id: RecordId) -> Result<()> {
        self.file.write_record(id, &pack_to_vec(leaf)?)
    }

    fn patch_parent(&self, child: RecordId, parent: RecordId) -> Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, parent);
        self.file.write_record(child, &buf)
    }

    fn repoint_child(&self, parent_id: RecordId, old: RecordId, new: RecordId) -> Result<()> {
        let mut parent: Internal<K> = self.read_internal(parent_id)?;
        for e in parent.entries.iter_mut() {
            if e.1 == old {
                e.1 = new;
                break;
            }
        }
        self.rewrite_internal(&parent, parent_id)
    }

    fn internal_moved(&mut self, node: &Internal<K>, old: RecordId, new: RecordId) -> Result<()> {
        if self.meta.root == old {
            self.meta.root = new;
            self.save_meta()?;
        } else {
            self.repoint_child(node.parent, old, new)?;
        }

        if node.prev != NO_RECORD {
            let mut sib = self.read_internal(node.prev)?;
            sib.next = new;
            self.rewrite_internal(&sib, node.prev)?;
        }
        if node.next != NO_RECORD {
            let mut sib = self.read_internal(node.next)?;
            sib.prev = new;
            self.rewrite_internal(&sib, node.next)?;
        }

        for (_k, child) in &node.entries {
            self.patch_parent(*child, new)?;
        }
        Ok(())
    }

    fn leaf_moved(&mut self, leaf: &Leaf<K, V>, old: RecordId, new: RecordId) -> Result<()> {
        // A leaf always has an internal parent.
        debug_assert_ne!(leaf.parent, NO_RECORD);
        self.repoint_child(leaf.parent, old, new)?;

        if leaf.prev != NO_RECORD {
            let mut sib = self.read_leaf(leaf.prev)?;
            sib.next = new;
            self.rewrite_leaf(&sib, leaf.prev)?;
        }
        if leaf.next != NO_RECORD {
            let mut sib = self.read_leaf(leaf.next)?;
            sib.prev = new;
            self.rewrite_leaf(&sib, leaf.next)?;
        }
        Ok(())
    }
}

//-------------------------------------------------------------------------
