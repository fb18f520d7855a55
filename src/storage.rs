use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::errors::{Result, StoreError};
use crate::node::Node;
use crate::paths::{next_sub_key, path_tail, split_node_path, split_property_path};
use crate::property::{FromValue, Value};
use crate::volume::Volume;

//-------------------------------------------------------------------------

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

struct MountPoint {
    volume: Arc<Volume>,
    node_path: String,

    // resolved once when mounting
    node: Arc<Node>,
}

#[derive(Default)]
struct MountNode {
    nodes: HashMap<String, MountNode>,
    mount_points: Vec<MountPoint>,
}

//-------------------------------------------------------------------------

/// Joins mounted volume trees into one dotted-path namespace.  The mount
/// table is a trie of path segments; resolution prefers the longest
/// matching prefix, with mount order breaking ties at the same point.
pub struct Storage {
    id: u64,
    root: RwLock<MountNode>,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    pub fn new() -> Self {
        Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            root: RwLock::new(MountNode::default()),
        }
    }

    pub fn open_volume(
        &self,
        path: impl AsRef<Path>,
        create_if_not_exist: bool,
    ) -> Result<Arc<Volume>> {
        Volume::open(path, create_if_not_exist)
    }

    //-------------------------------

    pub fn mount(&self, volume: &Arc<Volume>, path: &str) -> Result<()> {
        self.mount_at(volume, path, "")
    }

    /// Exposes the subtree of `volume` at `node_path` under `path` in this
    /// storage's namespace.  The node must exist when mounting.
    pub fn mount_at(&self, volume: &Arc<Volume>, path: &str, node_path: &str) -> Result<()> {
        let node = volume.get_node(node_path)?.ok_or_else(|| {
            StoreError::NoSuchNode(format!("mounted volume has no node '{}'", node_path))
        })?;
        volume.bind_storage(self.id)?;

        let mut root = self.root.write().unwrap();
        let mut trie = &mut *root;
        let mut pos = 0;
        while pos < path.len() {
            let (sub_key, next) = next_sub_key(path, pos);
            trie = trie.nodes.entry(sub_key.to_string()).or_default();
            pos = next;
        }

        trie.mount_points.push(MountPoint {
            volume: volume.clone(),
            node_path: node_path.to_string(),
            node,
        });
        Ok(())
    }

    pub fn unmount(&self, volume: &Arc<Volume>, path: &str) -> Result<()> {
        self.unmount_at(volume, path, "")
    }

    /// Removes the matching mount point and prunes trie nodes left with
    /// neither mounts nor children.
    pub fn unmount_at(&self, volume: &Arc<Volume>, path: &str, node_path: &str) -> Result<()> {
        let mut keys = Vec::new();
        let mut pos = 0;
        while pos < path.len() {
            let (sub_key, next) = next_sub_key(path, pos);
            keys.push(sub_key.to_string());
            pos = next;
        }

        let mut root = self.root.write().unwrap();
        unmount_in(&mut root, &keys, volume, node_path)?;
        drop(root);

        volume.unbind_storage();
        Ok(())
    }

    //-------------------------------

    pub fn get_node(&self, path: &str) -> Result<Option<Arc<Node>>> {
        let root = self.root.read().unwrap();

        // Walk the trie as deep as the path reaches, then try mount points
        // deepest first.
        let mut chain: Vec<(&MountNode, usize)> = vec![(&*root, 0)];
        let mut trie = &*root;
        let mut pos = 0;
        while pos < path.len() {
            let (sub_key, next) = next_sub_key(path, pos);
            match trie.nodes.get(sub_key) {
                Some(child) => {
                    trie = child;
                    pos = next;
                    chain.push((trie, pos));
                }
                None => break,
            }
        }

        for (trie, pos) in chain.iter().rev() {
            for mount_point in &trie.mount_points {
                if let Some(node) = mount_point.node.get_node(path_tail(path, *pos))? {
                    return Ok(Some(node));
                }
            }
        }
        Ok(None)
    }

    pub fn add_node(&self, parent_path: &str, name: &str) -> Result<Arc<Node>> {
        let parent = self
            .get_node(parent_path)?
            .ok_or_else(|| StoreError::NoSuchNode(parent_path.to_string()))?;
        parent.add_child(name)
    }

    pub fn remove_node(&self, path: &str) -> Result<()> {
        let (parent_path, name) = split_node_path(path);
        let parent = self
            .get_node(parent_path)?
            .ok_or_else(|| StoreError::NoSuchNode(path.to_string()))?;
        parent.remove_child(name)
    }

    pub fn rename_node(&self, path: &str, new_name: &str) -> Result<()> {
        let (parent_path, name) = split_node_path(path);
        let parent = self
            .get_node(parent_path)?
            .ok_or_else(|| StoreError::NoSuchNode(path.to_string()))?;
        parent.rename_child(name, new_name)
    }

    //-------------------------------

    pub fn get_property<T: FromValue>(&self, path: &str) -> Result<Option<T>> {
        let (node_path, name) = split_path(path)?;
        let Some(node) = self.get_node(node_path)? else {
            return Ok(None);
        };
        node.get_property(name)
    }

    /// False when the node the path names does not exist.
    pub fn set_property(&self, path: &str, value: impl Into<Value>) -> Result<bool> {
        let (node_path, name) = split_path(path)?;
        let Some(node) = self.get_node(node_path)? else {
            return Ok(false);
        };
        node.set_property(name, value)?;
        Ok(true)
    }

    pub fn remove_property(&self, path: &str) -> Result<bool> {
        let (node_path, name) = split_path(path)?;
        let Some(node) = self.get_node(node_path)? else {
            return Ok(false);
        };
        node.remove_property(name)
    }
}

fn split_path(path: &str) -> Result<(&str, &str)> {
    split_property_path(path)
        .ok_or_else(|| StoreError::Logic(format!("'{}' is not a valid property path", path)))
}

fn unmount_in(
    trie: &mut MountNode,
    keys: &[String],
    volume: &Arc<Volume>,
    node_path: &str,
) -> Result<()> {
    let not_mounted = || StoreError::Logic("volume was not mounted at this point".to_string());

    if keys.is_empty() {
        let i = trie
            .mount_points
            .iter()
            .position(|mp| Arc::ptr_eq(&mp.volume, volume) && mp.node_path == node_path)
            .ok_or_else(not_mounted)?;
        trie.mount_points.remove(i);
        return Ok(());
    }

    let child = trie.nodes.get_mut(&keys[0]).ok_or_else(not_mounted)?;
    unmount_in(child, &keys[1..], volume, node_path)?;

    if child.mount_points.is_empty() && child.nodes.is_empty() {
        trie.nodes.remove(&keys[0]);
    }
    Ok(())
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
