use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::errors::{logic_error, Result, StoreError};
use crate::pack::{now_millis, pack_to_vec, Pack, Timestamp};
use crate::paths::next_sub_key;
use crate::property::{BlobProperty, FromValue, PropertyValue, Value};
use crate::volume::VolumeCtx;
use crate::volume_file::{NodeId, RecordId, NO_RECORD};

//-------------------------------------------------------------------------

fn check_name(name: &str) -> Result<()> {
    if name.contains('.') {
        return logic_error(format!("name '{}' must not contain dots", name));
    }
    Ok(())
}

//-------------------------------------------------------------------------

struct ChildEntry {
    record_id: RecordId,
    node_id: NodeId,

    // Cache of the materialized child; the strong handle goes to the caller.
    node: Weak<Node>,
}

impl Pack for ChildEntry {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.record_id.pack(w)?;
        self.node_id.pack(w)
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let record_id = RecordId::unpack(r)?;
        let node_id = NodeId::unpack(r)?;
        Ok(Self {
            record_id,
            node_id,
            node: Weak::new(),
        })
    }
}

//-------------------------------------------------------------------------

struct NodeInner {
    // Dropped when the node is deleted; present otherwise.
    ctx: Option<Arc<VolumeCtx>>,

    record_id: RecordId,
    time_to_remove: Timestamp,

    children: HashMap<String, ChildEntry>,
    names_by_id: HashMap<NodeId, String>,
    properties: HashMap<String, PropertyValue>,
}

// The child table is serialized first so a record-id-only update can rewrite
// it in place: same names, same entry widths, same byte length.
fn encode(inner: &NodeInner, node_id: NodeId) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    inner.children.pack(&mut buf)?;
    inner.properties.pack(&mut buf)?;
    node_id.pack(&mut buf)?;
    inner.time_to_remove.pack(&mut buf)?;
    Ok(buf)
}

//-------------------------------------------------------------------------

/// One node of the hierarchical store, persisted as a single record.  The
/// record id lives in exactly one place on disk (the parent's child table,
/// or the volume header for the root) and every rewrite keeps that single
/// reference current.
pub struct Node {
    node_id: NodeId,
    parent: Option<Arc<Node>>,
    inner: Mutex<NodeInner>,
}

impl Node {
    pub(crate) fn create(parent: Option<Arc<Node>>, ctx: Arc<VolumeCtx>) -> Result<Arc<Node>> {
        let node_id = ctx.file.allocate_next_node_id()?;
        let is_root = parent.is_none();

        let node = Arc::new(Node {
            node_id,
            parent,
            inner: Mutex::new(NodeInner {
                ctx: Some(ctx.clone()),
                record_id: NO_RECORD,
                time_to_remove: 0,
                children: HashMap::new(),
                names_by_id: HashMap::new(),
                properties: HashMap::new(),
            }),
        });

        {
            let mut inner = node.inner.lock().unwrap();
            let buf = encode(&inner, node_id)?;
            inner.record_id = ctx.file.allocate_record(&buf)?;
            if is_root {
                ctx.file.set_root_record_id(inner.record_id)?;
            }
        }

        Ok(node)
    }

    pub(crate) fn load(
        parent: Option<Arc<Node>>,
        ctx: Arc<VolumeCtx>,
        record_id: RecordId,
    ) -> Result<Arc<Node>> {
        let (children, properties, node_id, time_to_remove) =
            ctx.file.read_record(record_id, |r| {
                let children: HashMap<String, ChildEntry> = Pack::unpack(r)?;
                let properties: HashMap<String, PropertyValue> = Pack::unpack(r)?;
                let node_id = NodeId::unpack(r)?;
                let time_to_remove = Timestamp::unpack(r)?;
                Ok((children, properties, node_id, time_to_remove))
            })?;

        let mut names_by_id = HashMap::new();
        for (name, entry) in &children {
            names_by_id.insert(entry.node_id, name.clone());
        }

        Ok(Arc::new(Node {
            node_id,
            parent,
            inner: Mutex::new(NodeInner {
                ctx: Some(ctx),
                record_id,
                time_to_remove,
                children,
                names_by_id,
                properties,
            }),
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// True once the node's record has been freed.
    pub fn is_deleted(&self) -> bool {
        self.inner.lock().unwrap().record_id == NO_RECORD
    }

    //-------------------------------

    pub fn get_child(self: &Arc<Self>, name: &str) -> Result<Option<Arc<Node>>> {
        let mut inner = self.inner.lock().unwrap();
        self.get_child_locked(&mut inner, name)
    }

    fn get_child_locked(
        self: &Arc<Self>,
        inner: &mut NodeInner,
        name: &str,
    ) -> Result<Option<Arc<Node>>> {
        let Some(entry) = inner.children.get(name) else {
            return Ok(None);
        };

        if let Some(child) = entry.node.upgrade() {
            return Ok(Some(child));
        }

        let Some(ctx) = inner.ctx.clone() else {
            return Ok(None);
        };

        let record_id = entry.record_id;
        let node_id = entry.node_id;
        let child = Node::load(Some(self.clone()), ctx, record_id)?;
        debug_assert_eq!(child.node_id, node_id);

        if let Some(entry) = inner.children.get_mut(name) {
            entry.node = Arc::downgrade(&child);
        }
        Ok(Some(child))
    }

    pub fn add_child(self: &Arc<Self>, name: &str) -> Result<Arc<Node>> {
        check_name(name)?;

        let mut inner = self.inner.lock().unwrap();
        let Some(ctx) = inner.ctx.clone() else {
            return logic_error("node has been removed");
        };
        if inner.children.contains_key(name) {
            return Err(StoreError::NodeAlreadyExists(name.to_string()));
        }

        let child = Node::create(Some(self.clone()), ctx)?;
        let child_record_id = child.inner.lock().unwrap().record_id;

        inner.children.insert(
            name.to_string(),
            ChildEntry {
                record_id: child_record_id,
                node_id: child.node_id,
                node: Arc::downgrade(&child),
            },
        );
        inner.names_by_id.insert(child.node_id, name.to_string());

        self.commit(inner)?;
        Ok(child)
    }

    pub fn remove_child(self: &Arc<Self>, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.remove_child_locked(&mut inner, name)?;
        self.commit(inner)
    }

    pub fn rename_child(self: &Arc<Self>, name: &str, new_name: &str) -> Result<()> {
        check_name(new_name)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.ctx.is_none() {
            return logic_error("node has been removed");
        }
        if !inner.children.contains_key(name) {
            return Err(StoreError::NoSuchNode(name.to_string()));
        }
        if inner.children.contains_key(new_name) {
            return Err(StoreError::NodeAlreadyExists(new_name.to_string()));
        }

        let entry = inner.children.remove(name).unwrap();
        inner.names_by_id.insert(entry.node_id, new_name.to_string());
        inner.children.insert(new_name.to_string(), entry);

        self.commit(inner)
    }

    /// Dotted-path descent from this node; None on any missing segment.
    pub fn get_node(self: &Arc<Self>, path: &str) -> Result<Option<Arc<Node>>> {
        let mut node = self.clone();
        let mut pos = 0;
        while pos < path.len() {
            let (sub_key, next) = next_sub_key(path, pos);
            match node.get_child(sub_key)? {
                Some(child) => node = child,
                None => return Ok(None),
            }
            pos = next;
        }
        Ok(Some(node))
    }

    //-------------------------------

    pub fn set_property(self: &Arc<Self>, name: &str, value: impl Into<Value>) -> Result<()> {
        check_name(name)?;
        let value = value.into();

        let mut inner = self.inner.lock().unwrap();
        let Some(ctx) = inner.ctx.clone() else {
            return logic_error("node has been removed");
        };

        let stored = match value {
            Value::I32(v) => PropertyValue::I32(v),
            Value::U32(v) => PropertyValue::U32(v),
            Value::I64(v) => PropertyValue::I64(v),
            Value::U64(v) => PropertyValue::U64(v),
            Value::F32(v) => PropertyValue::F32(v),
            Value::F64(v) => PropertyValue::F64(v),
            Value::Str(v) => PropertyValue::Str(v),
            Value::Bytes(v) => PropertyValue::Blob(BlobProperty::store(&ctx.file, &v)?),
        };

        // A replaced blob's side record is freed, always.
        if let Some(PropertyValue::Blob(old)) = inner.properties.insert(name.to_string(), stored) {
            old.remove(&ctx.file)?;
        }

        self.commit(inner)
    }

    pub fn get_property<T: FromValue>(&self, name: &str) -> Result<Option<T>> {
        let inner = self.inner.lock().unwrap();
        let Some(value) = inner.properties.get(name) else {
            return Ok(None);
        };

        match value {
            PropertyValue::Blob(blob) if T::IS_BYTES => {
                let Some(ctx) = &inner.ctx else {
                    return Ok(None);
                };
                let bytes = blob.load(&ctx.file)?;
                Ok(T::from_bytes(bytes))
            }
            other => Ok(T::from_value(other)),
        }
    }

    pub fn remove_property(self: &Arc<Self>, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(ctx) = inner.ctx.clone() else {
            return logic_error("node has been removed");
        };

        let Some(old) = inner.properties.remove(name) else {
            return Ok(false);
        };
        if let PropertyValue::Blob(blob) = old {
            blob.remove(&ctx.file)?;
        }

        self.commit(inner)?;
        Ok(true)
    }

    //-------------------------------

    /// Schedules this node for deletion `ttl` from now, replacing any
    /// earlier schedule.
    pub fn set_time_to_live(self: &Arc<Self>, ttl: Duration) -> Result<()> {
        if self.parent.is_none() {
            return logic_error("can't set a time to live on the root node");
        }

        let mut inner = self.inner.lock().unwrap();
        let Some(ctx) = inner.ctx.clone() else {
            return logic_error("node has been removed");
        };

        let previous = inner.time_to_remove;
        let deadline = now_millis() + ttl.as_millis() as i64;
        inner.time_to_remove = deadline;

        self.commit(inner)?;
        ctx.ttl
            .set_time_to_remove(&self.unique_path(), deadline, previous)
    }

    /// Node ids from the root down to this node.  Identities are immutable,
    /// so the parent chain can be read without locks.
    pub(crate) fn unique_path(self: &Arc<Self>) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(node) = cur {
            ids.push(node.node_id);
            cur = node.parent.clone();
        }
        ids.reverse();
        ids
    }

    //-------------------------------

    pub(crate) fn child_by_id(self: &Arc<Self>, child_node_id: NodeId) -> Result<Option<Arc<Node>>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(name) = inner.names_by_id.get(&child_node_id).cloned() else {
            return Ok(None);
        };
        self.get_child_locked(&mut inner, &name)
    }

    pub(crate) fn remove_child_by_id(self: &Arc<Self>, child_node_id: NodeId) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(name) = inner.names_by_id.get(&child_node_id).cloned() else {
            return Ok(false);
        };
        self.remove_child_locked(&mut inner, &name)?;
        self.commit(inner)?;
        Ok(true)
    }

    fn remove_child_locked(self: &Arc<Self>, inner: &mut NodeInner, name: &str) -> Result<()> {
        let Some(ctx) = inner.ctx.clone() else {
            return logic_error("node has been removed");
        };
        let Some(entry) = inner.children.get(name) else {
            return Err(StoreError::NoSuchNode(name.to_string()));
        };

        let child = match entry.node.upgrade() {
            Some(child) => child,
            None => Node::load(Some(self.clone()), ctx, entry.record_id)?,
        };
        delete_subtree(child)?;

        let entry = inner.children.remove(name).unwrap();
        inner.names_by_id.remove(&entry.node_id);
        Ok(())
    }

    //-------------------------------

    /// Serializes and rewrites this node's record, then propagates a changed
    /// record id to its single on-disk reference.  The parent is only locked
    /// after our own guard is dropped, keeping lock acquisition in descent
    /// order.
    fn commit(self: &Arc<Self>, mut inner: MutexGuard<'_, NodeInner>) -> Result<()> {
        let moved = self.update_locked(&mut inner)?;
        drop(inner);

        if let Some(new_id) = moved {
            if let Some(parent) = &self.parent {
                parent.child_record_id_updated(self.node_id, new_id)?;
            }
        }
        Ok(())
    }

    fn update_locked(&self, inner: &mut NodeInner) -> Result<Option<RecordId>> {
        if inner.record_id == NO_RECORD {
            return Ok(None);
        }
        let Some(ctx) = inner.ctx.clone() else {
            return Ok(None);
        };

        let buf = encode(inner, self.node_id)?;
        let old = inner.record_id;
        let new = ctx.file.resize_record(old, &buf)?;
        if new == old {
            return Ok(None);
        }
        inner.record_id = new;

        if self.parent.is_none() {
            ctx.file.set_root_record_id(new)?;
            Ok(None)
        } else {
            Ok(Some(new))
        }
    }

    /// A child landed in a new slot; repoint its child-table entry and
    /// rewrite the table in place.  Never fails a rewrite because this node
    /// has moved on: a child that was removed in the meantime is simply
    /// ignored.
    fn child_record_id_updated(&self, child_node_id: NodeId, new_record_id: RecordId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let Some(name) = inner.names_by_id.get(&child_node_id).cloned() else {
            return Ok(());
        };

        // Notifications from concurrent saves can arrive out of order; the
        // materialized child's current id wins over the notified one.
        let current = inner
            .children
            .get(&name)
            .and_then(|e| e.node.upgrade())
            .map(|child| child.inner.lock().unwrap().record_id);

        let id = match current {
            Some(id) if id != NO_RECORD => id,
            _ => new_record_id,
        };

        if let Some(entry) = inner.children.get_mut(&name) {
            entry.record_id = id;
        }
        self.save_children_locked(&mut inner)
    }

    fn save_children_locked(&self, inner: &mut NodeInner) -> Result<()> {
        if inner.record_id == NO_RECORD || inner.ctx.is_none() {
            return Ok(());
        }
        let ctx = inner.ctx.clone().unwrap();
        let buf = pack_to_vec(&inner.children)?;
        ctx.file.write_record(inner.record_id, &buf)
    }
}

//-------------------------------------------------------------------------

/// Walks `path` (node ids, root first) by stable identity and removes the
/// node at its end.  False when any hop is already gone.
pub(crate) fn remove_by_id_path(root: &Arc<Node>, path: &[NodeId]) -> Result<bool> {
    if path.len() < 2 || root.node_id() != path[0] {
        return Ok(false);
    }

    let mut node = root.clone();
    for id in &path[1..path.len() - 1] {
        match node.child_by_id(*id)? {
            Some(child) => node = child,
            None => return Ok(false),
        }
    }
    node.remove_child_by_id(path[path.len() - 1])
}

//-------------------------------------------------------------------------

struct PendingDelete {
    node: Arc<Node>,
    expanded: bool,
}

/// Frees a whole subtree: every node record and every blob side record, with
/// pending TTL entries cancelled on the way.  Children are processed before
/// their parent.  An explicit stack bounds the call depth; deletion is
/// idempotent on the deleted sentinel, so revisits are no-ops.
fn delete_subtree(start: Arc<Node>) -> Result<()> {
    let mut stack = vec![PendingDelete {
        node: start,
        expanded: false,
    }];

    while !stack.is_empty() {
        let top = stack.len() - 1;
        let node = stack[top].node.clone();
        let expanded = stack[top].expanded;

        let mut inner = node.inner.lock().unwrap();

        if inner.record_id == NO_RECORD {
            drop(inner);
            stack.pop();
            continue;
        }

        let Some(ctx) = inner.ctx.clone() else {
            drop(inner);
            stack.pop();
            continue;
        };

        if !expanded {
            stack[top].expanded = true;

            let mut children = Vec::new();
            for entry in inner.children.values() {
                let child = match entry.node.upgrade() {
                    Some(child) => child,
                    None => Node::load(Some(node.clone()), ctx.clone(), entry.record_id)?,
                };
                children.push(child);
            }
            drop(inner);

            stack.extend(children.into_iter().map(|node| PendingDelete {
                node,
                expanded: false,
            }));
            continue;
        }

        // Children are gone; release this node's storage.
        if inner.time_to_remove != 0 {
            ctx.ttl
                .set_time_to_remove(&node.unique_path(), 0, inner.time_to_remove)?;
        }
        ctx.file.free_record(inner.record_id)?;
        for value in inner.properties.values() {
            if let PropertyValue::Blob(blob) = value {
                blob.remove(&ctx.file)?;
            }
        }

        inner.record_id = NO_RECORD;
        inner.ctx = None;
        drop(inner);
        stack.pop();
    }

    Ok(())
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
