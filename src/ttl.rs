use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

use crate::bptree::BpTree;
use crate::errors::Result;
use crate::node::{remove_by_id_path, Node};
use crate::pack::{now_millis, Pack, Timestamp};
use crate::volume_file::NodeId;

//-------------------------------------------------------------------------

/// Keys order pending removals by deadline, with the stable node id breaking
/// ties between nodes sharing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct RemovalKey {
    pub deadline: Timestamp,
    pub node_id: NodeId,
}

impl Pack for RemovalKey {
    fn pack<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.deadline.pack(w)?;
        self.node_id.pack(w)
    }

    fn unpack<R: Read>(r: &mut R) -> io::Result<Self> {
        let deadline = Timestamp::unpack(r)?;
        let node_id = NodeId::unpack(r)?;
        Ok(Self { deadline, node_id })
    }
}

/// Value = the node's unique path as node ids from the root, so the worker
/// can find it again however it has been renamed.
pub(crate) type RemovalTree = BpTree<RemovalKey, Vec<NodeId>>;

//-------------------------------------------------------------------------

struct TtlState {
    tree: RemovalTree,
    exit: bool,

    // 0 while idle or the tree is empty
    next_time_to_remove: Timestamp,
}

struct TtlShared {
    state: Mutex<TtlState>,
    work_ready: Condvar,
}

/// Owns the worker thread that consumes the removal tree and drives
/// deletions when deadlines pass.
pub(crate) struct TtlManager {
    shared: Arc<TtlShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TtlManager {
    pub fn new(tree: RemovalTree) -> Self {
        Self {
            shared: Arc::new(TtlShared {
                state: Mutex::new(TtlState {
                    tree,
                    exit: false,
                    next_time_to_remove: 0,
                }),
                work_ready: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// The worker only holds a weak root reference: dropping the volume can
    /// join the thread without a cycle keeping either alive.
    pub fn start(&self, root: Weak<Node>) {
        let shared = self.shared.clone();
        let handle = std::thread::spawn(move || worker_loop(shared, root));
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.exit = true;
        }
        self.shared.work_ready.notify_all();

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Reschedules (or cancels, deadline 0) the removal of the node at
    /// `path`.  The worker is nudged whenever the wakeup it sleeps toward
    /// is affected.
    pub fn set_time_to_remove(
        &self,
        path: &[NodeId],
        time_to_remove: Timestamp,
        previous: Timestamp,
    ) -> Result<()> {
        let Some(&node_id) = path.last() else {
            return Ok(());
        };
        let mut state = self.shared.state.lock().unwrap();

        if previous != 0 {
            state.tree.remove(&RemovalKey {
                deadline: previous,
                node_id,
            })?;
            if state.next_time_to_remove == previous {
                self.shared.work_ready.notify_all();
            }
        }

        if time_to_remove != 0 {
            state.tree.insert(
                RemovalKey {
                    deadline: time_to_remove,
                    node_id,
                },
                path.to_vec(),
            )?;
            if state.next_time_to_remove == 0 || state.next_time_to_remove > time_to_remove {
                self.shared.work_ready.notify_all();
            }
        }

        Ok(())
    }
}

//-------------------------------------------------------------------------

fn worker_loop(shared: Arc<TtlShared>, root: Weak<Node>) {
    loop {
        let mut state = shared.state.lock().unwrap();
        if state.exit {
            break;
        }

        let first = match state.tree.get_first() {
            Ok(first) => first,
            Err(e) => {
                warn!("scan of the removal index failed: {}", e);
                None
            }
        };

        let Some((key, path)) = first else {
            state.next_time_to_remove = 0;
            let _state = shared.work_ready.wait(state).unwrap();
            continue;
        };

        let now = now_millis();
        if key.deadline > now {
            state.next_time_to_remove = key.deadline;
            let timeout = Duration::from_millis((key.deadline - now) as u64);
            let (state, _timed_out) = shared.work_ready.wait_timeout(state, timeout).unwrap();
            // whether signalled or expired, re-peek: an earlier deadline or
            // a cancellation may have come in
            drop(state);
            continue;
        }
        drop(state);

        // The deletion itself runs without the manager lock.  A node the
        // user already removed is simply not found.
        if let Some(root) = root.upgrade() {
            if let Err(e) = remove_by_id_path(&root, &path) {
                warn!("scheduled removal failed: {}", e);
            }
        }

        let mut state = shared.state.lock().unwrap();
        state.next_time_to_remove = 0;
        if let Err(e) = state.tree.remove(&key) {
            warn!("dropping expired key from the removal index failed: {}", e);
        }
    }
}

//-------------------------------------------------------------------------
