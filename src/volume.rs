use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::errors::{logic_error, Result};
use crate::node::{remove_by_id_path, Node};
use crate::ttl::{RemovalTree, TtlManager};
use crate::volume_file::{NodeId, VolumeFile, NO_RECORD};

//-------------------------------------------------------------------------

/// What a node needs from the volume it lives in.
pub(crate) struct VolumeCtx {
    pub file: Arc<VolumeFile>,
    pub ttl: Arc<TtlManager>,
}

#[derive(Default)]
struct MountState {
    storage_id: Option<u64>,
    count: usize,
}

/// One volume file, its root node, and the TTL worker that prunes expired
/// nodes.  Dropping the volume joins the worker.
pub struct Volume {
    ctx: Arc<VolumeCtx>,
    root: Arc<Node>,
    mounts: Mutex<MountState>,
}

impl Volume {
    pub fn open(path: impl AsRef<Path>, create_if_not_exist: bool) -> Result<Arc<Volume>> {
        let path = path.as_ref();

        if create_if_not_exist && !VolumeFile::exists(path) {
            info!("creating volume at {}", path.display());
            VolumeFile::create(path)?;
            let file = Arc::new(VolumeFile::open(path)?);

            let tree = RemovalTree::create(file.clone())?;
            file.set_ttl_tree_record_id(tree.record_id())?;
            let ttl = Arc::new(TtlManager::new(tree));

            let ctx = Arc::new(VolumeCtx { file, ttl });
            let root = Node::create(None, ctx.clone())?;
            return Ok(Self::finish(ctx, root));
        }

        debug!("opening volume at {}", path.display());
        let file = Arc::new(VolumeFile::open(path)?);

        let root_record_id = file.root_record_id();
        if root_record_id == NO_RECORD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "volume has no root node").into());
        }

        let tree = RemovalTree::open(file.clone(), file.ttl_tree_record_id())?;
        let ttl = Arc::new(TtlManager::new(tree));

        let ctx = Arc::new(VolumeCtx {
            file: file.clone(),
            ttl,
        });
        let root = Node::load(None, ctx.clone(), root_record_id)?;
        Ok(Self::finish(ctx, root))
    }

    fn finish(ctx: Arc<VolumeCtx>, root: Arc<Node>) -> Arc<Volume> {
        let volume = Arc::new(Volume {
            ctx,
            root,
            mounts: Mutex::new(MountState::default()),
        });
        volume.ctx.ttl.start(Arc::downgrade(&volume.root));
        volume
    }

    pub fn get_node(&self, path: &str) -> Result<Option<Arc<Node>>> {
        self.root.get_node(path)
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    #[cfg(test)]
    pub(crate) fn file(&self) -> &Arc<VolumeFile> {
        &self.ctx.file
    }

    /// Removal by stable-id path, used when deadlines fire.
    pub fn remove_node(&self, path: &[NodeId]) -> Result<bool> {
        remove_by_id_path(&self.root, path)
    }

    //-------------------------------

    pub(crate) fn bind_storage(&self, storage_id: u64) -> Result<()> {
        let mut mounts = self.mounts.lock().unwrap();
        match mounts.storage_id {
            Some(id) if id != storage_id => {
                logic_error("can't mount a volume on more than one storage at a time")
            }
            _ => {
                mounts.storage_id = Some(storage_id);
                mounts.count += 1;
                Ok(())
            }
        }
    }

    pub(crate) fn unbind_storage(&self) {
        let mut mounts = self.mounts.lock().unwrap();
        mounts.count = mounts.count.saturating_sub(1);
        if mounts.count == 0 {
            mounts.storage_id = None;
        }
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        self.ctx.ttl.shutdown();
    }
}

//-------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{ensure, Result};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use test_log::test;

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_create_and_reopen() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("volume");

        {
            let volume = Volume::open(&path, true)?;
            let a = volume.root().add_child("a")?;
            let b = a.add_child("b")?;
            b.set_property("k", "x")?;
        }

        let volume = Volume::open(&path, false)?;
        let b = volume.get_node("a.b")?.unwrap();
        ensure!(b.get_property::<String>("k")? == Some("x".to_string()));
        Ok(())
    }

    #[test]
    fn test_open_missing_volume_fails() -> Result<()> {
        let temp_dir = TempDir::new()?;
        ensure!(Volume::open(temp_dir.path().join("absent"), false).is_err());
        Ok(())
    }

    #[test]
    fn test_remove_node_by_id_path() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let volume = Volume::open(temp_dir.path().join("volume"), true)?;

        let a = volume.root().add_child("a")?;
        let b = a.add_child("b")?;

        let path = vec![volume.root().node_id(), a.node_id(), b.node_id()];
        ensure!(volume.remove_node(&path)?);
        ensure!(b.is_deleted());
        ensure!(!volume.remove_node(&path)?);

        // a missing hop is not an error
        let bogus = vec![volume.root().node_id(), 9999, 10000];
        ensure!(!volume.remove_node(&bogus)?);
        Ok(())
    }

    #[test]
    fn test_ttl_on_root_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let volume = Volume::open(temp_dir.path().join("volume"), true)?;
        ensure!(volume
            .root()
            .set_time_to_live(Duration::from_millis(10))
            .is_err());
        Ok(())
    }

    #[test]
    fn test_ttl_expiry_order_and_cascade() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let volume = Volume::open(temp_dir.path().join("volume"), true)?;

        let node1 = volume.root().add_child("n1")?;
        let node2 = volume.root().add_child("n2")?;
        node1.set_time_to_live(Duration::from_millis(1500))?;
        node2.set_time_to_live(Duration::from_millis(100))?;
        let node3 = node1.add_child("n3")?;

        ensure!(wait_until(Duration::from_secs(5), || node2.is_deleted()));
        ensure!(!node1.is_deleted());
        ensure!(!node3.is_deleted());

        // node3 goes with its parent's subtree
        ensure!(wait_until(Duration::from_secs(10), || node1.is_deleted()));
        ensure!(wait_until(Duration::from_secs(10), || node3.is_deleted()));
        ensure!(volume.get_node("n1")?.is_none());
        Ok(())
    }

    #[test]
    fn test_ttl_reschedule_overrides_earlier_deadline() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let volume = Volume::open(temp_dir.path().join("volume"), true)?;

        let node = volume.root().add_child("n")?;
        node.set_time_to_live(Duration::from_millis(100))?;
        node.set_time_to_live(Duration::from_secs(600))?;

        std::thread::sleep(Duration::from_millis(400));
        ensure!(!node.is_deleted());
        Ok(())
    }

    #[test]
    fn test_removed_node_cancels_ttl() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let volume = Volume::open(temp_dir.path().join("volume"), true)?;

        let node = volume.root().add_child("n")?;
        node.set_time_to_live(Duration::from_millis(200))?;
        volume.root().remove_child("n")?;
        ensure!(node.is_deleted());

        // the worker finds nothing to do once the entry is cancelled
        std::thread::sleep(Duration::from_millis(400));
        ensure!(volume.get_node("n")?.is_none());
        Ok(())
    }

    #[test]
    fn test_deep_chain_removal() -> Result<()> {
        // Subtree deletion is iterative, so a chain far deeper than any
        // sane call stack budget must come apart cleanly.
        let temp_dir = TempDir::new()?;
        let volume = Volume::open(temp_dir.path().join("volume"), true)?;

        let top = volume.root().add_child("c")?;
        let mut node = top.clone();
        let mut handles = vec![top.clone()];
        for _ in 0..300 {
            node = node.add_child("c")?;
            handles.push(node.clone());
        }
        node.set_property("tail", 1i32)?;

        volume.root().remove_child("c")?;
        for handle in &handles {
            ensure!(handle.is_deleted());
        }
        ensure!(volume.get_node("c")?.is_none());
        Ok(())
    }

    #[test]
    fn test_concurrent_writers() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("volume");

        {
            let volume = Volume::open(&path, true)?;
            let mut workers = Vec::new();
            for t in 0..8 {
                let volume = volume.clone();
                workers.push(std::thread::spawn(move || {
                    let child = volume.root().add_child(&format!("t{}", t)).unwrap();
                    for i in 0..20 {
                        child.set_property(&format!("p{}", i), i as i64).unwrap();
                    }
                }));
            }
            for worker in workers {
                worker.join().unwrap();
            }

            for t in 0..8 {
                let child = volume.get_node(&format!("t{}", t))?.unwrap();
                for i in 0..20i64 {
                    ensure!(child.get_property::<i64>(&format!("p{}", i))? == Some(i));
                }
            }
        }

        // every rewrite chained correctly up to the header
        let volume = Volume::open(&path, false)?;
        for t in 0..8 {
            let child = volume.get_node(&format!("t{}", t))?.unwrap();
            for i in 0..20i64 {
                ensure!(child.get_property::<i64>(&format!("p{}", i))? == Some(i));
            }
        }
        Ok(())
    }

    #[test]
    fn test_concurrent_churn_on_one_node() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let volume = Volume::open(temp_dir.path().join("volume"), true)?;
        let hub = volume.root().add_child("hub")?;

        let mut workers = Vec::new();
        for t in 0..4 {
            let hub = hub.clone();
            workers.push(std::thread::spawn(move || {
                for i in 0..30 {
                    let name = format!("n{}-{}", t, i);
                    let child = hub.add_child(&name).unwrap();
                    child.set_property("v", i as i32).unwrap();
                    if i % 3 == 0 {
                        hub.remove_child(&name).unwrap();
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        for t in 0..4 {
            for i in 0..30 {
                let survives = i % 3 != 0;
                let child = hub.get_child(&format!("n{}-{}", t, i))?;
                ensure!(child.is_some() == survives);
            }
        }
        Ok(())
    }

    #[test]
    fn test_ttl_survives_reopen() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("volume");

        {
            let volume = Volume::open(&path, true)?;
            let node = volume.root().add_child("doomed")?;
            node.set_time_to_live(Duration::from_millis(150))?;
        }

        // the deadline is persisted in the removal index and fires after
        // reopening
        let volume = Volume::open(&path, false)?;
        ensure!(wait_until(Duration::from_secs(5), || {
            volume.get_node("doomed").map(|n| n.is_none()).unwrap_or(false)
        }));
        Ok(())
    }
}

//-------------------------------------------------------------------------
