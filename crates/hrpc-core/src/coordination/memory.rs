//! In-process coordination ensemble.
//!
//! [`MemoryEnsemble`] holds one node tree shared by every session created
//! from it with [`MemoryEnsemble::connect`]. It honours the same contract
//! as an external ensemble: ephemeral nodes vanish when their session is
//! closed or dropped, and every change to a child set is pushed to the
//! subscribed watchers in mutation order.

use super::{last_segment, parent_path, ChildEvent, Coordinator, CreateMode};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

struct Node {
    data: Vec<u8>,
    /// Owning session of an ephemeral node.
    owner: Option<u64>,
}

struct Watch {
    session: u64,
    events: mpsc::UnboundedSender<ChildEvent>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<Watch>>,
}

impl Tree {
    fn contains(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|key| parent_path(key) == Some(path))
            .filter_map(|key| last_segment(key).map(str::to_string))
            .collect()
    }

    /// Push the current child set of `path` to its watchers, dropping
    /// watchers whose receiver is gone.
    fn notify(&mut self, path: &str) {
        let children = self.children_of(path);
        if let Some(watches) = self.watches.get_mut(path) {
            watches.retain(|watch| {
                watch
                    .events
                    .send(ChildEvent {
                        path: path.to_string(),
                        children: children.clone(),
                    })
                    .is_ok()
            });
        }
    }
}

struct EnsembleInner {
    tree: Mutex<Tree>,
    available: AtomicBool,
    next_session: AtomicU64,
}

impl EnsembleInner {
    fn lock_tree(&self, path: &str) -> Result<MutexGuard<'_, Tree>> {
        self.tree
            .lock()
            .map_err(|_| RpcError::coordination(path, "Failed to acquire ensemble tree lock"))
    }
}

/// Shared node tree backing any number of sessions.
#[derive(Clone)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EnsembleInner {
                tree: Mutex::new(Tree::default()),
                available: AtomicBool::new(true),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new client session.
    pub fn connect(&self) -> MemoryCoordinator {
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        debug!("Opened coordination session {}", session);
        MemoryCoordinator {
            ensemble: Arc::clone(&self.inner),
            session,
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate the ensemble becoming unreachable (or reachable again).
    ///
    /// While unavailable every operation of every session fails with a
    /// coordination error; existing nodes and watches are kept.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of nodes currently in the tree, excluding the root.
    pub fn node_count(&self) -> usize {
        self.inner
            .tree
            .lock()
            .map(|tree| tree.nodes.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

/// One session against a [`MemoryEnsemble`].
pub struct MemoryCoordinator {
    ensemble: Arc<EnsembleInner>,
    session: u64,
    closed: AtomicBool,
}

impl MemoryCoordinator {
    pub fn session_id(&self) -> u64 {
        self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// End the session: remove its ephemeral nodes and its watches.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(mut tree) = self.ensemble.tree.lock() else {
            return;
        };

        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(self.session))
            .map(|(path, _)| path.clone())
            .collect();

        let mut parents = BTreeSet::new();
        for path in &owned {
            tree.nodes.remove(path);
            if let Some(parent) = parent_path(path) {
                parents.insert(parent.to_string());
            }
        }

        for watches in tree.watches.values_mut() {
            watches.retain(|watch| watch.session != self.session);
        }

        for parent in &parents {
            tree.notify(parent);
        }

        info!(
            "Closed coordination session {} ({} ephemeral nodes removed)",
            self.session,
            owned.len()
        );
    }

    fn check(&self, path: &str) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::coordination(path, "session closed"));
        }
        if !self.ensemble.available.load(Ordering::SeqCst) {
            return Err(RpcError::coordination(path, "connection loss"));
        }
        if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) {
            return Err(RpcError::coordination(path, "invalid node path"));
        }
        Ok(())
    }
}

impl Drop for MemoryCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn exists(&self, path: &str) -> Result<bool> {
        self.check(path)?;
        let tree = self.ensemble.lock_tree(path)?;
        Ok(tree.contains(path))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<()> {
        self.check(path)?;
        let parent = parent_path(path).ok_or_else(|| RpcError::NodeExists {
            path: path.to_string(),
        })?;

        let mut tree = self.ensemble.lock_tree(path)?;
        if tree.contains(path) {
            return Err(RpcError::NodeExists {
                path: path.to_string(),
            });
        }
        if !tree.contains(parent) {
            return Err(RpcError::NoNode {
                path: parent.to_string(),
            });
        }
        if tree.nodes.get(parent).is_some_and(|node| node.owner.is_some()) {
            return Err(RpcError::coordination(
                path,
                "ephemeral nodes cannot have children",
            ));
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session),
        };
        tree.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                owner,
            },
        );
        tree.notify(parent);

        debug!("Created {:?} node {}", mode, path);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check(path)?;
        let tree = self.ensemble.lock_tree(path)?;
        if !tree.contains(path) {
            return Err(RpcError::NoNode {
                path: path.to_string(),
            });
        }
        Ok(tree.children_of(path))
    }

    async fn read_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check(path)?;
        let tree = self.ensemble.lock_tree(path)?;
        Ok(tree.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn watch_children(
        &self,
        path: &str,
        events: mpsc::UnboundedSender<ChildEvent>,
    ) -> Result<()> {
        self.check(path)?;
        let mut tree = self.ensemble.lock_tree(path)?;
        tree.watches.entry(path.to_string()).or_default().push(Watch {
            session: self.session,
            events,
        });
        Ok(())
    }
}
