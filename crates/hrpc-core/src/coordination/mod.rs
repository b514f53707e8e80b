//! Coordination service contract.
//!
//! The registry only needs a handful of primitives from a strongly
//! consistent tree store: create, exists, list children, read data, and a
//! renewing child-change subscription. [`Coordinator`] is that contract;
//! one instance corresponds to one client session, and ephemeral nodes live
//! exactly as long as the session that created them.
//!
//! # Tree layout
//!
//! ```text
//! <registry_path>/
//!   <service_name>/        (persistent)
//!     <address>            (ephemeral, data = address)
//! ```

pub mod memory;

pub use memory::{MemoryCoordinator, MemoryEnsemble};

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed automatically when the creating session ends.
    Ephemeral,
}

/// Notification that the child set of `path` changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEvent {
    /// The watched node.
    pub path: String,
    /// Child names at the time of the change; empty if the node is gone.
    pub children: Vec<String>,
}

/// Session-scoped client of a coordination service.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Check whether a node exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create a node. Fails with `NodeExists` if it is already present and
    /// with `NoNode` if its parent is missing.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<()>;

    /// List the names of a node's children. Fails with `NoNode` if absent.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Read a node's data; `None` if the node does not exist.
    async fn read_data(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Subscribe to child-set changes of `path`.
    ///
    /// The subscription renews itself after every notification and stays
    /// active until `events` is closed or the session ends. The path does
    /// not need to exist yet.
    async fn watch_children(&self, path: &str, events: mpsc::UnboundedSender<ChildEvent>)
        -> Result<()>;
}

/// Join a parent node path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}

/// Last segment of a node path, e.g. the service name of
/// `/registry/EchoService`.
pub fn last_segment(path: &str) -> Option<&str> {
    path.rsplit('/').next().filter(|segment| !segment.is_empty())
}

/// Parent of a node path; `None` for the root and for relative paths.
pub fn parent_path(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        if path.len() > 1 {
            Some("/")
        } else {
            None
        }
    } else {
        Some(&path[..idx])
    }
}
