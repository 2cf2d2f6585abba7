//! Cluster communication contract.
//!
//! The core consumes cluster messaging as a capability: point-to-point
//! request/response (`send_and_receive`) plus subject subscriptions. The
//! transport itself is delegated; [`local::LocalCluster`] is the bundled
//! in-process implementation used by single-node deployments and by tests
//! that simulate several nodes in one process.

pub mod local;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::LocalCluster;

/// Identity of a controller node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from a name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A member of the controller cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerNode {
    /// The node's cluster-wide identity.
    pub id: NodeId,
}

/// A named message channel within the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageSubject(String);

impl MessageSubject {
    /// Creates a subject from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the subject name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handler invoked for every message received on a subscribed subject.
///
/// The returned bytes travel back to the sender; `None` maps to an empty
/// payload. Handlers run on the subscription's dispatch task, off the
/// sender's path.
pub type MessageHandler = Arc<dyn Fn(Bytes) -> Option<Bytes> + Send + Sync>;

/// Cluster membership view.
pub trait ClusterService: Send + Sync {
    /// Returns the local node.
    fn local_node(&self) -> ControllerNode;

    /// Returns all current cluster members, the local node included.
    fn nodes(&self) -> Vec<ControllerNode>;
}

/// Point-to-point cluster messaging.
pub trait ClusterCommunicator: Send + Sync {
    /// Sends `payload` on `subject` to `to` and resolves with the peer's
    /// response bytes.
    fn send_and_receive(
        &self,
        subject: &MessageSubject,
        payload: Bytes,
        to: &NodeId,
    ) -> BoxFuture<'static, Result<Bytes, ClusterError>>;

    /// Registers `handler` for messages addressed to this node on `subject`.
    /// A later registration for the same subject replaces the earlier one.
    fn subscribe(&self, subject: MessageSubject, handler: MessageHandler);
}

/// Errors surfaced by cluster messaging.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// The target node is not a cluster member.
    #[error("unknown cluster node: {node}")]
    UnknownNode {
        /// The node that could not be resolved.
        node: NodeId,
    },

    /// The target node has no handler for the subject.
    #[error("no subscriber for subject {subject} on node {node}")]
    NoSubscriber {
        /// The subject without a handler.
        subject: MessageSubject,
        /// The node addressed.
        node: NodeId,
    },

    /// The target node stopped responding mid-exchange.
    #[error("node {node} is unreachable")]
    Unreachable {
        /// The node addressed.
        node: NodeId,
    },
}
