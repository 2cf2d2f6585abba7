//! In-process cluster transport.
//!
//! [`LocalCluster`] is a hub that hands out [`LocalClusterNode`] handles.
//! Handles joined to the same hub can exchange messages exactly as separate
//! processes would over a real transport, which is how multi-node behavior
//! (application bits transfer, most notably) is exercised in tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::{
    ClusterCommunicator, ClusterError, ClusterService, ControllerNode, MessageHandler,
    MessageSubject, NodeId,
};

struct Envelope {
    payload: Bytes,
    reply: oneshot::Sender<Option<Bytes>>,
}

type SubjectSenders = HashMap<MessageSubject, mpsc::UnboundedSender<Envelope>>;

#[derive(Default)]
struct Hub {
    nodes: Mutex<HashMap<NodeId, SubjectSenders>>,
}

/// An in-process cluster of [`LocalClusterNode`] handles.
#[derive(Clone, Default)]
pub struct LocalCluster {
    hub: Arc<Hub>,
}

impl LocalCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins a node to the cluster and returns its handle.
    pub fn join(&self, id: impl Into<String>) -> LocalClusterNode {
        let id = NodeId::new(id);
        self.hub
            .nodes
            .lock()
            .expect("cluster hub lock poisoned")
            .entry(id.clone())
            .or_default();
        LocalClusterNode {
            id,
            hub: Arc::clone(&self.hub),
        }
    }
}

/// One node's view of a [`LocalCluster`].
#[derive(Clone)]
pub struct LocalClusterNode {
    id: NodeId,
    hub: Arc<Hub>,
}

impl ClusterService for LocalClusterNode {
    fn local_node(&self) -> ControllerNode {
        ControllerNode {
            id: self.id.clone(),
        }
    }

    fn nodes(&self) -> Vec<ControllerNode> {
        let mut nodes: Vec<ControllerNode> = self
            .hub
            .nodes
            .lock()
            .expect("cluster hub lock poisoned")
            .keys()
            .cloned()
            .map(|id| ControllerNode { id })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}

impl ClusterCommunicator for LocalClusterNode {
    fn send_and_receive(
        &self,
        subject: &MessageSubject,
        payload: Bytes,
        to: &NodeId,
    ) -> BoxFuture<'static, Result<Bytes, ClusterError>> {
        let nodes = self.hub.nodes.lock().expect("cluster hub lock poisoned");
        let sender = match nodes.get(to) {
            None => {
                let node = to.clone();
                return async move { Err(ClusterError::UnknownNode { node }) }.boxed();
            }
            Some(subjects) => subjects.get(subject).cloned(),
        };
        drop(nodes);

        let subject = subject.clone();
        let node = to.clone();
        async move {
            let sender = sender.ok_or_else(|| ClusterError::NoSubscriber {
                subject: subject.clone(),
                node: node.clone(),
            })?;
            let (reply_tx, reply_rx) = oneshot::channel();
            sender
                .send(Envelope {
                    payload,
                    reply: reply_tx,
                })
                .map_err(|_| ClusterError::Unreachable { node: node.clone() })?;
            match reply_rx.await {
                Ok(Some(bytes)) => Ok(bytes),
                Ok(None) => Ok(Bytes::new()),
                Err(_) => Err(ClusterError::Unreachable { node }),
            }
        }
        .boxed()
    }

    fn subscribe(&self, subject: MessageSubject, handler: MessageHandler) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let task_subject = subject.clone();
        // One dispatch task per subscription keeps handlers off the sender's
        // path and serializes them per subject.
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let response = handler(envelope.payload);
                if envelope.reply.send(response).is_err() {
                    trace!(subject = %task_subject, "response dropped, requester gone");
                }
            }
        });
        self.hub
            .nodes
            .lock()
            .expect("cluster hub lock poisoned")
            .entry(self.id.clone())
            .or_default()
            .insert(subject, tx);
    }
}
