//! Message transport between nodes.
//!
//! [`LocalMesh`] connects nodes living in one process through unbounded
//! tokio channels. Each registered node receives its traffic on an [`Inbox`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use kestrel_common::{KestrelError, NodeId, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::Topic;

/// Sends topic-addressed payloads to other nodes.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    async fn send(&self, to: NodeId, topic: Topic, payload: Bytes) -> Result<()>;
}

/// A payload received on a topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    pub payload: Bytes,
}

pub type Inbox = mpsc::UnboundedReceiver<Delivery>;

/// In-process messenger shared by every node of a test or embedded cluster.
#[derive(Debug, Clone, Default)]
pub struct LocalMesh {
    routes: Arc<DashMap<NodeId, mpsc::UnboundedSender<Delivery>>>,
}

impl LocalMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `node`, replacing any earlier inbox it had.
    pub fn register(&self, node: NodeId) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(node, tx);
        debug!(%node, "node registered on mesh");
        rx
    }

    /// Drops the route to `node`. Later sends to it fail.
    pub fn disconnect(&self, node: NodeId) -> bool {
        self.routes.remove(&node).is_some()
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.routes.contains_key(&node)
    }
}

#[async_trait]
impl Messenger for LocalMesh {
    async fn send(&self, to: NodeId, topic: Topic, payload: Bytes) -> Result<()> {
        let route = self
            .routes
            .get(&to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KestrelError::Messaging(format!("{to} is not connected")))?;
        route
            .send(Delivery { topic, payload })
            .map_err(|_| KestrelError::Messaging(format!("{to} stopped receiving")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_registered_node() {
        let mesh = LocalMesh::new();
        let mut inbox = mesh.register(NodeId(2));
        mesh.send(NodeId(2), Topic::GetRequest, Bytes::from_static(b"ping"))
            .await
            .unwrap();
        let delivery = inbox.recv().await.unwrap();
        assert_eq!(delivery.topic, Topic::GetRequest);
        assert_eq!(&delivery.payload[..], b"ping");
    }

    #[tokio::test]
    async fn test_unknown_node_is_an_error() {
        let mesh = LocalMesh::new();
        let err = mesh
            .send(NodeId(4), Topic::PutRequest, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::Messaging(_)));
    }

    #[tokio::test]
    async fn test_disconnect_and_dropped_inbox() {
        let mesh = LocalMesh::new();
        let inbox = mesh.register(NodeId(1));
        drop(inbox);
        assert!(mesh.send(NodeId(1), Topic::Failure, Bytes::new()).await.is_err());

        assert!(mesh.disconnect(NodeId(1)));
        assert!(!mesh.is_connected(NodeId(1)));
        assert!(!mesh.disconnect(NodeId(1)));
    }
}
