//! Hash map partitioned across the cluster.
//!
//! Every node keeps one local shard, a [`ChainedHash`] of encoded keys and
//! values registered in the catalog as `"{map}@{node}"`. Operations on a key
//! go to the key's rendezvous owner:
//!
//! ```text
//!   put(k, v) ──owner(k) == local──> shard.put in a local transaction
//!             └─otherwise─────────> PutRequest ──> owner ──> PutResponse
//! ```
//!
//! A remote call parks a oneshot sender under a fresh correlation id and
//! waits for the matching reply up to `request_timeout_ms`. [`serve`] drives
//! a node's inbox: requests are answered on spawned tasks, replies complete
//! the parked senders.
//!
//! [`serve`]: DistributedHash::serve

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use kestrel_common::{BlockId, ClusterConfig, KestrelError, NodeId, Result};
use kestrel_storage::{Catalog, ChainedHash, Codec, persist};
use kestrel_txn::Engine;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::membership::Membership;
use crate::messenger::{Inbox, Messenger};
use crate::protocol::{Envelope, Message};
use crate::router::RendezvousRouter;

type Shard = ChainedHash<Bytes, Bytes>;

/// Catalog name of `node`'s shard of `map`.
pub fn shard_name(map: &str, node: NodeId) -> String {
    format!("{map}@{node}")
}

struct Shared {
    name: String,
    engine: Engine,
    router: RendezvousRouter,
    messenger: Arc<dyn Messenger>,
    config: ClusterConfig,
    local_shard: BlockId,
    /// Shard roots learned from remote owners.
    shards: DashMap<NodeId, BlockId>,
    pending: DashMap<Uuid, oneshot::Sender<Message>>,
}

/// A named map whose keys are spread over the live nodes.
pub struct DistributedHash<K, V> {
    shared: Arc<Shared>,
    _pairs: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for DistributedHash<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _pairs: PhantomData,
        }
    }
}

impl<K, V> DistributedHash<K, V>
where
    K: Codec,
    V: Codec,
{
    /// Opens map `name` on this node, creating the local shard if the
    /// catalog does not list one yet.
    pub async fn open(
        name: impl Into<String>,
        engine: Engine,
        membership: Arc<dyn Membership>,
        messenger: Arc<dyn Messenger>,
        config: ClusterConfig,
    ) -> Result<Self> {
        let name = name.into();
        let router = RendezvousRouter::new(membership);
        let catalog = Catalog::open(&engine).await?;
        let local_shard = Self::local_shard(&engine, &catalog, &name, router.local_node()).await?;

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                engine,
                router,
                messenger,
                config,
                local_shard,
                shards: DashMap::new(),
                pending: DashMap::new(),
            }),
            _pairs: PhantomData,
        })
    }

    async fn local_shard(
        engine: &Engine,
        catalog: &Catalog,
        name: &str,
        node: NodeId,
    ) -> Result<BlockId> {
        let entry = shard_name(name, node);
        if let Some(id) = catalog.get(engine, &entry).await? {
            debug!(map = name, %node, shard = %id, "shard recovered");
            return Ok(id);
        }

        let creator = catalog.clone();
        let created = {
            let entry = entry.clone();
            engine
                .transactionally(move |txn| {
                    Box::pin(async move {
                        let mut shard: Shard = ChainedHash::new(txn.config());
                        let id = persist::upsert(&mut shard, txn).await?;
                        creator.create(txn, &entry, id).await?;
                        Ok(id)
                    })
                })
                .await
        };
        match created {
            Ok(id) => {
                debug!(map = name, %node, shard = %id, "shard created");
                Ok(id)
            }
            // another open of the same map registered the shard first
            Err(e) if matches!(e.root_cause(), KestrelError::AlreadyExists(_)) => {
                let id = catalog.require(engine, &entry).await?;
                debug!(map = name, %node, shard = %id, "shard created concurrently");
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_node(&self) -> NodeId {
        self.shared.router.local_node()
    }

    /// Root block of this node's shard.
    pub fn local_shard_id(&self) -> BlockId {
        self.shared.local_shard
    }

    /// Shard root of `node`, if known.
    pub fn shard_of(&self, node: NodeId) -> Option<BlockId> {
        if node == self.local_node() {
            return Some(self.shared.local_shard);
        }
        self.shared.shards.get(&node).map(|entry| *entry.value())
    }

    /// Node currently owning `key`.
    pub fn owner(&self, key: &K) -> Result<NodeId> {
        self.owner_of(&key.to_bytes())
    }

    fn owner_of(&self, key: &[u8]) -> Result<NodeId> {
        self.shared
            .router
            .owner(key)
            .ok_or_else(|| KestrelError::Messaging("no live nodes".into()))
    }

    /// Stores `value` under `key` on the key's owner.
    pub async fn put(&self, key: &K, value: &V) -> Result<()> {
        let key = key.to_bytes();
        let value = value.to_bytes();
        let owner = self.owner_of(&key)?;
        if owner == self.local_node() {
            self.put_local(key, value).await?;
            return Ok(());
        }

        let request = Message::PutRequest {
            key,
            value,
            block_id: self.shard_of(owner),
        };
        match self.request(owner, request).await? {
            Message::PutResponse { block_id } => {
                self.shared.shards.insert(owner, block_id);
                Ok(())
            }
            other => Err(Self::unexpected(owner, other)),
        }
    }

    /// Reads `key` from its owner.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let key = key.to_bytes();
        let owner = self.owner_of(&key)?;
        let value = if owner == self.local_node() {
            self.get_local(key).await?
        } else {
            let request = Message::GetRequest {
                key,
                block_id: self.shard_of(owner),
            };
            match self.request(owner, request).await? {
                Message::GetResponse { value } => value,
                other => return Err(Self::unexpected(owner, other)),
            }
        };
        value.map(|bytes| decode_exact::<V>(&bytes)).transpose()
    }

    /// Handles traffic arriving at this node until the inbox closes.
    pub async fn serve(self, mut inbox: Inbox) {
        while let Some(delivery) = inbox.recv().await {
            let envelope = match Envelope::decode(delivery.topic, &delivery.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(map = %self.shared.name, topic = %delivery.topic, error = %e, "dropping undecodable message");
                    continue;
                }
            };
            if envelope.map != self.shared.name {
                warn!(map = %self.shared.name, target = %envelope.map, from = %envelope.from, "dropping message for another map");
                continue;
            }

            if delivery.topic.is_response() {
                self.complete(envelope);
            } else {
                let this = self.clone();
                tokio::spawn(async move { this.answer(envelope).await });
            }
        }
        debug!(map = %self.shared.name, node = %self.local_node(), "inbox closed");
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    async fn request(&self, to: NodeId, message: Message) -> Result<Message> {
        let correlation = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(correlation, tx);

        let envelope = Envelope {
            correlation,
            from: self.local_node(),
            map: self.shared.name.clone(),
            message,
        };
        let topic = envelope.topic();
        if let Err(e) = self.shared.messenger.send(to, topic, envelope.encode()).await {
            self.shared.pending.remove(&correlation);
            return Err(e);
        }

        let bound = self.shared.config.request_timeout();
        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(Message::Failure { reason })) => Err(KestrelError::Messaging(format!(
                "{to} failed {topic}: {reason}"
            ))),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(KestrelError::Messaging(format!(
                "reply channel for {topic} to {to} closed"
            ))),
            Err(_) => {
                self.shared.pending.remove(&correlation);
                Err(KestrelError::Timeout {
                    operation: format!("{topic} to {to}"),
                    waited_ms: bound.as_millis() as u64,
                })
            }
        }
    }

    fn complete(&self, envelope: Envelope) {
        match self.shared.pending.remove(&envelope.correlation) {
            Some((_, waiter)) => {
                // The requester may have timed out in the meantime.
                let _ = waiter.send(envelope.message);
            }
            None => warn!(
                map = %self.shared.name,
                correlation = %envelope.correlation,
                from = %envelope.from,
                topic = %envelope.topic(),
                "unmatched reply"
            ),
        }
    }

    async fn answer(&self, request: Envelope) {
        let message = match self.handle(request.message.clone()).await {
            Ok(message) => message,
            Err(e) => {
                warn!(map = %self.shared.name, from = %request.from, error = %e, "request failed");
                Message::Failure {
                    reason: e.to_string(),
                }
            }
        };
        let reply = request.reply(self.local_node(), message);
        if let Err(e) = self
            .shared
            .messenger
            .send(request.from, reply.topic(), reply.encode())
            .await
        {
            warn!(map = %self.shared.name, to = %request.from, error = %e, "reply not delivered");
        }
    }

    async fn handle(&self, message: Message) -> Result<Message> {
        match message {
            Message::PutRequest {
                key,
                value,
                block_id,
            } => {
                self.check_hint(block_id);
                let block_id = self.put_local(key, value).await?;
                Ok(Message::PutResponse { block_id })
            }
            Message::GetRequest { key, block_id } => {
                self.check_hint(block_id);
                let value = self.get_local(key).await?;
                Ok(Message::GetResponse { value })
            }
            other => Err(KestrelError::InvalidInput(format!(
                "{} is not a request",
                other.topic()
            ))),
        }
    }

    fn check_hint(&self, hint: Option<BlockId>) {
        if let Some(id) = hint {
            if id != self.shared.local_shard {
                debug!(map = %self.shared.name, hint = %id, shard = %self.shared.local_shard, "stale shard hint");
            }
        }
    }

    async fn put_local(&self, key: Bytes, value: Bytes) -> Result<BlockId> {
        let id = self.shared.local_shard;
        self.shared
            .engine
            .transactionally(move |txn| {
                Box::pin(async move {
                    let mut shard: Shard = ChainedHash::open_for_writes(txn, id).await?;
                    shard.put(txn, key, value).await?;
                    Ok(id)
                })
            })
            .await
    }

    async fn get_local(&self, key: Bytes) -> Result<Option<Bytes>> {
        let engine = &self.shared.engine;
        let shard: Shard = ChainedHash::open(engine, self.shared.local_shard)
            .retrieved()
            .await?;
        shard.get(engine, &key).await
    }

    fn unexpected(from: NodeId, reply: Message) -> KestrelError {
        KestrelError::Messaging(format!("unexpected {} from {from}", reply.topic()))
    }
}

impl<K, V> std::fmt::Debug for DistributedHash<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedHash")
            .field("name", &self.shared.name)
            .field("local_shard", &self.shared.local_shard)
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

fn decode_exact<T: Codec>(bytes: &[u8]) -> Result<T> {
    let mut buf = bytes;
    let value = T::decode(&mut buf)?;
    if !buf.is_empty() {
        return Err(KestrelError::Codec(format!(
            "{} trailing bytes after value",
            buf.len()
        )));
    }
    Ok(value)
}
