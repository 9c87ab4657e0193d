//! Cluster routing for Kestrel.
//!
//! This crate provides:
//! - The membership boundary and a static membership view
//! - Rendezvous routing of keys to owning nodes
//! - The request/response message protocol and an in-process mesh
//! - [`DistributedHash`]: a map sharded over the live nodes

mod dhash;
mod membership;
mod messenger;
pub mod protocol;
mod router;

pub use dhash::{DistributedHash, shard_name};
pub use membership::{Membership, StaticMembership};
pub use messenger::{Delivery, Inbox, LocalMesh, Messenger};
pub use protocol::{Envelope, Message, Topic};
pub use router::{RendezvousRouter, score};
