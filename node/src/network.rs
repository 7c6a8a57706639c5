//! Surface of the network collaborator.
//!
//! The syncer does not own a transport. The network layer notifies it about
//! peer lifecycle and gossiped blocks through [`NetworkEvent`]s, provides a
//! dialed [`PeerClient`] for every connected peer, and accepts outward
//! announcements through [`GossipPublisher`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chainsync_types::{Block, ChainStatus, Header};

/// Representation of the errors that a peer RPC round trip can produce.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request to the peer timed out.
    #[error("request to peer timed out")]
    Timeout,

    /// The connection to the peer was lost mid-request.
    #[error("connection to peer lost")]
    ConnectionLost,

    /// The peer responded with an error.
    #[error("peer request failed: {0}")]
    Request(String),

    /// The peer responded with something we did not ask for.
    #[error("invalid response from peer: {0}")]
    InvalidResponse(String),
}

/// Opaque identity of a peer, assigned by the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer id.
    pub fn new(id: impl Into<String>) -> PeerId {
        PeerId(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> PeerId {
        PeerId::new(id)
    }
}

/// An RPC client bound to a single connected peer.
#[async_trait]
pub trait PeerClient: Send + Sync + fmt::Debug {
    /// Fetch the peer's current chain status.
    async fn status(&self) -> Result<ChainStatus, ClientError>;

    /// Fetch the header at `number` on the peer's canonical chain.
    ///
    /// Returns `None` if the peer's chain does not reach that height.
    async fn header_by_number(&self, number: u64) -> Result<Option<Header>, ClientError>;

    /// Fetch up to `amount` blocks starting at height `from`, in ascending
    /// order. Returns fewer blocks if the peer's chain ends earlier.
    async fn blocks_in_range(&self, from: u64, amount: u64) -> Result<Vec<Block>, ClientError>;
}

/// Outward gossip capability of the network layer.
#[async_trait]
pub trait GossipPublisher: Send + Sync {
    /// Announce a locally produced block to the network.
    async fn publish(&self, block: Block) -> Result<(), ClientError>;
}

/// Notifications delivered by the network layer.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A new peer connected and its RPC stream was dialed.
    PeerConnected {
        /// Identity of the peer.
        id: PeerId,
        /// RPC client bound to the peer.
        client: Arc<dyn PeerClient>,
    },
    /// A peer disconnected.
    PeerDisconnected {
        /// Identity of the peer.
        id: PeerId,
    },
    /// A connected peer announced a new block over gossip.
    BlockBroadcast {
        /// The announcing peer.
        from: PeerId,
        /// The announced block.
        block: Block,
    },
}
