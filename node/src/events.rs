//! Events emitted by the syncer, for consumption by the node's outer layers.

use std::fmt;
use std::panic::Location;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::network::PeerId;

/// Error returned from [`EventSubscriber::recv`].
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// Channel closed.
    #[error("Channel closed")]
    Closed,
}

/// Error returned from [`EventSubscriber::try_recv`].
#[derive(Debug, thiserror::Error)]
pub enum TryRecvError {
    /// Channel empty.
    #[error("Channel empty")]
    Empty,
    /// Channel closed.
    #[error("Channel closed")]
    Closed,
}

/// A channel for distributing [`NodeEvent`]s to subscribers.
#[derive(Debug)]
pub struct EventChannel {
    tx: broadcast::Sender<NodeEventInfo>,
}

/// The publishing half of an [`EventChannel`].
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<NodeEventInfo>,
}

/// The receiving half of an [`EventChannel`].
#[derive(Debug)]
pub struct EventSubscriber {
    rx: broadcast::Receiver<NodeEventInfo>,
}

impl EventChannel {
    /// Create a new `EventChannel`.
    pub fn new() -> EventChannel {
        let (tx, _) = broadcast::channel(32);
        EventChannel { tx }
    }

    /// Creates a publisher of this channel.
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            tx: self.tx.clone(),
        }
    }

    /// Creates a new subscriber of this channel.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        EventChannel::new()
    }
}

impl EventPublisher {
    /// Publish an event to all subscribers.
    #[track_caller]
    pub fn send(&self, event: NodeEvent) {
        let location: &'static Location<'static> = Location::caller();

        // Error is produced if there aren't any subscribers. Since this is
        // a valid case, we ignore the error.
        let _ = self.tx.send(NodeEventInfo {
            event,
            time: SystemTime::now(),
            file_path: location.file(),
            file_line: location.line(),
        });
    }
}

impl EventSubscriber {
    /// Receive the next event, waiting until one is available.
    pub async fn recv(&mut self) -> Result<NodeEventInfo, RecvError> {
        loop {
            match self.rx.recv().await {
                Ok(val) => return Ok(val),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Slow consumer. We will receive a message on the next call.
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(RecvError::Closed),
            }
        }
    }

    /// Receive the next event if one is already available.
    pub fn try_recv(&mut self) -> Result<NodeEventInfo, TryRecvError> {
        loop {
            match self.rx.try_recv() {
                Ok(val) => return Ok(val),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    // Slow consumer. We will receive a message on the next call.
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty) => return Err(TryRecvError::Empty),
                Err(broadcast::error::TryRecvError::Closed) => return Err(TryRecvError::Closed),
            }
        }
    }
}

/// A [`NodeEvent`] together with the place and time it was emitted.
#[derive(Debug, Clone, Serialize)]
pub struct NodeEventInfo {
    /// The event.
    pub event: NodeEvent,
    /// When the event was emitted.
    pub time: SystemTime,
    /// Source file that emitted the event.
    pub file_path: &'static str,
    /// Line in the source file that emitted the event.
    pub file_line: u32,
}

/// Events emitted by the syncer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum NodeEvent {
    /// A peer was added to the peer table.
    PeerAdded {
        /// Identity of the peer.
        id: PeerId,
        /// Chain height the peer advertised on connect.
        height: u64,
    },
    /// A peer was removed from the peer table.
    PeerRemoved {
        /// Identity of the peer.
        id: PeerId,
    },
    /// A block announced by a peer was queued for syncing.
    BlockReceived {
        /// The announcing peer.
        from: PeerId,
        /// Height of the announced block.
        height: u64,
    },
    /// Bulk sync against a peer started.
    BulkSyncStarted {
        /// The peer being synced from.
        peer: PeerId,
        /// First height to fetch.
        from_height: u64,
        /// Last height to fetch.
        to_height: u64,
    },
    /// Bulk sync against a peer finished.
    BulkSyncFinished {
        /// The peer that was synced from.
        peer: PeerId,
        /// The new local chain height.
        new_height: u64,
    },
    /// Watch sync with a peer stopped.
    WatchSyncStopped {
        /// The watched peer.
        peer: PeerId,
    },
    /// A sync cycle with a peer failed. This is scoped to a single peer and
    /// is not fatal to the syncer.
    SyncCycleFailed {
        /// The peer the cycle ran against.
        peer: PeerId,
        /// Error that stopped the cycle.
        error: String,
    },
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeEvent::PeerAdded { id, height } => {
                write!(f, "Peer {id} added at height {height}")
            }
            NodeEvent::PeerRemoved { id } => {
                write!(f, "Peer {id} removed")
            }
            NodeEvent::BlockReceived { from, height } => {
                write!(f, "Block {height} received from {from}")
            }
            NodeEvent::BulkSyncStarted {
                peer,
                from_height,
                to_height,
            } => {
                write!(f, "Bulk sync of {from_height}..={to_height} from {peer} started")
            }
            NodeEvent::BulkSyncFinished { peer, new_height } => {
                write!(f, "Bulk sync from {peer} finished at height {new_height}")
            }
            NodeEvent::WatchSyncStopped { peer } => {
                write!(f, "Watch sync with {peer} stopped")
            }
            NodeEvent::SyncCycleFailed { peer, error } => {
                write!(f, "Sync cycle with {peer} failed: {error}")
            }
        }
    }
}
