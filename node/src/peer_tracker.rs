//! Tracking of connected peers and the blocks they announce.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::select;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use chainsync_types::{Block, ChainStatus};

use crate::network::{PeerClient, PeerId};

/// State of a single connected peer.
///
/// Handles are shared as `Arc`s between the peer table and in-flight sync
/// tasks. When the peer disconnects the handle is dropped from the table and
/// its queue is cancelled, so a task still holding the handle observes a
/// drained queue instead of blocking forever.
#[derive(Debug)]
pub struct SyncPeer {
    id: PeerId,
    client: Arc<dyn PeerClient>,
    status: RwLock<ChainStatus>,
    queue: BlockQueue,
}

impl SyncPeer {
    /// Create a new peer handle with the status fetched on handshake.
    pub fn new(id: PeerId, client: Arc<dyn PeerClient>, status: ChainStatus) -> SyncPeer {
        SyncPeer {
            id,
            client,
            status: RwLock::new(status),
            queue: BlockQueue::new(),
        }
    }

    /// Identity of the peer.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// RPC client bound to the peer.
    pub fn client(&self) -> &Arc<dyn PeerClient> {
        &self.client
    }

    /// The latest chain status known for the peer.
    pub fn status(&self) -> ChainStatus {
        self.status.read().clone()
    }

    /// Overwrite the peer's known chain status.
    pub fn set_status(&self, status: ChainStatus) {
        *self.status.write() = status;
    }

    /// The queue of blocks the peer announced but we did not consume yet.
    pub fn queue(&self) -> &BlockQueue {
        &self.queue
    }
}

/// An unbounded FIFO of announced blocks with a blocking, cancellable pop.
///
/// Announcement order is preserved and every block is delivered to at most
/// one consumer.
#[derive(Debug)]
pub struct BlockQueue {
    blocks: Mutex<VecDeque<Block>>,
    notify: Notify,
    cancelled: CancellationToken,
}

impl BlockQueue {
    fn new() -> BlockQueue {
        BlockQueue {
            blocks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancelled: CancellationToken::new(),
        }
    }

    /// Append a block, waking a parked consumer.
    ///
    /// Pushes after cancellation are dropped.
    pub fn push(&self, block: Block) {
        if self.cancelled.is_cancelled() {
            return;
        }

        self.blocks.lock().push_back(block);
        self.notify.notify_one();
    }

    /// Remove and return the next block, waiting until one is available.
    ///
    /// Returns `None` when the queue was cancelled because the peer was
    /// removed. Blocks that were queued before cancellation are still
    /// drained first.
    pub async fn pop(&self) -> Option<Block> {
        loop {
            // Created before the queue check so a push between the check
            // and the await is not missed.
            let notified = self.notify.notified();

            if let Some(block) = self.blocks.lock().pop_front() {
                return Some(block);
            }

            select! {
                _ = notified => {}
                // A push can race with the cancellation, so drain once more.
                _ = self.cancelled.cancelled() => return self.blocks.lock().pop_front(),
            }
        }
    }

    /// Amount of queued blocks.
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Returns true if there are no queued blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.cancel();
    }
}

/// Concurrent table of connected peers.
///
/// Insertions, removals and scans are safe to call from the connect,
/// disconnect, broadcast and selection paths at the same time.
#[derive(Debug)]
pub struct PeerTracker {
    peers: DashMap<PeerId, Arc<SyncPeer>>,
}

impl PeerTracker {
    /// Create a new `PeerTracker`.
    pub fn new() -> PeerTracker {
        PeerTracker {
            peers: DashMap::new(),
        }
    }

    /// Insert a peer handle, making it visible to selection and broadcast
    /// logic.
    ///
    /// Re-adding a known peer replaces the previous handle and cancels its
    /// queue.
    pub fn insert(&self, peer: SyncPeer) -> Arc<SyncPeer> {
        let peer = Arc::new(peer);

        if let Some(prev) = self.peers.insert(peer.id().clone(), peer.clone()) {
            prev.queue().cancel();
        }

        peer
    }

    /// Remove a peer, releasing any consumer blocked on its queue.
    ///
    /// Returns false if the peer was not known.
    pub fn remove(&self, id: &PeerId) -> bool {
        match self.peers.remove(id) {
            Some((_, peer)) => {
                peer.queue().cancel();
                true
            }
            None => false,
        }
    }

    /// Get the handle of a peer, or `None` when the peer is unknown.
    pub fn get(&self, id: &PeerId) -> Option<Arc<SyncPeer>> {
        self.peers.get(id).map(|pair| pair.value().clone())
    }

    /// The peer with the greatest total difficulty, if that difficulty
    /// strictly exceeds `local`'s.
    pub fn best_peer(&self, local: &ChainStatus) -> Option<Arc<SyncPeer>> {
        let mut best: Option<Arc<SyncPeer>> = None;
        let mut best_difficulty = local.difficulty;

        for pair in self.peers.iter() {
            let difficulty = pair.value().status().difficulty;

            if difficulty > best_difficulty {
                best_difficulty = difficulty;
                best = Some(pair.value().clone());
            }
        }

        best
    }

    /// Amount of connected peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no peers are connected.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for PeerTracker {
    fn default() -> Self {
        PeerTracker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestPeer;
    use chainsync_types::test_utils::ChainGenerator;
    use chainsync_types::U256;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn peer_with_difficulty(id: &str, difficulty: u64) -> SyncPeer {
        let mut gen = ChainGenerator::new();
        let head = gen.next().header;
        let status = ChainStatus::from_header(&head, U256::from(difficulty));

        SyncPeer::new(id.into(), TestPeer::unreachable(), status)
    }

    fn local_status(difficulty: u64) -> ChainStatus {
        let mut gen = ChainGenerator::new();
        ChainStatus::from_header(&gen.next().header, U256::from(difficulty))
    }

    #[tokio::test]
    async fn queue_preserves_order() {
        let peer = peer_with_difficulty("peer", 1);
        let mut gen = ChainGenerator::new();
        let blocks = gen.next_many(5);

        for block in &blocks {
            peer.queue().push(block.clone());
        }

        assert_eq!(peer.queue().len(), 5);

        for block in &blocks {
            assert_eq!(peer.queue().pop().await.as_ref(), Some(block));
        }

        assert!(peer.queue().is_empty());
    }

    #[tokio::test]
    async fn queue_pop_waits_for_push() {
        let tracker = PeerTracker::new();
        let peer = tracker.insert(peer_with_difficulty("peer", 1));

        let consumer = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.queue().pop().await })
        };

        // Give the consumer time to park.
        sleep(Duration::from_millis(10)).await;

        let mut gen = ChainGenerator::new();
        let block = gen.next();
        peer.queue().push(block.clone());

        let popped = timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pop should have been woken")
            .unwrap();
        assert_eq!(popped, Some(block));
    }

    #[tokio::test]
    async fn removal_unblocks_parked_consumer() {
        let tracker = PeerTracker::new();
        let peer = tracker.insert(peer_with_difficulty("peer", 1));

        let consumer = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.queue().pop().await })
        };

        sleep(Duration::from_millis(10)).await;
        assert!(tracker.remove(peer.id()));

        let popped = timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pop should have been cancelled")
            .unwrap();
        assert_eq!(popped, None);
        assert!(tracker.get(peer.id()).is_none());
    }

    #[tokio::test]
    async fn reinsert_replaces_handle() {
        let tracker = PeerTracker::new();
        let first = tracker.insert(peer_with_difficulty("peer", 1));
        let second = tracker.insert(peer_with_difficulty("peer", 2));

        assert_eq!(tracker.len(), 1);

        // The replaced handle's queue is cancelled.
        assert_eq!(first.queue().pop().await, None);

        let current = tracker.get(&"peer".into()).unwrap();
        assert_eq!(current.status(), second.status());
    }

    #[test]
    fn best_peer_requires_strictly_greater_difficulty() {
        let tracker = PeerTracker::new();
        tracker.insert(peer_with_difficulty("a", 10));
        tracker.insert(peer_with_difficulty("b", 1000));
        tracker.insert(peer_with_difficulty("c", 100));

        let best = tracker.best_peer(&local_status(100)).unwrap();
        assert_eq!(best.id(), &"b".into());

        assert!(tracker.best_peer(&local_status(1000)).is_none());
        assert!(tracker.best_peer(&local_status(5000)).is_none());
    }

    #[test]
    fn best_peer_on_empty_table() {
        let tracker = PeerTracker::new();
        assert!(tracker.best_peer(&local_status(0)).is_none());
    }
}
