//! Component keeping the local chain converged with the best chain among
//! the connected peers.
//!
//! Synchronization happens in two phases:
//!
//! 1. Bulk sync. When a peer advertises a chain with a greater total
//!    difficulty than ours, the [`Syncer`] locates the last header both
//!    chains agree on with a binary search over heights, then fetches and
//!    writes every block from the fork point up to the peer's head in
//!    batches.
//! 2. Watch sync. Once caught up, the peer's announced blocks are drained
//!    from its queue and applied one by one, keeping the local head
//!    current until the peer disconnects.
//!
//! The local status is only ever refreshed from the store after a
//! successful write, so it always reflects persisted state.

use std::sync::Arc;

use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use chainsync_types::{Block, ChainStatus, Header};

use crate::events::{EventPublisher, NodeEvent};
use crate::network::{ClientError, GossipPublisher, NetworkEvent, PeerClient, PeerId};
use crate::peer_tracker::{PeerTracker, SyncPeer};
use crate::store::{Store, StoreError};

/// Maximum amount of blocks fetched from a peer in a single range request.
const MAX_BLOCKS_PER_REQUEST: u64 = 64;

type Result<T, E = SyncerError> = std::result::Result<T, E>;

/// Representation of all the errors that can occur when interacting with
/// the [`Syncer`].
#[derive(Debug, thiserror::Error)]
pub enum SyncerError {
    /// The local chain and the peer's chain share no prefix within the
    /// searched range.
    #[error("fork not found")]
    ForkNotFound,

    /// A round trip to the peer failed. The sync cycle is aborted but the
    /// peer stays in the table; disconnect detection belongs to the
    /// network layer.
    #[error("peer unavailable: {0}")]
    Client(#[from] ClientError),

    /// The store rejected a write. The local status is left unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A watched peer announced a block that does not extend the local
    /// head contiguously, either skipping heights or attaching to a
    /// different branch.
    #[error("received block {found} is not a child of the local head (expected height {expected})")]
    GapDetected {
        /// The height that would extend the head.
        expected: u64,
        /// The height that was received.
        found: u64,
    },
}

/// Component synchronizing the local chain with the connected peers.
pub struct Syncer<S>
where
    S: Store + 'static,
{
    inner: Arc<SyncerInner<S>>,
    cancellation_token: CancellationToken,
}

/// Arguments used to configure the [`Syncer`].
pub struct SyncerArgs<S>
where
    S: Store + 'static,
{
    /// Local chain storage.
    pub store: Arc<S>,
    /// Stream of notifications from the network layer.
    pub network_events: mpsc::Receiver<NetworkEvent>,
    /// Outward gossip capability of the network layer.
    pub gossip: Arc<dyn GossipPublisher>,
    /// Event publisher.
    pub event_pub: EventPublisher,
}

struct SyncerInner<S> {
    store: Arc<S>,
    peers: PeerTracker,
    status_tx: watch::Sender<ChainStatus>,
    gossip: Arc<dyn GossipPublisher>,
    event_pub: EventPublisher,
}

impl<S> Syncer<S>
where
    S: Store,
{
    /// Create and start the [`Syncer`].
    ///
    /// The worker task consumes network events until [`Syncer::stop`] is
    /// called or the event stream ends.
    pub async fn start(args: SyncerArgs<S>) -> Result<Syncer<S>> {
        let status = args.store.status().await?;
        let (status_tx, _) = watch::channel(status);

        let inner = Arc::new(SyncerInner {
            store: args.store,
            peers: PeerTracker::new(),
            status_tx,
            gossip: args.gossip,
            event_pub: args.event_pub,
        });

        let cancellation_token = CancellationToken::new();

        let mut worker = Worker {
            inner: inner.clone(),
            network_events: args.network_events,
            cancellation_token: cancellation_token.child_token(),
        };

        tokio::spawn(async move {
            worker.run().await;
        });

        Ok(Syncer {
            inner,
            cancellation_token,
        })
    }

    /// Stop the [`Syncer`].
    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    /// The local chain status.
    ///
    /// This always reflects the store's persisted head, never a
    /// speculative update.
    pub fn local_status(&self) -> ChainStatus {
        self.inner.local_status()
    }

    /// Watcher over the local chain status.
    pub fn status_watcher(&self) -> watch::Receiver<ChainStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Fetch the status of a newly connected peer and add it to the peer
    /// table.
    ///
    /// Re-adding a known peer replaces its handle.
    pub async fn add_peer(&self, id: PeerId, client: Arc<dyn PeerClient>) -> Result<Arc<SyncPeer>> {
        self.inner.add_peer(id, client).await
    }

    /// Remove a disconnected peer, releasing any consumer blocked on its
    /// queue. Returns false if the peer was not known.
    pub fn remove_peer(&self, id: &PeerId) -> bool {
        self.inner.remove_peer(id)
    }

    /// Get the handle of a connected peer.
    pub fn peer(&self, id: &PeerId) -> Option<Arc<SyncPeer>> {
        self.inner.peers.get(id)
    }

    /// Queue a block a peer announced over gossip and update that peer's
    /// status.
    ///
    /// Broadcasts from unknown peers are dropped: the announcement may
    /// have raced with a disconnect.
    pub fn on_block_broadcast(&self, from: &PeerId, block: Block) {
        self.inner.on_block_broadcast(from, block);
    }

    /// The peer with the greatest total difficulty, if it strictly exceeds
    /// the local one.
    pub fn best_peer(&self) -> Option<Arc<SyncPeer>> {
        self.inner.peers.best_peer(&self.inner.local_status())
    }

    /// Locate the last header shared with the peer and the first header of
    /// the peer's chain after it.
    pub async fn find_common_ancestor(
        &self,
        client: &dyn PeerClient,
        peer_status: &ChainStatus,
    ) -> Result<(Header, Header)> {
        find_common_ancestor(&*self.inner.store, client, peer_status).await
    }

    /// Catch up to the peer's advertised head in one shot.
    ///
    /// Returns [`SyncerError::ForkNotFound`] without writing anything when
    /// the chains share no prefix.
    pub async fn bulk_sync_with_peer(&self, peer: &SyncPeer) -> Result<()> {
        self.inner.bulk_sync_with_peer(peer).await
    }

    /// Continuously apply the blocks the peer announces.
    ///
    /// Returns when `stop` evaluates to true on a written block, or when
    /// the peer is torn down.
    pub async fn watch_sync_with_peer<F>(&self, peer: &SyncPeer, stop: F) -> Result<()>
    where
        F: FnMut(&Block) -> bool,
    {
        self.inner.watch_sync_with_peer(peer, stop).await
    }

    /// Announce a locally produced block to the network.
    pub async fn broadcast(&self, block: Block) -> Result<()> {
        self.inner.gossip.publish(block).await?;
        Ok(())
    }
}

impl<S> Drop for Syncer<S>
where
    S: Store,
{
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

impl<S> SyncerInner<S>
where
    S: Store,
{
    fn local_status(&self) -> ChainStatus {
        self.status_tx.borrow().clone()
    }

    /// Refresh the local status from the store's persisted head.
    async fn refresh_status(&self) -> Result<ChainStatus> {
        let status = self.store.status().await?;
        self.status_tx.send_replace(status.clone());
        Ok(status)
    }

    #[instrument(skip_all, fields(peer_id = %id))]
    async fn add_peer(&self, id: PeerId, client: Arc<dyn PeerClient>) -> Result<Arc<SyncPeer>> {
        let status = client.status().await?;

        debug!("Peer connected at {status}");
        self.event_pub.send(NodeEvent::PeerAdded {
            id: id.clone(),
            height: status.number,
        });

        Ok(self.peers.insert(SyncPeer::new(id, client, status)))
    }

    #[instrument(skip_all, fields(peer_id = %id))]
    fn remove_peer(&self, id: &PeerId) -> bool {
        if !self.peers.remove(id) {
            return false;
        }

        debug!("Peer disconnected");
        self.event_pub.send(NodeEvent::PeerRemoved { id: id.clone() });
        true
    }

    #[instrument(skip_all, fields(peer_id = %from))]
    fn on_block_broadcast(&self, from: &PeerId, block: Block) {
        let Some(peer) = self.peers.get(from) else {
            // The announcement raced with a disconnect.
            debug!("Dropping broadcast from unknown peer");
            return;
        };

        // Peers do not announce their cumulative total difficulty, so it
        // is projected forward from the header's own difficulty.
        peer.set_status(peer.status().advance(&block.header));

        self.event_pub.send(NodeEvent::BlockReceived {
            from: from.clone(),
            height: block.number(),
        });

        peer.queue().push(block);
    }

    #[instrument(skip_all, fields(peer_id = %peer.id()))]
    async fn bulk_sync_with_peer(&self, peer: &SyncPeer) -> Result<()> {
        let peer_status = peer.status();
        let (_, fork) = find_common_ancestor(&*self.store, &**peer.client(), &peer_status).await?;

        let target = peer_status.number;

        info!("Bulk syncing {}..={} from peer", fork.number, target);
        self.event_pub.send(NodeEvent::BulkSyncStarted {
            peer: peer.id().clone(),
            from_height: fork.number,
            to_height: target,
        });

        let mut next = fork.number;

        while next <= target {
            let amount = MAX_BLOCKS_PER_REQUEST.min(target - next + 1);
            let blocks = peer.client().blocks_in_range(next, amount).await?;

            let Some(last) = blocks.last() else {
                return Err(ClientError::InvalidResponse(format!(
                    "peer advertised height {target} but has no block {next}"
                ))
                .into());
            };
            let last = last.number();

            self.store.write_blocks(blocks).await?;
            next = last + 1;

            self.refresh_status().await?;
        }

        let status = self.local_status();
        info!("Bulk sync finished at {status}");
        self.event_pub.send(NodeEvent::BulkSyncFinished {
            peer: peer.id().clone(),
            new_height: status.number,
        });

        Ok(())
    }

    #[instrument(skip_all, fields(peer_id = %peer.id()))]
    async fn watch_sync_with_peer<F>(&self, peer: &SyncPeer, mut stop: F) -> Result<()>
    where
        F: FnMut(&Block) -> bool,
    {
        loop {
            let Some(block) = peer.queue().pop().await else {
                // Peer was torn down.
                debug!("Watched peer removed");
                break;
            };

            let head = self.store.head().await?;

            // Announcements at or below our head were already applied,
            // typically during the preceding bulk sync.
            if block.number() <= head.number {
                continue;
            }

            if !head.is_parent_of(&block.header) {
                return Err(SyncerError::GapDetected {
                    expected: head.number + 1,
                    found: block.number(),
                });
            }

            let stop_reached = stop(&block);
            let number = block.number();

            self.store.write_blocks(vec![block]).await?;
            self.refresh_status().await?;

            debug!("Applied announced block {number}");

            if stop_reached {
                break;
            }
        }

        self.event_pub.send(NodeEvent::WatchSyncStopped {
            peer: peer.id().clone(),
        });

        Ok(())
    }
}

/// Locate the last header the local chain and the peer's chain agree on,
/// together with the first header of the peer's chain after it.
///
/// Binary search over the height range shared by both chains, comparing
/// headers by hash: equal hashes extend the shared prefix upwards,
/// different hashes push the divergence downwards. Costs O(log n) round
/// trips to the peer.
async fn find_common_ancestor<S>(
    store: &S,
    client: &dyn PeerClient,
    peer_status: &ChainStatus,
) -> Result<(Header, Header)>
where
    S: Store,
{
    let local_head = store.head().await?;

    let mut min = 0;
    let mut max = local_head.number.min(peer_status.number);
    let mut common: Option<Header> = None;

    while min <= max {
        let middle = min + (max - min) / 2;

        let Some(remote) = client.header_by_number(middle).await? else {
            // Peer's chain is shorter than advertised.
            if middle == 0 {
                break;
            }
            max = middle - 1;
            continue;
        };

        let local = store
            .header_by_number(middle)
            .await?
            .ok_or(StoreError::LostHeight(middle))?;

        // Hash comparison, never height: two chains can share a height
        // with different content.
        if local.hash() == remote.hash() {
            common = Some(remote);
            min = middle + 1;
        } else {
            if middle == 0 {
                // Not even genesis is shared.
                break;
            }
            max = middle - 1;
        }
    }

    let common = common.ok_or(SyncerError::ForkNotFound)?;

    // The first diverging header on the peer's side. Absent when the peer
    // is not actually ahead of the shared prefix.
    let fork = client
        .header_by_number(common.number + 1)
        .await?
        .ok_or(SyncerError::ForkNotFound)?;

    Ok((common, fork))
}

struct Worker<S>
where
    S: Store + 'static,
{
    inner: Arc<SyncerInner<S>>,
    network_events: mpsc::Receiver<NetworkEvent>,
    cancellation_token: CancellationToken,
}

impl<S> Worker<S>
where
    S: Store + 'static,
{
    async fn run(&mut self) {
        loop {
            select! {
                _ = self.cancellation_token.cancelled() => break,
                ev = self.network_events.recv() => {
                    match ev {
                        Some(ev) => self.on_network_event(ev).await,
                        None => break,
                    }
                }
            }
        }

        debug!("Syncer stopped");
    }

    async fn on_network_event(&mut self, ev: NetworkEvent) {
        match ev {
            NetworkEvent::PeerConnected { id, client } => {
                let peer = match self.inner.add_peer(id, client).await {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!("Failed to fetch status of connected peer: {e}");
                        return;
                    }
                };

                let inner = self.inner.clone();
                let token = self.cancellation_token.child_token();

                tokio::spawn(async move {
                    run_sync_cycle(inner, peer, token).await;
                });
            }
            NetworkEvent::PeerDisconnected { id } => {
                self.inner.remove_peer(&id);
            }
            NetworkEvent::BlockBroadcast { from, block } => {
                self.inner.on_block_broadcast(&from, block);
            }
        }
    }
}

/// A full sync cycle against a single peer: bulk sync when the peer is
/// strictly ahead, then watch sync until the peer goes away.
///
/// Spawned once per connect notification. Replacing or removing the peer's
/// handle cancels its queue and thereby ends the cycle, so at most one
/// cycle runs per peer at a time.
async fn run_sync_cycle<S>(inner: Arc<SyncerInner<S>>, peer: Arc<SyncPeer>, token: CancellationToken)
where
    S: Store + 'static,
{
    let cycle = async {
        if peer.status().difficulty > inner.local_status().difficulty {
            inner.bulk_sync_with_peer(&peer).await?;
        }

        inner.watch_sync_with_peer(&peer, |_| false).await
    };

    select! {
        _ = token.cancelled() => {}
        res = cycle => {
            if let Err(e) = res {
                warn!("Sync cycle with peer {} failed: {e}", peer.id());
                inner.event_pub.send(NodeEvent::SyncCycleFailed {
                    peer: peer.id().clone(),
                    error: e.to_string(),
                });
            }
        }
    }
}
