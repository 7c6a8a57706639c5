//! Utilities for writing tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use chainsync_types::test_utils::ChainGenerator;
use chainsync_types::{Block, ChainStatus, Header};

use crate::events::EventChannel;
use crate::network::{ClientError, GossipPublisher, NetworkEvent, PeerClient};
use crate::store::{InMemoryStore, Store};
use crate::syncer::{Syncer, SyncerArgs};

/// Returns a store holding a freshly generated chain of `amount` blocks,
/// together with the generator that produced it.
pub async fn gen_filled_store(amount: u64) -> (Arc<InMemoryStore>, ChainGenerator) {
    let store = Arc::new(InMemoryStore::new());
    let mut gen = ChainGenerator::new();

    store
        .write_blocks(gen.next_many(amount))
        .await
        .expect("inserting test data failed");

    (store, gen)
}

/// Same as [`gen_filled_store`] but with a seeded generator, for building
/// prefix-compatible chains.
pub async fn gen_filled_store_with_seed(amount: u64, seed: u64) -> (Arc<InMemoryStore>, ChainGenerator) {
    let store = Arc::new(InMemoryStore::new());
    let mut gen = ChainGenerator::with_seed(seed);

    store
        .write_blocks(gen.next_many(amount))
        .await
        .expect("inserting test data failed");

    (store, gen)
}

/// A [`PeerClient`] served directly from an in-memory chain, standing in
/// for a remote peer.
#[derive(Debug)]
pub struct TestPeer {
    chain: Option<Arc<InMemoryStore>>,
    header_requests: AtomicUsize,
}

impl TestPeer {
    /// Create a client serving the given chain.
    pub fn new(chain: Arc<InMemoryStore>) -> Arc<TestPeer> {
        Arc::new(TestPeer {
            chain: Some(chain),
            header_requests: AtomicUsize::new(0),
        })
    }

    /// Create a client whose every request fails, simulating an
    /// unresponsive peer.
    pub fn unreachable() -> Arc<TestPeer> {
        Arc::new(TestPeer {
            chain: None,
            header_requests: AtomicUsize::new(0),
        })
    }

    /// Amount of header requests served so far.
    pub fn header_requests(&self) -> usize {
        self.header_requests.load(Ordering::Relaxed)
    }

    fn chain(&self) -> Result<&InMemoryStore, ClientError> {
        self.chain.as_deref().ok_or(ClientError::ConnectionLost)
    }
}

#[async_trait]
impl PeerClient for TestPeer {
    async fn status(&self) -> Result<ChainStatus, ClientError> {
        self.chain()?
            .status()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))
    }

    async fn header_by_number(&self, number: u64) -> Result<Option<Header>, ClientError> {
        self.header_requests.fetch_add(1, Ordering::Relaxed);

        self.chain()?
            .header_by_number(number)
            .await
            .map_err(|e| ClientError::Request(e.to_string()))
    }

    async fn blocks_in_range(&self, from: u64, amount: u64) -> Result<Vec<Block>, ClientError> {
        let chain = self.chain()?;
        let mut blocks = Vec::new();

        for number in from..from + amount {
            match chain.block_by_number(number) {
                Some(block) => blocks.push(block),
                None => break,
            }
        }

        Ok(blocks)
    }
}

/// A [`GossipPublisher`] recording every published block.
#[derive(Debug, Default)]
pub struct TestGossip {
    published: Mutex<Vec<Block>>,
}

impl TestGossip {
    /// Create a new `TestGossip`.
    pub fn new() -> Arc<TestGossip> {
        Arc::new(TestGossip::default())
    }

    /// All blocks published so far.
    pub fn published(&self) -> Vec<Block> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl GossipPublisher for TestGossip {
    async fn publish(&self, block: Block) -> Result<(), ClientError> {
        self.published.lock().push(block);
        Ok(())
    }
}

/// A started [`Syncer`] together with the handles a test needs to drive
/// and observe it.
pub struct TestSyncerHarness {
    /// The syncer under test.
    pub syncer: Syncer<InMemoryStore>,
    /// Sender standing in for the network layer's notification stream.
    pub network_tx: mpsc::Sender<NetworkEvent>,
    /// The syncer's event channel.
    pub events: EventChannel,
    /// Gossip sink recording outward broadcasts.
    pub gossip: Arc<TestGossip>,
}

/// Start a syncer over the given store, wired to test collaborators.
pub async fn spawn_syncer(store: Arc<InMemoryStore>) -> TestSyncerHarness {
    let (network_tx, network_events) = mpsc::channel(16);
    let events = EventChannel::new();
    let gossip = TestGossip::new();

    let syncer = Syncer::start(SyncerArgs {
        store,
        network_events,
        gossip: gossip.clone(),
        event_pub: events.publisher(),
    })
    .await
    .expect("syncer failed to start");

    TestSyncerHarness {
        syncer,
        network_tx,
        events,
        gossip,
    }
}
