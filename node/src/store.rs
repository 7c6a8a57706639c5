//! Abstraction of the chain storage engine.

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::broadcast;

use chainsync_types::{Block, Body, ChainStatus, Hash, Header, U256};

pub use in_memory_store::InMemoryStore;

mod in_memory_store;

type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Events published by a [`Store`] after a write has been fully applied.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A batch of blocks was written and the head potentially moved.
    BlocksWritten {
        /// Status of the head after the write.
        new_head: ChainStatus,
    },
}

/// Persistent storage and validation engine for the local chain.
///
/// Writes are atomic: a rejected batch leaves the store untouched.
#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// Returns the header of the current chain head.
    async fn head(&self) -> Result<Header>;

    /// Returns the header at `number` on the canonical chain.
    async fn header_by_number(&self, number: u64) -> Result<Option<Header>>;

    /// Returns the header with the given hash.
    async fn header_by_hash(&self, hash: &Hash) -> Result<Option<Header>>;

    /// Returns the body of the block with the given header hash.
    async fn body_by_hash(&self, hash: &Hash) -> Result<Option<Body>>;

    /// Write a batch of blocks.
    ///
    /// Every block must link to a known parent or to an earlier block of
    /// the same batch. The batch is applied in full or not at all.
    async fn write_blocks(&self, blocks: Vec<Block>) -> Result<()>;

    /// Returns the total difficulty of the current chain head.
    async fn current_total_difficulty(&self) -> Result<U256>;

    /// Returns the total difficulty accumulated up to the given block.
    async fn total_difficulty_by_hash(&self, hash: &Hash) -> Result<Option<U256>>;

    /// Subscribe to write-completion events.
    ///
    /// An event is observed only after the corresponding write has been
    /// fully applied.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Returns the status of the current chain head.
    async fn status(&self) -> Result<ChainStatus> {
        let head = self.head().await?;
        let total_difficulty = self.current_total_difficulty().await?;

        Ok(ChainStatus::from_header(&head, total_difficulty))
    }
}

/// Representation of the errors that a [`Store`] can produce.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store holds no blocks yet.
    #[error("Store has no blocks yet")]
    EmptyStore,

    /// The block already exists in the store.
    #[error("Hash {0} already exists in store")]
    HashExists(Hash),

    /// The block does not link to any known block.
    #[error("Parent {parent} of block {number} not known")]
    UnknownParent {
        /// Height of the rejected block.
        number: u64,
        /// The unknown parent hash.
        parent: Hash,
    },

    /// The store's indices are inconsistent.
    #[error("Store in inconsistent state; height {0} within known range, but missing header")]
    LostHeight(u64),

    /// The store's indices are inconsistent.
    #[error("Store in inconsistent state; height->hash mapping exists, {0} missing")]
    LostHash(Hash),
}
