use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use chainsync_types::{Block, Body, ChainStatus, Hash, Header, U256};

use crate::store::{Result, Store, StoreError, StoreEvent};

/// A non-persistent in memory [`Store`] implementation.
///
/// Blocks are accepted when they link to a known parent, and the head
/// follows the branch with the greatest total difficulty.
#[derive(Debug)]
pub struct InMemoryStore {
    /// Maps block hash to the block itself.
    blocks: DashMap<Hash, Block>,
    /// Maps height to hash along the canonical chain.
    height_to_hash: DashMap<u64, Hash>,
    /// Maps block hash to the total difficulty accumulated up to it.
    total_difficulty: DashMap<Hash, U256>,
    /// Hash of the current head. Also serializes writers.
    head: RwLock<Option<Hash>>,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl InMemoryStore {
    /// Create a new store.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(16);

        InMemoryStore {
            blocks: DashMap::new(),
            height_to_hash: DashMap::new(),
            total_difficulty: DashMap::new(),
            head: RwLock::new(None),
            event_tx,
        }
    }

    /// Returns the full block at `number` on the canonical chain.
    pub fn block_by_number(&self, number: u64) -> Option<Block> {
        let hash = *self.height_to_hash.get(&number)?;
        self.blocks.get(&hash).map(|block| block.clone())
    }

    /// Height of the current head, if any block was written.
    pub fn head_height(&self) -> Option<u64> {
        let hash = (*self.head.read())?;
        self.blocks.get(&hash).map(|block| block.number())
    }

    fn header_of(&self, hash: &Hash) -> Result<Header> {
        self.blocks
            .get(hash)
            .map(|block| block.header.clone())
            .ok_or(StoreError::LostHash(*hash))
    }

    /// Point the canonical height index at the branch ending in `head`.
    fn reindex_canonical(&self, head: &Hash) -> Result<()> {
        let mut hash = *head;

        loop {
            let header = self.header_of(&hash)?;

            let known = self.height_to_hash.insert(header.number, hash);
            if known == Some(hash) || header.is_genesis() {
                break;
            }

            hash = header.parent_hash;
        }

        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn head(&self) -> Result<Header> {
        let hash = (*self.head.read()).ok_or(StoreError::EmptyStore)?;
        self.header_of(&hash)
    }

    async fn header_by_number(&self, number: u64) -> Result<Option<Header>> {
        let Some(hash) = self.height_to_hash.get(&number).map(|pair| *pair) else {
            return Ok(None);
        };

        self.header_of(&hash).map(Some)
    }

    async fn header_by_hash(&self, hash: &Hash) -> Result<Option<Header>> {
        Ok(self.blocks.get(hash).map(|block| block.header.clone()))
    }

    async fn body_by_hash(&self, hash: &Hash) -> Result<Option<Body>> {
        Ok(self.blocks.get(hash).map(|block| block.body.clone()))
    }

    async fn write_blocks(&self, blocks: Vec<Block>) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut head = self.head.write();

        // Validate the whole batch before mutating anything, so a rejected
        // batch leaves the store untouched.
        let mut batch_difficulty: HashMap<Hash, U256> = HashMap::with_capacity(blocks.len());

        for block in &blocks {
            let header = &block.header;

            if self.blocks.contains_key(&header.hash())
                || batch_difficulty.contains_key(&header.hash())
            {
                return Err(StoreError::HashExists(header.hash()));
            }

            let parent_difficulty = self
                .total_difficulty
                .get(&header.parent_hash)
                .map(|pair| *pair)
                .or_else(|| batch_difficulty.get(&header.parent_hash).copied());

            let total = match parent_difficulty {
                Some(parent) => parent + header.difficulty,
                None if header.is_genesis() && head.is_none() => header.difficulty,
                None => {
                    return Err(StoreError::UnknownParent {
                        number: header.number,
                        parent: header.parent_hash,
                    })
                }
            };

            batch_difficulty.insert(header.hash(), total);
        }

        let mut best = match *head {
            Some(hash) => {
                let difficulty = self
                    .total_difficulty
                    .get(&hash)
                    .map(|pair| *pair)
                    .ok_or(StoreError::LostHash(hash))?;
                Some((hash, difficulty))
            }
            None => None,
        };

        for block in blocks {
            let hash = block.hash();
            let number = block.number();
            let total = batch_difficulty[&hash];

            debug!("Inserting block {hash} with height {number}");
            self.blocks.insert(hash, block);
            self.total_difficulty.insert(hash, total);

            // Heaviest chain wins.
            match best {
                Some((_, difficulty)) if total <= difficulty => {}
                _ => best = Some((hash, total)),
            }
        }

        let (new_head, new_difficulty) = best.ok_or(StoreError::EmptyStore)?;

        let new_head_header = self.header_of(&new_head)?;

        if *head != Some(new_head) {
            let old_height = match *head {
                Some(hash) => Some(self.header_of(&hash)?.number),
                None => None,
            };

            self.reindex_canonical(&new_head)?;

            // A heavier branch can be shorter. Heights above the new head
            // belong to the abandoned branch and are no longer canonical.
            if let Some(old_height) = old_height {
                for number in new_head_header.number + 1..=old_height {
                    self.height_to_hash.remove(&number);
                }
            }

            *head = Some(new_head);
        }

        drop(head);

        // Error is produced if there aren't any subscribers, which is fine.
        let _ = self.event_tx.send(StoreEvent::BlocksWritten {
            new_head: ChainStatus::from_header(&new_head_header, new_difficulty),
        });

        Ok(())
    }

    async fn current_total_difficulty(&self) -> Result<U256> {
        let hash = (*self.head.read()).ok_or(StoreError::EmptyStore)?;

        self.total_difficulty
            .get(&hash)
            .map(|pair| *pair)
            .ok_or(StoreError::LostHash(hash))
    }

    async fn total_difficulty_by_hash(&self, hash: &Hash) -> Result<Option<U256>> {
        Ok(self.total_difficulty.get(hash).map(|pair| *pair))
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_types::test_utils::ChainGenerator;
    use chainsync_types::Bytes;

    #[tokio::test]
    async fn write_and_read_back() {
        let store = InMemoryStore::new();
        let mut gen = ChainGenerator::new();
        let blocks = gen.next_many(5);

        store.write_blocks(blocks.clone()).await.unwrap();

        let head = store.head().await.unwrap();
        assert_eq!(head, blocks[4].header);
        assert_eq!(store.head_height(), Some(4));

        for block in &blocks {
            let header = store.header_by_number(block.number()).await.unwrap();
            assert_eq!(header.as_ref(), Some(&block.header));

            let header = store.header_by_hash(&block.hash()).await.unwrap();
            assert_eq!(header.as_ref(), Some(&block.header));

            let body = store.body_by_hash(&block.hash()).await.unwrap();
            assert_eq!(body.as_ref(), Some(&block.body));

            // Difficulty 1 per generated block.
            let total = store.total_difficulty_by_hash(&block.hash()).await.unwrap();
            assert_eq!(total, Some(U256::from(block.number() + 1)));
        }

        let total = store.current_total_difficulty().await.unwrap();
        assert_eq!(total, U256::from(5));

        assert_eq!(store.header_by_hash(&Hash::ZERO).await.unwrap(), None);
        assert_eq!(store.total_difficulty_by_hash(&Hash::ZERO).await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_store_errors() {
        let store = InMemoryStore::new();

        assert!(matches!(store.head().await, Err(StoreError::EmptyStore)));
        assert!(matches!(
            store.current_total_difficulty().await,
            Err(StoreError::EmptyStore)
        ));
        assert_eq!(store.header_by_number(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_unknown_parent_atomically() {
        let store = InMemoryStore::new();
        let mut gen = ChainGenerator::new();
        store.write_blocks(gen.next_many(3)).await.unwrap();

        let mut stranger = ChainGenerator::new();
        stranger.next_many(4);
        let orphan = stranger.next();

        let res = store.write_blocks(vec![orphan]).await;
        assert!(matches!(res, Err(StoreError::UnknownParent { .. })));

        // Nothing from the rejected batch was applied.
        assert_eq!(store.head_height(), Some(2));
    }

    #[tokio::test]
    async fn rejects_duplicate_blocks() {
        let store = InMemoryStore::new();
        let mut gen = ChainGenerator::new();
        let blocks = gen.next_many(2);

        store.write_blocks(blocks.clone()).await.unwrap();

        let res = store.write_blocks(vec![blocks[1].clone()]).await;
        assert!(matches!(res, Err(StoreError::HashExists(_))));
    }

    #[tokio::test]
    async fn heavier_fork_becomes_canonical() {
        let store = InMemoryStore::new();
        let mut gen = ChainGenerator::new();
        let blocks = gen.next_many(5);

        store.write_blocks(blocks.clone()).await.unwrap();

        // A competing branch from height 3 that outgrows the current head.
        let fork3 = gen.next_of(&blocks[2].header);
        let fork4 = gen.next_of(&fork3.header);
        let fork5 = gen.next_of(&fork4.header);
        let fork_head = fork5.header.clone();

        store
            .write_blocks(vec![fork3.clone(), fork4, fork5])
            .await
            .unwrap();

        let head = store.head().await.unwrap();
        assert_eq!(head, fork_head);
        assert_eq!(store.current_total_difficulty().await.unwrap(), U256::from(6));

        // Canonical index now follows the fork.
        let at3 = store.header_by_number(3).await.unwrap().unwrap();
        assert_eq!(at3, fork3.header);
    }

    #[tokio::test]
    async fn reorg_to_heavier_shorter_branch_prunes_canonical_heights() {
        let store = InMemoryStore::new();
        let mut gen = ChainGenerator::new();
        let blocks = gen.next_many(5);

        store.write_blocks(blocks.clone()).await.unwrap();

        // A single block forking from genesis that outweighs the whole
        // chain at once.
        let heavy_header = Header::new(
            1,
            blocks[0].hash(),
            U256::from(100),
            Bytes::from_static(b"heavy"),
        );
        let heavy = Block::new(heavy_header.clone(), Body::default());

        store.write_blocks(vec![heavy]).await.unwrap();

        let head = store.head().await.unwrap();
        assert_eq!(head, heavy_header);
        assert_eq!(store.head_height(), Some(1));

        // The abandoned branch's heights are no longer canonical.
        for number in 2..5 {
            assert_eq!(store.header_by_number(number).await.unwrap(), None);
        }

        assert_eq!(
            store.header_by_number(1).await.unwrap(),
            Some(heavy_header)
        );
        assert_eq!(
            store.header_by_number(0).await.unwrap().as_ref(),
            Some(&blocks[0].header)
        );
    }

    #[tokio::test]
    async fn lighter_fork_does_not_move_head() {
        let store = InMemoryStore::new();
        let mut gen = ChainGenerator::new();
        let blocks = gen.next_many(5);

        store.write_blocks(blocks.clone()).await.unwrap();

        let fork3 = gen.next_of(&blocks[2].header);
        store.write_blocks(vec![fork3]).await.unwrap();

        let head = store.head().await.unwrap();
        assert_eq!(head, blocks[4].header);

        let at3 = store.header_by_number(3).await.unwrap().unwrap();
        assert_eq!(at3, blocks[3].header);
    }

    #[tokio::test]
    async fn write_event_signals_applied_state() {
        let store = InMemoryStore::new();
        let mut subscriber = store.subscribe();

        let mut gen = ChainGenerator::new();
        let blocks = gen.next_many(3);
        let head = blocks[2].header.clone();

        store.write_blocks(blocks).await.unwrap();

        let StoreEvent::BlocksWritten { new_head } = subscriber.recv().await.unwrap();
        assert_eq!(new_head, ChainStatus::from_header(&head, U256::from(3)));
    }
}
