//! Utilities for writing tests.

use alloy_primitives::{Bytes, U256};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::block::{Block, Body, Header, ZERO_HASH};

/// [`Block`] generator for testing purposes.
///
/// Two generators created with the same seed produce identical chains, so
/// prefix-compatible chains of different lengths can be built by generating
/// different amounts from equally seeded generators. Generators created with
/// [`ChainGenerator::new`] are randomly seeded and produce independent
/// chains.
///
/// Every generated block has difficulty 1, so the total difficulty of a
/// generated chain orders chains by length.
#[derive(Debug, Clone)]
pub struct ChainGenerator {
    rng: StdRng,
    current: Option<Header>,
}

impl ChainGenerator {
    /// Creates a randomly seeded `ChainGenerator`.
    pub fn new() -> ChainGenerator {
        ChainGenerator::with_seed(rand::random())
    }

    /// Creates a `ChainGenerator` with a fixed seed.
    pub fn with_seed(seed: u64) -> ChainGenerator {
        ChainGenerator {
            rng: StdRng::seed_from_u64(seed),
            current: None,
        }
    }

    /// Generates the next block, starting from genesis.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Block {
        let extra: [u8; 8] = self.rng.gen();

        let header = match self.current {
            Some(ref prev) => Header::new(
                prev.number + 1,
                prev.hash(),
                U256::from(1),
                Bytes::copy_from_slice(&extra),
            ),
            None => Header::new(0, ZERO_HASH, U256::from(1), Bytes::copy_from_slice(&extra)),
        };

        self.current = Some(header.clone());

        Block::new(header, Body::default())
    }

    /// Generates the next amount of blocks.
    pub fn next_many(&mut self, amount: u64) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(amount as usize);

        for _ in 0..amount {
            blocks.push(self.next());
        }

        blocks
    }

    /// Generates a child of the provided header without advancing the
    /// generator.
    ///
    /// This can be used to create two blocks of the same height but
    /// a different hash, i.e. a fork.
    pub fn next_of(&mut self, header: &Header) -> Block {
        let extra: [u8; 8] = self.rng.gen();

        let header = Header::new(
            header.number + 1,
            header.hash(),
            U256::from(1),
            Bytes::copy_from_slice(&extra),
        );

        Block::new(header, Body::default())
    }

    /// The header of the most recently generated block.
    pub fn head(&self) -> Option<&Header> {
        self.current.as_ref()
    }
}

impl Default for ChainGenerator {
    fn default() -> Self {
        ChainGenerator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_chain() {
        let mut gen1 = ChainGenerator::with_seed(7);
        let mut gen2 = ChainGenerator::with_seed(7);

        let chain1 = gen1.next_many(10);
        let chain2 = gen2.next_many(20);

        for (a, b) in chain1.iter().zip(chain2.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn different_seeds_diverge_at_genesis() {
        let mut gen1 = ChainGenerator::with_seed(1);
        let mut gen2 = ChainGenerator::with_seed(2);

        assert_ne!(gen1.next().hash(), gen2.next().hash());
    }

    #[test]
    fn generated_chain_is_linked() {
        let mut gen = ChainGenerator::new();
        let blocks = gen.next_many(5);

        for pair in blocks.windows(2) {
            assert!(pair[0].header.is_parent_of(&pair[1].header));
        }

        assert_eq!(gen.head(), Some(&blocks[4].header));
    }

    #[test]
    fn next_of_creates_fork() {
        let mut gen = ChainGenerator::new();
        gen.next_many(3);

        let head = gen.head().unwrap().clone();
        let canonical = gen.next_of(&head);
        let fork = gen.next_of(&head);

        assert_eq!(canonical.number(), fork.number());
        assert_eq!(canonical.header.parent_hash, fork.header.parent_hash);
        assert_ne!(canonical.hash(), fork.hash());
    }
}
