use std::fmt;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::block::{Hash, Header};

/// A summary of a chain head: the data a node advertises to its peers.
///
/// `number` and `hash` always refer to the same header. `difficulty` is the
/// cumulative difficulty of the whole chain up to that header, never the
/// difficulty of a single block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    /// Height of the chain head.
    pub number: u64,
    /// Hash of the chain head.
    pub hash: Hash,
    /// Total difficulty from genesis to the chain head.
    pub difficulty: U256,
}

impl ChainStatus {
    /// Create a status for `header` with the given total difficulty.
    pub fn from_header(header: &Header, total_difficulty: U256) -> ChainStatus {
        ChainStatus {
            number: header.number,
            hash: header.hash(),
            difficulty: total_difficulty,
        }
    }

    /// Project this status forward over a newly announced header.
    ///
    /// Peers announce single blocks, not their cumulative total difficulty,
    /// so the new total is approximated by adding the header's own
    /// difficulty to the previously known total.
    pub fn advance(&self, header: &Header) -> ChainStatus {
        ChainStatus {
            number: header.number,
            hash: header.hash(),
            difficulty: self.difficulty + header.difficulty,
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ZERO_HASH;
    use alloy_primitives::Bytes;

    #[test]
    fn advance_accumulates_difficulty() {
        let genesis = Header::new(0, ZERO_HASH, U256::from(1), Bytes::new());
        let next = Header::new(1, genesis.hash(), U256::from(3), Bytes::new());

        let status = ChainStatus::from_header(&genesis, U256::from(1));
        let advanced = status.advance(&next);

        assert_eq!(advanced.number, 1);
        assert_eq!(advanced.hash, next.hash());
        assert_eq!(advanced.difficulty, U256::from(4));
    }
}
