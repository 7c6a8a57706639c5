use alloy_primitives::{keccak256, Bytes, B256, U256};
use serde::{Deserialize, Deserializer, Serialize};

/// A block hash.
pub type Hash = B256;

/// The parent hash of a genesis block.
pub const ZERO_HASH: Hash = B256::ZERO;

/// A block header.
///
/// The header hash is computed once at construction and cached, so cloning
/// and re-hashing a header is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    /// Height of the block in the chain. Genesis has number 0.
    pub number: u64,
    /// Hash of the parent header, [`ZERO_HASH`] for genesis.
    pub parent_hash: Hash,
    /// Difficulty of this single block, not the cumulative chain difficulty.
    pub difficulty: U256,
    /// Arbitrary extra data sealed into the header.
    pub extra: Bytes,

    #[serde(skip_serializing)]
    hash: Hash,
}

// The cached hash is never trusted from the wire; it is recomputed from
// the deserialized fields.
impl<'de> Deserialize<'de> for Header {
    fn deserialize<D>(deserializer: D) -> Result<Header, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            number: u64,
            parent_hash: Hash,
            difficulty: U256,
            extra: Bytes,
        }

        let raw = Raw::deserialize(deserializer)?;

        Ok(Header::new(
            raw.number,
            raw.parent_hash,
            raw.difficulty,
            raw.extra,
        ))
    }
}

impl Header {
    /// Create a new header, computing its hash.
    pub fn new(number: u64, parent_hash: Hash, difficulty: U256, extra: Bytes) -> Header {
        let hash = compute_hash(number, &parent_hash, &difficulty, &extra);

        Header {
            number,
            parent_hash,
            difficulty,
            extra,
            hash,
        }
    }

    /// Hash of this header.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Returns true if this is a genesis header.
    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }

    /// Returns true if `child` directly extends this header.
    pub fn is_parent_of(&self, child: &Header) -> bool {
        child.number == self.number + 1 && child.parent_hash == self.hash
    }
}

fn compute_hash(number: u64, parent_hash: &Hash, difficulty: &U256, extra: &Bytes) -> Hash {
    let mut buf = Vec::with_capacity(8 + 32 + 32 + extra.len());

    buf.extend_from_slice(&number.to_be_bytes());
    buf.extend_from_slice(parent_hash.as_slice());
    buf.extend_from_slice(&difficulty.to_be_bytes::<32>());
    buf.extend_from_slice(extra);

    keccak256(buf)
}

/// A block body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    /// Raw transactions included in the block.
    pub transactions: Vec<Bytes>,
}

/// A full block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The block header.
    pub header: Header,
    /// The block body.
    pub body: Body,
}

impl Block {
    /// Create a new block.
    pub fn new(header: Header, body: Body) -> Block {
        Block { header, body }
    }

    /// Height of the block.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Hash of the block's header.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_hash_is_deterministic() {
        let a = Header::new(7, ZERO_HASH, U256::from(1), Bytes::from_static(b"x"));
        let b = Header::new(7, ZERO_HASH, U256::from(1), Bytes::from_static(b"x"));

        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);
    }

    #[test]
    fn header_hash_commits_to_all_fields() {
        let base = Header::new(7, ZERO_HASH, U256::from(1), Bytes::from_static(b"x"));

        let number = Header::new(8, ZERO_HASH, U256::from(1), Bytes::from_static(b"x"));
        let difficulty = Header::new(7, ZERO_HASH, U256::from(2), Bytes::from_static(b"x"));
        let extra = Header::new(7, ZERO_HASH, U256::from(1), Bytes::from_static(b"y"));

        assert_ne!(base.hash(), number.hash());
        assert_ne!(base.hash(), difficulty.hash());
        assert_ne!(base.hash(), extra.hash());
    }

    #[test]
    fn parent_linkage() {
        let genesis = Header::new(0, ZERO_HASH, U256::from(1), Bytes::new());
        let child = Header::new(1, genesis.hash(), U256::from(1), Bytes::new());
        let stranger = Header::new(1, ZERO_HASH, U256::from(1), Bytes::new());

        assert!(genesis.is_genesis());
        assert!(genesis.is_parent_of(&child));
        assert!(!genesis.is_parent_of(&stranger));
    }
}
