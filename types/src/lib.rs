//! Core types for working with the chainsync node.
//!
//! This crate defines the chain data model shared by all chainsync
//! components: block [`Header`]s and [`Block`]s, and the [`ChainStatus`]
//! summary that nodes advertise to each other during synchronization.

#![cfg_attr(docsrs, feature(doc_cfg))]

mod block;
mod status;
#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-utils")))]
pub mod test_utils;

pub use crate::block::{Block, Body, Header, Hash, ZERO_HASH};
pub use crate::status::ChainStatus;

pub use alloy_primitives::{Bytes, U256};
