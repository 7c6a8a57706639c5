//! Block synchronization engine of the chainsync node.
//!
//! The [`Syncer`] keeps the local chain converged with the best chain known
//! among the connected peers. It tracks every peer's advertised head,
//! catches up to peers that are ahead with a one-shot bulk sync, and then
//! stays current by applying blocks as peers announce them.
//!
//! The peer-to-peer transport and the chain storage engine are consumed as
//! opaque collaborators: the network delivers [`NetworkEvent`]s and a
//! dialed [`PeerClient`] per peer, and the chain is persisted through the
//! [`Store`] trait.
//!
//! [`Syncer`]: crate::syncer::Syncer
//! [`NetworkEvent`]: crate::network::NetworkEvent
//! [`PeerClient`]: crate::network::PeerClient
//! [`Store`]: crate::store::Store

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod events;
pub mod network;
pub mod peer_tracker;
pub mod store;
pub mod syncer;
#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-utils")))]
pub mod test_utils;
