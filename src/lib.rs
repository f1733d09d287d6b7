//! Gossip sync management for the channel graph.
//!
//! This crate decides how aggressively a node exchanges channel-graph
//! gossip with each connected peer. It includes:
//!
//! - **Sync Manager**: Coordinates all per-peer syncers, bounds the number
//!   of active ones, and serializes the once-per-lifetime initial
//!   historical sync
//! - **Gossip Syncer**: Per-peer query exchange: historical channel-range
//!   syncs and passive/active gossip-filter transitions
//! - **Syncer Registry**: Disjoint active/passive maps behind one lock
//! - **Tickers**: Pausable tick sources for rotation and periodic
//!   historical re-syncs, swappable in tests
//!
//! ## Architecture
//!
//! The enclosing node registers a peer when its connection is ready and
//! deregisters it on disconnect. A single event loop task applies every
//! state change in order:
//!
//! 1. New peers get a passive syncer; the first one also volunteers for the
//!    initial historical sync
//! 2. Once that bootstrap completes, passive syncers are promoted until the
//!    active set is full
//! 3. A rotation ticker periodically swaps one active syncer for a passive
//!    one, and a second ticker forces historical re-syncs to repair gaps
//!
//! The manager holds no persistent state and never touches the graph
//! itself; reply messages are routed to each peer's syncer by the node's
//! read path.

pub mod config;
pub mod manager;
mod registry;
pub mod syncer;
pub mod ticker;
pub mod types;

pub use manager::{SyncManager, SyncManagerCfg, SyncManagerError};
pub use syncer::{GossipSyncer, GossipSyncerCfg, SyncState, SyncType, SyncerError};
pub use ticker::{ForceTickHandle, ForceTicker, IntervalTicker, Ticker};
pub use types::{
    ChainHash, GossipMessage, GraphTimeSeries, Peer, ShortChannelId, ShortIdEncoding,
};

#[cfg(test)]
mod tests;
