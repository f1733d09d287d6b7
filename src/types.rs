use std::fmt::{self, Display};

use alloy_primitives::FixedBytes;
use anyhow::Result;
use async_trait::async_trait;
use libp2p_identity::PeerId;
use serde::Serialize;

/// Identifier of the chain whose channel graph is being gossiped.
///
/// Every query and filter message carries it so that peers on a different
/// chain can discard the request outright.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChainHash(pub FixedBytes<32>);

impl Display for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Compact identifier of a channel: block height, transaction index and
/// output index packed into a u64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ShortChannelId(pub u64);

impl Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Encoding requested for short channel id sets inside channel queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShortIdEncoding {
    /// Ids sent as a sorted array of raw u64s.
    Plain,
    /// Ids sent as a sorted array compressed with zlib.
    Zlib,
}

/// Gossip query and filter messages exchanged with a peer.
///
/// These are in-memory protocol messages only. Serialization onto the wire
/// belongs to the enclosing node, which hands them to the peer's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    /// Filter telling the remote node which update timestamps we want
    /// streamed to us at the tip.
    GossipTimestampRange {
        chain_hash: ChainHash,
        first_timestamp: u32,
        timestamp_range: u32,
    },
    /// Query for the set of channels opened within a block range.
    QueryChannelRange {
        chain_hash: ChainHash,
        first_block: u32,
        num_blocks: u32,
    },
    /// One batch of short channel ids answering a QueryChannelRange.
    /// `complete` marks the final batch.
    ReplyChannelRange {
        chain_hash: ChainHash,
        complete: bool,
        short_chan_ids: Vec<ShortChannelId>,
    },
    /// Query for the announcements of specific channels.
    QueryShortChanIds {
        chain_hash: ChainHash,
        encoding: ShortIdEncoding,
        short_chan_ids: Vec<ShortChannelId>,
    },
    /// Terminator the remote node sends once every announcement for a
    /// QueryShortChanIds has been streamed.
    ReplyShortChanIdsEnd { chain_hash: ChainHash, complete: bool },
}

impl GossipMessage {
    /// Message name for log and error output.
    pub fn name(&self) -> &'static str {
        match self {
            GossipMessage::GossipTimestampRange { .. } => "gossip_timestamp_range",
            GossipMessage::QueryChannelRange { .. } => "query_channel_range",
            GossipMessage::ReplyChannelRange { .. } => "reply_channel_range",
            GossipMessage::QueryShortChanIds { .. } => "query_short_chan_ids",
            GossipMessage::ReplyShortChanIdsEnd { .. } => "reply_short_chan_ids_end",
        }
    }
}

/// Connected peer as seen by the sync manager.
///
/// Abstracts the connection layer to allow testing with mocks. The two send
/// operations differ only in delivery guarantees: `send_message` queues the
/// message best-effort, `send_message_acked` resolves once the transport has
/// acknowledged delivery.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Public key identifying the peer.
    fn pubkey(&self) -> PeerId;

    /// Queue a message for delivery, best-effort.
    async fn send_message(&self, message: GossipMessage) -> Result<()>;

    /// Send a message and wait until the transport acknowledges it.
    async fn send_message_acked(&self, message: GossipMessage) -> Result<()>;
}

/// Read access to the node's channel-graph time series.
///
/// The sync manager itself never touches the graph. The handle is passed to
/// each per-peer syncer, which uses it to decide which advertised channels
/// are actually news to us.
#[async_trait]
pub trait GraphTimeSeries: Send + Sync {
    /// Filter a set of advertised channel ids down to the ones the local
    /// graph has no announcement for.
    async fn filter_known_chan_ids(
        &self,
        chain_hash: ChainHash,
        short_chan_ids: Vec<ShortChannelId>,
    ) -> Result<Vec<ShortChannelId>>;
}
