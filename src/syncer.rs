/// Per-peer gossip syncer.
///
/// A `GossipSyncer` owns the channel-range query exchange with a single
/// peer: it can run a historical sync that walks the peer's full channel
/// set, and it can move between passive and active gossip by updating the
/// remote node's timestamp filter. The sync manager creates one syncer per
/// registered peer and is the only caller of its lifecycle methods; reply
/// messages are fed in by the node's per-peer read path.
use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use libp2p_identity::PeerId;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::types::{ChainHash, GossipMessage, GraphTimeSeries, Peer, ShortChannelId, ShortIdEncoding};

/// How much gossip the local node wants from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// We send the peer a live gossip filter and accept streamed graph
    /// updates at the tip.
    Active,
    /// The syncer only answers queries; no tip streaming.
    Passive,
}

impl Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::Active => write!(f, "active"),
            SyncType::Passive => write!(f, "passive"),
        }
    }
}

/// Where the syncer stands in its query exchange.
///
/// Only a syncer in `ChansSynced` may accept a sync-type transition or start
/// a new historical sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// A channel range query is being prepared and sent.
    SyncingChans,
    /// Waiting for the batches answering our channel range query.
    WaitingQueryRangeReply,
    /// Waiting for the announcement stream answering a short-id query.
    WaitingQueryChanReply,
    /// No outstanding queries.
    ChansSynced,
}

/// Errors returned by syncer operations.
#[derive(Debug, Error)]
pub enum SyncerError {
    /// The syncer has been stopped.
    #[error("gossip syncer is shutting down")]
    Exiting,

    /// The requested operation needs the syncer idle, but queries are still
    /// in flight.
    #[error("gossip syncer busy in state {0:?}")]
    PendingQueries(SyncState),

    /// A reply arrived that the current state cannot consume.
    #[error("unexpected {0} in state {1:?}")]
    UnexpectedMessage(&'static str, SyncState),

    /// Handing a message to the peer's transport failed.
    #[error("send to peer failed: {0}")]
    Send(anyhow::Error),

    /// The channel-graph time series rejected a query.
    #[error("graph time series query failed: {0}")]
    Graph(anyhow::Error),
}

/// Immutable configuration of a [`GossipSyncer`].
pub struct GossipSyncerCfg {
    /// Chain whose graph is synced.
    pub chain_hash: ChainHash,
    /// Connection to the remote node.
    pub peer: Arc<dyn Peer>,
    /// Local channel-graph view, used to spot unknown channels.
    pub graph: Arc<dyn GraphTimeSeries>,
    /// Encoding requested for short channel id sets.
    pub encoding: ShortIdEncoding,
    /// Maximum short channel ids per query message.
    pub chunk_size: usize,
    /// Maximum unknown channels queried per historical pass.
    pub batch_size: usize,
}

/// Query-flow state guarded by one lock. The lock is never held across an
/// await; sends happen between state updates.
struct QueryFlow {
    state: SyncState,
    /// Ids accumulated from ReplyChannelRange batches.
    range_reply_ids: Vec<ShortChannelId>,
    /// Unknown ids not yet queried, drained chunk by chunk.
    unqueried: Vec<ShortChannelId>,
}

/// Gossip syncer for a single peer.
///
/// Created in `Passive` type and `ChansSynced` state. Started exactly once
/// after registration and stopped exactly once on deregistration or manager
/// shutdown; redundant stops are tolerated and logged.
pub struct GossipSyncer {
    cfg: GossipSyncerCfg,
    peer_id: PeerId,
    sync_type: Mutex<SyncType>,
    flow: Mutex<QueryFlow>,
    /// Waiters notified on the next transition into `ChansSynced`.
    synced_signals: Mutex<Vec<oneshot::Sender<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl GossipSyncer {
    pub fn new(cfg: GossipSyncerCfg) -> Self {
        let peer_id = cfg.peer.pubkey();
        Self {
            cfg,
            peer_id,
            sync_type: Mutex::new(SyncType::Passive),
            flow: Mutex::new(QueryFlow {
                state: SyncState::ChansSynced,
                range_reply_ids: Vec::new(),
                unqueried: Vec::new(),
            }),
            synced_signals: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Public key of the peer this syncer talks to.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Current query-flow state.
    pub fn sync_state(&self) -> SyncState {
        self.flow.lock().state
    }

    /// Current sync type.
    pub fn sync_type(&self) -> SyncType {
        *self.sync_type.lock()
    }

    /// Record the sync type without touching the remote filter.
    ///
    /// Used once at registration time, before the syncer is started. Later
    /// changes go through [`GossipSyncer::process_sync_transition`] so the
    /// peer learns about them.
    pub fn set_sync_type(&self, sync_type: SyncType) {
        *self.sync_type.lock() = sync_type;
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Mark the syncer running.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(peer = %self.peer_id, "Gossip syncer already started");
            return;
        }

        debug!(peer = %self.peer_id, "Gossip syncer started");
    }

    /// Tear the syncer down. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!(peer = %self.peer_id, "Gossip syncer already stopped");
            return;
        }

        // Dropping the senders wakes anyone still waiting on a synced
        // signal with a recv error.
        self.synced_signals.lock().clear();
        debug!(peer = %self.peer_id, "Gossip syncer stopped");
    }

    /// Signal resolved on the next transition into `ChansSynced`.
    pub fn reset_synced_signal(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.synced_signals.lock().push(tx);
        rx
    }

    /// Move the syncer between passive and active gossip.
    ///
    /// Sends the matching timestamp filter to the peer over the acknowledged
    /// send and records the new type once delivery is confirmed. Refused
    /// while queries are outstanding.
    pub async fn process_sync_transition(&self, sync_type: SyncType) -> Result<(), SyncerError> {
        if self.is_stopped() {
            return Err(SyncerError::Exiting);
        }

        {
            let flow = self.flow.lock();
            if flow.state != SyncState::ChansSynced {
                return Err(SyncerError::PendingQueries(flow.state));
            }
        }

        let filter = match sync_type {
            SyncType::Active => GossipMessage::GossipTimestampRange {
                chain_hash: self.cfg.chain_hash,
                first_timestamp: unix_timestamp(),
                timestamp_range: u32::MAX,
            },
            // An empty filter tells the peer to stop streaming updates.
            SyncType::Passive => GossipMessage::GossipTimestampRange {
                chain_hash: self.cfg.chain_hash,
                first_timestamp: 0,
                timestamp_range: 0,
            },
        };

        self.cfg
            .peer
            .send_message_acked(filter)
            .await
            .map_err(SyncerError::Send)?;

        *self.sync_type.lock() = sync_type;
        info!(peer = %self.peer_id, %sync_type, "Gossip syncer transitioned");

        Ok(())
    }

    /// Start a historical sync covering the peer's full channel set.
    ///
    /// Sends a channel range query over all blocks and moves into
    /// `WaitingQueryRangeReply`. Refused while queries are outstanding; on a
    /// failed send the syncer falls back to `ChansSynced`.
    pub async fn historical_sync(&self) -> Result<(), SyncerError> {
        if self.is_stopped() {
            return Err(SyncerError::Exiting);
        }

        {
            let mut flow = self.flow.lock();
            if flow.state != SyncState::ChansSynced {
                return Err(SyncerError::PendingQueries(flow.state));
            }
            flow.state = SyncState::SyncingChans;
            flow.range_reply_ids.clear();
            flow.unqueried.clear();
        }

        let query = GossipMessage::QueryChannelRange {
            chain_hash: self.cfg.chain_hash,
            first_block: 0,
            num_blocks: u32::MAX,
        };

        debug!(peer = %self.peer_id, "Starting historical channel range sync");

        match self.cfg.peer.send_message(query).await {
            Ok(()) => {
                self.flow.lock().state = SyncState::WaitingQueryRangeReply;
                Ok(())
            }
            Err(err) => {
                self.flow.lock().state = SyncState::ChansSynced;
                Err(SyncerError::Send(err))
            }
        }
    }

    /// Feed a gossip reply from the peer into the query flow.
    ///
    /// Called by the node's per-peer read path for every sync-related
    /// message the peer sends us.
    pub async fn process_gossip_msg(&self, message: GossipMessage) -> Result<(), SyncerError> {
        if self.is_stopped() {
            return Err(SyncerError::Exiting);
        }

        match message {
            GossipMessage::ReplyChannelRange {
                complete,
                short_chan_ids,
                ..
            } => self.handle_reply_chan_range(complete, short_chan_ids).await,
            GossipMessage::ReplyShortChanIdsEnd { complete, .. } => {
                self.handle_reply_short_ids_end(complete).await
            }
            other => Err(SyncerError::UnexpectedMessage(
                other.name(),
                self.sync_state(),
            )),
        }
    }

    async fn handle_reply_chan_range(
        &self,
        complete: bool,
        short_chan_ids: Vec<ShortChannelId>,
    ) -> Result<(), SyncerError> {
        let buffered = {
            let mut flow = self.flow.lock();
            if flow.state != SyncState::WaitingQueryRangeReply {
                return Err(SyncerError::UnexpectedMessage(
                    "reply_channel_range",
                    flow.state,
                ));
            }

            flow.range_reply_ids.extend(short_chan_ids);
            if !complete {
                return Ok(());
            }

            std::mem::take(&mut flow.range_reply_ids)
        };

        let advertised = buffered.len();
        let mut unknown = self
            .cfg
            .graph
            .filter_known_chan_ids(self.cfg.chain_hash, buffered)
            .await
            .map_err(|err| {
                self.abort_query_flow();
                SyncerError::Graph(err)
            })?;

        if unknown.len() > self.cfg.batch_size {
            warn!(
                peer = %self.peer_id,
                unknown = unknown.len(),
                batch_size = self.cfg.batch_size,
                "Too many unknown channels, deferring the rest to the next sync"
            );
            unknown.truncate(self.cfg.batch_size);
        }

        debug!(
            peer = %self.peer_id,
            advertised,
            unknown = unknown.len(),
            "Channel range reply complete"
        );

        if unknown.is_empty() {
            self.enter_chans_synced();
            return Ok(());
        }

        self.flow.lock().unqueried = unknown;
        self.send_next_chunk().await
    }

    async fn handle_reply_short_ids_end(&self, complete: bool) -> Result<(), SyncerError> {
        let remaining = {
            let flow = self.flow.lock();
            if flow.state != SyncState::WaitingQueryChanReply {
                return Err(SyncerError::UnexpectedMessage(
                    "reply_short_chan_ids_end",
                    flow.state,
                ));
            }
            flow.unqueried.len()
        };

        if !complete {
            // The peer refused part of the query. Later periodic re-syncs
            // will retry whatever it withheld.
            warn!(peer = %self.peer_id, "Peer could not answer full short chan ids query");
        }

        if remaining == 0 {
            self.enter_chans_synced();
            return Ok(());
        }

        self.send_next_chunk().await
    }

    /// Send the next chunk of unknown channel ids, entering
    /// `WaitingQueryChanReply`. One chunk is in flight at a time.
    async fn send_next_chunk(&self) -> Result<(), SyncerError> {
        let chunk: Vec<ShortChannelId> = {
            let mut flow = self.flow.lock();
            let take = self.cfg.chunk_size.min(flow.unqueried.len());
            flow.state = SyncState::WaitingQueryChanReply;
            flow.unqueried.drain(..take).collect()
        };

        debug!(
            peer = %self.peer_id,
            num_chans = chunk.len(),
            "Querying announcements for unknown channels"
        );

        let query = GossipMessage::QueryShortChanIds {
            chain_hash: self.cfg.chain_hash,
            encoding: self.cfg.encoding,
            short_chan_ids: chunk,
        };

        self.cfg.peer.send_message(query).await.map_err(|err| {
            self.abort_query_flow();
            SyncerError::Send(err)
        })
    }

    /// Abandon the in-flight sync after a failure, returning to idle
    /// without notifying synced-signal waiters.
    fn abort_query_flow(&self) {
        let mut flow = self.flow.lock();
        flow.state = SyncState::ChansSynced;
        flow.range_reply_ids.clear();
        flow.unqueried.clear();
    }

    fn enter_chans_synced(&self) {
        self.flow.lock().state = SyncState::ChansSynced;
        info!(peer = %self.peer_id, "Channel graph synced with peer");

        for waiter in self.synced_signals.lock().drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default() as u32
}
