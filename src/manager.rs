/// Gossip sync manager.
///
/// The manager decides, for every connected peer, how aggressively the node
/// exchanges channel-graph gossip with it. At most a configured number of
/// peers are kept as active syncers receiving graph updates at the tip;
/// everyone else stays passive. On first connection the manager runs a
/// once-per-lifetime initial historical sync against a single peer and
/// defers all active slots until that bootstrap completes.
///
/// All state changes flow through one long-lived event loop task, giving a
/// total order over registrations, deregistrations, tick-driven rotations
/// and the bootstrap hand-off. Public calls talk to the loop over a bounded
/// request channel and block on a per-request done signal, so a successful
/// `register_peer` guarantees the syncer is already visible to lookups.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use libp2p_identity::PeerId;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_HISTORICAL_SYNC_INTERVAL,
    DEFAULT_NUM_ACTIVE_SYNCERS, DEFAULT_ROTATION_INTERVAL, REQUEST_CHANNEL_CAPACITY,
};
use crate::registry::SyncerRegistry;
use crate::syncer::{GossipSyncer, GossipSyncerCfg, SyncState, SyncType};
use crate::ticker::{IntervalTicker, Ticker};
use crate::types::{ChainHash, GraphTimeSeries, Peer, ShortIdEncoding};

/// Errors surfaced by the manager's public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncManagerError {
    /// The manager has been stopped, or is stopping.
    #[error("sync manager exiting")]
    Exiting,
}

/// Configuration of a [`SyncManager`].
pub struct SyncManagerCfg {
    /// Chain whose channel graph is synced.
    pub chain_hash: ChainHash,
    /// Local channel-graph view handed to every syncer.
    pub graph: Arc<dyn GraphTimeSeries>,
    /// Number of peers kept as active syncers.
    pub num_active_syncers: usize,
    /// Tick source for active-syncer rotation.
    pub rotation_ticker: Box<dyn Ticker>,
    /// Tick source for periodic forced historical syncs.
    pub historical_sync_ticker: Box<dyn Ticker>,
    /// Encoding requested for short channel id sets.
    pub encoding: ShortIdEncoding,
    /// Maximum short channel ids per query message.
    pub chunk_size: usize,
    /// Maximum unknown channels queried per historical pass.
    pub batch_size: usize,
}

impl SyncManagerCfg {
    /// Configuration with the default peer count, intervals and query
    /// sizing.
    pub fn new(chain_hash: ChainHash, graph: Arc<dyn GraphTimeSeries>) -> Self {
        Self {
            chain_hash,
            graph,
            num_active_syncers: DEFAULT_NUM_ACTIVE_SYNCERS,
            rotation_ticker: Box::new(IntervalTicker::new(DEFAULT_ROTATION_INTERVAL)),
            historical_sync_ticker: Box::new(IntervalTicker::new(DEFAULT_HISTORICAL_SYNC_INTERVAL)),
            encoding: ShortIdEncoding::Plain,
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Request handed from the public API to the event loop. The done sender
/// acknowledges the request once the loop has applied it.
enum SyncManagerRequest {
    RegisterPeer {
        peer: Arc<dyn Peer>,
        done: oneshot::Sender<()>,
    },
    DeregisterPeer {
        peer_id: PeerId,
        done: oneshot::Sender<()>,
    },
}

/// Coordinator of all per-peer gossip syncers.
pub struct SyncManager {
    pub(crate) registry: Arc<SyncerRegistry>,
    request_tx: mpsc::Sender<SyncManagerRequest>,
    quit: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    /// Event loop state, taken by the first `start`.
    event_loop: Mutex<Option<EventLoop>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(cfg: SyncManagerCfg) -> Self {
        let registry = Arc::new(SyncerRegistry::default());
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let quit = CancellationToken::new();

        let event_loop = EventLoop {
            chain_hash: cfg.chain_hash,
            graph: cfg.graph,
            num_active_syncers: cfg.num_active_syncers,
            encoding: cfg.encoding,
            chunk_size: cfg.chunk_size,
            batch_size: cfg.batch_size,
            registry: Arc::clone(&registry),
            requests: request_rx,
            rotation_ticker: cfg.rotation_ticker,
            historical_sync_ticker: cfg.historical_sync_ticker,
            quit: quit.clone(),
            attempt_initial_historical_sync: true,
            initial_historical_sync_completed: false,
            initial_historical_syncer: None,
            initial_sync_signal: None,
        };

        Self {
            registry,
            request_tx,
            quit,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            event_loop: Mutex::new(Some(event_loop)),
            event_loop_handle: Mutex::new(None),
        }
    }

    /// Launch the event loop. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(event_loop) = self.event_loop.lock().take() else {
            return;
        };

        info!("Sync manager started");
        *self.event_loop_handle.lock() = Some(tokio::spawn(event_loop.run()));
    }

    /// Shut the manager down and stop every remaining syncer. Idempotent.
    ///
    /// Pending public calls are preempted and return
    /// [`SyncManagerError::Exiting`]; syncers registered before the quit
    /// signal are still stopped.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Sync manager shutting down");
        self.quit.cancel();

        let handle = self.event_loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(?err, "Sync manager event loop task failed");
            }
        }

        // Stops after shutdown are serialized; loop liveness no longer
        // matters.
        for syncer in self.registry.drain() {
            syncer.stop().await;
        }
    }

    /// Register a connected peer and block until its syncer is created and
    /// started.
    ///
    /// Once this returns `Ok`, the syncer is observable through
    /// [`SyncManager::gossip_syncer`]. Registering an already-known peer is
    /// a no-op. Returns [`SyncManagerError::Exiting`] when the manager is
    /// shutting down.
    pub async fn register_peer(&self, peer: Arc<dyn Peer>) -> Result<(), SyncManagerError> {
        let (done_tx, done_rx) = oneshot::channel();
        let request = SyncManagerRequest::RegisterPeer {
            peer,
            done: done_tx,
        };

        tokio::select! {
            sent = self.request_tx.send(request) => {
                if sent.is_err() {
                    return Err(SyncManagerError::Exiting);
                }
            }
            () = self.quit.cancelled() => return Err(SyncManagerError::Exiting),
        }

        tokio::select! {
            done = done_rx => done.map_err(|_| SyncManagerError::Exiting),
            () = self.quit.cancelled() => Err(SyncManagerError::Exiting),
        }
    }

    /// Remove a peer's syncer and block until the event loop has let go of
    /// it.
    ///
    /// Never fails: when the manager is shutting down the syncer is torn
    /// down by [`SyncManager::stop`] anyway.
    pub async fn deregister_peer(&self, peer_id: PeerId) {
        let (done_tx, done_rx) = oneshot::channel();
        let request = SyncManagerRequest::DeregisterPeer {
            peer_id,
            done: done_tx,
        };

        tokio::select! {
            sent = self.request_tx.send(request) => {
                if sent.is_err() {
                    return;
                }
            }
            () = self.quit.cancelled() => return,
        }

        tokio::select! {
            _ = done_rx => {}
            () = self.quit.cancelled() => {}
        }
    }

    /// Look up the syncer of a registered peer.
    pub fn gossip_syncer(&self, peer_id: &PeerId) -> Option<Arc<GossipSyncer>> {
        self.registry.lookup(peer_id)
    }

    /// Snapshot of every registered syncer, active and passive.
    pub fn gossip_syncers(&self) -> HashMap<PeerId, Arc<GossipSyncer>> {
        self.registry.snapshot()
    }
}

/// Event selected by one loop iteration.
enum LoopEvent {
    Request(SyncManagerRequest),
    InitialHistoricalSyncDone,
    InitialSyncSignalLost,
    RotationTick,
    HistoricalSyncTick,
    Quit,
}

/// Single-task event loop owning the bootstrap state.
///
/// Every mutation of the registry during normal operation happens here, so
/// state changes are totally ordered and the bootstrap fields need no
/// synchronization at all.
struct EventLoop {
    chain_hash: ChainHash,
    graph: Arc<dyn GraphTimeSeries>,
    num_active_syncers: usize,
    encoding: ShortIdEncoding,
    chunk_size: usize,
    batch_size: usize,

    registry: Arc<SyncerRegistry>,
    requests: mpsc::Receiver<SyncManagerRequest>,
    rotation_ticker: Box<dyn Ticker>,
    historical_sync_ticker: Box<dyn Ticker>,
    quit: CancellationToken,

    /// True while no peer holds the initial-historical role and the
    /// bootstrap has not completed; the next registration volunteers.
    attempt_initial_historical_sync: bool,
    /// Monotone: flips to true once and never back.
    initial_historical_sync_completed: bool,
    initial_historical_syncer: Option<Arc<GossipSyncer>>,
    initial_sync_signal: Option<oneshot::Receiver<()>>,
}

impl EventLoop {
    async fn run(mut self) {
        debug!("Sync manager event loop running");
        self.rotation_ticker.resume();
        self.historical_sync_ticker.resume();

        loop {
            match self.next_event().await {
                LoopEvent::Request(SyncManagerRequest::RegisterPeer { peer, done }) => {
                    self.handle_register_peer(peer, done).await;
                }
                LoopEvent::Request(SyncManagerRequest::DeregisterPeer { peer_id, done }) => {
                    self.handle_deregister_peer(peer_id, done).await;
                }
                LoopEvent::InitialHistoricalSyncDone => self.handle_initial_sync_done().await,
                LoopEvent::InitialSyncSignalLost => {
                    // The syncer dropped its signal without completing; a
                    // deregistration in flight will reassign the role.
                    self.initial_sync_signal = None;
                }
                LoopEvent::RotationTick => self.rotate_active_syncer_candidate().await,
                LoopEvent::HistoricalSyncTick => {
                    // Gap repair. Whether a candidate accepted does not
                    // matter; the next tick tries again.
                    let _ = self.force_historical_sync().await;
                }
                LoopEvent::Quit => break,
            }
        }

        self.rotation_ticker.stop();
        self.historical_sync_ticker.stop();
        debug!("Sync manager event loop exited");
    }

    async fn next_event(&mut self) -> LoopEvent {
        tokio::select! {
            request = self.requests.recv() => match request {
                Some(request) => LoopEvent::Request(request),
                None => LoopEvent::Quit,
            },
            completed = wait_initial_sync(&mut self.initial_sync_signal) => {
                if completed {
                    LoopEvent::InitialHistoricalSyncDone
                } else {
                    LoopEvent::InitialSyncSignalLost
                }
            }
            _ = self.rotation_ticker.ticks() => LoopEvent::RotationTick,
            _ = self.historical_sync_ticker.ticks() => LoopEvent::HistoricalSyncTick,
            () = self.quit.cancelled() => LoopEvent::Quit,
        }
    }

    /// Create, classify and start a syncer for a newly connected peer, then
    /// volunteer it for the initial historical sync if that role is vacant.
    async fn handle_register_peer(&mut self, peer: Arc<dyn Peer>, done: oneshot::Sender<()>) {
        let peer_id = peer.pubkey();

        if self.registry.lookup(&peer_id).is_some() {
            debug!(peer = %peer_id, "Gossip syncer already registered");
            let _ = done.send(());
            return;
        }

        let syncer = Arc::new(GossipSyncer::new(GossipSyncerCfg {
            chain_hash: self.chain_hash,
            peer,
            graph: Arc::clone(&self.graph),
            encoding: self.encoding,
            chunk_size: self.chunk_size,
            batch_size: self.batch_size,
        }));

        let sync_type = self.registry.insert_new(
            Arc::clone(&syncer),
            self.num_active_syncers,
            self.initial_historical_sync_completed,
        );
        syncer.start();

        info!(peer = %peer_id, %sync_type, "Registered gossip syncer");
        let _ = done.send(());

        if !self.attempt_initial_historical_sync {
            return;
        }

        // The bootstrap runs under the passive syncer just registered; its
        // promotion waits until the graph is synced.
        match syncer.historical_sync().await {
            Ok(()) => {
                info!(peer = %peer_id, "Initial historical sync started");
                self.attempt_initial_historical_sync = false;
                self.initial_sync_signal = Some(syncer.reset_synced_signal());
                self.initial_historical_syncer = Some(syncer);
            }
            Err(err) => {
                // Leave the flag set; the next registration volunteers.
                warn!(peer = %peer_id, %err, "Unable to start initial historical sync");
            }
        }
    }

    /// Drop a disconnected peer's syncer, backfill the active set, and
    /// reassign the initial historical sync if the peer carried it.
    async fn handle_deregister_peer(&mut self, peer_id: PeerId, done: oneshot::Sender<()>) {
        let Some((syncer, sync_type)) = self.registry.remove(&peer_id) else {
            debug!(peer = %peer_id, "No gossip syncer registered for peer");
            let _ = done.send(());
            return;
        };

        info!(peer = %peer_id, %sync_type, "Removing gossip syncer");

        // A slow teardown must not stall the loop.
        let stopping = Arc::clone(&syncer);
        tokio::spawn(async move { stopping.stop().await });

        let _ = done.send(());

        if sync_type == SyncType::Active {
            // Shrinks transparently when no passive syncer is eligible.
            self.promote_random_passive_syncer().await;
        }

        let held_initial_sync = self
            .initial_historical_syncer
            .as_ref()
            .is_some_and(|initial| initial.peer_id() == peer_id);
        if !held_initial_sync {
            return;
        }

        self.initial_historical_syncer = None;
        self.initial_sync_signal = None;

        match self.force_historical_sync().await {
            Some(replacement) => {
                info!(
                    peer = %replacement.peer_id(),
                    "Reassigned initial historical sync"
                );
                self.initial_sync_signal = Some(replacement.reset_synced_signal());
                self.initial_historical_syncer = Some(replacement);
            }
            None => {
                // No peer could take over; the next registration restarts
                // the bootstrap.
                self.attempt_initial_historical_sync = true;
            }
        }
    }

    /// The initial historical sync finished: unlock active slots and fill
    /// them from the passive set.
    async fn handle_initial_sync_done(&mut self) {
        info!("Initial historical sync completed");

        self.initial_sync_signal = None;
        self.initial_historical_syncer = None;
        self.initial_historical_sync_completed = true;

        let deficit = self
            .num_active_syncers
            .saturating_sub(self.registry.num_active());
        for _ in 0..deficit {
            if self.promote_random_passive_syncer().await.is_none() {
                break;
            }
        }
    }

    /// Swap one active syncer for a passive one to diversify update
    /// sources.
    ///
    /// Best effort: if the demotion fails nothing changes, and if the
    /// promotion fails after the demotion succeeded the rotation stays
    /// half-done, leaving the active set one short until a later promotion
    /// repairs it.
    async fn rotate_active_syncer_candidate(&mut self) {
        let Some(active) = choose_random_synced_syncer(self.registry.active_syncers()) else {
            debug!("No active syncer eligible for rotation");
            return;
        };
        let Some(candidate) = choose_random_synced_syncer(self.registry.inactive_syncers()) else {
            debug!("No passive syncer eligible for rotation");
            return;
        };

        info!(
            rotate_out = %active.peer_id(),
            rotate_in = %candidate.peer_id(),
            "Rotating active syncer"
        );

        if let Err(err) = active.process_sync_transition(SyncType::Passive).await {
            warn!(peer = %active.peer_id(), %err, "Failed to demote active syncer");
            return;
        }
        self.registry.demote(&active.peer_id());

        match candidate.process_sync_transition(SyncType::Active).await {
            Ok(()) => {
                self.registry.promote(&candidate.peer_id());
            }
            Err(err) => {
                warn!(peer = %candidate.peer_id(), %err, "Failed to promote rotation candidate");
            }
        }
    }

    /// Promote a random eligible passive syncer into the active set.
    ///
    /// Candidates refusing the transition are skipped. Returns the promoted
    /// syncer, or `None` when every candidate was ineligible or refused.
    async fn promote_random_passive_syncer(&mut self) -> Option<Arc<GossipSyncer>> {
        let mut candidates = self.registry.inactive_syncers();
        candidates.shuffle(&mut rand::thread_rng());

        for candidate in candidates {
            if candidate.sync_state() != SyncState::ChansSynced {
                continue;
            }

            match candidate.process_sync_transition(SyncType::Active).await {
                Ok(()) => {
                    self.registry.promote(&candidate.peer_id());
                    info!(peer = %candidate.peer_id(), "Promoted passive syncer");
                    return Some(candidate);
                }
                Err(err) => {
                    warn!(peer = %candidate.peer_id(), %err, "Failed to promote passive syncer");
                }
            }
        }

        None
    }

    /// Start a historical sync against a random idle syncer from either
    /// set. Candidates refusing are skipped; ties break randomly to spread
    /// load.
    async fn force_historical_sync(&mut self) -> Option<Arc<GossipSyncer>> {
        let mut candidates = self.registry.all_syncers();
        candidates.shuffle(&mut rand::thread_rng());

        for candidate in candidates {
            if candidate.sync_state() != SyncState::ChansSynced {
                continue;
            }

            match candidate.historical_sync().await {
                Ok(()) => return Some(candidate),
                Err(err) => {
                    warn!(peer = %candidate.peer_id(), %err, "Failed to start historical sync");
                }
            }
        }

        None
    }
}

/// Pick a random syncer with no outstanding queries, or `None` when no
/// candidate qualifies. Sampling is explicit so no peer is systematically
/// favored by iteration order.
fn choose_random_synced_syncer(candidates: Vec<Arc<GossipSyncer>>) -> Option<Arc<GossipSyncer>> {
    let synced: Vec<Arc<GossipSyncer>> = candidates
        .into_iter()
        .filter(|syncer| syncer.sync_state() == SyncState::ChansSynced)
        .collect();

    synced.choose(&mut rand::thread_rng()).cloned()
}

/// Pend until the initial historical sync signal resolves. Returns false
/// when the signal was dropped without firing.
async fn wait_initial_sync(signal: &mut Option<oneshot::Receiver<()>>) -> bool {
    match signal {
        Some(receiver) => receiver.await.is_ok(),
        None => std::future::pending().await,
    }
}
