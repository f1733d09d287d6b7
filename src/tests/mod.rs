mod registry_tests;
mod ticker_tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::syncer::{GossipSyncer, GossipSyncerCfg};
use crate::types::{
    ChainHash, GossipMessage, GraphTimeSeries, Peer, ShortChannelId, ShortIdEncoding,
};

/// Peer mock capturing every outbound message on an unbounded channel.
pub(crate) struct MockPeer {
    id: PeerId,
    outbox: mpsc::UnboundedSender<GossipMessage>,
    fail_sends: AtomicBool,
}

impl MockPeer {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<GossipMessage>) {
        let (outbox, messages) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id: PeerId::random(),
            outbox,
            fail_sends: AtomicBool::new(false),
        });
        (peer, messages)
    }

    /// Peer whose sends always fail.
    pub(crate) fn unreachable() -> (Arc<Self>, mpsc::UnboundedReceiver<GossipMessage>) {
        let (peer, messages) = Self::new();
        peer.fail_sends.store(true, Ordering::SeqCst);
        (peer, messages)
    }

    fn deliver(&self, message: GossipMessage) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("peer unreachable"));
        }
        self.outbox
            .send(message)
            .map_err(|err| anyhow!("peer outbox closed: {err}"))
    }
}

#[async_trait]
impl Peer for MockPeer {
    fn pubkey(&self) -> PeerId {
        self.id
    }

    async fn send_message(&self, message: GossipMessage) -> Result<()> {
        self.deliver(message)
    }

    async fn send_message_acked(&self, message: GossipMessage) -> Result<()> {
        self.deliver(message)
    }
}

/// Graph mock that treats a configurable id set as unknown.
#[derive(Default)]
pub(crate) struct MockGraph {
    unknown: Mutex<Vec<ShortChannelId>>,
}

impl MockGraph {
    pub(crate) fn set_unknown(&self, ids: Vec<ShortChannelId>) {
        *self.unknown.lock() = ids;
    }
}

#[async_trait]
impl GraphTimeSeries for MockGraph {
    async fn filter_known_chan_ids(
        &self,
        _chain_hash: ChainHash,
        short_chan_ids: Vec<ShortChannelId>,
    ) -> Result<Vec<ShortChannelId>> {
        let unknown = self.unknown.lock();
        Ok(short_chan_ids
            .into_iter()
            .filter(|id| unknown.contains(id))
            .collect())
    }
}

/// Syncer wired to a fresh mock peer, returning the peer's message stream.
pub(crate) fn new_test_syncer(
    graph: Arc<MockGraph>,
    chunk_size: usize,
    batch_size: usize,
) -> (Arc<GossipSyncer>, mpsc::UnboundedReceiver<GossipMessage>) {
    let (peer, messages) = MockPeer::new();
    let syncer = Arc::new(GossipSyncer::new(GossipSyncerCfg {
        chain_hash: ChainHash::default(),
        peer,
        graph,
        encoding: ShortIdEncoding::Plain,
        chunk_size,
        batch_size,
    }));
    (syncer, messages)
}

/// Poll a condition until it holds, failing the test after five seconds.
pub(crate) async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Receive the next captured message, failing the test after five seconds.
pub(crate) async fn next_message(
    messages: &mut mpsc::UnboundedReceiver<GossipMessage>,
) -> GossipMessage {
    tokio::time::timeout(Duration::from_secs(5), messages.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("message channel closed")
}
