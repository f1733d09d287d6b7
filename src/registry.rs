/// Registry of per-peer gossip syncers.
///
/// Syncers live in one of two disjoint maps, active and passive, keyed by
/// peer id and guarded by a single lock. The event loop is the only writer;
/// public lookups take the lock briefly and copy out.
use std::collections::HashMap;
use std::sync::Arc;

use libp2p_identity::PeerId;
use parking_lot::Mutex;

use crate::syncer::{GossipSyncer, SyncType};

#[derive(Default)]
struct Maps {
    active: HashMap<PeerId, Arc<GossipSyncer>>,
    inactive: HashMap<PeerId, Arc<GossipSyncer>>,
}

#[derive(Default)]
pub(crate) struct SyncerRegistry {
    maps: Mutex<Maps>,
}

impl SyncerRegistry {
    /// Classify a freshly created syncer and insert it.
    ///
    /// The decision and the insertion share one critical section so a
    /// concurrent reader never observes a classified-but-absent syncer.
    /// A new syncer goes active only when the active set has room and the
    /// initial graph bootstrap is done; active slots are reserved until
    /// then.
    pub(crate) fn insert_new(
        &self,
        syncer: Arc<GossipSyncer>,
        max_active: usize,
        graph_synced: bool,
    ) -> SyncType {
        let mut maps = self.maps.lock();

        let sync_type = if maps.active.len() >= max_active || !graph_synced {
            SyncType::Passive
        } else {
            SyncType::Active
        };
        syncer.set_sync_type(sync_type);

        let peer_id = syncer.peer_id();
        match sync_type {
            SyncType::Active => {
                maps.active.insert(peer_id, syncer);
            }
            SyncType::Passive => {
                maps.inactive.insert(peer_id, syncer);
            }
        }

        sync_type
    }

    /// Remove a syncer, reporting which set held it.
    pub(crate) fn remove(&self, peer_id: &PeerId) -> Option<(Arc<GossipSyncer>, SyncType)> {
        let mut maps = self.maps.lock();

        if let Some(syncer) = maps.active.remove(peer_id) {
            return Some((syncer, SyncType::Active));
        }
        maps.inactive
            .remove(peer_id)
            .map(|syncer| (syncer, SyncType::Passive))
    }

    /// Look a syncer up in either set. The maps are disjoint, so search
    /// order does not matter.
    pub(crate) fn lookup(&self, peer_id: &PeerId) -> Option<Arc<GossipSyncer>> {
        let maps = self.maps.lock();
        maps.inactive
            .get(peer_id)
            .or_else(|| maps.active.get(peer_id))
            .cloned()
    }

    /// Move a passive syncer into the active set. No-op when absent.
    pub(crate) fn promote(&self, peer_id: &PeerId) -> bool {
        let mut maps = self.maps.lock();
        match maps.inactive.remove(peer_id) {
            Some(syncer) => {
                maps.active.insert(*peer_id, syncer);
                true
            }
            None => false,
        }
    }

    /// Move an active syncer into the passive set. No-op when absent.
    pub(crate) fn demote(&self, peer_id: &PeerId) -> bool {
        let mut maps = self.maps.lock();
        match maps.active.remove(peer_id) {
            Some(syncer) => {
                maps.inactive.insert(*peer_id, syncer);
                true
            }
            None => false,
        }
    }

    pub(crate) fn num_active(&self) -> usize {
        self.maps.lock().active.len()
    }

    pub(crate) fn num_inactive(&self) -> usize {
        self.maps.lock().inactive.len()
    }

    /// Active and passive counts read under one lock.
    pub(crate) fn counts(&self) -> (usize, usize) {
        let maps = self.maps.lock();
        (maps.active.len(), maps.inactive.len())
    }

    pub(crate) fn active_syncers(&self) -> Vec<Arc<GossipSyncer>> {
        self.maps.lock().active.values().cloned().collect()
    }

    pub(crate) fn inactive_syncers(&self) -> Vec<Arc<GossipSyncer>> {
        self.maps.lock().inactive.values().cloned().collect()
    }

    /// Every registered syncer, both sets.
    pub(crate) fn all_syncers(&self) -> Vec<Arc<GossipSyncer>> {
        let maps = self.maps.lock();
        maps.active
            .values()
            .chain(maps.inactive.values())
            .cloned()
            .collect()
    }

    /// Fresh copy of the union of both sets, safe to iterate without the
    /// lock.
    pub(crate) fn snapshot(&self) -> HashMap<PeerId, Arc<GossipSyncer>> {
        let maps = self.maps.lock();
        maps.active
            .iter()
            .chain(maps.inactive.iter())
            .map(|(peer_id, syncer)| (*peer_id, Arc::clone(syncer)))
            .collect()
    }

    /// Empty both sets, handing the removed syncers to the caller.
    pub(crate) fn drain(&self) -> Vec<Arc<GossipSyncer>> {
        let mut maps = self.maps.lock();
        let maps = &mut *maps;
        maps.active
            .drain()
            .chain(maps.inactive.drain())
            .map(|(_, syncer)| syncer)
            .collect()
    }
}
