use std::sync::Arc;

use libp2p_identity::PeerId;

use crate::registry::SyncerRegistry;
use crate::syncer::{GossipSyncer, SyncType};
use crate::tests::{MockGraph, new_test_syncer};

fn test_syncer() -> Arc<GossipSyncer> {
    let (syncer, _messages) = new_test_syncer(Arc::new(MockGraph::default()), 500, 2_000);
    syncer
}

#[test]
fn new_syncers_stay_passive_until_graph_synced() {
    let registry = SyncerRegistry::default();

    let sync_type = registry.insert_new(test_syncer(), 3, false);

    assert_eq!(sync_type, SyncType::Passive);
    assert_eq!(registry.num_active(), 0);
    assert_eq!(registry.num_inactive(), 1);
}

#[test]
fn new_syncers_fill_active_slots_once_graph_synced() {
    let registry = SyncerRegistry::default();

    assert_eq!(registry.insert_new(test_syncer(), 2, true), SyncType::Active);
    assert_eq!(registry.insert_new(test_syncer(), 2, true), SyncType::Active);
    // Capacity reached.
    assert_eq!(
        registry.insert_new(test_syncer(), 2, true),
        SyncType::Passive
    );

    assert_eq!(registry.num_active(), 2);
    assert_eq!(registry.num_inactive(), 1);
}

#[test]
fn classification_is_recorded_on_the_syncer() {
    let registry = SyncerRegistry::default();
    let syncer = test_syncer();

    registry.insert_new(Arc::clone(&syncer), 3, true);

    assert_eq!(syncer.sync_type(), SyncType::Active);
}

#[test]
fn lookup_and_remove_cover_both_sets() {
    let registry = SyncerRegistry::default();
    let active = test_syncer();
    let passive = test_syncer();

    registry.insert_new(Arc::clone(&active), 1, true);
    registry.insert_new(Arc::clone(&passive), 1, true);

    assert!(registry.lookup(&active.peer_id()).is_some());
    assert!(registry.lookup(&passive.peer_id()).is_some());
    assert!(registry.lookup(&PeerId::random()).is_none());

    let (removed, sync_type) = registry.remove(&active.peer_id()).expect("removed");
    assert_eq!(removed.peer_id(), active.peer_id());
    assert_eq!(sync_type, SyncType::Active);
    assert!(registry.lookup(&active.peer_id()).is_none());

    let (_, sync_type) = registry.remove(&passive.peer_id()).expect("removed");
    assert_eq!(sync_type, SyncType::Passive);
}

#[test]
fn promote_and_demote_move_between_sets() {
    let registry = SyncerRegistry::default();
    let syncer = test_syncer();
    let peer_id = syncer.peer_id();

    registry.insert_new(syncer, 3, false);
    assert_eq!(registry.num_active(), 0);

    assert!(registry.promote(&peer_id));
    assert_eq!(registry.num_active(), 1);
    assert_eq!(registry.num_inactive(), 0);

    assert!(registry.demote(&peer_id));
    assert_eq!(registry.num_active(), 0);
    assert_eq!(registry.num_inactive(), 1);

    // Unknown peers move nothing.
    assert!(!registry.promote(&PeerId::random()));
    assert!(!registry.demote(&peer_id));
}

#[test]
fn snapshot_is_a_detached_copy() {
    let registry = SyncerRegistry::default();
    let syncer = test_syncer();
    let peer_id = syncer.peer_id();

    registry.insert_new(syncer, 3, true);
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);

    registry.remove(&peer_id);

    assert_eq!(snapshot.len(), 1);
    assert!(registry.lookup(&peer_id).is_none());
}

#[test]
fn drain_empties_both_sets() {
    let registry = SyncerRegistry::default();
    registry.insert_new(test_syncer(), 1, true);
    registry.insert_new(test_syncer(), 1, true);

    let drained = registry.drain();

    assert_eq!(drained.len(), 2);
    assert_eq!(registry.num_active(), 0);
    assert_eq!(registry.num_inactive(), 0);
    assert!(registry.snapshot().is_empty());
}
