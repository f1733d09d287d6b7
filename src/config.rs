/// Sync manager configuration constants.
///
/// Operational parameters for gossip synchronization: peer counts, timer
/// intervals, and query sizing.
use std::time::Duration;

/// Default number of peers the node keeps an active gossip sync with.
pub const DEFAULT_NUM_ACTIVE_SYNCERS: usize = 3;

/// Interval between attempts to swap one active syncer for a passive one.
/// Rotation spreads graph updates across peers and avoids locality bias.
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Interval between forced historical syncs against a random peer.
/// These repair gaps the node may have missed at the tip.
pub const DEFAULT_HISTORICAL_SYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Maximum short channel ids packed into a single channel query.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Maximum unknown channels queried within one historical sync pass.
/// Anything beyond this is picked up by the next periodic re-sync.
pub const DEFAULT_BATCH_SIZE: usize = 2_000;

/// Capacity of the request channel feeding the sync manager's event loop.
pub const REQUEST_CHANNEL_CAPACITY: usize = 16;
