//! Protocol and service constants.

use std::time::Duration;

/// Object id of the dynamic global properties object.
///
/// Carries `head_block_number` and `last_irreversible_block_num`; every new
/// block produces a change notification for it.
pub const DYNAMIC_GLOBAL_PROPERTY_ID: &str = "2.1.0";

/// Object id of the core asset's dynamic data (current supply).
pub const CORE_ASSET_DYNAMIC_DATA_ID: &str = "2.3.1";

/// Precision divisor of the core asset (5 decimal places).
pub const CORE_ASSET_PRECISION: u64 = 100_000;

/// Delay between connection attempts when no endpoint is usable.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Upper bound on a single endpoint latency probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single RPC request once connected.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on the shutdown flush before the process exits anyway.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default port of the HTTP query facade.
pub const DEFAULT_HTTP_PORT: u16 = 3030;

/// Metadata key of the persisted sync cursor.
pub const META_SYNC_CURSOR: &[u8] = b"sync-cursor";

/// Metadata key of the last process close timestamp (Unix millis).
pub const META_LAST_CLOSE: &[u8] = b"last-close";

/// Metadata key of the highest height whose records have been pruned (or
/// were never indexed). Big-endian u64.
pub const META_PRUNED_THROUGH: &[u8] = b"pruned-through";
