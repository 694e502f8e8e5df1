//! Domain constants
//!
//! Centralized location for all domain-level constants used throughout the
//! engine.

/// Debounce window applied after every local write before a sync cycle fires.
pub const DEFAULT_SYNC_DEBOUNCE_MS: u64 = 2_000;
/// Interval between periodic full sync cycles.
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 900_000;
/// Age after which soft-deleted rows are hard-deleted on both sides.
pub const DEFAULT_TOMBSTONE_MAX_AGE_DAYS: u32 = 7;
/// Minimum hidden duration before a visibility change schedules a sync.
pub const DEFAULT_VISIBILITY_SYNC_MIN_AWAY_MS: u64 = 300_000;
/// Cooldown between reconnect-triggered syncs.
pub const DEFAULT_ONLINE_RECONNECT_COOLDOWN_MS: u64 = 120_000;

/// Lifetime of the recently-modified and realtime-dedup guard entries.
pub const RECENT_GUARD_TTL_MS: u64 = 2_000;

/// Cached user identity is revalidated against the backend after this long.
pub const AUTH_REVALIDATION_INTERVAL_SECS: i64 = 3_600;
/// Timeout for credential validation when coming back online.
pub const ONLINE_VALIDATION_TIMEOUT_SECS: u64 = 15;

/// Outbox items are dropped after this many failed push attempts.
pub const OUTBOX_MAX_RETRIES: i32 = 5;
/// Base delay for outbox retry backoff; doubles per additional attempt.
pub const OUTBOX_BASE_RETRY_DELAY_SECS: i64 = 1;

/// Timeout wrapped around the push phase of a sync cycle.
pub const PUSH_TIMEOUT_SECS: u64 = 45;
/// Timeout wrapped around each pull attempt of a sync cycle.
pub const PULL_TIMEOUT_SECS: u64 = 45;
/// Maximum pull attempts per cycle when the push phase succeeded.
pub const PULL_MAX_ATTEMPTS: u32 = 3;

/// A held sync lock older than this is considered stale and force-released.
pub const SYNC_LOCK_STALE_SECS: u64 = 60;
/// Interval of the watchdog that checks for a stale sync lock.
pub const SYNC_WATCHDOG_INTERVAL_SECS: u64 = 15;
/// Number of sync cycles retained in the diagnostics window.
pub const SYNC_STATS_WINDOW: usize = 10;

/// Largest exponent used for realtime reconnect backoff (1..16 s).
pub const REALTIME_MAX_BACKOFF_EXPONENT: u32 = 4;

/// Conflict audit rows older than this are pruned.
pub const CONFLICT_HISTORY_RETENTION_DAYS: u32 = 30;
/// Minimum spacing between cooperative tombstone sweeps.
pub const TOMBSTONE_SWEEP_INTERVAL_SECS: u64 = 86_400;

/// Key-value key prefix for the per-user sync cursor.
pub const CURSOR_KEY_PREFIX: &str = "lastSyncCursor_";
/// Key-value key holding the stable device identifier.
pub const DEVICE_ID_KEY: &str = "deviceId";
