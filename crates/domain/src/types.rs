//! Common data types used throughout the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::OUTBOX_BASE_RETRY_DELAY_SECS;

/// Entity payload: an opaque JSON object keyed by the engine-managed fields
/// in [`entity`]. Consumers attach typed wrappers outside the engine.
pub type Entity = serde_json::Map<String, Value>;

/// Engine-managed entity field helpers.
///
/// Every synced row carries `id`, `updated_at`, `device_id`, `deleted` and
/// `_version`; everything else is application data the engine never
/// interprets.
pub mod entity {
    use super::{DateTime, Entity, Utc, Value};

    /// Primary key field.
    pub const ID: &str = "id";
    /// Creation timestamp field.
    pub const CREATED_AT: &str = "created_at";
    /// Last-write timestamp field.
    pub const UPDATED_AT: &str = "updated_at";
    /// Writer device field.
    pub const DEVICE_ID: &str = "device_id";
    /// Soft-delete flag field.
    pub const DELETED: &str = "deleted";
    /// Merge counter field.
    pub const VERSION: &str = "_version";
    /// Owner field on tables subject to per-user authorization.
    pub const USER_ID: &str = "user_id";

    /// Entity id, when present.
    pub fn id(row: &Entity) -> Option<&str> {
        row.get(ID).and_then(Value::as_str)
    }

    /// Parsed `updated_at` instant, when present and well-formed.
    pub fn updated_at(row: &Entity) -> Option<DateTime<Utc>> {
        row.get(UPDATED_AT)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
    }

    /// Stamp `updated_at` with an ISO-8601 instant.
    pub fn set_updated_at(row: &mut Entity, at: DateTime<Utc>) {
        row.insert(UPDATED_AT.to_string(), Value::String(at.to_rfc3339()));
    }

    /// Writer device id, when present.
    pub fn device_id(row: &Entity) -> Option<&str> {
        row.get(DEVICE_ID).and_then(Value::as_str)
    }

    /// Stamp the writer device id.
    pub fn set_device_id(row: &mut Entity, device_id: &str) {
        row.insert(DEVICE_ID.to_string(), Value::String(device_id.to_string()));
    }

    /// Soft-delete flag; absent or null reads as live.
    pub fn is_deleted(row: &Entity) -> bool {
        row.get(DELETED).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Set the soft-delete flag.
    pub fn set_deleted(row: &mut Entity, deleted: bool) {
        row.insert(DELETED.to_string(), Value::Bool(deleted));
    }

    /// Merge counter; absent reads as zero.
    pub fn version(row: &Entity) -> i64 {
        row.get(VERSION).and_then(Value::as_i64).unwrap_or(0)
    }

    /// Set the merge counter.
    pub fn set_version(row: &mut Entity, version: i64) {
        row.insert(VERSION.to_string(), Value::Number(version.into()));
    }

    /// Numeric reading of a field, when present and numeric.
    pub fn numeric(row: &Entity, field: &str) -> Option<f64> {
        row.get(field).and_then(Value::as_f64)
    }

    /// JSON number for an arithmetic result, kept integral when exact.
    pub fn number(value: f64) -> Value {
        if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
            #[allow(clippy::cast_possible_truncation)]
            Value::Number((value as i64).into())
        } else {
            serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
        }
    }
}

/// Intent operation captured by a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOp {
    /// Entity creation with a full payload.
    Create,
    /// Field assignment; single field or a multi-field object value.
    Set,
    /// Numeric delta applied to one field.
    Increment,
    /// Soft deletion.
    Delete,
}

impl OutboxOp {
    /// Stable string form used in persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Set => "set",
            Self::Increment => "increment",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OutboxOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxOp {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "create" => Ok(Self::Create),
            "set" => Ok(Self::Set),
            "increment" => Ok(Self::Increment),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown outbox op: {other}")),
        }
    }
}

/// Persistent intent operation awaiting push, ordered by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    /// Monotonic queue position assigned at enqueue time.
    pub seq: i64,
    /// Remote table name.
    pub table: String,
    /// Target entity id.
    pub entity_id: String,
    /// Captured intent.
    pub op: OutboxOp,
    /// Target field for single-field set and increment operations.
    pub field: Option<String>,
    /// Operation payload: full row, field value, object patch or delta.
    pub value: Option<Value>,
    /// Enqueue instant.
    pub enqueued_at: DateTime<Utc>,
    /// Failed push attempts so far.
    pub retries: i32,
    /// Instant of the most recent failed attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxItem {
    /// Backoff delay required after the given number of failed attempts.
    ///
    /// Zero retries push immediately; afterwards the delay doubles per
    /// attempt: 1 s, 2 s, 4 s, 8 s, 16 s.
    pub fn backoff_secs(retries: i32) -> i64 {
        if retries <= 0 {
            return 0;
        }

        let exponent = u32::try_from(retries - 1).unwrap_or(0).min(30);
        let multiplier = 1_i64.checked_shl(exponent).unwrap_or(i64::MAX);
        OUTBOX_BASE_RETRY_DELAY_SECS.saturating_mul(multiplier)
    }

    /// Whether the item's retry backoff has elapsed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.retries == 0 {
            return true;
        }

        match self.last_attempt_at {
            None => true,
            Some(last) => {
                let waited = now.signed_duration_since(last).num_seconds();
                waited >= Self::backoff_secs(self.retries)
            }
        }
    }
}

/// Outbox item before the store assigns its `seq`.
#[derive(Debug, Clone)]
pub struct NewOutboxItem {
    /// Remote table name.
    pub table: String,
    /// Target entity id.
    pub entity_id: String,
    /// Captured intent.
    pub op: OutboxOp,
    /// Target field for single-field set and increment operations.
    pub field: Option<String>,
    /// Operation payload.
    pub value: Option<Value>,
}

impl NewOutboxItem {
    /// Build an intent record for the given table and entity.
    pub fn new(table: impl Into<String>, entity_id: impl Into<String>, op: OutboxOp) -> Self {
        Self { table: table.into(), entity_id: entity_id.into(), op, field: None, value: None }
    }

    /// Attach a target field.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Attach an operation payload.
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// Which side a resolved field came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    /// Local value kept.
    Local,
    /// Remote value kept.
    Remote,
    /// Values combined.
    Merged,
}

/// Strategy applied to one conflicting field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Later `updated_at` wins; ties break on lower `device_id`.
    LastWrite,
    /// A soft-deleted side dominates the merge.
    DeleteWins,
    /// A pending outbox operation shields the local value.
    LocalPending,
    /// Reserved additive strategy; currently resolved last-write.
    NumericMerge,
}

impl ConflictStrategy {
    /// Stable string form used in persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastWrite => "last_write",
            Self::DeleteWins => "delete_wins",
            Self::LocalPending => "local_pending",
            Self::NumericMerge => "numeric_merge",
        }
    }
}

impl ConflictWinner {
    /// Stable string form used in persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Merged => "merged",
        }
    }
}

/// Outcome of resolving a single conflicting field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConflictResolution {
    /// Conflicting field name.
    pub field: String,
    /// Value held locally.
    pub local_value: Value,
    /// Value arriving from the backend.
    pub remote_value: Value,
    /// Value written into the merged entity.
    pub resolved_value: Value,
    /// Side the resolved value came from.
    pub winner: ConflictWinner,
    /// Strategy that produced the resolution.
    pub strategy: ConflictStrategy,
}

/// Result of merging a local and a remote entity.
#[derive(Debug, Clone)]
pub struct ConflictResolution {
    /// Entity to store locally.
    pub merged_entity: Entity,
    /// Per-field audit of every non-identical field.
    pub field_resolutions: Vec<FieldConflictResolution>,
    /// Whether any field actually conflicted.
    pub has_conflicts: bool,
}

/// Persisted conflict audit row; append-only with 30-day retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictHistoryEntry {
    /// Monotonic row id assigned by the store; zero before persistence.
    pub seq: i64,
    /// Remote table name.
    pub table: String,
    /// Entity the conflict occurred on.
    pub entity_id: String,
    /// Conflicting field name.
    pub field: String,
    /// Value held locally.
    pub local_value: Value,
    /// Value arriving from the backend.
    pub remote_value: Value,
    /// Value written into the merged entity.
    pub resolved_value: Value,
    /// Side the resolved value came from.
    pub winner: ConflictWinner,
    /// Strategy that produced the resolution.
    pub strategy: ConflictStrategy,
    /// Resolution instant.
    pub at: DateTime<Utc>,
}

impl ConflictHistoryEntry {
    /// Build an audit row from a field resolution.
    pub fn from_resolution(
        table: &str,
        entity_id: &str,
        resolution: &FieldConflictResolution,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            table: table.to_string(),
            entity_id: entity_id.to_string(),
            field: resolution.field.clone(),
            local_value: resolution.local_value.clone(),
            remote_value: resolution.remote_value.clone(),
            resolved_value: resolution.resolved_value.clone(),
            winner: resolution.winner,
            strategy: resolution.strategy,
            at,
        }
    }
}

/// Change-stream event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    /// Row inserted on the backend.
    Insert,
    /// Row updated on the backend.
    Update,
    /// Row hard-deleted on the backend.
    Delete,
}

/// One per-row change delivered by the backend stream, at least once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Remote table the row belongs to.
    pub table: String,
    /// Event kind.
    pub event_type: ChangeEventType,
    /// Row after the change; absent for deletions.
    pub new: Option<Entity>,
    /// Row before the change; present for deletions.
    pub old: Option<Entity>,
}

impl ChangeEvent {
    /// Entity id resolved from the new row, falling back to the old row.
    pub fn entity_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(entity::id)
            .or_else(|| self.old.as_ref().and_then(entity::id))
    }
}

/// Message yielded by a change-stream subscription.
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    /// A decoded row change.
    Event(ChangeEvent),
    /// Transport-level failure; the subscription is no longer live.
    Error(String),
    /// Orderly close of the subscription.
    Closed,
}

/// Realtime subscription connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No subscription active.
    Disconnected,
    /// Subscription being established.
    Connecting,
    /// Subscription live.
    Connected,
    /// Subscription failed; reconnect pending or abandoned.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Authenticated backend session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Authenticated user id.
    pub user_id: String,
    /// Session expiry, when the backend reports one.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether the session is expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// User-visible sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing in flight.
    Idle,
    /// A cycle is running.
    Syncing,
    /// The last cycle surfaced an error.
    Error,
    /// The device is offline.
    Offline,
}

/// Last surfaced sync error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncErrorDetail {
    /// Short human message.
    pub message: String,
    /// Underlying detail for diagnostics.
    pub detail: String,
}

/// Status plus human message delivered to status observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusReport {
    /// Current state.
    pub status: SyncStatus,
    /// Human-readable summary.
    pub message: String,
    /// Last error, when status is [`SyncStatus::Error`].
    pub last_error: Option<SyncErrorDetail>,
}

impl SyncStatusReport {
    /// Report for a plain status with a message and no error detail.
    pub fn new(status: SyncStatus, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), last_error: None }
    }
}

/// What started a sync cycle; recorded in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Startup hydration or first cycle.
    Startup,
    /// Debounced local write.
    Debounce,
    /// Periodic interval.
    Interval,
    /// Explicit caller request.
    Manual,
    /// Network reconnect.
    Reconnect,
    /// Tab became visible after an absence.
    Visibility,
}

/// Metrics for one completed sync cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCycleStats {
    /// What started the cycle.
    pub trigger: SyncTrigger,
    /// Outbox items removed by the push phase.
    pub pushed_items: usize,
    /// Remote rows applied by the pull phase.
    pub pulled_records: usize,
    /// Wall-clock duration of the cycle.
    pub duration_ms: i64,
    /// Completion instant.
    pub at: DateTime<Utc>,
}

/// Point-in-time diagnostic snapshot of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    /// Realtime connection state.
    pub connection_state: ConnectionState,
    /// Last surfaced error, if any.
    pub last_error: Option<SyncErrorDetail>,
    /// Realtime reconnect attempts since the last successful subscribe.
    pub reconnect_attempts: u32,
    /// How long the sync lock has been held, when held.
    pub lock_held_ms: Option<i64>,
    /// Stats for the most recent cycles, newest last.
    pub sync_stats: Vec<SyncCycleStats>,
    /// Approximate bytes received from the backend.
    pub egress_bytes: u64,
    /// Live entries in the recently-modified guard.
    pub recently_modified_size: usize,
    /// Live entries in the realtime-dedup guard.
    pub recently_processed_size: usize,
}

/// Filter comparison operator for remote queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Equality.
    Eq,
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Strictly greater than.
    Gt,
    /// Greater than or equal.
    Gte,
}

/// Column filter applied to a remote select or delete.
#[derive(Debug, Clone)]
pub struct Filter {
    /// Column name.
    pub field: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Comparison value.
    pub value: Value,
}

impl Filter {
    /// Equality filter.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self { field: field.into(), op: FilterOp::Eq, value }
    }

    /// Less-than filter.
    pub fn lt(field: impl Into<String>, value: Value) -> Self {
        Self { field: field.into(), op: FilterOp::Lt, value }
    }

    /// Less-than-or-equal filter.
    pub fn lte(field: impl Into<String>, value: Value) -> Self {
        Self { field: field.into(), op: FilterOp::Lte, value }
    }

    /// Greater-than filter.
    pub fn gt(field: impl Into<String>, value: Value) -> Self {
        Self { field: field.into(), op: FilterOp::Gt, value }
    }

    /// Greater-than-or-equal filter.
    pub fn gte(field: impl Into<String>, value: Value) -> Self {
        Self { field: field.into(), op: FilterOp::Gte, value }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn sample_row() -> Entity {
        let Value::Object(map) = json!({
            "id": "e-1",
            "updated_at": "2025-01-01T00:00:02Z",
            "device_id": "d1",
            "deleted": false,
            "_version": 3,
            "title": "alpha",
        }) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn entity_helpers_read_managed_fields() {
        let row = sample_row();

        assert_eq!(entity::id(&row), Some("e-1"));
        assert_eq!(entity::device_id(&row), Some("d1"));
        assert!(!entity::is_deleted(&row));
        assert_eq!(entity::version(&row), 3);

        let parsed = entity::updated_at(&row).expect("timestamp parses");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 2).unwrap());
    }

    #[test]
    fn entity_helpers_default_missing_fields() {
        let row = Entity::new();

        assert!(entity::id(&row).is_none());
        assert!(entity::updated_at(&row).is_none());
        assert!(!entity::is_deleted(&row));
        assert_eq!(entity::version(&row), 0);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        assert_eq!(OutboxItem::backoff_secs(0), 0);
        assert_eq!(OutboxItem::backoff_secs(1), 1);
        assert_eq!(OutboxItem::backoff_secs(2), 2);
        assert_eq!(OutboxItem::backoff_secs(3), 4);
        assert_eq!(OutboxItem::backoff_secs(4), 8);
        assert_eq!(OutboxItem::backoff_secs(5), 16);
    }

    #[test]
    fn eligibility_respects_backoff_window() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 10).unwrap();
        let mut item = OutboxItem {
            seq: 1,
            table: "tasks".to_string(),
            entity_id: "e-1".to_string(),
            op: OutboxOp::Set,
            field: Some("title".to_string()),
            value: Some(json!("alpha")),
            enqueued_at: now,
            retries: 0,
            last_attempt_at: None,
        };

        assert!(item.is_eligible(now));

        item.retries = 3;
        item.last_attempt_at = Some(now - chrono::Duration::seconds(3));
        assert!(!item.is_eligible(now), "three seconds is inside the 4 s window");

        item.last_attempt_at = Some(now - chrono::Duration::seconds(4));
        assert!(item.is_eligible(now));
    }

    #[test]
    fn outbox_op_round_trips_through_strings() {
        for op in [OutboxOp::Create, OutboxOp::Set, OutboxOp::Increment, OutboxOp::Delete] {
            let parsed: OutboxOp = op.as_str().parse().expect("known op");
            assert_eq!(parsed, op);
        }
        assert!("upsert".parse::<OutboxOp>().is_err());
    }

    #[test]
    fn change_event_resolves_entity_id_from_either_side() {
        let row = sample_row();

        let insert = ChangeEvent {
            table: "tasks".to_string(),
            event_type: ChangeEventType::Insert,
            new: Some(row.clone()),
            old: None,
        };
        assert_eq!(insert.entity_id(), Some("e-1"));

        let delete = ChangeEvent {
            table: "tasks".to_string(),
            event_type: ChangeEventType::Delete,
            new: None,
            old: Some(row),
        };
        assert_eq!(delete.entity_id(), Some("e-1"));
    }

    #[test]
    fn session_expiry_checks_against_now() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        let open = Session { user_id: "u-1".to_string(), expires_at: None };
        assert!(!open.is_expired(now));

        let expired = Session {
            user_id: "u-1".to_string(),
            expires_at: Some(now - chrono::Duration::minutes(1)),
        };
        assert!(expired.is_expired(now));
    }
}
