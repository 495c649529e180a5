//! System-wide configuration values

/// Default advisory lock lifetime. Expired locks are swept on the next
/// access to their path, so a crashed holder frees the path within this
/// window.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 300_000;

/// How long resolved and unresolved file conflicts are retained for
/// operator diagnostics before the sweeper trims them.
pub const CONFLICT_RETENTION_SECS: u64 = 3_600;

/// Candidate count returned by task discovery. Pollers see up to this many
/// eligible tasks per call, priority+FIFO ordered.
pub const AVAILABLE_TASK_BATCH: usize = 5;

/// Per-subscriber event channel capacity. A subscriber lagging by more than
/// this loses its oldest events (counted, never silently closed).
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Background sweep cadence for expired locks, stale read holders, and
/// conflict retention.
pub const SWEEP_INTERVAL_SECS: u64 = 30;

/// Terminal tasks older than this are evicted from the in-memory backend.
pub const TASK_RETENTION_HOURS: i64 = 24;

/// Upper bound on queued tasks per server; enqueue beyond this fails with a
/// retryable storage error.
pub const MAX_QUEUE_SIZE: usize = 1_000;

/// Default per-client request quota for the rate-limit middleware.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

/// Default rate-limit accounting window.
pub const DEFAULT_RATE_WINDOW_MS: u64 = 60_000;
