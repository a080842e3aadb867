//! Application-wide constants
//!
//! Centralized location for magic values used across multiple modules.

/// Tolerance window for matching a provisional message against its
/// authoritative push echo when the row carries no client tag.
pub const DEDUP_WINDOW_MS: i64 = 5_000;

/// Prefix marking a locally generated, not-yet-confirmed message id.
pub const PROVISIONAL_ID_PREFIX: &str = "local-";

/// Display name shown while (or after) profile enrichment fails.
pub const PLACEHOLDER_DISPLAY_NAME: &str = "Unknown user";

/// Durable writes that take longer than this are rolled back.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 10_000;

/// Subscriptions that do not reach `Active` within this bound are
/// treated as failed and retried with backoff.
pub const DEFAULT_SUBSCRIBE_TIMEOUT_MS: u64 = 10_000;

/// Initial reconnect backoff after a dropped push subscription.
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 500;

/// Reconnect backoff ceiling.
pub const DEFAULT_RECONNECT_BACKOFF_CAP_MS: u64 = 30_000;

/// Interval between drift-correcting full unread recomputes.
pub const DEFAULT_DRIFT_INTERVAL_SECS: u64 = 120;

/// Profile lookups are retried at most this many times per sender
/// before the placeholder identity becomes permanent.
pub const DEFAULT_ENRICHMENT_ATTEMPTS: u32 = 3;
