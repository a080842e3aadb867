use std::time::Duration;

use crate::constants::{
    DEFAULT_DRIFT_INTERVAL_SECS, DEFAULT_ENRICHMENT_ATTEMPTS, DEFAULT_RECONNECT_BACKOFF_CAP_MS,
    DEFAULT_RECONNECT_BACKOFF_MS, DEFAULT_SEND_TIMEOUT_MS, DEFAULT_SUBSCRIBE_TIMEOUT_MS,
};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Durable writes exceeding this are rolled back and reported failed.
    pub send_timeout: Duration,
    /// Subscriptions not `Active` within this bound transition to `Error`.
    pub subscribe_timeout: Duration,
    /// Initial reconnect backoff, doubled per attempt.
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_cap: Duration,
    /// Fixed interval between drift-correcting unread recomputes.
    pub drift_interval: Duration,
    /// Profile lookup attempts per sender before giving up.
    pub enrichment_attempts: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            subscribe_timeout: Duration::from_millis(DEFAULT_SUBSCRIBE_TIMEOUT_MS),
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
            reconnect_backoff_cap: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_CAP_MS),
            drift_interval: Duration::from_secs(DEFAULT_DRIFT_INTERVAL_SECS),
            enrichment_attempts: DEFAULT_ENRICHMENT_ATTEMPTS,
        }
    }
}
