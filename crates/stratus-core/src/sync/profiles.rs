//! Lazy sender-profile enrichment.
//!
//! Push payloads omit display metadata; this resolver fills it in after the
//! fact, memoized per sender so one prolific sender costs one lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::backend::Backend;
use crate::models::{ProfileSummary, UserId};

enum EnrichState {
    Resolved(ProfileSummary),
    /// Failed lookups so far; retried until the attempt bound is hit.
    Failing(u32),
    /// Permanent placeholder until the conversation is reloaded.
    GaveUp,
}

pub struct ProfileEnricher {
    backend: Arc<dyn Backend>,
    max_attempts: u32,
    cache: Mutex<HashMap<UserId, EnrichState>>,
}

impl ProfileEnricher {
    pub fn new(backend: Arc<dyn Backend>, max_attempts: u32) -> Self {
        Self {
            backend,
            max_attempts: max_attempts.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a sender's display profile. Returns None on a (bounded)
    /// failed or still-failing lookup; callers keep the placeholder
    /// identity in that case.
    pub async fn resolve(&self, sender_id: &UserId) -> Option<ProfileSummary> {
        {
            let cache = self.cache.lock();
            match cache.get(sender_id) {
                Some(EnrichState::Resolved(profile)) => return Some(profile.clone()),
                Some(EnrichState::GaveUp) => return None,
                _ => {}
            }
        }

        match self.backend.get_profile(sender_id).await {
            Ok(Some(profile)) => {
                self.cache
                    .lock()
                    .insert(sender_id.clone(), EnrichState::Resolved(profile.clone()));
                Some(profile)
            }
            Ok(None) => {
                // Unknown sender stays unknown until reload.
                self.cache
                    .lock()
                    .insert(sender_id.clone(), EnrichState::GaveUp);
                None
            }
            Err(err) => {
                let mut cache = self.cache.lock();
                let attempts = match cache.get(sender_id) {
                    Some(EnrichState::Failing(n)) => n + 1,
                    _ => 1,
                };
                if attempts >= self.max_attempts {
                    warn!(%sender_id, %err, "profile enrichment giving up");
                    cache.insert(sender_id.clone(), EnrichState::GaveUp);
                } else {
                    cache.insert(sender_id.clone(), EnrichState::Failing(attempts));
                }
                None
            }
        }
    }

    /// Drop all memoized state (conversation reload).
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
