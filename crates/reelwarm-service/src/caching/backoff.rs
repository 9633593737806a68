use std::time::Duration;

use crate::types::ResourceId;

use super::{CacheName, FetchError};

/// Resources that recently failed with a transient error.
///
/// An id stays blocked for `window` after its last transient failure, and entries expire on their
/// own, so the table stays bounded over a long session.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    window: Duration,
    blocked: moka::sync::Cache<ResourceId, FetchError>,
}

impl Backoff {
    pub(crate) fn new(name: CacheName, window: Duration) -> Self {
        Self {
            window,
            blocked: moka::sync::Cache::builder()
                .time_to_live(window)
                .eviction_listener(move |id, _, _| {
                    tracing::debug!(cache = %name, resource = %id, "Backoff expired")
                })
                .build(),
        }
    }

    /// Blocks `id` from being fetched again for the configured window.
    pub(crate) fn register_failure(&self, name: CacheName, id: &ResourceId, error: &FetchError) {
        tracing::info!(
            cache = %name,
            resource = %id,
            window = %humantime::format_duration(self.window),
            %error,
            "Backing off resource after transient failure"
        );
        self.blocked.insert(id.clone(), error.clone());
        metric!(gauge("caches.backoff.size") = self.blocked.entry_count(), "cache" => name.as_str());
    }

    /// If `id` is blocked, this returns the error that caused the block.
    pub(crate) fn blocked_by(&self, id: &ResourceId) -> Option<FetchError> {
        self.blocked.get(id)
    }

    pub(crate) fn clear(&self, id: &ResourceId) {
        self.blocked.invalidate(id);
    }
}
