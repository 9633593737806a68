use std::sync::Arc;

use crate::platform::{MediaPlatform, NativeRequest, ProgressFn, RequestToken};
use crate::types::{CoarseResource, PlayableItem, QualityOptions, ResourceId};

use super::CacheName;

/// Describes what a [`ResourceCache`](super::ResourceCache) holds and how to fetch it.
pub trait ResourceRequest: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;

    /// The name used in logs, metrics and lifecycle events.
    const NAME: CacheName;

    /// Whether an item is removed from the cache when it is handed out.
    const SINGLE_USE: bool;

    /// Dispatches a native request for `id`.
    fn start(&self, id: &ResourceId, progress: ProgressFn) -> NativeRequest<Self::Item>;

    /// Cancels a native request previously returned by [`start`](Self::start).
    fn cancel(&self, token: RequestToken);
}

/// Raw, reusable resources, fetched with prefetch quality.
#[derive(Clone)]
pub struct CoarseResources {
    platform: Arc<dyn MediaPlatform>,
}

impl CoarseResources {
    pub fn new(platform: Arc<dyn MediaPlatform>) -> Self {
        Self { platform }
    }
}

impl ResourceRequest for CoarseResources {
    type Item = CoarseResource;

    const NAME: CacheName = CacheName::Coarse;
    const SINGLE_USE: bool = false;

    fn start(&self, id: &ResourceId, progress: ProgressFn) -> NativeRequest<CoarseResource> {
        self.platform
            .request_resource(id, QualityOptions::PREFETCH, Some(progress))
    }

    fn cancel(&self, token: RequestToken) {
        self.platform.cancel_request(token)
    }
}

/// Single-use playable items, fetched with prefetch quality.
#[derive(Clone)]
pub struct ReadyItems {
    platform: Arc<dyn MediaPlatform>,
}

impl ReadyItems {
    pub fn new(platform: Arc<dyn MediaPlatform>) -> Self {
        Self { platform }
    }
}

impl ResourceRequest for ReadyItems {
    type Item = PlayableItem;

    const NAME: CacheName = CacheName::Ready;
    const SINGLE_USE: bool = true;

    fn start(&self, id: &ResourceId, progress: ProgressFn) -> NativeRequest<PlayableItem> {
        self.platform
            .request_ready_item(id, QualityOptions::PREFETCH, Some(progress))
    }

    fn cancel(&self, token: RequestToken) {
        self.platform.cancel_request(token)
    }
}
