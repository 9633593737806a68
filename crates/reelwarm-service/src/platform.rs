//! The seam towards the native media subsystem.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::caching::FetchResult;
use crate::types::{CoarseResource, PlayableItem, QualityOptions, ResourceId};

/// Receives download progress for a resource, as a fraction in `0.0..=1.0`.
pub type ProgressFn = Arc<dyn Fn(&ResourceId, f64) + Send + Sync>;

/// Identifies a native request so it can be cancelled later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(pub u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A native request that has been dispatched to the platform.
pub struct NativeRequest<T> {
    pub token: RequestToken,
    /// Resolves once the platform delivers, fails, or cancels the request.
    pub response: BoxFuture<'static, FetchResult<T>>,
}

impl<T> fmt::Debug for NativeRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRequest")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// The native media subsystem.
///
/// Requests are dispatched synchronously and answered asynchronously through
/// [`NativeRequest::response`]. Cancelling a token makes the platform stop its work; the
/// response future may then resolve to [`FetchError::Cancelled`](crate::caching::FetchError)
/// or never resolve at all.
pub trait MediaPlatform: Send + Sync + 'static {
    /// Requests the raw, reusable resource.
    fn request_resource(
        &self,
        id: &ResourceId,
        options: QualityOptions,
        progress: Option<ProgressFn>,
    ) -> NativeRequest<CoarseResource>;

    /// Requests a playback-ready item.
    fn request_ready_item(
        &self,
        id: &ResourceId,
        options: QualityOptions,
        progress: Option<ProgressFn>,
    ) -> NativeRequest<PlayableItem>;

    /// Wraps a coarse resource into a fresh playable item.
    fn make_playable(&self, resource: &CoarseResource) -> FetchResult<PlayableItem>;

    fn cancel_request(&self, token: RequestToken);
}
