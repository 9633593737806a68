//! Identifiers and handles shared by every stage of the pipeline.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a media resource.
///
/// This is the cache key everywhere. Cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Arc<str>);

impl ResourceId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

/// The kind of media a feed item shows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    /// Images are preheated by a separate image pipeline.
    Image,
}

impl MediaKind {
    /// Whether items of this kind take part in window prefetching.
    pub fn is_prefetchable(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// An entry of the feed, as handed over by the feed host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedItem {
    pub id: ResourceId,
    pub kind: MediaKind,
}

impl FeedItem {
    pub fn video(id: impl Into<ResourceId>) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Video,
        }
    }

    pub fn image(id: impl Into<ResourceId>) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Image,
        }
    }
}

/// An opaque object owned by the media platform.
///
/// The pipeline never looks inside; it only moves handles between the platform and the
/// playback engine.
#[derive(Clone)]
pub struct NativeHandle(Arc<dyn Any + Send + Sync>);

impl NativeHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrows the platform object, if it is of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Whether both handles refer to the same platform object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NativeHandle(..)")
    }
}

/// A raw, reusable resource handle from which playable items can be made.
#[derive(Clone, Debug)]
pub struct CoarseResource {
    pub id: ResourceId,
    pub handle: NativeHandle,
}

/// A playback-ready item.
///
/// A playable item can only be attached to a single engine, so caches hand it out once.
#[derive(Clone, Debug)]
pub struct PlayableItem {
    pub id: ResourceId,
    pub handle: NativeHandle,
}

/// How the platform should deliver a requested resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Degraded but quick delivery.
    Fast,
    /// Full-fidelity delivery.
    HighQuality,
}

/// Options passed to the platform with every native request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QualityOptions {
    pub delivery: DeliveryMode,
    /// Whether the platform may go to the network for the resource.
    pub network_access: bool,
}

impl QualityOptions {
    /// Used for window prefetching.
    pub const PREFETCH: Self = Self {
        delivery: DeliveryMode::Fast,
        network_access: true,
    };

    /// Used by the bootstrapper as the last load path.
    pub const FULL_FIDELITY: Self = Self {
        delivery: DeliveryMode::HighQuality,
        network_access: true,
    };
}
