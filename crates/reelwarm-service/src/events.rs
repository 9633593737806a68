//! Lifecycle events reported to an external trace or metrics sink.

use std::fmt;

use crate::types::ResourceId;

/// The named lifecycle events of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    RequestStart,
    RequestEnd,
    ItemApplied,
    ItemReady,
    FirstFrameShown,
    StallBegin,
    StallEnd,
    Cancelled,
    Failed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestStart => "request_start",
            Self::RequestEnd => "request_end",
            Self::ItemApplied => "item_applied",
            Self::ItemReady => "item_ready",
            Self::FirstFrameShown => "first_frame_shown",
            Self::StallBegin => "stall_begin",
            Self::StallEnd => "stall_end",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which load path delivered the item a controller is playing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadPath {
    ReadyItemCache,
    CoarseCache,
    DirectFetch,
}

impl LoadPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadyItemCache => "ready_item_cache",
            Self::CoarseCache => "coarse_cache",
            Self::DirectFetch => "direct_fetch",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub resource: ResourceId,
    /// The load path, once it is known.
    pub path: Option<LoadPath>,
    /// The component that emitted the event.
    pub origin: &'static str,
}

impl LifecycleEvent {
    pub fn new(kind: EventKind, resource: ResourceId, origin: &'static str) -> Self {
        Self {
            kind,
            resource,
            path: None,
            origin,
        }
    }

    pub fn with_path(mut self, path: Option<LoadPath>) -> Self {
        self.path = path;
        self
    }
}

/// Consumes lifecycle events.
///
/// Emitting must be cheap and must not block; sinks are called from within the pipeline's
/// critical sections.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: LifecycleEvent);
}

/// Forwards lifecycle events to `tracing` and to statsd.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: LifecycleEvent) {
        let path = event.path.map_or("none", LoadPath::as_str);
        match event.kind {
            EventKind::Failed => tracing::warn!(
                resource = %event.resource,
                path,
                origin = event.origin,
                "{}",
                event.kind
            ),
            _ => tracing::debug!(
                resource = %event.resource,
                path,
                origin = event.origin,
                "{}",
                event.kind
            ),
        }
        metric!(
            counter("lifecycle.event") += 1,
            "kind" => event.kind.as_str(),
            "path" => path,
            "origin" => event.origin,
        );
    }
}
