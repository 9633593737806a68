use std::time::Duration;

use tokio::sync::broadcast;

use crate::types::{PlayableItem, ResourceId};

/// The readiness of the item attached to an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Unknown,
    ReadyToPlay,
    Failed,
}

/// Notifications of a [`PlaybackEngine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    Status(EngineStatus),
    /// Whether enough is buffered to play without stalling.
    Buffering { sufficient: bool },
    /// The attached item played to its end.
    EndOfContent,
}

/// The playback engine driven by one feed cell.
///
/// Implementations must be cheap to call; controllers call them while holding their own lock.
pub trait PlaybackEngine: Send + Sync + 'static {
    /// Attaches `item`, or detaches the current one when `None`.
    fn replace_item(&self, item: Option<PlayableItem>);

    fn play(&self);

    fn pause(&self);

    fn seek(&self, position: Duration);

    /// The current playback position.
    fn position(&self) -> Duration;

    fn status(&self) -> EngineStatus;

    fn is_buffering_sufficient(&self) -> bool;

    /// Subscribes to engine notifications.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Remembers where the user left off in a resource.
pub trait PositionStore: Send + Sync + 'static {
    fn last_position(&self, id: &ResourceId) -> Option<Duration>;
}

/// A [`PositionStore`] that always starts from the beginning.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPositions;

impl PositionStore for NoPositions {
    fn last_position(&self, _id: &ResourceId) -> Option<Duration> {
        None
    }
}
