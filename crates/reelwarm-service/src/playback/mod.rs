//! Per-cell playback on top of the caches.
//!
//! Every visible feed cell owns a [`PlaybackController`], which drives one
//! [`PlaybackEngine`]. The controller resolves a playable item through a cascade of load paths
//! (ready-item cache, coarse cache, direct fetch), attaches it to the engine, and then plays or
//! pauses it depending on whether the cell is centered, the app is in the foreground and the
//! engine has buffered enough.
//!
//! The [`PlaybackRegistry`] is shared by all controllers and pauses every other engine before one
//! starts playing.

mod controller;
mod engine;
mod registry;

pub use controller::{PlaybackController, PlaybackDeps, PlaybackState};
pub use engine::{EngineEvent, EngineStatus, NoPositions, PlaybackEngine, PositionStore};
pub use registry::{EngineId, PlaybackRegistry};
