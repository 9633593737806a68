//! The media readiness pipeline.
//!
//! Turns a scroll position in a vertical feed into a warm cache of playable media, while keeping
//! resource usage low during the critical boot window. See [`services::SharedServices`] for the
//! entry point that wires everything together.

#[macro_use]
pub mod metrics;

pub mod boot;
pub mod bootstrap;
pub mod caching;
pub mod config;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod playback;
pub mod prefetch;
pub mod services;
pub mod types;
pub mod utils;

#[cfg(any(feature = "test", test))]
#[allow(unused)]
pub mod test;
