//! Provides the shared pipeline services and a way to initialize them.
//!
//! [`SharedServices`] creates the boot phase gate, both resource caches, the bootstrapper, the
//! prefetch scheduler, the playback registry and the service orchestrator according to the
//! provided [`Config`]. Playback controllers and the feed pager are created from it.

use std::sync::Arc;

use crate::boot::BootPhaseGate;
use crate::bootstrap::Bootstrapper;
use crate::caching::{CoarseResources, ReadyItems, ResourceCache};
use crate::config::Config;
use crate::events::EventSink;
use crate::orchestrator::ServiceOrchestrator;
use crate::platform::MediaPlatform;
use crate::playback::{
    NoPositions, PlaybackController, PlaybackDeps, PlaybackEngine, PlaybackRegistry, PositionStore,
};
use crate::prefetch::{FeedPager, PrefetchScheduler, PrefetchTarget};

pub struct SharedServices {
    pub config: Config,
    pub platform: Arc<dyn MediaPlatform>,
    pub sink: Arc<dyn EventSink>,
    pub gate: Arc<BootPhaseGate>,
    pub coarse: ResourceCache<CoarseResources>,
    pub ready: ResourceCache<ReadyItems>,
    pub bootstrapper: Bootstrapper,
    pub scheduler: Arc<PrefetchScheduler>,
    pub registry: Arc<PlaybackRegistry>,
    pub orchestrator: ServiceOrchestrator,
    pub positions: Arc<dyn PositionStore>,
}

impl SharedServices {
    pub fn new(config: Config, platform: Arc<dyn MediaPlatform>, sink: Arc<dyn EventSink>) -> Self {
        let gate = Arc::new(BootPhaseGate::new());

        let coarse = ResourceCache::new(
            CoarseResources::new(platform.clone()),
            &config.caches.coarse,
            config.caches.transient_backoff,
            sink.clone(),
        );
        let ready = ResourceCache::new(
            ReadyItems::new(platform.clone()),
            &config.caches.ready,
            config.caches.transient_backoff,
            sink.clone(),
        );

        let bootstrapper = Bootstrapper::new(
            platform.clone(),
            gate.clone(),
            sink.clone(),
            config.boot.foreground_wait,
        );

        let targets: Vec<Arc<dyn PrefetchTarget>> =
            vec![Arc::new(coarse.clone()), Arc::new(ready.clone())];
        let scheduler = Arc::new(PrefetchScheduler::new(
            targets,
            gate.clone(),
            config.prefetch,
        ));

        let orchestrator = ServiceOrchestrator::new(gate.clone(), config.boot.first_content_wait);

        Self {
            config,
            platform,
            sink,
            gate,
            coarse,
            ready,
            bootstrapper,
            scheduler,
            registry: Arc::new(PlaybackRegistry::new()),
            orchestrator,
            positions: Arc::new(NoPositions),
        }
    }

    /// Resumes playback from the positions kept in `positions`.
    pub fn with_positions(mut self, positions: Arc<dyn PositionStore>) -> Self {
        self.positions = positions;
        self
    }

    pub fn playback_deps(&self) -> PlaybackDeps {
        PlaybackDeps {
            ready: self.ready.clone(),
            coarse: self.coarse.clone(),
            bootstrapper: self.bootstrapper.clone(),
            platform: self.platform.clone(),
            registry: self.registry.clone(),
            gate: self.gate.clone(),
            positions: self.positions.clone(),
            sink: self.sink.clone(),
            ready_wait: self.config.caches.ready.wait_timeout,
            coarse_wait: self.config.caches.coarse.wait_timeout,
            playback: self.config.playback,
        }
    }

    /// Creates a controller for the engine of a feed cell.
    pub fn controller(&self, engine: Arc<dyn PlaybackEngine>) -> PlaybackController {
        PlaybackController::new(self.playback_deps(), engine)
    }

    /// Creates the adapter for the feed paging host.
    pub fn feed_pager(&self) -> FeedPager {
        FeedPager::new(self.scheduler.clone())
    }
}
