use std::sync::Arc;

use reelwarm_service::boot::BootPhase;
use reelwarm_service::config::Config;
use reelwarm_service::services::SharedServices;
use reelwarm_service::test::{self, RecordingSink, ScriptedPlatform};
use reelwarm_service::types::FeedItem;

pub use reelwarm_service::test::{EngineCall, FakeEngine, Outcome};

/// Setup tests and create the shared services on top of a scripted platform.
///
/// The `update_config` closure can modify any default configuration if needed before the
/// services are created.
pub fn setup_services(
    update_config: impl FnOnce(&mut Config),
) -> (SharedServices, Arc<ScriptedPlatform>, Arc<RecordingSink>) {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let platform = ScriptedPlatform::new();
    let sink = RecordingSink::new();
    let services = SharedServices::new(config, platform.clone(), sink.clone());
    (services, platform, sink)
}

/// Moves the gate past the critical window.
pub fn finish_boot(services: &SharedServices) {
    services.gate.mark(BootPhase::FirstFrameRendered);
    services.gate.set_foreground(true);
}

/// A feed of `len` videos named after their index.
pub fn video_feed(len: usize) -> Vec<FeedItem> {
    (0..len).map(|i| FeedItem::video(i.to_string())).collect()
}

pub fn ids(range: impl IntoIterator<Item = usize>) -> Vec<reelwarm_service::types::ResourceId> {
    range.into_iter().map(|i| i.to_string().into()).collect()
}
