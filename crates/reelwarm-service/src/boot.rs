//! Startup milestones and the live foreground flag.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;

/// Startup milestones, in the order they are normally reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootPhase {
    ProcessInit,
    FirstFrameRendered,
    AppForegroundActive,
    FirstContentReady,
}

impl BootPhase {
    pub const ALL: [BootPhase; 4] = [
        Self::ProcessInit,
        Self::FirstFrameRendered,
        Self::AppForegroundActive,
        Self::FirstContentReady,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessInit => "process_init",
            Self::FirstFrameRendered => "first_frame_rendered",
            Self::AppForegroundActive => "app_foreground_active",
            Self::FirstContentReady => "first_content_ready",
        }
    }
}

impl fmt::Display for BootPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of reached phases.
///
/// Phases may be reached out of order, so this is a set and not a high-water mark.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseSet(u8);

impl PhaseSet {
    pub fn contains(self, phase: BootPhase) -> bool {
        self.0 & phase.bit() != 0
    }

    #[must_use]
    pub fn with(self, phase: BootPhase) -> Self {
        Self(self.0 | phase.bit())
    }

    pub fn iter(self) -> impl Iterator<Item = BootPhase> {
        BootPhase::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

/// Tracks which boot phases were reached, and whether the app is in the foreground.
///
/// Reached phases never go away again. Waiting is notification based: every `mark` wakes the
/// tasks waiting in [`wait_until`](Self::wait_until).
#[derive(Debug)]
pub struct BootPhaseGate {
    reached: watch::Sender<PhaseSet>,
    foreground: watch::Sender<bool>,
}

impl Default for BootPhaseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl BootPhaseGate {
    /// Creates a gate that has reached [`BootPhase::ProcessInit`].
    pub fn new() -> Self {
        let (reached, _) = watch::channel(PhaseSet::default().with(BootPhase::ProcessInit));
        let (foreground, _) = watch::channel(false);
        Self {
            reached,
            foreground,
        }
    }

    pub fn mark(&self, phase: BootPhase) {
        let newly_reached = self.reached.send_if_modified(|reached| {
            if reached.contains(phase) {
                return false;
            }
            *reached = reached.with(phase);
            true
        });
        if newly_reached {
            tracing::info!(%phase, "Reached boot phase");
        }
    }

    pub fn has_reached(&self, phase: BootPhase) -> bool {
        self.reached.borrow().contains(phase)
    }

    pub fn reached(&self) -> PhaseSet {
        *self.reached.borrow()
    }

    /// Waits until `phase` is reached, at most `timeout`.
    ///
    /// Returns whether the phase was reached.
    pub async fn wait_until(&self, phase: BootPhase, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.reached_phase(phase)).await {
            Ok(reached) => reached,
            Err(_) => {
                tracing::debug!(
                    %phase,
                    timeout = %humantime::format_duration(timeout),
                    "Timed out waiting for boot phase"
                );
                false
            }
        }
    }

    async fn reached_phase(&self, phase: BootPhase) -> bool {
        let mut reached = self.reached.subscribe();
        // The sender lives in `self`, so this cannot fail while we are borrowed.
        reached
            .wait_for(|reached| reached.contains(phase))
            .await
            .is_ok()
    }

    /// Updates the foreground flag.
    ///
    /// The first time the app becomes active, [`BootPhase::AppForegroundActive`] is reached.
    pub fn set_foreground(&self, active: bool) {
        self.foreground.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
        if active {
            self.mark(BootPhase::AppForegroundActive);
        }
    }

    pub fn is_foreground_active(&self) -> bool {
        *self.foreground.borrow()
    }

    /// Subscribes to changes of the foreground flag.
    pub fn subscribe_foreground(&self) -> watch::Receiver<bool> {
        self.foreground.subscribe()
    }

    /// Whether resource usage should be kept minimal right now.
    ///
    /// This is the case until the first frame has rendered, and whenever the app is not in the
    /// foreground.
    pub fn is_critical_window(&self) -> bool {
        !self.has_reached(BootPhase::FirstFrameRendered) || !self.is_foreground_active()
    }

    /// Waits until heavyweight initialization may start, at most `timeout`.
    ///
    /// That is once the first frame has rendered and the app has been foreground-active.
    pub async fn wait_for_heavy_init(&self, timeout: Duration) -> bool {
        let wait = async {
            self.reached_phase(BootPhase::FirstFrameRendered).await
                && self.reached_phase(BootPhase::AppForegroundActive).await
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}
