//! Keeps the resources around the current feed position warm.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::boot::BootPhaseGate;
use crate::config::PrefetchConfig;
use crate::types::{FeedItem, ResourceId};

/// Something that can fetch resources ahead of time.
pub trait PrefetchTarget: Send + Sync + 'static {
    /// Starts fetching `ids`, unless they are already available or being fetched.
    fn prefetch(&self, ids: &[ResourceId]);

    /// Stops fetching `ids` and forgets about them.
    fn cancel(&self, ids: &[ResourceId]);

    /// Whether `id` is available right now.
    fn contains(&self, id: &ResourceId) -> bool;
}

/// The change of the prefetch window caused by one [`PrefetchScheduler::update`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WindowDiff {
    /// Newly prefetched ids, in feed order.
    pub added: Vec<ResourceId>,
    /// Cancelled ids, in the order they were issued.
    pub removed: Vec<ResourceId>,
}

impl WindowDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Computes the prefetch window around the current position and keeps the targets in sync with
/// it.
///
/// The window spans `lookbehind` items before and `lookahead` items after the current position.
/// While the app is in its critical window it shrinks to the current item alone. Only videos
/// take part.
pub struct PrefetchScheduler {
    targets: Vec<Arc<dyn PrefetchTarget>>,
    gate: Arc<BootPhaseGate>,
    config: PrefetchConfig,
    /// The ids of the last window, in feed order.
    issued: Mutex<Vec<ResourceId>>,
}

impl std::fmt::Debug for PrefetchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchScheduler")
            .field("targets", &self.targets.len())
            .field("config", &self.config)
            .field("issued", &*self.lock())
            .finish()
    }
}

impl PrefetchScheduler {
    pub fn new(
        targets: Vec<Arc<dyn PrefetchTarget>>,
        gate: Arc<BootPhaseGate>,
        config: PrefetchConfig,
    ) -> Self {
        Self {
            targets,
            gate,
            config,
            issued: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ResourceId>> {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The ids that should be warm for `current`, in feed order.
    pub fn desired_window(&self, current: usize, items: &[FeedItem]) -> Vec<ResourceId> {
        if current >= items.len() {
            return Vec::new();
        }
        let range = if self.gate.is_critical_window() {
            current..=current
        } else {
            let start = current.saturating_sub(self.config.lookbehind);
            let end = current
                .saturating_add(self.config.lookahead)
                .min(items.len() - 1);
            start..=end
        };

        let mut seen = HashSet::new();
        items[range]
            .iter()
            .filter(|item| item.kind.is_prefetchable())
            .filter(|item| seen.insert(item.id.clone()))
            .map(|item| item.id.clone())
            .collect()
    }

    /// Moves the window to `current`.
    ///
    /// Ids leaving the window are cancelled on every target and ids entering it are prefetched.
    /// An unchanged window makes no calls at all.
    pub fn update(&self, current: usize, items: &[FeedItem]) -> WindowDiff {
        let desired = self.desired_window(current, items);
        let mut issued = self.lock();

        let diff = WindowDiff {
            added: desired
                .iter()
                .filter(|id| !issued.contains(id))
                .cloned()
                .collect(),
            removed: issued
                .iter()
                .filter(|id| !desired.contains(id))
                .cloned()
                .collect(),
        };
        if diff.is_empty() {
            return diff;
        }

        tracing::debug!(
            current,
            added = diff.added.len(),
            removed = diff.removed.len(),
            critical = self.gate.is_critical_window(),
            "Moving prefetch window"
        );
        for target in &self.targets {
            if !diff.removed.is_empty() {
                target.cancel(&diff.removed);
            }
            if !diff.added.is_empty() {
                target.prefetch(&diff.added);
            }
        }
        metric!(gauge("prefetch.window") = desired.len() as u64);
        *issued = desired;

        diff
    }

    /// Cancels the whole window.
    pub fn reset(&self) {
        let issued = std::mem::take(&mut *self.lock());
        if issued.is_empty() {
            return;
        }
        for target in &self.targets {
            target.cancel(&issued);
        }
    }

    /// The ids of the current window, in feed order.
    pub fn issued(&self) -> Vec<ResourceId> {
        self.lock().clone()
    }

    /// Whether any target has `id` available.
    pub fn is_available(&self, id: &ResourceId) -> bool {
        self.targets.iter().any(|target| target.contains(id))
    }

    /// Prefetches ids regardless of the window.
    fn prefetch_outside_window(&self, ids: &[ResourceId]) {
        for target in &self.targets {
            target.prefetch(ids);
        }
    }

    /// Cancels ids, except the ones the window currently holds.
    fn cancel_outside_window(&self, ids: &[ResourceId]) -> Vec<ResourceId> {
        let issued = self.lock();
        let ids: Vec<_> = ids
            .iter()
            .filter(|id| !issued.contains(id))
            .cloned()
            .collect();
        drop(issued);

        if !ids.is_empty() {
            for target in &self.targets {
                target.cancel(&ids);
            }
        }
        ids
    }
}

/// The size at which the feed host is going to show an item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

struct FeedState {
    items: Arc<[FeedItem]>,
    position: usize,
}

/// Answers the paging callbacks of the feed host.
pub struct FeedPager {
    scheduler: Arc<PrefetchScheduler>,
    state: Mutex<FeedState>,
}

impl FeedPager {
    pub fn new(scheduler: Arc<PrefetchScheduler>) -> Self {
        Self {
            scheduler,
            state: Mutex::new(FeedState {
                items: Arc::from(Vec::new()),
                position: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn scheduler(&self) -> &Arc<PrefetchScheduler> {
        &self.scheduler
    }

    /// Replaces the feed contents and recomputes the window at the current position.
    pub fn set_items(&self, items: Vec<FeedItem>) -> WindowDiff {
        let (items, position) = {
            let mut state = self.lock();
            state.items = Arc::from(items);
            (state.items.clone(), state.position)
        };
        self.scheduler.update(position, &items)
    }

    /// Moves the current position and recomputes the window.
    pub fn on_position_changed(&self, position: usize) -> WindowDiff {
        let items = {
            let mut state = self.lock();
            state.position = position;
            state.items.clone()
        };
        self.scheduler.update(position, &items)
    }

    /// Recomputes the window at the current position, for example after the boot phase changed.
    pub fn refresh(&self) -> WindowDiff {
        let (items, position) = {
            let state = self.lock();
            (state.items.clone(), state.position)
        };
        self.scheduler.update(position, &items)
    }

    pub fn item(&self, index: usize) -> Option<FeedItem> {
        self.lock().items.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn video_ids(&self, indices: &[usize]) -> Vec<ResourceId> {
        let state = self.lock();
        let mut seen = HashSet::new();
        indices
            .iter()
            .filter_map(|index| state.items.get(*index))
            .filter(|item| item.kind.is_prefetchable())
            .filter(|item| seen.insert(item.id.clone()))
            .map(|item| item.id.clone())
            .collect()
    }

    /// The host expects the items at `indices` to be shown soon.
    ///
    /// The pipeline does not scale resources, so `target_size` is informational only.
    pub fn on_prefetch(&self, indices: &[usize], target_size: TargetSize) {
        let ids = self.video_ids(indices);
        tracing::trace!(
            count = ids.len(),
            width = target_size.width,
            height = target_size.height,
            "Host requested prefetch"
        );
        if !ids.is_empty() {
            self.scheduler.prefetch_outside_window(&ids);
        }
    }

    /// The host no longer expects the items at `indices` to be shown soon.
    ///
    /// Items inside the current prefetch window stay warm.
    pub fn on_cancel_prefetch(&self, indices: &[usize], target_size: TargetSize) {
        let ids = self.video_ids(indices);
        let cancelled = self.scheduler.cancel_outside_window(&ids);
        tracing::trace!(
            requested = ids.len(),
            cancelled = cancelled.len(),
            width = target_size.width,
            height = target_size.height,
            "Host cancelled prefetch"
        );
    }

    /// Whether the item at `index` can be shown right away.
    ///
    /// Images are preheated elsewhere and always count as ready.
    pub fn is_page_ready(&self, index: usize) -> bool {
        let Some(item) = self.item(index) else {
            return false;
        };
        !item.kind.is_prefetchable() || self.scheduler.is_available(&item.id)
    }
}
