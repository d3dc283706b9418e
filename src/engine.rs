//! The engine: per-video arena, download worker pool, and the public
//! control surface.
//!
//! All long-lived state hangs off one [`EngineShared`] behind an `Arc`.
//! Per-video state lives in an append-only arena of locked slots with an
//! id-to-index side table, so workers, resolution tasks, and the caller's
//! thread can each reach a video without contending on one global lock.
//! Mutation of a video funnels through its slot lock; no code path ever
//! holds two slot locks at once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assembly::AssemblyUnit;
use crate::config::EngineConfig;
use crate::downloader::{DownloadScheduler, DownloadTask, SegmentFetcher};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus, EventPayload};
use crate::health;
use crate::manifest::{ManifestResolver, Resolution};
use crate::prefetch::{PlanRole, PrefetchPlan};
use crate::store::{CacheStats, SegmentKey, SegmentStore};
use crate::video::{
    FeedItem, FetchState, Readiness, SegmentState, SegmentedVideo, VideoId,
};

/// Base delay for manifest probe retries; doubles per attempt.
const RESOLVE_BACKOFF_BASE_MS: u64 = 200;

/// What the presentation layer should hand to the media player right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayableHandle {
    /// Spooled artifact file covering the requested position.
    Media(PathBuf),
    /// Not enough local data yet; show the poster image instead.
    Poster(String),
}

type VideoSlot = Arc<Mutex<SegmentedVideo>>;

struct EngineShared {
    config: EngineConfig,
    /// Append-only arena of per-video slots. Slots are never removed while
    /// the engine lives, so indices stay stable.
    arena: RwLock<Vec<VideoSlot>>,
    index_of: DashMap<VideoId, usize>,
    feed: RwLock<Vec<FeedItem>>,
    plan: RwLock<Option<PrefetchPlan>>,
    store: SegmentStore,
    scheduler: DownloadScheduler,
    fetcher: SegmentFetcher,
    resolver: ManifestResolver,
    assembly: AssemblyUnit,
    events: EventBus,
    /// Videos with a manifest probe in flight; single-flight guard.
    resolving: DashMap<VideoId, ()>,
    cancel: CancellationToken,
}

impl EngineShared {
    fn slot(&self, id: &VideoId) -> Option<VideoSlot> {
        let index = self.index_of.get(id).map(|entry| *entry.value())?;
        self.arena.read().get(index).cloned()
    }

    /// Queue the downloads a plan role calls for: segment 0 at the role's
    /// lead priority, the remaining indices (low to high) at its tail
    /// priority. Segments that are downloading, downloaded, or failed are
    /// skipped; already-queued duplicates are merged or promoted by the
    /// work queue itself.
    fn enqueue_for_role(&self, id: &VideoId, role: PlanRole) {
        let Some(first_priority) = role.first_segment_priority() else {
            return;
        };
        let Some(slot) = self.slot(id) else { return };

        let mut video = slot.lock();
        if !video.is_resolved() {
            return;
        }

        if video
            .segment(0)
            .map_or(false, |s| s.state == SegmentState::Pending)
        {
            self.scheduler.enqueue(id.clone(), 0, first_priority);
            if matches!(
                video.fetch_state,
                FetchState::Idle | FetchState::ManifestResolving
            ) {
                video.fetch_state = FetchState::FirstSegmentQueued;
            }
        }

        if let Some(tail_priority) = role.tail_priority() {
            for index in 1..video.segment_count() {
                if video
                    .segment(index)
                    .map_or(false, |s| s.state == SegmentState::Pending)
                {
                    self.scheduler.enqueue(id.clone(), index, tail_priority);
                }
            }
        }
    }

    /// A store eviction removed this key; the segment becomes fetchable
    /// again and subscribers hear about the lost data.
    fn on_evicted(&self, key: SegmentKey) {
        if let Some(slot) = self.slot(&key.video) {
            slot.lock().reset_segment(key.index);
        }
        self.events.broadcast(EventPayload::EntryEvicted {
            video_id: key.video,
            index: key.index,
        });
    }
}

/// Segmented prefetch-and-cache engine for an ordered short-form video
/// feed.
///
/// Spawns its download worker pool on construction and must therefore be
/// created inside a tokio runtime. Dropping the engine without calling
/// [`Engine::shutdown`] leaves the spool directory behind.
pub struct Engine {
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Start the engine and its worker pool.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let cancel = CancellationToken::new();

        let store = SegmentStore::new(config.max_cache_bytes);
        let assembly = AssemblyUnit::new(config.spool_dir.clone())?;
        let resolver = ManifestResolver::new(
            config.manifest.probe_suffix.clone(),
            Duration::from_secs(config.manifest.probe_timeout_secs),
        );
        let fetcher = SegmentFetcher::new(config.download.clone());
        let scheduler = DownloadScheduler::new(cancel.clone());

        let concurrency = config.download.concurrency;
        let shared = Arc::new(EngineShared {
            config,
            arena: RwLock::new(Vec::new()),
            index_of: DashMap::new(),
            feed: RwLock::new(Vec::new()),
            plan: RwLock::new(None),
            store,
            scheduler,
            fetcher,
            resolver,
            assembly,
            events: EventBus::new(),
            resolving: DashMap::new(),
            cancel: cancel.clone(),
        });

        let workers = (0..concurrency)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let cancel = cancel.clone();
                tokio::spawn(run_worker(shared, cancel, worker_id))
            })
            .collect();

        info!(
            concurrency,
            max_cache_bytes = shared.config.max_cache_bytes,
            spool_dir = %shared.config.spool_dir.display(),
            "Prefetch engine started"
        );

        Ok(Self {
            shared,
            cancel,
            workers: Mutex::new(workers),
        })
    }

    /// Stop the workers, abort in-flight fetches, and remove the spool
    /// directory. The cache is session-transient; nothing survives.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        self.shared.assembly.clear();
        info!("Prefetch engine stopped");
    }

    /// Replace the feed. New items get a fresh arena slot; items seen
    /// before keep their existing slot and any cached progress.
    pub fn set_feed(&self, items: Vec<FeedItem>) {
        for item in &items {
            self.register_item(item);
        }
        let count = items.len();
        *self.shared.feed.write() = items;
        debug!(count, "Feed updated");
    }

    fn register_item(&self, item: &FeedItem) {
        let id = VideoId::new(&item.id);
        if self.shared.index_of.contains_key(&id) {
            return;
        }
        let mut arena = self.shared.arena.write();
        // Re-check under the arena lock; a concurrent set_feed may have won.
        if self.shared.index_of.contains_key(&id) {
            return;
        }
        arena.push(Arc::new(Mutex::new(SegmentedVideo::new(item))));
        self.shared.index_of.insert(id, arena.len() - 1);
    }

    /// React to a scroll: derive the prefetch plan for the new position and
    /// apply it. Errors if the index is outside the feed.
    pub fn set_scroll_position(&self, index: usize) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let plan = {
            let feed = self.shared.feed.read();
            PrefetchPlan::from_feed(&feed, index)
        }
        .ok_or_else(|| Error::UnknownVideo(format!("feed index {index} out of range")))?;

        self.set_plan(plan);
        Ok(())
    }

    /// Apply a prefetch plan: cancel work outside it, re-point cache
    /// protection, and queue downloads for its members by role. Videos
    /// without a resolved manifest get a single-flight probe first.
    pub fn set_plan(&self, plan: PrefetchPlan) {
        info!(current = %plan.current, "Applying prefetch plan");

        self.shared.scheduler.cancel_all_except(&plan.keep_set());
        self.shared.store.set_protected(plan.protected_set());
        self.shared.events.broadcast(EventPayload::PlanApplied {
            current: plan.current.clone(),
            next: plan.next.clone(),
            next_next: plan.next_next.clone(),
            previous: plan.previous.clone(),
        });

        let assignments = plan.assignments();
        *self.shared.plan.write() = Some(plan);
        for (id, role) in assignments {
            schedule_video(&self.shared, id, role);
        }
    }

    /// The currently active plan, if any.
    pub fn plan(&self) -> Option<PrefetchPlan> {
        self.shared.plan.read().clone()
    }

    /// Whether playback of `id` can start right now. See
    /// [`health::is_playable`].
    pub fn is_playable(&self, id: &str, require_full: bool) -> bool {
        self.shared
            .slot(&VideoId::new(id))
            .map_or(false, |slot| health::is_playable(&slot.lock(), require_full))
    }

    /// Percentage (0-100) of the video's segments downloaded; 0 for
    /// unknown ids.
    pub fn buffer_health(&self, id: &str) -> u8 {
        self.shared
            .slot(&VideoId::new(id))
            .map_or(0, |slot| health::buffer_health(&slot.lock()))
    }

    /// What to hand the player for `id` at playback position `at_secs`.
    ///
    /// The spooled artifact is returned when it covers the position (or
    /// covers the whole video); otherwise the poster stands in. `None`
    /// only for ids the feed never mentioned.
    pub fn playable_handle(&self, id: &str, at_secs: f64) -> Option<PlayableHandle> {
        let slot = self.shared.slot(&VideoId::new(id))?;
        let video = slot.lock();

        if let Some(artifact) = &video.artifact {
            if artifact.segments_written > 0 {
                let covers_all = artifact.segments_written == video.segment_count();
                let covered_secs = video
                    .segment_duration_secs
                    .map(|d| d * artifact.segments_written as f64);
                if covers_all || covered_secs.is_some_and(|secs| at_secs < secs) {
                    return Some(PlayableHandle::Media(artifact.path.clone()));
                }
            }
        }

        Some(PlayableHandle::Poster(video.poster_location.clone()))
    }

    /// Current readiness of a video; `None` for unknown ids.
    pub fn readiness(&self, id: &str) -> Option<Readiness> {
        self.shared
            .slot(&VideoId::new(id))
            .map(|slot| slot.lock().readiness)
    }

    /// Subscribe to engine events (readiness transitions, downloads,
    /// evictions, plan changes).
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Recent events for late subscribers, oldest first.
    pub fn recent_events(&self) -> Vec<EngineEvent> {
        self.shared.events.recent()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.store.stats()
    }

    /// Number of videos registered in the arena.
    pub fn video_count(&self) -> usize {
        self.shared.arena.read().len()
    }
}

/// Kick off work for one plan member. Resolved videos are queued directly;
/// unresolved ones get a single-flight manifest probe that queues on
/// completion.
fn schedule_video(shared: &Arc<EngineShared>, id: VideoId, role: PlanRole) {
    if role.first_segment_priority().is_none() {
        // Previous: cache protection only, no new downloads.
        return;
    }
    let Some(slot) = shared.slot(&id) else {
        warn!(video_id = %id, "Plan references a video missing from the arena");
        return;
    };

    let resolved = {
        let mut video = slot.lock();
        if video.is_resolved() {
            true
        } else {
            if video.fetch_state == FetchState::Idle {
                video.fetch_state = FetchState::ManifestResolving;
            }
            false
        }
    };

    if resolved {
        shared.enqueue_for_role(&id, role);
        return;
    }

    match shared.resolving.entry(id.clone()) {
        Entry::Occupied(_) => {}
        Entry::Vacant(vacant) => {
            vacant.insert(());
            let shared = Arc::clone(shared);
            tokio::spawn(resolve_video(shared, id));
        }
    }
}

/// Resolve a video's manifest with retries, then install the result and
/// queue downloads under the plan role the video holds by then.
async fn resolve_video(shared: Arc<EngineShared>, id: VideoId) {
    let source = match shared.slot(&id) {
        Some(slot) => slot.lock().source_location.clone(),
        None => {
            shared.resolving.remove(&id);
            return;
        }
    };

    let max_retries = shared.config.download.max_retries;
    let mut attempt = 0u32;
    let resolution = loop {
        match shared.resolver.resolve(&source).await {
            Ok(resolution) => break Some(resolution),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                let backoff = Duration::from_millis(RESOLVE_BACKOFF_BASE_MS << attempt.min(5));
                warn!(video_id = %id, error = %e, attempt, "Manifest probe failed; retrying");
                tokio::select! {
                    _ = shared.cancel.cancelled() => break None,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => {
                // Out of retries. Degrade to the single-segment fallback so
                // the segment fetch path gets its own chance at the source.
                warn!(
                    video_id = %id,
                    error = %e,
                    "Manifest probe exhausted retries; using fallback"
                );
                break Some(Resolution::Fallback);
            }
        }
    };

    shared.resolving.remove(&id);
    if let Some(resolution) = resolution {
        apply_resolution(&shared, &id, resolution);
    }
}

fn apply_resolution(shared: &Arc<EngineShared>, id: &VideoId, resolution: Resolution) {
    let Some(slot) = shared.slot(id) else { return };
    let fallback = resolution.is_fallback();

    let segment_count = {
        let mut video = slot.lock();
        if !video.is_resolved() {
            let source = video.source_location.clone();
            let (segments, duration) = resolution.into_segments(&source);
            video.populate_segments(segments, duration);
        }
        if video.fetch_state == FetchState::ManifestResolving {
            video.fetch_state = FetchState::Idle;
        }
        video.segment_count()
    };

    shared.events.broadcast(EventPayload::ManifestResolved {
        video_id: id.clone(),
        segment_count,
        fallback,
    });

    // The plan may have moved on while the probe was in flight; enqueue
    // under whatever role it assigns now, if any.
    let role = shared.plan.read().as_ref().and_then(|p| p.role_of(id));
    if let Some(role) = role {
        shared.enqueue_for_role(id, role);
    }
}

async fn run_worker(shared: Arc<EngineShared>, cancel: CancellationToken, worker_id: usize) {
    debug!(worker_id, "Download worker started");
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = shared.scheduler.next_task() => task,
        };
        process_task(&shared, task).await;
    }
    debug!(worker_id, "Download worker stopped");
}

/// Run one download task to completion: fetch, cache, spool, notify.
async fn process_task(shared: &Arc<EngineShared>, task: DownloadTask) {
    let id = task.key.video.clone();
    let index = task.key.index;

    let Some(slot) = shared.slot(&id) else { return };

    // Claim the segment. Anything other than Pending means another worker
    // got here first, the bytes already landed, or the retry budget is
    // spent.
    let (url, expected_size) = {
        let mut video = slot.lock();
        let Some(segment) = video.segment_mut(index) else {
            return;
        };
        if segment.state != SegmentState::Pending {
            debug!(key = %task.key, state = ?segment.state, "Skipping task for non-pending segment");
            return;
        }
        segment.state = SegmentState::Downloading;
        (segment.source_location.clone(), segment.expected_size)
    };

    let token = shared.scheduler.video_token(&id);
    let outcome = shared
        .fetcher
        .fetch(&url, expected_size, task.priority, &token)
        .await;

    match outcome {
        // Cancelled: the plan moved on. Partial data is discarded and the
        // segment becomes fetchable again if the video returns to a plan.
        Ok(None) => {
            debug!(key = %task.key, "Fetch cancelled");
            revert_to_pending(&slot, index);
        }

        Ok(Some(data)) => {
            let in_plan = shared
                .plan
                .read()
                .as_ref()
                .map_or(true, |p| p.contains(&id));
            if !in_plan {
                debug!(key = %task.key, "Plan moved on during fetch; discarding data");
                revert_to_pending(&slot, index);
                return;
            }

            let bytes = data.len() as u64;
            match shared.store.put(task.key.clone(), data, task.priority) {
                Ok(evicted) => {
                    for key in evicted {
                        shared.on_evicted(key);
                    }

                    let readiness_change = {
                        let mut video = slot.lock();
                        video.mark_downloaded(index);
                        let change = match shared.assembly.refresh(&mut video, &shared.store) {
                            Ok(change) => change,
                            Err(e) => {
                                error!(video_id = %id, error = %e, "Spooling failed");
                                None
                            }
                        };
                        update_fetch_state(&mut video);
                        change
                    };

                    shared.events.broadcast(EventPayload::SegmentDownloaded {
                        video_id: id.clone(),
                        index,
                        bytes,
                    });
                    if let Some(readiness) = readiness_change {
                        shared.events.broadcast(EventPayload::ReadinessChanged {
                            video_id: id.clone(),
                            readiness,
                        });
                    }
                }
                Err(e) => {
                    // Budget full of protected data. The segment stays
                    // pending and is retried when a later plan frees room.
                    warn!(key = %task.key, error = %e, "Store rejected segment");
                    revert_to_pending(&slot, index);
                }
            }
        }

        Err(e) => {
            let retry = e.is_retryable() && task.attempt < shared.config.download.max_retries;

            let errored = {
                let mut video = slot.lock();
                if let Some(segment) = video.segment_mut(index) {
                    segment.state = if retry {
                        SegmentState::Pending
                    } else {
                        SegmentState::Failed
                    };
                }
                if !retry && index == 0 && video.contiguous_prefix() == 0 {
                    // Segment 0 is terminally gone and nothing was ever
                    // spooled; the video cannot become playable.
                    video.readiness = Readiness::Errored;
                    video.fetch_state = FetchState::Errored;
                    true
                } else {
                    false
                }
            };

            if retry {
                let mut task = task;
                task.attempt += 1;
                task.priority = task.priority.demoted();
                warn!(
                    key = %task.key,
                    attempt = task.attempt,
                    priority = %task.priority,
                    error = %e,
                    "Download failed; re-queueing demoted"
                );
                shared.scheduler.requeue(task);
            } else {
                warn!(key = %task.key, error = %e, "Segment failed permanently");
                shared.events.broadcast(EventPayload::SegmentFailed {
                    video_id: id.clone(),
                    index,
                    error: e.to_string(),
                });
                if errored {
                    shared.events.broadcast(EventPayload::ReadinessChanged {
                        video_id: id,
                        readiness: Readiness::Errored,
                    });
                }
            }
        }
    }
}

fn revert_to_pending(slot: &VideoSlot, index: u32) {
    let mut video = slot.lock();
    if let Some(segment) = video.segment_mut(index) {
        if segment.state == SegmentState::Downloading {
            segment.state = SegmentState::Pending;
        }
    }
}

fn update_fetch_state(video: &mut SegmentedVideo) {
    if video.fetch_state == FetchState::Errored {
        return;
    }
    let total = video.segment_count();
    let downloaded = video.downloaded.len() as u32;
    if total > 0 && downloaded == total {
        video.fetch_state = FetchState::FullyLoaded;
    } else if video.downloaded.contains(&0) {
        video.fetch_state = if downloaded > 1 {
            FetchState::ProgressiveLoading
        } else {
            FetchState::FirstSegmentReady
        };
    }
}
