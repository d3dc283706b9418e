//! Core data model: feed items, segments, and per-video bookkeeping.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifier of a feed video.
///
/// Cheap to clone and hash; every cache, queue, and lookup table in the
/// engine is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VideoId(Arc<str>);

impl VideoId {
    /// Wrap an externally-supplied feed id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The underlying string id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VideoId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for VideoId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl Serialize for VideoId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for VideoId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

/// One entry of the feed, delivered by the surrounding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    /// Stable id of the video.
    pub id: String,
    /// Canonical source location of the encoded stream.
    pub source_location: String,
    /// Poster image shown until enough segments are available.
    pub poster_location: String,
}

impl FeedItem {
    /// Convenience constructor for tests and embedding applications.
    pub fn new(
        id: impl Into<String>,
        source_location: impl Into<String>,
        poster_location: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_location: source_location.into(),
            poster_location: poster_location.into(),
        }
    }
}

/// Download urgency of a queued segment fetch.
///
/// The derived ordering puts the most urgent variant first, so
/// `a < b` means "a is more urgent than b".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Segment 0 of the currently viewed item. Front of the queue.
    Urgent,
    /// Remaining segments of the current item, segment 0 of the next.
    High,
    /// Speculative work (next item's tail, next-next's segment 0).
    Normal,
}

impl Priority {
    /// One step less urgent. `Normal` stays `Normal`; used for retry
    /// demotion after a failed fetch.
    pub fn demoted(self) -> Self {
        match self {
            Priority::Urgent => Priority::High,
            Priority::High => Priority::Normal,
            Priority::Normal => Priority::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single segment's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Not yet fetched (or evicted after a fetch).
    Pending,
    /// A worker currently owns the fetch.
    Downloading,
    /// Bytes are in the segment store.
    Downloaded,
    /// Retry budget exhausted. Degraded, not blocking.
    Failed,
}

/// One independently fetchable slice of a video's stream.
#[derive(Debug, Clone)]
pub struct VideoSegment {
    /// Position within the video, starting at 0.
    pub index: u32,
    /// Where to fetch this segment from.
    pub source_location: String,
    /// Declared size from the manifest; `None` for the synthetic fallback
    /// segment.
    pub expected_size: Option<u64>,
    /// Current download state. Written only by the download workers and the
    /// store eviction path.
    pub state: SegmentState,
}

impl VideoSegment {
    /// A segment declared by a manifest.
    pub fn new(index: u32, source_location: impl Into<String>, expected_size: Option<u64>) -> Self {
        Self {
            index,
            source_location: source_location.into(),
            expected_size,
            state: SegmentState::Pending,
        }
    }
}

/// How much of a video is locally available for playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Manifest not yet resolved, or nothing downloaded.
    Unresolved,
    /// Segment 0 is spooled; instant playback is possible.
    FirstSegmentReady,
    /// A contiguous prefix longer than one segment is spooled.
    PartiallyAssembled,
    /// Every segment is spooled.
    FullyAssembled,
    /// The video cannot become playable (segment 0 failed terminally).
    Errored,
}

/// Per-video progress of the prefetch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    ManifestResolving,
    FirstSegmentQueued,
    FirstSegmentReady,
    ProgressiveLoading,
    FullyLoaded,
    Errored,
}

/// Handle to the spooled playable artifact of one video.
///
/// The artifact file holds the physical concatenation of segments
/// `[0, segments_written)` and only ever grows.
#[derive(Debug, Clone)]
pub struct PlayableArtifact {
    /// Spool file consumed by the platform media player.
    pub path: PathBuf,
    /// Number of prefix segments appended so far.
    pub segments_written: u32,
    /// Total bytes appended so far.
    pub bytes_written: u64,
}

/// Everything the engine tracks for one feed video.
///
/// One record per id for the lifetime of the in-memory cache. All mutation
/// funnels through the download workers' completion path and the prefetch
/// scheduler, serialized by the per-video lock in the engine arena.
#[derive(Debug, Clone)]
pub struct SegmentedVideo {
    pub id: VideoId,
    pub source_location: String,
    pub poster_location: String,
    /// Duration of each segment; `None` until resolved, and for the
    /// synthetic fallback segment (whole-video length unknown).
    pub segment_duration_secs: Option<f64>,
    /// Fixed-length once the manifest is resolved; empty before that.
    pub segments: Vec<VideoSegment>,
    /// Indices currently held by the segment store.
    pub downloaded: BTreeSet<u32>,
    pub artifact: Option<PlayableArtifact>,
    pub readiness: Readiness,
    pub fetch_state: FetchState,
}

impl SegmentedVideo {
    /// Unresolved skeleton for a feed item.
    pub fn new(item: &FeedItem) -> Self {
        Self {
            id: VideoId::new(&item.id),
            source_location: item.source_location.clone(),
            poster_location: item.poster_location.clone(),
            segment_duration_secs: None,
            segments: Vec::new(),
            downloaded: BTreeSet::new(),
            artifact: None,
            readiness: Readiness::Unresolved,
            fetch_state: FetchState::Idle,
        }
    }

    /// Whether the manifest (or fallback) has populated the segment list.
    pub fn is_resolved(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Total number of declared segments.
    pub fn segment_count(&self) -> u32 {
        self.segments.len() as u32
    }

    /// Install the segment list produced by manifest resolution. A no-op if
    /// the video is already resolved; the segment list is fixed-length once
    /// set.
    pub fn populate_segments(&mut self, segments: Vec<VideoSegment>, duration_secs: Option<f64>) {
        if self.is_resolved() {
            return;
        }
        self.segments = segments;
        self.segment_duration_secs = duration_secs;
    }

    pub fn segment(&self, index: u32) -> Option<&VideoSegment> {
        self.segments.get(index as usize)
    }

    pub fn segment_mut(&mut self, index: u32) -> Option<&mut VideoSegment> {
        self.segments.get_mut(index as usize)
    }

    /// Record a completed download.
    pub fn mark_downloaded(&mut self, index: u32) {
        if let Some(seg) = self.segment_mut(index) {
            seg.state = SegmentState::Downloaded;
        }
        self.downloaded.insert(index);
    }

    /// Eviction path: the segment's bytes left the store, so it becomes
    /// fetchable again.
    pub fn reset_segment(&mut self, index: u32) {
        if let Some(seg) = self.segment_mut(index) {
            if seg.state == SegmentState::Downloaded {
                seg.state = SegmentState::Pending;
            }
        }
        self.downloaded.remove(&index);
    }

    /// Length `k` of the longest contiguous run of downloaded segments
    /// starting at index 0.
    pub fn contiguous_prefix(&self) -> u32 {
        let mut k = 0u32;
        for index in &self.downloaded {
            if *index == k {
                k += 1;
            } else {
                break;
            }
        }
        k
    }
}
