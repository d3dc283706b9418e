//! Prefetch planning: maps a scroll position to per-video download
//! priorities.
//!
//! Urgency strictly decreases with scroll distance, and within one video
//! low segment indices strictly precede high ones, because playback is
//! sequential and a missing low index blocks assembly no matter how many
//! high indices are ready.

use std::collections::HashSet;

use crate::video::{FeedItem, Priority, VideoId};

/// The set of feed items currently eligible for background downloading and
/// cache protection. At most one plan is active; applying a new one
/// reclassifies all queued, in-flight, and cached work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchPlan {
    pub current: VideoId,
    pub next: Option<VideoId>,
    pub next_next: Option<VideoId>,
    pub previous: Option<VideoId>,
}

impl PrefetchPlan {
    /// Derive the plan for a scroll position. `None` if the index is out
    /// of the feed's range.
    pub fn from_feed(feed: &[FeedItem], index: usize) -> Option<Self> {
        let current = feed.get(index)?;
        Some(Self {
            current: VideoId::new(&current.id),
            next: feed.get(index + 1).map(|i| VideoId::new(&i.id)),
            next_next: feed.get(index + 2).map(|i| VideoId::new(&i.id)),
            previous: index
                .checked_sub(1)
                .and_then(|i| feed.get(i))
                .map(|i| VideoId::new(&i.id)),
        })
    }

    /// Every id the plan references; downloads for anything else are
    /// cancelled when the plan takes effect.
    pub fn keep_set(&self) -> HashSet<VideoId> {
        self.members().map(|(id, _)| id.clone()).collect()
    }

    /// Ids protected from cache eviction: current, next, and previous.
    /// Deliberately not next-next, so speculative 2-ahead prefetch can
    /// never starve the cache of instant back- and forward-scroll data.
    pub fn protected_set(&self) -> HashSet<VideoId> {
        let mut ids = HashSet::from([self.current.clone()]);
        ids.extend(self.next.iter().cloned());
        ids.extend(self.previous.iter().cloned());
        ids
    }

    pub fn contains(&self, id: &VideoId) -> bool {
        self.role_of(id).is_some()
    }

    /// The download role of a plan member, if it is one. `current` wins
    /// when the same id appears at several distances.
    pub fn role_of(&self, id: &VideoId) -> Option<PlanRole> {
        self.members()
            .find(|(member, _)| *member == id)
            .map(|(_, role)| role)
    }

    /// Owned `(id, role)` pairs in decreasing urgency order.
    pub fn assignments(&self) -> Vec<(VideoId, PlanRole)> {
        self.members().map(|(id, role)| (id.clone(), role)).collect()
    }

    fn members(&self) -> impl Iterator<Item = (&VideoId, PlanRole)> {
        std::iter::once((&self.current, PlanRole::Current))
            .chain(self.next.iter().map(|id| (id, PlanRole::Next)))
            .chain(self.next_next.iter().map(|id| (id, PlanRole::NextNext)))
            .chain(self.previous.iter().map(|id| (id, PlanRole::Previous)))
    }
}

/// Distance-based download role of a plan member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRole {
    Current,
    Next,
    NextNext,
    Previous,
}

impl PlanRole {
    /// Priority for segment 0; `None` means no enqueue at all (previous is
    /// only protected, its data is already cached from when it was
    /// current).
    pub fn first_segment_priority(self) -> Option<Priority> {
        match self {
            PlanRole::Current => Some(Priority::Urgent),
            PlanRole::Next => Some(Priority::High),
            PlanRole::NextNext => Some(Priority::Normal),
            PlanRole::Previous => None,
        }
    }

    /// Priority for the remaining indices; `None` means only segment 0 is
    /// fetched for this role.
    pub fn tail_priority(self) -> Option<Priority> {
        match self {
            PlanRole::Current => Some(Priority::High),
            PlanRole::Next => Some(Priority::Normal),
            PlanRole::NextNext => None,
            PlanRole::Previous => None,
        }
    }
}
