//! Engine event bus.
//!
//! Readiness transitions and download progress are pushed to subscribers
//! over a `tokio::sync::broadcast` channel instead of being polled on a
//! timer. A bounded ring buffer of recent events lets late subscribers
//! catch up.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::video::{Readiness, VideoId};

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

/// Broadcast channel capacity. Slow subscribers lag rather than block the
/// engine.
const CHANNEL_CAPACITY: usize = 256;

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Manifest resolution finished (either a real manifest or the
    /// single-segment fallback).
    ManifestResolved {
        video_id: VideoId,
        segment_count: u32,
        fallback: bool,
    },
    /// A segment landed in the store.
    SegmentDownloaded {
        video_id: VideoId,
        index: u32,
        bytes: u64,
    },
    /// A segment exhausted its retry budget.
    SegmentFailed {
        video_id: VideoId,
        index: u32,
        error: String,
    },
    /// A video's readiness moved. The push-notification replacement for
    /// timer-based readiness polling.
    ReadinessChanged {
        video_id: VideoId,
        readiness: Readiness,
    },
    /// A new prefetch plan took effect.
    PlanApplied {
        current: VideoId,
        next: Option<VideoId>,
        next_next: Option<VideoId>,
        previous: Option<VideoId>,
    },
    /// A cache entry was evicted under memory pressure.
    EntryEvicted { video_id: VideoId, index: u32 },
}

/// An event with its envelope.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Broadcast bus with a bounded history of recent events.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    recent: RwLock<VecDeque<EngineEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all subscribers and record it in the ring
    /// buffer. Send errors (no subscribers) are ignored.
    pub fn broadcast(&self, payload: EventPayload) {
        let event = EngineEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        };

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        let _ = self.tx.send(event);
    }

    /// Most recent events, oldest first.
    pub fn recent(&self) -> Vec<EngineEvent> {
        self.recent.read().iter().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
