//! Reelcache - segmented prefetch-and-cache engine for short-form video feeds.
//!
//! Given an ordered feed of video items, the engine keeps the currently
//! viewed item playable within milliseconds while the user scrolls: it
//! resolves segment manifests, fetches byte ranges through a bounded worker
//! pool, assembles contiguous prefixes into a playable artifact, and evicts
//! cached data under a fixed byte budget.

pub mod assembly;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod manifest;
pub mod prefetch;
pub mod store;
pub mod video;

pub use config::EngineConfig;
pub use engine::{Engine, PlayableHandle};
pub use error::{Error, Result};
pub use events::{EngineEvent, EventPayload};
pub use prefetch::{PlanRole, PrefetchPlan};
pub use store::CacheStats;
pub use video::{FeedItem, Priority, Readiness, VideoId};
