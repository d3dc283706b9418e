//! Assembly of downloaded segments into a playable artifact.
//!
//! The artifact is a spool file holding the physical concatenation of the
//! longest contiguous run of downloaded segments starting at index 0. It
//! is created from segment 0 alone (the instant-playback trigger) and
//! extended append-only as the prefix grows; it never covers a gap, so
//! sequential playback is always correct without seek support into
//! undownloaded regions.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{SegmentKey, SegmentStore};
use crate::video::{PlayableArtifact, Readiness, SegmentedVideo};

/// Builds and extends playable artifacts in a spool directory.
pub struct AssemblyUnit {
    spool_dir: PathBuf,
}

impl AssemblyUnit {
    /// Create the unit, ensuring the spool directory exists.
    pub fn new(spool_dir: impl Into<PathBuf>) -> Result<Self> {
        let spool_dir = spool_dir.into();
        std::fs::create_dir_all(&spool_dir)?;
        Ok(Self { spool_dir })
    }

    pub fn spool_dir(&self) -> &std::path::Path {
        &self.spool_dir
    }

    /// Recompute the contiguous prefix for `video` and extend its artifact
    /// to cover it. Returns the new readiness if it changed.
    ///
    /// Idempotent with respect to completion order: the prefix is always
    /// recomputed from scratch, and the artifact only ever grows. If a
    /// prefix segment was evicted from the store before it could be
    /// spooled, extension stops there and resumes on a later refresh.
    pub fn refresh(&self, video: &mut SegmentedVideo, store: &SegmentStore) -> Result<Option<Readiness>> {
        let prefix = video.contiguous_prefix();
        if prefix == 0 {
            return Ok(None);
        }

        let mut artifact = match video.artifact.take() {
            Some(artifact) => artifact,
            None => PlayableArtifact {
                path: self.spool_dir.join(format!("{}.media", Uuid::new_v4())),
                segments_written: 0,
                bytes_written: 0,
            },
        };

        if artifact.segments_written < prefix {
            // The next prefix segment may have been evicted between
            // download and refresh; don't create or touch the spool file
            // until its bytes are actually present.
            let next_key = SegmentKey::new(video.id.clone(), artifact.segments_written);
            if store.contains(&next_key) {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&artifact.path)?;

                while artifact.segments_written < prefix {
                    let key = SegmentKey::new(video.id.clone(), artifact.segments_written);
                    let Some(data) = store.get(&key) else {
                        warn!(key = %key, "Prefix segment missing from store; pausing assembly");
                        break;
                    };
                    file.write_all(&data)?;
                    artifact.segments_written += 1;
                    artifact.bytes_written += data.len() as u64;
                }
                file.flush()?;

                debug!(
                    video_id = %video.id,
                    segments_written = artifact.segments_written,
                    bytes_written = artifact.bytes_written,
                    "Extended playable artifact"
                );
            } else {
                warn!(key = %next_key, "Prefix segment missing from store; pausing assembly");
            }
        }

        let written = artifact.segments_written;
        video.artifact = Some(artifact);

        if written == 0 {
            // Nothing could be spooled (segment 0 evicted between download
            // and refresh). Leave readiness untouched.
            video.artifact = None;
            return Ok(None);
        }

        let readiness = if written == video.segment_count() {
            Readiness::FullyAssembled
        } else if written > 1 {
            Readiness::PartiallyAssembled
        } else {
            Readiness::FirstSegmentReady
        };

        if video.readiness != readiness {
            video.readiness = readiness;
            Ok(Some(readiness))
        } else {
            Ok(None)
        }
    }

    /// Delete a video's artifact file and forget the handle.
    pub fn discard(&self, video: &mut SegmentedVideo) {
        if let Some(artifact) = video.artifact.take() {
            if let Err(e) = std::fs::remove_file(&artifact.path) {
                debug!(path = %artifact.path.display(), error = %e, "Failed to remove artifact file");
            }
        }
    }

    /// Remove the entire spool directory. Called on engine shutdown; the
    /// cache is session-transient and fully rebuildable from the network.
    pub fn clear(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.spool_dir) {
            debug!(dir = %self.spool_dir.display(), error = %e, "Failed to clear spool dir");
        }
    }
}
