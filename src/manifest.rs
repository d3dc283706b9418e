//! Segment manifest resolution.
//!
//! A video's canonical source may have a sibling manifest document
//! (`<source><suffix>`, default `.manifest.json`) listing its pre-cut
//! segments. Absence of that document is an expected outcome, not an
//! error: the video is then treated as a single synthetic segment covering
//! the whole stream, which looks identical to callers once downloaded.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::video::VideoSegment;

/// Manifest document produced by the external encoding service.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDoc {
    /// Duration of each segment in seconds.
    pub segment_duration_secs: f64,
    /// Declared segments; sorted by index after parsing.
    pub segments: Vec<ManifestSegment>,
}

/// One declared segment of a manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestSegment {
    pub index: u32,
    pub url: String,
    pub size_bytes: u64,
}

/// Outcome of resolving a source location. Both variants are success
/// paths.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// A manifest was found; the video has pre-cut segments.
    Resolved(ManifestDoc),
    /// No manifest (404 or unparseable); the whole video is one synthetic
    /// segment fetched from the original source location.
    Fallback,
}

impl Resolution {
    /// Materialize the segment list for a video. The fallback produces a
    /// single segment with unknown size pointing at the original source.
    pub fn into_segments(self, source_location: &str) -> (Vec<VideoSegment>, Option<f64>) {
        match self {
            Resolution::Resolved(doc) => {
                let segments = doc
                    .segments
                    .into_iter()
                    .map(|s| VideoSegment::new(s.index, s.url, Some(s.size_bytes)))
                    .collect();
                (segments, Some(doc.segment_duration_secs))
            }
            Resolution::Fallback => {
                (vec![VideoSegment::new(0, source_location, None)], None)
            }
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Resolution::Fallback)
    }
}

/// Probes for segment manifests next to video source locations.
pub struct ManifestResolver {
    client: reqwest::Client,
    suffix: String,
}

impl ManifestResolver {
    pub fn new(suffix: impl Into<String>, probe_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            suffix: suffix.into(),
        }
    }

    /// Manifest location derived deterministically from the source.
    pub fn manifest_url(&self, source_location: &str) -> String {
        format!("{source_location}{}", self.suffix)
    }

    /// Probe for a manifest.
    ///
    /// Any [`Error::ManifestUnavailable`] outcome of the fetch (absent,
    /// unparseable, or unusable document) is converted to
    /// [`Resolution::Fallback`] here, so both variants are success paths
    /// for callers. Transport failures and other HTTP errors are returned
    /// as retryable [`Error::Network`] for the caller's normal retry
    /// policy; there is no distinct "broken video" state.
    pub async fn resolve(&self, source_location: &str) -> Result<Resolution> {
        match self.fetch_doc(source_location).await {
            Ok(doc) => Ok(Resolution::Resolved(doc)),
            Err(Error::ManifestUnavailable(reason)) => {
                debug!(source = %source_location, reason = %reason, "Using single-segment fallback");
                Ok(Resolution::Fallback)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch and validate the manifest document itself.
    ///
    /// 404/410, an unparseable body, an empty segment list, and
    /// non-contiguous indices all surface as
    /// [`Error::ManifestUnavailable`]. Segments are addressed positionally
    /// everywhere downstream, so a gap in the declared indices would
    /// silently shift every later segment.
    async fn fetch_doc(&self, source_location: &str) -> Result<ManifestDoc> {
        let url = self.manifest_url(source_location);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::network(format!("Manifest probe failed for {url}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(Error::ManifestUnavailable(format!("HTTP {status} at {url}")));
        }
        if !status.is_success() {
            return Err(Error::network(format!("HTTP {status} probing {url}")));
        }

        let mut doc = response
            .json::<ManifestDoc>()
            .await
            .map_err(|e| Error::ManifestUnavailable(format!("unparseable manifest at {url}: {e}")))?;

        if doc.segments.is_empty() {
            return Err(Error::ManifestUnavailable(format!(
                "manifest at {url} declares no segments"
            )));
        }

        doc.segments.sort_by_key(|s| s.index);
        if doc.segments.iter().enumerate().any(|(i, s)| s.index != i as u32) {
            warn!(url = %url, "Manifest declares non-contiguous segment indices");
            return Err(Error::ManifestUnavailable(format!(
                "manifest at {url} has non-contiguous segment indices"
            )));
        }

        debug!(
            url = %url,
            segments = doc.segments.len(),
            segment_duration_secs = doc.segment_duration_secs,
            "Resolved segment manifest"
        );
        Ok(doc)
    }
}
