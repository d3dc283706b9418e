//! Readiness and buffer-health queries.
//!
//! Pure read-only derivations from per-video state. Never mutates
//! anything, so the presentation layer can poll at high frequency; the
//! engine additionally pushes readiness transitions over the event bus.

use crate::video::{Readiness, SegmentedVideo};

/// Whether playback can start. With `require_full = false` this is
/// deliberately a very low bar (a single short segment) to eliminate
/// visible loading delay.
pub fn is_playable(video: &SegmentedVideo, require_full: bool) -> bool {
    if require_full {
        matches!(video.readiness, Readiness::FullyAssembled)
    } else {
        matches!(
            video.readiness,
            Readiness::FirstSegmentReady
                | Readiness::PartiallyAssembled
                | Readiness::FullyAssembled
        )
    }
}

/// Percentage (0-100) of the video's segments currently downloaded.
/// 0 for unresolved videos.
pub fn buffer_health(video: &SegmentedVideo) -> u8 {
    let total = video.segment_count() as u64;
    if total == 0 {
        return 0;
    }
    ((video.downloaded.len() as u64 * 100) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{FeedItem, VideoSegment};

    fn video(total: u32) -> SegmentedVideo {
        let item = FeedItem::new("v1", "http://cdn/v1.mp4", "http://cdn/v1.jpg");
        let mut video = SegmentedVideo::new(&item);
        let segments = (0..total)
            .map(|i| VideoSegment::new(i, format!("http://cdn/v1/seg{i}.m4s"), Some(1000)))
            .collect();
        video.populate_segments(segments, Some(2.0));
        video
    }

    #[test]
    fn unresolved_video_is_not_playable() {
        let item = FeedItem::new("v1", "http://cdn/v1.mp4", "http://cdn/v1.jpg");
        let video = SegmentedVideo::new(&item);
        assert!(!is_playable(&video, false));
        assert_eq!(buffer_health(&video), 0);
    }

    #[test]
    fn first_segment_is_enough_without_require_full() {
        let mut v = video(10);
        v.readiness = Readiness::FirstSegmentReady;
        assert!(is_playable(&v, false));
        assert!(!is_playable(&v, true));
    }

    #[test]
    fn require_full_needs_full_assembly() {
        let mut v = video(10);
        v.readiness = Readiness::PartiallyAssembled;
        assert!(is_playable(&v, false));
        assert!(!is_playable(&v, true));

        v.readiness = Readiness::FullyAssembled;
        assert!(is_playable(&v, true));
    }

    #[test]
    fn errored_video_is_not_playable() {
        let mut v = video(10);
        v.readiness = Readiness::Errored;
        assert!(!is_playable(&v, false));
    }

    #[test]
    fn buffer_health_steps_by_ten_for_ten_segments() {
        let mut v = video(10);
        let mut last = buffer_health(&v);
        assert_eq!(last, 0);

        // Completion order does not matter, only the count does.
        for index in [0, 3, 1, 2, 5, 4, 6, 7, 9, 8] {
            v.mark_downloaded(index);
            let health = buffer_health(&v);
            assert_eq!(health, last + 10);
            last = health;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn single_segment_video_jumps_to_one_hundred() {
        let mut v = video(1);
        assert_eq!(buffer_health(&v), 0);
        v.mark_downloaded(0);
        assert_eq!(buffer_health(&v), 100);
    }

    #[test]
    fn eviction_lowers_buffer_health() {
        let mut v = video(4);
        v.mark_downloaded(0);
        v.mark_downloaded(1);
        assert_eq!(buffer_health(&v), 50);

        v.reset_segment(1);
        assert_eq!(buffer_health(&v), 25);
    }
}
