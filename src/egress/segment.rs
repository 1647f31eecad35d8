use crate::egress::Segment;
use bytes::Bytes;
use chrono::Utc;
use m3u8_rs::{MediaPlaylist, MediaSegment};
use std::collections::VecDeque;

/// Bounded sliding window of finished segments.
///
/// The oldest `max_segments` stay fetchable for slow clients; only the most
/// recent `playlist_segments` are advertised so new clients join near the
/// live edge.
pub struct SegmentWindow {
    segments: VecDeque<Segment>,
    max_segments: usize,
    playlist_segments: usize,
    next_sequence: u64,
    ended: bool,
}

impl SegmentWindow {
    pub fn new(max_segments: usize, playlist_segments: usize) -> Self {
        Self {
            segments: VecDeque::with_capacity(max_segments),
            max_segments,
            playlist_segments: playlist_segments.min(max_segments),
            next_sequence: 0,
            ended: false,
        }
    }

    /// Append a finished segment, dropping the oldest beyond the window
    pub fn push(&mut self, data: Bytes, duration: f32, is_keyframe: bool, discontinuity: bool) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        if self.segments.len() == self.max_segments {
            self.segments.pop_front();
        }
        self.segments.push_back(Segment {
            sequence,
            duration,
            data,
            timestamp: Utc::now(),
            is_keyframe,
            discontinuity,
        });
        sequence
    }

    pub fn get(&self, sequence: u64) -> Option<&Segment> {
        let first = self.segments.front()?.sequence;
        if sequence < first {
            return None;
        }
        self.segments.get((sequence - first) as usize)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        self.segments.back().map(|s| s.sequence)
    }

    pub fn oldest_sequence(&self) -> Option<u64> {
        self.segments.front().map(|s| s.sequence)
    }

    /// Segments currently advertised in the playlist
    pub fn advertised(&self) -> impl Iterator<Item = &Segment> {
        let skip = self.segments.len().saturating_sub(self.playlist_segments);
        self.segments.iter().skip(skip)
    }

    /// First advertised media sequence number
    pub fn media_sequence(&self) -> u64 {
        self.advertised().next().map(|s| s.sequence).unwrap_or(0)
    }

    pub fn mark_ended(&mut self) {
        self.ended = true;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Render an HLS media playlist, naming each segment with `uri_for`
    pub fn render_playlist<F>(&self, target_duration: f32, uri_for: F) -> String
    where
        F: Fn(u64) -> String,
    {
        self.render_playlist_ext(target_duration, 3, None, uri_for)
    }

    /// As [SegmentWindow::render_playlist] with a protocol version and an
    /// optional EXT-X-MAP init URI (fMP4)
    pub fn render_playlist_ext<F>(
        &self,
        target_duration: f32,
        version: usize,
        map_uri: Option<&str>,
        uri_for: F,
    ) -> String
    where
        F: Fn(u64) -> String,
    {
        let mut pl = MediaPlaylist {
            version: Some(version),
            target_duration: target_duration.ceil() as u64,
            media_sequence: self.media_sequence(),
            end_list: self.ended,
            ..Default::default()
        };
        if let Some(uri) = map_uri {
            pl.unknown_tags.push(m3u8_rs::ExtTag {
                tag: "X-MAP".to_string(),
                rest: Some(format!("URI=\"{uri}\"")),
            });
        }
        for seg in self.advertised() {
            pl.segments.push(MediaSegment {
                uri: uri_for(seg.sequence),
                duration: seg.duration,
                discontinuity: seg.discontinuity,
                ..Default::default()
            });
        }
        let mut out = Vec::new();
        // writing to a Vec cannot fail
        pl.write_to(&mut out).expect("playlist render");
        String::from_utf8(out).expect("playlist utf8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_with(total: usize, max: usize, advertised: usize) -> SegmentWindow {
        let mut w = SegmentWindow::new(max, advertised);
        for i in 0..total {
            w.push(Bytes::from(vec![i as u8]), 6.0, true, false);
        }
        w
    }

    #[test]
    fn test_retention_window() {
        // 30 segments produced over 180s with a 6s keyframe cadence
        let w = window_with(30, 30, 5);
        assert_eq!(w.len(), 30);
        assert_eq!(w.oldest_sequence(), Some(0));
        assert!(w.get(0).is_some());

        let w = window_with(40, 30, 5);
        assert_eq!(w.len(), 30);
        // oldest retained is total-30
        assert_eq!(w.oldest_sequence(), Some(10));
        assert!(w.get(9).is_none(), "older than the window is gone");
        assert!(w.get(10).is_some());
    }

    #[test]
    fn test_playlist_advertises_live_edge() {
        let w = window_with(30, 30, 5);
        let advertised: Vec<u64> = w.advertised().map(|s| s.sequence).collect();
        assert_eq!(advertised, vec![25, 26, 27, 28, 29]);
        assert_eq!(w.media_sequence(), 25);
    }

    #[test]
    fn test_rendered_playlist_shape() {
        let w = window_with(30, 30, 5);
        let playlist = w.render_playlist(6.0, |seq| format!("segment{seq}.ts"));
        assert!(playlist.starts_with("#EXTM3U"));
        assert!(playlist.contains("#EXT-X-VERSION:3"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:6"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:25"));
        assert_eq!(playlist.matches("#EXTINF").count(), 5);
        assert!(playlist.contains("segment29.ts"));
        assert!(!playlist.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_endlist_after_completion() {
        let mut w = window_with(3, 30, 5);
        w.mark_ended();
        let playlist = w.render_playlist(6.0, |seq| format!("segment{seq}.ts"));
        assert!(playlist.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_discontinuity_tag() {
        let mut w = SegmentWindow::new(10, 10);
        w.push(Bytes::new(), 6.0, true, false);
        w.push(Bytes::new(), 6.0, true, true);
        let playlist = w.render_playlist(6.0, |seq| format!("segment{seq}.ts"));
        assert!(playlist.contains("#EXT-X-DISCONTINUITY"));
    }

    #[test]
    fn test_get_unknown() {
        let w = window_with(5, 10, 3);
        assert!(w.get(99).is_none());
    }
}
