use crate::codec::{self, CodecParams};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use uuid::Uuid;

/// Bounds on a single elementary-stream ring
#[derive(Debug, Clone)]
pub struct TrackLimits {
    pub max_samples: usize,
    pub max_bytes: usize,
    pub max_duration: Duration,
    /// Timescale `pts`/`dts` are expressed in, used for the duration bound
    pub timescale: u32,
}

impl Default for TrackLimits {
    fn default() -> Self {
        Self {
            max_samples: 2048,
            max_bytes: 64 * 1024 * 1024,
            max_duration: Duration::from_secs(60),
            timescale: 90_000,
        }
    }
}

/// Immutable unit produced by demuxers and transcoders
#[derive(Debug, Clone)]
pub struct EsSample {
    /// Monotonic ordinal within the track, assigned on write, never reused
    pub sequence: u64,
    pub pts: i64,
    pub dts: i64,
    pub data: Bytes,
    pub is_keyframe: bool,
}

#[derive(Debug)]
struct TrackState {
    samples: VecDeque<EsSample>,
    /// Sequence the next write will receive; starts at 1 so a cursor of 0
    /// means "nothing read yet"
    next_sequence: u64,
    bytes: usize,
    /// Sequences of keyframes currently retained in the ring
    keyframes: VecDeque<u64>,
    /// consumer id -> last sequence read
    cursors: HashMap<Uuid, u64>,
    /// Most recent parameter sets seen on a keyframe; survives eviction of
    /// the bearing sample
    params: Option<CodecParams>,
}

/// Append-only sample ring with keyframe-aware eviction and per-consumer
/// read cursors.
///
/// Writers never block on readers: appends take the write lock briefly,
/// readers copy batches out under the read lock. Readers that maintain a
/// cursor are protected from eviction; readers without one can fall out of
/// the ring and are realigned to the oldest retained keyframe on their next
/// read.
#[derive(Debug)]
pub struct EsTrack {
    codec: String,
    limits: TrackLimits,
    notify: Notify,
    state: RwLock<TrackState>,
}

impl EsTrack {
    pub fn new(codec: impl Into<String>, limits: TrackLimits) -> Self {
        Self {
            codec: codec.into(),
            limits,
            notify: Notify::new(),
            state: RwLock::new(TrackState {
                samples: VecDeque::new(),
                next_sequence: 1,
                bytes: 0,
                keyframes: VecDeque::new(),
                cursors: HashMap::new(),
                params: None,
            }),
        }
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    /// Append a sample, wake all waiting readers, return the assigned sequence
    pub fn write(&self, pts: i64, dts: i64, data: Bytes, is_keyframe: bool) -> u64 {
        let seq = {
            let mut state = self.state.write().unwrap();
            let seq = state.next_sequence;
            state.next_sequence += 1;

            if is_keyframe {
                if let Some(p) = codec::extract_params(&self.codec, &data) {
                    state.params = Some(p);
                }
                state.keyframes.push_back(seq);
            }
            state.bytes += data.len();
            state.samples.push_back(EsSample {
                sequence: seq,
                pts,
                dts,
                data,
                is_keyframe,
            });
            self.evict(&mut state);
            seq
        };
        self.notify.notify_waiters();
        seq
    }

    /// Up to `max` samples with `sequence > last_sequence`, non-blocking.
    ///
    /// A reader that has fallen out of the ring is fast-forwarded to the
    /// oldest retained keyframe (oldest retained sample when the track has
    /// no keyframes, i.e. audio).
    pub fn read_from(&self, last_sequence: u64, max: usize) -> Vec<EsSample> {
        let state = self.state.read().unwrap();
        let Some(front) = state.samples.front() else {
            return Vec::new();
        };
        let mut start = last_sequence.saturating_add(1);
        if start < front.sequence {
            start = state
                .keyframes
                .front()
                .copied()
                .unwrap_or(front.sequence);
        }
        Self::collect_from(&state, start, max)
    }

    /// As [read_from] but the first returned sample is always a keyframe
    pub fn read_from_keyframe(&self, last_sequence: u64, max: usize) -> Vec<EsSample> {
        let state = self.state.read().unwrap();
        let Some(start) = state
            .keyframes
            .iter()
            .find(|&&kf| kf > last_sequence)
            .copied()
        else {
            return Vec::new();
        };
        Self::collect_from(&state, start, max)
    }

    fn collect_from(state: &TrackState, start: u64, max: usize) -> Vec<EsSample> {
        let front_seq = match state.samples.front() {
            Some(s) => s.sequence,
            None => return Vec::new(),
        };
        let skip = start.saturating_sub(front_seq) as usize;
        state
            .samples
            .iter()
            .skip(skip)
            .take(max)
            .cloned()
            .collect()
    }

    /// Single-shot notification, re-arm each loop iteration. Arm this
    /// *before* checking for new samples to avoid missed wakeups.
    pub fn notify_chan(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wake all readers without a new sample (close, realignment, etc.)
    pub fn notify_waiters(&self) {
        self.notify.notify_waiters();
    }

    /// Record a cursor; eviction keeps every sample a registered cursor has
    /// not read yet.
    pub fn update_consumer_position(&self, consumer_id: Uuid, last_sequence: u64) {
        let mut state = self.state.write().unwrap();
        state.cursors.insert(consumer_id, last_sequence);
        self.evict(&mut state);
    }

    pub fn remove_consumer(&self, consumer_id: &Uuid) {
        let mut state = self.state.write().unwrap();
        if state.cursors.remove(consumer_id).is_some() {
            self.evict(&mut state);
        }
    }

    pub fn latest_sequence(&self) -> u64 {
        self.state.read().unwrap().next_sequence - 1
    }

    pub fn oldest_sequence(&self) -> Option<u64> {
        self.state.read().unwrap().samples.front().map(|s| s.sequence)
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffered_bytes(&self) -> usize {
        self.state.read().unwrap().bytes
    }

    /// Most recent codec parameter sets extracted from keyframes
    pub fn params(&self) -> Option<CodecParams> {
        self.state.read().unwrap().params.clone()
    }

    pub fn set_params(&self, params: CodecParams) {
        self.state.write().unwrap().params = Some(params);
    }

    fn over_bounds(&self, state: &TrackState) -> bool {
        if state.samples.len() > self.limits.max_samples {
            return true;
        }
        if state.bytes > self.limits.max_bytes {
            return true;
        }
        if let (Some(front), Some(back)) = (state.samples.front(), state.samples.back()) {
            let span = back.pts.saturating_sub(front.pts).max(0) as u64;
            let limit =
                (self.limits.max_duration.as_secs_f64() * self.limits.timescale as f64) as u64;
            if span > limit {
                return true;
            }
        }
        false
    }

    /// Sequence of the first sample that must be retained for consumers:
    /// the next sample the slowest cursor will read, aligned down to a
    /// keyframe so a realigned consumer still starts on one.
    fn eviction_floor(state: &TrackState) -> u64 {
        let Some(min_cursor) = state.cursors.values().min().copied() else {
            return u64::MAX;
        };
        let next_needed = min_cursor + 1;
        state
            .keyframes
            .iter()
            .rev()
            .find(|&&kf| kf <= next_needed)
            .copied()
            .unwrap_or(next_needed)
    }

    fn evict(&self, state: &mut TrackState) {
        let floor = Self::eviction_floor(state);
        while self.over_bounds(state) {
            let Some(front) = state.samples.front() else {
                break;
            };
            if front.sequence >= floor {
                break;
            }
            let dropped = state.samples.pop_front().unwrap();
            state.bytes -= dropped.data.len();
            if dropped.is_keyframe {
                if let Some(&kf) = state.keyframes.front() {
                    if kf == dropped.sequence {
                        state.keyframes.pop_front();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_with(max_samples: usize) -> EsTrack {
        EsTrack::new(
            "h264",
            TrackLimits {
                max_samples,
                ..Default::default()
            },
        )
    }

    fn keyframe_payload() -> Bytes {
        Bytes::from_static(&[0, 0, 0, 1, 0x65, 0xaa])
    }

    fn delta_payload() -> Bytes {
        Bytes::from_static(&[0, 0, 0, 1, 0x41, 0xaa])
    }

    /// Write a GOP-shaped pattern: keyframe every `gop` samples
    fn fill(track: &EsTrack, count: usize, gop: usize) {
        for i in 0..count {
            let key = i % gop == 0;
            let data = if key { keyframe_payload() } else { delta_payload() };
            track.write(i as i64 * 3000, i as i64 * 3000, data, key);
        }
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let track = track_with(100);
        let a = track.write(0, 0, keyframe_payload(), true);
        let b = track.write(1, 1, delta_payload(), false);
        let c = track.write(2, 2, delta_payload(), false);
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(track.latest_sequence(), 3);
    }

    #[test]
    fn test_read_from_returns_only_newer() {
        let track = track_with(100);
        fill(&track, 10, 5);
        let batch = track.read_from(4, 100);
        assert_eq!(batch.len(), 6);
        assert_eq!(batch[0].sequence, 5);
        // monotone
        for w in batch.windows(2) {
            assert_eq!(w[1].sequence, w[0].sequence + 1);
        }
    }

    #[test]
    fn test_read_at_latest_is_empty() {
        let track = track_with(100);
        fill(&track, 10, 5);
        assert!(track.read_from(track.latest_sequence(), 100).is_empty());
    }

    #[test]
    fn test_read_respects_max() {
        let track = track_with(100);
        fill(&track, 10, 5);
        assert_eq!(track.read_from(0, 3).len(), 3);
    }

    #[test]
    fn test_keyframe_realignment_after_falling_out() {
        let track = track_with(10);
        // 30 writes with a keyframe every 5; ring keeps the last 10
        fill(&track, 30, 5);
        let batch = track.read_from(0, 100);
        assert!(!batch.is_empty());
        assert!(
            batch[0].is_keyframe,
            "realigned read must start on a keyframe"
        );
    }

    #[test]
    fn test_consumer_cursor_blocks_eviction() {
        let track = track_with(10);
        let consumer = Uuid::new_v4();
        fill(&track, 5, 5);
        track.update_consumer_position(consumer, 1);
        fill(&track, 40, 5);
        // sample 2 is the next the consumer needs; the keyframe at 1 is the
        // alignment point, so nothing at or above sequence 1 may be evicted
        let oldest = track.oldest_sequence().unwrap();
        assert!(oldest <= 2, "oldest retained {} evicted past cursor", oldest);
        let batch = track.read_from(1, 100);
        assert_eq!(batch[0].sequence, 2);
    }

    #[test]
    fn test_eviction_resumes_after_cursor_advance() {
        let track = track_with(10);
        let consumer = Uuid::new_v4();
        fill(&track, 5, 5);
        track.update_consumer_position(consumer, 1);
        fill(&track, 40, 5);
        assert!(track.len() > 10);
        track.update_consumer_position(consumer, track.latest_sequence());
        assert!(track.len() <= 10);
    }

    #[test]
    fn test_remove_consumer_releases_samples() {
        let track = track_with(10);
        let consumer = Uuid::new_v4();
        fill(&track, 5, 5);
        track.update_consumer_position(consumer, 1);
        fill(&track, 40, 5);
        assert!(track.len() > 10);
        track.remove_consumer(&consumer);
        assert!(track.len() <= 10);
    }

    #[test]
    fn test_read_from_keyframe_alignment() {
        let track = track_with(100);
        fill(&track, 12, 5);
        let batch = track.read_from_keyframe(2, 100);
        assert!(batch[0].is_keyframe);
        assert_eq!(batch[0].sequence, 6);
    }

    #[test]
    fn test_params_survive_eviction() {
        let track = track_with(4);
        let mut with_params = Vec::new();
        with_params.extend_from_slice(&[0, 0, 0, 1, 0x67, 1, 2]);
        with_params.extend_from_slice(&[0, 0, 0, 1, 0x68, 3]);
        with_params.extend_from_slice(&[0, 0, 0, 1, 0x65, 4]);
        track.write(0, 0, Bytes::from(with_params), true);
        for i in 1..20 {
            track.write(i * 3000, i * 3000, delta_payload(), false);
        }
        assert!(track.oldest_sequence().unwrap() > 1, "bearing sample evicted");
        let params = track.params().expect("params retained");
        assert_eq!(params.sps.len(), 1);
        assert_eq!(params.pps.len(), 1);
    }

    #[tokio::test]
    async fn test_notify_wakes_reader() {
        let track = std::sync::Arc::new(track_with(100));
        let notified = track.notify_chan();
        let t2 = track.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            t2.write(0, 0, keyframe_payload(), true);
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .expect("reader was not woken");
        writer.await.unwrap();
        assert_eq!(track.read_from(0, 10).len(), 1);
    }
}
