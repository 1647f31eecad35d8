use crate::buffer::track::{EsTrack, TrackLimits};
use crate::variant::CodecVariant;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use uuid::Uuid;

/// Per-consumer read state within a variant
#[derive(Debug, Clone)]
pub struct ConsumerPosition {
    pub last_video_sequence: u64,
    pub last_audio_sequence: u64,
    pub registered_at: Instant,
}

/// A video track and an audio track sharing one codec identity, plus the
/// registration table of everything reading from them.
#[derive(Debug)]
pub struct EsVariant {
    key: CodecVariant,
    video: Arc<EsTrack>,
    audio: Arc<EsTrack>,
    consumers: RwLock<HashMap<Uuid, ConsumerPosition>>,
    source: AtomicBool,
}

impl EsVariant {
    pub fn new(key: CodecVariant, limits: TrackLimits) -> Self {
        let video = Arc::new(EsTrack::new(key.video.clone(), limits.clone()));
        let audio = Arc::new(EsTrack::new(key.audio.clone(), limits));
        Self {
            key,
            video,
            audio,
            consumers: RwLock::new(HashMap::new()),
            source: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &CodecVariant {
        &self.key
    }

    pub fn video_track(&self) -> &Arc<EsTrack> {
        &self.video
    }

    pub fn audio_track(&self) -> &Arc<EsTrack> {
        &self.audio
    }

    pub fn is_source(&self) -> bool {
        self.source.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_source(&self) {
        self.source.store(true, Ordering::Relaxed);
    }

    /// Idempotent: registering an id twice keeps the original position.
    /// New consumers start at the live edge so they never block eviction of
    /// history they will not read.
    pub fn register_consumer(&self, id: Uuid) {
        let mut consumers = self.consumers.write().unwrap();
        if consumers.contains_key(&id) {
            return;
        }
        let video_seq = self.video.latest_sequence();
        let audio_seq = self.audio.latest_sequence();
        consumers.insert(
            id,
            ConsumerPosition {
                last_video_sequence: video_seq,
                last_audio_sequence: audio_seq,
                registered_at: Instant::now(),
            },
        );
        drop(consumers);
        self.video.update_consumer_position(id, video_seq);
        self.audio.update_consumer_position(id, audio_seq);
    }

    /// No-op for unknown ids
    pub fn unregister_consumer(&self, id: &Uuid) {
        let removed = self.consumers.write().unwrap().remove(id).is_some();
        if removed {
            self.video.remove_consumer(id);
            self.audio.remove_consumer(id);
        }
    }

    pub fn update_consumer_position(&self, id: Uuid, video_seq: u64, audio_seq: u64) {
        let mut consumers = self.consumers.write().unwrap();
        let Some(pos) = consumers.get_mut(&id) else {
            return;
        };
        pos.last_video_sequence = video_seq;
        pos.last_audio_sequence = audio_seq;
        drop(consumers);
        self.video.update_consumer_position(id, video_seq);
        self.audio.update_consumer_position(id, audio_seq);
    }

    pub fn consumer_position(&self, id: &Uuid) -> Option<ConsumerPosition> {
        self.consumers.read().unwrap().get(id).cloned()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().unwrap().len()
    }

    /// Wake every reader blocked on either track
    pub fn notify_all(&self) {
        self.video.notify_waiters();
        self.audio.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant() -> EsVariant {
        EsVariant::new(
            CodecVariant::new("h264", "aac"),
            TrackLimits::default(),
        )
    }

    #[test]
    fn test_register_is_idempotent() {
        let v = variant();
        let id = Uuid::new_v4();
        v.register_consumer(id);
        v.update_consumer_position(id, 5, 3);
        v.register_consumer(id);
        let pos = v.consumer_position(&id).unwrap();
        assert_eq!(pos.last_video_sequence, 5);
        assert_eq!(pos.last_audio_sequence, 3);
        assert_eq!(v.consumer_count(), 1);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let v = variant();
        v.unregister_consumer(&Uuid::new_v4());
        assert_eq!(v.consumer_count(), 0);
    }

    #[test]
    fn test_update_unknown_consumer_is_ignored() {
        let v = variant();
        v.update_consumer_position(Uuid::new_v4(), 10, 10);
        assert_eq!(v.consumer_count(), 0);
    }

    #[test]
    fn test_tracks_carry_codec_names() {
        let v = variant();
        assert_eq!(v.video_track().codec(), "h264");
        assert_eq!(v.audio_track().codec(), "aac");
        assert!(!v.is_source());
    }
}
