use crate::worker::DaemonRecord;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// What a transcode job needs from a daemon
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub source_video_codec: String,
    pub target_video_codec: String,
    pub required_encoder: Option<String>,
    pub required_decoder: Option<String>,
    pub required_hwaccel: Option<String>,
    pub require_gpu: bool,
}

/// Names of hardware encoder families
pub fn encoder_is_hardware(name: &str) -> bool {
    ["_nvenc", "_qsv", "_vaapi", "_amf", "_videotoolbox", "_cuvid"]
        .iter()
        .any(|s| name.contains(s))
}

/// A pluggable daemon picker; returns the chosen daemon id
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn select(&self, daemons: &[DaemonRecord], criteria: &SelectionCriteria) -> Option<String>;
}

fn by_sessions_then_load(a: &DaemonRecord, b: &DaemonRecord) -> Ordering {
    b.available_encode_sessions()
        .cmp(&a.available_encode_sessions())
        .then(a.load().partial_cmp(&b.load()).unwrap_or(Ordering::Equal))
}

fn matches_required_encoder(d: &DaemonRecord, criteria: &SelectionCriteria) -> bool {
    match &criteria.required_encoder {
        Some(enc) => d.has_encoder(enc),
        None => true,
    }
}

/// Prefer daemons that can decode the source AND encode the target in
/// hardware; most free encode sessions first, least load breaks ties.
pub struct FullHwTranscode;

impl SelectionStrategy for FullHwTranscode {
    fn name(&self) -> &'static str {
        "full-hw-transcode"
    }

    fn select(&self, daemons: &[DaemonRecord], criteria: &SelectionCriteria) -> Option<String> {
        let mut candidates: Vec<&DaemonRecord> = daemons
            .iter()
            .filter(|d| d.is_eligible(true))
            .filter(|d| {
                d.capabilities
                    .video_decoders
                    .iter()
                    .any(|dec| dec.contains(&criteria.source_video_codec))
            })
            .filter(|d| {
                d.capabilities
                    .video_encoders
                    .iter()
                    .any(|e| encoder_is_hardware(e) && e.contains(&criteria.target_video_codec))
            })
            .filter(|d| matches_required_encoder(d, criteria))
            .collect();
        candidates.sort_by(|a, b| by_sessions_then_load(a, b));
        candidates.first().map(|d| d.daemon_id.clone())
    }
}

/// Filter by encoder availability and free GPU sessions
pub struct GpuAware;

impl SelectionStrategy for GpuAware {
    fn name(&self) -> &'static str {
        "gpu-aware"
    }

    fn select(&self, daemons: &[DaemonRecord], criteria: &SelectionCriteria) -> Option<String> {
        let mut candidates: Vec<&DaemonRecord> = daemons
            .iter()
            .filter(|d| d.is_eligible(true))
            .filter(|d| matches_required_encoder(d, criteria))
            .collect();
        candidates.sort_by(|a, b| by_sessions_then_load(a, b));
        candidates.first().map(|d| d.daemon_id.clone())
    }
}

/// Exact encoder/decoder/hwaccel match, least load wins
pub struct CapabilityMatch;

impl SelectionStrategy for CapabilityMatch {
    fn name(&self) -> &'static str {
        "capability-match"
    }

    fn select(&self, daemons: &[DaemonRecord], criteria: &SelectionCriteria) -> Option<String> {
        let mut candidates: Vec<&DaemonRecord> = daemons
            .iter()
            .filter(|d| d.is_eligible(criteria.require_gpu))
            .filter(|d| matches_required_encoder(d, criteria))
            .filter(|d| match &criteria.required_decoder {
                Some(dec) => d.has_decoder(dec),
                None => true,
            })
            .filter(|d| match &criteria.required_hwaccel {
                Some(hw) => d.capabilities.hardware_accels.iter().any(|a| a == hw),
                None => true,
            })
            .collect();
        candidates.sort_by(|a, b| a.load().partial_cmp(&b.load()).unwrap_or(Ordering::Equal));
        candidates.first().map(|d| d.daemon_id.clone())
    }
}

/// Lowest active_jobs / max_concurrent_jobs ratio
pub struct LeastLoaded;

impl SelectionStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn select(&self, daemons: &[DaemonRecord], criteria: &SelectionCriteria) -> Option<String> {
        daemons
            .iter()
            .filter(|d| d.is_eligible(criteria.require_gpu))
            .filter(|d| matches_required_encoder(d, criteria))
            .min_by(|a, b| a.load().partial_cmp(&b.load()).unwrap_or(Ordering::Equal))
            .map(|d| d.daemon_id.clone())
    }
}

/// Stateful cycling across qualifying daemons
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, daemons: &[DaemonRecord], criteria: &SelectionCriteria) -> Option<String> {
        let mut qualifying: Vec<&DaemonRecord> = daemons
            .iter()
            .filter(|d| d.is_eligible(criteria.require_gpu))
            .filter(|d| matches_required_encoder(d, criteria))
            .collect();
        if qualifying.is_empty() {
            return None;
        }
        // stable order so the cycle is deterministic
        qualifying.sort_by(|a, b| a.daemon_id.cmp(&b.daemon_id));
        let n = self.next.fetch_add(1, AtomicOrdering::Relaxed);
        Some(qualifying[n % qualifying.len()].daemon_id.clone())
    }
}

/// Try preferred daemon ids first, then delegate
pub struct Affinity {
    prefer: Vec<String>,
    fallback: Box<dyn SelectionStrategy>,
}

impl Affinity {
    pub fn new(prefer: Vec<String>, fallback: Box<dyn SelectionStrategy>) -> Self {
        Self { prefer, fallback }
    }
}

impl SelectionStrategy for Affinity {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn select(&self, daemons: &[DaemonRecord], criteria: &SelectionCriteria) -> Option<String> {
        for id in &self.prefer {
            if let Some(d) = daemons.iter().find(|d| &d.daemon_id == id) {
                if d.is_eligible(criteria.require_gpu) && matches_required_encoder(d, criteria) {
                    return Some(d.daemon_id.clone());
                }
            }
        }
        self.fallback.select(daemons, criteria)
    }
}

/// First strategy returning a daemon wins
pub struct Chain {
    strategies: Vec<Box<dyn SelectionStrategy>>,
}

impl Chain {
    pub fn new(strategies: Vec<Box<dyn SelectionStrategy>>) -> Self {
        Self { strategies }
    }
}

impl SelectionStrategy for Chain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn select(&self, daemons: &[DaemonRecord], criteria: &SelectionCriteria) -> Option<String> {
        self.strategies
            .iter()
            .find_map(|s| s.select(daemons, criteria))
    }
}

/// FullHWTranscode -> GPUAware -> CapabilityMatch -> LeastLoaded
pub fn default_selection_strategy() -> Arc<dyn SelectionStrategy> {
    Arc::new(Chain::new(vec![
        Box::new(FullHwTranscode),
        Box::new(GpuAware),
        Box::new(CapabilityMatch),
        Box::new(LeastLoaded),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{DaemonCapabilities, DaemonState, GpuInfo};
    use std::time::Instant;

    fn daemon(id: &str, encoders: &[&str], gpus: Vec<GpuInfo>, active_jobs: u32) -> DaemonRecord {
        DaemonRecord {
            daemon_id: id.into(),
            name: id.into(),
            version: "1".into(),
            state: DaemonState::Connected,
            capabilities: DaemonCapabilities {
                video_encoders: encoders.iter().map(|s| s.to_string()).collect(),
                video_decoders: vec!["h264".into(), "h264_cuvid".into()],
                audio_encoders: vec!["aac".into()],
                audio_decoders: vec!["aac".into()],
                hardware_accels: vec!["cuda".into()],
                gpus,
                max_concurrent_jobs: 4,
            },
            active_jobs,
            last_heartbeat: Instant::now(),
            heartbeats_missed: 0,
            sender: None,
        }
    }

    fn gpu(free: u32, max: u32) -> GpuInfo {
        GpuInfo {
            index: 0,
            name: String::new(),
            class: String::new(),
            max_encode_sessions: max,
            active_encode_sessions: max - free,
        }
    }

    #[test]
    fn test_full_hw_prefers_most_free_sessions() {
        let daemons = vec![
            daemon("a", &["h264_nvenc"], vec![gpu(1, 3)], 0),
            daemon("b", &["h264_nvenc"], vec![gpu(3, 3)], 0),
        ];
        let criteria = SelectionCriteria {
            source_video_codec: "h264".into(),
            target_video_codec: "h264".into(),
            require_gpu: true,
            ..Default::default()
        };
        assert_eq!(FullHwTranscode.select(&daemons, &criteria), Some("b".into()));
    }

    #[test]
    fn test_gpu_aware_skips_exhausted() {
        let daemons = vec![
            daemon("full", &["h264_nvenc"], vec![gpu(0, 3)], 0),
            daemon("free", &["h264_nvenc"], vec![gpu(2, 3)], 1),
        ];
        let criteria = SelectionCriteria {
            required_encoder: Some("h264_nvenc".into()),
            require_gpu: true,
            ..Default::default()
        };
        assert_eq!(GpuAware.select(&daemons, &criteria), Some("free".into()));
    }

    #[test]
    fn test_least_loaded() {
        let daemons = vec![
            daemon("busy", &["libx264"], vec![], 3),
            daemon("idle", &["libx264"], vec![], 0),
        ];
        let criteria = SelectionCriteria::default();
        assert_eq!(LeastLoaded.select(&daemons, &criteria), Some("idle".into()));
    }

    #[test]
    fn test_round_robin_cycles() {
        let daemons = vec![
            daemon("a", &["libx264"], vec![], 0),
            daemon("b", &["libx264"], vec![], 0),
        ];
        let rr = RoundRobin::new();
        let criteria = SelectionCriteria::default();
        let first = rr.select(&daemons, &criteria).unwrap();
        let second = rr.select(&daemons, &criteria).unwrap();
        let third = rr.select(&daemons, &criteria).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_affinity_prefers_listed() {
        let daemons = vec![
            daemon("a", &["libx264"], vec![], 0),
            daemon("b", &["libx264"], vec![], 3),
        ];
        let strategy = Affinity::new(vec!["b".into()], Box::new(LeastLoaded));
        let criteria = SelectionCriteria::default();
        assert_eq!(strategy.select(&daemons, &criteria), Some("b".into()));
    }

    #[test]
    fn test_affinity_falls_back() {
        let daemons = vec![daemon("a", &["libx264"], vec![], 0)];
        let strategy = Affinity::new(vec!["missing".into()], Box::new(LeastLoaded));
        let criteria = SelectionCriteria::default();
        assert_eq!(strategy.select(&daemons, &criteria), Some("a".into()));
    }

    #[test]
    fn test_default_chain_falls_through_to_cpu() {
        // no GPUs anywhere: FullHW and GPUAware find nothing, LeastLoaded
        // lands on the software daemon
        let daemons = vec![daemon("cpu", &["libx264"], vec![], 1)];
        let criteria = SelectionCriteria {
            source_video_codec: "h264".into(),
            target_video_codec: "h264".into(),
            ..Default::default()
        };
        let chosen = default_selection_strategy().select(&daemons, &criteria);
        assert_eq!(chosen, Some("cpu".into()));
    }

    #[test]
    fn test_capability_match_requires_hwaccel() {
        let daemons = vec![daemon("a", &["h264_nvenc"], vec![gpu(1, 3)], 0)];
        let mut criteria = SelectionCriteria {
            required_hwaccel: Some("vaapi".into()),
            ..Default::default()
        };
        assert_eq!(CapabilityMatch.select(&daemons, &criteria), None);
        criteria.required_hwaccel = Some("cuda".into());
        assert_eq!(CapabilityMatch.select(&daemons, &criteria), Some("a".into()));
    }

    #[test]
    fn test_encoder_is_hardware() {
        assert!(encoder_is_hardware("h264_nvenc"));
        assert!(encoder_is_hardware("hevc_vaapi"));
        assert!(!encoder_is_hardware("libx264"));
        assert!(!encoder_is_hardware("aac"));
    }
}
