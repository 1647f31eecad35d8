use crate::variant::CodecVariant;
use thiserror::Error;

/// Error kinds that cross component boundaries.
///
/// Most internal paths use [anyhow::Result]; these variants exist so callers
/// can match on the failure class (HTTP status mapping, fallback decisions,
/// backend re-planning) instead of string matching.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Upstream failed in a way that is worth retrying (5xx, reset, timeout)
    #[error("transient upstream failure: {0}")]
    UpstreamTransient(String),

    /// Upstream failed permanently (4xx, malformed stream after valid start)
    #[error("fatal upstream failure: {0}")]
    UpstreamFatal(String),

    /// No transcoder backend could be selected or spawned
    #[error("no transcoder backend available")]
    NoBackendAvailable,

    /// The requested video/audio pair has no valid interpretation
    #[error("unsupported codec combination: {0}")]
    CodecCombinationUnsupported(CodecVariant),

    /// Registration rejected because the processor is shutting down
    #[error("processor is stopping")]
    ProcessorStopping,

    /// First segment not yet produced, retry shortly (HTTP 503)
    #[error("segment not ready")]
    SegmentNotReady,

    /// Unknown segment/init/client id (HTTP 404)
    #[error("not found")]
    NotFound,

    /// Operation on a buffer after close()
    #[error("buffer closed")]
    BufferClosed,

    /// Spawned worker never registered within the startup timeout
    #[error("worker registration timed out after {0:?}")]
    RegistrationTimeout(std::time::Duration),

    /// Worker subprocess could not be started
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// Spawn rejected, too many live worker subprocesses
    #[error("max concurrent worker spawns reached")]
    MaxSpawnsReached,

    /// Stale or unknown client id
    #[error("client not found")]
    ClientNotFound,

    /// Heartbeat or job for a daemon id the registry does not know
    #[error("daemon not registered: {0}")]
    DaemonNotRegistered(String),

    /// Init segment requested for a variant with no configured tracks
    #[error("no tracks configured")]
    NoTracksConfigured,
}

impl RelayError {
    /// Whether a session-level error should drive the fallback path rather
    /// than tearing the session down.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::UpstreamTransient(_))
    }
}

/// Classify an upstream HTTP status into a transient or fatal relay error.
pub fn classify_upstream_status(status: u16, context: &str) -> RelayError {
    if status >= 500 {
        RelayError::UpstreamTransient(format!("{context}: HTTP {status}"))
    } else {
        RelayError::UpstreamFatal(format!("{context}: HTTP {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_upstream_status(503, "probe").is_transient());
        assert!(classify_upstream_status(500, "probe").is_transient());
        assert!(!classify_upstream_status(404, "probe").is_transient());
        assert!(!classify_upstream_status(403, "probe").is_transient());
    }
}
