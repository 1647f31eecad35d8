use crate::error::RelayError;
use crate::variant::CodecVariant;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub mod track;
pub mod variant;

pub use track::{EsSample, EsTrack, TrackLimits};
pub use variant::{ConsumerPosition, EsVariant};

struct BufferState {
    variants: HashMap<CodecVariant, Arc<EsVariant>>,
    source_key: Option<CodecVariant>,
    source_completed: bool,
    processors: HashSet<Uuid>,
}

/// All elementary-stream variants of one session.
///
/// The demuxer writes the designated source variant; processors and
/// transcoders create further variants lazily through
/// [SharedEsBuffer::get_or_create_variant].
pub struct SharedEsBuffer {
    limits: TrackLimits,
    state: RwLock<BufferState>,
    /// Signalled when the source key becomes known and on close
    source_notify: Notify,
    closed: AtomicBool,
    bytes_ingested: AtomicU64,
}

impl SharedEsBuffer {
    pub fn new(limits: TrackLimits) -> Self {
        Self {
            limits,
            state: RwLock::new(BufferState {
                variants: HashMap::new(),
                source_key: None,
                source_completed: false,
                processors: HashSet::new(),
            }),
            source_notify: Notify::new(),
            closed: AtomicBool::new(false),
            bytes_ingested: AtomicU64::new(0),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::BufferClosed.into());
        }
        Ok(())
    }

    /// Resolve `key` to a variant, creating it when missing.
    ///
    /// The `copy` sentinel blocks until the ingest demuxer has announced the
    /// source codecs; cancellation of `cancel` aborts the wait.
    pub async fn get_or_create_variant(
        &self,
        key: &CodecVariant,
        cancel: &CancellationToken,
    ) -> Result<Arc<EsVariant>> {
        self.ensure_open()?;
        if key.is_source_alias() {
            loop {
                // arm before checking to avoid a missed wakeup
                let notified = self.source_notify.notified();
                self.ensure_open()?;
                if let Some(v) = self.source_variant() {
                    return Ok(v);
                }
                tokio::select! {
                    _ = notified => {}
                    _ = cancel.cancelled() => {
                        return Err(RelayError::BufferClosed.into());
                    }
                }
            }
        }

        if !key.is_supported() {
            return Err(RelayError::CodecCombinationUnsupported(key.clone()).into());
        }

        let mut state = self.state.write().unwrap();
        if let Some(v) = state.variants.get(key) {
            return Ok(v.clone());
        }
        debug!("creating variant {}", key);
        let v = Arc::new(EsVariant::new(key.clone(), self.limits.clone()));
        state.variants.insert(key.clone(), v.clone());
        Ok(v)
    }

    /// Non-blocking lookup; resolves the `copy` sentinel if the source is
    /// already known
    pub fn get_variant(&self, key: &CodecVariant) -> Option<Arc<EsVariant>> {
        let state = self.state.read().unwrap();
        let key = if key.is_source_alias() {
            state.source_key.as_ref()?
        } else {
            key
        };
        state.variants.get(key).cloned()
    }

    pub fn source_variant(&self) -> Option<Arc<EsVariant>> {
        let state = self.state.read().unwrap();
        let key = state.source_key.as_ref()?;
        state.variants.get(key).cloned()
    }

    /// Current source identifier; `None` until the ingest demuxer has
    /// discovered codecs
    pub fn source_variant_key(&self) -> Option<CodecVariant> {
        self.state.read().unwrap().source_key.clone()
    }

    /// Called exactly once by the demuxer after codec discovery; later calls
    /// are ignored
    pub fn set_source(&self, key: CodecVariant) -> Result<Arc<EsVariant>> {
        self.ensure_open()?;
        let variant = {
            let mut state = self.state.write().unwrap();
            if let Some(existing) = &state.source_key {
                let existing = existing.clone();
                return Ok(state.variants.get(&existing).unwrap().clone());
            }
            let v = state
                .variants
                .entry(key.clone())
                .or_insert_with(|| Arc::new(EsVariant::new(key.clone(), self.limits.clone())))
                .clone();
            v.mark_source();
            state.source_key = Some(key.clone());
            debug!("source variant set to {}", key);
            v
        };
        self.source_notify.notify_waiters();
        Ok(variant)
    }

    pub fn mark_source_completed(&self) {
        self.state.write().unwrap().source_completed = true;
        let state = self.state.read().unwrap();
        for v in state.variants.values() {
            v.notify_all();
        }
    }

    pub fn is_source_completed(&self) -> bool {
        self.state.read().unwrap().source_completed
    }

    pub fn register_processor(&self, id: Uuid) {
        self.state.write().unwrap().processors.insert(id);
    }

    pub fn unregister_processor(&self, id: &Uuid) {
        self.state.write().unwrap().processors.remove(id);
    }

    pub fn processor_count(&self) -> usize {
        self.state.read().unwrap().processors.len()
    }

    pub fn add_bytes_ingested(&self, n: u64) {
        self.bytes_ingested.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_ingested(&self) -> u64 {
        self.bytes_ingested.load(Ordering::Relaxed)
    }

    pub fn variant_keys(&self) -> Vec<CodecVariant> {
        self.state.read().unwrap().variants.keys().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear down: wake every waiter so blocked readers observe the closed
    /// flag. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.source_notify.notify_waiters();
        let state = self.state.read().unwrap();
        for v in state.variants.values() {
            v.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use std::time::Duration;

    fn buffer() -> SharedEsBuffer {
        SharedEsBuffer::new(TrackLimits::default())
    }

    #[tokio::test]
    async fn test_get_or_create_and_lookup() {
        let buf = buffer();
        let cancel = CancellationToken::new();
        let key = CodecVariant::new("h264", "aac");
        let v1 = buf.get_or_create_variant(&key, &cancel).await.unwrap();
        let v2 = buf.get_or_create_variant(&key, &cancel).await.unwrap();
        assert!(Arc::ptr_eq(&v1, &v2));
        assert!(buf.get_variant(&key).is_some());
    }

    #[tokio::test]
    async fn test_unsupported_combination_rejected() {
        let buf = buffer();
        let cancel = CancellationToken::new();
        let key = CodecVariant::new("wmv9", "sonic");
        let err = buf.get_or_create_variant(&key, &cancel).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::CodecCombinationUnsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_copy_blocks_until_source_known() {
        let buf = Arc::new(buffer());
        let cancel = CancellationToken::new();
        let waiter = {
            let buf = buf.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                buf.get_or_create_variant(&CodecVariant::source(), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        buf.set_source(CodecVariant::new("h264", "aac")).unwrap();
        let resolved = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(resolved.is_source());
        assert_eq!(resolved.key(), &CodecVariant::new("h264", "aac"));
    }

    #[tokio::test]
    async fn test_copy_wait_cancelled() {
        let buf = buffer();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = buf
            .get_or_create_variant(&CodecVariant::source(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::BufferClosed)
        ));
    }

    #[test]
    fn test_set_source_only_once() {
        let buf = buffer();
        let first = buf.set_source(CodecVariant::new("h264", "aac")).unwrap();
        let second = buf.set_source(CodecVariant::new("h265", "opus")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            buf.source_variant_key(),
            Some(CodecVariant::new("h264", "aac"))
        );
    }

    #[tokio::test]
    async fn test_closed_buffer_rejects_operations() {
        let buf = buffer();
        buf.close();
        buf.close(); // idempotent
        let cancel = CancellationToken::new();
        let err = buf
            .get_or_create_variant(&CodecVariant::new("h264", "aac"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::BufferClosed)
        ));
        assert!(buf.set_source(CodecVariant::new("h264", "aac")).is_err());
    }

    #[test]
    fn test_processor_refcount() {
        let buf = buffer();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        buf.register_processor(a);
        buf.register_processor(b);
        buf.register_processor(a); // set semantics
        assert_eq!(buf.processor_count(), 2);
        buf.unregister_processor(&a);
        buf.unregister_processor(&b);
        assert_eq!(buf.processor_count(), 0);
    }

    #[test]
    fn test_bytes_ingested_counter() {
        let buf = buffer();
        buf.add_bytes_ingested(100);
        buf.add_bytes_ingested(28);
        assert_eq!(buf.bytes_ingested(), 128);
    }
}
