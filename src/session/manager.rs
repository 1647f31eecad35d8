use crate::session::{SessionConfig, SessionController};
use crate::settings::Settings;
use crate::transcode::TranscoderFactory;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Channel id -> live session, created on first client request
pub struct SessionManager {
    settings: Settings,
    factory: Arc<TranscoderFactory>,
    sessions: RwLock<HashMap<String, Arc<SessionController>>>,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        settings: Settings,
        factory: Arc<TranscoderFactory>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            settings,
            factory,
            sessions: RwLock::new(HashMap::new()),
            cancel,
        });
        manager.spawn_reaper();
        manager
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Existing live session, or start one from the channel configuration
    pub fn get_or_start(&self, channel_id: &str) -> Result<Arc<SessionController>> {
        {
            let sessions = self.sessions.read().unwrap();
            if let Some(s) = sessions.get(channel_id) {
                if !s.is_closed() {
                    return Ok(s.clone());
                }
            }
        }

        let channel = self
            .settings
            .channels
            .iter()
            .find(|c| c.id == channel_id)
            .with_context(|| format!("unknown channel {channel_id}"))?;

        let mut sessions = self.sessions.write().unwrap();
        if let Some(s) = sessions.get(channel_id) {
            if !s.is_closed() {
                return Ok(s.clone());
            }
        }
        let url = channel
            .source_url
            .parse()
            .with_context(|| format!("channel {channel_id} source url"))?;
        let session = SessionController::new(
            channel.id.clone(),
            url,
            channel.ingest,
            channel.profile.clone().unwrap_or_default(),
            channel.passthrough,
            self.settings.track_limits(),
            self.settings.egress.clone(),
            SessionConfig {
                fallback_enabled: channel.fallback,
                ..self.settings.session_config()
            },
            self.factory.clone(),
            &self.cancel,
        );
        session.start();
        sessions.insert(channel_id.to_string(), session.clone());
        Ok(session)
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<SessionController>> {
        self.sessions.read().unwrap().get(channel_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn all(&self) -> Vec<Arc<SessionController>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    /// Drop closed sessions from the table
    fn spawn_reaper(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut sessions = manager.sessions.write().unwrap();
                        let before = sessions.len();
                        sessions.retain(|_, s| !s.is_closed());
                        let removed = before - sessions.len();
                        if removed > 0 {
                            debug!("reaped {} closed sessions", removed);
                        }
                    }
                    _ = manager.cancel.cancelled() => return,
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        let sessions = self.all();
        for s in sessions {
            s.close().await;
        }
        self.sessions.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ChannelConfig, Settings};
    use crate::transcode::{default_selection_strategy, TranscoderConfig};
    use crate::worker::{
        DaemonRegistry, DaemonStreamManager, RegistryConfig, SpawnerConfig, WorkerSpawner,
    };

    fn manager() -> Arc<SessionManager> {
        let registry = Arc::new(DaemonRegistry::new(RegistryConfig::default()));
        let stream_manager = Arc::new(DaemonStreamManager::new(registry.clone()));
        let spawner = WorkerSpawner::new(
            SpawnerConfig {
                binary_path: Some("/nonexistent".into()),
                ..Default::default()
            },
            registry.clone(),
        );
        let factory = Arc::new(TranscoderFactory::new(
            registry,
            stream_manager,
            spawner,
            default_selection_strategy(),
            TranscoderConfig::default(),
        ));
        let settings = Settings {
            channels: vec![ChannelConfig {
                id: "news".into(),
                name: Some("News".into()),
                source_url: "http://127.0.0.1:1/news.ts".into(),
                ingest: Default::default(),
                fallback: false,
                passthrough: false,
                profile: None,
            }],
            ..Default::default()
        };
        SessionManager::new(settings, factory, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_unknown_channel_rejected() {
        let m = manager();
        assert!(m.get_or_start("nope").is_err());
        assert_eq!(m.session_count(), 0);
    }

    #[tokio::test]
    async fn test_session_reuse() {
        let m = manager();
        let a = m.get_or_start("news").unwrap();
        let b = m.get_or_start("news").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(m.session_count(), 1);
        m.shutdown().await;
        assert_eq!(m.session_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let m = manager();
        let a = m.get_or_start("news").unwrap();
        a.close().await;
        let b = m.get_or_start("news").unwrap();
        assert_ne!(a.id, b.id);
    }
}
