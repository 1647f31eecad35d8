use crate::error::RelayError;
use crate::worker::{DaemonRegistry, DaemonState};
use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Environment variable naming the worker executable
pub const WORKER_BINARY_ENV: &str = "TVARR_WORKER_BINARY";

const WORKER_BINARY_NAME: &str = "tvarr-worker";
const REGISTRATION_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Explicit worker binary path; overrides all lookup
    pub binary_path: Option<PathBuf>,
    /// Address the spawned worker connects back to
    pub coordinator_url: String,
    pub max_concurrent_spawns: usize,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub log_level: String,
    pub auth_token: Option<String>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            coordinator_url: "127.0.0.1:8390".into(),
            max_concurrent_spawns: 4,
            startup_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(5),
            log_level: "info".into(),
            auth_token: None,
        }
    }
}

/// Starts and supervises local worker subprocesses which register back as
/// daemons over the normal RPC listener.
pub struct WorkerSpawner {
    config: SpawnerConfig,
    registry: Arc<DaemonRegistry>,
    live: Arc<AtomicUsize>,
}

/// Handle to one spawned subprocess; cleanup is idempotent
#[derive(Debug)]
pub struct SpawnedWorker {
    pub daemon_id: String,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
    cleaned: AtomicBool,
    registry: Arc<DaemonRegistry>,
    shutdown_timeout: Duration,
    live: Arc<AtomicUsize>,
}

impl WorkerSpawner {
    pub fn new(config: SpawnerConfig, registry: Arc<DaemonRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Lookup order: explicit config, environment override, current
    /// directory, PATH.
    pub fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.binary_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(RelayError::SpawnFailed(format!(
                "configured worker binary {} does not exist",
                path.display()
            ))
            .into());
        }
        if let Ok(env_path) = std::env::var(WORKER_BINARY_ENV) {
            let path = PathBuf::from(env_path);
            if path.exists() {
                return Ok(path);
            }
        }
        let cwd = Path::new(WORKER_BINARY_NAME);
        if cwd.exists() {
            return Ok(cwd.to_path_buf());
        }
        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let candidate = dir.join(WORKER_BINARY_NAME);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
        Err(RelayError::SpawnFailed(format!("{} not found", WORKER_BINARY_NAME)).into())
    }

    /// Run `<worker> detect` and parse its capability report
    pub async fn detect(&self) -> Result<crate::worker::DetectOutput> {
        let binary = self.resolve_binary()?;
        let output = Command::new(&binary)
            .arg("detect")
            .output()
            .await
            .map_err(|e| RelayError::SpawnFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(RelayError::SpawnFailed(format!(
                "detect exited with {}",
                output.status
            ))
            .into());
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Run `<worker> --version` and extract the version token
    pub async fn version(&self) -> Result<String> {
        let binary = self.resolve_binary()?;
        let output = Command::new(&binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| RelayError::SpawnFailed(e.to_string()))?;
        let text = String::from_utf8_lossy(&output.stdout);
        let mut words = text.split_whitespace();
        while let Some(word) = words.next() {
            if word == "version" {
                if let Some(v) = words.next() {
                    return Ok(v.to_string());
                }
            }
        }
        Err(RelayError::SpawnFailed("no version token in output".into()).into())
    }

    /// Spawn a worker and wait until it registers as a Connected daemon
    pub async fn spawn(self: &Arc<Self>) -> Result<Arc<SpawnedWorker>> {
        let prev = self.live.fetch_add(1, Ordering::SeqCst);
        if prev >= self.config.max_concurrent_spawns {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(RelayError::MaxSpawnsReached.into());
        }

        let binary = match self.resolve_binary() {
            Ok(b) => b,
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        let daemon_id = format!("local-{}", Uuid::new_v4());
        let name = format!("spawned-{}", &daemon_id[6..14]);

        let mut cmd = Command::new(&binary);
        cmd.arg("serve")
            .arg("--coordinator-url")
            .arg(&self.config.coordinator_url)
            .arg("--daemon-id")
            .arg(&daemon_id)
            .arg("--name")
            .arg(&name)
            .arg("--log-level")
            .arg(&self.config.log_level)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = &self.config.auth_token {
            cmd.arg("--auth-token").arg(token);
        }

        info!("spawning worker {} ({})", daemon_id, binary.display());
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(RelayError::SpawnFailed(e.to_string()).into());
            }
        };

        let cancel = CancellationToken::new();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_logs(stdout, daemon_id.clone(), false, cancel.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_logs(stderr, daemon_id.clone(), true, cancel.clone()));
        }

        let worker = Arc::new(SpawnedWorker {
            daemon_id: daemon_id.clone(),
            child: Mutex::new(Some(child)),
            cancel,
            cleaned: AtomicBool::new(false),
            registry: self.registry.clone(),
            shutdown_timeout: self.config.shutdown_timeout,
            live: self.live.clone(),
        });

        // poll for the daemon to come up Connected
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        loop {
            if let Some(record) = self.registry.get(&daemon_id) {
                if record.state == DaemonState::Connected {
                    info!("worker {} registered", daemon_id);
                    return Ok(worker);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("worker {} never registered, killing", daemon_id);
                worker.cleanup().await;
                return Err(RelayError::RegistrationTimeout(self.config.startup_timeout).into());
            }
            tokio::time::sleep(REGISTRATION_POLL).await;
        }
    }
}

impl SpawnedWorker {
    /// Cancel, wait for graceful exit, force-kill, unregister. Safe to call
    /// any number of times.
    pub async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            let graceful =
                tokio::time::timeout(self.shutdown_timeout, child.wait()).await;
            match graceful {
                Ok(Ok(status)) => debug!("worker {} exited: {}", self.daemon_id, status),
                _ => {
                    warn!("worker {} did not exit, killing", self.daemon_id);
                    if let Err(e) = child.start_kill() {
                        error!("failed to kill worker {}: {}", self.daemon_id, e);
                    }
                    child.wait().await.ok();
                }
            }
        }
        self.registry.unregister(&self.daemon_id, "spawner cleanup");
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Deserialize)]
struct WorkerLogRecord {
    level: String,
    #[serde(alias = "message")]
    msg: String,
}

/// Line-oriented adapter: JSON log records re-emit at their level, anything
/// else passes through verbatim
async fn forward_logs<R: AsyncRead + Unpin>(
    reader: R,
    daemon_id: String,
    is_stderr: bool,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return };
                match serde_json::from_str::<WorkerLogRecord>(&line) {
                    Ok(record) => match record.level.as_str() {
                        "error" => error!(worker = %daemon_id, "{}", record.msg),
                        "warn" => warn!(worker = %daemon_id, "{}", record.msg),
                        "debug" | "trace" => debug!(worker = %daemon_id, "{}", record.msg),
                        _ => info!(worker = %daemon_id, "{}", record.msg),
                    },
                    Err(_) => {
                        if is_stderr {
                            warn!(worker = %daemon_id, "{}", line);
                        } else {
                            info!(worker = %daemon_id, "{}", line);
                        }
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}
