use crate::worker::{
    decode_frame, encode_frame, rpc_codec, DaemonRegistry, RpcFrame, RpcPayload,
};
use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound queue depth per daemon connection; sends block (with timeout)
/// when the daemon cannot drain fast enough
pub const DAEMON_SEND_QUEUE: usize = 256;

/// Accepts worker daemon connections and multiplexes job traffic.
///
/// Each daemon keeps a single bidirectional stream; frames carrying a
/// `job_id` are routed to whichever transcode job opened that id, control
/// frames (register, heartbeat) go to the registry.
pub struct DaemonStreamManager {
    registry: Arc<DaemonRegistry>,
    jobs: Mutex<HashMap<Uuid, mpsc::Sender<RpcFrame>>>,
}

impl DaemonStreamManager {
    pub fn new(registry: Arc<DaemonRegistry>) -> Self {
        Self {
            registry,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Route future frames for `job_id` to the returned receiver
    pub fn open_job(&self, job_id: Uuid) -> mpsc::Receiver<RpcFrame> {
        let (tx, rx) = mpsc::channel(DAEMON_SEND_QUEUE);
        self.jobs.lock().unwrap().insert(job_id, tx);
        rx
    }

    pub fn close_job(&self, job_id: &Uuid) {
        self.jobs.lock().unwrap().remove(job_id);
    }

    fn route_job_frame(&self, frame: RpcFrame) {
        let Some(job_id) = frame.job_id else {
            return;
        };
        let sender = self.jobs.lock().unwrap().get(&job_id).cloned();
        match sender {
            Some(tx) => {
                if tx.try_send(frame).is_err() {
                    warn!("job {} inbound queue full, frame dropped", job_id);
                }
            }
            None => debug!("frame for unknown job {}", job_id),
        }
    }

    pub async fn listen(
        self: Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding worker listener on {addr}"))?;
        info!("worker RPC listening on {}", addr);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!("worker connection from {}", peer);
                    let manager = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.handle_conn(stream, cancel).await {
                            warn!("worker connection ended: {:#}", e);
                        }
                    });
                }
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn handle_conn(
        self: Arc<Self>,
        stream: TcpStream,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut framed = Framed::new(stream, rpc_codec());

        // first frame must register the daemon
        let first = tokio::time::timeout(Duration::from_secs(10), framed.next())
            .await
            .context("timed out waiting for register")?
            .context("stream closed before register")??;
        let frame = decode_frame(&first)?;
        let RpcPayload::Register(req) = frame.payload else {
            let nack = RpcFrame::control(RpcPayload::RegisterAck {
                success: false,
                error: Some("expected register".into()),
            });
            framed.send(encode_frame(&nack)?).await.ok();
            bail!("first frame was not a register request");
        };

        let daemon_id = req.daemon_id.clone();
        let (out_tx, mut out_rx) = mpsc::channel::<RpcFrame>(DAEMON_SEND_QUEUE);
        self.registry.register(req, Some(out_tx));
        let ack = RpcFrame::control(RpcPayload::RegisterAck {
            success: true,
            error: None,
        });
        framed.send(encode_frame(&ack)?).await?;

        let result = self.pump(&daemon_id, &mut framed, &mut out_rx, cancel).await;
        self.registry.unregister(&daemon_id, "stream closed");
        result
    }

    async fn pump(
        &self,
        daemon_id: &str,
        framed: &mut Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
        out_rx: &mut mpsc::Receiver<RpcFrame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                incoming = framed.next() => {
                    let Some(incoming) = incoming else {
                        debug!("daemon {} closed its stream", daemon_id);
                        return Ok(());
                    };
                    let frame = decode_frame(&incoming?)?;
                    if frame.job_id.is_some() {
                        self.route_job_frame(frame);
                        continue;
                    }
                    match frame.payload {
                        RpcPayload::Heartbeat(hb) => {
                            if let Err(e) = self.registry.handle_heartbeat(&hb) {
                                warn!("heartbeat rejected: {:#}", e);
                                return Err(e);
                            }
                            let ack = RpcFrame::control(RpcPayload::HeartbeatAck);
                            framed.send(encode_frame(&ack)?).await?;
                        }
                        other => debug!("unexpected control frame: {:?}", other),
                    }
                }
                outgoing = out_rx.recv() => {
                    let Some(frame) = outgoing else {
                        return Ok(());
                    };
                    framed.send(encode_frame(&frame)?).await?;
                }
                _ = cancel.cancelled() => {
                    // half-close: stop sending, let the read side drain
                    framed.close().await.ok();
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{
        DaemonCapabilities, HeartbeatRequest, RegisterRequest, RegistryConfig, SampleBatch,
    };

    async fn start_manager() -> (Arc<DaemonStreamManager>, Arc<DaemonRegistry>, SocketAddr) {
        let registry = Arc::new(DaemonRegistry::new(RegistryConfig::default()));
        let manager = Arc::new(DaemonStreamManager::new(registry.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let m = manager.clone();
        let cancel = CancellationToken::new();
        tokio::spawn(async move { m.listen(addr, cancel).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        (manager, registry, addr)
    }

    fn register_frame(id: &str) -> RpcFrame {
        RpcFrame::control(RpcPayload::Register(RegisterRequest {
            daemon_id: id.into(),
            daemon_name: "test".into(),
            version: "1".into(),
            capabilities: DaemonCapabilities {
                max_concurrent_jobs: 2,
                ..Default::default()
            },
        }))
    }

    #[tokio::test]
    async fn test_register_heartbeat_and_job_routing() {
        let (manager, registry, addr) = start_manager().await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, rpc_codec());
        framed
            .send(encode_frame(&register_frame("d1")).unwrap())
            .await
            .unwrap();
        let ack = decode_frame(&framed.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(
            ack.payload,
            RpcPayload::RegisterAck { success: true, .. }
        ));
        assert!(registry.get("d1").is_some());

        // heartbeat
        framed
            .send(
                encode_frame(&RpcFrame::control(RpcPayload::Heartbeat(HeartbeatRequest {
                    daemon_id: "d1".into(),
                    system_stats: Default::default(),
                    active_jobs: vec![],
                })))
                .unwrap(),
            )
            .await
            .unwrap();
        let ack = decode_frame(&framed.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(ack.payload, RpcPayload::HeartbeatAck));

        // job frame routed to the opened receiver
        let job_id = Uuid::new_v4();
        let mut job_rx = manager.open_job(job_id);
        framed
            .send(
                encode_frame(&RpcFrame::job(
                    job_id,
                    RpcPayload::SampleBatch(SampleBatch::default()),
                ))
                .unwrap(),
            )
            .await
            .unwrap();
        let routed = tokio::time::timeout(Duration::from_secs(1), job_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(routed.job_id, Some(job_id));
        manager.close_job(&job_id);
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (_manager, registry, addr) = start_manager().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, rpc_codec());
        framed
            .send(encode_frame(&register_frame("d2")).unwrap())
            .await
            .unwrap();
        let _ = framed.next().await;
        drop(framed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.get("d2").is_none());
    }
}
