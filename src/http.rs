use crate::egress::{AnyProcessor, OutputFormat};
use crate::error::{classify_upstream_status, RelayError};
use crate::ingress::IngestKind;
use crate::session::{SessionController, SessionManager};
use crate::settings::StreamMode;
use crate::variant::CodecVariant;
use anyhow::Result;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::http::response::Builder;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

const SERVER_NAME: &str = "tvarr";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Player identification header influencing format selection
const PLAYER_HEADER: &str = "x-tvarr-player";

type ServiceBody = BoxBody<Bytes, anyhow::Error>;

/// How this response was produced, surfaced via X-Stream-Decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Redirect,
    Proxy,
    Passthrough,
    Repackage,
    Transcode,
}

impl Decision {
    fn as_str(&self) -> &'static str {
        match self {
            Decision::Redirect => "redirect",
            Decision::Proxy => "proxy",
            Decision::Passthrough => "passthrough",
            Decision::Repackage => "repackage",
            Decision::Transcode => "transcode",
        }
    }
}

/// What direct mode can do for a request without touching the media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectAction {
    /// Send the client to the upstream itself (302)
    Redirect,
    /// Relay the upstream bytes verbatim
    Proxy,
}

/// The client-facing HTTP surface: playlists, segments, manifests and
/// continuous TS, all backed by the session manager.
#[derive(Clone)]
pub struct RelayService {
    manager: Arc<SessionManager>,
    client: reqwest::Client,
}

impl RelayService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            client: reqwest::Client::new(),
        }
    }
}

impl Service<Request<Incoming>> for RelayService {
    type Response = Response<ServiceBody>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let manager = self.manager.clone();
        let client = self.client.clone();
        Box::pin(async move {
            match handle(manager, client, &req).await {
                Ok(rsp) => Ok(rsp),
                Err(e) => {
                    let status = error_status(&e);
                    if status == StatusCode::INTERNAL_SERVER_ERROR {
                        warn!("request {} failed: {:#}", req.uri(), e);
                    } else {
                        debug!("request {} -> {}: {:#}", req.uri(), status, e);
                    }
                    Ok(Response::builder()
                        .status(status)
                        .header("server", SERVER_NAME)
                        .body(empty_body())?)
                }
            }
        })
    }
}

fn error_status(e: &anyhow::Error) -> StatusCode {
    match e.downcast_ref::<RelayError>() {
        Some(RelayError::NotFound) | Some(RelayError::ClientNotFound) => StatusCode::NOT_FOUND,
        Some(RelayError::SegmentNotReady) | Some(RelayError::ProcessorStopping) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Some(RelayError::UpstreamTransient(_)) | Some(RelayError::UpstreamFatal(_)) => {
            StatusCode::BAD_GATEWAY
        }
        Some(RelayError::CodecCombinationUnsupported(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn empty_body() -> ServiceBody {
    Full::new(Bytes::new()).map_err(|e| match e {}).boxed()
}

fn full_body(data: Bytes) -> ServiceBody {
    Full::new(data).map_err(|e| match e {}).boxed()
}

fn parse_query(req: &Request<Incoming>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn streaming_headers(
    builder: Builder,
    mode: StreamMode,
    decision: Decision,
    format: OutputFormat,
) -> Builder {
    builder
        .header("server", SERVER_NAME)
        .header("access-control-allow-origin", "*")
        .header("X-Stream-Mode", mode.as_str())
        .header("X-Stream-Decision", decision.as_str())
        .header("X-Stream-Format", format.to_string())
        .header("X-Tvarr-Version", VERSION)
}

/// Pick a format for `format=auto` based on the identified player
fn auto_format(player: Option<&str>) -> OutputFormat {
    let Some(player) = player else {
        return OutputFormat::HlsTs;
    };
    let name = player.split('/').next().unwrap_or("").to_ascii_lowercase();
    match name.as_str() {
        "shaka" | "dashjs" => OutputFormat::Dash,
        "tvarr-web" | "hlsjs-fmp4" => OutputFormat::HlsFmp4,
        _ => OutputFormat::HlsTs,
    }
}

async fn handle(
    manager: Arc<SessionManager>,
    client: reqwest::Client,
    req: &Request<Incoming>,
) -> Result<Response<ServiceBody>> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header("server", SERVER_NAME)
            .body(empty_body())?);
    }

    let path = req.uri().path().trim_start_matches('/').to_string();
    if path == "status" {
        let stats: Vec<_> = manager.all().iter().map(|s| s.stats()).collect();
        let body = serde_json::to_vec(&stats)?;
        return Ok(Response::builder()
            .header("server", SERVER_NAME)
            .header("content-type", "application/json")
            .body(full_body(body.into()))?);
    }

    let mode = manager.settings().stream_mode;

    // /<channel>/playlist.m3u8, /<channel>/segment<N>.ts, /<channel>/manifest.mpd
    if let Some((channel, tail)) = path.split_once('/') {
        if mode == StreamMode::Direct {
            // direct mode never repackages, so segment names do not exist;
            // manifests redirect the client to the upstream
            let format = match tail {
                "playlist.m3u8" => OutputFormat::HlsTs,
                "manifest.mpd" => OutputFormat::Dash,
                _ => return Err(RelayError::NotFound.into()),
            };
            return serve_direct(&manager, &client, channel, format).await;
        }
        let session = manager.get_or_start(channel)?;
        session.touch();
        return match tail {
            "playlist.m3u8" => serve_hls_playlist(&session, mode, req).await,
            "manifest.mpd" => serve_dash_manifest(&session, mode, req).await,
            _ => {
                if let Some(seq) = tail
                    .strip_prefix("segment")
                    .and_then(|t| t.strip_suffix(".ts"))
                    .and_then(|n| n.parse::<u64>().ok())
                {
                    serve_hls_segment(&session, mode, req, seq).await
                } else {
                    Err(RelayError::NotFound.into())
                }
            }
        };
    }

    // /<channel>.ts -> continuous MPEG-TS
    if let Some(channel) = path.strip_suffix(".ts") {
        if mode == StreamMode::Direct {
            return serve_direct(&manager, &client, channel, OutputFormat::MpegTs).await;
        }
        let session = manager.get_or_start(channel)?;
        return serve_continuous_ts(&session, mode, req).await;
    }

    // /<channel>?format=...&variant=...&seg=...&init=...
    if !path.is_empty() {
        if mode == StreamMode::Direct {
            let query = parse_query(req);
            if query.contains_key("seg") || query.contains_key("init") {
                return Err(RelayError::NotFound.into());
            }
            let player = req
                .headers()
                .get(PLAYER_HEADER)
                .and_then(|h| h.to_str().ok());
            let format = match query.get("format").map(|s| s.as_str()) {
                Some("auto") | None => auto_format(player),
                Some(other) => OutputFormat::from_query(other).ok_or(RelayError::NotFound)?,
            };
            return serve_direct(&manager, &client, &path, format).await;
        }
        let session = manager.get_or_start(&path)?;
        session.touch();
        return serve_query(&session, mode, req).await;
    }

    Err(RelayError::NotFound.into())
}

/// Which direct-mode action fits a request, if any: a format the upstream
/// natively speaks can be redirected or proxied, anything else would need
/// the repackaging engine.
fn direct_action(ingest: IngestKind, format: OutputFormat) -> Option<DirectAction> {
    match (ingest, format) {
        (IngestKind::Hls, OutputFormat::HlsTs | OutputFormat::HlsFmp4) => {
            Some(DirectAction::Redirect)
        }
        (IngestKind::Dash, OutputFormat::Dash) => Some(DirectAction::Redirect),
        (IngestKind::Mpegts, OutputFormat::MpegTs) => Some(DirectAction::Proxy),
        _ => None,
    }
}

/// Serve a channel in direct mode: the relay stays out of the media path
async fn serve_direct(
    manager: &Arc<SessionManager>,
    client: &reqwest::Client,
    channel_id: &str,
    format: OutputFormat,
) -> Result<Response<ServiceBody>> {
    let settings = manager.settings();
    let channel = settings
        .channels
        .iter()
        .find(|c| c.id == channel_id)
        .ok_or(RelayError::NotFound)?;
    let action = direct_action(channel.ingest, format).ok_or(RelayError::NotFound)?;

    match action {
        DirectAction::Redirect => Ok(streaming_headers(
            Response::builder().status(StatusCode::FOUND),
            StreamMode::Direct,
            Decision::Redirect,
            format,
        )
        .header("location", &channel.source_url)
        .body(empty_body())?),
        DirectAction::Proxy => {
            let url: Url = channel
                .source_url
                .parse()
                .map_err(|e| RelayError::UpstreamFatal(format!("bad source url: {e}")))?;
            let rsp = client
                .get(url)
                .send()
                .await
                .map_err(|e| RelayError::UpstreamTransient(e.to_string()))?;
            let status = rsp.status();
            if !status.is_success() {
                return Err(classify_upstream_status(status.as_u16(), "direct proxy").into());
            }
            let stream = rsp
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(anyhow::Error::new);
            let body = StreamBody::new(stream).boxed();
            Ok(streaming_headers(
                Response::builder(),
                StreamMode::Direct,
                Decision::Proxy,
                format,
            )
            .header("content-type", format.content_type())
            .body(body)?)
        }
    }
}

fn requested_variant(query: &HashMap<String, String>) -> Result<Option<CodecVariant>> {
    match query.get("variant") {
        Some(raw) => Ok(Some(raw.parse()?)),
        None => Ok(None),
    }
}

fn decision_for(session: &SessionController, variant: Option<&CodecVariant>) -> Decision {
    let requested_source = variant.map(|v| v.is_source_alias()).unwrap_or(true);
    if requested_source {
        Decision::Repackage
    } else {
        let source = session.buffer().source_variant_key();
        match (source, variant) {
            (Some(src), Some(v)) if &src == v => Decision::Repackage,
            _ => Decision::Transcode,
        }
    }
}

async fn serve_hls_playlist(
    session: &Arc<SessionController>,
    mode: StreamMode,
    req: &Request<Incoming>,
) -> Result<Response<ServiceBody>> {
    let query = parse_query(req);
    let variant = requested_variant(&query)?;

    // upstream already speaks HLS: pass its playlist through
    if let Some(pt) = session.passthrough() {
        if pt.format() == OutputFormat::HlsTs && variant.is_none() {
            let manifest = pt.manifest().await?;
            return Ok(streaming_headers(
                Response::builder(),
                mode,
                Decision::Passthrough,
                OutputFormat::HlsTs,
            )
            .header("content-type", OutputFormat::HlsTs.content_type())
            .body(full_body(manifest.into()))?);
        }
    }

    let decision = decision_for(session, variant.as_ref());
    let processor = session
        .get_or_create_processor(OutputFormat::HlsTs, variant.as_ref())
        .await?;
    let AnyProcessor::HlsTs(p) = &processor else {
        return Err(RelayError::NotFound.into());
    };
    let playlist = p.playlist().await?;
    Ok(streaming_headers(
        Response::builder(),
        mode,
        decision,
        OutputFormat::HlsTs,
    )
    .header("content-type", OutputFormat::HlsTs.content_type())
    .body(full_body(playlist.into()))?)
}

async fn serve_hls_segment(
    session: &Arc<SessionController>,
    mode: StreamMode,
    req: &Request<Incoming>,
    sequence: u64,
) -> Result<Response<ServiceBody>> {
    let query = parse_query(req);
    let variant = requested_variant(&query)?;
    let decision = decision_for(session, variant.as_ref());
    let processor = session
        .get_or_create_processor(OutputFormat::HlsTs, variant.as_ref())
        .await?;
    let AnyProcessor::HlsTs(p) = &processor else {
        return Err(RelayError::NotFound.into());
    };
    let segment = p.segment(sequence)?;
    Ok(streaming_headers(
        Response::builder(),
        mode,
        decision,
        OutputFormat::HlsTs,
    )
    .header("content-type", "video/mp2t")
    .header("cache-control", "public, max-age=31536000")
    .body(full_body(segment.data))?)
}

async fn serve_dash_manifest(
    session: &Arc<SessionController>,
    mode: StreamMode,
    req: &Request<Incoming>,
) -> Result<Response<ServiceBody>> {
    let query = parse_query(req);
    let variant = requested_variant(&query)?;

    if let Some(pt) = session.passthrough() {
        if pt.format() == OutputFormat::Dash && variant.is_none() {
            let manifest = pt.manifest().await?;
            return Ok(streaming_headers(
                Response::builder(),
                mode,
                Decision::Passthrough,
                OutputFormat::Dash,
            )
            .header("content-type", OutputFormat::Dash.content_type())
            .body(full_body(manifest.into()))?);
        }
    }

    let decision = decision_for(session, variant.as_ref());
    let processor = session
        .get_or_create_processor(OutputFormat::Dash, variant.as_ref())
        .await?;
    let AnyProcessor::Dash(p) = &processor else {
        return Err(RelayError::NotFound.into());
    };
    let manifest = p.manifest().await?;
    Ok(streaming_headers(
        Response::builder(),
        mode,
        decision,
        OutputFormat::Dash,
    )
    .header("content-type", OutputFormat::Dash.content_type())
    .body(full_body(manifest.into()))?)
}

async fn serve_continuous_ts(
    session: &Arc<SessionController>,
    mode: StreamMode,
    req: &Request<Incoming>,
) -> Result<Response<ServiceBody>> {
    let query = parse_query(req);
    let variant = requested_variant(&query)?;
    let decision = decision_for(session, variant.as_ref());
    let processor = session
        .get_or_create_processor(OutputFormat::MpegTs, variant.as_ref())
        .await?;
    let AnyProcessor::MpegTs(p) = &processor else {
        return Err(RelayError::NotFound.into());
    };

    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let remote = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown");

    let client = session.add_client(user_agent, remote);
    let rx = match p.add_client(client.clone()) {
        Ok(rx) => rx,
        Err(e) => {
            session.remove_client(&client.id).ok();
            return Err(e);
        }
    };

    let stream = ClientByteStream {
        rx,
        session: session.clone(),
        client_id: client.id,
    };
    let body = StreamBody::new(stream).boxed();
    Ok(streaming_headers(
        Response::builder(),
        mode,
        decision,
        OutputFormat::MpegTs,
    )
    .header("content-type", "video/mp2t")
    .body(body)?)
}

async fn serve_query(
    session: &Arc<SessionController>,
    mode: StreamMode,
    req: &Request<Incoming>,
) -> Result<Response<ServiceBody>> {
    let query = parse_query(req);
    let player = req
        .headers()
        .get(PLAYER_HEADER)
        .and_then(|h| h.to_str().ok());

    let format = match query.get("format").map(|s| s.as_str()) {
        Some("auto") | None => auto_format(player),
        Some(other) => OutputFormat::from_query(other).ok_or(RelayError::NotFound)?,
    };
    let variant = requested_variant(&query)?;

    // media requests first: ?seg= / ?init=
    if let Some(seg) = query.get("seg") {
        return serve_media(session, mode, format, variant.as_ref(), seg, false).await;
    }
    if let Some(init) = query.get("init") {
        return serve_media(session, mode, format, variant.as_ref(), init, true).await;
    }

    match format {
        OutputFormat::HlsTs => serve_hls_playlist(session, mode, req).await,
        OutputFormat::Dash => serve_dash_manifest(session, mode, req).await,
        OutputFormat::MpegTs => serve_continuous_ts(session, mode, req).await,
        OutputFormat::HlsFmp4 => {
            let decision = decision_for(session, variant.as_ref());
            let processor = session
                .get_or_create_processor(OutputFormat::HlsFmp4, variant.as_ref())
                .await?;
            let AnyProcessor::HlsFmp4(p) = &processor else {
                return Err(RelayError::NotFound.into());
            };
            let playlist = p.playlist().await?;
            Ok(streaming_headers(
                Response::builder(),
                mode,
                decision,
                OutputFormat::HlsFmp4,
            )
            .header("content-type", OutputFormat::HlsFmp4.content_type())
            .body(full_body(playlist.into()))?)
        }
    }
}

async fn serve_media(
    session: &Arc<SessionController>,
    mode: StreamMode,
    format: OutputFormat,
    variant: Option<&CodecVariant>,
    id: &str,
    is_init: bool,
) -> Result<Response<ServiceBody>> {
    // passthrough ids are opaque hex; processor ids are decimal sequences
    if let Some(pt) = session.passthrough() {
        if id.parse::<u64>().is_err() || pt.format() == format {
            if let Ok(data) = pt.segment(id).await {
                return Ok(streaming_headers(
                    Response::builder(),
                    mode,
                    Decision::Passthrough,
                    format,
                )
                .header("content-type", "video/mp2t")
                .header("cache-control", "public, max-age=31536000")
                .body(full_body(data))?);
            }
        }
    }

    let decision = decision_for(session, variant);
    let (data, content_type) = match format {
        OutputFormat::HlsFmp4 | OutputFormat::Dash => {
            let processor = session.get_or_create_processor(format, variant).await?;
            let data = match (&processor, is_init) {
                (AnyProcessor::HlsFmp4(p), true) => p.init_segment()?,
                (AnyProcessor::HlsFmp4(p), false) => {
                    p.segment(id.parse().map_err(|_| RelayError::NotFound)?)?.data
                }
                (AnyProcessor::Dash(p), true) => p.init_segment()?,
                (AnyProcessor::Dash(p), false) => {
                    p.segment(id.parse().map_err(|_| RelayError::NotFound)?)?.data
                }
                _ => return Err(RelayError::NotFound.into()),
            };
            (data, "video/mp4")
        }
        OutputFormat::HlsTs => {
            let processor = session
                .get_or_create_processor(OutputFormat::HlsTs, variant)
                .await?;
            let AnyProcessor::HlsTs(p) = &processor else {
                return Err(RelayError::NotFound.into());
            };
            let seq: u64 = id.parse().map_err(|_| RelayError::NotFound)?;
            (p.segment(seq)?.data, "video/mp2t")
        }
        OutputFormat::MpegTs => return Err(RelayError::NotFound.into()),
    };

    Ok(streaming_headers(Response::builder(), mode, decision, format)
        .header("content-type", content_type)
        .header("cache-control", "public, max-age=31536000")
        .body(full_body(data))?)
}

/// Body stream for continuous TS clients; dropping it (client disconnect)
/// unregisters the client from the session.
struct ClientByteStream {
    rx: mpsc::Receiver<Bytes>,
    session: Arc<SessionController>,
    client_id: Uuid,
}

impl futures_util::Stream for ClientByteStream {
    type Item = Result<Frame<Bytes>, anyhow::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => Poll::Ready(Some(Ok(Frame::data(data)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ClientByteStream {
    fn drop(&mut self) {
        if self.session.remove_client(&self.client_id).is_ok() {
            debug!("client {} disconnected", self.client_id);
        }
    }
}
