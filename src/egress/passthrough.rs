use crate::egress::OutputFormat;
use crate::error::RelayError;
use anyhow::{Context, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct PassthroughConfig {
    /// Manifest refetches are throttled to this interval
    pub manifest_refresh_interval: Duration,
    pub max_cached_segments: usize,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            manifest_refresh_interval: Duration::from_secs(2),
            max_cached_segments: 32,
        }
    }
}

struct PassthroughState {
    manifest: Option<String>,
    last_refresh: Option<Instant>,
    /// opaque id -> absolute upstream URL
    id_to_url: HashMap<String, String>,
    cache: HashMap<String, Bytes>,
    lru: VecDeque<String>,
}

/// Serves upstream HLS/DASH directly when the requested output format
/// already matches: manifests are fetched and rewritten so every segment
/// URL becomes a short opaque proxy id, segment bytes are cached with LRU
/// eviction.
pub struct PassthroughProvider {
    client: reqwest::Client,
    upstream: Url,
    format: OutputFormat,
    config: PassthroughConfig,
    state: Mutex<PassthroughState>,
}

/// Short opaque id for an upstream URL; opacity prevents URL injection and
/// double resolution
pub fn opaque_id(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..8])
}

impl PassthroughProvider {
    pub fn new(upstream: Url, format: OutputFormat, config: PassthroughConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            upstream,
            format,
            config,
            state: Mutex::new(PassthroughState {
                manifest: None,
                last_refresh: None,
                id_to_url: HashMap::new(),
                cache: HashMap::new(),
                lru: VecDeque::new(),
            }),
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    async fn fetch(&self, url: &Url) -> Result<Bytes> {
        let rsp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| RelayError::UpstreamTransient(e.to_string()))?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(crate::error::classify_upstream_status(
                status.as_u16(),
                "passthrough fetch",
            )
            .into());
        }
        rsp.bytes()
            .await
            .map_err(|e| RelayError::UpstreamTransient(e.to_string()).into())
    }

    /// The rewritten manifest, refreshed at most once per
    /// `manifest_refresh_interval`
    pub async fn manifest(&self) -> Result<String> {
        {
            let state = self.state.lock().unwrap();
            if let (Some(manifest), Some(at)) = (&state.manifest, state.last_refresh) {
                if at.elapsed() < self.config.manifest_refresh_interval {
                    return Ok(manifest.clone());
                }
            }
        }

        let body = self.fetch(&self.upstream).await?;
        let rewritten = match self.format {
            OutputFormat::Dash => {
                let text = String::from_utf8_lossy(&body).into_owned();
                let mut state = self.state.lock().unwrap();
                rewrite_mpd(&text, &self.upstream, &mut state.id_to_url)
            }
            _ => self.rewrite_hls(&body).await?,
        };

        let mut state = self.state.lock().unwrap();
        state.manifest = Some(rewritten.clone());
        state.last_refresh = Some(Instant::now());
        Ok(rewritten)
    }

    async fn rewrite_hls(&self, body: &[u8]) -> Result<String> {
        let (_, playlist) = m3u8_rs::parse_playlist(body)
            .map_err(|e| anyhow::anyhow!("failed to parse upstream playlist: {e}"))?;
        match playlist {
            m3u8_rs::Playlist::MediaPlaylist(pl) => {
                let mut state = self.state.lock().unwrap();
                Ok(rewrite_media_playlist(pl, &self.upstream, &mut state.id_to_url))
            }
            m3u8_rs::Playlist::MasterPlaylist(master) => {
                // follow the first variant and serve its media playlist
                let variant = master
                    .variants
                    .first()
                    .context("upstream master playlist has no variants")?;
                let variant_url = self
                    .upstream
                    .join(&variant.uri)
                    .context("resolving variant uri")?;
                debug!("following master playlist variant {}", variant_url);
                let body = self.fetch(&variant_url).await?;
                let (_, nested) = m3u8_rs::parse_playlist(&body)
                    .map_err(|e| anyhow::anyhow!("failed to parse variant playlist: {e}"))?;
                match nested {
                    m3u8_rs::Playlist::MediaPlaylist(pl) => {
                        let mut state = self.state.lock().unwrap();
                        Ok(rewrite_media_playlist(pl, &variant_url, &mut state.id_to_url))
                    }
                    m3u8_rs::Playlist::MasterPlaylist(_) => {
                        anyhow::bail!("nested master playlists are not supported")
                    }
                }
            }
        }
    }

    /// Bytes for a previously-advertised proxy id
    pub async fn segment(&self, id: &str) -> Result<Bytes> {
        let (url, cached) = {
            let mut state = self.state.lock().unwrap();
            let Some(url) = state.id_to_url.get(id).cloned() else {
                return Err(RelayError::NotFound.into());
            };
            let cached = state.cache.get(id).cloned();
            if cached.is_some() {
                // refresh LRU position
                state.lru.retain(|k| k != id);
                state.lru.push_back(id.to_string());
            }
            (url, cached)
        };
        if let Some(data) = cached {
            return Ok(data);
        }

        let url: Url = url.parse().context("stored upstream url")?;
        let data = self.fetch(&url).await.map_err(|e| {
            warn!("passthrough segment fetch failed: {:#}", e);
            e
        })?;

        let mut state = self.state.lock().unwrap();
        state.cache.insert(id.to_string(), data.clone());
        state.lru.push_back(id.to_string());
        while state.lru.len() > self.config.max_cached_segments {
            if let Some(evicted) = state.lru.pop_front() {
                state.cache.remove(&evicted);
            }
        }
        Ok(data)
    }

    pub fn cached_segments(&self) -> usize {
        self.state.lock().unwrap().cache.len()
    }
}

fn map_url(raw: &str, base: &Url, ids: &mut HashMap<String, String>) -> String {
    let absolute = match base.join(raw) {
        Ok(u) => u.to_string(),
        Err(_) => raw.to_string(),
    };
    let id = opaque_id(&absolute);
    ids.insert(id.clone(), absolute);
    id
}

fn rewrite_media_playlist(
    mut pl: m3u8_rs::MediaPlaylist,
    base: &Url,
    ids: &mut HashMap<String, String>,
) -> String {
    for seg in &mut pl.segments {
        let id = map_url(&seg.uri, base, ids);
        seg.uri = format!("?format=hls&seg={id}");
        if let Some(map) = &mut seg.map {
            let id = map_url(&map.uri, base, ids);
            map.uri = format!("?format=hls&init={id}");
        }
    }
    let mut out = Vec::new();
    pl.write_to(&mut out).expect("playlist render");
    String::from_utf8(out).expect("playlist utf8")
}

/// Rewrite `initialization="..."`, `media="..."` and `sourceURL="..."`
/// attributes to proxy ids and drop `<BaseURL>` elements so nothing is
/// resolved twice.
fn rewrite_mpd(body: &str, base: &Url, ids: &mut HashMap<String, String>) -> String {
    let without_base = strip_base_url(body);
    let mut out = without_base.as_str();
    let mut result = String::with_capacity(out.len());
    const ATTRS: [&str; 3] = ["initialization=\"", "media=\"", "sourceURL=\""];
    loop {
        let hit = ATTRS
            .iter()
            .filter_map(|a| out.find(a).map(|pos| (pos, *a)))
            .min_by_key(|(pos, _)| *pos);
        let Some((pos, attr)) = hit else {
            result.push_str(out);
            return result;
        };
        let value_start = pos + attr.len();
        let Some(value_len) = out[value_start..].find('"') else {
            result.push_str(out);
            return result;
        };
        let value = &out[value_start..value_start + value_len];
        let id = map_url(value, base, ids);
        let kind = if attr.starts_with("initialization") || attr.starts_with("sourceURL") {
            "init"
        } else {
            "seg"
        };
        result.push_str(&out[..value_start]);
        result.push_str(&format!("?format=dash&amp;{kind}={id}"));
        out = &out[value_start + value_len..];
    }
}

fn strip_base_url(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(open) = rest.find("<BaseURL") {
        out.push_str(&rest[..open]);
        match rest[open..].find("</BaseURL>") {
            Some(close) => rest = &rest[open + close + "</BaseURL>".len()..],
            None => {
                // self-closing or malformed; drop to the end of the tag
                match rest[open..].find('>') {
                    Some(end) => rest = &rest[open + end + 1..],
                    None => return out,
                }
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://upstream.example/streams/ch1/index.m3u8").unwrap()
    }

    #[test]
    fn test_opaque_ids_are_stable_and_short() {
        let a = opaque_id("http://x/seg1.ts");
        let b = opaque_id("http://x/seg1.ts");
        let c = opaque_id("http://x/seg2.ts");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_media_playlist_rewrite() {
        let body = b"#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:10\n#EXTINF:6.0,\nseg10.ts\n#EXTINF:6.0,\nhttp://cdn.example/abs/seg11.ts\n";
        let (_, pl) = m3u8_rs::parse_playlist(body).unwrap();
        let m3u8_rs::Playlist::MediaPlaylist(pl) = pl else {
            panic!("expected media playlist");
        };
        let mut ids = HashMap::new();
        let rewritten = rewrite_media_playlist(pl, &base(), &mut ids);

        assert!(!rewritten.contains("seg10.ts"), "upstream names hidden");
        assert!(!rewritten.contains("cdn.example"));
        assert_eq!(rewritten.matches("?format=hls&seg=").count(), 2);
        assert_eq!(ids.len(), 2);
        // relative URI resolved against the playlist location
        assert!(ids
            .values()
            .any(|u| u == "http://upstream.example/streams/ch1/seg10.ts"));
        assert!(ids.values().any(|u| u == "http://cdn.example/abs/seg11.ts"));
    }

    #[test]
    fn test_mpd_rewrite_and_baseurl_strip() {
        let body = r#"<?xml version="1.0"?>
<MPD><BaseURL>http://cdn.example/other/</BaseURL>
<SegmentTemplate initialization="init.mp4" media="chunk-$Number$.m4s"/>
<SegmentURL media="seg1.m4s"/>
</MPD>"#;
        let mut ids = HashMap::new();
        let rewritten = rewrite_mpd(body, &base(), &mut ids);
        assert!(!rewritten.contains("BaseURL"));
        assert!(rewritten.contains("initialization=\"?format=dash&amp;init="));
        assert_eq!(rewritten.matches("?format=dash&amp;seg=").count(), 2);
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_segment_id_is_not_found() {
        let provider = PassthroughProvider::new(
            base(),
            OutputFormat::HlsTs,
            PassthroughConfig::default(),
        );
        let err = provider.segment("deadbeef").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::NotFound)
        ));
    }

    #[test]
    fn test_strip_base_url_self_closing() {
        let body = "<MPD><BaseURL/>rest</MPD>";
        assert_eq!(strip_base_url(body), "<MPD>rest</MPD>");
    }
}
