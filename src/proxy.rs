//! Signed-link HLS proxy. Playlists are rewritten so segment URIs come
//! back through the relay with the caller's own signed query.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::cache::HlsCache;
use crate::catalog::{Channel, ChannelCatalog};
use crate::config::{DirectMode, ProxyConfig, ServerConfig};
use crate::control::{ControlClient, Urgency};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::playlist::rewrite_segments;
use crate::signing::{unix_now, SignedRequest, UrlSigner};
use crate::supervisor::{self, Flow};

const LIVE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    RetrySuccess,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::RetrySuccess => "RETRY-SUCCESS",
        }
    }
}

#[derive(Debug)]
pub enum StreamReply {
    Playlist { body: String, cache: CacheStatus },
    Segment { body: Bytes, cache: CacheStatus },
    Redirect(String),
    /// Local transcoder output, chunk by chunk.
    Live { content_type: String, chunks: mpsc::Receiver<Bytes> },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlayTicket {
    pub play_url: String,
    pub channel_id: i64,
    pub channel_title: String,
    pub expires_at: i64,
    pub proxy_enabled: bool,
    pub logo: Option<String>,
}

enum Fetched {
    Body(Bytes),
    NotFound,
    Status(u16),
}

pub struct HlsProxy {
    signer: UrlSigner,
    control: Arc<ControlClient>,
    catalog: Arc<dyn ChannelCatalog>,
    engine: Arc<Engine>,
    cache: Arc<HlsCache>,
    config: ProxyConfig,
    public_base_url: String,
    url_ttl_secs: u64,
    direct_mode: DirectMode,
}

impl HlsProxy {
    pub fn new(
        server: &ServerConfig,
        config: ProxyConfig,
        control: Arc<ControlClient>,
        catalog: Arc<dyn ChannelCatalog>,
        engine: Arc<Engine>,
        cache: Arc<HlsCache>,
    ) -> Result<Self> {
        Ok(Self {
            signer: UrlSigner::new(server.signing_key.as_bytes())?,
            control,
            catalog,
            engine,
            cache,
            config,
            public_base_url: server.public_base_url.trim_end_matches('/').to_string(),
            url_ttl_secs: server.url_ttl_secs,
            direct_mode: server.direct_mode,
        })
    }

    /// `{public_base_url}/api/stream?channel_id=..&timestamp=..&signature=..&hls=1`
    pub fn stream_url(&self, channel_id: i64, issued_at: i64, signature: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("channel_id", &channel_id.to_string())
            .append_pair("timestamp", &issued_at.to_string())
            .append_pair("signature", signature)
            .append_pair("hls", "1")
            .finish();
        format!("{}/api/stream?{}", self.public_base_url, query)
    }

    /// Signs a fresh playback link and warms the channel's worker in the
    /// background.
    pub async fn issue_play_url(&self, channel_id: i64) -> Result<PlayTicket> {
        let channel = self.playable_channel(channel_id).await?;

        if !self.control.is_available().await {
            error!(channel_id, "control-plane unavailable, refusing play url");
            return Err(Error::BackendUnavailable {
                attempts: 1,
                last: "health check failed".to_string(),
            });
        }

        self.prewarm(&channel);

        let issued_at = unix_now();
        let signature = self.signer.sign(channel_id, issued_at);
        info!(channel_id, title = %channel.title, "issued play url");

        Ok(PlayTicket {
            play_url: self.stream_url(channel_id, issued_at, &signature),
            channel_id,
            channel_title: channel.title,
            expires_at: issued_at + self.url_ttl_secs as i64,
            proxy_enabled: channel.proxy_enabled,
            logo: channel.logo_url,
        })
    }

    pub async fn handle(&self, request: &SignedRequest) -> Result<StreamReply> {
        request.authenticate(&self.signer, unix_now(), self.url_ttl_secs)?;
        let channel_id = request.channel_id;

        if !request.wants_hls {
            let channel = self.channel(channel_id).await?;
            return self.direct(&channel).await;
        }

        match &request.segment {
            Some(segment) => self.segment(channel_id, segment).await,
            None => {
                let channel = self.channel(channel_id).await?;
                self.ensure_running(&channel).await;
                self.playlist(request).await
            }
        }
    }

    /// Segment fetch for the `/api/segment/{name}` alias route.
    pub async fn handle_segment(&self, request: &SignedRequest, segment: &str) -> Result<StreamReply> {
        request.authenticate(&self.signer, unix_now(), self.url_ttl_secs)?;
        self.segment(request.channel_id, segment).await
    }

    async fn channel(&self, channel_id: i64) -> Result<Channel> {
        self.catalog
            .find(channel_id)
            .await
            .ok_or_else(|| Error::not_found("channel", channel_id))
    }

    async fn playable_channel(&self, channel_id: i64) -> Result<Channel> {
        let channel = self.channel(channel_id).await?;
        if !channel.is_playable() {
            return Err(Error::ChannelUnavailable(channel_id));
        }
        Ok(channel)
    }

    fn prewarm(&self, channel: &Channel) {
        let control = self.control.clone();
        let channel_id = channel.id;
        let source_url = channel.stream_url.clone();
        tokio::spawn(async move {
            match control.query_worker(channel_id).await {
                Some(record) if record.is_running() => {
                    debug!(channel_id, "worker already running, skipping prewarm");
                }
                _ => match control.start_worker(channel_id, &source_url).await {
                    Ok(_) => info!(channel_id, "worker prewarmed"),
                    Err(e) => warn!(channel_id, error = %e, "worker prewarm failed"),
                },
            }
        });
    }

    /// `Ok(true)` when a worker had to be started.
    async fn start_if_needed(&self, channel: &Channel) -> Result<bool> {
        if let Some(record) = self.control.query_worker_with(Urgency::Interactive, channel.id).await {
            if record.is_running() {
                return Ok(false);
            }
        }
        info!(channel_id = channel.id, "worker not running, starting");
        self.control
            .start_worker_with(Urgency::Interactive, channel.id, &channel.stream_url)
            .await?;
        Ok(true)
    }

    /// Failures are logged only; the playlist fetch reports what matters.
    async fn ensure_running(&self, channel: &Channel) {
        match self.start_if_needed(channel).await {
            Ok(true) => tokio::time::sleep(Duration::from_millis(self.config.start_grace_ms)).await,
            Ok(false) => {}
            Err(e) => warn!(channel_id = channel.id, error = %e, "failed to ensure worker"),
        }
    }

    async fn playlist(&self, request: &SignedRequest) -> Result<StreamReply> {
        let channel_id = request.channel_id;
        let proxy_base = self.stream_url(channel_id, request.issued_at, &request.signature);

        // The raw upstream body is cached; each caller gets links carrying
        // their own signature.
        if let Some(raw) = self.cache.playlists.get(&channel_id) {
            return self.rewritten(&raw, &proxy_base, CacheStatus::Hit);
        }

        let url = self.control.playlist_url(channel_id);
        let timeout = Duration::from_millis(self.config.playlist_timeout_ms);
        match self.fetch(&url, timeout).await? {
            Fetched::Body(raw) => {
                let reply = self.rewritten(&raw, &proxy_base, CacheStatus::Miss)?;
                self.cache.playlists.insert(channel_id, raw);
                Ok(reply)
            }
            Fetched::NotFound => self.playlist_retry(channel_id, &url, &proxy_base).await,
            Fetched::Status(status) => {
                error!(channel_id, status, "playlist fetch failed");
                Err(Error::BackendError {
                    code: status as i64,
                    message: format!("playlist fetch returned HTTP {status}"),
                })
            }
        }
    }

    /// One delayed retry for a worker that has not written its playlist yet.
    async fn playlist_retry(&self, channel_id: i64, url: &str, proxy_base: &str) -> Result<StreamReply> {
        let delay = Duration::from_millis(self.config.not_ready_delay_ms);
        info!(channel_id, "playlist not ready, retrying once");
        tokio::time::sleep(delay).await;

        let timeout = Duration::from_millis(self.config.playlist_retry_timeout_ms);
        match self.fetch(url, timeout).await {
            Ok(Fetched::Body(raw)) => {
                let reply = self.rewritten(&raw, proxy_base, CacheStatus::RetrySuccess)?;
                self.cache.playlists.insert(channel_id, raw);
                Ok(reply)
            }
            Ok(_) | Err(_) => Err(Error::WorkerNotReady {
                channel_id,
                retry_after: delay,
            }),
        }
    }

    fn rewritten(&self, raw: &Bytes, proxy_base: &str, cache: CacheStatus) -> Result<StreamReply> {
        let body = rewrite_segments(raw, proxy_base)?;
        Ok(StreamReply::Playlist { body, cache })
    }

    async fn segment(&self, channel_id: i64, segment: &str) -> Result<StreamReply> {
        let key = (channel_id, segment.to_string());
        if let Some(body) = self.cache.segments.get(&key) {
            return Ok(StreamReply::Segment {
                body,
                cache: CacheStatus::Hit,
            });
        }

        let url = self.control.segment_url(channel_id, segment);
        let timeout = Duration::from_millis(self.config.segment_timeout_ms);
        match self.fetch(&url, timeout).await {
            Ok(Fetched::Body(body)) => {
                self.cache.segments.insert(key, body.clone());
                Ok(StreamReply::Segment {
                    body,
                    cache: CacheStatus::Miss,
                })
            }
            Ok(_) => Err(Error::not_found("segment", segment)),
            Err(e) => {
                warn!(channel_id, segment, error = %e, "segment fetch failed");
                Err(Error::not_found("segment", segment))
            }
        }
    }

    async fn direct(&self, channel: &Channel) -> Result<StreamReply> {
        match self.direct_mode {
            DirectMode::Remote => {
                if self.start_if_needed(channel).await? {
                    tokio::time::sleep(Duration::from_millis(self.config.direct_start_wait_ms)).await;
                }
                let url = self.control.raw_stream_url(channel.id);
                info!(channel_id = channel.id, url = %url, "redirecting to raw stream");
                Ok(StreamReply::Redirect(url))
            }
            DirectMode::Local => self.live(channel).await,
        }
    }

    /// Pipes the local transcoder to the caller. The first spawn happens
    /// here so a broken transcoder is reported instead of an empty body.
    async fn live(&self, channel: &Channel) -> Result<StreamReply> {
        self.engine.start(channel.id, &channel.stream_url).await?;

        let (tx, rx) = mpsc::channel::<Bytes>(LIVE_BUFFER);
        let engine = self.engine.clone();
        let channel_id = channel.id;
        let source_url = channel.stream_url.clone();
        tokio::spawn(async move {
            let result = supervisor::stream_loop(&engine, channel_id, &source_url, move |chunk| {
                match tx.try_send(chunk) {
                    Ok(()) => Flow::Continue,
                    // Slow listener: drop the chunk, keep the stream live.
                    Err(TrySendError::Full(_)) => Flow::Continue,
                    Err(TrySendError::Closed(_)) => Flow::Stop,
                }
            })
            .await;
            match result {
                Ok(()) => info!(channel_id, "listener disconnected"),
                Err(e) => error!(channel_id, error = %e, "live stream ended"),
            }
        });

        let content_type = mime_guess::from_ext(&self.engine.config().format)
            .first_or_octet_stream()
            .to_string();
        Ok(StreamReply::Live {
            content_type,
            chunks: rx,
        })
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Fetched> {
        let resp = self.control.http().get(url).timeout(timeout).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(Fetched::Body(resp.bytes().await?));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Fetched::NotFound);
        }
        Ok(Fetched::Status(status.as_u16()))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::control::testing::{dead_base_url, spawn, FakeControlPlane};
    use std::sync::atomic::Ordering;
    use crate::config::{ControlPlaneConfig, TranscoderConfig};

    fn ready_fake() -> Arc<FakeControlPlane> {
        let fake = Arc::new(FakeControlPlane::default());
        *fake.playlist.lock() = PLAYLIST.to_string();
        fake.ready.store(true, Ordering::SeqCst);
        fake
    }

    #[tokio::test]
    async fn playlist_miss_then_hit_with_callers_signature() {
        let fake = ready_fake();
        let proxy = proxy(spawn(fake.clone()).await);

        let first = signed(42, true, None);
        let StreamReply::Playlist { body, cache } = proxy.handle(&first).await.unwrap() else {
            panic!("expected playlist");
        };
        assert_eq!(cache, CacheStatus::Miss);
        let base = proxy.stream_url(42, first.issued_at, &first.signature);
        assert!(body.contains(&format!("{base}&segment=seg1.ts")));
        assert!(body.contains(&format!("{base}&segment=seg2.ts")));
        assert_eq!(FakeControlPlane::calls(&fake.start_calls), 1);

        let second = SignedRequest {
            signature: "f".repeat(64),
            ..first.clone()
        };
        assert!(matches!(proxy.handle(&second).await, Err(Error::SignatureInvalid)));

        let StreamReply::Playlist { cache, body: again } = proxy.handle(&first).await.unwrap() else {
            panic!("expected playlist");
        };
        assert_eq!(cache, CacheStatus::Hit);
        assert_eq!(again, body);
        assert_eq!(FakeControlPlane::calls(&fake.playlist_calls), 1);
        // Worker was running by then; no second start.
        assert_eq!(FakeControlPlane::calls(&fake.start_calls), 1);
    }

    #[tokio::test]
    async fn missing_playlist_reports_not_ready() {
        let fake = Arc::new(FakeControlPlane::default());
        let proxy = proxy(spawn(fake.clone()).await);

        let err = proxy.handle(&signed(42, true, None)).await.unwrap_err();
        match err {
            Error::WorkerNotReady { channel_id, retry_after } => {
                assert_eq!(channel_id, 42);
                assert_eq!(retry_after, Duration::from_millis(200));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(FakeControlPlane::calls(&fake.playlist_calls), 2);
        assert_eq!(proxy.cache.playlists.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_control_plane_still_yields_not_ready_promptly() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.hang.store(true, Ordering::SeqCst);
        // Production defaults: 30 s timeout, 3 attempts.
        let control = ControlClient::new(&ControlPlaneConfig {
            base_url: spawn(fake.clone()).await,
            ..ControlPlaneConfig::default()
        })
        .unwrap();
        let proxy = proxy_over(control, DirectMode::Remote, TranscoderConfig::default());

        let started = tokio::time::Instant::now();
        let err = proxy.handle(&signed(42, true, None)).await.unwrap_err();
        assert!(matches!(err, Error::WorkerNotReady { channel_id: 42, .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn unparseable_playlist_is_an_error_and_not_cached() {
        let fake = Arc::new(FakeControlPlane::default());
        *fake.playlist.lock() = "<html>upstream exploded</html>".to_string();
        fake.ready.store(true, Ordering::SeqCst);
        let proxy = proxy(spawn(fake.clone()).await);

        let err = proxy.handle(&signed(42, true, None)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPlaylist(_)));
        assert_eq!(proxy.cache.playlists.len(), 0);
    }

    #[tokio::test]
    async fn segments_are_cached_and_missing_ones_404() {
        let fake = ready_fake();
        let proxy = proxy(spawn(fake.clone()).await);

        for expected in [CacheStatus::Miss, CacheStatus::Hit] {
            let StreamReply::Segment { body, cache } =
                proxy.handle(&signed(42, true, Some("seg1.ts"))).await.unwrap()
            else {
                panic!("expected segment");
            };
            assert_eq!(cache, expected);
            assert_eq!(&body[..], b"TS:seg1.ts");
        }
        assert_eq!(FakeControlPlane::calls(&fake.segment_calls), 1);
        assert_eq!(FakeControlPlane::calls(&fake.start_calls), 0);

        let err = proxy.handle(&signed(42, true, Some("missing1.ts"))).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "segment", .. }));
    }

    #[tokio::test]
    async fn direct_remote_redirects_to_raw_stream() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.workers.lock().insert("42".to_string(), "running".to_string());
        let base = spawn(fake.clone()).await;
        let proxy = proxy(base.clone());

        let reply = proxy.handle(&signed(42, false, None)).await.unwrap();
        assert!(matches!(reply, StreamReply::Redirect(url) if url == format!("{base}/stream/42")));
        assert_eq!(FakeControlPlane::calls(&fake.start_calls), 0);
    }

    #[tokio::test]
    async fn direct_remote_start_failure_is_an_error() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.reject_start.store(true, Ordering::SeqCst);
        let proxy = proxy(spawn(fake).await);

        let err = proxy.handle(&signed(42, false, None)).await.unwrap_err();
        assert!(matches!(err, Error::BackendError { code: 500, .. }));
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let proxy = proxy(spawn(ready_fake()).await);
        let err = proxy.handle(&signed(99, true, None)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "channel", .. }));
    }

    #[tokio::test]
    async fn play_url_is_signed_and_checks_channel() {
        let fake = Arc::new(FakeControlPlane::default());
        let proxy = proxy(spawn(fake.clone()).await);

        let ticket = proxy.issue_play_url(42).await.unwrap();
        assert_eq!(ticket.channel_id, 42);
        assert_eq!(ticket.channel_title, "Channel 42");
        assert!(ticket.proxy_enabled);

        let url = url::Url::parse(&ticket.play_url).unwrap();
        assert_eq!(url.path(), "/api/stream");
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["hls"], "1");
        let issued_at: i64 = pairs["timestamp"].parse().unwrap();
        assert_eq!(ticket.expires_at, issued_at + 3600);
        let signer = UrlSigner::new(KEY.as_bytes()).unwrap();
        assert!(signer.verify(42, issued_at, &pairs["signature"]));

        assert!(matches!(proxy.issue_play_url(43).await, Err(Error::ChannelUnavailable(43))));
        assert!(matches!(proxy.issue_play_url(7).await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn play_url_refused_when_control_plane_is_down() {
        let proxy = proxy(dead_base_url().await);
        assert!(matches!(
            proxy.issue_play_url(42).await,
            Err(Error::BackendUnavailable { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn direct_local_pipes_transcoder_output() {
        let proxy = proxy_with(
            dead_base_url().await,
            DirectMode::Local,
            crate::engine::testing::config(),
        );
        let mut channel = channel(42);
        channel.stream_url = "http://src/forever".to_string();

        let StreamReply::Live { content_type, mut chunks } = proxy.live(&channel).await.unwrap() else {
            panic!("expected live stream");
        };
        assert_eq!(content_type, "audio/mpeg");
        let first = tokio::time::timeout(Duration::from_secs(5), chunks.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!first.is_empty());
        drop(chunks);
    }
}
