pub mod admin;
pub mod response;
pub mod stream;

use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

/// Public stream routes plus the operations API.
pub fn router(state: SharedState) -> Router {
    let public = Router::new()
        .route("/api/play/:id", get(stream::play)) // signed play URL
        .route("/api/stream", get(stream::stream).options(stream::preflight))
        .route("/api/segment/:name", get(stream::segment).options(stream::preflight));

    let workers = Router::new()
        .route("/", get(admin::list_workers))
        .route("/stop-all", post(admin::stop_all_workers))
        .route("/:id", get(admin::worker_status))
        .route("/:id/start", post(admin::start_worker))
        .route("/:id/stop", post(admin::stop_worker))
        .route("/:id/logs", get(admin::worker_logs))
        .route("/:id/recovery", post(admin::recover_worker))
        .route("/:id/activity", post(admin::touch_worker));

    let control_plane = Router::new()
        .route("/", get(admin::control_plane_status))
        .route("/start", post(admin::control_plane_start))
        .route("/stop", post(admin::control_plane_stop))
        .route("/restart", post(admin::control_plane_restart))
        .route("/auto-fix", post(admin::control_plane_auto_fix))
        .route("/monitor/start", post(admin::monitor_start))
        .route("/monitor/stop", post(admin::monitor_stop));

    let local = Router::new()
        .route("/", get(admin::list_local))
        .route("/cleanup", post(admin::cleanup_local))
        .route("/stop-all", post(admin::stop_all_local))
        .route("/stream-info", post(admin::stream_info))
        .route("/:id/start", post(admin::start_local))
        .route("/:id/stop", post(admin::stop_local))
        .route("/:id/logs", get(admin::local_logs));

    let ops = Router::new()
        .nest("/workers", workers)
        .nest("/control-plane", control_plane)
        .nest("/local", local)
        .route("/errors", get(admin::error_history))
        .route("/health", get(admin::health))
        .route("/cleanup", post(admin::force_cleanup))
        .route("/transcoders", get(admin::list_transcoder_processes))
        .route("/transcoders/check", get(admin::check_transcoder_binary))
        .route("/transcoders/:pid/kill", post(admin::kill_transcoder_process));

    Router::new()
        .merge(public)
        .nest("/admin", ops)
        .route("/sys/status", get(admin::sys_status)) // system status
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HlsCache;
    use crate::catalog::StaticCatalog;
    use crate::config::{AppConfig, DirectMode, TranscoderConfig};
    use crate::control::testing::{spawn, FakeControlPlane};
    use crate::control::ControlClient;
    use crate::engine::Engine;
    use crate::inspector::testing::FakeProcessTable;
    use crate::lifecycle::LifecycleManager;
    use crate::proxy::testing::{channel, server, signed, PLAYLIST};
    use crate::proxy::HlsProxy;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::response::Response;
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        fake: Arc<FakeControlPlane>,
        table: Arc<FakeProcessTable>,
    }

    async fn harness() -> Harness {
        let fake = Arc::new(FakeControlPlane::default());
        *fake.playlist.lock() = PLAYLIST.to_string();
        let base_url = spawn(fake.clone()).await;

        let mut config = AppConfig::parse("server:\n  listen: 127.0.0.1:0\n  signing_key: test-signing-key\n").unwrap();
        config.server = server(DirectMode::Remote);
        config.control_plane.base_url = base_url.clone();
        config.control_plane.retry_attempts = 1;
        config.channels = vec![channel(42)];

        let control = Arc::new(ControlClient::new(&config.control_plane).unwrap());
        let cache = Arc::new(HlsCache::new(Duration::from_secs(2), Duration::from_secs(60)));
        let engine = Arc::new(Engine::new(TranscoderConfig::default()));
        let catalog: Arc<dyn crate::catalog::ChannelCatalog> =
            Arc::new(StaticCatalog::new(config.channels.clone()));
        let proxy = HlsProxy::new(
            &config.server,
            config.proxy.clone(),
            control.clone(),
            catalog.clone(),
            engine.clone(),
            cache.clone(),
        )
        .unwrap();
        let table = Arc::new(FakeProcessTable::default());
        let lifecycle = Arc::new(LifecycleManager::new(
            config.lifecycle.clone(),
            base_url,
            table.clone(),
            table.clone(),
        ));

        let state = Arc::new(AppState {
            config,
            proxy,
            catalog,
            control,
            cache,
            engine,
            lifecycle,
        });
        Harness {
            app: router(state),
            fake,
            table,
        }
    }

    async fn send(app: &Router, method: Method, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn stream_uri(channel_id: i64, segment: Option<&str>) -> String {
        let req = signed(channel_id, true, segment);
        let mut uri = format!(
            "/api/stream?channel_id={}&timestamp={}&signature={}&hls=1",
            req.channel_id, req.issued_at, req.signature
        );
        if let Some(segment) = segment {
            uri.push_str("&segment=");
            uri.push_str(segment);
        }
        uri
    }

    #[tokio::test]
    async fn playlist_is_not_ready_then_served_rewritten() {
        let h = harness().await;
        let uri = stream_uri(42, None);

        let resp = send(&h.app, Method::GET, &uri).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = json(resp).await;
        assert_eq!(body["code"], 202);
        assert_eq!(body["retry_after"], 0.2);
        assert_eq!(body["channel_id"], 42);

        h.fake.ready.store(true, Ordering::SeqCst);
        let resp = send(&h.app, Method::GET, &uri).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/vnd.apple.mpegurl");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "max-age=3, must-revalidate");
        assert_eq!(resp.headers()["x-cache-status"], "MISS");
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let playlist = text(resp).await;
        let base = uri.split("?").nth(1).unwrap();
        assert!(playlist.contains(&format!("http://relay.test/api/stream?{base}&segment=seg1.ts")));
        assert!(playlist.contains(&format!("http://relay.test/api/stream?{base}&segment=seg2.ts")));

        let resp = send(&h.app, Method::GET, &uri).await;
        assert_eq!(resp.headers()["x-cache-status"], "HIT");
        // Worker was started once, by the first request.
        assert_eq!(FakeControlPlane::calls(&h.fake.start_calls), 1);
    }

    #[tokio::test]
    async fn segments_are_served_from_cache() {
        let h = harness().await;
        let uri = stream_uri(42, Some("seg1.ts"));

        let resp = send(&h.app, Method::GET, &uri).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/MP2T");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "public, max-age=60");
        assert_eq!(resp.headers()["x-cache-status"], "MISS");
        assert_eq!(text(resp).await, "TS:seg1.ts");

        let resp = send(&h.app, Method::GET, &uri).await;
        assert_eq!(resp.headers()["x-cache-status"], "HIT");
        assert_eq!(FakeControlPlane::calls(&h.fake.segment_calls), 1);

        let req = signed(42, true, None);
        let alias = format!(
            "/api/segment/seg1.ts?channel_id=42&timestamp={}&signature={}",
            req.issued_at, req.signature
        );
        let resp = send(&h.app, Method::GET, &alias).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-cache-status"], "HIT");
    }

    #[tokio::test]
    async fn rejects_bad_links() {
        let h = harness().await;

        let resp = send(&h.app, Method::GET, "/api/stream?channel_id=abc&timestamp=1&signature=x").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(resp).await["code"], 400);

        let forged = format!("/api/stream?channel_id=42&timestamp={}&signature={}&hls=1", signing_now(), "0".repeat(64));
        let resp = send(&h.app, Method::GET, &forged).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = send(&h.app, Method::GET, &stream_uri(42, Some("../etc.ts"))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(&h.app, Method::GET, &stream_uri(42, Some("missing1.ts"))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(FakeControlPlane::calls(&h.fake.start_calls), 0);
    }

    fn signing_now() -> i64 {
        crate::signing::unix_now()
    }

    #[tokio::test]
    async fn preflight_is_no_content_with_cors() {
        let h = harness().await;
        let resp = send(&h.app, Method::OPTIONS, "/api/stream").await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_METHODS], "GET, OPTIONS");
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
            "Content-Type, Authorization"
        );
    }

    #[tokio::test]
    async fn play_endpoint_returns_envelope() {
        let h = harness().await;
        let resp = send(&h.app, Method::GET, "/api/play/42").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["code"], 200);
        assert_eq!(body["message"], "success");
        assert_eq!(body["data"]["channel_id"], 42);
        assert!(body["data"]["play_url"]
            .as_str()
            .unwrap()
            .starts_with("http://relay.test/api/stream?channel_id=42&"));

        let resp = send(&h.app, Method::GET, "/api/play/7").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = send(&h.app, Method::GET, "/api/play/x").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_worker_routes_proxy_the_control_plane() {
        let h = harness().await;

        let resp = send(&h.app, Method::POST, "/admin/workers/42/start").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["data"]["status"], "running");

        let resp = send(&h.app, Method::GET, "/admin/workers").await;
        assert_eq!(json(resp).await["data"]["total"], 1);

        let resp = send(&h.app, Method::GET, "/admin/workers/42/logs?lines=2").await;
        assert_eq!(json(resp).await["data"]["logs"][1], "line 2");

        let resp = send(&h.app, Method::POST, "/admin/workers/42/stop").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["data"]["stopped"], true);
        assert_eq!(body["data"]["worker"]["channel_id"], 42);

        let resp = send(&h.app, Method::POST, "/admin/workers/42/stop").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["data"]["channel_id"], 42);
        assert_eq!(body["data"]["stopped"], false);

        let resp = send(&h.app, Method::POST, "/admin/workers/7/start").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        send(&h.app, Method::POST, "/admin/workers/42/start").await;
        let resp = send(&h.app, Method::POST, "/admin/workers/stop-all").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["data"]["stopped"], serde_json::json!([42]));
        assert!(h.fake.workers.lock().is_empty());

        let resp = send(&h.app, Method::POST, "/admin/cleanup").await;
        assert_eq!(json(resp).await["data"]["message"], "Cleanup completed");
    }

    #[tokio::test]
    async fn admin_control_plane_routes_drive_lifecycle() {
        let h = harness().await;

        let resp = send(&h.app, Method::GET, "/admin/control-plane").await;
        let body = json(resp).await;
        assert_eq!(body["data"]["is_running"], false);
        assert_eq!(body["data"]["state"], "stopped");

        let pid = h.table.add("ffmpeg -i http://x -f mp3 -");
        let resp = send(&h.app, Method::GET, "/admin/transcoders").await;
        assert_eq!(json(resp).await["data"][0]["pid"], pid);

        let resp = send(&h.app, Method::POST, &format!("/admin/transcoders/{pid}/kill")).await;
        assert_eq!(json(resp).await["data"]["killed"], true);
        let resp = send(&h.app, Method::POST, &format!("/admin/transcoders/{pid}/kill")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(&h.app, Method::POST, "/admin/control-plane/stop").await;
        assert_eq!(json(resp).await["data"]["outcome"], "not_running");

        let resp = send(&h.app, Method::GET, "/admin/transcoders/check").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["data"]["binary"], "ffmpeg");
        assert!(body["data"]["available"].is_boolean());
    }

    #[tokio::test]
    async fn admin_local_routes_report_empty_registry() {
        let h = harness().await;
        let resp = send(&h.app, Method::GET, "/admin/local").await;
        assert_eq!(json(resp).await["data"], Value::Array(vec![]));

        let resp = send(&h.app, Method::POST, "/admin/local/42/stop").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(&h.app, Method::POST, "/admin/local/stop-all").await;
        assert_eq!(json(resp).await["data"]["stopped"], 0);
    }

    #[tokio::test]
    async fn sys_status_reports_host_and_relay() {
        let h = harness().await;
        let resp = send(&h.app, Method::GET, "/sys/status").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert!(body["host"].get("mem_total_mb").is_some());
        assert_eq!(body["relay"]["local_transcoders"], 0);
        assert_eq!(body["relay"]["cached_playlists"], 0);
        assert_eq!(body["relay"]["control_plane_state"], "stopped");
        assert_eq!(body["relay"]["monitor_running"], false);
    }
}
