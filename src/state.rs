use crate::cache::HlsCache;
use crate::catalog::{ChannelCatalog, StaticCatalog};
use crate::config::AppConfig;
use crate::control::ControlClient;
use crate::engine::Engine;
use crate::error::Result;
use crate::inspector::SystemInspector;
use crate::lifecycle::LifecycleManager;
use crate::proxy::HlsProxy;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    /// 签名链接 HLS 代理
    pub proxy: HlsProxy,
    pub catalog: Arc<dyn ChannelCatalog>,
    /// 控制面 API 客户端
    pub control: Arc<ControlClient>,
    /// 播放列表与切片缓存
    pub cache: Arc<HlsCache>,
    /// 本地转码进程表
    pub engine: Arc<Engine>,
    /// 控制面进程生命周期与看门狗
    pub lifecycle: Arc<LifecycleManager>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn build(config: AppConfig) -> Result<SharedState> {
        let control = Arc::new(ControlClient::new(&config.control_plane)?);
        let cache = Arc::new(HlsCache::new(
            Duration::from_millis(config.proxy.playlist_cache_ms),
            Duration::from_secs(config.proxy.segment_cache_secs),
        ));
        let engine = Arc::new(Engine::new(config.transcoder.clone()));
        let channels = StaticCatalog::new(config.channels.clone());
        info!(channels = channels.len(), "channel catalog loaded");
        let catalog: Arc<dyn ChannelCatalog> = Arc::new(channels);
        let proxy = HlsProxy::new(
            &config.server,
            config.proxy.clone(),
            control.clone(),
            catalog.clone(),
            engine.clone(),
            cache.clone(),
        )?;
        let lifecycle = Arc::new(LifecycleManager::new(
            config.lifecycle.clone(),
            config.control_plane.base_url.clone(),
            Arc::new(SystemInspector),
            Arc::new(SystemInspector),
        ));

        Ok(Arc::new(Self {
            config,
            proxy,
            catalog,
            control,
            cache,
            engine,
            lifecycle,
        }))
    }
}
