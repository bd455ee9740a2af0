use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::catalog::Channel;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,

    /// 对外可访问的地址，用于生成播放链接
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// 签名链接的 HMAC 密钥
    pub signing_key: String,

    #[serde(default = "default_url_ttl")]
    pub url_ttl_secs: u64,

    /// What `hls=false` requests get: a redirect to the control-plane's raw
    /// stream, or the local transcoder's stdout piped through.
    #[serde(default)]
    pub direct_mode: DirectMode,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DirectMode {
    #[default]
    Remote,
    Local,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub base_url: String,
    /// 单次请求超时 (秒)
    pub timeout_secs: u64,
    /// 播放请求路径上的超时，只尝试一次 (毫秒)
    pub interactive_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub health_ok_ttl_secs: u64,
    pub health_fail_ttl_secs: u64,
    pub health_timeout_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            timeout_secs: 30,
            interactive_timeout_ms: 2000,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            health_ok_ttl_secs: 30,
            health_fail_ttl_secs: 10,
            health_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    pub playlist_timeout_ms: u64,
    pub playlist_retry_timeout_ms: u64,
    pub segment_timeout_ms: u64,
    pub start_grace_ms: u64,
    /// Pause before the single not-ready playlist retry; also the
    /// `retry_after` hint handed to players.
    pub not_ready_delay_ms: u64,
    pub direct_start_wait_ms: u64,
    pub playlist_cache_ms: u64,
    pub segment_cache_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            playlist_timeout_ms: 2000,
            playlist_retry_timeout_ms: 1000,
            segment_timeout_ms: 2000,
            start_grace_ms: 500,
            not_ready_delay_ms: 200,
            direct_start_wait_ms: 2000,
            playlist_cache_ms: 2000,
            segment_cache_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TranscoderConfig {
    pub ffmpeg_binary: String,
    pub ffprobe_binary: String,
    pub codec: String,
    pub bitrate: String,
    pub format: String,
    /// 无输出超过该时长则重启转码 (秒)
    pub max_silence_secs: u64,
    /// 最大重试次数
    pub max_retries: u32,
    pub max_backoff_secs: u64,
    pub restart_pause_ms: u64,
    /// 可用内存低于该值时拒绝启动 (KB)
    pub min_free_memory_kb: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: "ffmpeg".to_string(),
            ffprobe_binary: "ffprobe".to_string(),
            codec: "libmp3lame".to_string(),
            bitrate: "128k".to_string(),
            format: "mp3".to_string(),
            max_silence_secs: 30,
            max_retries: 5,
            max_backoff_secs: 5,
            restart_pause_ms: 500,
            min_free_memory_kb: 5120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Control-plane launcher and its arguments (worker pool settings).
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub match_pattern: String,
    /// Command-line fragment identifying transcoder processes.
    pub transcoder_pattern: String,
    pub settle_ms: u64,
    pub stop_wait_ms: u64,
    pub kill_wait_ms: u64,
    pub monitor_interval_secs: u64,
    pub monitor_on_boot: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            program: "gunicorn".to_string(),
            args: vec![
                "--bind".to_string(),
                "0.0.0.0:5000".to_string(),
                "--workers".to_string(),
                "4".to_string(),
                "--timeout".to_string(),
                "3600".to_string(),
                "app:app".to_string(),
            ],
            working_dir: None,
            match_pattern: "gunicorn --bind 0.0.0.0:5000".to_string(),
            transcoder_pattern: "ffmpeg".to_string(),
            settle_ms: 3000,
            stop_wait_ms: 2000,
            kill_wait_ms: 1000,
            monitor_interval_secs: 60,
            monitor_on_boot: false,
        }
    }
}

impl LifecycleConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_url_ttl() -> u64 {
    3600
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        if config.server.signing_key.trim().is_empty() {
            anyhow::bail!("server.signing_key must not be empty");
        }
        Ok(config)
    }
}
