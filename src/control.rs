//! Client for the transcoding control-plane.
//!
//! Responses are `{ "code": int, "message": string, "data": any? }`
//! envelopes, final even when `code` is an error. A 2xx body without one is
//! rejected; socket errors, timeouts and other non-envelope bodies are
//! retried. Reads degrade to empty results, writes surface the backend's
//! message.

use parking_lot::Mutex;
use reqwest::Method;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ControlPlaneConfig;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Error,
    Stopped,
    #[serde(other)]
    Unknown,
}

/// Local read view of a worker owned by the control-plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    #[serde(deserialize_with = "int_or_string")]
    pub channel_id: i64,
    #[serde(default)]
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub last_activity_time: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub hls_output_dir: Option<String>,
}

impl WorkerRecord {
    pub fn is_running(&self) -> bool {
        self.status == WorkerStatus::Running
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerList {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub processes: Vec<WorkerRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerLogs {
    #[serde(default, deserialize_with = "int_or_string")]
    pub channel_id: i64,
    #[serde(default)]
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StopAllReport {
    pub stopped: Vec<i64>,
    pub failed: Vec<StopFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopFailure {
    pub channel_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHistory {
    #[serde(default)]
    pub recent_errors: Vec<Value>,
    #[serde(default)]
    pub statistics: Value,
}

/// How long a caller can afford to wait on the control-plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// Operator and background work: full timeout, retried.
    Background,
    /// A listener is waiting: short timeout, one attempt.
    Interactive,
}

/// Parsed control-plane response envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl Envelope {
    fn from_value(value: &Value) -> Option<Self> {
        let code = value.get("code")?.as_i64()?;
        let message = value.get("message")?.as_str()?.to_string();
        let data = value.get("data").filter(|d| !d.is_null()).cloned();
        Some(Self {
            code,
            message,
            data,
        })
    }

    fn into_error(self) -> Error {
        Error::BackendError {
            code: self.code,
            message: self.message,
        }
    }

    fn data_as<T: for<'de> Deserialize<'de>>(self) -> Result<T> {
        Ok(serde_json::from_value(self.data.unwrap_or(Value::Null))?)
    }
}

pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    interactive_timeout: Duration,
    health_timeout: Duration,
    health_ok_ttl: Duration,
    health_fail_ttl: Duration,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    availability: Mutex<Option<(bool, Instant)>>,
}

impl ControlClient {
    pub fn new(config: &ControlPlaneConfig) -> Result<Self> {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(config: &ControlPlaneConfig, sleeper: Arc<dyn Sleeper>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("fm-relay/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(20)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            interactive_timeout: Duration::from_millis(config.interactive_timeout_ms),
            health_timeout: Duration::from_secs(config.health_timeout_secs),
            health_ok_ttl: Duration::from_secs(config.health_ok_ttl_secs),
            health_fail_ttl: Duration::from_secs(config.health_fail_ttl_secs),
            retry: RetryPolicy {
                attempts: config.retry_attempts,
                delay: Duration::from_millis(config.retry_delay_ms),
            },
            sleeper,
            availability: Mutex::new(None),
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn playlist_url(&self, channel_id: i64) -> String {
        format!("{}/hls/{}/playlist.m3u8", self.base_url, channel_id)
    }

    pub fn segment_url(&self, channel_id: i64, segment: &str) -> String {
        format!("{}/hls/{}/{}", self.base_url, channel_id, segment)
    }

    pub fn raw_stream_url(&self, channel_id: i64) -> String {
        format!("{}/stream/{}", self.base_url, channel_id)
    }

    // --- writes ---

    pub async fn start_worker(&self, channel_id: i64, source_url: &str) -> Result<WorkerRecord> {
        self.start_worker_with(Urgency::Background, channel_id, source_url).await
    }

    pub async fn start_worker_with(
        &self,
        urgency: Urgency,
        channel_id: i64,
        source_url: &str,
    ) -> Result<WorkerRecord> {
        let path = format!("/api/process/{channel_id}/start");
        info!(channel_id, source_url, ?urgency, "starting worker");

        let envelope = self
            .request_with(urgency, Method::POST, &path, &[], Some(json!({ "stream_url": source_url })))
            .await?;

        match envelope.code {
            200 => envelope.data_as(),
            // Already running; hand back the live record.
            409 => match self.query_worker_with(urgency, channel_id).await {
                Some(record) => Ok(record),
                None => Err(envelope.into_error()),
            },
            _ => Err(envelope.into_error()),
        }
    }

    /// `Ok(None)` when there was nothing to stop.
    pub async fn stop_worker(&self, channel_id: i64) -> Result<Option<WorkerRecord>> {
        let path = format!("/api/process/{channel_id}/stop");
        info!(channel_id, "stopping worker");

        let envelope = self.request(Method::POST, &path, &[], None).await?;
        match envelope.code {
            200 => Ok(envelope
                .data
                .and_then(|d| serde_json::from_value::<WorkerRecord>(d).ok())),
            404 => Ok(None),
            _ => Err(envelope.into_error()),
        }
    }

    pub async fn trigger_recovery(&self, channel_id: i64) -> Result<Value> {
        let path = format!("/api/recovery/{channel_id}");
        let envelope = self
            .request(Method::POST, &path, &[], None)
            .await
            .inspect_err(|e| error!(channel_id, error = %e, "recovery request failed"))?;

        if envelope.code == 200 {
            Ok(envelope.data.unwrap_or(Value::Null))
        } else {
            error!(channel_id, code = envelope.code, message = %envelope.message, "recovery rejected");
            Err(envelope.into_error())
        }
    }

    /// Stops every worker the control-plane reports. Workers that vanish in
    /// between count as stopped.
    pub async fn stop_all_workers(&self) -> StopAllReport {
        let workers = self.list_workers().await;
        let mut report = StopAllReport::default();

        for worker in workers.processes {
            match self.stop_worker(worker.channel_id).await {
                Ok(_) => report.stopped.push(worker.channel_id),
                Err(e) => {
                    warn!(channel_id = worker.channel_id, error = %e, "failed to stop worker");
                    report.failed.push(StopFailure {
                        channel_id: worker.channel_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(stopped = report.stopped.len(), failed = report.failed.len(), "stop-all finished");
        report
    }

    pub async fn force_cleanup(&self) -> Result<String> {
        let envelope = self
            .request(Method::POST, "/api/cleanup", &[], None)
            .await
            .inspect_err(|e| error!(error = %e, "cleanup request failed"))?;

        if envelope.code == 200 {
            Ok(envelope.message)
        } else {
            error!(code = envelope.code, message = %envelope.message, "cleanup rejected");
            Err(envelope.into_error())
        }
    }

    // --- reads ---

    /// `None` when the worker does not exist or the control-plane cannot be
    /// reached.
    pub async fn query_worker(&self, channel_id: i64) -> Option<WorkerRecord> {
        self.query_worker_with(Urgency::Background, channel_id).await
    }

    pub async fn query_worker_with(&self, urgency: Urgency, channel_id: i64) -> Option<WorkerRecord> {
        let path = format!("/api/process/{channel_id}/status");
        match self.request_with(urgency, Method::GET, &path, &[], None).await {
            Ok(envelope) if envelope.code == 200 => match envelope.data_as() {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(channel_id, error = %e, "unreadable worker record");
                    None
                }
            },
            Ok(envelope) if envelope.code == 404 => None,
            Ok(envelope) => {
                warn!(channel_id, code = envelope.code, message = %envelope.message, "worker status query rejected");
                None
            }
            Err(e) => {
                error!(channel_id, error = %e, "worker status query failed");
                None
            }
        }
    }

    pub async fn list_workers(&self) -> WorkerList {
        self.read_or_default("/api/processes", &[]).await
    }

    pub async fn fetch_logs(&self, channel_id: i64, max_lines: u32) -> WorkerLogs {
        let path = format!("/api/process/{channel_id}/logs");
        let mut logs: WorkerLogs = self
            .read_or_default(&path, &[("lines", max_lines.to_string())])
            .await;
        logs.channel_id = channel_id;
        logs
    }

    pub async fn fetch_health(&self) -> Option<Value> {
        self.read_optional("/api/health").await
    }

    pub async fn fetch_service_status(&self) -> Option<Value> {
        self.read_optional("/api/status").await
    }

    pub async fn fetch_error_history(&self, window_minutes: u32) -> ErrorHistory {
        self.read_or_default("/api/errors", &[("minutes", window_minutes.to_string())])
            .await
    }

    pub async fn touch_activity(&self, channel_id: i64) -> bool {
        let path = format!("/api/process/{channel_id}/activity");
        match self.request(Method::POST, &path, &[], None).await {
            Ok(envelope) => envelope.code == 200,
            Err(e) => {
                error!(channel_id, error = %e, "activity update failed");
                false
            }
        }
    }

    /// Liveness check, cached longer after a success than after a failure.
    pub async fn is_available(&self) -> bool {
        if let Some((available, checked_at)) = *self.availability.lock() {
            let ttl = if available {
                self.health_ok_ttl
            } else {
                self.health_fail_ttl
            };
            if checked_at.elapsed() < ttl {
                return available;
            }
        }

        let url = format!("{}/api/processes", self.base_url);
        let available = match self.http.get(&url).timeout(self.health_timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "control-plane health check failed");
                false
            }
        };

        *self.availability.lock() = Some((available, Instant::now()));
        available
    }

    async fn read_optional(&self, path: &str) -> Option<Value> {
        match self.request(Method::GET, path, &[], None).await {
            Ok(envelope) if envelope.code == 200 => envelope.data,
            Ok(envelope) => {
                warn!(path, code = envelope.code, message = %envelope.message, "control-plane read rejected");
                None
            }
            Err(e) => {
                error!(path, error = %e, "control-plane read failed");
                None
            }
        }
    }

    async fn read_or_default<T>(&self, path: &str, query: &[(&str, String)]) -> T
    where
        T: Default + for<'de> Deserialize<'de>,
    {
        match self.request(Method::GET, path, query, None).await {
            Ok(envelope) if envelope.code == 200 => envelope.data_as().unwrap_or_else(|e| {
                warn!(path, error = %e, "unreadable control-plane payload");
                T::default()
            }),
            Ok(envelope) => {
                warn!(path, code = envelope.code, message = %envelope.message, "control-plane read rejected");
                T::default()
            }
            Err(e) => {
                error!(path, error = %e, "control-plane read failed");
                T::default()
            }
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Envelope> {
        self.request_with(Urgency::Background, method, path, query, body)
            .await
    }

    async fn request_with(
        &self,
        urgency: Urgency,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Envelope> {
        let url = format!("{}{}", self.base_url, path);
        let (timeout, retry) = match urgency {
            Urgency::Background => (self.timeout, self.retry.clone()),
            Urgency::Interactive => (
                self.interactive_timeout,
                RetryPolicy {
                    attempts: 1,
                    ..self.retry.clone()
                },
            ),
        };

        retry
            .run(self.sleeper.as_ref(), path, |attempt| {
                let mut req = self
                    .http
                    .request(method.clone(), &url)
                    .timeout(timeout)
                    .header(reqwest::header::ACCEPT, "application/json");
                if !query.is_empty() {
                    req = req.query(query);
                }
                if let Some(body) = &body {
                    req = req.json(body);
                }
                debug!(attempt, url = %url, "control-plane request");
                async move { exchange(req).await }
            })
            .await?
    }
}

/// One HTTP exchange. The outer `Err` means "retry": the request never got
/// a definitive answer.
async fn exchange(req: reqwest::RequestBuilder) -> std::result::Result<Result<Envelope>, String> {
    let resp = req.send().await.map_err(|e| e.to_string())?;
    let status = resp.status();
    let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
    let parsed = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| Envelope::from_value(&v));

    match parsed {
        Some(envelope) => Ok(Ok(envelope)),
        None if status.is_success() => Ok(Err(Error::BackendError {
            code: status.as_u16() as i64,
            message: "control-plane returned an invalid response format".to_string(),
        })),
        None => {
            let body = String::from_utf8_lossy(&bytes);
            let snippet: String = body.chars().take(200).collect();
            Err(format!("HTTP {status}: {snippet}"))
        }
    }
}

/// The control-plane echoes channel ids back from its URL path, so they can
/// arrive as strings.
fn int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
