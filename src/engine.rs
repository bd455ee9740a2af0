use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TranscoderConfig;
use crate::error::{Error, Result};
use crate::retry::StreamBackoff;

const STDERR_TAIL_LINES: usize = 200;
const CHUNK_SIZE: usize = 16 * 1024;
const OUTPUT_BUFFER: usize = 256;
const STREAM_INFO_TIMEOUT: Duration = Duration::from_secs(15);
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failure(String),
    /// Terminated on request; listeners should end.
    Stopped,
    /// Terminated so it can be replaced; listeners should reconnect.
    Recycled,
}

/// 运行中的转码进程 (stdout 广播给所有订阅者，stderr 仅用于诊断)
#[derive(Debug)]
pub struct TranscoderHandle {
    pub channel_id: i64,
    pub pid: Option<u32>,
    pub source_url: String,
    pub started_at: Instant,
    output: broadcast::Sender<Bytes>,
    exit: watch::Receiver<Option<ExitOutcome>>,
    cancel: CancellationToken,
    stop_reason: Arc<Mutex<Option<ExitOutcome>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

pub struct TranscoderOutput {
    pub chunks: broadcast::Receiver<Bytes>,
    pub exit: watch::Receiver<Option<ExitOutcome>>,
}

impl TranscoderHandle {
    pub fn subscribe(&self) -> TranscoderOutput {
        TranscoderOutput {
            chunks: self.output.subscribe(),
            exit: self.exit.clone(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit.borrow().clone()
    }

    pub fn listeners(&self) -> usize {
        self.output.receiver_count()
    }

    fn terminate(&self, reason: ExitOutcome) {
        self.stop_reason.lock().get_or_insert(reason);
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BinaryCheck {
    pub binary: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscoderInfo {
    pub channel_id: i64,
    pub pid: Option<u32>,
    pub source_url: String,
    pub alive: bool,
    pub uptime_secs: u64,
    pub listeners: usize,
}

type Slot = Arc<tokio::sync::Mutex<Option<Arc<TranscoderHandle>>>>;

/// 本地转码进程表，每个频道一个槽位，槽位各自加锁
pub struct Engine {
    config: TranscoderConfig,
    slots: DashMap<i64, Slot>,
}

impl Engine {
    pub fn new(config: TranscoderConfig) -> Self {
        Self {
            config,
            slots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    pub fn backoff(&self) -> StreamBackoff {
        StreamBackoff {
            max_retries: self.config.max_retries,
            cap: Duration::from_secs(self.config.max_backoff_secs),
        }
    }

    pub fn max_silence(&self) -> Duration {
        Duration::from_secs(self.config.max_silence_secs)
    }

    fn slot(&self, channel_id: i64) -> Slot {
        self.slots.entry(channel_id).or_default().clone()
    }

    fn existing_slot(&self, channel_id: i64) -> Option<Slot> {
        self.slots.get(&channel_id).map(|s| s.clone())
    }

    /// Arguments for `<ffmpeg> -i <src> -c:a <codec> -b:a <bitrate> -f <format> -`.
    pub fn command_args(&self, source_url: &str) -> Vec<String> {
        vec![
            "-i".to_string(),
            source_url.to_string(),
            "-c:a".to_string(),
            self.config.codec.clone(),
            "-b:a".to_string(),
            self.config.bitrate.clone(),
            "-f".to_string(),
            self.config.format.clone(),
            "-".to_string(),
        ]
    }

    /// 启动指定频道的转码任务
    ///
    /// # 错误处理
    /// - 内存不足时返回错误
    /// - FFmpeg 启动失败时返回错误
    pub async fn start(&self, channel_id: i64, source_url: &str) -> Result<Arc<TranscoderHandle>> {
        let slot = self.slot(channel_id);
        let mut current = slot.lock().await;

        if let Some(handle) = current.as_ref() {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
        }

        self.check_memory()?;
        let handle = Arc::new(self.spawn(channel_id, source_url)?);
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// 停止指定频道的转码任务，未在运行时返回 `false`
    pub async fn stop(&self, channel_id: i64) -> bool {
        let Some(slot) = self.existing_slot(channel_id) else {
            return false;
        };
        let mut current = slot.lock().await;
        match current.take() {
            Some(handle) if handle.is_alive() => {
                handle.terminate(ExitOutcome::Stopped);
                info!(channel_id, pid = ?handle.pid, "transcoder stopped");
                true
            }
            _ => false,
        }
    }

    /// Stops `handle` only if it is still the registered transcoder for its
    /// channel; a newer process is left alone.
    pub async fn stop_handle(&self, handle: &Arc<TranscoderHandle>) -> bool {
        if self.take_if_current(handle).await {
            handle.terminate(ExitOutcome::Stopped);
            info!(channel_id = handle.channel_id, pid = ?handle.pid, "transcoder stopped");
            return true;
        }
        false
    }

    /// Kills `handle` so it can be replaced, if it is still the registered
    /// transcoder for its channel.
    pub async fn recycle(&self, handle: &Arc<TranscoderHandle>) -> bool {
        if self.take_if_current(handle).await {
            handle.terminate(ExitOutcome::Recycled);
            info!(channel_id = handle.channel_id, pid = ?handle.pid, "transcoder recycled");
            return true;
        }
        false
    }

    async fn take_if_current(&self, handle: &Arc<TranscoderHandle>) -> bool {
        let Some(slot) = self.existing_slot(handle.channel_id) else {
            return false;
        };
        let mut current = slot.lock().await;
        if current.as_ref().is_some_and(|h| Arc::ptr_eq(h, handle)) {
            current.take();
            return true;
        }
        false
    }

    pub async fn is_running(&self, channel_id: i64) -> bool {
        match self.existing_slot(channel_id) {
            Some(slot) => slot.lock().await.as_ref().is_some_and(|h| h.is_alive()),
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<TranscoderInfo> {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(h) = slot.lock().await.as_ref() {
                out.push(TranscoderInfo {
                    channel_id: h.channel_id,
                    pid: h.pid,
                    source_url: h.source_url.clone(),
                    alive: h.is_alive(),
                    uptime_secs: h.started_at.elapsed().as_secs(),
                    listeners: h.listeners(),
                });
            }
        }
        out.sort_by_key(|i| i.channel_id);
        out
    }

    pub async fn logs(&self, channel_id: i64, lines: usize) -> Vec<String> {
        let Some(slot) = self.existing_slot(channel_id) else {
            return Vec::new();
        };
        let current = slot.lock().await;
        current
            .as_ref()
            .map(|h| {
                let tail = h.stderr_tail.lock();
                tail.iter().skip(tail.len().saturating_sub(lines)).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// 清理已退出的进程
    pub async fn cleanup_idle(&self) -> usize {
        let slots: Vec<(i64, Slot)> = self
            .slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut cleaned = 0;
        for (channel_id, slot) in slots {
            let mut current = slot.lock().await;
            if current.as_ref().is_some_and(|h| !h.is_alive()) {
                current.take();
                cleaned += 1;
                info!(channel_id, "cleaned up exited transcoder");
            }
        }

        // Empty slots nobody else holds can go.
        self.slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map(|g| g.is_some()).unwrap_or(true)
        });
        cleaned
    }

    pub async fn stop_all(&self) -> usize {
        let ids: Vec<i64> = self.slots.iter().map(|e| *e.key()).collect();
        let mut stopped = 0;
        for id in ids {
            if self.stop(id).await {
                stopped += 1;
            }
        }
        info!(stopped, "all transcoders stopped");
        stopped
    }

    /// 用 ffprobe 探测源格式
    pub async fn stream_info(&self, source_url: &str) -> Result<Value> {
        let mut cmd = Command::new(&self.config.ffprobe_binary);
        cmd.args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(source_url)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(STREAM_INFO_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::ProcessStalled(STREAM_INFO_TIMEOUT.as_secs()))?
            .map_err(|e| Error::ProcessStartFailed(format!("{}: {e}", self.config.ffprobe_binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ProcessExitedAbnormally(format!(
                "ffprobe {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// 检查 FFmpeg 是否可用
    pub async fn check_binary(&self) -> BinaryCheck {
        let binary = self.config.ffmpeg_binary.clone();
        let mut cmd = Command::new(&binary);
        cmd.arg("-version").stdin(Stdio::null()).kill_on_drop(true);

        let (version, error) = match tokio::time::timeout(VERSION_TIMEOUT, cmd.output()).await {
            Err(_) => (None, Some(format!("no answer within {}s", VERSION_TIMEOUT.as_secs()))),
            Ok(Err(e)) => (None, Some(e.to_string())),
            Ok(Ok(output)) if !output.status.success() => (None, Some(format!("exited with {}", output.status))),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                (Some(stdout.lines().next().unwrap_or_default().trim().to_string()), None)
            }
        };

        match &error {
            Some(e) => warn!(binary, error = %e, "transcoder binary unavailable"),
            None => debug!(binary, version = ?version, "transcoder binary available"),
        }
        BinaryCheck {
            binary,
            available: error.is_none(),
            version,
            error,
        }
    }

    fn check_memory(&self) -> Result<()> {
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < self.config.min_free_memory_kb => Err(Error::ProcessStartFailed(
                format!("insufficient system memory ({} KB available)", mem.avail),
            )),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Failed to check memory usage: {}", e);
                Ok(())
            }
        }
    }

    fn spawn(&self, channel_id: i64, source_url: &str) -> Result<TranscoderHandle> {
        let mut cmd = Command::new(&self.config.ffmpeg_binary);
        cmd.args(self.command_args(source_url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!(channel_id, "Failed to spawn transcoder: {}", e);
            Error::ProcessStartFailed(format!("{}: {e}", self.config.ffmpeg_binary))
        })?;
        let pid = child.id();

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => return Err(Error::ProcessStartFailed("transcoder pipes unavailable".to_string())),
        };

        let (output, _) = broadcast::channel(OUTPUT_BUFFER);
        let (exit_tx, exit) = watch::channel(None);
        let cancel = CancellationToken::new();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stop_reason = Arc::new(Mutex::new(None));

        let handle = TranscoderHandle {
            channel_id,
            pid,
            source_url: source_url.to_string(),
            started_at: Instant::now(),
            output: output.clone(),
            exit,
            cancel: cancel.clone(),
            stop_reason: stop_reason.clone(),
            stderr_tail: stderr_tail.clone(),
        };

        let pipes = [
            tokio::spawn(pump_stdout(stdout, output)),
            tokio::spawn(pump_stderr(channel_id, stderr, stderr_tail)),
        ];
        tokio::spawn(wait_for_exit(channel_id, child, pipes, cancel, exit_tx, stop_reason));

        info!(channel_id, pid = ?pid, source_url, "transcoder started");
        Ok(handle)
    }
}

async fn pump_stdout(mut stdout: ChildStdout, output: broadcast::Sender<Bytes>) {
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    loop {
        buf.reserve(CHUNK_SIZE);
        match stdout.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // No subscribers is fine; the chunk is dropped.
                let _ = output.send(buf.split().freeze());
            }
            Err(e) => {
                warn!(error = %e, "transcoder stdout read failed");
                break;
            }
        }
    }
}

async fn pump_stderr(channel_id: i64, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(channel_id, "transcoder: {}", line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

async fn wait_for_exit(
    channel_id: i64,
    mut child: Child,
    pipes: [JoinHandle<()>; 2],
    cancel: CancellationToken,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    stop_reason: Arc<Mutex<Option<ExitOutcome>>>,
) {
    let (outcome, killed) = tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => (ExitOutcome::Success, false),
            Ok(status) => (ExitOutcome::Failure(status.to_string()), false),
            Err(e) => (ExitOutcome::Failure(e.to_string()), false),
        },
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(channel_id, error = %e, "failed to kill transcoder");
            }
            (stop_reason.lock().take().unwrap_or(ExitOutcome::Stopped), true)
        }
    };

    // On a natural exit everything already written reaches listeners and the
    // log tail first. A killed process may leave grandchildren holding the
    // pipes, so its readers are dropped instead.
    for pipe in pipes {
        if killed {
            pipe.abort();
        }
        let _ = pipe.await;
    }
    debug!(channel_id, ?outcome, "transcoder exited");
    exit_tx.send_replace(Some(outcome));
}
