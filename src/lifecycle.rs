//! 控制面进程的生命周期：
//! `stopped -> starting -> running -> (stopping -> stopped | crashed)`.
//! 是否在运行以进程表为准。

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::LifecycleConfig;
use crate::error::{Error, Result};
use crate::inspector::{LaunchSpec, ProcessEntry, ProcessInspector, ServiceLauncher, SignalKind};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped { count: usize },
    NotRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlPlaneStatus {
    pub state: LifecycleState,
    pub is_running: bool,
    pub pid: Option<u32>,
    pub service_url: String,
    pub monitor_running: bool,
    pub transcoder_processes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoFixReport {
    pub control_plane_restarted: bool,
    pub monitor_restarted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub final_status: ControlPlaneStatus,
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LifecycleManager {
    config: LifecycleConfig,
    service_url: String,
    inspector: Arc<dyn ProcessInspector>,
    launcher: Arc<dyn ServiceLauncher>,
    state: parking_lot::Mutex<LifecycleState>,
    /// Set by an explicit `stop()`; the watchdog leaves such an instance down.
    stopped_by_operator: AtomicBool,
    ops: tokio::sync::Mutex<()>,
    monitor: parking_lot::Mutex<Option<MonitorHandle>>,
}

impl LifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        service_url: impl Into<String>,
        inspector: Arc<dyn ProcessInspector>,
        launcher: Arc<dyn ServiceLauncher>,
    ) -> Self {
        Self {
            config,
            service_url: service_url.into(),
            inspector,
            launcher,
            state: parking_lot::Mutex::new(LifecycleState::Stopped),
            stopped_by_operator: AtomicBool::new(false),
            ops: tokio::sync::Mutex::new(()),
            monitor: parking_lot::Mutex::new(None),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock() = state;
    }

    pub async fn is_running(&self) -> bool {
        self.pid().await.is_some()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inspector.find_by_name(&self.config.match_pattern).await
    }

    pub async fn start(&self) -> Result<StartOutcome> {
        let _guard = self.ops.lock().await;
        self.start_locked().await
    }

    pub async fn stop(&self) -> Result<StopOutcome> {
        let _guard = self.ops.lock().await;
        let outcome = self.stop_locked().await?;
        if matches!(outcome, StopOutcome::Stopped { .. }) {
            self.stopped_by_operator.store(true, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    /// 先停止再启动
    pub async fn restart(&self) -> Result<StartOutcome> {
        let _guard = self.ops.lock().await;
        match self.stop_locked().await {
            Ok(StopOutcome::NotRunning) => info!("control-plane not running, starting fresh"),
            Ok(StopOutcome::Stopped { count }) => info!(count, "control-plane stopped for restart"),
            Err(e) => warn!(error = %e, "stop before restart failed, starting anyway"),
        }
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<StartOutcome> {
        if let Some(pid) = self.pid().await {
            info!(pid, "control-plane already running");
            self.set_state(LifecycleState::Running);
            self.stopped_by_operator.store(false, Ordering::SeqCst);
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        self.set_state(LifecycleState::Starting);
        let spec = LaunchSpec {
            program: self.config.program.clone(),
            args: self.config.args.clone(),
            working_dir: self.config.working_dir.as_ref().map(PathBuf::from),
        };

        if let Err(e) = self.launcher.launch(&spec).await {
            error!(error = %e, "failed to launch control-plane");
            self.set_state(LifecycleState::Stopped);
            return Err(e);
        }

        tokio::time::sleep(self.config.settle()).await;

        match self.pid().await {
            Some(pid) => {
                info!(pid, "control-plane started");
                self.set_state(LifecycleState::Running);
                self.stopped_by_operator.store(false, Ordering::SeqCst);
                Ok(StartOutcome::Started { pid })
            }
            None => {
                error!("control-plane exited right after launch");
                self.set_state(LifecycleState::Stopped);
                Err(Error::ProcessStartFailed(
                    "control-plane not running after launch".to_string(),
                ))
            }
        }
    }

    async fn stop_locked(&self) -> Result<StopOutcome> {
        let targets = self.inspector.find_all(&self.config.match_pattern).await;
        if targets.is_empty() {
            self.set_state(LifecycleState::Stopped);
            return Ok(StopOutcome::NotRunning);
        }

        self.set_state(LifecycleState::Stopping);
        for process in &targets {
            self.inspector.signal(process.pid, SignalKind::Terminate).await;
        }
        tokio::time::sleep(self.config.stop_wait()).await;

        let survivors = self.inspector.find_all(&self.config.match_pattern).await;
        if !survivors.is_empty() {
            warn!(count = survivors.len(), "control-plane ignored SIGTERM, killing");
            for process in &survivors {
                self.inspector.signal(process.pid, SignalKind::Kill).await;
            }
            tokio::time::sleep(self.config.kill_wait()).await;

            let remaining = self.inspector.find_all(&self.config.match_pattern).await;
            if !remaining.is_empty() {
                self.set_state(LifecycleState::Running);
                let pids: Vec<String> = remaining.iter().map(|p| p.pid.to_string()).collect();
                return Err(Error::ProcessStopFailed(pids.join(", ")));
            }
        }

        info!(count = targets.len(), "control-plane stopped");
        self.set_state(LifecycleState::Stopped);
        Ok(StopOutcome::Stopped {
            count: targets.len(),
        })
    }

    /// 启动看门狗，已在运行时返回 `false`
    pub fn start_monitor(self: &Arc<Self>) -> bool {
        let mut slot = self.monitor.lock();
        if slot.as_ref().is_some_and(|m| !m.task.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move { manager.watch(token).await });

        *slot = Some(MonitorHandle { cancel, task });
        info!(interval_secs = self.config.monitor_interval_secs, "control-plane monitor started");
        true
    }

    pub fn stop_monitor(&self) -> bool {
        match self.monitor.lock().take() {
            Some(handle) => {
                handle.cancel.cancel();
                info!("control-plane monitor stopped");
                !handle.task.is_finished()
            }
            None => false,
        }
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .is_some_and(|m| !m.task.is_finished())
    }

    async fn watch(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.monitor_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.check_once().await;
        }
    }

    pub async fn check_once(&self) {
        let transcoders = self.transcoder_processes().await.len();
        if self.is_running().await {
            info!(transcoders, "control-plane healthy");
            return;
        }
        if self.stopped_by_operator.load(Ordering::SeqCst) {
            info!(transcoders, "control-plane stopped by operator, leaving it down");
            return;
        }

        warn!(transcoders, "control-plane not running, restarting");
        if self.state() == LifecycleState::Running {
            self.set_state(LifecycleState::Crashed);
        }
        if let Err(e) = self.start().await {
            error!(error = %e, "watchdog failed to restart control-plane");
        }
    }

    pub async fn transcoder_processes(&self) -> Vec<ProcessEntry> {
        self.inspector.find_all(&self.config.transcoder_pattern).await
    }

    /// Force-kills a transcoder process. Refuses pids that do not look like
    /// transcoders.
    pub async fn kill_transcoder(&self, pid: u32) -> Result<bool> {
        let known = self
            .transcoder_processes()
            .await
            .iter()
            .any(|p| p.pid == pid);
        if !known {
            return Err(Error::not_found("transcoder process", pid));
        }
        let delivered = self.inspector.signal(pid, SignalKind::Kill).await;
        info!(pid, delivered, "killed transcoder process");
        Ok(delivered)
    }

    pub async fn status(&self) -> ControlPlaneStatus {
        let pid = self.pid().await;
        let state = {
            let mut state = self.state.lock();
            *state = match (pid.is_some(), *state) {
                (true, LifecycleState::Stopped | LifecycleState::Crashed) => LifecycleState::Running,
                (false, LifecycleState::Running) => LifecycleState::Crashed,
                (_, current) => current,
            };
            *state
        };

        ControlPlaneStatus {
            state,
            is_running: pid.is_some(),
            pid,
            service_url: self.service_url.clone(),
            monitor_running: self.monitor_running(),
            transcoder_processes: self.transcoder_processes().await.len(),
        }
    }

    /// 一键修复：拉起控制面和看门狗
    pub async fn auto_fix(self: &Arc<Self>) -> AutoFixReport {
        let mut error = None;
        let control_plane_restarted = if self.is_running().await {
            false
        } else {
            match self.start().await {
                Ok(StartOutcome::Started { .. }) => true,
                Ok(StartOutcome::AlreadyRunning { .. }) => false,
                Err(e) => {
                    error = Some(e.to_string());
                    false
                }
            }
        };
        let monitor_restarted = self.start_monitor();

        AutoFixReport {
            control_plane_restarted,
            monitor_restarted,
            error,
            final_status: self.status().await,
        }
    }
}
