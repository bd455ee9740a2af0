//! Narrow view of the OS process table: find processes by command-line
//! fragment, signal them, launch detached services. Lifecycle logic only
//! talks to these traits so it can run against a fake process table.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Terminate,
    Kill,
}

#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Every process whose command line contains `pattern`.
    async fn find_all(&self, pattern: &str) -> Vec<ProcessEntry>;

    /// `true` when the signal was delivered.
    async fn signal(&self, pid: u32, kind: SignalKind) -> bool;

    async fn find_by_name(&self, pattern: &str) -> Option<u32> {
        self.find_all(pattern).await.first().map(|p| p.pid)
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    /// Starts the service in the background and returns its pid.
    async fn launch(&self, spec: &LaunchSpec) -> Result<u32>;
}

/// Real process table via `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInspector;

#[async_trait]
impl ProcessInspector for SystemInspector {
    async fn find_all(&self, pattern: &str) -> Vec<ProcessEntry> {
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || scan(&pattern))
            .await
            .unwrap_or_default()
    }

    async fn signal(&self, pid: u32, kind: SignalKind) -> bool {
        tokio::task::spawn_blocking(move || deliver(pid, kind))
            .await
            .unwrap_or(false)
    }
}

fn scan(pattern: &str) -> Vec<ProcessEntry> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::everything());
    let own_pid = sysinfo::get_current_pid().ok();

    let mut found: Vec<ProcessEntry> = sys
        .processes()
        .iter()
        .filter(|(pid, _)| Some(**pid) != own_pid)
        .filter_map(|(pid, process)| {
            let command = process
                .cmd()
                .iter()
                .map(|part| part.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            command.contains(pattern).then(|| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                command,
            })
        })
        .collect();

    found.sort_by_key(|p| p.pid);
    debug!(pattern, matches = found.len(), "process scan");
    found
}

fn deliver(pid: u32, kind: SignalKind) -> bool {
    let mut sys = System::new();
    let target = Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

    let Some(process) = sys.process(target) else {
        return false;
    };
    match kind {
        SignalKind::Terminate => process.kill_with(Signal::Term).unwrap_or(false),
        SignalKind::Kill => process.kill_with(Signal::Kill).unwrap_or_else(|| process.kill()),
    }
}

#[async_trait]
impl ServiceLauncher for SystemInspector {
    async fn launch(&self, spec: &LaunchSpec) -> Result<u32> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::ProcessStartFailed(format!("{}: {e}", spec.program)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::ProcessStartFailed(format!("{} exited immediately", spec.program)))?;

        info!(pid, program = %spec.program, "launched service");
        Ok(pid)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeProcessTable;
    use super::*;

    #[tokio::test]
    async fn scan_never_reports_our_own_process() {
        let me = std::process::id();
        let found = SystemInspector.find_all("").await;
        assert!(found.iter().all(|p| p.pid != me));
    }

    #[tokio::test]
    async fn signalling_a_missing_pid_fails() {
        assert!(!SystemInspector.signal(u32::MAX - 1, SignalKind::Terminate).await);
    }

    #[tokio::test]
    async fn fake_table_finds_by_fragment() {
        let table = FakeProcessTable::default();
        let pid = table.add("gunicorn --bind 0.0.0.0:5000 app:app");
        table.add("ffmpeg -i http://x -f mp3 -");
        assert_eq!(table.find_by_name("gunicorn --bind").await, Some(pid));
        assert_eq!(table.find_all("ffmpeg").await.len(), 1);
        assert!(table.find_by_name("nginx").await.is_none());
    }
}
