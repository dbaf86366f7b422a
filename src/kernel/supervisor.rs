use crate::error::ManagerError;
use crate::kernel::logs::RollingLog;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Grace period between SIGTERM and SIGKILL.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// How long after spawn we watch for an instant exit before declaring the
/// process running.
const SPAWN_SETTLE: Duration = Duration::from_millis(300);
const STDERR_TAIL_LINES: usize = 20;

struct Managed {
    child: Child,
    pid: u32,
}

/// Owns the one managed kernel child process. Only the supervisor may signal
/// it.
pub struct Supervisor {
    binary: PathBuf,
    config_path: Mutex<PathBuf>,
    log: Arc<RollingLog>,
    inner: Mutex<Option<Managed>>,
    stderr_tail: Arc<std::sync::Mutex<VecDeque<String>>>,
}

impl Supervisor {
    pub fn new(binary: PathBuf, config_path: PathBuf, log: Arc<RollingLog>) -> Self {
        Self {
            binary,
            config_path: Mutex::new(config_path),
            log,
            inner: Mutex::new(None),
            stderr_tail: Arc::new(std::sync::Mutex::new(VecDeque::new())),
        }
    }

    /// Path used on the next `start`/`restart`.
    pub async fn set_config_path(&self, path: PathBuf) {
        *self.config_path.lock().await = path;
    }

    /// Spawn the kernel with the current config file. Idempotent: returns
    /// success when already running.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        if let Some(managed) = inner.as_mut() {
            if managed.child.try_wait().ok().flatten().is_none() {
                return Ok(());
            }
            // Stale entry: the child exited behind our back.
            warn!("supervisor: kernel exited unexpectedly, pid={}", managed.pid);
            *inner = None;
        }

        let config_path = self.config_path.lock().await.clone();
        self.stderr_tail.lock().expect("tail mutex poisoned").clear();

        let mut child = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ManagerError::Fatal(format!("spawn {}: {}", self.binary.display(), e))
            })?;

        let pid = child.id().ok_or_else(|| {
            ManagerError::Fatal("kernel exited before a pid was observed".to_string())
        })?;

        self.tee_output(&mut child);

        // A kernel with a bad config dies within milliseconds; catch that
        // here so the caller gets the stderr tail instead of a dead child.
        tokio::time::sleep(SPAWN_SETTLE).await;
        if let Ok(Some(status)) = child.try_wait() {
            let tail = self.stderr_tail_string();
            return Err(ManagerError::Broken(format!(
                "kernel exited immediately, status={}, stderr: {}",
                status, tail
            )));
        }

        info!("supervisor: kernel started, pid={}, config={}", pid, config_path.display());
        *inner = Some(Managed { child, pid });
        metrics::gauge!("manager_kernel_running").set(1.0);
        Ok(())
    }

    /// SIGTERM, wait up to 5 s, escalate to SIGKILL. Clears the PID.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        let Some(mut managed) = inner.take() else {
            return Ok(());
        };

        let pid = managed.pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("supervisor: SIGTERM failed, pid={}, error={}", pid, e);
        }

        match tokio::time::timeout(STOP_TIMEOUT, managed.child.wait()).await {
            Ok(Ok(status)) => {
                info!("supervisor: kernel stopped, pid={}, status={}", pid, status);
            }
            Ok(Err(e)) => {
                warn!("supervisor: wait failed, pid={}, error={}", pid, e);
            }
            Err(_) => {
                warn!("supervisor: kernel ignored SIGTERM, killing, pid={}", pid);
                let _ = managed.child.start_kill();
                let _ = managed.child.wait().await;
            }
        }

        metrics::gauge!("manager_kernel_running").set(0.0);
        Ok(())
    }

    /// `stop` then `start`. A restart that fails to come back up leaves the
    /// supervisor stopped.
    pub async fn restart(&self) -> Result<(), ManagerError> {
        self.stop().await?;
        self.start().await
    }

    /// Best-effort in-place SIGHUP; a kernel that exits on the signal is
    /// restarted instead.
    pub async fn reload(&self) -> Result<(), ManagerError> {
        let pid = match self.pid().await {
            Some(pid) => pid,
            None => return Err(ManagerError::Unavailable("kernel not running".to_string())),
        };

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
            warn!("supervisor: SIGHUP failed, pid={}, error={}", pid, e);
            return self.restart().await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        if self.is_running().await {
            info!("supervisor: kernel reloaded in place, pid={}", pid);
            Ok(())
        } else {
            info!("supervisor: kernel exited on SIGHUP, restarting");
            self.restart().await
        }
    }

    pub async fn is_running(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.as_mut() {
            Some(managed) => match managed.child.try_wait() {
                Ok(None) => true,
                _ => {
                    *inner = None;
                    metrics::gauge!("manager_kernel_running").set(0.0);
                    false
                }
            },
            None => false,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        let mut inner = self.inner.lock().await;
        match inner.as_mut() {
            Some(managed) => {
                if managed.child.try_wait().ok().flatten().is_none() {
                    Some(managed.pid)
                } else {
                    None
                }
            }
            None => None,
        }
    }

    /// First line of `<binary> version`.
    pub async fn version(&self) -> Result<String, ManagerError> {
        let output = Command::new(&self.binary)
            .arg("version")
            .output()
            .await
            .map_err(|e| ManagerError::Unavailable(format!("kernel version: {}", e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    fn tee_output(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let log = self.log.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log.write_line(&line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let log = self.log.clone();
            let tail = self.stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    {
                        let mut tail = tail.lock().expect("tail mutex poisoned");
                        if tail.len() >= STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                    }
                    log.write_line(&line);
                }
            });
        }
    }

    fn stderr_tail_string(&self) -> String {
        let tail = self.stderr_tail.lock().expect("tail mutex poisoned");
        if tail.is_empty() {
            "<empty>".to_string()
        } else {
            tail.iter().cloned().collect::<Vec<_>>().join(" | ")
        }
    }
}

/// Run `<binary> check -c <config>` and surface the kernel's own syntax
/// verdict. Used by the apply path before a restart.
pub async fn check_config(binary: &std::path::Path, config: &std::path::Path) -> Result<(), ManagerError> {
    let output = Command::new(binary)
        .arg("check")
        .arg("-c")
        .arg(config)
        .output()
        .await
        .map_err(|e| ManagerError::Unavailable(format!("kernel check: {}", e)))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("supervisor: config check failed: {}", stderr.trim());
        Err(ManagerError::Broken(format!(
            "kernel rejected config: {}",
            stderr.trim()
        )))
    }
}
