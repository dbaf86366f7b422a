use crate::error::ManagerError;
use crate::events::{topic, Event, EventBus};
use crate::kernel::config::build_probe_config;
use crate::kernel::logs::RollingLog;
use crate::store::{Node, UnsupportedNode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Readiness poll: 50 × 100 ms.
const READY_ATTEMPTS: u32 = 50;
const READY_INTERVAL: Duration = Duration::from_millis(100);
/// Outer HTTP budget per delay check; the per-request probe budget rides
/// inside it as a query parameter.
const CHECK_OUTER_TIMEOUT: Duration = Duration::from_secs(7);
/// Parallel `check` ceiling.
const CHECK_FANOUT: usize = 50;

/// A running probe the verifier can direct checks at.
#[derive(Debug, Clone)]
pub struct ProbeSession {
    pub control_port: u16,
    pub tags: Vec<String>,
    pub broken: Vec<UnsupportedNode>,
}

/// Startup failure that still carries the broken-candidate list so the
/// caller can archive them.
#[derive(Debug)]
pub struct ProbeStartError {
    pub broken: Vec<UnsupportedNode>,
    pub error: ManagerError,
}

impl std::fmt::Display for ProbeStartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// Probing capability consumed by the verifier. The production implementation
/// drives a disposable kernel instance; tests substitute a stub.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Bring up (or reuse) a probe covering `candidates`.
    async fn ensure_running(&self, candidates: &[Node]) -> Result<ProbeSession, ProbeStartError>;

    /// Delay in ms through the probe for `tag` against `target_url`;
    /// 0 = failure.
    async fn check(&self, tag: &str, target_url: &str, timeout_ms: u64) -> u64;

    /// Tear the probe down and release its temp config.
    async fn stop(&self);

    async fn is_active(&self) -> bool;
}

struct ActiveProbe {
    child: Child,
    control_port: u16,
    fingerprint: u64,
    config_path: PathBuf,
    session: ProbeSession,
}

/// Owns the one disposable probe kernel per process.
pub struct ProbeManager {
    binary: PathBuf,
    generated_dir: PathBuf,
    events: Arc<EventBus>,
    log: Arc<RollingLog>,
    state: Mutex<Option<ActiveProbe>>,
    check_permits: Arc<Semaphore>,
    client: reqwest::Client,
}

impl ProbeManager {
    pub fn new(
        binary: PathBuf,
        generated_dir: PathBuf,
        events: Arc<EventBus>,
        log: Arc<RollingLog>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CHECK_OUTER_TIMEOUT)
            .no_proxy()
            .build()
            .expect("failed to build probe HTTP client");
        Self {
            binary,
            generated_dir,
            events,
            log,
            state: Mutex::new(None),
            check_permits: Arc::new(Semaphore::new(CHECK_FANOUT)),
            client,
        }
    }

    fn config_path(&self) -> PathBuf {
        self.generated_dir.join("probe-config.json")
    }

    async fn teardown(&self, mut active: ActiveProbe) {
        let _ = active.child.start_kill();
        let _ = active.child.wait().await;
        let _ = std::fs::remove_file(&active.config_path);
        self.events.publish(
            Event::new(topic::PROBE_STOP).with("control_port", active.control_port),
        );
        metrics::gauge!("manager_probe_running").set(0.0);
        info!("probe: stopped, control_port={}", active.control_port);
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
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log.write_line(&line);
                }
            });
        }
    }
}

/// Stable fingerprint of a candidate set: sorted endpoints hashed.
fn fingerprint(candidates: &[Node]) -> u64 {
    let mut endpoints: Vec<(String, u16)> =
        candidates.iter().map(|n| (n.server.clone(), n.port)).collect();
    endpoints.sort();
    endpoints.dedup();
    let mut hasher = DefaultHasher::new();
    endpoints.hash(&mut hasher);
    hasher.finish()
}

/// Ask the OS for a free loopback port and release it for the kernel to bind.
fn free_loopback_port() -> Result<u16, ManagerError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| ManagerError::Unavailable(format!("reserve probe port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| ManagerError::Unavailable(format!("probe port addr: {}", e)))?
        .port();
    Ok(port)
}

#[async_trait]
impl Prober for ProbeManager {
    async fn ensure_running(&self, candidates: &[Node]) -> Result<ProbeSession, ProbeStartError> {
        // Serializes concurrent callers for the whole startup sequence.
        let mut state = self.state.lock().await;

        // Dedup on (server, port); the first occurrence wins.
        let mut seen: HashMap<(String, u16), ()> = HashMap::new();
        let deduped: Vec<Node> = candidates
            .iter()
            .filter(|n| seen.insert((n.server.clone(), n.port), ()).is_none())
            .cloned()
            .collect();

        let fp = fingerprint(&deduped);
        if let Some(active) = state.as_mut() {
            let alive = active.child.try_wait().ok().flatten().is_none();
            if alive && active.fingerprint == fp {
                debug!("probe: reusing running instance, control_port={}", active.control_port);
                return Ok(active.session.clone());
            }
            // Different candidate set (or a dead child) forces a restart.
            let previous = state.take().expect("probe state checked above");
            self.teardown(previous).await;
        }

        let control_port = free_loopback_port().map_err(|error| ProbeStartError {
            broken: Vec::new(),
            error,
        })?;
        let (output, tags) = build_probe_config(&deduped, control_port);
        let broken = output.broken;

        if tags.is_empty() {
            return Err(ProbeStartError {
                broken,
                error: ManagerError::Broken("no usable candidates for probe config".to_string()),
            });
        }

        let config_path = self.config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProbeStartError {
                broken: broken.clone(),
                error: ManagerError::Fatal(format!("create {}: {}", parent.display(), e)),
            })?;
        }
        std::fs::write(&config_path, output.document.to_string()).map_err(|e| {
            ProbeStartError {
                broken: broken.clone(),
                error: ManagerError::Fatal(format!("write probe config: {}", e)),
            }
        })?;

        let mut child = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProbeStartError {
                broken: broken.clone(),
                error: ManagerError::Fatal(format!("spawn probe {}: {}", self.binary.display(), e)),
            })?;
        self.tee_output(&mut child);

        self.events.publish(
            Event::new(topic::PROBE_START)
                .with("control_port", control_port)
                .with("candidates", tags.len() as i64),
        );

        // Wait for the control plane to come up.
        let version_url = format!("http://127.0.0.1:{}/version", control_port);
        let mut ready = false;
        for _ in 0..READY_ATTEMPTS {
            tokio::time::sleep(READY_INTERVAL).await;
            if child.try_wait().ok().flatten().is_some() {
                break;
            }
            if let Ok(resp) = self.client.get(&version_url).send().await {
                if resp.status().is_success() {
                    ready = true;
                    break;
                }
            }
        }

        if !ready {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = std::fs::remove_file(&config_path);
            metrics::counter!("manager_probe_start_total", "result" => "timeout").increment(1);
            return Err(ProbeStartError {
                broken,
                error: ManagerError::Unavailable("probe not ready within 5s".to_string()),
            });
        }

        info!(
            "probe: started, control_port={}, candidates={}, broken={}",
            control_port,
            tags.len(),
            broken.len()
        );
        metrics::counter!("manager_probe_start_total", "result" => "success").increment(1);
        metrics::gauge!("manager_probe_running").set(1.0);

        let session = ProbeSession {
            control_port,
            tags,
            broken,
        };
        *state = Some(ActiveProbe {
            child,
            control_port,
            fingerprint: fp,
            config_path,
            session: session.clone(),
        });
        Ok(session)
    }

    async fn check(&self, tag: &str, target_url: &str, timeout_ms: u64) -> u64 {
        let _permit = self
            .check_permits
            .clone()
            .acquire_owned()
            .await
            .expect("check semaphore closed");

        let control_port = {
            let state = self.state.lock().await;
            match state.as_ref() {
                Some(active) => active.control_port,
                None => return 0,
            }
        };

        let url = format!(
            "http://127.0.0.1:{}/proxies/{}/delay?timeout={}&url={}",
            control_port, tag, timeout_ms, target_url
        );

        let resp = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!("probe: delay check rejected, tag={}, status={}", tag, resp.status());
                return 0;
            }
            Err(e) => {
                debug!("probe: delay check failed, tag={}, error={}", tag, e);
                return 0;
            }
        };

        #[derive(serde::Deserialize)]
        struct Delay {
            delay: u64,
        }
        match resp.json::<Delay>().await {
            Ok(d) => d.delay,
            Err(_) => 0,
        }
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(active) = state.take() {
            self.teardown(active).await;
        }
    }

    async fn is_active(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.as_mut() {
            Some(active) => active.child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeStatus;

    fn node(tag: &str, server: &str, port: u16) -> Node {
        Node {
            id: 0,
            tag: tag.to_string(),
            name: tag.to_string(),
            source_tag: "manual".to_string(),
            node_type: "shadowsocks".to_string(),
            server: server.to_string(),
            port,
            settings: serde_json::json!({"method": "aes-256-gcm", "password": "x"}),
            country_code: String::new(),
            country_flag: String::new(),
            status: NodeStatus::Pending,
            consecutive_failures: 0,
            favorite: false,
            created_at: 0,
            updated_at: 0,
            last_checked_at: None,
            archived_at: None,
        }
    }

    #[test]
    fn test_fingerprint_ignores_order_and_duplicates() {
        let a = vec![node("n1", "1.1.1.1", 443), node("n2", "2.2.2.2", 443)];
        let b = vec![
            node("n2", "2.2.2.2", 443),
            node("n1", "1.1.1.1", 443),
            node("n1-dup", "1.1.1.1", 443),
        ];
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = vec![node("n3", "3.3.3.3", 443)];
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_free_loopback_port() {
        let port = free_loopback_port().unwrap();
        assert!(port > 0);
    }
}
