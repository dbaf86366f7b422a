//! End-to-end verification pipeline scenarios over a real store and a stub
//! probe layer. The kernel binary is absent, so apply passes fail softly —
//! exactly the degraded path the verifier is specified to tolerate.

use argus_manager::control::ConfigApply;
use argus_manager::error::ManagerError;
use argus_manager::events::{topic, Event, EventBus};
use argus_manager::kernel::{ProbeSession, ProbeStartError, Prober, RollingLog, Supervisor};
use argus_manager::store::{
    NodeCandidate, NodeStatus, Settings, Store, UnsupportedNode,
};
use argus_manager::verify::Verifier;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Stub prober
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StubProber {
    /// Proxied health verdict per tag; missing = dead.
    alive: Mutex<HashMap<String, bool>>,
    /// Site delay override per (tag, host); missing = 100 ms ok.
    sites: Mutex<HashMap<(String, String), i64>>,
    /// Endpoints reported broken at startup.
    broken: Mutex<Vec<UnsupportedNode>>,
    fail_start: bool,
    startup_delay_ms: u64,
    active: AtomicBool,
}

impl StubProber {
    fn set_alive(&self, tag: &str, alive: bool) {
        self.alive.lock().unwrap().insert(tag.to_string(), alive);
    }

    fn set_site(&self, tag: &str, host: &str, delay: i64) {
        self.sites
            .lock()
            .unwrap()
            .insert((tag.to_string(), host.to_string()), delay);
    }

    fn set_broken(&self, broken: UnsupportedNode) {
        self.broken.lock().unwrap().push(broken);
    }
}

fn host_of(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

#[async_trait]
impl Prober for StubProber {
    async fn ensure_running(
        &self,
        candidates: &[argus_manager::store::Node],
    ) -> Result<ProbeSession, ProbeStartError> {
        if self.startup_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.startup_delay_ms)).await;
        }
        let broken = self.broken.lock().unwrap().clone();
        if self.fail_start {
            return Err(ProbeStartError {
                broken,
                error: ManagerError::Unavailable("probe not ready within 5s".to_string()),
            });
        }
        let broken_endpoints: Vec<(String, u16)> =
            broken.iter().map(|b| (b.server.clone(), b.port)).collect();
        let tags = candidates
            .iter()
            .filter(|n| !broken_endpoints.contains(&(n.server.clone(), n.port)))
            .map(|n| n.tag.clone())
            .collect();
        self.active.store(true, Ordering::SeqCst);
        Ok(ProbeSession {
            control_port: 19095,
            tags,
            broken,
        })
    }

    async fn check(&self, tag: &str, target_url: &str, _timeout_ms: u64) -> u64 {
        let host = host_of(target_url);
        if host == "www.gstatic.com" {
            let alive = self.alive.lock().unwrap().get(tag).copied().unwrap_or(false);
            return if alive { 50 } else { 0 };
        }
        let delay = self
            .sites
            .lock()
            .unwrap()
            .get(&(tag.to_string(), host))
            .copied()
            .unwrap_or(100);
        if delay <= 0 {
            0
        } else {
            delay as u64
        }
    }

    async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    async fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<Store>,
    events: Arc<EventBus>,
    prober: Arc<StubProber>,
    verifier: Arc<Verifier>,
    _dir: PathBuf,
}

fn harness(prober: StubProber) -> Harness {
    let dir = std::env::temp_dir().join(format!(
        "argus-test-{}-{}",
        std::process::id(),
        argus_manager::store::now_ms()
    ));
    std::fs::create_dir_all(&dir).unwrap();

    let store = Arc::new(Store::open_in_memory().unwrap());
    let events = Arc::new(EventBus::new());
    let kernel_log = Arc::new(RollingLog::new(&dir, "kernel"));
    let supervisor = Arc::new(Supervisor::new(
        PathBuf::from("kernel-binary-not-installed"),
        dir.join("config.json"),
        kernel_log,
    ));
    let apply = Arc::new(ConfigApply::new(
        store.clone(),
        events.clone(),
        supervisor,
        PathBuf::from("kernel-binary-not-installed"),
        dir.join("config.json"),
    ));
    let prober = Arc::new(prober);
    let verifier = Arc::new(Verifier::new(
        store.clone(),
        events.clone(),
        prober.clone() as Arc<dyn Prober>,
        apply,
    ));
    Harness {
        store,
        events,
        prober,
        verifier,
        _dir: dir,
    }
}

/// Loopback server + closed port: TCP checks fail instantly instead of
/// hanging for the full connect timeout.
fn candidate(tag: &str, port: u16) -> NodeCandidate {
    NodeCandidate {
        tag: tag.to_string(),
        name: tag.to_string(),
        source_tag: "manual".to_string(),
        node_type: "shadowsocks".to_string(),
        server: "127.0.0.1".to_string(),
        port,
        settings: serde_json::json!({"method": "aes-256-gcm", "password": "x"}),
        country_code: String::new(),
        country_flag: String::new(),
    }
}

fn drain(events: &mut argus_manager::events::EventStream) -> Vec<Event> {
    let mut out = Vec::new();
    while let Some(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_promotion_on_full_success() {
    let prober = StubProber::default();
    prober.set_alive("n1", true);
    let h = harness(prober);

    h.store.add_nodes_bulk(&[candidate("n1", 1)]).unwrap();
    let mut events = h.events.subscribe_all();

    let run = h.verifier.run_cycle().await.unwrap();

    let node = h.store.find_node("127.0.0.1", 1).unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Verified);
    assert_eq!(node.consecutive_failures, 0);
    assert_eq!(run.pending_promoted, 1);
    assert_eq!(run.pending_archived, 0);
    assert!(run.error.is_none());

    // The run log row landed too.
    let logs = h.store.get_verification_logs(1).unwrap();
    assert_eq!(logs[0].pending_promoted, 1);
    assert_eq!(logs[0].pending_archived, 0);

    // Health + all four site measurements recorded.
    assert_eq!(h.store.health_measurements_for("127.0.0.1", 1).unwrap().len(), 1);

    // start precedes complete in subscriber order, same cycle id.
    let seen = drain(&mut events);
    let start_idx = seen.iter().position(|e| e.topic == topic::VERIFY_START).unwrap();
    let complete_idx = seen.iter().position(|e| e.topic == topic::VERIFY_COMPLETE).unwrap();
    assert!(start_idx < complete_idx);
    assert_eq!(
        seen[start_idx].payload["cycle"],
        seen[complete_idx].payload["cycle"]
    );
    assert_eq!(
        seen.iter().filter(|e| e.topic == topic::VERIFY_NODE_PROMOTED).count(),
        1
    );
}

#[tokio::test]
async fn s2_archival_at_threshold() {
    let prober = StubProber::default();
    prober.set_alive("n1", false);
    let h = harness(prober);

    h.store
        .update_settings(Settings {
            archive_threshold: 3,
            ..Settings::default()
        })
        .unwrap();
    h.store.add_nodes_bulk(&[candidate("n1", 1)]).unwrap();
    let mut events = h.events.subscribe_all();

    for cycle in 1..=3u32 {
        h.verifier.run_cycle().await.unwrap();
        let node = h.store.find_node("127.0.0.1", 1).unwrap().unwrap();
        if cycle < 3 {
            assert_eq!(node.status, NodeStatus::Pending, "cycle {}", cycle);
            assert_eq!(node.consecutive_failures, cycle);
        }
    }

    let node = h.store.find_node("127.0.0.1", 1).unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Archived);
    assert!(node.archived_at.is_some());
    assert_eq!(node.consecutive_failures, 3);

    let archived: Vec<Event> = drain(&mut events)
        .into_iter()
        .filter(|e| e.topic == topic::VERIFY_NODE_ARCHIVED)
        .collect();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].payload["tag"], "n1");
    assert_eq!(archived[0].payload["failures"], 3);
}

#[tokio::test]
async fn s3_demotion_keeps_counter() {
    let prober = StubProber::default();
    prober.set_alive("n1", true);
    prober.set_site("n1", "youtube.com", -1);
    let h = harness(prober);

    h.store.add_nodes_bulk(&[candidate("n1", 1)]).unwrap();
    let id = h.store.find_node("127.0.0.1", 1).unwrap().unwrap().id;
    h.store.promote_node(id).unwrap();
    let mut events = h.events.subscribe_all();

    let run = h.verifier.run_cycle().await.unwrap();

    let node = h.store.get_node(id).unwrap();
    assert_eq!(node.status, NodeStatus::Pending);
    // Demotion does not touch the failure counter.
    assert_eq!(node.consecutive_failures, 0);
    assert_eq!(run.verified_demoted, 1);

    let seen = drain(&mut events);
    assert_eq!(
        seen.iter().filter(|e| e.topic == topic::VERIFY_NODE_DEMOTED).count(),
        1
    );

    // The health row was still recorded as alive.
    let health = h.store.health_measurements_for("127.0.0.1", 1).unwrap();
    assert_eq!(health.len(), 1);
    assert!(health[0].alive);
}

#[tokio::test]
async fn s4_broken_prepass_archives_before_checks() {
    let prober = StubProber::default();
    prober.set_alive("good", true);
    prober.set_broken(UnsupportedNode {
        tag: "legacy".to_string(),
        server: "127.0.0.1".to_string(),
        port: 2,
        reason: "unsupported transport: ssr".to_string(),
    });
    let h = harness(prober);

    h.store
        .add_nodes_bulk(&[candidate("good", 1), candidate("legacy", 2)])
        .unwrap();

    h.verifier.run_cycle().await.unwrap();

    let legacy = h.store.find_node("127.0.0.1", 2).unwrap().unwrap();
    assert_eq!(legacy.status, NodeStatus::Archived);
    assert!(legacy.archived_at.is_some());

    // UnsupportedNode row exists; no health measurement was ever taken.
    let unsupported = h.store.get_unsupported_nodes(10).unwrap();
    assert_eq!(unsupported.len(), 1);
    assert_eq!(unsupported[0].tag, "legacy");
    assert!(h.store.health_measurements_for("127.0.0.1", 2).unwrap().is_empty());

    // The healthy sibling still went through the full pipeline.
    let good = h.store.find_node("127.0.0.1", 1).unwrap().unwrap();
    assert_eq!(good.status, NodeStatus::Verified);
    assert_eq!(h.store.health_measurements_for("127.0.0.1", 1).unwrap().len(), 1);
}

#[tokio::test]
async fn s5_overlapping_triggers_coalesce() {
    let prober = StubProber {
        startup_delay_ms: 200,
        ..StubProber::default()
    };
    prober.set_alive("n1", true);
    let h = harness(prober);

    h.store.add_nodes_bulk(&[candidate("n1", 1)]).unwrap();
    let mut events = h.events.subscribe_all();

    let first = {
        let verifier = h.verifier.clone();
        tokio::spawn(async move { verifier.run_cycle().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Second trigger lands while the first cycle is inside the probe phase.
    let second = h.verifier.run_cycle().await;
    assert!(matches!(second, Err(ManagerError::Conflict(_))));

    first.await.unwrap().unwrap();

    let seen = drain(&mut events);
    assert_eq!(seen.iter().filter(|e| e.topic == topic::VERIFY_START).count(), 1);
    assert_eq!(seen.iter().filter(|e| e.topic == topic::VERIFY_COMPLETE).count(), 1);
}

#[tokio::test]
async fn probe_startup_failure_aborts_cycle() {
    let prober = StubProber {
        fail_start: true,
        ..StubProber::default()
    };
    let h = harness(prober);

    h.store.add_nodes_bulk(&[candidate("n1", 1)]).unwrap();
    let run = h.verifier.run_cycle().await.unwrap();

    assert!(run.error.is_some());
    assert_eq!(run.pending_checked, 0);

    // No transitions, no failure accounting.
    let node = h.store.find_node("127.0.0.1", 1).unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Pending);
    assert_eq!(node.consecutive_failures, 0);

    let logs = h.store.get_verification_logs(1).unwrap();
    assert!(logs[0].error.is_some());
}

#[tokio::test]
async fn verified_node_survives_when_everything_passes() {
    let prober = StubProber::default();
    prober.set_alive("n1", true);
    let h = harness(prober);

    h.store.add_nodes_bulk(&[candidate("n1", 1)]).unwrap();
    let id = h.store.find_node("127.0.0.1", 1).unwrap().unwrap().id;
    h.store.increment_consecutive_failures(id).unwrap();
    h.store.promote_node(id).unwrap();

    let run = h.verifier.run_cycle().await.unwrap();
    assert_eq!(run.verified_demoted, 0);
    let node = h.store.get_node(id).unwrap();
    assert_eq!(node.status, NodeStatus::Verified);
    assert_eq!(node.consecutive_failures, 0);
}
