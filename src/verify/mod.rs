pub mod checks;

use crate::control::apply::ConfigApply;
use crate::error::ManagerError;
use crate::events::{topic, Event, EventBus};
use crate::kernel::{ProbeStartError, Prober};
use crate::store::{
    now_ms, HealthMeasurement, Node, NodeStatus, SiteMeasurement, Store, UnsupportedNode,
    VerificationRun,
};
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Parallel check ceiling per phase.
const CHECK_CONCURRENCY: usize = 50;

type Endpoint = (String, u16);

struct Outcome {
    alive: bool,
    sites_ok: bool,
}

/// Runs one verification cycle at a time; overlapping triggers are coalesced.
pub struct Verifier {
    store: Arc<Store>,
    events: Arc<EventBus>,
    prober: Arc<dyn Prober>,
    apply: Arc<ConfigApply>,
    running: AtomicBool,
    cycles: AtomicU64,
}

impl Verifier {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventBus>,
        prober: Arc<dyn Prober>,
        apply: Arc<ConfigApply>,
    ) -> Self {
        Self {
            store,
            events,
            prober,
            apply,
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// One full cycle. Returns `Conflict` when a cycle is already in flight —
    /// the second trigger is dropped, not queued.
    pub async fn run_cycle(&self) -> Result<VerificationRun, ManagerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("verify: cycle skipped, already running");
            return Err(ManagerError::Conflict(
                "verification already running".to_string(),
            ));
        }
        let result = self.run_cycle_inner().await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn run_cycle_inner(&self) -> Result<VerificationRun, ManagerError> {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();

        let settings = self.store.get_settings()?;
        let threshold = settings.archive_threshold.max(1);
        let site_targets = settings.effective_site_targets();

        let pending = self.store.get_nodes(NodeStatus::Pending)?;
        let verified = self.store.get_nodes(NodeStatus::Verified)?;

        self.events.publish(
            Event::new(topic::VERIFY_START)
                .with("cycle", cycle)
                .with("pending", pending.len() as i64)
                .with("verified", verified.len() as i64),
        );
        info!(
            "verify: cycle started, cycle={}, pending={}, verified={}",
            cycle,
            pending.len(),
            verified.len()
        );

        let mut run = VerificationRun {
            started_at: now_ms(),
            ..VerificationRun::default()
        };

        // --- Phase 1: broken-filter pre-pass -------------------------------
        let candidates = dedupe_endpoints(pending.iter().chain(verified.iter()));
        if candidates.is_empty() {
            info!("verify: nothing to check, cycle={}", cycle);
            run.duration_ms = started.elapsed().as_millis() as u64;
            self.store.add_verification_log(&run)?;
            self.events.publish(
                Event::new(topic::VERIFY_COMPLETE)
                    .with("cycle", cycle)
                    .with("promoted", 0)
                    .with("archived", 0)
                    .with("demoted", 0),
            );
            return Ok(run);
        }
        match self.prober.ensure_running(&candidates).await {
            Ok(session) => {
                self.archive_broken(&session.broken)?;
            }
            Err(ProbeStartError { broken, error }) => {
                self.archive_broken(&broken)?;
                warn!("verify: probe startup failed, cycle={}, error={}", cycle, error);
                run.error = Some(error.to_string());
                run.duration_ms = started.elapsed().as_millis() as u64;
                self.store.add_verification_log(&run)?;
                self.events.publish(
                    Event::new(topic::VERIFY_COMPLETE)
                        .with("cycle", cycle)
                        .with("error", error.to_string()),
                );
                metrics::counter!("manager_verify_cycles_total", "result" => "probe_failed")
                    .increment(1);
                return Ok(run);
            }
        }

        // Archival may have shrunk the lists; re-read before checking.
        let pending = self.store.get_nodes(NodeStatus::Pending)?;
        let verified = self.store.get_nodes(NodeStatus::Verified)?;
        let survivors = dedupe_endpoints(pending.iter().chain(verified.iter()));

        // --- Phase 2: health probe -----------------------------------------
        let outcomes = self.health_phase(&survivors).await?;

        // --- Phase 3: site probe -------------------------------------------
        let outcomes = self.site_phase(&survivors, outcomes, &site_targets).await?;

        // --- Phase 4: pending transitions ----------------------------------
        run.pending_checked = pending.len() as u32;
        let total = pending.len();
        for (i, node) in pending.iter().enumerate() {
            let outcome = outcome_for(&outcomes, node);
            if outcome.alive && outcome.sites_ok {
                self.store.promote_node(node.id)?;
                run.pending_promoted += 1;
                self.events.publish(
                    Event::new(topic::VERIFY_NODE_PROMOTED)
                        .with("tag", node.tag.as_str())
                        .with("server", node.server.as_str())
                        .with("port", node.port),
                );
            } else {
                let fails = self.store.increment_consecutive_failures(node.id)?;
                if fails >= threshold {
                    self.store.archive_node(node.id)?;
                    run.pending_archived += 1;
                    self.events.publish(
                        Event::new(topic::VERIFY_NODE_ARCHIVED)
                            .with("tag", node.tag.as_str())
                            .with("failures", fails)
                            .with("reason", "failure threshold reached"),
                    );
                }
            }
            self.events.publish(
                Event::new(topic::VERIFY_PROGRESS)
                    .with("phase", "pending")
                    .with("current", (i + 1) as i64)
                    .with("total", total as i64)
                    .with("tag", node.tag.as_str())
                    .with("alive", outcome.alive)
                    .with("sites_ok", outcome.sites_ok),
            );
        }

        // --- Phase 5: verified transitions ---------------------------------
        run.verified_checked = verified.len() as u32;
        let total = verified.len();
        for (i, node) in verified.iter().enumerate() {
            let outcome = outcome_for(&outcomes, node);
            if !outcome.alive || !outcome.sites_ok {
                self.store.demote_node(node.id)?;
                run.verified_demoted += 1;
                self.events.publish(
                    Event::new(topic::VERIFY_NODE_DEMOTED)
                        .with("tag", node.tag.as_str())
                        .with("alive", outcome.alive)
                        .with("sites_ok", outcome.sites_ok),
                );
            } else {
                self.store.reset_consecutive_failures(node.id)?;
            }
            self.events.publish(
                Event::new(topic::VERIFY_PROGRESS)
                    .with("phase", "verified")
                    .with("current", (i + 1) as i64)
                    .with("total", total as i64)
                    .with("tag", node.tag.as_str())
                    .with("alive", outcome.alive)
                    .with("sites_ok", outcome.sites_ok),
            );
        }

        // --- Phase 6: apply ------------------------------------------------
        let transitions = run.pending_promoted + run.pending_archived + run.verified_demoted;
        if transitions > 0 {
            if let Err(e) = self.apply.apply().await {
                // Transitions stay; the user can re-apply manually.
                warn!("verify: apply after cycle failed, cycle={}, error={}", cycle, e);
            }
        }

        // --- Phase 7: completion -------------------------------------------
        run.duration_ms = started.elapsed().as_millis() as u64;
        self.store.add_verification_log(&run)?;
        self.events.publish(
            Event::new(topic::VERIFY_COMPLETE)
                .with("cycle", cycle)
                .with("promoted", run.pending_promoted)
                .with("archived", run.pending_archived)
                .with("demoted", run.verified_demoted)
                .with("duration_ms", run.duration_ms),
        );
        info!(
            "verify: cycle complete, cycle={}, promoted={}, archived={}, demoted={}, duration_ms={}",
            cycle, run.pending_promoted, run.pending_archived, run.verified_demoted, run.duration_ms
        );
        metrics::counter!("manager_verify_cycles_total", "result" => "success").increment(1);
        metrics::histogram!("manager_verify_cycle_duration_seconds")
            .record(run.duration_ms as f64 / 1000.0);

        Ok(run)
    }

    /// Archive every broken candidate with its reason and keep the
    /// unsupported-node record. No health measurement is ever written for
    /// these.
    fn archive_broken(&self, broken: &[UnsupportedNode]) -> Result<(), ManagerError> {
        for b in broken {
            self.store.add_unsupported_node(b)?;
            let Some(node) = self.store.find_node(&b.server, b.port)? else {
                continue;
            };
            if node.status == NodeStatus::Archived {
                continue;
            }
            self.store.archive_node(node.id)?;
            warn!(
                "verify: archived broken node, tag={}, reason={}",
                node.tag, b.reason
            );
            self.events.publish(
                Event::new(topic::VERIFY_NODE_ARCHIVED)
                    .with("tag", node.tag.as_str())
                    .with("reason", format!("broken config: {}", b.reason)),
            );
        }
        Ok(())
    }

    async fn health_phase(
        &self,
        nodes: &[Node],
    ) -> Result<HashMap<Endpoint, Outcome>, ManagerError> {
        let results: Vec<(Node, checks::NodeHealth)> = stream::iter(nodes.iter().cloned())
            .map(|node| {
                let prober = self.prober.clone();
                async move {
                    let tag = crate::kernel::config::sanitize_tag(&node.tag);
                    let health =
                        checks::health_check(prober.as_ref(), &tag, &node.server, node.port).await;
                    (node, health)
                }
            })
            .buffer_unordered(CHECK_CONCURRENCY)
            .collect()
            .await;

        let mut measurements = Vec::with_capacity(results.len());
        let mut outcomes = HashMap::new();
        for (node, health) in results {
            measurements.push(HealthMeasurement {
                server: node.server.clone(),
                port: node.port,
                tag: node.tag.clone(),
                timestamp: 0,
                alive: health.alive,
                latency_ms: health.latency_ms as u32,
                mode: health.mode,
            });
            outcomes.insert(
                (node.server, node.port),
                Outcome {
                    alive: health.alive,
                    sites_ok: true,
                },
            );
        }
        self.store.add_health_measurements(&measurements)?;
        Ok(outcomes)
    }

    async fn site_phase(
        &self,
        nodes: &[Node],
        mut outcomes: HashMap<Endpoint, Outcome>,
        targets: &[String],
    ) -> Result<HashMap<Endpoint, Outcome>, ManagerError> {
        if !self.prober.is_active().await {
            // Promotion is never blocked on missing data.
            warn!("verify: probe unavailable for site checks, assuming sites ok");
            return Ok(outcomes);
        }

        let results: Vec<(Node, Vec<(String, i64)>)> = stream::iter(nodes.iter().cloned())
            .map(|node| {
                let prober = self.prober.clone();
                let targets = targets.to_vec();
                async move {
                    let tag = crate::kernel::config::sanitize_tag(&node.tag);
                    let sites = checks::site_checks(prober.as_ref(), &tag, &targets).await;
                    (node, sites)
                }
            })
            .buffer_unordered(CHECK_CONCURRENCY)
            .collect()
            .await;

        let mut measurements = Vec::new();
        for (node, sites) in results {
            let sites_ok = sites.iter().all(|(_, delay)| *delay > 0);
            for (site, delay_ms) in sites {
                measurements.push(SiteMeasurement {
                    server: node.server.clone(),
                    port: node.port,
                    tag: node.tag.clone(),
                    timestamp: 0,
                    site,
                    delay_ms,
                    mode: crate::store::MeasureMode::Probe,
                });
            }
            if let Some(outcome) = outcomes.get_mut(&(node.server.clone(), node.port)) {
                outcome.sites_ok = sites_ok;
            }
        }
        self.store.add_site_measurements(&measurements)?;
        Ok(outcomes)
    }
}

fn dedupe_endpoints<'a>(nodes: impl Iterator<Item = &'a Node>) -> Vec<Node> {
    let mut seen: HashSet<Endpoint> = HashSet::new();
    nodes
        .filter(|n| seen.insert((n.server.clone(), n.port)))
        .cloned()
        .collect()
}

/// A node whose checks never ran (e.g. raced into the list) counts as down.
fn outcome_for<'a>(outcomes: &'a HashMap<Endpoint, Outcome>, node: &Node) -> &'a Outcome {
    static DOWN: Outcome = Outcome {
        alive: false,
        sites_ok: false,
    };
    outcomes
        .get(&(node.server.clone(), node.port))
        .unwrap_or(&DOWN)
}
