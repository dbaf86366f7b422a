pub mod apply;

pub use apply::{AppliedConfig, ConfigApply};

use crate::error::ManagerError;
use crate::kernel::{Prober, Supervisor};
use crate::scheduler::{Scheduler, Trigger};
use crate::store::{Node, NodeCandidate, Settings, Store};
use crate::subscription::{Refresher, RefreshSummary};
use crate::verify::Verifier;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of a non-blocking verification trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyTrigger {
    Started,
    AlreadyRunning,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub pending_nodes: usize,
    pub verified_nodes: usize,
    pub archived_nodes: usize,
    pub kernel_running: bool,
    pub kernel_pid: Option<u32>,
    pub probe_active: bool,
    pub verification_running: bool,
    pub scheduler_running: bool,
    pub next_sub_update: Option<i64>,
    pub next_verification: Option<i64>,
    pub last_verification: Option<i64>,
}

/// Scheduler ticks fan into the same pipeline the HTTP surface uses. Each
/// trigger spawns and returns so a tick never blocks the ticker.
pub struct SchedulerHooks {
    store: Arc<Store>,
    verifier: Arc<Verifier>,
    refresher: Arc<Refresher>,
    apply: Arc<ConfigApply>,
}

impl SchedulerHooks {
    pub fn new(
        store: Arc<Store>,
        verifier: Arc<Verifier>,
        refresher: Arc<Refresher>,
        apply: Arc<ConfigApply>,
    ) -> Self {
        Self {
            store,
            verifier,
            refresher,
            apply,
        }
    }
}

impl Trigger for SchedulerHooks {
    fn refresh_subscriptions(&self) {
        let store = self.store.clone();
        let refresher = self.refresher.clone();
        let apply = self.apply.clone();
        tokio::spawn(async move {
            match refresher.refresh_all().await {
                Ok(summaries) => {
                    let auto_apply = store.get_settings().map(|s| s.auto_apply).unwrap_or(false);
                    let removed: usize = summaries.iter().map(|s| s.removed).sum();
                    if auto_apply && removed > 0 {
                        if let Err(e) = apply.apply().await {
                            warn!("scheduler: apply after refresh failed: {}", e);
                        }
                    }
                }
                Err(e) => warn!("scheduler: subscription refresh failed: {}", e),
            }
        });
    }

    fn run_verification(&self) {
        let verifier = self.verifier.clone();
        tokio::spawn(async move {
            match verifier.run_cycle().await {
                Ok(_) => {}
                Err(ManagerError::Conflict(_)) => {
                    info!("scheduler: verification tick coalesced into running cycle");
                }
                Err(e) => warn!("scheduler: verification cycle failed: {}", e),
            }
        });
    }
}

/// The single entry point through which transports mutate state or trigger
/// work. Everything it owns is injected — tests construct fresh instances.
pub struct ControlSurface {
    store: Arc<Store>,
    verifier: Arc<Verifier>,
    refresher: Arc<Refresher>,
    apply: Arc<ConfigApply>,
    scheduler: Arc<Scheduler>,
    supervisor: Arc<Supervisor>,
    prober: Arc<dyn Prober>,
    /// Lock-free snapshot of effective settings for hot read paths (request
    /// auth, WS relay targets). Refreshed on every settings mutation.
    settings_cache: Arc<ArcSwap<Settings>>,
    client: reqwest::Client,
}

impl ControlSurface {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        verifier: Arc<Verifier>,
        refresher: Arc<Refresher>,
        apply: Arc<ConfigApply>,
        scheduler: Arc<Scheduler>,
        supervisor: Arc<Supervisor>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .no_proxy()
            .build()
            .expect("failed to build control-plane HTTP client");
        let settings = store.get_settings().unwrap_or_default();
        Self {
            store,
            verifier,
            refresher,
            apply,
            scheduler,
            supervisor,
            prober,
            settings_cache: Arc::new(ArcSwap::new(Arc::new(settings))),
            client,
        }
    }

    /// Lock-free settings snapshot; reflects the latest mutation through this
    /// surface.
    pub fn settings_snapshot(&self) -> Arc<Settings> {
        self.settings_cache.load_full()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Non-blocking: spawns the cycle, or reports the one already in flight.
    pub fn run_verification_now(&self) -> VerifyTrigger {
        if self.verifier.is_running() {
            return VerifyTrigger::AlreadyRunning;
        }
        let verifier = self.verifier.clone();
        tokio::spawn(async move {
            match verifier.run_cycle().await {
                Ok(_) => {}
                Err(ManagerError::Conflict(_)) => {
                    // Lost the race against another trigger; that cycle wins.
                }
                Err(e) => warn!("control: verification cycle failed: {}", e),
            }
        });
        VerifyTrigger::Started
    }

    pub async fn refresh_subscription(&self, id: i64) -> Result<RefreshSummary, ManagerError> {
        let summary = self.refresher.refresh(id).await?;
        self.maybe_apply_after_refresh(summary.removed).await;
        Ok(summary)
    }

    pub async fn refresh_all(&self) -> Result<Vec<RefreshSummary>, ManagerError> {
        let summaries = self.refresher.refresh_all().await?;
        let removed = summaries.iter().map(|s| s.removed).sum();
        self.maybe_apply_after_refresh(removed).await;
        Ok(summaries)
    }

    async fn maybe_apply_after_refresh(&self, removed: usize) {
        let auto_apply = self
            .store
            .get_settings()
            .map(|s| s.auto_apply)
            .unwrap_or(false);
        if auto_apply && removed > 0 {
            if let Err(e) = self.apply.apply().await {
                warn!("control: apply after refresh failed: {}", e);
            }
        }
    }

    pub async fn apply_config(&self) -> Result<AppliedConfig, ManagerError> {
        self.apply.apply().await
    }

    /// Proxy a group selection to the running kernel's control plane. No
    /// state changes on our side.
    pub async fn switch_proxy(&self, group: &str, tag: &str) -> Result<(), ManagerError> {
        let settings = self.store.get_settings()?;
        let url = format!(
            "http://127.0.0.1:{}/proxies/{}",
            settings.clash_api_port, group
        );
        let mut req = self.client.put(&url).json(&serde_json::json!({"name": tag}));
        if !settings.clash_api_secret.is_empty() {
            req = req.bearer_auth(&settings.clash_api_secret);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ManagerError::Unavailable(format!("kernel control plane: {}", e)))?;

        match resp.status().as_u16() {
            200 | 204 => {
                info!("control: proxy switched, group={}, tag={}", group, tag);
                Ok(())
            }
            404 => Err(ManagerError::NotFound(format!("group {}", group))),
            400 => Err(ManagerError::InvalidArgument(format!(
                "kernel rejected selection {} for {}",
                tag, group
            ))),
            status => Err(ManagerError::Unavailable(format!(
                "kernel control plane returned {}",
                status
            ))),
        }
    }

    /// Persist settings, restart the scheduler, and apply when auto-apply is
    /// on. Returns the effective (normalized) settings.
    pub async fn set_settings(&self, new: Settings) -> Result<Settings, ManagerError> {
        let effective = self.store.update_settings(new)?;
        self.settings_cache.store(Arc::new(effective.clone()));
        self.scheduler.restart();
        if effective.auto_apply {
            if let Err(e) = self.apply.apply().await {
                warn!("control: apply after settings change failed: {}", e);
            }
        }
        Ok(effective)
    }

    pub fn get_settings(&self) -> Result<Settings, ManagerError> {
        self.store.get_settings()
    }

    /// Gates the debug dump endpoint; persisted so it survives restarts.
    pub fn enable_debug_api(&self, flag: bool) -> Result<(), ManagerError> {
        let mut settings = self.store.get_settings()?;
        settings.debug_api_enabled = flag;
        let effective = self.store.update_settings(settings)?;
        self.settings_cache.store(Arc::new(effective));
        info!("control: debug api {}", if flag { "enabled" } else { "disabled" });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Node operations backing the HTTP surface
    // -----------------------------------------------------------------------

    pub async fn add_manual_node(&self, mut candidate: NodeCandidate) -> Result<Node, ManagerError> {
        if candidate.server.is_empty() || candidate.port == 0 {
            return Err(ManagerError::InvalidArgument(
                "server and port are required".to_string(),
            ));
        }
        if candidate.node_type.is_empty() {
            return Err(ManagerError::InvalidArgument("type is required".to_string()));
        }
        candidate.source_tag = "manual".to_string();
        if candidate.tag.is_empty() {
            candidate.tag = format!("{}-{}", candidate.server, candidate.port);
        }

        let server = candidate.server.clone();
        let port = candidate.port;
        self.store.add_nodes_bulk(std::slice::from_ref(&candidate))?;
        let node = self
            .store
            .find_node(&server, port)?
            .ok_or_else(|| ManagerError::Fatal("manual node vanished after insert".to_string()))?;
        info!("control: manual node added, tag={}, server={}:{}", node.tag, server, port);
        Ok(node)
    }

    pub async fn delete_node(&self, id: i64) -> Result<(), ManagerError> {
        let node = self.store.get_node(id)?;
        self.store.delete_node(id)?;
        // Removing a verified node changes the effective config.
        if node.status == crate::store::NodeStatus::Verified {
            let auto_apply = self.store.get_settings()?.auto_apply;
            if auto_apply {
                if let Err(e) = self.apply.apply().await {
                    warn!("control: apply after node delete failed: {}", e);
                }
            }
        }
        Ok(())
    }

    pub fn set_favorite(&self, id: i64, favorite: bool) -> Result<(), ManagerError> {
        self.store.set_favorite(id, favorite)
    }

    pub fn unarchive_node(&self, id: i64) -> Result<(), ManagerError> {
        self.store.unarchive_node(id)
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> Result<StatusSnapshot, ManagerError> {
        let (pending, verified, archived) = self.store.count_nodes_by_status()?;
        Ok(StatusSnapshot {
            pending_nodes: pending,
            verified_nodes: verified,
            archived_nodes: archived,
            kernel_running: self.supervisor.is_running().await,
            kernel_pid: self.supervisor.pid().await,
            probe_active: self.prober.is_active().await,
            verification_running: self.verifier.is_running(),
            scheduler_running: self.scheduler.is_running(),
            next_sub_update: self.scheduler.next_sub_update(),
            next_verification: self.scheduler.next_verification(),
            last_verification: self.scheduler.last_verification(),
        })
    }

    /// Full state dump for the gated debug endpoint.
    pub async fn debug_dump(&self) -> Result<serde_json::Value, ManagerError> {
        let status = self.status().await?;
        Ok(serde_json::json!({
            "status": status,
            "nodes": self.store.get_all_nodes()?,
            "subscriptions": self.store.list_subscriptions()?,
            "filters": self.store.list_filters()?,
            "rule_groups": self.store.list_rule_groups()?,
            "latest_measurements": self.store.get_latest_measurements(200)?,
            "verification_logs": self.store.get_verification_logs(20)?,
            "unsupported_nodes": self.store.get_unsupported_nodes(50)?,
            "settings": self.store.get_settings()?,
        }))
    }
}
