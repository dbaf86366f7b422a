use crate::error::ManagerError;
use crate::events::{topic, Event, EventBus};
use crate::kernel::{build_config, check_config, Supervisor};
use crate::store::{NodeStatus, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one apply pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppliedConfig {
    pub nodes: usize,
    pub broken: usize,
    pub restarted: bool,
}

/// The single path that turns store state into the kernel's on-disk config.
///
/// Nothing else writes the config file: the verifier, the scheduler and the
/// HTTP surface all funnel through here.
pub struct ConfigApply {
    store: Arc<Store>,
    events: Arc<EventBus>,
    supervisor: Arc<Supervisor>,
    kernel_binary: PathBuf,
    config_path: PathBuf,
}

impl ConfigApply {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventBus>,
        supervisor: Arc<Supervisor>,
        kernel_binary: PathBuf,
        config_path: PathBuf,
    ) -> Self {
        Self {
            store,
            events,
            supervisor,
            kernel_binary,
            config_path,
        }
    }

    pub fn config_path(&self) -> &std::path::Path {
        &self.config_path
    }

    /// Rebuild from verified nodes, write, syntax-check with the kernel's
    /// own `check` command, then restart the kernel — but only when it was
    /// already running.
    pub async fn apply(&self) -> Result<AppliedConfig, ManagerError> {
        let settings = self.store.get_settings()?;
        let nodes = self.store.get_nodes(NodeStatus::Verified)?;
        let filters = self.store.list_filters()?;
        let rule_groups = self.store.list_rule_groups()?;

        let output = build_config(&settings, &nodes, &filters, &rule_groups);
        for broken in &output.broken {
            warn!(
                "apply: node dropped from config, tag={}, reason={}",
                broken.tag, broken.reason
            );
        }

        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.config_path, serde_json::to_string_pretty(&output.document)?)?;

        check_config(&self.kernel_binary, &self.config_path).await?;

        self.supervisor.set_config_path(self.config_path.clone()).await;
        let restarted = if self.supervisor.is_running().await {
            self.supervisor.restart().await?;
            true
        } else {
            false
        };

        info!(
            "apply: config written, path={}, nodes={}, broken={}, restarted={}",
            self.config_path.display(),
            nodes.len(),
            output.broken.len(),
            restarted
        );
        self.events.publish(
            Event::new(topic::CONFIG_APPLIED)
                .with("nodes", nodes.len() as i64)
                .with("broken", output.broken.len() as i64)
                .with("restarted", restarted),
        );
        metrics::counter!("manager_config_applies_total").increment(1);

        Ok(AppliedConfig {
            nodes: nodes.len(),
            broken: output.broken.len(),
            restarted,
        })
    }
}
