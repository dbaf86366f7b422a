use crate::control::ControlSurface;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::store::Store;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Data directory layout — everything the manager persists lives under one
// root:  db, bin/<kernel>, generated/config.json, logs/<channel>.log
// ---------------------------------------------------------------------------

pub struct DataLayout {
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub bin_dir: PathBuf,
    pub generated_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub config_path: PathBuf,
}

impl DataLayout {
    pub fn new(root: PathBuf) -> Self {
        let bin_dir = root.join("bin");
        let generated_dir = root.join("generated");
        let logs_dir = root.join("logs");
        Self {
            db_path: root.join("argus.db"),
            config_path: generated_dir.join("config.json"),
            bin_dir,
            generated_dir,
            logs_dir,
            root,
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.bin_dir)?;
        std::fs::create_dir_all(&self.generated_dir)?;
        std::fs::create_dir_all(&self.logs_dir)?;
        Ok(())
    }

    /// Prefer the bundled kernel under `bin/`; fall back to `$PATH` lookup.
    pub fn kernel_binary(&self, name: &str) -> PathBuf {
        let bundled = self.bin_dir.join(name);
        if bundled.exists() {
            bundled
        } else {
            Path::new(name).to_path_buf()
        }
    }
}

// ---------------------------------------------------------------------------
// ManagerState — root aggregate handed to the HTTP/WS layer.
// ---------------------------------------------------------------------------

/// Shared manager state, cheaply cloneable. Transports depend on the control
/// surface for every mutation; store/events access here is read-only
/// convenience for dashboards.
#[derive(Clone)]
pub struct ManagerState {
    pub store: Arc<Store>,
    pub events: Arc<EventBus>,
    pub metrics: Metrics,
    pub control: Arc<ControlSurface>,
    pub layout: Arc<DataLayout>,
}
