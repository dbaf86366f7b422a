pub mod config;
pub mod logs;
pub mod probe;
pub mod supervisor;

pub use config::{build_config, build_probe_config, BuildOutput};
pub use logs::RollingLog;
pub use probe::{ProbeManager, ProbeSession, ProbeStartError, Prober};
pub use supervisor::{check_config, Supervisor};
