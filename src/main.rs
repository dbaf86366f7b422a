#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use argus_manager::server;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "argus-manager", about = "Node manager and verifier sidecar for a sing-box kernel")]
struct Cli {
    /// Data directory (database, kernel binary, generated config, logs)
    #[arg(long, default_value_os_t = default_data_dir())]
    data: PathBuf,

    /// API listen port
    #[arg(long, default_value_t = 9090)]
    port: u16,
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".argus"),
        None => PathBuf::from(".argus"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(server::runtime::worker_threads())
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        data_dir: cli.data,
        listen: format!("127.0.0.1:{}", cli.port),
    }))
}
