use crate::control::{ConfigApply, ControlSurface, SchedulerHooks};
use crate::events::EventBus;
use crate::kernel::logs::LineWriter;
use crate::kernel::{ProbeManager, Prober, RollingLog, Supervisor};
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;
use crate::server::{self, DataLayout, ManagerState};
use crate::store::Store;
use crate::subscription::{HttpFetcher, OutboundListParser, Refresher};
use crate::verify::Verifier;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub data_dir: PathBuf,
    pub listen: String,
}

/// Manager lifecycle: init → wire → spawn loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    // Phase 1: data directory + observability.
    let layout = Arc::new(DataLayout::new(args.data_dir));
    layout.ensure()?;
    let app_log = Arc::new(RollingLog::new(&layout.logs_dir, "app"));
    init_tracing(app_log);
    let metrics = Metrics::install();

    // Phase 2: durable state + process owners.
    let store = Arc::new(Store::open(&layout.db_path)?);
    let events = Arc::new(EventBus::new());

    let settings = store.get_settings()?;
    let kernel_binary = layout.kernel_binary(&settings.kernel_binary);
    tracing::info!(
        "bootstrap: data={}, kernel={}",
        layout.root.display(),
        kernel_binary.display()
    );

    let kernel_log = Arc::new(RollingLog::new(&layout.logs_dir, "kernel"));
    let probe_log = Arc::new(RollingLog::new(&layout.logs_dir, "probe"));
    let supervisor = Arc::new(Supervisor::new(
        kernel_binary.clone(),
        layout.config_path.clone(),
        kernel_log,
    ));
    let prober = Arc::new(ProbeManager::new(
        kernel_binary.clone(),
        layout.generated_dir.clone(),
        events.clone(),
        probe_log,
    ));

    // Phase 3: pipeline wiring — every dependency injected, nothing global.
    let apply = Arc::new(ConfigApply::new(
        store.clone(),
        events.clone(),
        supervisor.clone(),
        kernel_binary,
        layout.config_path.clone(),
    ));
    let verifier = Arc::new(Verifier::new(
        store.clone(),
        events.clone(),
        prober.clone() as Arc<dyn Prober>,
        apply.clone(),
    ));
    let refresher = Arc::new(Refresher::new(
        store.clone(),
        events.clone(),
        Arc::new(HttpFetcher::new()),
        Arc::new(OutboundListParser),
    ));
    let hooks = Arc::new(SchedulerHooks::new(
        store.clone(),
        verifier.clone(),
        refresher.clone(),
        apply.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(store.clone(), hooks));
    let control = Arc::new(ControlSurface::new(
        store.clone(),
        verifier,
        refresher,
        apply,
        scheduler.clone(),
        supervisor.clone(),
        prober.clone() as Arc<dyn Prober>,
    ));

    let state = ManagerState {
        store: store.clone(),
        events: events.clone(),
        metrics,
        control,
        layout: layout.clone(),
    };

    // Phase 4: background loops.
    let shutdown = Arc::new(Notify::new());
    start_activity_sink(&state, &shutdown);
    scheduler.start();

    // Resume the kernel when a previous run left a config behind.
    if layout.config_path.exists() {
        if let Err(e) = supervisor.start().await {
            tracing::warn!("bootstrap: kernel not started: {}", e);
        }
    } else {
        tracing::info!("bootstrap: no generated config yet, kernel stays down");
    }

    // Phase 5: serve.
    tracing::info!("server: starting manager, listen={}", args.listen);
    let api_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_api_server(&listen, state, shutdown).await }
    });

    // Phase 6: block until signal, then clean up.
    wait_for_shutdown(&shutdown).await;

    scheduler.stop();
    prober.stop().await;
    if let Err(e) = supervisor.stop().await {
        tracing::error!("bootstrap: kernel stop failed: {}", e);
    }

    if let Err(e) = api_handle.await {
        tracing::error!("server: api task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing(app_log: Arc<RollingLog>) {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(64_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(move || LineWriter::new(app_log.clone()))
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    std::mem::forget(_guard);
}

/// Persists every published event into the bounded activity log.
fn start_activity_sink(state: &ManagerState, shutdown: &Arc<Notify>) {
    let store = state.store.clone();
    let mut events = state.events.subscribe_all();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { return };
                    if let Err(e) = store.add_activity_event(event.topic, &event.summary()) {
                        tracing::warn!("events: activity sink write failed: {}", e);
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Signal all background loops to stop.
    shutdown.notify_waiters();
}
