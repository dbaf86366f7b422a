use crate::kernel::Prober;
use crate::store::MeasureMode;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

pub const TCP_TIMEOUT: Duration = Duration::from_secs(5);
/// Budget handed to the probe's delay endpoint, riding inside the client's
/// 7 s outer timeout.
pub const PROBE_CHECK_TIMEOUT_MS: u64 = 5000;
/// 204-style latency target for the proxied health check.
pub const HEALTH_CHECK_URL: &str = "https://www.gstatic.com/generate_204";

/// Raw TCP reachability; returns the connect latency in ms.
pub async fn tcp_connect(server: &str, port: u16) -> Option<u64> {
    let start = Instant::now();
    match tokio::time::timeout(TCP_TIMEOUT, TcpStream::connect((server, port))).await {
        Ok(Ok(_stream)) => Some((start.elapsed().as_millis() as u64).max(1)),
        Ok(Err(e)) => {
            debug!("verify: tcp connect failed, server={}:{}, error={}", server, port, e);
            None
        }
        Err(_) => {
            debug!("verify: tcp connect timed out, server={}:{}", server, port);
            None
        }
    }
}

pub struct NodeHealth {
    pub alive: bool,
    pub latency_ms: u64,
    pub mode: MeasureMode,
}

/// TCP connect plus a probe-mediated delay check; alive when either
/// succeeds. The proxied latency wins when both do.
pub async fn health_check(
    prober: &dyn Prober,
    tag: &str,
    server: &str,
    port: u16,
) -> NodeHealth {
    let (tcp, proxied) = tokio::join!(
        tcp_connect(server, port),
        prober.check(tag, HEALTH_CHECK_URL, PROBE_CHECK_TIMEOUT_MS),
    );

    if proxied > 0 {
        NodeHealth {
            alive: true,
            latency_ms: proxied,
            mode: MeasureMode::Probe,
        }
    } else if let Some(latency) = tcp {
        NodeHealth {
            alive: true,
            latency_ms: latency,
            mode: MeasureMode::Tcp,
        }
    } else {
        NodeHealth {
            alive: false,
            latency_ms: 0,
            mode: MeasureMode::Tcp,
        }
    }
}

/// Probe-mediated reachability of each site target through `tag`.
/// A failed check is recorded as -1.
pub async fn site_checks(
    prober: &dyn Prober,
    tag: &str,
    targets: &[String],
) -> Vec<(String, i64)> {
    let mut results = Vec::with_capacity(targets.len());
    for target in targets {
        let url = format!("https://{}/", target);
        let delay = prober.check(tag, &url, PROBE_CHECK_TIMEOUT_MS).await;
        let delay = if delay == 0 { -1 } else { delay as i64 };
        results.push((target.clone(), delay));
    }
    results
}
