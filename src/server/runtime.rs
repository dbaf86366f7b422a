/// Container-aware CPU limit detection for sizing the tokio worker pool.
///
/// Detection order:
/// 1. `ARGUS_CPU_LIMIT` env var (explicit override, "2" or "2000m")
/// 2. cgroup v2: `/sys/fs/cgroup/cpu.max`
/// 3. cgroup v1: `cpu.cfs_quota_us` / `cpu.cfs_period_us`
/// 4. Fallback: host CPU count
///
/// Without this, tokio defaults to the host CPU count, which over-provisions
/// threads when the container is limited to a fraction of the host.
pub fn worker_threads() -> usize {
    if let Ok(raw) = std::env::var("ARGUS_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&raw) {
            let threads = cores.max(1);
            eprintln!("[runtime] using CPU limit from ARGUS_CPU_LIMIT: {} threads", threads);
            return threads;
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2_cpu(&max) {
            let threads = cores.max(1);
            eprintln!("[runtime] using CPU limit from cgroup v2: {} threads", threads);
            return threads;
        }
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_quota_period(&quota, &period) {
            let threads = cores.max(1);
            eprintln!("[runtime] using CPU limit from cgroup v1: {} threads", threads);
            return threads;
        }
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    eprintln!("[runtime] using system CPU count: {} threads", threads);
    threads
}

/// "2" (cores) or "2000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// cgroup v2 `cpu.max`: "quota period" or "max period" (unlimited).
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    parse_quota_period(quota, period)
}

fn parse_quota_period(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value() {
        assert_eq!(parse_cpu_value("2"), Some(2));
        assert_eq!(parse_cpu_value(" 8 "), Some(8));
        assert_eq!(parse_cpu_value("2000m"), Some(2));
        assert_eq!(parse_cpu_value("500m"), Some(0)); // caller clamps to 1
        assert_eq!(parse_cpu_value("not-a-number"), None);
    }

    #[test]
    fn test_parse_cgroup_v2() {
        assert_eq!(parse_cgroup_v2_cpu("200000 100000"), Some(2));
        assert_eq!(parse_cgroup_v2_cpu("max 100000"), None);
        assert_eq!(parse_cgroup_v2_cpu(""), None);
    }

    #[test]
    fn test_parse_quota_period() {
        assert_eq!(parse_quota_period("400000", "100000"), Some(4));
        assert_eq!(parse_quota_period("-1", "100000"), None);
        assert_eq!(parse_quota_period("0", "100000"), None);
    }
}
