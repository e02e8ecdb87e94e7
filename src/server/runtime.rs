/// Sizes the tokio worker pool from the container's CPU limit rather than
/// the host's core count — a proxy pinned to 4 cores on a 64-core machine
/// should not spawn 64 workers.
///
/// Sources, in order: the `CHARON_CPU_LIMIT` env var ("4" or "4000m"),
/// cgroup v2 `cpu.max`, cgroup v1 cfs quota/period, and finally the host
/// parallelism.
pub fn worker_threads() -> usize {
    let (threads, source) = detect();
    // Logging is not initialized yet at this point in startup.
    eprintln!("[runtime] worker threads: {} (from {})", threads, source);
    threads
}

fn detect() -> (usize, &'static str) {
    if let Some(n) = std::env::var("CHARON_CPU_LIMIT")
        .ok()
        .as_deref()
        .and_then(parse_cpu_value)
    {
        return (n.max(1), "CHARON_CPU_LIMIT");
    }
    if let Some(n) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .as_deref()
        .and_then(parse_cgroup_v2)
    {
        return (n.max(1), "cgroup v2");
    }
    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(n) = quota_over_period(quota.trim(), period.trim()) {
            return (n.max(1), "cgroup v1");
        }
    }
    let host = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    (host, "host parallelism")
}

/// "4" means cores; "4000m" means millicores (k8s resource syntax).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// cgroup v2 `cpu.max` holds "quota period", or "max period" for unlimited.
fn parse_cgroup_v2(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    quota_over_period(quota, period)
}

fn quota_over_period(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}
