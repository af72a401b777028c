use std::time::Duration;

const UNITS: [(&str, u64); 5] = [
    ("week", 7 * 24 * 60 * 60),
    ("day", 24 * 60 * 60),
    ("hour", 60 * 60),
    ("minute", 60),
    ("second", 1),
];

/// Up to four non-zero units, largest first, e.g. `1 day, 2 hours, 5 seconds`.
pub fn format_uptime(elapsed: Duration) -> String {
    let mut remaining = elapsed.as_secs();
    let mut parts = Vec::new();
    for (name, seconds) in UNITS {
        let count = remaining / seconds;
        remaining %= seconds;
        if count > 0 && parts.len() < 4 {
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{} {}{}", count, name, plural));
        }
    }
    if parts.is_empty() {
        return "0 seconds".to_string();
    }
    parts.join(", ")
}

/// `<used>/<total>MB`, or `unknown` when `/proc` is unavailable.
pub fn memory_summary() -> String {
    if !cfg!(target_os = "linux") {
        return "unknown".to_string();
    }
    let meminfo = std::fs::read_to_string("/proc/meminfo");
    let status = std::fs::read_to_string("/proc/self/status");
    match (meminfo, status) {
        (Ok(meminfo), Ok(status)) => {
            match (kib_field(&meminfo, "MemTotal"), kib_field(&status, "VmRSS")) {
                (Some(total), Some(used)) => format!("{}/{}MB", used / 1024, total / 1024),
                _ => "unknown".to_string(),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::debug!(error = %e, "Could not read memory statistics");
            "unknown".to_string()
        }
    }
}

/// Reads a `Key:   1234 kB` line from a /proc file.
fn kib_field(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        line.strip_prefix(key)?
            .strip_prefix(':')?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    })
}
