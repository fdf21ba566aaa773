//! Utility functions and helpers

use anyhow::Result;
use std::time::Duration;

/// Parse a byte size (e.g., "262144", "256KiB", "256k", "1MiB", "1G")
///
/// Suffixes are binary multiples; `k`/`KB`/`KiB` all mean 1024.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(split);
    if num_str.is_empty() {
        anyhow::bail!("Invalid size: {}", s);
    }
    let value: u64 = num_str.parse()?;

    let shift = match suffix.trim().to_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        other => anyhow::bail!("Invalid size suffix: {}", other),
    };

    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| anyhow::anyhow!("Size out of range: {}", s))
}

/// Format a byte count with a binary unit (e.g., "256.0 KiB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Throughput in MiB/s for `bytes` moved in `elapsed`
pub fn throughput_mib_s(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / (1024.0 * 1024.0) / secs
}
