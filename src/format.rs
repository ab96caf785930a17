//! Formatting utilities for human-readable output.

const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Format a byte count with binary prefixes and two decimals, e.g. `1.00GiB`.
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2}{}", UNITS[unit])
}

/// Format a kilobyte count (as reported by `pvesm status`).
pub fn kib_to_human(kib: u64) -> String {
    format_size(kib.saturating_mul(1024))
}
