//! Human-readable byte formatting for log output.

const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

/// Format a byte count using binary units (1024-based).
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
