/// Units above bytes, each 1024 times the previous
const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

/// Format a byte count as `N B` below one kilobyte, else one decimal in the largest fitting unit
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Parse a string produced by [`format_size`] back into bytes (rounded).
///
/// Returns `None` for anything unrecognised, including the empty string.
pub fn parse_size(text: &str) -> Option<u64> {
    let mut parts = text.split_whitespace();
    let number: f64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?;
    if parts.next().is_some() || !number.is_finite() || number < 0.0 {
        return None;
    }

    let multiplier = if unit.eq_ignore_ascii_case("B") {
        1.0
    } else {
        let index = UNITS
            .iter()
            .position(|candidate| candidate.eq_ignore_ascii_case(unit))?;
        1024f64.powi(index as i32 + 1)
    };
    Some((number * multiplier).round() as u64)
}
