use crate::utils::errors::{MonitoringError, Result};

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
const MIB_EXPONENT: i32 = 2;

/// Convert a memory figure such as `"19968 MiB"` or `"2 GiB"` into MiB.
pub fn to_mib(value: &str) -> Result<f64> {
    let mut parts = value.split_whitespace();
    let (Some(size), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(MonitoringError::Parse(format!("memory size `{value}`")));
    };
    let size: f64 = size
        .parse()
        .map_err(|_| MonitoringError::Parse(format!("memory size `{value}`")))?;
    let exponent = UNITS
        .iter()
        .position(|&known| known == unit)
        .ok_or_else(|| MonitoringError::Parse(format!("memory unit `{unit}`")))?;
    Ok(size * 1024f64.powi(exponent as i32 - MIB_EXPONENT))
}

pub fn bytes_to_mib(bytes: f64) -> f64 {
    bytes / 1024.0 / 1024.0
}

/// Round half away from zero to `digits` decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}
