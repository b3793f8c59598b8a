//! Unit labels and 1024-based conversions applied at the aggregation boundary.

pub const PERCENT: &str = "%";
pub const DEGREE: &str = "°";
pub const MEGABYTES: &str = "MB";
pub const GIGABYTES: &str = "GB";
pub const KILOBYTES_PER_SEC: &str = "KB/s";

pub const KIB: f64 = 1024.0;
pub const MIB: f64 = KIB * 1024.0;
pub const GIB: f64 = MIB * 1024.0;

/// Bytes to binary megabytes.
pub fn bytes_to_mb(bytes: f64) -> f64 {
    bytes / MIB
}

/// Bytes to binary gigabytes.
pub fn bytes_to_gb(bytes: f64) -> f64 {
    bytes / GIB
}

/// Bytes per second to binary kilobytes per second.
pub fn bytes_to_kb(bytes: f64) -> f64 {
    bytes / KIB
}

/// Round to one decimal place.
pub fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// `part / whole * 100`, or `None` when the ratio is undefined.
pub fn percent_of(part: f64, whole: f64) -> Option<f64> {
    if whole > 0.0 && part.is_finite() && whole.is_finite() {
        Some(part / whole * 100.0)
    } else {
        None
    }
}
