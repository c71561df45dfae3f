//! Throughput arithmetic for relay reports and the traffic harnesses.
//!
//! Rates use binary gigabytes: `GB = bytes / 1024^3`, `Gbps = GB * 8 / s`.

use std::fmt;
use std::time::Duration;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Convert a byte count to binary gigabytes.
pub fn gigabytes(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Average rate in gigabits per second. Zero elapsed time yields 0.
pub fn gbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    gigabytes(bytes) * 8.0 / secs
}

/// Bytes moved over a time span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Throughput {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    pub fn gigabytes(&self) -> f64 {
        gigabytes(self.bytes)
    }

    pub fn gbps(&self) -> f64 {
        gbps(self.bytes, self.elapsed)
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Data Transferred: {:.6} GB, Rate: {:.6} Gbps, Duration: {:.3} s",
            self.gigabytes(),
            self.gbps(),
            self.elapsed.as_secs_f64()
        )
    }
}
