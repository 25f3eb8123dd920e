use std::time::{Duration, SystemTime};

/// Returns the current UNIX timestamp in microseconds.
///
/// Returns `0` if the system clock is set before the epoch.
#[inline]
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Converts a millisecond count, as found in broker-client configuration, into a [`Duration`].
#[inline]
pub const fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
    pub const MiB: u32 = 1024 * KiB;
    pub const GiB: u32 = 1024 * MiB;
}
