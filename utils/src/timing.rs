// Small timing helpers shared by the logging macros and by the
// GPU-object cache's creation/update timestamps.
//
// Austin Shafer - 2020
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, used to stamp log lines.
pub fn get_current_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Monotonic-ish microsecond timestamp used for GPU object
/// `cpu_update_time`/`gpu_update_time` bookkeeping. Not a true
/// monotonic clock, but wall-clock is sufficient here since these
/// values are only ever compared to each other, not persisted.
pub fn get_current_micros() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
}
