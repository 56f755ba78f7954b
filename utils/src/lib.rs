// A set of helper structs and macros shared by every crate in the
// workspace: logging, timing, address-range helpers.
//
// Austin Shafer - 2020
pub mod timing;
#[macro_use]
pub mod logging;
pub mod log;
pub mod region;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};
// Re-exported so the `log_internal!` macro can be invoked hygienically
// from any crate in the workspace via `$crate::lazy_static`.
pub use lazy_static;

/// Helper to perform max on PartialOrd types
///
/// We are using PartialOrd so that size and offset can handle
/// floating point types that do not support Ord
pub fn partial_max<T: PartialOrd>(a: T, b: T) -> T {
    if a >= b {
        a
    } else {
        b
    }
}

/// Helper to perform min on PartialOrd types
pub fn partial_min<T: PartialOrd>(a: T, b: T) -> T {
    if a <= b {
        a
    } else {
        b
    }
}

/// Rounds `val` up to the next multiple of `align`. `align` must be a
/// power of two, as is the case for every page/segment alignment this
/// workspace deals with.
pub fn align_up(val: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (val + (align - 1)) & !(align - 1)
}

/// Rounds `val` down to the previous multiple of `align`.
pub fn align_down(val: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    val & !(align - 1)
}
