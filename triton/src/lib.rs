// Wires the loader and gpu crates into a runnable guest process.
//
// Austin Shafer - 2024
pub mod collab;
pub mod config;
pub mod diagnostics;
pub mod runtime;

pub use config::Config;
pub use runtime::Runtime;
