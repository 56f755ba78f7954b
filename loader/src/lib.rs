// Self-wrapped ELF64 image parsing and the runtime linker.
//
// Austin Shafer - 2024
pub mod dynamic;
pub mod elf;
pub mod error;
pub mod image;
pub mod linker;
pub mod nid;
pub mod plt;
pub mod selfwrap;
pub mod symbol;
pub mod tls;

pub use error::{LoaderError, LoaderResult};
pub use image::Program;
pub use linker::RuntimeLinker;
