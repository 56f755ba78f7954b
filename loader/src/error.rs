// Austin Shafer - 2024
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("can't resolve: {name} ({library}, {module}, {kind:?})")]
    UnresolvedSymbol {
        name: String,
        library: String,
        module: String,
        kind: crate::symbol::SymbolType,
    },
    #[error("unknown relocation type: {0}")]
    UnknownRelocation(u32),
    #[error("dynamic tag present as both standard and OS-mirror form: {0:#x}")]
    DuplicateDynTag(i64),
    #[error(transparent)]
    Vmem(#[from] vmem::VmError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LoaderResult<T> = Result<T, LoaderError>;
