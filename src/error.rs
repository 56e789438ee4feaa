use std::io;

use thiserror::Error;

/// Errors raised while constructing a heap. Once a heap exists, invariant violations are
/// fatal and never surface as errors.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),
    #[error("space '{name}' [{begin:#x}, {limit:#x}) overlaps or precedes space '{previous}'")]
    UnsortedSpaces {
        name: String,
        previous: String,
        begin: usize,
        limit: usize,
    },
    #[error("space '{name}' [{begin:#x}, {limit:#x}) is not card aligned")]
    UnalignedSpace {
        name: String,
        begin: usize,
        limit: usize,
    },
    #[error("space '{name}' [{begin:#x}, {limit:#x}) lies outside the card table range")]
    OutsideCardTable {
        name: String,
        begin: usize,
        limit: usize,
    },
    #[error("space '{0}' is collected but has no allocator")]
    MissingAllocator(String),
    #[error("heap has no always-collect space")]
    NoAllocSpace,
    #[error("failed to map {what}")]
    Mmap {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

impl HeapError {
    pub(crate) fn mmap(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| HeapError::Mmap { what, source }
    }
}

pub type Result<T, E = HeapError> = std::result::Result<T, E>;
