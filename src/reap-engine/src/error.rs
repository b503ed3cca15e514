//! Error enums for the snapshot memory-restoration engine.
//!
//! Each component gets its own enum in the style of `vmm::vstate::memory::MemoryError`:
//! `thiserror::Error` for the `std::error::Error` impl, `displaydoc::Display` for short,
//! one-line messages, and `#[from]` conversions where a lower layer's error can only mean
//! one thing here.

use std::io;

/// Errors from [`crate::residency`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ResidencyError {
    /// page size must be non-zero
    InvalidArgument,
    /// mmap failed: {0}
    Mmap(io::Error),
    /// mincore failed: {0}
    Mincore(io::Error),
    /// munmap failed: {0}
    Munmap(io::Error),
    /// failed to read RSS counter for pid {0}: {1}
    RssRead(u32, io::Error),
}

/// Errors from [`crate::characterizer`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum CharacterizerError {
    /// residency sampling failed: {0}
    Residency(#[from] ResidencyError),
    /// mincore exists or records do not exist
    AlreadyCharacterized,
    /// insert-layer position must be >= 1
    InvalidPosition,
    /// page arrays have mismatched length: {0} vs {1}
    LengthMismatch(usize, usize),
}

/// Errors from [`crate::working_set`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum WorkingSetError {
    /// I/O failure building the working-set file: {0}
    Io(#[from] io::Error),
    /// mmap failed: {0}
    Mmap(io::Error),
    /// no working-set file is associated with this snapshot
    NotBuilt,
    /// a working-set load is already in flight for this snapshot
    LoadInFlight,
}

/// Errors from [`crate::snapshot`] and [`crate::registry`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum SnapshotError {
    /// unknown snapshot id: {0}
    NotFound(String),
    /// snapshot {0} already registered
    AlreadyExists(String),
    /// operation not valid in the current state: {0}
    InvalidState(&'static str),
    /// invalid argument: {0}
    InvalidArgument(&'static str),
    /// I/O failure: {0}
    Io(#[from] io::Error),
    /// region coalescing error: {0}
    Characterizer(#[from] CharacterizerError),
    /// working-set error: {0}
    WorkingSet(#[from] WorkingSetError),
}

/// Errors from [`crate::uffd`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum UffdError {
    /// I/O failure: {0}
    Io(#[from] io::Error),
    /// userfaultfd kernel operation failed: {0}
    Kernel(#[from] userfaultfd::Error),
    /// malformed control message from peer: {0}
    Protocol(String),
    /// instance already activated
    AlreadyActivated,
    /// instance not active
    NotActive,
    /// a page fill was rejected by the kernel for offset {0}
    FillRejected(u64),
}

/// Top-level error surfaced by [`crate::orchestrator::Orchestrator`] and, one layer up, by
/// the HTTP control plane. Every component error funnels into this.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum EngineError {
    /// unknown id: {0}
    NotFound(String),
    /// invalid argument: {0}
    InvalidArgument(String),
    /// invalid state: {0}
    InvalidState(String),
    /// resource conflict: {0}
    ResourceConflict(String),
    /// snapshot error: {0}
    Snapshot(#[from] SnapshotError),
    /// characterizer error: {0}
    Characterizer(#[from] CharacterizerError),
    /// residency error: {0}
    Residency(#[from] ResidencyError),
    /// working-set error: {0}
    WorkingSet(#[from] WorkingSetError),
    /// uffd error: {0}
    Uffd(#[from] UffdError),
}

impl EngineError {
    /// Maps this error onto one of the abstract kinds from the error-handling design,
    /// used by the HTTP control plane to pick a status code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            EngineError::InvalidState(_) => ErrorKind::InvalidState,
            EngineError::ResourceConflict(_) => ErrorKind::ResourceConflict,
            EngineError::Snapshot(e) => match e {
                SnapshotError::NotFound(_) => ErrorKind::NotFound,
                SnapshotError::AlreadyExists(_) => ErrorKind::ResourceConflict,
                SnapshotError::InvalidState(_) => ErrorKind::InvalidState,
                SnapshotError::InvalidArgument(_) => ErrorKind::InvalidArgument,
                SnapshotError::Io(_) => ErrorKind::IoFailure,
                SnapshotError::Characterizer(_) => ErrorKind::InvalidState,
                SnapshotError::WorkingSet(_) => ErrorKind::IoFailure,
            },
            EngineError::Characterizer(e) => match e {
                CharacterizerError::Residency(_) => ErrorKind::KernelFailure,
                CharacterizerError::AlreadyCharacterized => ErrorKind::InvalidState,
                CharacterizerError::InvalidPosition => ErrorKind::InvalidArgument,
                CharacterizerError::LengthMismatch(..) => ErrorKind::InvalidArgument,
            },
            EngineError::Residency(_) => ErrorKind::KernelFailure,
            EngineError::WorkingSet(e) => match e {
                WorkingSetError::Io(_) => ErrorKind::IoFailure,
                WorkingSetError::Mmap(_) => ErrorKind::IoFailure,
                WorkingSetError::NotBuilt => ErrorKind::InvalidState,
                WorkingSetError::LoadInFlight => ErrorKind::ResourceConflict,
            },
            EngineError::Uffd(e) => match e {
                UffdError::Io(_) => ErrorKind::IoFailure,
                UffdError::Kernel(_) => ErrorKind::KernelFailure,
                UffdError::Protocol(_) => ErrorKind::InvalidArgument,
                UffdError::AlreadyActivated | UffdError::NotActive => ErrorKind::InvalidState,
                UffdError::FillRejected(_) => ErrorKind::KernelFailure,
            },
        }
    }
}

/// The abstract error kinds from the error-handling design; transport bindings (e.g. HTTP
/// status codes) key off this rather than matching on `EngineError` variants directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InvalidArgument,
    IoFailure,
    KernelFailure,
    ResourceConflict,
}
