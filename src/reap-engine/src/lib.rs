//! The snapshot memory-restoration engine: the part of the daemon that decides which
//! guest-memory pages matter, packs them into prefetch artifacts, and serves guest page
//! faults from those artifacts while a VMM restores and runs.
//!
//! Layered bottom-up:
//! - [`residency`] / [`characterizer`]: turn a memory-image file (plus, optionally, an
//!   access trace) into a per-page `layer[]` array.
//! - [`coalescer`]: turns per-page classifications into coalesced `(start, length)`
//!   regions.
//! - [`working_set`]: builds, loads, and drops the packed working-set file derived from
//!   those regions.
//! - [`snapshot`]: the `Snapshot` record tying the above together, one per registered
//!   memory image.
//! - [`registry`]: owns all snapshots by id.
//! - [`uffd`]: the per-activation user-fault server that actually serves guest page
//!   faults from a snapshot's artifacts.
//! - [`orchestrator`]: composes the above into the request surface a control plane binds
//!   to a transport (over HTTP, in `reapd`).
//!
//! No component here reaches for process-global state; an [`orchestrator::Orchestrator`]
//! is constructed once, owns everything, and is handed to whatever binds it to a
//! transport.

pub mod characterizer;
pub mod coalescer;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod residency;
pub mod snapshot;
pub mod uffd;
pub mod working_set;

pub use error::{EngineError, ErrorKind};
pub use orchestrator::Orchestrator;
pub use registry::SnapshotRegistry;
pub use snapshot::{MincoreSummary, Snapshot};
