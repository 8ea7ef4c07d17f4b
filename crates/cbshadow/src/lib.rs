//! Host-readable shadows of GPU constant buffers.
//!
//! Each toggle group that extracts constants owns a `ConstantSnapshot`: the
//! bytes of its constant buffer range for this frame and the one before.
//! Snapshots are refreshed through a `CaptureStrategy` chosen once from
//! configuration:
//!
//! - `GpuReadback` copies into a scratch buffer and maps it back.
//! - `HostShadow` mirrors CPU-visible buffers by following the host's writes.
//! - `BulkCopy` additionally catches the engine's own staging copies into
//!   mapped memory.
//!
//! `projection` turns named offsets into typed uniform writes.

mod projection;
mod snapshot;
mod store;
pub mod strategy;

pub use projection::{project, ConstantBinding, ConstantsTable, ValueType};
pub use snapshot::ConstantSnapshot;
pub use store::ConstantShadowStore;
pub use strategy::{CaptureStrategy, MapEvent, ShadowError, ShadowTable};
