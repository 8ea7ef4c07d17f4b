//! Host graphics API abstraction and pipeline state tracking for drawhook.
//!
//! The crate describes the handful of device and command-list operations the
//! interception core needs from a host graphics API, plus the per-command-list
//! state tracker that lets the core inject its own work mid-frame and hand the
//! command list back untouched:
//!
//! ```text
//!   host bind/push callbacks ──▶ StateTracker (latest value per slot)
//!                                         │
//!   injected effect / copy work ──▶ CommandList (clobbered)
//!                                         │
//!                      StateTracker::re_apply_state ──▶ host state restored
//! ```
//!
//! `recording` provides an in-memory device, a logging command list and a
//! scripted effect runtime. The trace replay tool runs on top of them and so
//! do the tests across the workspace.

pub mod device;
pub mod effect;
pub mod recording;
pub mod tracker;
pub mod types;

pub use device::{ApiError, CommandList, Device};
pub use effect::{EffectRuntime, UniformSlot};
pub use tracker::{CallIndex, CaptureKind, Captured, StateTracker, TransientSlots};
pub use types::*;
