//! Deferred action scheduling for intercepted command streams.
//!
//! When the host binds a pipeline whose pixel or vertex shader belongs to an
//! active toggle group, the group's owed work (effect techniques, texture
//! bindings, constant extraction, the editing preview) is queued against the
//! call site its invocation location names. Every later draw, pipeline bind
//! and render-target change drains the bits set for that site, resolves the
//! target the action needs and executes it on the host's command list.
//! After an effect renders, the host's bindings are re-issued from the
//! list's `StateTracker`.
//!
//! `DeviceState` is shared by all command lists of a device and holds the
//! per-frame bookkeeping, so each technique renders at most once per frame.
//! `CommandListState` is owned by one command list.

pub mod descriptors;
pub mod device;
pub mod groups;
pub mod queue;
pub mod resolve;
mod scheduler;
pub mod state;

pub use descriptors::{DescriptorCache, DescriptorEntry};
pub use device::{BindingEntry, DeviceState, OwnedTexture, PipelineShaders};
pub use groups::GroupRegistry;
pub use queue::{ActionBits, ActionKind, ActionQueue, CallSite, Stage};
pub use resolve::{CycleDirection, ResolveFailure, ResolvedView};
pub use scheduler::{cycle_binding_index, Injected, Scheduler, PREVIEW_BINDING};
pub use state::{CommandListState, ShaderData, WorkItem, WorkState};
