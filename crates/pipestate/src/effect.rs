use serde::{Deserialize, Serialize};

use crate::device::CommandList;
use crate::types::ResourceViewHandle;

/// Destination uniform variable inside the effect engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniformSlot(pub u64);

/// The effect engine the core paints into the host's render targets.
///
/// Rendering a technique records arbitrary state changes into `cmd`; callers
/// are responsible for restoring the host's pipeline state afterwards.
pub trait EffectRuntime {
    fn back_buffer_resolution(&self) -> (u32, u32);

    fn technique_names(&self) -> Vec<String>;

    /// Returns `false` when the technique is unknown to the runtime.
    fn render_technique(
        &mut self,
        technique: &str,
        cmd: &mut dyn CommandList,
        rtv: ResourceViewHandle,
        rtv_srgb: ResourceViewHandle,
    ) -> bool;

    /// Points the named texture binding at `srv`; null views clear it.
    fn update_texture_binding(
        &mut self,
        name: &str,
        srv: ResourceViewHandle,
        srv_srgb: ResourceViewHandle,
    );

    fn set_uniform_f32(&mut self, slot: UniformSlot, values: &[f32]);

    fn set_uniform_i32(&mut self, slot: UniformSlot, values: &[i32]);

    fn set_uniform_u32(&mut self, slot: UniformSlot, values: &[u32]);
}
