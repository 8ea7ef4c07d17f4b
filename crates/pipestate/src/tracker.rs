//! Per-command-list pipeline state capture and replay.
//!
//! Every bind/push callback the host issues is recorded into a typed slot
//! stamped with a monotonically increasing call index. One slot exists per
//! state kind (per stage or per layout parameter where the API binds those
//! independently) and is overwritten on each observation, so the slot always
//! holds the latest value. `StateTracker::re_apply_state` re-issues every
//! recorded slot in call-index order after injected work has clobbered the
//! command list, leaving the host's bindings exactly as it left them.

use std::collections::BTreeMap;

use tracing::trace;

use crate::device::CommandList;
use crate::types::{
    DescriptorTableHandle, DescriptorTableUpdate, DynamicState, PipelineHandle,
    PipelineLayoutHandle, PipelineLayoutParam, PipelineStages, Rect, RenderPassDepthStencil,
    RenderPassRenderTarget, ResourceViewHandle, ShaderStages, Viewport,
};

pub type CallIndex = u64;

/// Bit set of pipeline layout parameters that are pushed per draw and
/// therefore skipped when descriptor tables are rebound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransientSlots(u64);

impl TransientSlots {
    pub const NONE: TransientSlots = TransientSlots(0);

    pub fn from_params(params: &[PipelineLayoutParam]) -> Self {
        let bits = params
            .iter()
            .enumerate()
            .take(64)
            .filter(|(_, param)| param.is_transient())
            .fold(0u64, |acc, (index, _)| acc | (1 << index));
        Self(bits)
    }

    pub fn with(self, index: u32) -> Self {
        if index < 64 {
            Self(self.0 | (1 << index))
        } else {
            self
        }
    }

    pub fn contains(self, index: usize) -> bool {
        index < 64 && self.0 & (1 << index) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CaptureKind {
    Pipeline,
    RenderTargets,
    RenderPass,
    DescriptorTables,
    PushDescriptors,
    PushConstants,
    Viewports,
    ScissorRects,
    DynamicState,
}

/// One recorded bind, ready to be re-issued.
#[derive(Debug, Clone, PartialEq)]
pub enum Captured {
    Pipeline {
        stages: PipelineStages,
        pipeline: PipelineHandle,
    },
    RenderTargets {
        targets: Vec<ResourceViewHandle>,
        depth_stencil: ResourceViewHandle,
    },
    RenderPass {
        targets: Vec<RenderPassRenderTarget>,
        depth_stencil: Option<RenderPassDepthStencil>,
    },
    DescriptorTables {
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        tables: Vec<DescriptorTableHandle>,
    },
    PushDescriptors {
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        update: DescriptorTableUpdate,
    },
    PushConstants {
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        values: Vec<u32>,
    },
    Viewports(Vec<Viewport>),
    ScissorRects(Vec<Rect>),
    DynamicState {
        state: DynamicState,
        value: u32,
    },
}

impl Captured {
    pub fn kind(&self) -> CaptureKind {
        match self {
            Captured::Pipeline { .. } => CaptureKind::Pipeline,
            Captured::RenderTargets { .. } => CaptureKind::RenderTargets,
            Captured::RenderPass { .. } => CaptureKind::RenderPass,
            Captured::DescriptorTables { .. } => CaptureKind::DescriptorTables,
            Captured::PushDescriptors { .. } => CaptureKind::PushDescriptors,
            Captured::PushConstants { .. } => CaptureKind::PushConstants,
            Captured::Viewports(_) => CaptureKind::Viewports,
            Captured::ScissorRects(_) => CaptureKind::ScissorRects,
            Captured::DynamicState { .. } => CaptureKind::DynamicState,
        }
    }

    pub fn replay(
        &self,
        cmd: &mut dyn CommandList,
        transient_for: &dyn Fn(PipelineLayoutHandle) -> TransientSlots,
    ) {
        match self {
            Captured::Pipeline { stages, pipeline } => cmd.bind_pipeline(*stages, *pipeline),
            Captured::RenderTargets {
                targets,
                depth_stencil,
            } => cmd.bind_render_targets_and_depth_stencil(targets, *depth_stencil),
            Captured::RenderPass {
                targets,
                depth_stencil,
            } => {
                // Re-entering a pass must not clear what the host already drew.
                let loaded: Vec<RenderPassRenderTarget> = targets
                    .iter()
                    .map(|target| RenderPassRenderTarget {
                        view: target.view,
                        clear_color: None,
                    })
                    .collect();
                cmd.begin_render_pass(&loaded, depth_stencil.as_ref());
            }
            Captured::DescriptorTables {
                stages,
                layout,
                tables,
            } => rebind_tables(cmd, *stages, *layout, tables, transient_for(*layout)),
            Captured::PushDescriptors {
                stages,
                layout,
                param,
                update,
            } => cmd.push_descriptors(*stages, *layout, *param, update),
            Captured::PushConstants {
                stages,
                layout,
                param,
                values,
            } => cmd.push_constants(*stages, *layout, *param, 0, values),
            Captured::Viewports(viewports) => cmd.bind_viewports(0, viewports),
            Captured::ScissorRects(rects) => cmd.bind_scissor_rects(0, rects),
            Captured::DynamicState { state, value } => {
                cmd.bind_pipeline_states(&[*state], &[*value])
            }
        }
    }
}

/// Rebinds `tables` in as few calls as possible, skipping transient and
/// never-bound slots. Each skipped slot ends the current batch.
fn rebind_tables(
    cmd: &mut dyn CommandList,
    stages: ShaderStages,
    layout: PipelineLayoutHandle,
    tables: &[DescriptorTableHandle],
    transient: TransientSlots,
) {
    let mut batch_start = 0usize;
    let mut batch: Vec<DescriptorTableHandle> = Vec::new();
    for (index, table) in tables.iter().enumerate() {
        if transient.contains(index) || table.is_null() {
            if !batch.is_empty() {
                cmd.bind_descriptor_tables(stages, layout, batch_start as u32, &batch);
                batch.clear();
            }
            continue;
        }
        if batch.is_empty() {
            batch_start = index;
        }
        batch.push(*table);
    }
    if !batch.is_empty() {
        cmd.bind_descriptor_tables(stages, layout, batch_start as u32, &batch);
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Stamped<T> {
    call: CallIndex,
    value: T,
}

#[derive(Debug, Clone, PartialEq)]
struct BoundTables {
    layout: PipelineLayoutHandle,
    tables: Vec<DescriptorTableHandle>,
}

#[derive(Debug, Clone, PartialEq)]
struct PushedConstants {
    layout: PipelineLayoutHandle,
    values: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
struct PushedDescriptors {
    layout: PipelineLayoutHandle,
    update: DescriptorTableUpdate,
}

/// Latest observed pipeline bindings of one command list.
#[derive(Debug, Default)]
pub struct StateTracker {
    next_call: CallIndex,
    pipelines: BTreeMap<u32, Stamped<PipelineHandle>>,
    render_targets: Option<Stamped<(Vec<ResourceViewHandle>, ResourceViewHandle)>>,
    render_pass: Option<Stamped<(Vec<RenderPassRenderTarget>, Option<RenderPassDepthStencil>)>>,
    bound_targets: Vec<ResourceViewHandle>,
    descriptor_tables: BTreeMap<u32, Stamped<BoundTables>>,
    push_descriptors: BTreeMap<(u32, u32), Stamped<PushedDescriptors>>,
    push_constants: BTreeMap<(u32, u32), Stamped<PushedConstants>>,
    viewports: Option<Stamped<Vec<Viewport>>>,
    scissor_rects: Option<Stamped<Vec<Rect>>>,
    dynamic_states: BTreeMap<DynamicState, Stamped<u32>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every capture; called when a command list starts recording.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn call_index(&self) -> CallIndex {
        self.next_call
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
            && self.render_targets.is_none()
            && self.render_pass.is_none()
            && self.descriptor_tables.is_empty()
            && self.push_descriptors.is_empty()
            && self.push_constants.is_empty()
            && self.viewports.is_none()
            && self.scissor_rects.is_none()
            && self.dynamic_states.is_empty()
    }

    fn stamp(&mut self) -> CallIndex {
        let call = self.next_call;
        self.next_call += 1;
        call
    }

    pub fn on_bind_pipeline(&mut self, stages: PipelineStages, pipeline: PipelineHandle) {
        let call = self.stamp();
        // A pipeline bound to a superset of stages replaces narrower binds.
        self.pipelines
            .retain(|&bits, _| !stages.contains(PipelineStages::from_bits_retain(bits)));
        self.pipelines.insert(
            stages.bits(),
            Stamped {
                call,
                value: pipeline,
            },
        );
    }

    pub fn on_bind_render_targets_and_depth_stencil(
        &mut self,
        targets: &[ResourceViewHandle],
        depth_stencil: ResourceViewHandle,
    ) {
        let call = self.stamp();
        self.render_pass = None;
        self.bound_targets = targets.to_vec();
        self.render_targets = Some(Stamped {
            call,
            value: (targets.to_vec(), depth_stencil),
        });
    }

    pub fn on_begin_render_pass(
        &mut self,
        targets: &[RenderPassRenderTarget],
        depth_stencil: Option<&RenderPassDepthStencil>,
    ) {
        let call = self.stamp();
        self.render_targets = None;
        self.bound_targets = targets.iter().map(|target| target.view).collect();
        self.render_pass = Some(Stamped {
            call,
            value: (targets.to_vec(), depth_stencil.copied()),
        });
    }

    pub fn on_end_render_pass(&mut self) {
        self.render_pass = None;
        self.bound_targets.clear();
    }

    pub fn on_bind_descriptor_tables(
        &mut self,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        first: u32,
        tables: &[DescriptorTableHandle],
    ) {
        let call = self.stamp();
        let entry = self
            .descriptor_tables
            .entry(stages.bits())
            .or_insert_with(|| Stamped {
                call,
                value: BoundTables {
                    layout,
                    tables: Vec::new(),
                },
            });
        entry.call = call;
        if entry.value.layout != layout {
            entry.value.layout = layout;
            entry.value.tables.clear();
        }
        let first = first as usize;
        let end = first + tables.len();
        if entry.value.tables.len() < end {
            entry.value.tables.resize(end, DescriptorTableHandle::NULL);
        }
        entry.value.tables[first..end].copy_from_slice(tables);
    }

    pub fn on_push_descriptors(
        &mut self,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        update: &DescriptorTableUpdate,
    ) {
        let call = self.stamp();
        self.push_descriptors.insert(
            (stages.bits(), param),
            Stamped {
                call,
                value: PushedDescriptors {
                    layout,
                    update: update.clone(),
                },
            },
        );
    }

    pub fn on_push_constants(
        &mut self,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        first: u32,
        values: &[u32],
    ) {
        let call = self.stamp();
        let entry = self
            .push_constants
            .entry((stages.bits(), param))
            .or_insert_with(|| Stamped {
                call,
                value: PushedConstants {
                    layout,
                    values: Vec::new(),
                },
            });
        entry.call = call;
        if entry.value.layout != layout {
            entry.value.layout = layout;
            entry.value.values.clear();
        }
        let first = first as usize;
        let end = first + values.len();
        if entry.value.values.len() < end {
            entry.value.values.resize(end, 0);
        }
        entry.value.values[first..end].copy_from_slice(values);
    }

    pub fn on_bind_viewports(&mut self, first: u32, viewports: &[Viewport]) {
        let call = self.stamp();
        let slot = self.viewports.get_or_insert_with(|| Stamped {
            call,
            value: Vec::new(),
        });
        slot.call = call;
        merge_into(&mut slot.value, first as usize, viewports);
    }

    pub fn on_bind_scissor_rects(&mut self, first: u32, rects: &[Rect]) {
        let call = self.stamp();
        let slot = self.scissor_rects.get_or_insert_with(|| Stamped {
            call,
            value: Vec::new(),
        });
        slot.call = call;
        merge_into(&mut slot.value, first as usize, rects);
    }

    /// Each state value gets its own call index.
    pub fn on_bind_pipeline_states(&mut self, states: &[DynamicState], values: &[u32]) {
        for (state, value) in states.iter().zip(values) {
            let call = self.stamp();
            self.dynamic_states.insert(
                *state,
                Stamped {
                    call,
                    value: *value,
                },
            );
        }
    }

    /// Render target views currently bound, from either an explicit bind or
    /// the active render pass.
    pub fn render_targets(&self) -> &[ResourceViewHandle] {
        &self.bound_targets
    }

    pub fn depth_stencil(&self) -> ResourceViewHandle {
        if let Some(slot) = &self.render_targets {
            return slot.value.1;
        }
        self.render_pass
            .as_ref()
            .and_then(|slot| slot.value.1)
            .map(|ds| ds.view)
            .unwrap_or(ResourceViewHandle::NULL)
    }

    pub fn bound_pipeline(&self, stage: PipelineStages) -> Option<PipelineHandle> {
        self.pipelines
            .iter()
            .filter(|(bits, _)| PipelineStages::from_bits_retain(**bits).intersects(stage))
            .max_by_key(|(_, slot)| slot.call)
            .map(|(_, slot)| slot.value)
    }

    /// Descriptor tables bound for any stage set overlapping `stage`.
    pub fn descriptor_tables(
        &self,
        stage: ShaderStages,
    ) -> Option<(PipelineLayoutHandle, &[DescriptorTableHandle])> {
        self.descriptor_tables
            .iter()
            .filter(|(bits, _)| ShaderStages::from_bits_retain(**bits).intersects(stage))
            .max_by_key(|(_, slot)| slot.call)
            .map(|(_, slot)| (slot.value.layout, slot.value.tables.as_slice()))
    }

    pub fn pushed_descriptors(
        &self,
        stage: ShaderStages,
        param: u32,
    ) -> Option<&DescriptorTableUpdate> {
        self.push_descriptors
            .iter()
            .filter(|((bits, slot_param), _)| {
                *slot_param == param && ShaderStages::from_bits_retain(*bits).intersects(stage)
            })
            .max_by_key(|(_, slot)| slot.call)
            .map(|(_, slot)| &slot.value.update)
    }

    pub fn viewports(&self) -> &[Viewport] {
        self.viewports
            .as_ref()
            .map(|slot| slot.value.as_slice())
            .unwrap_or(&[])
    }

    pub fn dynamic_state(&self, state: DynamicState) -> Option<u32> {
        self.dynamic_states.get(&state).map(|slot| slot.value)
    }

    /// Every recorded capture, oldest first.
    pub fn snapshot(&self) -> Vec<(CallIndex, Captured)> {
        let mut captures = Vec::new();
        for (&bits, slot) in &self.pipelines {
            captures.push((
                slot.call,
                Captured::Pipeline {
                    stages: PipelineStages::from_bits_retain(bits),
                    pipeline: slot.value,
                },
            ));
        }
        if let Some(slot) = &self.render_targets {
            captures.push((
                slot.call,
                Captured::RenderTargets {
                    targets: slot.value.0.clone(),
                    depth_stencil: slot.value.1,
                },
            ));
        }
        if let Some(slot) = &self.render_pass {
            captures.push((
                slot.call,
                Captured::RenderPass {
                    targets: slot.value.0.clone(),
                    depth_stencil: slot.value.1,
                },
            ));
        }
        for (&bits, slot) in &self.descriptor_tables {
            captures.push((
                slot.call,
                Captured::DescriptorTables {
                    stages: ShaderStages::from_bits_retain(bits),
                    layout: slot.value.layout,
                    tables: slot.value.tables.clone(),
                },
            ));
        }
        for (&(bits, param), slot) in &self.push_descriptors {
            captures.push((
                slot.call,
                Captured::PushDescriptors {
                    stages: ShaderStages::from_bits_retain(bits),
                    layout: slot.value.layout,
                    param,
                    update: slot.value.update.clone(),
                },
            ));
        }
        for (&(bits, param), slot) in &self.push_constants {
            captures.push((
                slot.call,
                Captured::PushConstants {
                    stages: ShaderStages::from_bits_retain(bits),
                    layout: slot.value.layout,
                    param,
                    values: slot.value.values.clone(),
                },
            ));
        }
        if let Some(slot) = &self.viewports {
            captures.push((slot.call, Captured::Viewports(slot.value.clone())));
        }
        if let Some(slot) = &self.scissor_rects {
            captures.push((slot.call, Captured::ScissorRects(slot.value.clone())));
        }
        for (&state, slot) in &self.dynamic_states {
            captures.push((
                slot.call,
                Captured::DynamicState {
                    state,
                    value: slot.value,
                },
            ));
        }
        captures.sort_by_key(|(call, _)| *call);
        captures
    }

    /// Re-issues every captured bind in call order. Kinds never observed
    /// since the last reset are left alone.
    pub fn re_apply_state(
        &self,
        cmd: &mut dyn CommandList,
        transient_for: &dyn Fn(PipelineLayoutHandle) -> TransientSlots,
    ) {
        let captures = self.snapshot();
        trace!(count = captures.len(), "re-applying captured pipeline state");
        for (_, capture) in &captures {
            capture.replay(cmd, transient_for);
        }
    }
}

fn merge_into<T: Copy + Default>(dest: &mut Vec<T>, first: usize, values: &[T]) {
    let end = first + values.len();
    if dest.len() < end {
        dest.resize(end, T::default());
    }
    dest[first..end].copy_from_slice(values);
}
