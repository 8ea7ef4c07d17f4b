//! In-memory host used by the trace replay tool and by tests.
//!
//! `MemoryDevice` keeps resources and views in tables and backs buffers with
//! real bytes, `RecordingCommandList` logs every command (optionally executing
//! copies against a `MemoryDevice`), and `RecordingRuntime` stands in for the
//! effect engine, recording what it was asked to do.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::device::{ApiError, CommandList, Device};
use crate::effect::{EffectRuntime, UniformSlot};
use crate::types::{
    BufferRange, DescriptorTableHandle, DescriptorTableUpdate, DynamicState, PipelineHandle,
    PipelineLayoutHandle, PipelineStages, Rect, RenderPassDepthStencil, RenderPassRenderTarget,
    ResourceDesc, ResourceHandle, ResourceUsage, ResourceViewDesc, ResourceViewHandle,
    ShaderStages, Viewport,
};

const FIRST_HANDLE: u64 = 1 << 32;

#[derive(Debug)]
struct MemoryResource {
    desc: ResourceDesc,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryTables {
    resources: HashMap<ResourceHandle, MemoryResource>,
    views: HashMap<ResourceViewHandle, (ResourceHandle, ResourceViewDesc)>,
}

/// A device whose resources live in host memory.
#[derive(Debug)]
pub struct MemoryDevice {
    next_handle: AtomicU64,
    tables: RwLock<MemoryTables>,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(FIRST_HANDLE),
            tables: RwLock::new(MemoryTables::default()),
        }
    }
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a host-created resource under a caller-chosen handle.
    pub fn insert_resource(&self, resource: ResourceHandle, desc: ResourceDesc) {
        let len = if desc.is_buffer() { desc.size() as usize } else { 0 };
        self.tables.write().resources.insert(
            resource,
            MemoryResource {
                desc,
                bytes: vec![0; len],
            },
        );
    }

    pub fn insert_view(&self, view: ResourceViewHandle, resource: ResourceHandle, desc: ResourceViewDesc) {
        self.tables.write().views.insert(view, (resource, desc));
    }

    pub fn write_buffer(&self, resource: ResourceHandle, offset: u64, data: &[u8]) -> Result<(), ApiError> {
        let mut tables = self.tables.write();
        let entry = tables
            .resources
            .get_mut(&resource)
            .ok_or(ApiError::UnknownHandle {
                kind: "resource",
                handle: resource.0,
            })?;
        let start = offset as usize;
        let end = start + data.len();
        if end > entry.bytes.len() {
            return Err(ApiError::OutOfRange {
                offset,
                size: data.len() as u64,
                len: entry.bytes.len() as u64,
            });
        }
        entry.bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    pub fn buffer_bytes(&self, resource: ResourceHandle) -> Option<Vec<u8>> {
        self.tables
            .read()
            .resources
            .get(&resource)
            .map(|entry| entry.bytes.clone())
    }

    pub fn contains_resource(&self, resource: ResourceHandle) -> bool {
        self.tables.read().resources.contains_key(&resource)
    }

    pub fn contains_view(&self, view: ResourceViewHandle) -> bool {
        self.tables.read().views.contains_key(&view)
    }

    pub fn resource_count(&self) -> usize {
        self.tables.read().resources.len()
    }

    fn copy_region(&self, source: BufferRange, dest: ResourceHandle, dest_offset: u64) {
        let mut tables = self.tables.write();
        let Some(src) = tables.resources.get(&source.buffer) else {
            return;
        };
        let size = source.resolved_size(src.bytes.len() as u64) as usize;
        let start = source.offset as usize;
        if start > src.bytes.len() {
            return;
        }
        let chunk = src.bytes[start..start + size].to_vec();
        if let Some(dst) = tables.resources.get_mut(&dest) {
            let dst_start = dest_offset as usize;
            let copy_len = chunk.len().min(dst.bytes.len().saturating_sub(dst_start));
            dst.bytes[dst_start..dst_start + copy_len].copy_from_slice(&chunk[..copy_len]);
        }
    }

    fn copy_whole(&self, source: ResourceHandle, dest: ResourceHandle) {
        let mut tables = self.tables.write();
        let Some(src) = tables.resources.get(&source) else {
            return;
        };
        let chunk = src.bytes.clone();
        if let Some(dst) = tables.resources.get_mut(&dest) {
            let len = chunk.len().min(dst.bytes.len());
            dst.bytes[..len].copy_from_slice(&chunk[..len]);
        }
    }
}

impl Device for MemoryDevice {
    fn resource_desc(&self, resource: ResourceHandle) -> Result<ResourceDesc, ApiError> {
        self.tables
            .read()
            .resources
            .get(&resource)
            .map(|entry| entry.desc)
            .ok_or(ApiError::UnknownHandle {
                kind: "resource",
                handle: resource.0,
            })
    }

    fn view_resource(&self, view: ResourceViewHandle) -> Result<ResourceHandle, ApiError> {
        self.tables
            .read()
            .views
            .get(&view)
            .map(|(resource, _)| *resource)
            .ok_or(ApiError::UnknownHandle {
                kind: "view",
                handle: view.0,
            })
    }

    fn view_desc(&self, view: ResourceViewHandle) -> Result<ResourceViewDesc, ApiError> {
        self.tables
            .read()
            .views
            .get(&view)
            .map(|(_, desc)| *desc)
            .ok_or(ApiError::UnknownHandle {
                kind: "view",
                handle: view.0,
            })
    }

    fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<ResourceHandle, ApiError> {
        let handle = ResourceHandle(self.allocate());
        self.insert_resource(handle, *desc);
        if let Some(data) = initial_data {
            self.write_buffer(handle, 0, data)?;
        }
        Ok(handle)
    }

    fn destroy_resource(&self, resource: ResourceHandle) {
        self.tables.write().resources.remove(&resource);
    }

    fn create_resource_view(
        &self,
        resource: ResourceHandle,
        _usage: ResourceUsage,
        desc: &ResourceViewDesc,
    ) -> Result<ResourceViewHandle, ApiError> {
        if !self.contains_resource(resource) {
            return Err(ApiError::CreateFailed(format!(
                "view of unknown resource {:#x}",
                resource.0
            )));
        }
        let view = ResourceViewHandle(self.allocate());
        self.insert_view(view, resource, *desc);
        Ok(view)
    }

    fn destroy_resource_view(&self, view: ResourceViewHandle) {
        self.tables.write().views.remove(&view);
    }

    fn read_buffer(
        &self,
        resource: ResourceHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), ApiError> {
        let tables = self.tables.read();
        let entry = tables
            .resources
            .get(&resource)
            .ok_or(ApiError::MapFailed(resource.0))?;
        let start = offset as usize;
        let end = start + out.len();
        if end > entry.bytes.len() {
            return Err(ApiError::OutOfRange {
                offset,
                size: out.len() as u64,
                len: entry.bytes.len() as u64,
            });
        }
        out.copy_from_slice(&entry.bytes[start..end]);
        Ok(())
    }
}

/// Every command a `RecordingCommandList` has seen, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BindPipeline {
        stages: PipelineStages,
        pipeline: PipelineHandle,
    },
    BindPipelineStates {
        states: Vec<DynamicState>,
        values: Vec<u32>,
    },
    BindViewports {
        first: u32,
        viewports: Vec<Viewport>,
    },
    BindScissorRects {
        first: u32,
        rects: Vec<Rect>,
    },
    BindRenderTargets {
        targets: Vec<ResourceViewHandle>,
        depth_stencil: ResourceViewHandle,
    },
    BeginRenderPass {
        targets: Vec<RenderPassRenderTarget>,
        depth_stencil: Option<RenderPassDepthStencil>,
    },
    EndRenderPass,
    PushConstants {
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        first: u32,
        values: Vec<u32>,
    },
    PushDescriptors {
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        update: DescriptorTableUpdate,
    },
    BindDescriptorTables {
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        first: u32,
        tables: Vec<DescriptorTableHandle>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    CopyResource {
        source: ResourceHandle,
        dest: ResourceHandle,
    },
    CopyBufferRegion {
        source: BufferRange,
        dest: ResourceHandle,
        dest_offset: u64,
    },
    Barrier {
        resource: ResourceHandle,
        old: ResourceUsage,
        new: ResourceUsage,
    },
}

/// Bindings in effect after folding a command log, used to compare the
/// pipeline state at two points in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundState {
    pub pipelines: BTreeMap<u32, PipelineHandle>,
    pub render_targets: Vec<ResourceViewHandle>,
    pub depth_stencil: ResourceViewHandle,
    pub render_pass_active: bool,
    pub descriptor_tables: BTreeMap<u32, (PipelineLayoutHandle, Vec<DescriptorTableHandle>)>,
    pub push_constants: BTreeMap<(u32, u32), Vec<u32>>,
    pub push_descriptors: BTreeMap<(u32, u32), DescriptorTableUpdate>,
    pub viewports: Vec<Viewport>,
    pub scissor_rects: Vec<Rect>,
    pub dynamic_states: BTreeMap<DynamicState, u32>,
}

fn merge<T: Copy + Default>(dest: &mut Vec<T>, first: usize, values: &[T]) {
    let end = first + values.len();
    if dest.len() < end {
        dest.resize(end, T::default());
    }
    dest[first..end].copy_from_slice(values);
}

impl BoundState {
    fn apply(&mut self, command: &Command) {
        match command {
            Command::BindPipeline { stages, pipeline } => {
                self.pipelines
                    .retain(|&bits, _| !stages.contains(PipelineStages::from_bits_retain(bits)));
                self.pipelines.insert(stages.bits(), *pipeline);
            }
            Command::BindPipelineStates { states, values } => {
                for (state, value) in states.iter().zip(values) {
                    self.dynamic_states.insert(*state, *value);
                }
            }
            Command::BindViewports { first, viewports } => {
                merge(&mut self.viewports, *first as usize, viewports)
            }
            Command::BindScissorRects { first, rects } => {
                merge(&mut self.scissor_rects, *first as usize, rects)
            }
            Command::BindRenderTargets {
                targets,
                depth_stencil,
            } => {
                self.render_targets = targets.clone();
                self.depth_stencil = *depth_stencil;
            }
            Command::BeginRenderPass {
                targets,
                depth_stencil,
            } => {
                self.render_targets = targets.iter().map(|target| target.view).collect();
                self.depth_stencil = depth_stencil
                    .map(|ds| ds.view)
                    .unwrap_or(ResourceViewHandle::NULL);
                self.render_pass_active = true;
            }
            Command::EndRenderPass => {
                self.render_pass_active = false;
            }
            Command::PushConstants {
                stages,
                param,
                first,
                values,
                ..
            } => {
                let entry = self.push_constants.entry((stages.bits(), *param)).or_default();
                merge(entry, *first as usize, values);
            }
            Command::PushDescriptors {
                stages,
                param,
                update,
                ..
            } => {
                self.push_descriptors
                    .insert((stages.bits(), *param), update.clone());
            }
            Command::BindDescriptorTables {
                stages,
                layout,
                first,
                tables,
            } => {
                let entry = self
                    .descriptor_tables
                    .entry(stages.bits())
                    .or_insert_with(|| (*layout, Vec::new()));
                if entry.0 != *layout {
                    *entry = (*layout, Vec::new());
                }
                let first = *first as usize;
                let end = first + tables.len();
                if entry.1.len() < end {
                    entry.1.resize(end, DescriptorTableHandle::NULL);
                }
                entry.1[first..end].copy_from_slice(tables);
            }
            Command::Draw { .. }
            | Command::CopyResource { .. }
            | Command::CopyBufferRegion { .. }
            | Command::Barrier { .. } => {}
        }
    }
}

/// A command list that logs everything recorded into it.
#[derive(Debug, Default)]
pub struct RecordingCommandList {
    commands: Vec<Command>,
    device: Option<Arc<MemoryDevice>>,
}

impl RecordingCommandList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies recorded into this list are executed immediately against `device`.
    pub fn executing(device: Arc<MemoryDevice>) -> Self {
        Self {
            commands: Vec::new(),
            device: Some(device),
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::Draw { .. }))
            .count()
    }

    pub fn bound_state(&self) -> BoundState {
        let mut state = BoundState::default();
        for command in &self.commands {
            state.apply(command);
        }
        state
    }
}

impl CommandList for RecordingCommandList {
    fn bind_pipeline(&mut self, stages: PipelineStages, pipeline: PipelineHandle) {
        self.commands.push(Command::BindPipeline { stages, pipeline });
    }

    fn bind_pipeline_states(&mut self, states: &[DynamicState], values: &[u32]) {
        self.commands.push(Command::BindPipelineStates {
            states: states.to_vec(),
            values: values.to_vec(),
        });
    }

    fn bind_viewports(&mut self, first: u32, viewports: &[Viewport]) {
        self.commands.push(Command::BindViewports {
            first,
            viewports: viewports.to_vec(),
        });
    }

    fn bind_scissor_rects(&mut self, first: u32, rects: &[Rect]) {
        self.commands.push(Command::BindScissorRects {
            first,
            rects: rects.to_vec(),
        });
    }

    fn bind_render_targets_and_depth_stencil(
        &mut self,
        targets: &[ResourceViewHandle],
        depth_stencil: ResourceViewHandle,
    ) {
        self.commands.push(Command::BindRenderTargets {
            targets: targets.to_vec(),
            depth_stencil,
        });
    }

    fn begin_render_pass(
        &mut self,
        targets: &[RenderPassRenderTarget],
        depth_stencil: Option<&RenderPassDepthStencil>,
    ) {
        self.commands.push(Command::BeginRenderPass {
            targets: targets.to_vec(),
            depth_stencil: depth_stencil.copied(),
        });
    }

    fn end_render_pass(&mut self) {
        self.commands.push(Command::EndRenderPass);
    }

    fn push_constants(
        &mut self,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        first: u32,
        values: &[u32],
    ) {
        self.commands.push(Command::PushConstants {
            stages,
            layout,
            param,
            first,
            values: values.to_vec(),
        });
    }

    fn push_descriptors(
        &mut self,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        update: &DescriptorTableUpdate,
    ) {
        self.commands.push(Command::PushDescriptors {
            stages,
            layout,
            param,
            update: update.clone(),
        });
    }

    fn bind_descriptor_tables(
        &mut self,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        first: u32,
        tables: &[DescriptorTableHandle],
    ) {
        self.commands.push(Command::BindDescriptorTables {
            stages,
            layout,
            first,
            tables: tables.to_vec(),
        });
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.commands.push(Command::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn copy_resource(&mut self, source: ResourceHandle, dest: ResourceHandle) {
        if let Some(device) = &self.device {
            device.copy_whole(source, dest);
        }
        self.commands.push(Command::CopyResource { source, dest });
    }

    fn copy_buffer_region(&mut self, source: BufferRange, dest: ResourceHandle, dest_offset: u64) {
        if let Some(device) = &self.device {
            device.copy_region(source, dest, dest_offset);
        }
        self.commands.push(Command::CopyBufferRegion {
            source,
            dest,
            dest_offset,
        });
    }

    fn barrier(&mut self, resource: ResourceHandle, old: ResourceUsage, new: ResourceUsage) {
        self.commands.push(Command::Barrier { resource, old, new });
    }
}

/// What a `RecordingRuntime` was asked to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Rendered {
        technique: String,
        rtv: ResourceViewHandle,
        rtv_srgb: ResourceViewHandle,
    },
    BindingUpdated {
        name: String,
        srv: ResourceViewHandle,
        srv_srgb: ResourceViewHandle,
    },
    UniformF32 {
        slot: UniformSlot,
        values: Vec<f32>,
    },
    UniformI32 {
        slot: UniformSlot,
        values: Vec<i32>,
    },
    UniformU32 {
        slot: UniformSlot,
        values: Vec<u32>,
    },
}

/// Effect runtime double. Rendering a technique binds its own pipeline,
/// targets and viewport and issues a full-screen draw, the way a real effect
/// pass disturbs host state.
#[derive(Debug, Clone)]
pub struct RecordingRuntime {
    resolution: (u32, u32),
    techniques: Vec<String>,
    events: Vec<RuntimeEvent>,
}

impl RecordingRuntime {
    pub const EFFECT_PIPELINE: PipelineHandle = PipelineHandle(0xEFFE_C700);

    pub fn new(resolution: (u32, u32), techniques: &[&str]) -> Self {
        Self {
            resolution,
            techniques: techniques.iter().map(|name| name.to_string()).collect(),
            events: Vec::new(),
        }
    }

    pub fn set_resolution(&mut self, resolution: (u32, u32)) {
        self.resolution = resolution;
    }

    pub fn events(&self) -> &[RuntimeEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<RuntimeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn rendered(&self) -> Vec<(&str, ResourceViewHandle)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                RuntimeEvent::Rendered { technique, rtv, .. } => Some((technique.as_str(), *rtv)),
                _ => None,
            })
            .collect()
    }
}

impl EffectRuntime for RecordingRuntime {
    fn back_buffer_resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn technique_names(&self) -> Vec<String> {
        self.techniques.clone()
    }

    fn render_technique(
        &mut self,
        technique: &str,
        cmd: &mut dyn CommandList,
        rtv: ResourceViewHandle,
        rtv_srgb: ResourceViewHandle,
    ) -> bool {
        if !self.techniques.iter().any(|name| name == technique) {
            return false;
        }
        cmd.bind_pipeline(PipelineStages::ALL_GRAPHICS, Self::EFFECT_PIPELINE);
        cmd.bind_render_targets_and_depth_stencil(&[rtv], ResourceViewHandle::NULL);
        cmd.bind_viewports(0, &[Viewport::covering(self.resolution.0, self.resolution.1)]);
        cmd.bind_pipeline_states(&[DynamicState::PrimitiveTopology], &[4]);
        cmd.draw(3, 1, 0, 0);
        self.events.push(RuntimeEvent::Rendered {
            technique: technique.to_string(),
            rtv,
            rtv_srgb,
        });
        true
    }

    fn update_texture_binding(
        &mut self,
        name: &str,
        srv: ResourceViewHandle,
        srv_srgb: ResourceViewHandle,
    ) {
        self.events.push(RuntimeEvent::BindingUpdated {
            name: name.to_string(),
            srv,
            srv_srgb,
        });
    }

    fn set_uniform_f32(&mut self, slot: UniformSlot, values: &[f32]) {
        self.events.push(RuntimeEvent::UniformF32 {
            slot,
            values: values.to_vec(),
        });
    }

    fn set_uniform_i32(&mut self, slot: UniformSlot, values: &[i32]) {
        self.events.push(RuntimeEvent::UniformI32 {
            slot,
            values: values.to_vec(),
        });
    }

    fn set_uniform_u32(&mut self, slot: UniformSlot, values: &[u32]) {
        self.events.push(RuntimeEvent::UniformU32 {
            slot,
            values: values.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Format, MemoryHeap};

    #[test]
    fn memory_device_copies_buffer_regions() {
        let device = Arc::new(MemoryDevice::new());
        let src = device
            .create_resource(
                &ResourceDesc::buffer(16, MemoryHeap::CpuToGpu, ResourceUsage::CONSTANT_BUFFER),
                Some(&[1u8; 16]),
            )
            .unwrap();
        let dst = device
            .create_resource(
                &ResourceDesc::buffer(8, MemoryHeap::GpuToCpu, ResourceUsage::COPY_DEST),
                None,
            )
            .unwrap();
        let mut cmd = RecordingCommandList::executing(device.clone());
        cmd.copy_buffer_region(
            BufferRange {
                buffer: src,
                offset: 4,
                size: 8,
            },
            dst,
            0,
        );
        let mut out = [0u8; 8];
        device.read_buffer(dst, 0, &mut out).unwrap();
        assert_eq!(out, [1u8; 8]);
        assert!(device.read_buffer(dst, 4, &mut [0u8; 8]).is_err());
    }

    #[test]
    fn views_resolve_to_resources() {
        let device = MemoryDevice::new();
        let texture = device
            .create_resource(
                &ResourceDesc::texture_2d(64, 32, Format::R8G8B8A8Unorm, ResourceUsage::RENDER_TARGET),
                None,
            )
            .unwrap();
        let view = device
            .create_resource_view(
                texture,
                ResourceUsage::RENDER_TARGET,
                &ResourceViewDesc {
                    format: Format::R8G8B8A8UnormSrgb,
                },
            )
            .unwrap();
        assert_eq!(device.view_resource(view).unwrap(), texture);
        assert_eq!(device.resource_desc(texture).unwrap().extent(), (64, 32));
        device.destroy_resource_view(view);
        assert!(device.view_resource(view).is_err());
    }

    #[test]
    fn runtime_rejects_unknown_techniques() {
        let mut runtime = RecordingRuntime::new((1920, 1080), &["Bloom"]);
        let mut cmd = RecordingCommandList::new();
        assert!(!runtime.render_technique("Missing", &mut cmd, ResourceViewHandle(1), ResourceViewHandle(1)));
        assert!(cmd.commands().is_empty());
        assert!(runtime.render_technique("Bloom", &mut cmd, ResourceViewHandle(1), ResourceViewHandle(2)));
        assert_eq!(cmd.draw_count(), 1);
        assert_eq!(runtime.rendered(), vec![("Bloom", ResourceViewHandle(1))]);
    }
}
