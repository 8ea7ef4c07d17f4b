//! Offline replay of recorded host event streams.
//!
//! A trace is a JSON document listing the resources a host created and the
//! commands it recorded, in order. Replaying runs every event through an
//! `Interceptor` attached to the in-memory host from `pipestate::recording`
//! and reports, per presented frame, what the core injected.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use groupconfig::{GroupId, HookConfig, ShaderIdentity};
use pipestate::recording::{MemoryDevice, RecordingCommandList, RecordingRuntime, RuntimeEvent};
use pipestate::{
    CommandList, DescriptorTableHandle, DescriptorTableUpdate, Device, DynamicState, Format,
    PipelineHandle, PipelineLayoutHandle, PipelineLayoutParam, PipelineStages, Rect,
    RenderPassDepthStencil, RenderPassRenderTarget, ResourceDesc, ResourceHandle,
    ResourceViewDesc, ResourceViewHandle, ShaderStages, Viewport,
};
use scheduler::{Injected, PipelineShaders};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::interceptor::{CommandListKey, DeviceKey, Interceptor};

#[derive(Debug, Clone, Deserialize)]
pub struct Trace {
    #[serde(default = "default_back_buffer")]
    pub back_buffer: (u32, u32),
    /// Techniques the replay runtime can render.
    #[serde(default)]
    pub techniques: Vec<String>,
    pub events: Vec<TraceEvent>,
}

fn default_back_buffer() -> (u32, u32) {
    (1920, 1080)
}

fn default_stages() -> PipelineStages {
    PipelineStages::ALL_GRAPHICS
}

fn default_vertex_count() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    CreateResource {
        handle: ResourceHandle,
        desc: ResourceDesc,
        #[serde(default)]
        data: Option<Vec<u8>>,
    },
    DestroyResource {
        handle: ResourceHandle,
    },
    CreateView {
        handle: ResourceViewHandle,
        resource: ResourceHandle,
        #[serde(default)]
        format: Format,
    },
    DestroyView {
        handle: ResourceViewHandle,
    },
    UpdateBuffer {
        handle: ResourceHandle,
        #[serde(default)]
        offset: u64,
        data: Vec<u8>,
    },
    CreatePipeline {
        handle: PipelineHandle,
        #[serde(default)]
        pixel: ShaderIdentity,
        #[serde(default)]
        vertex: ShaderIdentity,
    },
    DestroyPipeline {
        handle: PipelineHandle,
    },
    CreatePipelineLayout {
        handle: PipelineLayoutHandle,
        params: Vec<PipelineLayoutParam>,
    },
    UpdateDescriptorTables {
        updates: Vec<DescriptorTableUpdate>,
    },
    ResetCommandList,
    BindPipeline {
        #[serde(default = "default_stages")]
        stages: PipelineStages,
        pipeline: PipelineHandle,
    },
    BindRenderTargets {
        targets: Vec<ResourceViewHandle>,
        #[serde(default)]
        depth_stencil: ResourceViewHandle,
    },
    BeginRenderPass {
        targets: Vec<RenderPassRenderTarget>,
        #[serde(default)]
        depth_stencil: Option<RenderPassDepthStencil>,
    },
    EndRenderPass,
    BindDescriptorTables {
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        #[serde(default)]
        first: u32,
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
        #[serde(default)]
        first: u32,
        values: Vec<u32>,
    },
    BindViewports {
        #[serde(default)]
        first: u32,
        viewports: Vec<Viewport>,
    },
    BindScissorRects {
        #[serde(default)]
        first: u32,
        rects: Vec<Rect>,
    },
    BindPipelineStates {
        states: Vec<DynamicState>,
        values: Vec<u32>,
    },
    Draw {
        #[serde(default = "default_vertex_count")]
        vertex_count: u32,
    },
    DrawIndexed,
    DrawIndirect,
    Present,
    Resize {
        width: u32,
        height: u32,
    },
    SetEditing {
        group: Option<GroupId>,
    },
    SetGroupActive {
        group: GroupId,
        active: bool,
    },
    SetTechnique {
        name: String,
        enabled: bool,
    },
}

/// What the core did during one frame of a replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    pub host_draws: usize,
    pub effects: usize,
    pub bindings: usize,
    pub constants: usize,
    pub previews: usize,
    pub rendered: Vec<String>,
    pub updated_bindings: Vec<String>,
    pub uniform_writes: usize,
}

impl FrameReport {
    fn absorb(&mut self, injected: Injected) {
        self.effects += injected.effects;
        self.bindings += injected.bindings;
        self.constants += injected.constants;
        self.previews += injected.previews;
    }

    fn absorb_runtime(&mut self, events: Vec<RuntimeEvent>) {
        for event in events {
            match event {
                RuntimeEvent::Rendered { technique, .. } => self.rendered.push(technique),
                RuntimeEvent::BindingUpdated { name, .. } => self.updated_bindings.push(name),
                RuntimeEvent::UniformF32 { .. }
                | RuntimeEvent::UniformI32 { .. }
                | RuntimeEvent::UniformU32 { .. } => self.uniform_writes += 1,
            }
        }
    }

    fn is_idle(&self) -> bool {
        *self
            == Self {
                frame: self.frame,
                ..Self::default()
            }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub frames: Vec<FrameReport>,
}

impl ReplayReport {
    pub fn total_effects(&self) -> usize {
        self.frames.iter().map(|frame| frame.effects).sum()
    }
}

struct Replay {
    memory: Arc<MemoryDevice>,
    interceptor: Interceptor,
    device: DeviceKey,
    list: CommandListKey,
    cmd: RecordingCommandList,
    runtime: RecordingRuntime,
    current: FrameReport,
    report: ReplayReport,
}

impl Replay {
    fn new(config: HookConfig, trace: &Trace) -> Result<Self> {
        let memory = Arc::new(MemoryDevice::new());
        let interceptor = Interceptor::new(config);
        let device = interceptor.init_device(memory.clone());
        let list = interceptor
            .init_command_list(device)
            .ok_or_else(|| anyhow!("replay device vanished before its command list was created"))?;
        let techniques: Vec<&str> = trace.techniques.iter().map(String::as_str).collect();
        Ok(Self {
            cmd: RecordingCommandList::executing(memory.clone()),
            runtime: RecordingRuntime::new(trace.back_buffer, &techniques),
            current: FrameReport::default(),
            report: ReplayReport::default(),
            memory,
            interceptor,
            device,
            list,
        })
    }

    fn injected(&mut self, injected: Injected) {
        self.current.absorb(injected);
    }

    fn apply(&mut self, event: &TraceEvent) {
        let (interceptor, list, device) = (&self.interceptor, self.list, self.device);
        match event {
            TraceEvent::CreateResource { handle, desc, data } => {
                self.memory.insert_resource(*handle, *desc);
                if let Some(data) = data {
                    if let Err(err) = self.memory.write_buffer(*handle, 0, data) {
                        warn!(resource = handle.0, error = %err, "initial data rejected");
                    }
                }
                interceptor.init_resource(device, *handle, desc, data.as_deref());
            }
            TraceEvent::DestroyResource { handle } => {
                interceptor.destroy_resource(device, *handle);
                self.memory.destroy_resource(*handle);
            }
            TraceEvent::CreateView {
                handle,
                resource,
                format,
            } => {
                let format = if *format == Format::Unknown {
                    self.memory
                        .resource_desc(*resource)
                        .map(|desc| desc.format)
                        .unwrap_or_default()
                } else {
                    *format
                };
                interceptor.init_resource_view(device, *resource, *handle);
                self.memory
                    .insert_view(*handle, *resource, ResourceViewDesc { format });
            }
            TraceEvent::DestroyView { handle } => {
                interceptor.destroy_resource_view(device, *handle);
                self.memory.destroy_resource_view(*handle);
            }
            TraceEvent::UpdateBuffer {
                handle,
                offset,
                data,
            } => {
                interceptor.update_buffer_region(device, *handle, *offset, data);
                if let Err(err) = self.memory.write_buffer(*handle, *offset, data) {
                    warn!(resource = handle.0, error = %err, "buffer update rejected");
                }
            }
            TraceEvent::CreatePipeline {
                handle,
                pixel,
                vertex,
            } => interceptor.init_pipeline(
                device,
                *handle,
                PipelineShaders {
                    pixel: *pixel,
                    vertex: *vertex,
                },
            ),
            TraceEvent::DestroyPipeline { handle } => interceptor.destroy_pipeline(device, *handle),
            TraceEvent::CreatePipelineLayout { handle, params } => {
                interceptor.init_pipeline_layout(device, *handle, params)
            }
            TraceEvent::UpdateDescriptorTables { updates } => {
                interceptor.update_descriptor_tables(device, updates)
            }
            TraceEvent::ResetCommandList => {
                interceptor.reset_command_list(list);
                self.cmd.clear();
            }
            TraceEvent::BindPipeline { stages, pipeline } => {
                let injected = interceptor.bind_pipeline(
                    list,
                    &mut self.cmd,
                    Some(&mut self.runtime),
                    *stages,
                    *pipeline,
                );
                self.cmd.bind_pipeline(*stages, *pipeline);
                self.injected(injected);
            }
            TraceEvent::BindRenderTargets {
                targets,
                depth_stencil,
            } => {
                let injected = interceptor.bind_render_targets_and_depth_stencil(
                    list,
                    &mut self.cmd,
                    Some(&mut self.runtime),
                    targets,
                    *depth_stencil,
                );
                self.cmd
                    .bind_render_targets_and_depth_stencil(targets, *depth_stencil);
                self.injected(injected);
            }
            TraceEvent::BeginRenderPass {
                targets,
                depth_stencil,
            } => {
                let injected = interceptor.begin_render_pass(
                    list,
                    &mut self.cmd,
                    Some(&mut self.runtime),
                    targets,
                    depth_stencil.as_ref(),
                );
                self.cmd.begin_render_pass(targets, depth_stencil.as_ref());
                self.injected(injected);
            }
            TraceEvent::EndRenderPass => {
                interceptor.end_render_pass(list);
                self.cmd.end_render_pass();
            }
            TraceEvent::BindDescriptorTables {
                stages,
                layout,
                first,
                tables,
            } => {
                interceptor.bind_descriptor_tables(list, *stages, *layout, *first, tables);
                self.cmd
                    .bind_descriptor_tables(*stages, *layout, *first, tables);
            }
            TraceEvent::PushDescriptors {
                stages,
                layout,
                param,
                update,
            } => {
                interceptor.push_descriptors(list, *stages, *layout, *param, update);
                self.cmd.push_descriptors(*stages, *layout, *param, update);
            }
            TraceEvent::PushConstants {
                stages,
                layout,
                param,
                first,
                values,
            } => {
                interceptor.push_constants(list, *stages, *layout, *param, *first, values);
                self.cmd
                    .push_constants(*stages, *layout, *param, *first, values);
            }
            TraceEvent::BindViewports { first, viewports } => {
                interceptor.bind_viewports(list, *first, viewports);
                self.cmd.bind_viewports(*first, viewports);
            }
            TraceEvent::BindScissorRects { first, rects } => {
                interceptor.bind_scissor_rects(list, *first, rects);
                self.cmd.bind_scissor_rects(*first, rects);
            }
            TraceEvent::BindPipelineStates { states, values } => {
                interceptor.bind_pipeline_states(list, states, values);
                self.cmd.bind_pipeline_states(states, values);
            }
            TraceEvent::Draw { vertex_count } => {
                let injected = interceptor.draw(list, &mut self.cmd, Some(&mut self.runtime));
                self.cmd.draw(*vertex_count, 1, 0, 0);
                self.current.host_draws += 1;
                self.injected(injected);
            }
            TraceEvent::DrawIndexed => {
                let injected = interceptor.draw_indexed(list, &mut self.cmd, Some(&mut self.runtime));
                self.cmd.draw(3, 1, 0, 0);
                self.current.host_draws += 1;
                self.injected(injected);
            }
            TraceEvent::DrawIndirect => {
                let injected =
                    interceptor.draw_or_dispatch_indirect(list, &mut self.cmd, Some(&mut self.runtime));
                self.cmd.draw(3, 1, 0, 0);
                self.current.host_draws += 1;
                self.injected(injected);
            }
            TraceEvent::Present => {
                let injected = interceptor.present(list, &mut self.cmd, Some(&mut self.runtime));
                self.injected(injected);
                self.finish_frame();
            }
            TraceEvent::Resize { width, height } => {
                debug!(width, height, "back buffer resized");
                self.runtime.set_resolution((*width, *height));
            }
            TraceEvent::SetEditing { group } => interceptor.set_editing_group(device, *group),
            TraceEvent::SetGroupActive { group, active } => {
                interceptor.set_group_active(device, *group, *active);
            }
            TraceEvent::SetTechnique { name, enabled } => {
                interceptor.set_technique_enabled(device, name, *enabled)
            }
        }
    }

    fn finish_frame(&mut self) {
        let events = self.runtime.take_events();
        self.current.absorb_runtime(events);
        let frame = self.current.frame;
        let finished = std::mem::replace(
            &mut self.current,
            FrameReport {
                frame: frame + 1,
                ..FrameReport::default()
            },
        );
        debug!(frame, effects = finished.effects, draws = finished.host_draws, "frame replayed");
        self.report.frames.push(finished);
    }

    fn finish(mut self) -> ReplayReport {
        let events = self.runtime.take_events();
        self.current.absorb_runtime(events);
        if !self.current.is_idle() {
            self.finish_frame();
        }
        self.interceptor.destroy_device(self.device);
        self.report
    }
}

/// Replays `trace` under `config`.
pub fn replay(config: HookConfig, trace: &Trace) -> Result<ReplayReport> {
    let mut replay = Replay::new(config, trace)?;
    for event in &trace.events {
        replay.apply(event);
    }
    Ok(replay.finish())
}

pub fn parse_trace(input: &str) -> Result<Trace, serde_json::Error> {
    serde_json::from_str(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = r#"{
        "back_buffer": [1920, 1080],
        "techniques": ["Bloom"],
        "events": [
            { "event": "create_resource", "handle": 1,
              "desc": { "kind": "texture2d", "width": 1920, "height": 1080, "depth_or_layers": 1,
                        "levels": 1, "format": "r8_g8_b8_a8_unorm", "samples": 1,
                        "heap": "gpu_only", "usage": "RENDER_TARGET | SHADER_RESOURCE" } },
            { "event": "create_view", "handle": 2, "resource": 1 },
            { "event": "create_pipeline", "handle": 10, "pixel": "0xABCD" },
            { "event": "bind_render_targets", "targets": [2] },
            { "event": "bind_viewports", "viewports": [
                { "x": 0.0, "y": 0.0, "width": 1920.0, "height": 1080.0, "min_depth": 0.0, "max_depth": 1.0 } ] },
            { "event": "bind_pipeline", "pipeline": 10 },
            { "event": "draw" },
            { "event": "present" },
            { "event": "bind_pipeline", "pipeline": 10 },
            { "event": "draw" },
            { "event": "draw" },
            { "event": "present" }
        ]
    }"#;

    const CONFIG: &str = r#"
version = 1

[settings]
techniques = ["Bloom"]

[[groups]]
id = 1
pixel_shaders = ["0xABCD"]
techniques = ["Bloom"]
invocation = "before_draw"
match_mode = "resolution"
"#;

    #[test]
    fn replay_reports_one_effect_per_frame() {
        let trace = parse_trace(TRACE).unwrap();
        let config = HookConfig::from_toml_str(CONFIG).unwrap();
        let report = replay(config, &trace).unwrap();

        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.frames[0].effects, 1);
        assert_eq!(report.frames[0].rendered, vec!["Bloom".to_string()]);
        assert_eq!(report.frames[1].host_draws, 2);
        assert_eq!(report.frames[1].effects, 1);
        assert_eq!(report.total_effects(), 2);
    }

    #[test]
    fn unconfigured_replay_injects_nothing() {
        let trace = parse_trace(TRACE).unwrap();
        let report = replay(HookConfig::default(), &trace).unwrap();
        assert_eq!(report.total_effects(), 0);
        assert_eq!(report.frames[1].host_draws, 2);
    }

    #[test]
    fn trailing_events_form_a_partial_frame() {
        let mut trace = parse_trace(TRACE).unwrap();
        trace.events.push(TraceEvent::Draw { vertex_count: 3 });
        let report = replay(HookConfig::default(), &trace).unwrap();
        assert_eq!(report.frames.len(), 3);
        assert_eq!(report.frames[2].host_draws, 1);
    }
}
