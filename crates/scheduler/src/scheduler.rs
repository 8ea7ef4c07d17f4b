//! Call-site handlers: populate the action queue on shader binds, resolve
//! owed actions against bound resources, execute them, and put the host's
//! pipeline state back afterwards.

use groupconfig::{
    BindingMode, BindingSource, ConstantExtractionConfig, GroupId, ShaderIdentity,
    SwapchainMatchMode, ToggleGroup,
};
use pipestate::{
    BufferRange, CommandList, EffectRuntime, PipelineHandle, PipelineStages,
    RenderPassDepthStencil, RenderPassRenderTarget, ResourceUsage, ResourceViewHandle,
};
use tracing::{debug, trace};

use crate::descriptors::DescriptorEntry;
use crate::device::{ensure_texture, BindingEntry, DeviceState};
use crate::queue::{ActionBits, ActionKind, CallSite, Stage};
use crate::resolve::{
    cycle_index, describe_view, resolve_index, resolve_render_target, CycleDirection,
    ResolveFailure, ResolvedView,
};
use crate::state::{CommandListState, WorkItem};

/// Binding name under which the edited group's target is published.
pub const PREVIEW_BINDING: &str = "__drawhook_preview";

/// Kinds in the order they execute at one call site: constants and bindings
/// are refreshed before effects that may read them.
const EXECUTION_ORDER: [ActionKind; 4] = [
    ActionKind::Constant,
    ActionKind::Binding,
    ActionKind::Effect,
    ActionKind::Preview,
];

/// What one handler injected into the command list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Injected {
    pub effects: usize,
    pub bindings: usize,
    pub constants: usize,
    pub previews: usize,
}

impl Injected {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn pipeline_stage(stage: Stage) -> PipelineStages {
    match stage {
        Stage::Pixel => PipelineStages::PIXEL_SHADER,
        Stage::Vertex => PipelineStages::VERTEX_SHADER,
    }
}

enum Outcome {
    Pending(WorkItem),
    Ready(ToggleGroup, WorkItem),
    Gone,
}

/// Runs one inbound event against a command list. Built per event; the
/// runtime may be absent, in which case queued work is left untouched.
pub struct Scheduler<'a> {
    device: &'a DeviceState,
    list: &'a mut CommandListState,
    cmd: &'a mut dyn CommandList,
    runtime: Option<&'a mut dyn EffectRuntime>,
    injected: Injected,
    needs_restore: bool,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        device: &'a DeviceState,
        list: &'a mut CommandListState,
        cmd: &'a mut dyn CommandList,
        runtime: Option<&'a mut dyn EffectRuntime>,
    ) -> Self {
        Self {
            device,
            list,
            cmd,
            runtime,
            injected: Injected::default(),
            needs_restore: false,
        }
    }

    /// Pipeline-bind site: runs matured after-draw work against the state
    /// left by the previous draw, then schedules work for the new shaders.
    pub fn bind_pipeline(mut self, stages: PipelineStages, pipeline: PipelineHandle) -> Injected {
        self.run_site(CallSite::BindPipeline);
        self.restore();
        self.list.tracker.on_bind_pipeline(stages, pipeline);

        let shaders = self.device.pipeline_shaders(pipeline);
        for stage in Stage::ALL {
            if stages.intersects(pipeline_stage(stage)) {
                self.shader_bound(stage, shaders.identity(stage));
            }
        }
        self.injected
    }

    /// Render-target-bind site: executes against the targets being replaced.
    pub fn bind_render_targets(
        mut self,
        targets: &[ResourceViewHandle],
        depth_stencil: ResourceViewHandle,
    ) -> Injected {
        self.run_site(CallSite::BindRenderTarget);
        self.restore();
        self.list
            .tracker
            .on_bind_render_targets_and_depth_stencil(targets, depth_stencil);
        self.list.resolved_targets.clear();
        self.injected
    }

    pub fn begin_render_pass(
        mut self,
        targets: &[RenderPassRenderTarget],
        depth_stencil: Option<&RenderPassDepthStencil>,
    ) -> Injected {
        self.run_site(CallSite::BindRenderTarget);
        self.restore();
        self.list.tracker.on_begin_render_pass(targets, depth_stencil);
        self.list.resolved_targets.clear();
        self.injected
    }

    pub fn draw(mut self) -> Injected {
        self.run_site(CallSite::Draw);
        self.restore();
        self.injected
    }

    /// Frame boundary: flushes after-draw work still waiting for a pipeline
    /// bind and resets the per-frame bookkeeping.
    pub fn present(mut self) -> Injected {
        self.run_site(CallSite::BindPipeline);
        self.restore();
        self.device.end_frame();
        self.injected
    }

    fn shader_bound(&mut self, stage: Stage, identity: ShaderIdentity) {
        let device = self.device;
        let groups = device.groups().matching(stage, identity);
        self.list.shader_mut(stage).rebind(identity, groups.clone());
        if groups.is_empty() {
            return;
        }
        trace!(?stage, %identity, groups = ?groups, "shader matched");
        let editing = device.groups().editing();
        for id in groups {
            let Some(group) = device.groups().get(id).cloned() else {
                continue;
            };
            self.schedule(stage, &group, editing);
        }
    }

    fn schedule(&mut self, stage: Stage, group: &ToggleGroup, editing: Option<GroupId>) {
        let device = self.device;
        let site = CallSite::for_invocation(group.invocation);
        let shader = self.list.shader_mut(stage);
        let mut at_site = ActionBits::empty();
        let mut at_draw = ActionBits::empty();

        if device.effects_enabled() {
            for technique in &group.techniques {
                if device.technique_owed(technique)
                    && !device.abandoned(group.id, ActionKind::Effect, technique)
                    && !shader.techniques.contains_key(technique)
                {
                    shader
                        .techniques
                        .insert(technique.clone(), WorkItem::new(group.id, site));
                    at_site |= ActionBits::of(ActionKind::Effect, stage);
                }
            }
        }

        if let Some(binding) = &group.binding {
            if device.binding_owed(&binding.name)
                && !device.abandoned(group.id, ActionKind::Binding, &binding.name)
                && !shader.bindings.contains_key(&binding.name)
            {
                shader
                    .bindings
                    .insert(binding.name.clone(), WorkItem::new(group.id, site));
                at_site |= ActionBits::of(ActionKind::Binding, stage);
            }
        }

        if group.constants.is_some()
            && device.constants_owed(group.id)
            && !device.abandoned(group.id, ActionKind::Constant, "")
            && !shader.constants.contains_key(&group.id)
        {
            shader
                .constants
                .insert(group.id, WorkItem::new(group.id, CallSite::Draw));
            at_draw |= ActionBits::of(ActionKind::Constant, stage);
        }

        if editing == Some(group.id)
            && device.preview_owed()
            && !device.abandoned(group.id, ActionKind::Preview, "")
            && shader.preview.is_none()
        {
            shader.preview = Some(WorkItem::new(group.id, site));
            at_site |= ActionBits::of(ActionKind::Preview, stage);
        }

        if !at_site.is_empty() || !at_draw.is_empty() {
            trace!(group = %group.id, ?site, bits = ?(at_site | at_draw), "queued actions");
        }
        self.list.queue.insert(site, at_site);
        self.list.queue.insert(CallSite::Draw, at_site | at_draw);
    }

    fn run_site(&mut self, site: CallSite) {
        if self.runtime.is_none() {
            return;
        }
        let bits = self.list.queue.take(site);
        if bits.is_empty() {
            return;
        }
        trace!(?site, ?bits, "draining call site");
        for stage in Stage::ALL {
            for kind in EXECUTION_ORDER {
                if bits.has(kind, stage) {
                    self.process(site, kind, stage);
                }
            }
        }
    }

    fn process(&mut self, site: CallSite, kind: ActionKind, stage: Stage) {
        match kind {
            ActionKind::Effect => {
                let names: Vec<String> = self.list.shader(stage).techniques.keys().cloned().collect();
                for name in names {
                    let Some(item) = self.list.shader_mut(stage).techniques.remove(&name) else {
                        continue;
                    };
                    match self.advance(site, kind, stage, &name, item) {
                        Outcome::Pending(item) => {
                            self.list.shader_mut(stage).techniques.insert(name, item);
                        }
                        Outcome::Ready(group, mut item) => {
                            if let Some(view) = item.execute() {
                                self.render_effect(&name, &group, view);
                            }
                        }
                        Outcome::Gone => {}
                    }
                }
            }
            ActionKind::Binding => {
                let names: Vec<String> = self.list.shader(stage).bindings.keys().cloned().collect();
                for name in names {
                    let Some(item) = self.list.shader_mut(stage).bindings.remove(&name) else {
                        continue;
                    };
                    match self.advance(site, kind, stage, &name, item) {
                        Outcome::Pending(item) => {
                            self.list.shader_mut(stage).bindings.insert(name, item);
                        }
                        Outcome::Ready(group, mut item) => {
                            if let Some(view) = item.execute() {
                                self.update_binding(&name, &group, view);
                            }
                        }
                        Outcome::Gone => {}
                    }
                }
            }
            ActionKind::Constant => self.extract_constants(site, stage),
            ActionKind::Preview => {
                let Some(item) = self.list.shader_mut(stage).preview.take() else {
                    return;
                };
                match self.advance(site, kind, stage, "", item) {
                    Outcome::Pending(item) => self.list.shader_mut(stage).preview = Some(item),
                    Outcome::Ready(_, mut item) => {
                        if let Some(view) = item.execute() {
                            self.capture_preview(view);
                        }
                    }
                    Outcome::Gone => {}
                }
            }
        }
    }

    /// Moves one item through its state machine at `site`. A ready item
    /// comes back resolved, still to be executed by the caller.
    fn advance(
        &mut self,
        site: CallSite,
        kind: ActionKind,
        stage: Stage,
        name: &str,
        mut item: WorkItem,
    ) -> Outcome {
        let Some(group) = self.device.groups().get(item.group).cloned() else {
            return Outcome::Gone;
        };
        let resolves_here =
            site == CallSite::Draw || (site == CallSite::BindRenderTarget && item.site == site);
        match item.resolved_view() {
            Some(_) if item.site == site => return Outcome::Ready(group, item),
            Some(_) => return Outcome::Pending(item),
            None if !resolves_here => return Outcome::Pending(item),
            None => {}
        }

        let bit = ActionBits::of(kind, stage);
        match self.resolve_for(kind, stage, &group) {
            Ok(view) => {
                item.resolve(view);
                if item.site == site {
                    return Outcome::Ready(group, item);
                }
                self.list.queue.insert(item.site, bit);
                Outcome::Pending(item)
            }
            Err(reason) => self.failed(site, (kind, stage), name, &group, item, &reason),
        }
    }

    fn failed(
        &mut self,
        site: CallSite,
        (kind, stage): (ActionKind, Stage),
        name: &str,
        group: &ToggleGroup,
        mut item: WorkItem,
        reason: &ResolveFailure,
    ) -> Outcome {
        let limit = self.device.settings().retry_limit();
        if item.fail(group.requeue_after_failure, limit) {
            trace!(group = %group.id, ?site, %reason, state = ?item.state, "requeued unresolved action");
            self.list.queue.insert(site, ActionBits::of(kind, stage));
            Outcome::Pending(item)
        } else {
            self.device.mark_abandoned(group.id, kind, name);
            debug!(group = %group.id, ?kind, action = name, ?site, %reason, "dropped unresolved action for this frame");
            Outcome::Gone
        }
    }

    fn swapchain(&self) -> (u32, u32) {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.back_buffer_resolution())
            .unwrap_or((0, 0))
    }

    fn resolve_for(&mut self, kind: ActionKind, stage: Stage, group: &ToggleGroup) -> Result<ResolvedView, ResolveFailure> {
        let swapchain = self.swapchain();
        match kind {
            ActionKind::Effect | ActionKind::Preview => {
                self.resolve_target(group.render_target_index, group.match_mode, swapchain)
            }
            ActionKind::Binding => match &group.binding {
                Some(binding) if binding.source == BindingSource::ShaderResource => {
                    let view = self
                        .bound_descriptor(stage, binding.slot_index, binding.descriptor_index)
                        .and_then(DescriptorEntry::view)
                        .ok_or(ResolveFailure::NothingBound)?;
                    describe_view(self.device.device(), view)
                }
                Some(binding) => {
                    self.resolve_target(binding.slot_index, SwapchainMatchMode::None, swapchain)
                }
                None => Err(ResolveFailure::NothingBound),
            },
            ActionKind::Constant => Err(ResolveFailure::NothingBound),
        }
    }

    fn resolve_target(
        &mut self,
        index: u32,
        mode: SwapchainMatchMode,
        swapchain: (u32, u32),
    ) -> Result<ResolvedView, ResolveFailure> {
        let device = self.device;
        let list = &mut *self.list;
        let cache = &mut list.resolved_targets;
        let describe = |slot: usize, view: ResourceViewHandle| -> Result<ResolvedView, ResolveFailure> {
            match cache.get(&(slot as u32)) {
                Some(resolved) if resolved.view == view => Ok(*resolved),
                _ => {
                    let resolved = describe_view(device.device(), view)?;
                    cache.insert(slot as u32, resolved);
                    Ok(resolved)
                }
            }
        };
        resolve_render_target(list.tracker.render_targets(), index, mode, swapchain, describe)
    }

    fn bound_descriptor(&self, stage: Stage, slot: u32, index: u32) -> Option<DescriptorEntry> {
        let entries = self
            .device
            .descriptors()
            .bound_entries(&self.list.tracker, stage, slot);
        let index = resolve_index(index, entries.len())?;
        entries[index]
    }

    fn constant_range(&self, stage: Stage, config: &ConstantExtractionConfig) -> Option<BufferRange> {
        self.bound_descriptor(stage, config.slot_index, config.descriptor_index)
            .and_then(DescriptorEntry::buffer)
    }

    fn render_effect(&mut self, technique: &str, group: &ToggleGroup, view: ResolvedView) {
        let device = self.device;
        if !device.technique_owed(technique) {
            return;
        }
        let Some(runtime) = self.runtime.as_deref_mut() else {
            return;
        };
        let views = device.views().render_views(device.device(), &view);
        let (rtv, rtv_srgb) = match views {
            Ok(pair) => pair,
            Err(err) => {
                device.warn_api("failed to create effect render views", &err);
                return;
            }
        };
        if runtime.render_technique(technique, &mut *self.cmd, rtv, rtv_srgb) {
            device.mark_rendered(technique);
            self.injected.effects += 1;
            self.needs_restore = true;
            debug!(
                technique = %technique,
                group = %group.id,
                resource = view.resource.0,
                "rendered effect"
            );
        } else {
            debug!(technique = %technique, "effect runtime does not provide technique");
        }
    }

    fn update_binding(&mut self, name: &str, group: &ToggleGroup, view: ResolvedView) {
        let device = self.device;
        let Some(config) = &group.binding else {
            return;
        };
        let Some(runtime) = self.runtime.as_deref_mut() else {
            return;
        };
        let mode = config.mode(device.settings().binding_mode);
        let mut bindings = device.bindings_mut();
        let mut copy = bindings.get(name).and_then(|entry| entry.copy);

        let entry = match mode {
            BindingMode::Alias => {
                if let Some(stale) = copy.take() {
                    stale.release(device.device());
                }
                let views = device.views().shader_views(device.device(), &view);
                match views {
                    Ok((srv, srv_srgb)) => BindingEntry {
                        source: view.resource,
                        srv,
                        srv_srgb,
                        format: view.format,
                        extent: view.extent,
                        copy: None,
                    },
                    Err(err) => {
                        device.warn_api("failed to create binding views", &err);
                        bindings.remove(name);
                        return;
                    }
                }
            }
            BindingMode::Copy => {
                let texture = match ensure_texture(device.device(), &mut copy, view.format, view.extent) {
                    Ok(texture) => texture,
                    Err(err) => {
                        device.warn_api("failed to create binding copy texture", &err);
                        bindings.remove(name);
                        return;
                    }
                };
                let state = match config.source {
                    BindingSource::RenderTarget => ResourceUsage::RENDER_TARGET,
                    BindingSource::ShaderResource => ResourceUsage::SHADER_RESOURCE,
                };
                self.cmd.barrier(view.resource, state, ResourceUsage::COPY_SOURCE);
                self.cmd.copy_resource(view.resource, texture.resource);
                self.cmd.barrier(view.resource, ResourceUsage::COPY_SOURCE, state);
                BindingEntry {
                    source: view.resource,
                    srv: texture.srv,
                    srv_srgb: texture.srv_srgb,
                    format: view.format,
                    extent: view.extent,
                    copy: Some(texture),
                }
            }
        };
        runtime.update_texture_binding(name, entry.srv, entry.srv_srgb);
        bindings.insert(name.to_string(), entry);
        drop(bindings);

        device.mark_binding_updated(name);
        self.injected.bindings += 1;
        debug!(binding = %name, group = %group.id, ?mode, "updated texture binding");
    }

    fn extract_constants(&mut self, site: CallSite, stage: Stage) {
        if site != CallSite::Draw {
            return;
        }
        let device = self.device;
        let ids: Vec<GroupId> = self.list.shader(stage).constants.keys().copied().collect();
        for id in ids {
            let Some(item) = self.list.shader_mut(stage).constants.remove(&id) else {
                continue;
            };
            let Some(group) = device.groups().get(id).cloned() else {
                continue;
            };
            let Some(config) = &group.constants else {
                continue;
            };
            let Some(range) = self.constant_range(stage, config) else {
                let key = (ActionKind::Constant, stage);
                if let Outcome::Pending(item) =
                    self.failed(site, key, "", &group, item, &ResolveFailure::NothingBound)
                {
                    self.list.shader_mut(stage).constants.insert(id, item);
                }
                continue;
            };
            let Some(runtime) = self.runtime.as_deref_mut() else {
                return;
            };
            let store = device.constants();
            store.set_buffer_range(id, range, device.device(), &mut *self.cmd);
            let written = store.apply_constant_values(runtime, &group, &device.constants_table());
            device.mark_constants_extracted(id);
            self.injected.constants += 1;
            trace!(group = %id, buffer = range.buffer.0, offset = range.offset, written, "extracted constants");
        }
    }

    fn capture_preview(&mut self, view: ResolvedView) {
        let device = self.device;
        let Some(runtime) = self.runtime.as_deref_mut() else {
            return;
        };
        let mut preview = device.preview_mut();
        let texture = match ensure_texture(device.device(), &mut preview.texture, view.format, view.extent) {
            Ok(texture) => texture,
            Err(err) => {
                device.warn_api("failed to create preview texture", &err);
                return;
            }
        };
        self.cmd
            .barrier(view.resource, ResourceUsage::RENDER_TARGET, ResourceUsage::COPY_SOURCE);
        self.cmd.copy_resource(view.resource, texture.resource);
        self.cmd
            .barrier(view.resource, ResourceUsage::COPY_SOURCE, ResourceUsage::RENDER_TARGET);
        preview.matched = true;
        drop(preview);
        runtime.update_texture_binding(PREVIEW_BINDING, texture.srv, texture.srv_srgb);
        self.injected.previews += 1;
    }

    /// Restores the host's bindings after an effect rendered, and retires
    /// effect bits for stages with nothing left to render.
    fn restore(&mut self) {
        if !self.needs_restore {
            return;
        }
        self.needs_restore = false;
        let device = self.device;
        self.list
            .tracker
            .re_apply_state(&mut *self.cmd, &|layout| device.transient_slots(layout));
        for stage in Stage::ALL {
            if !self.list.shader(stage).has_work(ActionKind::Effect) {
                let bit = ActionBits::of(ActionKind::Effect, stage);
                self.list.queue.remove(CallSite::Draw, bit);
                self.list.queue.remove(CallSite::BindPipeline, bit);
            }
        }
    }
}

/// Steps the edited descriptor index of a shader-resource binding to the
/// next populated slot. Returns the new index.
pub fn cycle_binding_index(
    device: &DeviceState,
    list: &CommandListState,
    group: GroupId,
    stage: Stage,
    direction: CycleDirection,
) -> Option<u32> {
    let (slot, current) = {
        let groups = device.groups();
        let binding = groups.get(group)?.binding.as_ref()?;
        (binding.slot_index, binding.descriptor_index)
    };
    let entries = device
        .descriptors()
        .bound_entries(&list.tracker, stage, slot);
    let next = cycle_index(current, entries.len(), direction, |index| {
        entries[index].and_then(DescriptorEntry::view).is_some()
    });
    let mut groups = device.groups_mut();
    let binding = groups.get_mut(group)?.binding.as_mut()?;
    binding.descriptor_index = next;
    Some(next)
}
