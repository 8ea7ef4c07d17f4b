use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cbshadow::{ConstantsTable, MapEvent};
use groupconfig::{GroupId, HookConfig, ToggleGroup};
use parking_lot::{Mutex, RwLock};
use pipestate::{
    CommandList, DescriptorTableHandle, DescriptorTableUpdate, Device, DynamicState,
    EffectRuntime, PipelineHandle, PipelineLayoutHandle, PipelineLayoutParam, PipelineStages,
    Rect, RenderPassDepthStencil, RenderPassRenderTarget, ResourceDesc, ResourceHandle,
    ResourceViewHandle, ShaderStages, Viewport,
};
use scheduler::{
    cycle_binding_index, CommandListState, CycleDirection, DeviceState, Injected,
    PipelineShaders, Scheduler, Stage,
};
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, info, trace};

new_key_type! {
    /// Generation-checked handle of a device known to the interceptor.
    pub struct DeviceKey;
    /// Generation-checked handle of a command list known to the interceptor.
    pub struct CommandListKey;
}

struct CommandListEntry {
    device: DeviceKey,
    /// Set while the core records into the list; host callbacks triggered by
    /// that recording are ignored.
    injecting: AtomicBool,
    state: Mutex<CommandListState>,
}

struct InjectionGuard<'a>(&'a AtomicBool);

impl<'a> InjectionGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InjectionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Entry point for every host callback.
///
/// Devices and command lists are registered when the host creates them and
/// addressed through the returned keys afterwards. Events naming a key that
/// was never registered, or has since been destroyed, are ignored. No method
/// reports failure to the host.
pub struct Interceptor {
    config: RwLock<HookConfig>,
    devices: RwLock<SlotMap<DeviceKey, Arc<DeviceState>>>,
    lists: RwLock<SlotMap<CommandListKey, Arc<CommandListEntry>>>,
}

impl Interceptor {
    pub fn new(config: HookConfig) -> Self {
        Self {
            config: RwLock::new(config),
            devices: RwLock::new(SlotMap::with_key()),
            lists: RwLock::new(SlotMap::with_key()),
        }
    }

    /// Configuration applied to devices created from now on.
    pub fn set_config(&self, config: HookConfig) {
        *self.config.write() = config;
    }

    fn device(&self, key: DeviceKey) -> Option<Arc<DeviceState>> {
        self.devices.read().get(key).cloned()
    }

    fn list(&self, key: CommandListKey) -> Option<Arc<CommandListEntry>> {
        self.lists.read().get(key).cloned()
    }

    pub fn device_state(&self, key: DeviceKey) -> Option<Arc<DeviceState>> {
        self.device(key)
    }

    pub fn device_of(&self, list: CommandListKey) -> Option<DeviceKey> {
        self.list(list).map(|entry| entry.device)
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    pub fn command_list_count(&self) -> usize {
        self.lists.read().len()
    }

    /// Runs `f` against a command list's state unless the core is currently
    /// injecting into it.
    fn with_list<R>(
        &self,
        key: CommandListKey,
        f: impl FnOnce(&DeviceState, &mut CommandListState) -> R,
    ) -> Option<R> {
        let entry = self.list(key)?;
        if entry.injecting.load(Ordering::Acquire) {
            trace!("ignoring callback recorded by the core");
            return None;
        }
        let device = self.device(entry.device)?;
        let mut state = entry.state.lock();
        Some(f(&*device, &mut *state))
    }

    fn schedule(
        &self,
        key: CommandListKey,
        cmd: &mut dyn CommandList,
        runtime: Option<&mut dyn EffectRuntime>,
        handler: impl for<'s> FnOnce(Scheduler<'s>) -> Injected,
    ) -> Injected {
        let Some(entry) = self.list(key) else {
            return Injected::default();
        };
        let Some(device) = self.device(entry.device) else {
            return Injected::default();
        };
        let Some(_guard) = InjectionGuard::enter(&entry.injecting) else {
            trace!("ignoring callback recorded by the core");
            return Injected::default();
        };
        let runtime = runtime.map(|runtime| runtime as &mut dyn EffectRuntime);
        let mut state = entry.state.lock();
        handler(Scheduler::new(&device, &mut state, cmd, runtime))
    }

    // Device and command-list lifecycle.

    pub fn init_device(&self, device: Arc<dyn Device>) -> DeviceKey {
        let state = DeviceState::new(device, &self.config.read());
        info!(
            groups = state.groups().len(),
            capture = state.constants().strategy_name(),
            "device attached"
        );
        self.devices.write().insert(Arc::new(state))
    }

    /// Releases everything the core allocated on the device, along with the
    /// device's command lists.
    pub fn destroy_device(&self, key: DeviceKey) {
        let Some(state) = self.devices.write().remove(key) else {
            return;
        };
        self.lists.write().retain(|_, entry| entry.device != key);
        state.release();
        info!(frames = state.frame(), "device detached");
    }

    pub fn init_command_list(&self, device: DeviceKey) -> Option<CommandListKey> {
        self.device(device)?;
        let entry = CommandListEntry {
            device,
            injecting: AtomicBool::new(false),
            state: Mutex::new(CommandListState::new()),
        };
        Some(self.lists.write().insert(Arc::new(entry)))
    }

    pub fn destroy_command_list(&self, key: CommandListKey) {
        self.lists.write().remove(key);
    }

    pub fn reset_command_list(&self, key: CommandListKey) {
        self.with_list(key, |_, list| list.reset());
    }

    // Resource lifecycle.

    pub fn init_resource(
        &self,
        device: DeviceKey,
        resource: ResourceHandle,
        desc: &ResourceDesc,
        initial: Option<&[u8]>,
    ) {
        if resource.is_null() {
            return;
        }
        if let Some(state) = self.device(device) {
            state.resource_created(resource, desc, initial);
        }
    }

    /// Must be forwarded before the host frees `resource`.
    pub fn destroy_resource(&self, device: DeviceKey, resource: ResourceHandle) {
        if let Some(state) = self.device(device) {
            state.resource_destroyed(resource);
        }
    }

    pub fn init_resource_view(
        &self,
        device: DeviceKey,
        resource: ResourceHandle,
        view: ResourceViewHandle,
    ) {
        if view.is_null() {
            return;
        }
        if let Some(state) = self.device(device) {
            trace!(view = view.0, resource = resource.0, "resource view created");
            state.view_created(view);
        }
    }

    pub fn destroy_resource_view(&self, device: DeviceKey, view: ResourceViewHandle) {
        if let Some(state) = self.device(device) {
            state.view_destroyed(view);
        }
    }

    pub fn map_buffer_region(&self, device: DeviceKey, event: &MapEvent) {
        if let Some(state) = self.device(device) {
            state.constants().buffer_mapped(event);
        }
    }

    pub fn unmap_buffer_region(&self, device: DeviceKey, resource: ResourceHandle, written: &[u8]) {
        if let Some(state) = self.device(device) {
            state.constants().buffer_unmapped(resource, written);
        }
    }

    pub fn update_buffer_region(
        &self,
        device: DeviceKey,
        resource: ResourceHandle,
        offset: u64,
        data: &[u8],
    ) {
        if let Some(state) = self.device(device) {
            state.constants().update_buffer_region(resource, offset, data);
        }
    }

    /// The host's own bulk copy into mapped memory at `dest`. Returns whether
    /// the copy landed in a tracked region.
    pub fn intercept_bulk_copy(&self, device: DeviceKey, dest: u64, source: &[u8]) -> bool {
        self.device(device)
            .is_some_and(|state| state.constants().intercept_copy(dest, source))
    }

    // Pipeline lifecycle.

    pub fn init_pipeline(&self, device: DeviceKey, pipeline: PipelineHandle, shaders: PipelineShaders) {
        if let Some(state) = self.device(device) {
            debug!(pipeline = pipeline.0, pixel = %shaders.pixel, vertex = %shaders.vertex, "pipeline registered");
            state.register_pipeline(pipeline, shaders);
        }
    }

    pub fn destroy_pipeline(&self, device: DeviceKey, pipeline: PipelineHandle) {
        if let Some(state) = self.device(device) {
            state.forget_pipeline(pipeline);
        }
    }

    pub fn init_pipeline_layout(
        &self,
        device: DeviceKey,
        layout: PipelineLayoutHandle,
        params: &[PipelineLayoutParam],
    ) {
        if let Some(state) = self.device(device) {
            state.register_layout(layout, params);
        }
    }

    pub fn destroy_pipeline_layout(&self, device: DeviceKey, layout: PipelineLayoutHandle) {
        if let Some(state) = self.device(device) {
            state.forget_layout(layout);
        }
    }

    pub fn update_descriptor_tables(&self, device: DeviceKey, updates: &[DescriptorTableUpdate]) {
        if let Some(state) = self.device(device) {
            state.update_descriptor_tables(updates);
        }
    }

    pub fn destroy_descriptor_table(&self, device: DeviceKey, table: DescriptorTableHandle) {
        if let Some(state) = self.device(device) {
            state.forget_descriptor_table(table);
        }
    }

    // Per-draw state. Handlers run before the host records the call.

    pub fn bind_pipeline(
        &self,
        list: CommandListKey,
        cmd: &mut dyn CommandList,
        runtime: Option<&mut dyn EffectRuntime>,
        stages: PipelineStages,
        pipeline: PipelineHandle,
    ) -> Injected {
        self.schedule(list, cmd, runtime, |scheduler| {
            scheduler.bind_pipeline(stages, pipeline)
        })
    }

    pub fn bind_render_targets_and_depth_stencil(
        &self,
        list: CommandListKey,
        cmd: &mut dyn CommandList,
        runtime: Option<&mut dyn EffectRuntime>,
        targets: &[ResourceViewHandle],
        depth_stencil: ResourceViewHandle,
    ) -> Injected {
        self.schedule(list, cmd, runtime, |scheduler| {
            scheduler.bind_render_targets(targets, depth_stencil)
        })
    }

    pub fn begin_render_pass(
        &self,
        list: CommandListKey,
        cmd: &mut dyn CommandList,
        runtime: Option<&mut dyn EffectRuntime>,
        targets: &[RenderPassRenderTarget],
        depth_stencil: Option<&RenderPassDepthStencil>,
    ) -> Injected {
        self.schedule(list, cmd, runtime, |scheduler| {
            scheduler.begin_render_pass(targets, depth_stencil)
        })
    }

    pub fn end_render_pass(&self, list: CommandListKey) {
        self.with_list(list, |_, state| state.tracker.on_end_render_pass());
    }

    pub fn bind_descriptor_tables(
        &self,
        list: CommandListKey,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        first: u32,
        tables: &[DescriptorTableHandle],
    ) {
        self.with_list(list, |_, state| {
            state
                .tracker
                .on_bind_descriptor_tables(stages, layout, first, tables)
        });
    }

    pub fn push_descriptors(
        &self,
        list: CommandListKey,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        update: &DescriptorTableUpdate,
    ) {
        self.with_list(list, |_, state| {
            state.tracker.on_push_descriptors(stages, layout, param, update)
        });
    }

    pub fn push_constants(
        &self,
        list: CommandListKey,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        first: u32,
        values: &[u32],
    ) {
        self.with_list(list, |_, state| {
            state
                .tracker
                .on_push_constants(stages, layout, param, first, values)
        });
    }

    pub fn bind_viewports(&self, list: CommandListKey, first: u32, viewports: &[Viewport]) {
        self.with_list(list, |_, state| state.tracker.on_bind_viewports(first, viewports));
    }

    pub fn bind_scissor_rects(&self, list: CommandListKey, first: u32, rects: &[Rect]) {
        self.with_list(list, |_, state| state.tracker.on_bind_scissor_rects(first, rects));
    }

    pub fn bind_pipeline_states(&self, list: CommandListKey, states: &[DynamicState], values: &[u32]) {
        self.with_list(list, |_, state| {
            state.tracker.on_bind_pipeline_states(states, values)
        });
    }

    // Draw submission.

    pub fn draw(
        &self,
        list: CommandListKey,
        cmd: &mut dyn CommandList,
        runtime: Option<&mut dyn EffectRuntime>,
    ) -> Injected {
        self.schedule(list, cmd, runtime, |scheduler| scheduler.draw())
    }

    pub fn draw_indexed(
        &self,
        list: CommandListKey,
        cmd: &mut dyn CommandList,
        runtime: Option<&mut dyn EffectRuntime>,
    ) -> Injected {
        self.schedule(list, cmd, runtime, |scheduler| scheduler.draw())
    }

    pub fn draw_or_dispatch_indirect(
        &self,
        list: CommandListKey,
        cmd: &mut dyn CommandList,
        runtime: Option<&mut dyn EffectRuntime>,
    ) -> Injected {
        self.schedule(list, cmd, runtime, |scheduler| scheduler.draw())
    }

    /// Frame boundary, reported on the command list that presents.
    pub fn present(
        &self,
        list: CommandListKey,
        cmd: &mut dyn CommandList,
        runtime: Option<&mut dyn EffectRuntime>,
    ) -> Injected {
        self.schedule(list, cmd, runtime, |scheduler| scheduler.present())
    }

    // Configuration surface driven by the editing UI.

    pub fn set_editing_group(&self, device: DeviceKey, group: Option<GroupId>) {
        if let Some(state) = self.device(device) {
            state.groups_mut().set_editing(group);
        }
    }

    pub fn upsert_group(&self, device: DeviceKey, group: ToggleGroup) {
        if let Some(state) = self.device(device) {
            debug!(group = %group.id, "group updated");
            state.groups_mut().upsert(group);
        }
    }

    pub fn remove_group(&self, device: DeviceKey, group: GroupId) {
        if let Some(state) = self.device(device) {
            debug!(group = %group, "group removed");
            state.remove_group(group);
        }
    }

    pub fn set_group_active(&self, device: DeviceKey, group: GroupId, active: bool) -> bool {
        self.device(device)
            .is_some_and(|state| state.groups_mut().set_active(group, active))
    }

    pub fn set_technique_enabled(&self, device: DeviceKey, technique: &str, enabled: bool) {
        if let Some(state) = self.device(device) {
            state.set_technique_enabled(technique, enabled);
        }
    }

    pub fn set_effects_enabled(&self, device: DeviceKey, enabled: bool) {
        if let Some(state) = self.device(device) {
            state.set_effects_enabled(enabled);
        }
    }

    /// Replaces the name → uniform mapping after the effect runtime reloads.
    pub fn set_constants_table(&self, device: DeviceKey, table: ConstantsTable) {
        if let Some(state) = self.device(device) {
            state.set_constants_table(table);
        }
    }

    /// Steps a shader-resource binding's descriptor index over the entries
    /// currently bound on `list`.
    pub fn cycle_binding_index(
        &self,
        list: CommandListKey,
        group: GroupId,
        direction: CycleDirection,
    ) -> Option<u32> {
        self.with_list(list, |device, state| {
            cycle_binding_index(device, state, group, Stage::Pixel, direction)
        })
        .flatten()
    }

    /// Raw action-queue bits of a command list, sites packed draw first.
    pub fn pending_actions(&self, list: CommandListKey) -> Option<u32> {
        self.with_list(list, |_, state| state.queue.to_raw())
    }
}
