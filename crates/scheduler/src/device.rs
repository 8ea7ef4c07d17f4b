use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cbshadow::{ConstantShadowStore, ConstantsTable};
use groupconfig::{GroupId, HookConfig, Settings, ShaderIdentity};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use pipestate::{
    ApiError, DescriptorTableHandle, DescriptorTableUpdate, Device, Format, PipelineHandle,
    PipelineLayoutHandle, PipelineLayoutParam, ResourceDesc, ResourceHandle, ResourceUsage,
    ResourceViewDesc, ResourceViewHandle, TransientSlots,
};
use tracing::{debug, warn};

use crate::descriptors::DescriptorCache;
use crate::groups::GroupRegistry;
use crate::queue::{ActionKind, Stage};
use crate::resolve::ResolvedView;

/// Shader identities a pipeline was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineShaders {
    pub pixel: ShaderIdentity,
    pub vertex: ShaderIdentity,
}

impl PipelineShaders {
    pub fn identity(&self, stage: Stage) -> ShaderIdentity {
        match stage {
            Stage::Pixel => self.pixel,
            Stage::Vertex => self.vertex,
        }
    }
}

fn create_view(
    device: &dyn Device,
    resource: ResourceHandle,
    usage: ResourceUsage,
    format: Format,
) -> Result<ResourceViewHandle, ApiError> {
    device.create_resource_view(resource, usage, &ResourceViewDesc { format })
}

/// A texture the core owns, with shader-resource views in both colour spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedTexture {
    pub resource: ResourceHandle,
    pub srv: ResourceViewHandle,
    pub srv_srgb: ResourceViewHandle,
    pub format: Format,
    pub extent: (u32, u32),
}

impl OwnedTexture {
    pub fn create(device: &dyn Device, format: Format, extent: (u32, u32)) -> Result<Self, ApiError> {
        let desc = ResourceDesc::texture_2d(
            extent.0,
            extent.1,
            format.to_default_typed(),
            ResourceUsage::SHADER_RESOURCE | ResourceUsage::COPY_DEST,
        );
        let resource = device.create_resource(&desc, None)?;
        let views = create_view(device, resource, ResourceUsage::SHADER_RESOURCE, format.to_non_srgb())
            .and_then(|srv| {
                create_view(device, resource, ResourceUsage::SHADER_RESOURCE, format.to_srgb())
                    .map(|srv_srgb| (srv, srv_srgb))
                    .map_err(|err| {
                        device.destroy_resource_view(srv);
                        err
                    })
            });
        match views {
            Ok((srv, srv_srgb)) => Ok(Self {
                resource,
                srv,
                srv_srgb,
                format,
                extent,
            }),
            Err(err) => {
                device.destroy_resource(resource);
                Err(err)
            }
        }
    }

    pub fn fits(&self, format: Format, extent: (u32, u32)) -> bool {
        self.format.to_non_srgb() == format.to_non_srgb() && self.extent == extent
    }

    pub fn release(self, device: &dyn Device) {
        device.destroy_resource_view(self.srv);
        device.destroy_resource_view(self.srv_srgb);
        device.destroy_resource(self.resource);
    }
}

/// Reuses `slot` when it still fits the source, otherwise recreates it.
pub(crate) fn ensure_texture(
    device: &dyn Device,
    slot: &mut Option<OwnedTexture>,
    format: Format,
    extent: (u32, u32),
) -> Result<OwnedTexture, ApiError> {
    if let Some(texture) = slot.filter(|texture| texture.fits(format, extent)) {
        return Ok(texture);
    }
    if let Some(stale) = slot.take() {
        stale.release(device);
    }
    let texture = OwnedTexture::create(device, format, extent)?;
    debug!(resource = texture.resource.0, ?extent, ?format, "allocated copy texture");
    *slot = Some(texture);
    Ok(texture)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CachedViews {
    rtv: Option<(ResourceViewHandle, ResourceViewHandle)>,
    srv: Option<(ResourceViewHandle, ResourceViewHandle)>,
}

/// Non-sRGB / sRGB view pairs the core created on host resources.
#[derive(Debug, Default)]
pub struct ViewCache {
    entries: HashMap<ResourceHandle, CachedViews>,
}

impl ViewCache {
    fn pair(
        device: &dyn Device,
        resolved: &ResolvedView,
        usage: ResourceUsage,
    ) -> Result<(ResourceViewHandle, ResourceViewHandle), ApiError> {
        let plain = create_view(device, resolved.resource, usage, resolved.format.to_non_srgb())?;
        match create_view(device, resolved.resource, usage, resolved.format.to_srgb()) {
            Ok(srgb) => Ok((plain, srgb)),
            Err(err) => {
                device.destroy_resource_view(plain);
                Err(err)
            }
        }
    }

    pub fn render_views(
        &mut self,
        device: &dyn Device,
        resolved: &ResolvedView,
    ) -> Result<(ResourceViewHandle, ResourceViewHandle), ApiError> {
        let entry = self.entries.entry(resolved.resource).or_default();
        if let Some(pair) = entry.rtv {
            return Ok(pair);
        }
        let pair = Self::pair(device, resolved, ResourceUsage::RENDER_TARGET)?;
        entry.rtv = Some(pair);
        Ok(pair)
    }

    pub fn shader_views(
        &mut self,
        device: &dyn Device,
        resolved: &ResolvedView,
    ) -> Result<(ResourceViewHandle, ResourceViewHandle), ApiError> {
        let entry = self.entries.entry(resolved.resource).or_default();
        if let Some(pair) = entry.srv {
            return Ok(pair);
        }
        let pair = Self::pair(device, resolved, ResourceUsage::SHADER_RESOURCE)?;
        entry.srv = Some(pair);
        Ok(pair)
    }

    pub fn release(&mut self, device: &dyn Device, resource: ResourceHandle) {
        if let Some(views) = self.entries.remove(&resource) {
            for (plain, srgb) in views.rtv.into_iter().chain(views.srv) {
                device.destroy_resource_view(plain);
                device.destroy_resource_view(srgb);
            }
        }
    }

    pub fn release_all(&mut self, device: &dyn Device) {
        let resources: Vec<ResourceHandle> = self.entries.keys().copied().collect();
        for resource in resources {
            self.release(device, resource);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a published texture binding currently points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingEntry {
    pub source: ResourceHandle,
    pub srv: ResourceViewHandle,
    pub srv_srgb: ResourceViewHandle,
    pub format: Format,
    pub extent: (u32, u32),
    /// Copy destination when the binding is not an alias.
    pub copy: Option<OwnedTexture>,
}

#[derive(Debug, Default)]
pub struct PreviewState {
    pub texture: Option<OwnedTexture>,
    pub matched: bool,
}

#[derive(Debug, Default)]
struct FrameState {
    bindings: BTreeSet<String>,
    constants: BTreeSet<GroupId>,
    /// Work dropped after a failed resolution, keyed by action name.
    abandoned: BTreeSet<(GroupId, ActionKind, String)>,
}

/// Device-wide state shared by every command list of one device.
pub struct DeviceState {
    device: Arc<dyn Device>,
    settings: Settings,
    constants: ConstantShadowStore,
    effects_enabled: AtomicBool,
    frame: AtomicU64,
    /// Enabled technique → rendered this frame.
    techniques: RwLock<BTreeMap<String, bool>>,
    done: RwLock<FrameState>,
    groups: RwLock<GroupRegistry>,
    pipelines: RwLock<HashMap<PipelineHandle, PipelineShaders>>,
    layouts: RwLock<HashMap<PipelineLayoutHandle, TransientSlots>>,
    descriptors: RwLock<DescriptorCache>,
    views: RwLock<ViewCache>,
    bindings: RwLock<BTreeMap<String, BindingEntry>>,
    preview: RwLock<PreviewState>,
    constants_table: RwLock<ConstantsTable>,
}

impl std::fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceState")
            .field("settings", &self.settings)
            .field("frame", &self.frame())
            .field("groups", &self.groups.read().len())
            .finish_non_exhaustive()
    }
}

impl DeviceState {
    pub fn new(device: Arc<dyn Device>, config: &HookConfig) -> Self {
        let settings = config.settings.clone();
        let techniques = settings
            .techniques
            .iter()
            .map(|name| (name.clone(), false))
            .collect();
        Self {
            device,
            constants: ConstantShadowStore::new(settings.constant_capture),
            effects_enabled: AtomicBool::new(settings.effects_enabled),
            frame: AtomicU64::new(0),
            techniques: RwLock::new(techniques),
            done: RwLock::new(FrameState::default()),
            groups: RwLock::new(GroupRegistry::from_config(config)),
            pipelines: RwLock::new(HashMap::new()),
            layouts: RwLock::new(HashMap::new()),
            descriptors: RwLock::new(DescriptorCache::default()),
            views: RwLock::new(ViewCache::default()),
            bindings: RwLock::new(BTreeMap::new()),
            preview: RwLock::new(PreviewState::default()),
            constants_table: RwLock::new(ConstantsTable::new()),
            settings,
        }
    }

    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    pub fn constants(&self) -> &ConstantShadowStore {
        &self.constants
    }

    pub fn groups(&self) -> RwLockReadGuard<'_, GroupRegistry> {
        self.groups.read()
    }

    pub fn groups_mut(&self) -> RwLockWriteGuard<'_, GroupRegistry> {
        self.groups.write()
    }

    pub fn remove_group(&self, id: GroupId) {
        self.groups.write().remove(id);
        self.constants.remove_group(id, self.device());
    }

    pub fn effects_enabled(&self) -> bool {
        self.effects_enabled.load(Ordering::Relaxed)
    }

    pub fn set_effects_enabled(&self, enabled: bool) {
        self.effects_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_technique_enabled(&self, name: &str, enabled: bool) {
        let mut techniques = self.techniques.write();
        if enabled {
            techniques.entry(name.to_string()).or_insert(false);
        } else {
            techniques.remove(name);
        }
    }

    pub fn enabled_techniques(&self) -> Vec<String> {
        self.techniques.read().keys().cloned().collect()
    }

    /// Enabled and not yet rendered this frame.
    pub fn technique_owed(&self, name: &str) -> bool {
        self.techniques.read().get(name) == Some(&false)
    }

    pub fn mark_rendered(&self, name: &str) {
        if let Some(rendered) = self.techniques.write().get_mut(name) {
            *rendered = true;
        }
    }

    pub fn binding_owed(&self, name: &str) -> bool {
        !self.done.read().bindings.contains(name)
    }

    pub fn mark_binding_updated(&self, name: &str) {
        self.done.write().bindings.insert(name.to_string());
    }

    pub fn constants_owed(&self, group: GroupId) -> bool {
        !self.done.read().constants.contains(&group)
    }

    pub fn mark_constants_extracted(&self, group: GroupId) {
        self.done.write().constants.insert(group);
    }

    /// Whether `group` already dropped this action in the current frame.
    pub fn abandoned(&self, group: GroupId, kind: ActionKind, name: &str) -> bool {
        self.done
            .read()
            .abandoned
            .contains(&(group, kind, name.to_string()))
    }

    pub fn mark_abandoned(&self, group: GroupId, kind: ActionKind, name: &str) {
        self.done
            .write()
            .abandoned
            .insert((group, kind, name.to_string()));
    }

    pub fn preview_owed(&self) -> bool {
        !self.preview.read().matched
    }

    pub fn register_pipeline(&self, pipeline: PipelineHandle, shaders: PipelineShaders) {
        if pipeline.is_null() {
            return;
        }
        self.pipelines.write().insert(pipeline, shaders);
    }

    pub fn forget_pipeline(&self, pipeline: PipelineHandle) {
        self.pipelines.write().remove(&pipeline);
    }

    pub fn pipeline_shaders(&self, pipeline: PipelineHandle) -> PipelineShaders {
        self.pipelines
            .read()
            .get(&pipeline)
            .copied()
            .unwrap_or_default()
    }

    pub fn register_layout(&self, layout: PipelineLayoutHandle, params: &[PipelineLayoutParam]) {
        if layout.is_null() {
            return;
        }
        self.layouts
            .write()
            .insert(layout, TransientSlots::from_params(params));
    }

    pub fn forget_layout(&self, layout: PipelineLayoutHandle) {
        self.layouts.write().remove(&layout);
    }

    pub fn transient_slots(&self, layout: PipelineLayoutHandle) -> TransientSlots {
        self.layouts
            .read()
            .get(&layout)
            .copied()
            .unwrap_or(TransientSlots::NONE)
    }

    pub fn update_descriptor_tables(&self, updates: &[DescriptorTableUpdate]) {
        self.descriptors.write().update(updates);
    }

    pub fn forget_descriptor_table(&self, table: DescriptorTableHandle) {
        self.descriptors.write().forget_table(table);
    }

    pub fn descriptors(&self) -> RwLockReadGuard<'_, DescriptorCache> {
        self.descriptors.read()
    }

    pub(crate) fn views(&self) -> RwLockWriteGuard<'_, ViewCache> {
        self.views.write()
    }

    pub(crate) fn bindings_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, BindingEntry>> {
        self.bindings.write()
    }

    pub fn binding(&self, name: &str) -> Option<BindingEntry> {
        self.bindings.read().get(name).copied()
    }

    pub(crate) fn preview_mut(&self) -> RwLockWriteGuard<'_, PreviewState> {
        self.preview.write()
    }

    pub fn preview_texture(&self) -> Option<OwnedTexture> {
        self.preview.read().texture
    }

    pub fn set_constants_table(&self, table: ConstantsTable) {
        debug!(entries = table.len(), "constants table reloaded");
        *self.constants_table.write() = table;
    }

    pub fn constants_table(&self) -> RwLockReadGuard<'_, ConstantsTable> {
        self.constants_table.read()
    }

    pub fn resource_created(&self, resource: ResourceHandle, desc: &ResourceDesc, initial: Option<&[u8]>) {
        self.constants.buffer_created(resource, desc, initial);
    }

    /// Must run before the host frees `resource`.
    pub fn resource_destroyed(&self, resource: ResourceHandle) {
        self.constants.buffer_destroyed(resource);
        self.views.write().release(self.device(), resource);
        let mut bindings = self.bindings.write();
        let stale: Vec<String> = bindings
            .iter()
            .filter(|(_, entry)| entry.source == resource && entry.copy.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            debug!(binding = %name, resource = resource.0, "aliased binding source destroyed");
            bindings.remove(&name);
        }
    }

    /// A recycled view handle drops whatever descriptor contents were
    /// recorded for its previous owner.
    pub fn view_created(&self, view: ResourceViewHandle) {
        self.descriptors.write().forget_view(view);
    }

    pub fn view_destroyed(&self, view: ResourceViewHandle) {
        self.descriptors.write().forget_view(view);
    }

    /// Clears the per-frame bookkeeping.
    pub fn end_frame(&self) {
        for rendered in self.techniques.write().values_mut() {
            *rendered = false;
        }
        let mut done = self.done.write();
        done.bindings.clear();
        done.constants.clear();
        done.abandoned.clear();
        drop(done);
        self.preview.write().matched = false;
        self.frame.fetch_add(1, Ordering::Relaxed);
    }

    /// Frees everything the core allocated on the device.
    pub fn release(&self) {
        let device = self.device();
        self.views.write().release_all(device);
        for (_, entry) in std::mem::take(&mut *self.bindings.write()) {
            if let Some(copy) = entry.copy {
                copy.release(device);
            }
        }
        if let Some(texture) = self.preview.write().texture.take() {
            texture.release(device);
        }
        let groups: Vec<GroupId> = self.groups.read().iter().map(|group| group.id).collect();
        for group in groups {
            self.constants.remove_group(group, device);
        }
    }

    pub(crate) fn warn_api(&self, what: &str, err: &ApiError) {
        warn!(error = %err, "{what}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipestate::recording::MemoryDevice;

    fn state() -> (Arc<MemoryDevice>, DeviceState) {
        let memory = Arc::new(MemoryDevice::new());
        let mut config = HookConfig::default();
        config.settings.techniques = vec!["Bloom".into()];
        let state = DeviceState::new(memory.clone(), &config);
        (memory, state)
    }

    #[test]
    fn techniques_are_owed_once_per_frame() {
        let (_, state) = state();
        assert!(state.technique_owed("Bloom"));
        assert!(!state.technique_owed("SMAA"));
        state.mark_rendered("Bloom");
        assert!(!state.technique_owed("Bloom"));
        state.end_frame();
        assert!(state.technique_owed("Bloom"));
        assert_eq!(state.frame(), 1);

        state.set_technique_enabled("SMAA", true);
        state.set_technique_enabled("Bloom", false);
        assert_eq!(state.enabled_techniques(), vec!["SMAA".to_string()]);
    }

    #[test]
    fn abandoned_work_is_forgotten_at_the_frame_boundary() {
        let (_, state) = state();
        state.mark_abandoned(GroupId(1), ActionKind::Effect, "Bloom");
        assert!(state.abandoned(GroupId(1), ActionKind::Effect, "Bloom"));
        assert!(!state.abandoned(GroupId(2), ActionKind::Effect, "Bloom"));
        assert!(!state.abandoned(GroupId(1), ActionKind::Binding, "Bloom"));
        state.end_frame();
        assert!(!state.abandoned(GroupId(1), ActionKind::Effect, "Bloom"));
    }

    #[test]
    fn copy_textures_are_reused_until_the_source_changes() {
        let (memory, state) = state();
        let mut slot = None;
        let first = ensure_texture(state.device(), &mut slot, Format::R8G8B8A8UnormSrgb, (64, 64)).unwrap();
        let again = ensure_texture(state.device(), &mut slot, Format::R8G8B8A8Unorm, (64, 64)).unwrap();
        assert_eq!(first, again);
        assert_eq!(memory.resource_count(), 1);

        let resized = ensure_texture(state.device(), &mut slot, Format::R8G8B8A8Unorm, (32, 32)).unwrap();
        assert_ne!(first.resource, resized.resource);
        assert_eq!(memory.resource_count(), 1);
        assert!(!memory.contains_view(first.srv));
    }

    #[test]
    fn unknown_layouts_have_no_transient_slots() {
        let (_, state) = state();
        state.register_layout(
            PipelineLayoutHandle(3),
            &[PipelineLayoutParam::DescriptorTable, PipelineLayoutParam::PushConstants],
        );
        assert!(state.transient_slots(PipelineLayoutHandle(3)).contains(1));
        assert!(!state.transient_slots(PipelineLayoutHandle(3)).contains(0));
        assert_eq!(state.transient_slots(PipelineLayoutHandle(4)), TransientSlots::NONE);
    }
}
