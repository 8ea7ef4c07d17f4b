use std::collections::HashMap;

use groupconfig::{CaptureStrategyKind, GroupId, ToggleGroup};
use parking_lot::RwLock;
use pipestate::{
    BufferRange, CommandList, Device, EffectRuntime, MapAccess, ResourceDesc, ResourceHandle,
};
use tracing::{debug, trace};

use crate::projection::{project, ConstantsTable};
use crate::snapshot::ConstantSnapshot;
use crate::strategy::{for_kind, CaptureStrategy, MapEvent};

/// Per-group double-buffered constant captures, refreshed through whichever
/// capture strategy was selected at startup.
#[derive(Debug)]
pub struct ConstantShadowStore {
    strategy: Box<dyn CaptureStrategy>,
    snapshots: RwLock<HashMap<GroupId, ConstantSnapshot>>,
}

impl ConstantShadowStore {
    pub fn new(kind: CaptureStrategyKind) -> Self {
        Self::with_strategy(for_kind(kind))
    }

    pub fn with_strategy(strategy: Box<dyn CaptureStrategy>) -> Self {
        debug!(strategy = strategy.name(), "constant capture strategy selected");
        Self {
            strategy,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Points `group` at `range` and refreshes it immediately.
    pub fn set_buffer_range(
        &self,
        group: GroupId,
        range: BufferRange,
        device: &dyn Device,
        cmd: &mut dyn CommandList,
    ) -> bool {
        {
            let mut snapshots = self.snapshots.write();
            let snapshot = snapshots
                .entry(group)
                .or_insert_with(|| ConstantSnapshot::new(range));
            if snapshot.range() != range {
                trace!(group = %group, buffer = range.buffer.0, offset = range.offset, "constant range changed");
                snapshot.set_range(range);
            }
        }
        self.refresh(group, device, cmd)
    }

    /// Captures the group's current range. On failure the previous contents
    /// stay in place and `false` is returned.
    pub fn refresh(&self, group: GroupId, device: &dyn Device, cmd: &mut dyn CommandList) -> bool {
        let Some(range) = self.snapshots.read().get(&group).map(ConstantSnapshot::range) else {
            return false;
        };
        let mut bytes = Vec::new();
        if let Err(err) = self.strategy.refresh(device, cmd, group, range, &mut bytes) {
            debug!(group = %group, error = %err, "constant refresh skipped");
            return false;
        }
        match self.snapshots.write().get_mut(&group) {
            Some(snapshot) => {
                snapshot.push(&bytes);
                true
            }
            None => false,
        }
    }

    pub fn remove_group(&self, group: GroupId, device: &dyn Device) {
        self.snapshots.write().remove(&group);
        self.strategy.release_group(device, group);
    }

    /// Projects the group's configured offsets into the runtime's uniforms.
    pub fn apply_constant_values(
        &self,
        runtime: &mut dyn EffectRuntime,
        group: &ToggleGroup,
        table: &ConstantsTable,
    ) -> usize {
        let Some(config) = &group.constants else {
            return 0;
        };
        let snapshots = self.snapshots.read();
        let Some(snapshot) = snapshots.get(&group.id) else {
            return 0;
        };
        project(runtime, snapshot, &config.offsets, table)
    }

    pub fn snapshot(&self, group: GroupId) -> Option<ConstantSnapshot> {
        self.snapshots.read().get(&group).cloned()
    }

    pub fn group_count(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn buffer_created(&self, resource: ResourceHandle, desc: &ResourceDesc, initial: Option<&[u8]>) {
        if desc.is_buffer() {
            self.strategy.buffer_created(resource, desc, initial);
        }
    }

    pub fn buffer_destroyed(&self, resource: ResourceHandle) {
        self.strategy.buffer_destroyed(resource);
    }

    pub fn buffer_mapped(&self, event: &MapEvent) {
        self.strategy.buffer_mapped(event);
    }

    pub fn buffer_unmapped(&self, resource: ResourceHandle, written: &[u8]) {
        self.strategy.buffer_unmapped(resource, written);
    }

    /// An update-region call is a write-only map followed by an unmap.
    pub fn update_buffer_region(&self, resource: ResourceHandle, offset: u64, data: &[u8]) {
        self.strategy.buffer_mapped(&MapEvent {
            resource,
            offset,
            size: data.len() as u64,
            access: MapAccess::WriteDiscard,
            address: 0,
        });
        self.strategy.buffer_unmapped(resource, data);
    }

    pub fn intercept_copy(&self, dest: u64, source: &[u8]) -> bool {
        self.strategy.intercept_copy(dest, source)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use groupconfig::{ConstantExtractionConfig, VarOffset};
    use pipestate::recording::{MemoryDevice, RecordingCommandList, RecordingRuntime, RuntimeEvent};
    use pipestate::{MemoryHeap, ResourceUsage, UniformSlot};

    use super::*;
    use crate::projection::ValueType;

    fn constant_buffer(size: u64) -> ResourceDesc {
        ResourceDesc::buffer(size, MemoryHeap::CpuToGpu, ResourceUsage::CONSTANT_BUFFER)
    }

    fn group_reading(name: &str, offset: u32) -> ToggleGroup {
        let mut group = ToggleGroup::new(4, "constants");
        let mut offsets = BTreeMap::new();
        offsets.insert(
            name.to_string(),
            VarOffset {
                offset,
                previous: false,
            },
        );
        group.constants = Some(ConstantExtractionConfig {
            slot_index: 0,
            descriptor_index: 0,
            offsets,
        });
        group
    }

    #[test]
    fn host_shadow_tracks_updates_between_refreshes() {
        let store = ConstantShadowStore::new(CaptureStrategyKind::HostShadow);
        let device = MemoryDevice::new();
        let mut cmd = RecordingCommandList::new();
        let buffer = ResourceHandle(77);
        store.buffer_created(buffer, &constant_buffer(16), None);

        store.update_buffer_region(buffer, 0, &[0xA; 16]);
        assert!(store.set_buffer_range(GroupId(1), BufferRange::whole(buffer), &device, &mut cmd));
        store.update_buffer_region(buffer, 0, &[0xB; 16]);
        assert!(store.refresh(GroupId(1), &device, &mut cmd));

        let snapshot = store.snapshot(GroupId(1)).unwrap();
        assert_eq!(snapshot.current(), Some(&[0xB; 16][..]));
        assert_eq!(snapshot.previous(), Some(&[0xA; 16][..]));
        assert!(cmd.commands().is_empty());
    }

    #[test]
    fn refresh_without_a_shadow_serves_stale_data() {
        let store = ConstantShadowStore::new(CaptureStrategyKind::HostShadow);
        let device = MemoryDevice::new();
        let mut cmd = RecordingCommandList::new();
        let buffer = ResourceHandle(5);
        store.buffer_created(buffer, &constant_buffer(4), Some(&[1, 2, 3, 4]));
        assert!(store.set_buffer_range(GroupId(2), BufferRange::whole(buffer), &device, &mut cmd));

        store.buffer_destroyed(buffer);
        assert!(!store.refresh(GroupId(2), &device, &mut cmd));
        let snapshot = store.snapshot(GroupId(2)).unwrap();
        assert_eq!(snapshot.current(), Some(&[1, 2, 3, 4][..]));
        assert_eq!(snapshot.refresh_count(), 1);
    }

    #[test]
    fn readback_feeds_projection() {
        let device = Arc::new(MemoryDevice::new());
        let mut bytes = vec![0u8; 32];
        bytes[16..28].copy_from_slice(bytemuck::cast_slice(&[1.0f32, 2.0, 3.0]));
        let buffer = device
            .create_resource(
                &ResourceDesc::buffer(32, MemoryHeap::GpuOnly, ResourceUsage::CONSTANT_BUFFER),
                Some(&bytes),
            )
            .unwrap();
        let mut cmd = RecordingCommandList::executing(device.clone());
        let store = ConstantShadowStore::new(CaptureStrategyKind::GpuReadback);
        let group = group_reading("CameraPos", 0x10);

        assert!(store.set_buffer_range(group.id, BufferRange::whole(buffer), &*device, &mut cmd));

        let mut table = ConstantsTable::new();
        table.insert("CameraPos", ValueType::float(3), vec![UniformSlot(3)]);
        let mut runtime = RecordingRuntime::new((1920, 1080), &[]);
        assert_eq!(store.apply_constant_values(&mut runtime, &group, &table), 1);
        assert_eq!(
            runtime.events(),
            &[RuntimeEvent::UniformF32 {
                slot: UniformSlot(3),
                values: vec![1.0, 2.0, 3.0],
            }]
        );
    }

    #[test]
    fn remove_group_is_idempotent() {
        let device = Arc::new(MemoryDevice::new());
        let buffer = device
            .create_resource(&constant_buffer(16), Some(&[9; 16]))
            .unwrap();
        let mut cmd = RecordingCommandList::executing(device.clone());
        let store = ConstantShadowStore::new(CaptureStrategyKind::GpuReadback);
        assert!(store.set_buffer_range(GroupId(3), BufferRange::whole(buffer), &*device, &mut cmd));
        assert_eq!(device.resource_count(), 2);

        store.remove_group(GroupId(3), &*device);
        store.remove_group(GroupId(3), &*device);
        assert_eq!(store.group_count(), 0);
        assert_eq!(device.resource_count(), 1);
        assert!(!store.refresh(GroupId(3), &*device, &mut cmd));
    }

    #[test]
    fn out_of_range_host_writes_leave_the_shadow_untouched() {
        let store = ConstantShadowStore::new(CaptureStrategyKind::BulkCopy);
        let device = MemoryDevice::new();
        let mut cmd = RecordingCommandList::new();
        let buffer = ResourceHandle(12);
        store.buffer_created(buffer, &constant_buffer(16), Some(&[5; 16]));

        store.update_buffer_region(buffer, u64::MAX - 1, &[1, 2, 3, 4]);
        store.buffer_mapped(&MapEvent {
            resource: buffer,
            offset: u64::MAX - 2,
            size: 8,
            access: MapAccess::WriteDiscard,
            address: 0x4000,
        });
        assert!(!store.intercept_copy(0x4004, &[1, 2, 3, 4]));
        assert!(!store.intercept_copy(u64::MAX, &[1, 2, 3, 4]));
        store.buffer_unmapped(buffer, &[1; 8]);

        assert!(store.set_buffer_range(GroupId(7), BufferRange::whole(buffer), &device, &mut cmd));
        assert_eq!(store.snapshot(GroupId(7)).unwrap().current(), Some(&[5; 16][..]));
    }

    #[test]
    fn bulk_copies_land_in_the_group_snapshot() {
        let store = ConstantShadowStore::new(CaptureStrategyKind::BulkCopy);
        let device = MemoryDevice::new();
        let mut cmd = RecordingCommandList::new();
        let buffer = ResourceHandle(9);
        store.buffer_created(buffer, &constant_buffer(8), None);
        store.buffer_mapped(&MapEvent {
            resource: buffer,
            offset: 0,
            size: 8,
            access: MapAccess::WriteDiscard,
            address: 0x4000,
        });
        assert!(store.intercept_copy(0x4004, &[1, 2, 3, 4]));

        assert!(store.set_buffer_range(GroupId(6), BufferRange::whole(buffer), &device, &mut cmd));
        assert_eq!(
            store.snapshot(GroupId(6)).unwrap().current(),
            Some(&[0, 0, 0, 0, 1, 2, 3, 4][..])
        );
    }
}
