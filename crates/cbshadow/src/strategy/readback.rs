use std::collections::HashMap;

use groupconfig::GroupId;
use parking_lot::RwLock;
use pipestate::{
    BufferRange, CommandList, Device, MemoryHeap, ResourceDesc, ResourceHandle, ResourceUsage,
};
use tracing::{debug, warn};

use super::{CaptureStrategy, MapEvent, ShadowError};

#[derive(Debug, Clone, Copy)]
struct Scratch {
    buffer: ResourceHandle,
    size: u64,
}

/// Copies the group's range into a CPU-readable scratch buffer on the command
/// list and maps it back. Works for any buffer at the cost of a GPU round-trip.
#[derive(Debug, Default)]
pub struct GpuReadback {
    scratch: RwLock<HashMap<GroupId, Scratch>>,
}

impl GpuReadback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scratch_count(&self) -> usize {
        self.scratch.read().len()
    }
}

impl CaptureStrategy for GpuReadback {
    fn name(&self) -> &'static str {
        "gpu_readback"
    }

    fn buffer_created(&self, _resource: ResourceHandle, _desc: &ResourceDesc, _initial: Option<&[u8]>) {}

    fn buffer_destroyed(&self, _resource: ResourceHandle) {}

    fn buffer_mapped(&self, _event: &MapEvent) {}

    fn buffer_unmapped(&self, _resource: ResourceHandle, _written: &[u8]) {}

    fn refresh(
        &self,
        device: &dyn Device,
        cmd: &mut dyn CommandList,
        group: GroupId,
        range: BufferRange,
        out: &mut Vec<u8>,
    ) -> Result<(), ShadowError> {
        let len = device.resource_desc(range.buffer)?.size();
        let size = range.resolved_size(len);
        if size == 0 {
            return Err(ShadowError::OutOfRange {
                resource: range.buffer.0,
                offset: range.offset,
                size: range.size,
            });
        }

        let mut scratch = self.scratch.write();
        let buffer = match scratch.get(&group).copied() {
            Some(existing) if existing.size == size => existing.buffer,
            stale => {
                if let Some(stale) = stale {
                    device.destroy_resource(stale.buffer);
                }
                let desc = ResourceDesc::buffer(size, MemoryHeap::GpuToCpu, ResourceUsage::COPY_DEST);
                let buffer = device.create_resource(&desc, None).map_err(|err| {
                    warn!(group = %group, error = %err, "failed to create readback buffer");
                    err
                })?;
                debug!(group = %group, size, "allocated readback buffer");
                scratch.insert(group, Scratch { buffer, size });
                buffer
            }
        };
        drop(scratch);

        cmd.copy_buffer_region(
            BufferRange {
                buffer: range.buffer,
                offset: range.offset,
                size,
            },
            buffer,
            0,
        );
        out.clear();
        out.resize(size as usize, 0);
        device.read_buffer(buffer, 0, out)?;
        Ok(())
    }

    fn release_group(&self, device: &dyn Device, group: GroupId) {
        if let Some(scratch) = self.scratch.write().remove(&group) {
            device.destroy_resource(scratch.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipestate::recording::{MemoryDevice, RecordingCommandList};
    use std::sync::Arc;

    #[test]
    fn readback_copies_through_a_scratch_buffer() {
        let device = Arc::new(MemoryDevice::new());
        let source = device
            .create_resource(
                &ResourceDesc::buffer(64, MemoryHeap::GpuOnly, ResourceUsage::CONSTANT_BUFFER),
                Some(&[3u8; 64]),
            )
            .unwrap();
        let mut cmd = RecordingCommandList::executing(device.clone());
        let strategy = GpuReadback::new();

        let mut out = Vec::new();
        let range = BufferRange {
            buffer: source,
            offset: 16,
            size: 32,
        };
        strategy
            .refresh(&*device, &mut cmd, GroupId(1), range, &mut out)
            .unwrap();
        assert_eq!(out, vec![3u8; 32]);
        assert_eq!(strategy.scratch_count(), 1);
        assert_eq!(device.resource_count(), 2);

        strategy.release_group(&*device, GroupId(1));
        strategy.release_group(&*device, GroupId(1));
        assert_eq!(strategy.scratch_count(), 0);
        assert_eq!(device.resource_count(), 1);
    }
}
