use std::collections::BTreeMap;
use std::sync::Arc;

use groupconfig::GroupId;
use parking_lot::RwLock;
use pipestate::{BufferRange, CommandList, Device, ResourceDesc, ResourceHandle};
use tracing::trace;

use super::{CaptureStrategy, HostShadow, MapEvent, ShadowError, ShadowTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MappedRegion {
    resource: ResourceHandle,
    offset: u64,
    size: u64,
}

/// Host shadowing for engines that stage constants with their own bulk copy
/// into mapped memory instead of the API's update path. Copies are matched
/// against the address ranges recorded when each buffer was mapped.
#[derive(Debug)]
pub struct BulkCopy {
    shadow: HostShadow,
    regions: RwLock<BTreeMap<u64, MappedRegion>>,
}

impl BulkCopy {
    pub fn new(table: Arc<ShadowTable>) -> Self {
        Self {
            shadow: HostShadow::new(table),
            regions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn table(&self) -> &Arc<ShadowTable> {
        self.shadow.table()
    }

    fn forget(&self, resource: ResourceHandle) {
        self.regions
            .write()
            .retain(|_, region| region.resource != resource);
    }
}

impl CaptureStrategy for BulkCopy {
    fn name(&self) -> &'static str {
        "bulk_copy"
    }

    fn buffer_created(&self, resource: ResourceHandle, desc: &ResourceDesc, initial: Option<&[u8]>) {
        self.shadow.buffer_created(resource, desc, initial);
    }

    fn buffer_destroyed(&self, resource: ResourceHandle) {
        self.forget(resource);
        self.shadow.buffer_destroyed(resource);
    }

    fn buffer_mapped(&self, event: &MapEvent) {
        self.shadow.buffer_mapped(event);
        if event.address == 0 || !self.table().contains(event.resource) {
            return;
        }
        self.regions.write().insert(
            event.address,
            MappedRegion {
                resource: event.resource,
                offset: event.offset,
                size: event.size,
            },
        );
    }

    fn buffer_unmapped(&self, resource: ResourceHandle, written: &[u8]) {
        self.forget(resource);
        self.shadow.buffer_unmapped(resource, written);
    }

    fn refresh(
        &self,
        device: &dyn Device,
        cmd: &mut dyn CommandList,
        group: GroupId,
        range: BufferRange,
        out: &mut Vec<u8>,
    ) -> Result<(), ShadowError> {
        self.shadow.refresh(device, cmd, group, range, out)
    }

    fn intercept_copy(&self, dest: u64, source: &[u8]) -> bool {
        let region = {
            let regions = self.regions.read();
            regions
                .range(..=dest)
                .next_back()
                .map(|(base, region)| (*base, *region))
        };
        let Some((base, region)) = region else {
            return false;
        };
        let delta = dest - base;
        let fits = delta
            .checked_add(source.len() as u64)
            .is_some_and(|end| end <= region.size);
        let Some(offset) = region.offset.checked_add(delta).filter(|_| fits) else {
            return false;
        };
        match self.table().write(region.resource, offset, source) {
            Ok(()) => true,
            Err(err) => {
                trace!(dest, error = %err, "bulk copy missed the shadow");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipestate::{MapAccess, MemoryHeap, ResourceUsage};

    fn mapped(shadow: &BulkCopy, resource: ResourceHandle, address: u64) {
        shadow.buffer_created(
            resource,
            &ResourceDesc::buffer(32, MemoryHeap::CpuToGpu, ResourceUsage::CONSTANT_BUFFER),
            None,
        );
        shadow.buffer_mapped(&MapEvent {
            resource,
            offset: 0,
            size: 32,
            access: MapAccess::WriteDiscard,
            address,
        });
    }

    #[test]
    fn copies_into_mapped_ranges_are_shadowed() {
        let shadow = BulkCopy::new(Arc::default());
        mapped(&shadow, ResourceHandle(1), 0x1000);
        mapped(&shadow, ResourceHandle(2), 0x2000);

        assert!(shadow.intercept_copy(0x2010, &[7; 4]));
        assert!(!shadow.intercept_copy(0x101E, &[7; 4]));
        assert!(!shadow.intercept_copy(0x0800, &[7; 4]));

        let mut out = Vec::new();
        shadow
            .table()
            .read(
                BufferRange {
                    buffer: ResourceHandle(2),
                    offset: 16,
                    size: 4,
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(out, vec![7; 4]);
    }

    #[test]
    fn unmapping_retires_the_address_range() {
        let shadow = BulkCopy::new(Arc::default());
        mapped(&shadow, ResourceHandle(1), 0x1000);
        shadow.buffer_unmapped(ResourceHandle(1), &[0; 32]);
        assert!(!shadow.intercept_copy(0x1000, &[1; 4]));
    }
}
