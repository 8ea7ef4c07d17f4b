use std::collections::HashMap;
use std::sync::Arc;

use groupconfig::GroupId;
use parking_lot::RwLock;
use pipestate::{BufferRange, CommandList, Device, ResourceDesc, ResourceHandle, ResourceUsage};
use tracing::{debug, trace};

use super::{CaptureStrategy, MapEvent, ShadowError, ShadowTable};

/// Shadows every constant buffer in host memory by following the host's own
/// write path, so a refresh is a plain memory copy.
#[derive(Debug)]
pub struct HostShadow {
    table: Arc<ShadowTable>,
    /// Offset of the currently mapped region, per resource.
    mapped: RwLock<HashMap<ResourceHandle, u64>>,
}

impl HostShadow {
    pub fn new(table: Arc<ShadowTable>) -> Self {
        Self {
            table,
            mapped: RwLock::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &Arc<ShadowTable> {
        &self.table
    }
}

impl CaptureStrategy for HostShadow {
    fn name(&self) -> &'static str {
        "host_shadow"
    }

    fn buffer_created(&self, resource: ResourceHandle, desc: &ResourceDesc, initial: Option<&[u8]>) {
        if !desc.is_buffer() || !desc.usage.contains(ResourceUsage::CONSTANT_BUFFER) {
            return;
        }
        trace!(resource = resource.0, size = desc.size(), "shadowing constant buffer");
        self.table.track(resource, desc.size(), initial);
    }

    fn buffer_destroyed(&self, resource: ResourceHandle) {
        self.mapped.write().remove(&resource);
        self.table.untrack(resource);
    }

    fn buffer_mapped(&self, event: &MapEvent) {
        if event.access.writes() && self.table.contains(event.resource) {
            self.mapped.write().insert(event.resource, event.offset);
        }
    }

    fn buffer_unmapped(&self, resource: ResourceHandle, written: &[u8]) {
        let Some(offset) = self.mapped.write().remove(&resource) else {
            return;
        };
        if let Err(err) = self.table.write(resource, offset, written) {
            debug!(resource = resource.0, error = %err, "dropping shadow write");
        }
    }

    fn refresh(
        &self,
        _device: &dyn Device,
        _cmd: &mut dyn CommandList,
        _group: GroupId,
        range: BufferRange,
        out: &mut Vec<u8>,
    ) -> Result<(), ShadowError> {
        self.table.read(range, out)
    }
}
