//! Constant buffer capture strategies.
//!
//! All strategies expose the same buffer lifecycle hooks plus `refresh`, and
//! all of them hand back plain bytes that the store shifts into a group's
//! `ConstantSnapshot`. The store never looks at which strategy it holds.

mod bulk_copy;
mod host_shadow;
mod readback;

pub use bulk_copy::BulkCopy;
pub use host_shadow::HostShadow;
pub use readback::GpuReadback;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use groupconfig::{CaptureStrategyKind, GroupId};
use parking_lot::RwLock;
use pipestate::{
    ApiError, BufferRange, CommandList, Device, MapAccess, ResourceDesc, ResourceHandle,
};

#[derive(Debug, thiserror::Error)]
pub enum ShadowError {
    #[error("no host copy exists for resource {0:#x}")]
    Untracked(u64),
    #[error("range {offset}+{size} lies outside resource {resource:#x}")]
    OutOfRange { resource: u64, offset: u64, size: u64 },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A buffer region handed to the host for CPU access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEvent {
    pub resource: ResourceHandle,
    pub offset: u64,
    pub size: u64,
    pub access: MapAccess,
    /// Host address the region was mapped at; `0` when unknown.
    pub address: u64,
}

pub trait CaptureStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn buffer_created(&self, resource: ResourceHandle, desc: &ResourceDesc, initial: Option<&[u8]>);

    fn buffer_destroyed(&self, resource: ResourceHandle);

    fn buffer_mapped(&self, event: &MapEvent);

    /// `written` holds the bytes of the mapped region as the host left them.
    fn buffer_unmapped(&self, resource: ResourceHandle, written: &[u8]);

    /// Captures `range` into `out`, replacing its contents.
    fn refresh(
        &self,
        device: &dyn Device,
        cmd: &mut dyn CommandList,
        group: GroupId,
        range: BufferRange,
        out: &mut Vec<u8>,
    ) -> Result<(), ShadowError>;

    /// Frees anything the strategy allocated on behalf of `group`.
    fn release_group(&self, _device: &dyn Device, _group: GroupId) {}

    /// Observes a raw host copy of `source` into address `dest`. Returns
    /// whether the copy landed inside a tracked mapping.
    fn intercept_copy(&self, _dest: u64, _source: &[u8]) -> bool {
        false
    }
}

pub fn for_kind(kind: CaptureStrategyKind) -> Box<dyn CaptureStrategy> {
    match kind {
        CaptureStrategyKind::GpuReadback => Box::new(GpuReadback::new()),
        CaptureStrategyKind::HostShadow => Box::new(HostShadow::new(Arc::default())),
        CaptureStrategyKind::BulkCopy => Box::new(BulkCopy::new(Arc::default())),
    }
}

/// Host byte copies of CPU-visible constant buffers, kept in lock-step with
/// the host's writes.
#[derive(Debug, Default)]
pub struct ShadowTable {
    buffers: RwLock<HashMap<ResourceHandle, Vec<u8>>>,
}

impl ShadowTable {
    pub fn track(&self, resource: ResourceHandle, size: u64, initial: Option<&[u8]>) {
        let mut bytes = vec![0u8; size as usize];
        if let Some(initial) = initial {
            let len = initial.len().min(bytes.len());
            bytes[..len].copy_from_slice(&initial[..len]);
        }
        self.buffers.write().insert(resource, bytes);
    }

    pub fn untrack(&self, resource: ResourceHandle) -> bool {
        self.buffers.write().remove(&resource).is_some()
    }

    pub fn contains(&self, resource: ResourceHandle) -> bool {
        self.buffers.read().contains_key(&resource)
    }

    pub fn len(&self) -> usize {
        self.buffers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&self, resource: ResourceHandle, offset: u64, data: &[u8]) -> Result<(), ShadowError> {
        let mut buffers = self.buffers.write();
        let bytes = buffers
            .get_mut(&resource)
            .ok_or(ShadowError::Untracked(resource.0))?;
        let span = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(data.len())?))
            .filter(|span| span.end <= bytes.len())
            .ok_or(ShadowError::OutOfRange {
                resource: resource.0,
                offset,
                size: data.len() as u64,
            })?;
        bytes[span].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, range: BufferRange, out: &mut Vec<u8>) -> Result<(), ShadowError> {
        let buffers = self.buffers.read();
        let bytes = buffers
            .get(&range.buffer)
            .ok_or(ShadowError::Untracked(range.buffer.0))?;
        let size = range.resolved_size(bytes.len() as u64) as usize;
        let start = (range.offset as usize).min(bytes.len());
        out.clear();
        out.extend_from_slice(&bytes[start..start + size]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_table_rejects_writes_past_the_end() {
        let table = ShadowTable::default();
        table.track(ResourceHandle(1), 8, Some(&[1, 2, 3]));
        assert!(table.write(ResourceHandle(1), 4, &[9; 4]).is_ok());
        assert!(matches!(
            table.write(ResourceHandle(1), 6, &[9; 4]),
            Err(ShadowError::OutOfRange { .. })
        ));
        assert!(matches!(
            table.write(ResourceHandle(1), u64::MAX - 1, &[1, 2, 3, 4]),
            Err(ShadowError::OutOfRange { .. })
        ));

        let mut out = Vec::new();
        table.read(BufferRange::whole(ResourceHandle(1)), &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 0, 9, 9, 9, 9]);
        assert!(matches!(
            table.read(BufferRange::whole(ResourceHandle(2)), &mut out),
            Err(ShadowError::Untracked(2))
        ));
    }
}
