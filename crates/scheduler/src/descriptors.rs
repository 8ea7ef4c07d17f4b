use std::collections::HashMap;

use pipestate::{
    BufferRange, DescriptorTableHandle, DescriptorTableUpdate, Descriptors, ResourceViewHandle,
    ShaderStages, StateTracker,
};

use crate::queue::Stage;

/// One descriptor written into a table or pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorEntry {
    View(ResourceViewHandle),
    Buffer(BufferRange),
    Sampler,
}

impl DescriptorEntry {
    pub fn view(self) -> Option<ResourceViewHandle> {
        match self {
            DescriptorEntry::View(view) if !view.is_null() => Some(view),
            _ => None,
        }
    }

    pub fn buffer(self) -> Option<BufferRange> {
        match self {
            DescriptorEntry::Buffer(range) if !range.buffer.is_null() => Some(range),
            _ => None,
        }
    }
}

fn flatten(update: &DescriptorTableUpdate) -> impl Iterator<Item = (usize, DescriptorEntry)> + '_ {
    let base = (update.binding + update.array_offset) as usize;
    let entries: Vec<DescriptorEntry> = match &update.descriptors {
        Descriptors::Views(views) => views.iter().copied().map(DescriptorEntry::View).collect(),
        Descriptors::Buffers(ranges) => ranges.iter().copied().map(DescriptorEntry::Buffer).collect(),
        Descriptors::Samplers(samplers) => samplers.iter().map(|_| DescriptorEntry::Sampler).collect(),
    };
    entries
        .into_iter()
        .enumerate()
        .map(move |(index, entry)| (base + index, entry))
}

/// Contents of every descriptor table the host has written, flattened so
/// that binding `b`, array element `e` lives at index `b + e`.
#[derive(Debug, Clone, Default)]
pub struct DescriptorCache {
    tables: HashMap<DescriptorTableHandle, Vec<Option<DescriptorEntry>>>,
}

impl DescriptorCache {
    pub fn update(&mut self, updates: &[DescriptorTableUpdate]) {
        for update in updates {
            if update.table.is_null() {
                continue;
            }
            let contents = self.tables.entry(update.table).or_default();
            for (index, entry) in flatten(update) {
                if contents.len() <= index {
                    contents.resize(index + 1, None);
                }
                contents[index] = Some(entry);
            }
        }
    }

    pub fn forget_table(&mut self, table: DescriptorTableHandle) {
        self.tables.remove(&table);
    }

    /// Blanks every slot that referenced `view`.
    pub fn forget_view(&mut self, view: ResourceViewHandle) {
        for contents in self.tables.values_mut() {
            for slot in contents.iter_mut() {
                if *slot == Some(DescriptorEntry::View(view)) {
                    *slot = None;
                }
            }
        }
    }

    pub fn entries(&self, table: DescriptorTableHandle) -> &[Option<DescriptorEntry>] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn entry(&self, table: DescriptorTableHandle, index: usize) -> Option<DescriptorEntry> {
        self.entries(table).get(index).copied().flatten()
    }

    /// Descriptors visible to `stage` through layout parameter `slot`, from
    /// either a bound table or a push. The most recent binding wins.
    pub fn bound_entries(&self, tracker: &StateTracker, stage: Stage, slot: u32) -> Vec<Option<DescriptorEntry>> {
        let stages = shader_stages(stage);
        if let Some(update) = tracker.pushed_descriptors(stages, slot) {
            let mut entries = Vec::new();
            for (index, entry) in flatten(update) {
                if entries.len() <= index {
                    entries.resize(index + 1, None);
                }
                entries[index] = Some(entry);
            }
            return entries;
        }
        tracker
            .descriptor_tables(stages)
            .and_then(|(_, tables)| tables.get(slot as usize).copied())
            .filter(|table| !table.is_null())
            .map(|table| self.entries(table).to_vec())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

pub fn shader_stages(stage: Stage) -> ShaderStages {
    match stage {
        Stage::Pixel => ShaderStages::PIXEL,
        Stage::Vertex => ShaderStages::VERTEX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipestate::{DescriptorKind, PipelineLayoutHandle, ResourceHandle};

    fn views(table: u64, binding: u32, views: &[u64]) -> DescriptorTableUpdate {
        DescriptorTableUpdate {
            table: DescriptorTableHandle(table),
            binding,
            array_offset: 0,
            kind: DescriptorKind::ShaderResourceView,
            descriptors: Descriptors::Views(views.iter().copied().map(ResourceViewHandle).collect()),
        }
    }

    #[test]
    fn updates_are_flattened_by_binding() {
        let mut cache = DescriptorCache::default();
        cache.update(&[views(1, 2, &[20, 21]), views(1, 0, &[10])]);
        assert_eq!(cache.entry(DescriptorTableHandle(1), 0), Some(DescriptorEntry::View(ResourceViewHandle(10))));
        assert_eq!(cache.entry(DescriptorTableHandle(1), 1), None);
        assert_eq!(cache.entry(DescriptorTableHandle(1), 3), Some(DescriptorEntry::View(ResourceViewHandle(21))));

        cache.forget_view(ResourceViewHandle(21));
        assert_eq!(cache.entry(DescriptorTableHandle(1), 3), None);
    }

    #[test]
    fn bound_entries_prefer_pushed_descriptors() {
        let mut cache = DescriptorCache::default();
        cache.update(&[views(7, 0, &[70, 71])]);
        let mut tracker = StateTracker::new();
        tracker.on_bind_descriptor_tables(
            ShaderStages::ALL_GRAPHICS,
            PipelineLayoutHandle(1),
            1,
            &[DescriptorTableHandle(7)],
        );

        let entries = cache.bound_entries(&tracker, Stage::Pixel, 1);
        assert_eq!(entries[1].and_then(DescriptorEntry::view), Some(ResourceViewHandle(71)));
        assert!(cache.bound_entries(&tracker, Stage::Pixel, 0).is_empty());

        let range = BufferRange {
            buffer: ResourceHandle(3),
            offset: 256,
            size: 64,
        };
        tracker.on_push_descriptors(
            ShaderStages::PIXEL,
            PipelineLayoutHandle(1),
            1,
            &DescriptorTableUpdate {
                table: DescriptorTableHandle::NULL,
                binding: 0,
                array_offset: 0,
                kind: DescriptorKind::ConstantBuffer,
                descriptors: Descriptors::Buffers(vec![range]),
            },
        );
        let entries = cache.bound_entries(&tracker, Stage::Pixel, 1);
        assert_eq!(entries[0].and_then(DescriptorEntry::buffer), Some(range));
        assert_eq!(cache.bound_entries(&tracker, Stage::Vertex, 1)[1], Some(DescriptorEntry::View(ResourceViewHandle(71))));
    }
}
