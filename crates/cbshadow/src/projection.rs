//! Projection of named offsets inside a captured constant buffer onto the
//! effect engine's uniform variables.

use std::collections::BTreeMap;

use bytemuck::pod_read_unaligned;
use groupconfig::VarOffset;
use pipestate::{EffectRuntime, UniformSlot};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::snapshot::ConstantSnapshot;

/// Type of a uniform variable exposed by the effect engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "len", rename_all = "snake_case")]
pub enum ValueType {
    /// Float vector or matrix with the given component count.
    Float(u8),
    Int,
    Uint,
}

impl ValueType {
    pub const FLOAT_LENGTHS: [u8; 7] = [1, 2, 3, 4, 9, 12, 16];

    pub fn float(len: u8) -> Self {
        ValueType::Float(len)
    }

    pub fn is_supported(self) -> bool {
        match self {
            ValueType::Float(len) => Self::FLOAT_LENGTHS.contains(&len),
            ValueType::Int | ValueType::Uint => true,
        }
    }

    pub fn component_count(self) -> usize {
        match self {
            ValueType::Float(len) => usize::from(len),
            ValueType::Int | ValueType::Uint => 1,
        }
    }

    /// Bytes read from the captured buffer.
    pub fn byte_size(self) -> usize {
        4 * self.component_count()
    }
}

/// One named variable: its type and every uniform it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantBinding {
    pub ty: ValueType,
    #[serde(default)]
    pub slots: Vec<UniformSlot>,
}

/// Name → destination table published by the effect system whenever effects
/// reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstantsTable {
    entries: BTreeMap<String, ConstantBinding>,
}

impl ConstantsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, ty: ValueType, slots: Vec<UniformSlot>) {
        self.entries
            .insert(name.into(), ConstantBinding { ty, slots });
    }

    pub fn get(&self, name: &str) -> Option<&ConstantBinding> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn words<T: bytemuck::Pod>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(4).map(pod_read_unaligned::<T>).collect()
}

/// Writes every in-bounds mapping entry to the runtime and returns how many
/// uniform slots were written. Out-of-bounds entries are skipped whole.
pub fn project(
    runtime: &mut dyn EffectRuntime,
    snapshot: &ConstantSnapshot,
    offsets: &BTreeMap<String, VarOffset>,
    table: &ConstantsTable,
) -> usize {
    let mut written = 0;
    for (name, var) in offsets {
        let Some(binding) = table.get(name) else {
            trace!(name = %name, "constant has no destination in the effect table");
            continue;
        };
        if !binding.ty.is_supported() {
            trace!(name = %name, ty = ?binding.ty, "unsupported constant type");
            continue;
        }
        let Some(bytes) = snapshot.bytes(var.previous) else {
            continue;
        };
        let start = var.offset as usize;
        let end = start + binding.ty.byte_size();
        if end > bytes.len() {
            trace!(
                name = %name,
                offset = var.offset,
                len = bytes.len(),
                "constant lies outside the captured buffer"
            );
            continue;
        }
        let raw = &bytes[start..end];
        match binding.ty {
            ValueType::Float(_) => {
                let values: Vec<f32> = words(raw);
                for slot in &binding.slots {
                    runtime.set_uniform_f32(*slot, &values);
                }
            }
            ValueType::Int => {
                let values: Vec<i32> = words(raw);
                for slot in &binding.slots {
                    runtime.set_uniform_i32(*slot, &values);
                }
            }
            ValueType::Uint => {
                let values: Vec<u32> = words(raw);
                for slot in &binding.slots {
                    runtime.set_uniform_u32(*slot, &values);
                }
            }
        }
        written += binding.slots.len();
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipestate::recording::{RecordingRuntime, RuntimeEvent};
    use pipestate::{BufferRange, ResourceHandle};

    fn buffer_with_float3_at_0x10() -> ConstantSnapshot {
        let mut bytes = vec![0u8; 32];
        bytes[16..28].copy_from_slice(bytemuck::cast_slice(&[1.0f32, 2.0, 3.0]));
        let mut snapshot = ConstantSnapshot::new(BufferRange::whole(ResourceHandle(1)));
        snapshot.push(&bytes);
        snapshot
    }

    fn offsets(entries: &[(&str, u32, bool)]) -> BTreeMap<String, VarOffset> {
        entries
            .iter()
            .map(|(name, offset, previous)| {
                (
                    name.to_string(),
                    VarOffset {
                        offset: *offset,
                        previous: *previous,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn float3_is_written_to_every_slot_in_order() {
        let snapshot = buffer_with_float3_at_0x10();
        let mut table = ConstantsTable::new();
        table.insert("CameraPos", ValueType::float(3), vec![UniformSlot(7), UniformSlot(9)]);
        let mut runtime = RecordingRuntime::new((1920, 1080), &[]);

        let written = project(&mut runtime, &snapshot, &offsets(&[("CameraPos", 0x10, false)]), &table);

        assert_eq!(written, 2);
        assert_eq!(
            runtime.events(),
            &[
                RuntimeEvent::UniformF32 {
                    slot: UniformSlot(7),
                    values: vec![1.0, 2.0, 3.0],
                },
                RuntimeEvent::UniformF32 {
                    slot: UniformSlot(9),
                    values: vec![1.0, 2.0, 3.0],
                },
            ]
        );
    }

    #[test]
    fn entries_past_the_end_are_skipped() {
        let snapshot = buffer_with_float3_at_0x10();
        let mut table = ConstantsTable::new();
        table.insert("Matrix", ValueType::float(16), vec![UniformSlot(1)]);
        table.insert("Tail", ValueType::Uint, vec![UniformSlot(2)]);
        let mut runtime = RecordingRuntime::new((1920, 1080), &[]);

        let written = project(
            &mut runtime,
            &snapshot,
            &offsets(&[("Matrix", 0x10, false), ("Tail", 32, false)]),
            &table,
        );

        assert_eq!(written, 0);
        assert!(runtime.events().is_empty());
    }

    #[test]
    fn previous_flag_reads_the_older_buffer() {
        let mut snapshot = ConstantSnapshot::default();
        snapshot.push(&7i32.to_le_bytes());
        snapshot.push(&(-3i32).to_le_bytes());
        let mut table = ConstantsTable::new();
        table.insert("Now", ValueType::Int, vec![UniformSlot(1)]);
        table.insert("Then", ValueType::Int, vec![UniformSlot(2)]);
        let mut runtime = RecordingRuntime::new((1920, 1080), &[]);

        project(
            &mut runtime,
            &snapshot,
            &offsets(&[("Now", 0, false), ("Then", 0, true)]),
            &table,
        );

        assert_eq!(
            runtime.events(),
            &[
                RuntimeEvent::UniformI32 {
                    slot: UniformSlot(1),
                    values: vec![-3],
                },
                RuntimeEvent::UniformI32 {
                    slot: UniformSlot(2),
                    values: vec![7],
                },
            ]
        );
    }

    #[test]
    fn unsupported_float_lengths_are_ignored() {
        assert!(ValueType::float(12).is_supported());
        assert!(!ValueType::float(5).is_supported());
        assert_eq!(ValueType::float(9).byte_size(), 36);
        assert_eq!(ValueType::Uint.byte_size(), 4);
    }
}
