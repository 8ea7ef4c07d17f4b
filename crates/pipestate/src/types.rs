use bitflags::bitflags;
use serde::{Deserialize, Serialize};

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const NULL: Self = Self(0);

            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

handle_type!(
    /// Opaque host handle of a buffer or texture.
    ResourceHandle
);
handle_type!(
    /// Opaque host handle of a render-target, depth-stencil or shader-resource view.
    ResourceViewHandle
);
handle_type!(
    /// Opaque host handle of a pipeline state object.
    PipelineHandle
);
handle_type!(
    /// Opaque host handle of a pipeline layout (root signature).
    PipelineLayoutHandle
);
handle_type!(
    /// Opaque host handle of a descriptor table (descriptor set).
    DescriptorTableHandle
);
handle_type!(
    /// Opaque host handle of a sampler.
    SamplerHandle
);

/// Pixel formats the core needs to reason about when creating view variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    #[default]
    Unknown,
    R8G8B8A8Typeless,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Typeless,
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    R10G10B10A2Unorm,
    R11G11B10Float,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R32Float,
    D24UnormS8Uint,
    D32Float,
}

impl Format {
    /// Typeless formats resolve to their UNORM flavour.
    pub fn to_default_typed(self) -> Self {
        match self {
            Format::R8G8B8A8Typeless => Format::R8G8B8A8Unorm,
            Format::B8G8R8A8Typeless => Format::B8G8R8A8Unorm,
            other => other,
        }
    }

    pub fn to_srgb(self) -> Self {
        match self.to_default_typed() {
            Format::R8G8B8A8Unorm => Format::R8G8B8A8UnormSrgb,
            Format::B8G8R8A8Unorm => Format::B8G8R8A8UnormSrgb,
            other => other,
        }
    }

    pub fn to_non_srgb(self) -> Self {
        match self.to_default_typed() {
            Format::R8G8B8A8UnormSrgb => Format::R8G8B8A8Unorm,
            Format::B8G8R8A8UnormSrgb => Format::B8G8R8A8Unorm,
            other => other,
        }
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, Format::R8G8B8A8UnormSrgb | Format::B8G8R8A8UnormSrgb)
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[default]
    Buffer,
    Texture1d,
    Texture2d,
    Texture3d,
}

/// Memory heap a resource lives in; only `CpuToGpu` buffers can be shadowed
/// on the host without a GPU round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryHeap {
    #[default]
    GpuOnly,
    CpuToGpu,
    GpuToCpu,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ResourceUsage: u32 {
        const INDEX_BUFFER     = 1 << 0;
        const VERTEX_BUFFER    = 1 << 1;
        const CONSTANT_BUFFER  = 1 << 2;
        const SHADER_RESOURCE  = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const RENDER_TARGET    = 1 << 5;
        const DEPTH_STENCIL    = 1 << 6;
        const COPY_DEST        = 1 << 7;
        const COPY_SOURCE      = 1 << 8;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ShaderStages: u32 {
        const VERTEX   = 1 << 0;
        const HULL     = 1 << 1;
        const DOMAIN   = 1 << 2;
        const GEOMETRY = 1 << 3;
        const PIXEL    = 1 << 4;
        const COMPUTE  = 1 << 5;
        const ALL_GRAPHICS = Self::VERTEX.bits()
            | Self::HULL.bits()
            | Self::DOMAIN.bits()
            | Self::GEOMETRY.bits()
            | Self::PIXEL.bits();
    }
}

bitflags! {
    /// Pipeline stages a pipeline object is bound to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PipelineStages: u32 {
        const VERTEX_SHADER   = 1 << 0;
        const HULL_SHADER     = 1 << 1;
        const DOMAIN_SHADER   = 1 << 2;
        const GEOMETRY_SHADER = 1 << 3;
        const PIXEL_SHADER    = 1 << 4;
        const COMPUTE_SHADER  = 1 << 5;
        const INPUT_ASSEMBLER = 1 << 6;
        const RASTERIZER      = 1 << 7;
        const OUTPUT_MERGER   = 1 << 8;
        const ALL_GRAPHICS = Self::VERTEX_SHADER.bits()
            | Self::HULL_SHADER.bits()
            | Self::DOMAIN_SHADER.bits()
            | Self::GEOMETRY_SHADER.bits()
            | Self::PIXEL_SHADER.bits()
            | Self::INPUT_ASSEMBLER.bits()
            | Self::RASTERIZER.bits()
            | Self::OUTPUT_MERGER.bits();
    }
}

/// Describes a buffer or texture as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceDesc {
    pub kind: ResourceKind,
    /// Buffer size in bytes, or texture width in texels.
    pub width: u64,
    pub height: u32,
    pub depth_or_layers: u16,
    pub levels: u16,
    pub format: Format,
    pub samples: u16,
    pub heap: MemoryHeap,
    pub usage: ResourceUsage,
}

impl ResourceDesc {
    pub fn buffer(size: u64, heap: MemoryHeap, usage: ResourceUsage) -> Self {
        Self {
            kind: ResourceKind::Buffer,
            width: size,
            height: 1,
            depth_or_layers: 1,
            levels: 1,
            format: Format::Unknown,
            samples: 1,
            heap,
            usage,
        }
    }

    pub fn texture_2d(width: u32, height: u32, format: Format, usage: ResourceUsage) -> Self {
        Self {
            kind: ResourceKind::Texture2d,
            width: u64::from(width),
            height,
            depth_or_layers: 1,
            levels: 1,
            format,
            samples: 1,
            heap: MemoryHeap::GpuOnly,
            usage,
        }
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, ResourceKind::Buffer)
    }

    pub fn size(&self) -> u64 {
        self.width
    }

    /// Texture extent in texels; buffers report `(size, 1)`.
    pub fn extent(&self) -> (u32, u32) {
        (self.width.min(u64::from(u32::MAX)) as u32, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceViewDesc {
    pub format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn covering(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Individually bindable dynamic pipeline state values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicState {
    PrimitiveTopology,
    BlendConstant,
    SampleMask,
    StencilReferenceValue,
    DepthBias,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    Sampler,
    ShaderResourceView,
    UnorderedAccessView,
    ConstantBuffer,
}

/// A byte range of a buffer; `size == u64::MAX` means "to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BufferRange {
    pub buffer: ResourceHandle,
    pub offset: u64,
    pub size: u64,
}

impl BufferRange {
    pub fn whole(buffer: ResourceHandle) -> Self {
        Self {
            buffer,
            offset: 0,
            size: u64::MAX,
        }
    }

    /// Clamps the range to a buffer of `len` bytes.
    pub fn resolved_size(&self, len: u64) -> u64 {
        len.saturating_sub(self.offset).min(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Descriptors {
    Views(Vec<ResourceViewHandle>),
    Buffers(Vec<BufferRange>),
    Samplers(Vec<SamplerHandle>),
}

impl Descriptors {
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Views(views) => views.len(),
            Descriptors::Buffers(buffers) => buffers.len(),
            Descriptors::Samplers(samplers) => samplers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A write of descriptors into a table, or a push of transient descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTableUpdate {
    pub table: DescriptorTableHandle,
    pub binding: u32,
    pub array_offset: u32,
    pub kind: DescriptorKind,
    pub descriptors: Descriptors,
}

/// One parameter (root parameter / set layout) of a pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineLayoutParam {
    PushConstants,
    PushDescriptors,
    DescriptorTable,
}

impl PipelineLayoutParam {
    /// Push parameters are rewritten by the host before each draw.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            PipelineLayoutParam::PushConstants | PipelineLayoutParam::PushDescriptors
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RenderPassRenderTarget {
    pub view: ResourceViewHandle,
    /// Clear color applied when the pass begins; `None` loads existing contents.
    #[serde(default)]
    pub clear_color: Option<[f32; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RenderPassDepthStencil {
    pub view: ResourceViewHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    WriteDiscard,
}

impl MapAccess {
    pub fn writes(self) -> bool {
        !matches!(self, MapAccess::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_variants_round_trip() {
        assert_eq!(Format::R8G8B8A8Typeless.to_srgb(), Format::R8G8B8A8UnormSrgb);
        assert_eq!(Format::B8G8R8A8UnormSrgb.to_non_srgb(), Format::B8G8R8A8Unorm);
        assert_eq!(Format::R16G16B16A16Float.to_srgb(), Format::R16G16B16A16Float);
        assert!(Format::R8G8B8A8UnormSrgb.is_srgb());
        assert!(!Format::R10G10B10A2Unorm.is_srgb());
    }

    #[test]
    fn buffer_range_clamps_to_length() {
        let range = BufferRange {
            buffer: ResourceHandle(1),
            offset: 16,
            size: u64::MAX,
        };
        assert_eq!(range.resolved_size(64), 48);
        assert_eq!(range.resolved_size(8), 0);
        let bounded = BufferRange { size: 16, ..range };
        assert_eq!(bounded.resolved_size(64), 16);
    }

    #[test]
    fn push_parameters_are_transient() {
        assert!(PipelineLayoutParam::PushConstants.is_transient());
        assert!(PipelineLayoutParam::PushDescriptors.is_transient());
        assert!(!PipelineLayoutParam::DescriptorTable.is_transient());
    }
}
