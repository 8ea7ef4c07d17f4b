use crate::types::{
    BufferRange, DescriptorTableHandle, DescriptorTableUpdate, DynamicState, PipelineHandle,
    PipelineLayoutHandle, PipelineStages, Rect, RenderPassDepthStencil, RenderPassRenderTarget,
    ResourceDesc, ResourceHandle, ResourceUsage, ResourceViewDesc, ResourceViewHandle,
    ShaderStages, Viewport,
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unknown {kind} handle {handle:#x}")]
    UnknownHandle { kind: &'static str, handle: u64 },
    #[error("failed to create {0}")]
    CreateFailed(String),
    #[error("failed to map resource {0:#x}")]
    MapFailed(u64),
    #[error("range {offset}+{size} exceeds resource size {len}")]
    OutOfRange { offset: u64, size: u64, len: u64 },
}

/// Device-level services the host exposes to the interception core.
///
/// Implementations wrap the host graphics device; every method may be called
/// from any thread that issues graphics callbacks.
pub trait Device: Send + Sync {
    fn resource_desc(&self, resource: ResourceHandle) -> Result<ResourceDesc, ApiError>;

    fn view_resource(&self, view: ResourceViewHandle) -> Result<ResourceHandle, ApiError>;

    fn view_desc(&self, view: ResourceViewHandle) -> Result<ResourceViewDesc, ApiError>;

    fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<ResourceHandle, ApiError>;

    fn destroy_resource(&self, resource: ResourceHandle);

    fn create_resource_view(
        &self,
        resource: ResourceHandle,
        usage: ResourceUsage,
        desc: &ResourceViewDesc,
    ) -> Result<ResourceViewHandle, ApiError>;

    fn destroy_resource_view(&self, view: ResourceViewHandle);

    /// Maps `resource` for reading, copies `out.len()` bytes starting at
    /// `offset`, and unmaps it again.
    fn read_buffer(
        &self,
        resource: ResourceHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), ApiError>;
}

/// Recording interface of a host command list. A command list is only ever
/// recorded from one thread at a time.
pub trait CommandList {
    fn bind_pipeline(&mut self, stages: PipelineStages, pipeline: PipelineHandle);

    fn bind_pipeline_states(&mut self, states: &[DynamicState], values: &[u32]);

    fn bind_viewports(&mut self, first: u32, viewports: &[Viewport]);

    fn bind_scissor_rects(&mut self, first: u32, rects: &[Rect]);

    fn bind_render_targets_and_depth_stencil(
        &mut self,
        targets: &[ResourceViewHandle],
        depth_stencil: ResourceViewHandle,
    );

    fn begin_render_pass(
        &mut self,
        targets: &[RenderPassRenderTarget],
        depth_stencil: Option<&RenderPassDepthStencil>,
    );

    fn end_render_pass(&mut self);

    fn push_constants(
        &mut self,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        first: u32,
        values: &[u32],
    );

    fn push_descriptors(
        &mut self,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        param: u32,
        update: &DescriptorTableUpdate,
    );

    fn bind_descriptor_tables(
        &mut self,
        stages: ShaderStages,
        layout: PipelineLayoutHandle,
        first: u32,
        tables: &[DescriptorTableHandle],
    );

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);

    fn copy_resource(&mut self, source: ResourceHandle, dest: ResourceHandle);

    fn copy_buffer_region(&mut self, source: BufferRange, dest: ResourceHandle, dest_offset: u64);

    fn barrier(&mut self, resource: ResourceHandle, old: ResourceUsage, new: ResourceUsage);
}
