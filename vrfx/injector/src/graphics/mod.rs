mod format;
mod state;

pub mod nvapi;

#[cfg(windows)]
pub mod d3d11;
#[cfg(test)]
pub mod mock;

pub use format::*;
pub use state::*;

use crate::injector::DeviceInjector;
use bitflags::bitflags;
use std::{fmt::Debug, hash::Hash, os::raw::c_void, sync::Arc};
use vrfx_common::*;

pub const VERTEX_BUFFER_SLOTS: usize = 32;
pub const RENDER_TARGET_SLOTS: usize = 8;
pub const VIEWPORT_SLOTS: usize = 16;
pub const SHADER_RESOURCE_SLOTS: usize = 128;
pub const UNORDERED_ACCESS_SLOTS: usize = 64;
pub const SAMPLER_SLOTS: usize = 16;

/// Reference-counted graphics object. Cloning adds a reference, dropping releases it, equality and
/// hashing follow object identity.
pub trait Handle: Clone + Eq + Hash + Debug + 'static {}
impl<T: Clone + Eq + Hash + Debug + 'static> Handle for T {}

bitflags! {
    pub struct BindFlags: u32 {
        const CONSTANT_BUFFER = 0x4;
        const SHADER_RESOURCE = 0x8;
        const RENDER_TARGET = 0x20;
        const DEPTH_STENCIL = 0x40;
        const UNORDERED_ACCESS = 0x80;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_size: u32,
    pub format: Format,
    pub sample_count: u32,
    pub bind_flags: BindFlags,
}

impl TextureDesc {
    pub fn storage(width: u32, height: u32, format: Format) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            array_size: 1,
            format,
            sample_count: 1,
            bind_flags: BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS,
        }
    }
}

pub struct InitialData<'a> {
    pub bytes: &'a [u8],
    pub row_pitch: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ViewDimension {
    Unknown,
    Buffer,
    Texture1D,
    Texture1DArray,
    Texture2D,
    Texture2DArray,
    Texture2DMs,
    Texture2DMsArray,
    Texture3D,
}

impl ViewDimension {
    pub fn is_texture_2d(self) -> bool {
        match self {
            ViewDimension::Texture2D
            | ViewDimension::Texture2DArray
            | ViewDimension::Texture2DMs
            | ViewDimension::Texture2DMsArray => true,
            _ => false,
        }
    }
}

/// Geometry of the resource behind a render target view.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RenderTargetInfo {
    pub dimension: ViewDimension,
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
}

// Raw D3D11 sampler description, every field is carried so that a copy differs only in what is
// explicitly changed.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct SamplerDesc {
    pub filter: u32,
    pub address_u: u32,
    pub address_v: u32,
    pub address_w: u32,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub comparison_func: u32,
    pub border_color: [f32; 4],
    pub min_lod: f32,
    pub max_lod: f32,
}

impl SamplerDesc {
    const FILTER_COMPARISON_MIN_MAG_MIP_LINEAR: u32 = 0x95;
    const TEXTURE_ADDRESS_CLAMP: u32 = 3;
    const COMPARISON_NEVER: u32 = 1;

    pub fn linear_clamp() -> Self {
        Self {
            filter: Self::FILTER_COMPARISON_MIN_MAG_MIP_LINEAR,
            address_u: Self::TEXTURE_ADDRESS_CLAMP,
            address_v: Self::TEXTURE_ADDRESS_CLAMP,
            address_w: Self::TEXTURE_ADDRESS_CLAMP,
            mip_lod_bias: 0.,
            max_anisotropy: 1,
            comparison_func: Self::COMPARISON_NEVER,
            border_color: [0.; 4],
            min_lod: 0.,
            max_lod: 0.,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Compute,
}

#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct NativeViewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

pub struct VertexBufferBinding<B: Backend> {
    pub buffer: Option<B::Buffer>,
    pub stride: u32,
    pub offset: u32,
}

impl<B: Backend> Clone for VertexBufferBinding<B> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            stride: self.stride,
            offset: self.offset,
        }
    }
}

impl<B: Backend> PartialEq for VertexBufferBinding<B> {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer && self.stride == other.stride && self.offset == other.offset
    }
}

impl<B: Backend> Debug for VertexBufferBinding<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} ({}, {})", self.buffer, self.stride, self.offset)
    }
}

impl<B: Backend> Default for VertexBufferBinding<B> {
    fn default() -> Self {
        Self {
            buffer: None,
            stride: 0,
            offset: 0,
        }
    }
}

pub struct IndexBufferBinding<B: Backend> {
    pub buffer: Option<B::Buffer>,
    pub format: Format,
    pub offset: u32,
}

impl<B: Backend> Clone for IndexBufferBinding<B> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            format: self.format,
            offset: self.offset,
        }
    }
}

impl<B: Backend> PartialEq for IndexBufferBinding<B> {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer && self.format == other.format && self.offset == other.offset
    }
}

impl<B: Backend> Debug for IndexBufferBinding<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} ({:?}, {})", self.buffer, self.format, self.offset)
    }
}

impl<B: Backend> Default for IndexBufferBinding<B> {
    fn default() -> Self {
        Self {
            buffer: None,
            format: Format::UNKNOWN,
            offset: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueryKind {
    TimestampDisjoint,
    Timestamp,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimestampDisjoint {
    pub frequency: u64,
    pub disjoint: bool,
}

/// Family of native graphics object types. Everything above this layer is API agnostic.
pub trait Backend: Sized + 'static {
    type Device: Device<Self> + Clone;
    type Context: DeviceContext<Self>;
    type Texture: Handle;
    type ShaderResourceView: Handle;
    type UnorderedAccessView: Handle;
    type RenderTargetView: Handle;
    type DepthStencilView: Handle;
    type Buffer: Handle;
    type VertexShader: Handle;
    type PixelShader: Handle;
    type ComputeShader: Handle;
    type InputLayout: Handle;
    type RasterizerState: Handle;
    type DepthStencilState: Handle;
    type SamplerState: Handle;
    type Query: Handle;

    /// Wrap a texture pointer received from the host, adding a reference.
    ///
    /// # Safety
    /// `handle` must be null or point to a live texture object of this backend.
    unsafe fn texture_from_raw(handle: *mut c_void) -> Option<Self::Texture>;

    fn texture_as_raw(texture: &Self::Texture) -> *mut c_void;

    fn texture_desc(texture: &Self::Texture) -> TextureDesc;

    fn texture_device(texture: &Self::Texture) -> StrResult<Self::Device>;

    fn sampler_desc(sampler: &Self::SamplerState) -> SamplerDesc;

    fn render_target_info(view: &Self::RenderTargetView) -> RenderTargetInfo;
}

pub trait Device<B: Backend> {
    fn immediate_context(&self) -> StrResult<B::Context>;

    fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<InitialData>,
    ) -> StrResult<B::Texture>;

    /// View of mip 0 onwards. `array_slice` selects a single slice of an array texture.
    fn create_shader_resource_view(
        &self,
        texture: &B::Texture,
        format: Format,
        array_slice: Option<u32>,
    ) -> StrResult<B::ShaderResourceView>;

    fn create_unordered_access_view(
        &self,
        texture: &B::Texture,
        format: Format,
        array_slice: Option<u32>,
    ) -> StrResult<B::UnorderedAccessView>;

    fn create_constant_buffer(&self, size: u32) -> StrResult<B::Buffer>;

    fn create_sampler(&self, desc: &SamplerDesc) -> StrResult<B::SamplerState>;

    fn create_compute_shader(&self, bytecode: &[u8]) -> StrResult<B::ComputeShader>;

    fn create_query(&self, kind: QueryKind) -> StrResult<B::Query>;

    /// Start routing the intercepted context calls of this device to `injector`.
    fn attach_injector(&self, injector: &Arc<DeviceInjector<B>>) -> StrResult;

    fn detach_injector(&self, injector: &Arc<DeviceInjector<B>>);
}

pub trait DeviceContext<B: Backend> {
    fn vertex_shader(&self) -> Option<B::VertexShader>;
    fn set_vertex_shader(&self, shader: Option<&B::VertexShader>);
    fn pixel_shader(&self) -> Option<B::PixelShader>;
    fn set_pixel_shader(&self, shader: Option<&B::PixelShader>);
    fn compute_shader(&self) -> Option<B::ComputeShader>;
    fn set_compute_shader(&self, shader: Option<&B::ComputeShader>);

    fn input_layout(&self) -> Option<B::InputLayout>;
    fn set_input_layout(&self, layout: Option<&B::InputLayout>);
    fn primitive_topology(&self) -> u32;
    fn set_primitive_topology(&self, topology: u32);
    fn vertex_buffers(&self) -> Vec<VertexBufferBinding<B>>;
    fn set_vertex_buffers(&self, bindings: &[VertexBufferBinding<B>]);
    fn index_buffer(&self) -> IndexBufferBinding<B>;
    fn set_index_buffer(&self, binding: &IndexBufferBinding<B>);

    fn render_targets(&self) -> (Vec<Option<B::RenderTargetView>>, Option<B::DepthStencilView>);
    fn set_render_targets(
        &self,
        views: &[Option<B::RenderTargetView>],
        depth_stencil: Option<&B::DepthStencilView>,
    );
    fn rasterizer_state(&self) -> Option<B::RasterizerState>;
    fn set_rasterizer_state(&self, state: Option<&B::RasterizerState>);
    fn depth_stencil_state(&self) -> (Option<B::DepthStencilState>, u32);
    fn set_depth_stencil_state(&self, state: Option<&B::DepthStencilState>, stencil_ref: u32);
    fn viewports(&self) -> Vec<NativeViewport>;
    fn set_viewports(&self, viewports: &[NativeViewport]);

    // Slot 0 only.
    fn constant_buffer(&self, stage: ShaderStage) -> Option<B::Buffer>;
    fn set_constant_buffer(&self, stage: ShaderStage, buffer: Option<&B::Buffer>);

    fn cs_shader_resources(&self) -> Vec<Option<B::ShaderResourceView>>;
    fn set_cs_shader_resources(&self, start_slot: u32, views: &[Option<B::ShaderResourceView>]);
    fn cs_unordered_access_views(&self) -> Vec<Option<B::UnorderedAccessView>>;
    /// Hidden append/consume counters of the bound views are left untouched.
    fn set_cs_unordered_access_views(
        &self,
        start_slot: u32,
        views: &[Option<B::UnorderedAccessView>],
    );
    fn set_cs_samplers(&self, start_slot: u32, samplers: &[Option<B::SamplerState>]);
    fn set_ps_samplers(&self, start_slot: u32, samplers: &[Option<B::SamplerState>]);

    fn update_buffer(&self, buffer: &B::Buffer, data: &[u8]);
    fn update_texture(&self, texture: &B::Texture, subresource: u32, data: &[u8], row_pitch: u32);
    fn copy_subresource_region(
        &self,
        destination: &B::Texture,
        destination_subresource: u32,
        source: &B::Texture,
        source_subresource: u32,
        width: u32,
        height: u32,
    );
    fn resolve_subresource(
        &self,
        destination: &B::Texture,
        destination_subresource: u32,
        source: &B::Texture,
        source_subresource: u32,
        format: Format,
    );
    fn dispatch(&self, groups_x: u32, groups_y: u32, groups_z: u32);

    fn begin_query(&self, query: &B::Query);
    fn end_query(&self, query: &B::Query);
    /// `None` while the GPU has not produced the result yet.
    fn timestamp(&self, query: &B::Query) -> Option<u64>;
    fn timestamp_disjoint(&self, query: &B::Query) -> Option<TimestampDisjoint>;
}
