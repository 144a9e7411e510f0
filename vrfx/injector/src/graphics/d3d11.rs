// Native backend over the D3D11 COM interfaces of the host device.

use super::*;
use crate::{hooks::*, platform::HOOKS};
use lazy_static::lazy_static;
use log::*;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    hash::Hasher,
    mem,
    ops::Deref,
    ptr::{self, null_mut},
};
use winapi::{
    shared::{dxgitype::DXGI_SAMPLE_DESC, minwindef::UINT, ntdef::HRESULT, winerror::*},
    um::{d3d11::*, d3dcommon::*, unknwnbase::IUnknown},
    Interface,
};
use wio::com::ComPtr;

const TRACE_CONTEXT: &str = "D3D11";

const PS_SET_SAMPLERS_SLOT: usize = 10;
const OM_SET_RENDER_TARGETS_SLOT: usize = 33;

/// Owned COM reference with identity semantics.
pub struct Com<T: Interface>(ComPtr<T>);

impl<T: Interface> Com<T> {
    /// Take over a reference returned by a getter or a creation call.
    pub unsafe fn from_owned(raw: *mut T) -> Option<Self> {
        if raw.is_null() {
            None
        } else {
            Some(Self(ComPtr::from_raw(raw)))
        }
    }

    /// Add a reference to an object owned by someone else.
    pub unsafe fn from_borrowed(raw: *mut T) -> Option<Self> {
        if raw.is_null() {
            None
        } else {
            (*(raw as *mut IUnknown)).AddRef();
            Some(Self(ComPtr::from_raw(raw)))
        }
    }

    pub fn as_raw(&self) -> *mut T {
        self.0.as_raw()
    }
}

impl<T: Interface> Clone for Com<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Interface> PartialEq for Com<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_raw() == other.as_raw()
    }
}

impl<T: Interface> Eq for Com<T> {}

impl<T: Interface> Hash for Com<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.as_raw() as usize).hash(state)
    }
}

impl<T: Interface> fmt::Debug for Com<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.as_raw())
    }
}

impl<T: Interface> Deref for Com<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

fn raw_or_null<T: Interface>(handle: Option<&Com<T>>) -> *mut T {
    handle.map(Com::as_raw).unwrap_or(null_mut())
}

fn raw_list<T: Interface>(handles: &[Option<Com<T>>]) -> Vec<*mut T> {
    handles.iter().map(|h| raw_or_null(h.as_ref())).collect()
}

unsafe fn owned_list<T: Interface>(raws: &[*mut T]) -> Vec<Option<Com<T>>> {
    raws.iter().map(|&raw| Com::from_owned(raw)).collect()
}

fn hresult_name(hr: HRESULT) -> String {
    match hr {
        E_FAIL => "E_FAIL".into(),
        E_INVALIDARG => "E_INVALIDARG".into(),
        E_OUTOFMEMORY => "E_OUTOFMEMORY".into(),
        E_NOINTERFACE => "E_NOINTERFACE".into(),
        E_NOTIMPL => "E_NOTIMPL".into(),
        DXGI_ERROR_DEVICE_REMOVED => "DXGI_ERROR_DEVICE_REMOVED".into(),
        DXGI_ERROR_DEVICE_HUNG => "DXGI_ERROR_DEVICE_HUNG".into(),
        DXGI_ERROR_DEVICE_RESET => "DXGI_ERROR_DEVICE_RESET".into(),
        DXGI_ERROR_INVALID_CALL => "DXGI_ERROR_INVALID_CALL".into(),
        _ => format!("{:#010x}", hr),
    }
}

fn check(hr: HRESULT, operation: &str) -> StrResult {
    if SUCCEEDED(hr) {
        Ok(())
    } else {
        trace_str!("{} failed: {}", operation, hresult_name(hr))
    }
}

unsafe fn created<T: Interface>(hr: HRESULT, raw: *mut T, operation: &str) -> StrResult<Com<T>> {
    check(hr, operation)?;
    trace_none!(Com::from_owned(raw), "{} returned null", operation)
}

pub enum D3D11 {}

impl Backend for D3D11 {
    type Device = Com<ID3D11Device>;
    type Context = Com<ID3D11DeviceContext>;
    type Texture = Com<ID3D11Texture2D>;
    type ShaderResourceView = Com<ID3D11ShaderResourceView>;
    type UnorderedAccessView = Com<ID3D11UnorderedAccessView>;
    type RenderTargetView = Com<ID3D11RenderTargetView>;
    type DepthStencilView = Com<ID3D11DepthStencilView>;
    type Buffer = Com<ID3D11Buffer>;
    type VertexShader = Com<ID3D11VertexShader>;
    type PixelShader = Com<ID3D11PixelShader>;
    type ComputeShader = Com<ID3D11ComputeShader>;
    type InputLayout = Com<ID3D11InputLayout>;
    type RasterizerState = Com<ID3D11RasterizerState>;
    type DepthStencilState = Com<ID3D11DepthStencilState>;
    type SamplerState = Com<ID3D11SamplerState>;
    type Query = Com<ID3D11Query>;

    unsafe fn texture_from_raw(handle: *mut c_void) -> Option<Self::Texture> {
        Com::from_borrowed(handle as *mut ID3D11Texture2D)
    }

    fn texture_as_raw(texture: &Self::Texture) -> *mut c_void {
        texture.as_raw() as _
    }

    fn texture_desc(texture: &Self::Texture) -> TextureDesc {
        let mut desc: D3D11_TEXTURE2D_DESC = unsafe { mem::zeroed() };
        unsafe { texture.GetDesc(&mut desc) };

        TextureDesc {
            width: desc.Width,
            height: desc.Height,
            mip_levels: desc.MipLevels,
            array_size: desc.ArraySize,
            format: Format(desc.Format),
            sample_count: desc.SampleDesc.Count,
            bind_flags: BindFlags::from_bits_truncate(desc.BindFlags),
        }
    }

    fn texture_device(texture: &Self::Texture) -> StrResult<Self::Device> {
        let mut device = null_mut();
        unsafe {
            texture.GetDevice(&mut device);
            trace_none!(Com::from_owned(device), "The texture has no device")
        }
    }

    fn sampler_desc(sampler: &Self::SamplerState) -> SamplerDesc {
        let mut desc: D3D11_SAMPLER_DESC = unsafe { mem::zeroed() };
        unsafe { sampler.GetDesc(&mut desc) };

        SamplerDesc {
            filter: desc.Filter,
            address_u: desc.AddressU,
            address_v: desc.AddressV,
            address_w: desc.AddressW,
            mip_lod_bias: desc.MipLODBias,
            max_anisotropy: desc.MaxAnisotropy,
            comparison_func: desc.ComparisonFunc,
            border_color: desc.BorderColor,
            min_lod: desc.MinLOD,
            max_lod: desc.MaxLOD,
        }
    }

    fn render_target_info(view: &Self::RenderTargetView) -> RenderTargetInfo {
        let mut desc: D3D11_RENDER_TARGET_VIEW_DESC = unsafe { mem::zeroed() };
        unsafe { view.GetDesc(&mut desc) };

        let dimension = match desc.ViewDimension {
            D3D11_RTV_DIMENSION_BUFFER => ViewDimension::Buffer,
            D3D11_RTV_DIMENSION_TEXTURE1D => ViewDimension::Texture1D,
            D3D11_RTV_DIMENSION_TEXTURE1DARRAY => ViewDimension::Texture1DArray,
            D3D11_RTV_DIMENSION_TEXTURE2D => ViewDimension::Texture2D,
            D3D11_RTV_DIMENSION_TEXTURE2DARRAY => ViewDimension::Texture2DArray,
            D3D11_RTV_DIMENSION_TEXTURE2DMS => ViewDimension::Texture2DMs,
            D3D11_RTV_DIMENSION_TEXTURE2DMSARRAY => ViewDimension::Texture2DMsArray,
            D3D11_RTV_DIMENSION_TEXTURE3D => ViewDimension::Texture3D,
            _ => ViewDimension::Unknown,
        };
        let mut info = RenderTargetInfo {
            dimension,
            width: 0,
            height: 0,
            array_size: 0,
        };
        if !dimension.is_texture_2d() {
            return info;
        }

        let mut resource = null_mut();
        let resource = unsafe {
            view.GetResource(&mut resource);
            Com::from_owned(resource)
        };
        let texture = resource.and_then(|resource| resource.0.cast::<ID3D11Texture2D>().ok());
        if let Some(texture) = texture {
            let desc = Self::texture_desc(&Com(texture));
            info.width = desc.width;
            info.height = desc.height;
            info.array_size = desc.array_size;
        }
        info
    }
}

impl Device<D3D11> for Com<ID3D11Device> {
    fn immediate_context(&self) -> StrResult<Com<ID3D11DeviceContext>> {
        let mut context = null_mut();
        unsafe {
            self.GetImmediateContext(&mut context);
            trace_none!(Com::from_owned(context), "The device has no immediate context")
        }
    }

    fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<InitialData>,
    ) -> StrResult<Com<ID3D11Texture2D>> {
        let native_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: desc.mip_levels,
            ArraySize: desc.array_size,
            Format: desc.format.0,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: desc.sample_count,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: desc.bind_flags.bits(),
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let data = initial_data.map(|data| D3D11_SUBRESOURCE_DATA {
            pSysMem: data.bytes.as_ptr() as _,
            SysMemPitch: data.row_pitch,
            SysMemSlicePitch: 0,
        });
        let data_ptr = data.as_ref().map(|d| d as *const _).unwrap_or(ptr::null());

        let mut texture = null_mut();
        unsafe {
            let hr = self.CreateTexture2D(&native_desc, data_ptr, &mut texture);
            created(hr, texture, "CreateTexture2D")
        }
    }

    fn create_shader_resource_view(
        &self,
        texture: &Com<ID3D11Texture2D>,
        format: Format,
        array_slice: Option<u32>,
    ) -> StrResult<Com<ID3D11ShaderResourceView>> {
        let texture_desc = D3D11::texture_desc(texture);
        let mut desc: D3D11_SHADER_RESOURCE_VIEW_DESC = unsafe { mem::zeroed() };
        desc.Format = format.0;

        unsafe {
            if texture_desc.sample_count > 1 {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE2DMS;
            } else if texture_desc.array_size > 1 {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE2DARRAY;
                let view = desc.u.Texture2DArray_mut();
                view.MostDetailedMip = 0;
                view.MipLevels = texture_desc.mip_levels;
                view.FirstArraySlice = array_slice.unwrap_or(0);
                view.ArraySize = if array_slice.is_some() {
                    1
                } else {
                    texture_desc.array_size
                };
            } else {
                desc.ViewDimension = D3D11_SRV_DIMENSION_TEXTURE2D;
                let view = desc.u.Texture2D_mut();
                view.MostDetailedMip = 0;
                view.MipLevels = texture_desc.mip_levels;
            }

            let mut view = null_mut();
            let hr = self.CreateShaderResourceView(texture.as_raw() as _, &desc, &mut view);
            created(hr, view, "CreateShaderResourceView")
        }
    }

    fn create_unordered_access_view(
        &self,
        texture: &Com<ID3D11Texture2D>,
        format: Format,
        array_slice: Option<u32>,
    ) -> StrResult<Com<ID3D11UnorderedAccessView>> {
        let texture_desc = D3D11::texture_desc(texture);
        let mut desc: D3D11_UNORDERED_ACCESS_VIEW_DESC = unsafe { mem::zeroed() };
        desc.Format = format.0;

        unsafe {
            if texture_desc.array_size > 1 {
                desc.ViewDimension = D3D11_UAV_DIMENSION_TEXTURE2DARRAY;
                let view = desc.u.Texture2DArray_mut();
                view.MipSlice = 0;
                view.FirstArraySlice = array_slice.unwrap_or(0);
                view.ArraySize = if array_slice.is_some() {
                    1
                } else {
                    texture_desc.array_size
                };
            } else {
                desc.ViewDimension = D3D11_UAV_DIMENSION_TEXTURE2D;
                desc.u.Texture2D_mut().MipSlice = 0;
            }

            let mut view = null_mut();
            let hr = self.CreateUnorderedAccessView(texture.as_raw() as _, &desc, &mut view);
            created(hr, view, "CreateUnorderedAccessView")
        }
    }

    fn create_constant_buffer(&self, size: u32) -> StrResult<Com<ID3D11Buffer>> {
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: size,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE,
            MiscFlags: 0,
            StructureByteStride: 0,
        };

        let mut buffer = null_mut();
        unsafe {
            let hr = self.CreateBuffer(&desc, ptr::null(), &mut buffer);
            created(hr, buffer, "CreateBuffer")
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> StrResult<Com<ID3D11SamplerState>> {
        let native_desc = D3D11_SAMPLER_DESC {
            Filter: desc.filter,
            AddressU: desc.address_u,
            AddressV: desc.address_v,
            AddressW: desc.address_w,
            MipLODBias: desc.mip_lod_bias,
            MaxAnisotropy: desc.max_anisotropy,
            ComparisonFunc: desc.comparison_func,
            BorderColor: desc.border_color,
            MinLOD: desc.min_lod,
            MaxLOD: desc.max_lod,
        };

        let mut sampler = null_mut();
        unsafe {
            let hr = self.CreateSamplerState(&native_desc, &mut sampler);
            created(hr, sampler, "CreateSamplerState")
        }
    }

    fn create_compute_shader(&self, bytecode: &[u8]) -> StrResult<Com<ID3D11ComputeShader>> {
        let mut shader = null_mut();
        unsafe {
            let hr = self.CreateComputeShader(
                bytecode.as_ptr() as _,
                bytecode.len(),
                null_mut(),
                &mut shader,
            );
            created(hr, shader, "CreateComputeShader")
        }
    }

    fn create_query(&self, kind: QueryKind) -> StrResult<Com<ID3D11Query>> {
        let desc = D3D11_QUERY_DESC {
            Query: match kind {
                QueryKind::TimestampDisjoint => D3D11_QUERY_TIMESTAMP_DISJOINT,
                QueryKind::Timestamp => D3D11_QUERY_TIMESTAMP,
            },
            MiscFlags: 0,
        };

        let mut query = null_mut();
        unsafe {
            let hr = self.CreateQuery(&desc, &mut query);
            created(hr, query, "CreateQuery")
        }
    }

    fn attach_injector(&self, injector: &Arc<DeviceInjector<D3D11>>) -> StrResult {
        let context = self.immediate_context()?;
        install_context_hooks(&context)?;

        let mut injectors = CONTEXT_INJECTORS.lock();
        let list = injectors
            .entry(context.as_raw() as usize)
            .or_insert_with(|| InjectorList(vec![]));
        if !list.0.iter().any(|i| Arc::ptr_eq(i, injector)) {
            list.0.push(injector.clone());
        }
        Ok(())
    }

    fn detach_injector(&self, injector: &Arc<DeviceInjector<D3D11>>) {
        let key = match self.immediate_context() {
            Ok(context) => context.as_raw() as usize,
            Err(_) => return,
        };
        let mut injectors = CONTEXT_INJECTORS.lock();
        if let Some(list) = injectors.get_mut(&key) {
            list.0.retain(|i| !Arc::ptr_eq(i, injector));
            if list.0.is_empty() {
                injectors.remove(&key);
            }
        }
    }
}

impl DeviceContext<D3D11> for Com<ID3D11DeviceContext> {
    fn vertex_shader(&self) -> Option<Com<ID3D11VertexShader>> {
        let (mut shader, mut instance_count) = (null_mut(), 0);
        unsafe {
            self.VSGetShader(&mut shader, null_mut(), &mut instance_count);
            Com::from_owned(shader)
        }
    }

    fn set_vertex_shader(&self, shader: Option<&Com<ID3D11VertexShader>>) {
        unsafe { self.VSSetShader(raw_or_null(shader), ptr::null(), 0) }
    }

    fn pixel_shader(&self) -> Option<Com<ID3D11PixelShader>> {
        let (mut shader, mut instance_count) = (null_mut(), 0);
        unsafe {
            self.PSGetShader(&mut shader, null_mut(), &mut instance_count);
            Com::from_owned(shader)
        }
    }

    fn set_pixel_shader(&self, shader: Option<&Com<ID3D11PixelShader>>) {
        unsafe { self.PSSetShader(raw_or_null(shader), ptr::null(), 0) }
    }

    fn compute_shader(&self) -> Option<Com<ID3D11ComputeShader>> {
        let (mut shader, mut instance_count) = (null_mut(), 0);
        unsafe {
            self.CSGetShader(&mut shader, null_mut(), &mut instance_count);
            Com::from_owned(shader)
        }
    }

    fn set_compute_shader(&self, shader: Option<&Com<ID3D11ComputeShader>>) {
        unsafe { self.CSSetShader(raw_or_null(shader), ptr::null(), 0) }
    }

    fn input_layout(&self) -> Option<Com<ID3D11InputLayout>> {
        let mut layout = null_mut();
        unsafe {
            self.IAGetInputLayout(&mut layout);
            Com::from_owned(layout)
        }
    }

    fn set_input_layout(&self, layout: Option<&Com<ID3D11InputLayout>>) {
        unsafe { self.IASetInputLayout(raw_or_null(layout)) }
    }

    fn primitive_topology(&self) -> u32 {
        let mut topology = 0;
        unsafe { self.IAGetPrimitiveTopology(&mut topology) };
        topology
    }

    fn set_primitive_topology(&self, topology: u32) {
        unsafe { self.IASetPrimitiveTopology(topology) }
    }

    fn vertex_buffers(&self) -> Vec<VertexBufferBinding<D3D11>> {
        let mut buffers = [null_mut(); VERTEX_BUFFER_SLOTS];
        let mut strides = [0; VERTEX_BUFFER_SLOTS];
        let mut offsets = [0; VERTEX_BUFFER_SLOTS];
        unsafe {
            self.IAGetVertexBuffers(
                0,
                VERTEX_BUFFER_SLOTS as _,
                buffers.as_mut_ptr(),
                strides.as_mut_ptr(),
                offsets.as_mut_ptr(),
            );
            (0..VERTEX_BUFFER_SLOTS)
                .map(|slot| VertexBufferBinding {
                    buffer: Com::from_owned(buffers[slot]),
                    stride: strides[slot],
                    offset: offsets[slot],
                })
                .collect()
        }
    }

    fn set_vertex_buffers(&self, bindings: &[VertexBufferBinding<D3D11>]) {
        let buffers = bindings
            .iter()
            .map(|b| raw_or_null(b.buffer.as_ref()))
            .collect::<Vec<_>>();
        let strides = bindings.iter().map(|b| b.stride).collect::<Vec<_>>();
        let offsets = bindings.iter().map(|b| b.offset).collect::<Vec<_>>();
        unsafe {
            self.IASetVertexBuffers(
                0,
                bindings.len() as _,
                buffers.as_ptr(),
                strides.as_ptr(),
                offsets.as_ptr(),
            )
        }
    }

    fn index_buffer(&self) -> IndexBufferBinding<D3D11> {
        let (mut buffer, mut format, mut offset) = (null_mut(), 0, 0);
        unsafe {
            self.IAGetIndexBuffer(&mut buffer, &mut format, &mut offset);
            IndexBufferBinding {
                buffer: Com::from_owned(buffer),
                format: Format(format),
                offset,
            }
        }
    }

    fn set_index_buffer(&self, binding: &IndexBufferBinding<D3D11>) {
        unsafe {
            self.IASetIndexBuffer(
                raw_or_null(binding.buffer.as_ref()),
                binding.format.0,
                binding.offset,
            )
        }
    }

    fn render_targets(
        &self,
    ) -> (
        Vec<Option<Com<ID3D11RenderTargetView>>>,
        Option<Com<ID3D11DepthStencilView>>,
    ) {
        let mut views = [null_mut(); RENDER_TARGET_SLOTS];
        let mut depth_stencil = null_mut();
        unsafe {
            self.OMGetRenderTargets(
                RENDER_TARGET_SLOTS as _,
                views.as_mut_ptr(),
                &mut depth_stencil,
            );
            (owned_list(&views), Com::from_owned(depth_stencil))
        }
    }

    fn set_render_targets(
        &self,
        views: &[Option<Com<ID3D11RenderTargetView>>],
        depth_stencil: Option<&Com<ID3D11DepthStencilView>>,
    ) {
        let views = raw_list(views);
        unsafe {
            self.OMSetRenderTargets(views.len() as _, views.as_ptr(), raw_or_null(depth_stencil))
        }
    }

    fn rasterizer_state(&self) -> Option<Com<ID3D11RasterizerState>> {
        let mut state = null_mut();
        unsafe {
            self.RSGetState(&mut state);
            Com::from_owned(state)
        }
    }

    fn set_rasterizer_state(&self, state: Option<&Com<ID3D11RasterizerState>>) {
        unsafe { self.RSSetState(raw_or_null(state)) }
    }

    fn depth_stencil_state(&self) -> (Option<Com<ID3D11DepthStencilState>>, u32) {
        let (mut state, mut stencil_ref) = (null_mut(), 0);
        unsafe {
            self.OMGetDepthStencilState(&mut state, &mut stencil_ref);
            (Com::from_owned(state), stencil_ref)
        }
    }

    fn set_depth_stencil_state(
        &self,
        state: Option<&Com<ID3D11DepthStencilState>>,
        stencil_ref: u32,
    ) {
        unsafe { self.OMSetDepthStencilState(raw_or_null(state), stencil_ref) }
    }

    fn viewports(&self) -> Vec<NativeViewport> {
        let mut count = 0;
        let mut viewports: [D3D11_VIEWPORT; VIEWPORT_SLOTS] = unsafe { mem::zeroed() };
        unsafe {
            self.RSGetViewports(&mut count, null_mut());
            count = count.min(VIEWPORT_SLOTS as UINT);
            self.RSGetViewports(&mut count, viewports.as_mut_ptr());
        }

        viewports[..count as usize]
            .iter()
            .map(|vp| NativeViewport {
                x: vp.TopLeftX,
                y: vp.TopLeftY,
                width: vp.Width,
                height: vp.Height,
                min_depth: vp.MinDepth,
                max_depth: vp.MaxDepth,
            })
            .collect()
    }

    fn set_viewports(&self, viewports: &[NativeViewport]) {
        let viewports = viewports
            .iter()
            .map(|vp| D3D11_VIEWPORT {
                TopLeftX: vp.x,
                TopLeftY: vp.y,
                Width: vp.width,
                Height: vp.height,
                MinDepth: vp.min_depth,
                MaxDepth: vp.max_depth,
            })
            .collect::<Vec<_>>();
        unsafe { self.RSSetViewports(viewports.len() as _, viewports.as_ptr()) }
    }

    fn constant_buffer(&self, stage: ShaderStage) -> Option<Com<ID3D11Buffer>> {
        let mut buffer = null_mut();
        unsafe {
            match stage {
                ShaderStage::Vertex => self.VSGetConstantBuffers(0, 1, &mut buffer),
                ShaderStage::Pixel => self.PSGetConstantBuffers(0, 1, &mut buffer),
                ShaderStage::Compute => self.CSGetConstantBuffers(0, 1, &mut buffer),
            }
            Com::from_owned(buffer)
        }
    }

    fn set_constant_buffer(&self, stage: ShaderStage, buffer: Option<&Com<ID3D11Buffer>>) {
        let buffer = raw_or_null(buffer);
        unsafe {
            match stage {
                ShaderStage::Vertex => self.VSSetConstantBuffers(0, 1, &buffer),
                ShaderStage::Pixel => self.PSSetConstantBuffers(0, 1, &buffer),
                ShaderStage::Compute => self.CSSetConstantBuffers(0, 1, &buffer),
            }
        }
    }

    fn cs_shader_resources(&self) -> Vec<Option<Com<ID3D11ShaderResourceView>>> {
        let mut views = vec![null_mut(); SHADER_RESOURCE_SLOTS];
        unsafe {
            self.CSGetShaderResources(0, SHADER_RESOURCE_SLOTS as _, views.as_mut_ptr());
            owned_list(&views)
        }
    }

    fn set_cs_shader_resources(
        &self,
        start_slot: u32,
        views: &[Option<Com<ID3D11ShaderResourceView>>],
    ) {
        let views = raw_list(views);
        unsafe { self.CSSetShaderResources(start_slot, views.len() as _, views.as_ptr()) }
    }

    fn cs_unordered_access_views(&self) -> Vec<Option<Com<ID3D11UnorderedAccessView>>> {
        let mut views = vec![null_mut(); UNORDERED_ACCESS_SLOTS];
        unsafe {
            self.CSGetUnorderedAccessViews(0, UNORDERED_ACCESS_SLOTS as _, views.as_mut_ptr());
            owned_list(&views)
        }
    }

    fn set_cs_unordered_access_views(
        &self,
        start_slot: u32,
        views: &[Option<Com<ID3D11UnorderedAccessView>>],
    ) {
        let views = raw_list(views);
        // -1 keeps the current hidden counters
        let initial_counts = vec![UINT::max_value(); views.len()];
        unsafe {
            self.CSSetUnorderedAccessViews(
                start_slot,
                views.len() as _,
                views.as_ptr(),
                initial_counts.as_ptr(),
            )
        }
    }

    fn set_cs_samplers(&self, start_slot: u32, samplers: &[Option<Com<ID3D11SamplerState>>]) {
        let samplers = raw_list(samplers);
        unsafe { self.CSSetSamplers(start_slot, samplers.len() as _, samplers.as_ptr()) }
    }

    fn set_ps_samplers(&self, start_slot: u32, samplers: &[Option<Com<ID3D11SamplerState>>]) {
        let samplers = raw_list(samplers);
        unsafe { self.PSSetSamplers(start_slot, samplers.len() as _, samplers.as_ptr()) }
    }

    fn update_buffer(&self, buffer: &Com<ID3D11Buffer>, data: &[u8]) {
        let mut desc: D3D11_BUFFER_DESC = unsafe { mem::zeroed() };
        unsafe { buffer.GetDesc(&mut desc) };

        let mut mapped: D3D11_MAPPED_SUBRESOURCE = unsafe { mem::zeroed() };
        let hr = unsafe {
            self.Map(
                buffer.as_raw() as _,
                0,
                D3D11_MAP_WRITE_DISCARD,
                0,
                &mut mapped,
            )
        };
        if let Err(e) = check(hr, "Map") {
            error!("Cannot update constant buffer: {}", e);
            return;
        }

        // constant buffers are updated whole
        let width = desc.ByteWidth as usize;
        let size = data.len().min(width);
        unsafe {
            let target = mapped.pData as *mut u8;
            ptr::copy_nonoverlapping(data.as_ptr(), target, size);
            ptr::write_bytes(target.add(size), 0, width - size);
            self.Unmap(buffer.as_raw() as _, 0);
        }
    }

    fn update_texture(
        &self,
        texture: &Com<ID3D11Texture2D>,
        subresource: u32,
        data: &[u8],
        row_pitch: u32,
    ) {
        unsafe {
            self.UpdateSubresource(
                texture.as_raw() as _,
                subresource,
                ptr::null(),
                data.as_ptr() as _,
                row_pitch,
                0,
            )
        }
    }

    fn copy_subresource_region(
        &self,
        destination: &Com<ID3D11Texture2D>,
        destination_subresource: u32,
        source: &Com<ID3D11Texture2D>,
        source_subresource: u32,
        width: u32,
        height: u32,
    ) {
        let region = D3D11_BOX {
            left: 0,
            top: 0,
            front: 0,
            right: width,
            bottom: height,
            back: 1,
        };
        unsafe {
            self.CopySubresourceRegion(
                destination.as_raw() as _,
                destination_subresource,
                0,
                0,
                0,
                source.as_raw() as _,
                source_subresource,
                &region,
            )
        }
    }

    fn resolve_subresource(
        &self,
        destination: &Com<ID3D11Texture2D>,
        destination_subresource: u32,
        source: &Com<ID3D11Texture2D>,
        source_subresource: u32,
        format: Format,
    ) {
        unsafe {
            self.ResolveSubresource(
                destination.as_raw() as _,
                destination_subresource,
                source.as_raw() as _,
                source_subresource,
                format.0,
            )
        }
    }

    fn dispatch(&self, groups_x: u32, groups_y: u32, groups_z: u32) {
        unsafe { self.Dispatch(groups_x, groups_y, groups_z) }
    }

    fn begin_query(&self, query: &Com<ID3D11Query>) {
        unsafe { self.Begin(query.as_raw() as _) }
    }

    fn end_query(&self, query: &Com<ID3D11Query>) {
        unsafe { self.End(query.as_raw() as _) }
    }

    fn timestamp(&self, query: &Com<ID3D11Query>) -> Option<u64> {
        let mut timestamp = 0_u64;
        let hr = unsafe {
            self.GetData(
                query.as_raw() as _,
                &mut timestamp as *mut _ as _,
                mem::size_of::<u64>() as _,
                0,
            )
        };
        if hr == S_OK {
            Some(timestamp)
        } else {
            None
        }
    }

    fn timestamp_disjoint(&self, query: &Com<ID3D11Query>) -> Option<TimestampDisjoint> {
        let mut data: D3D11_QUERY_DATA_TIMESTAMP_DISJOINT = unsafe { mem::zeroed() };
        let hr = unsafe {
            self.GetData(
                query.as_raw() as _,
                &mut data as *mut _ as _,
                mem::size_of::<D3D11_QUERY_DATA_TIMESTAMP_DISJOINT>() as _,
                0,
            )
        };
        if hr == S_OK {
            Some(TimestampDisjoint {
                frequency: data.Frequency,
                disjoint: data.Disjoint != 0,
            })
        } else {
            None
        }
    }
}

// Injectors are only touched from the thread that owns the immediate context.
struct InjectorList(Vec<Arc<DeviceInjector<D3D11>>>);
unsafe impl Send for InjectorList {}

lazy_static! {
    static ref CONTEXT_INJECTORS: Mutex<HashMap<usize, InjectorList>> =
        Mutex::new(HashMap::new());
}

fn injectors_for(context: *mut ID3D11DeviceContext) -> Vec<Arc<DeviceInjector<D3D11>>> {
    CONTEXT_INJECTORS
        .lock()
        .get(&(context as usize))
        .map(|list| list.0.clone())
        .unwrap_or_default()
}

type PsSetSamplersFn = unsafe extern "system" fn(
    *mut ID3D11DeviceContext,
    UINT,
    UINT,
    *const *mut ID3D11SamplerState,
);

type OmSetRenderTargetsFn = unsafe extern "system" fn(
    *mut ID3D11DeviceContext,
    UINT,
    *const *mut ID3D11RenderTargetView,
    *mut ID3D11DepthStencilView,
);

unsafe fn borrowed_list<T: Interface>(raws: *const *mut T, count: UINT) -> Vec<Option<Com<T>>> {
    if raws.is_null() {
        return vec![None; count as usize];
    }
    (0..count as usize)
        .map(|i| Com::from_borrowed(*raws.add(i)))
        .collect()
}

unsafe extern "system" fn ps_set_samplers_detour(
    context: *mut ID3D11DeviceContext,
    start_slot: UINT,
    count: UINT,
    samplers: *const *mut ID3D11SamplerState,
) {
    let guard = HookGuard::enter();
    if !guard.already_inside() {
        let injectors = injectors_for(context);
        if !injectors.is_empty() {
            let sampler_list = borrowed_list(samplers, count);
            if injectors
                .iter()
                .any(|injector| injector.pre_ps_set_samplers(start_slot, &sampler_list))
            {
                return;
            }
        }
    }

    if let Some(original) = HOOKS.call_original(ps_set_samplers_detour as PsSetSamplersFn) {
        original(context, start_slot, count, samplers);
    }
}

unsafe extern "system" fn om_set_render_targets_detour(
    context: *mut ID3D11DeviceContext,
    count: UINT,
    views: *const *mut ID3D11RenderTargetView,
    depth_stencil: *mut ID3D11DepthStencilView,
) {
    let guard = HookGuard::enter();

    if let Some(original) =
        HOOKS.call_original(om_set_render_targets_detour as OmSetRenderTargetsFn)
    {
        original(context, count, views, depth_stencil);
    }

    if !guard.already_inside() {
        let injectors = injectors_for(context);
        if !injectors.is_empty() {
            let view_list = borrowed_list(views, count);
            let depth_stencil = Com::from_borrowed(depth_stencil);
            for injector in injectors {
                injector.post_om_set_render_targets(&view_list, depth_stencil.as_ref());
            }
        }
    }
}

fn install_context_hooks(context: &Com<ID3D11DeviceContext>) -> StrResult {
    let instance = context.as_raw() as *mut c_void;
    let installed = unsafe {
        HOOKS.install_virtual(
            "ID3D11DeviceContext::PSSetSamplers",
            instance,
            PS_SET_SAMPLERS_SLOT,
            ps_set_samplers_detour as PsSetSamplersFn,
        ) && HOOKS.install_virtual(
            "ID3D11DeviceContext::OMSetRenderTargets",
            instance,
            OM_SET_RENDER_TARGETS_SLOT,
            om_set_render_targets_detour as OmSetRenderTargetsFn,
        )
    };

    if installed {
        Ok(())
    } else {
        trace_str!("Cannot redirect the device context methods")
    }
}

pub fn remove_context_hooks() {
    HOOKS.remove(ps_set_samplers_detour as PsSetSamplersFn);
    HOOKS.remove(om_set_render_targets_detour as OmSetRenderTargetsFn);
    CONTEXT_INJECTORS.lock().clear();
    debug!("Device context hooks removed");
}

#[cfg(all(test, windows))]
mod tests {
    use super::*;

    fn warp_device() -> Com<ID3D11Device> {
        let mut device = null_mut();
        unsafe {
            let hr = D3D11CreateDevice(
                null_mut(),
                D3D_DRIVER_TYPE_WARP,
                null_mut(),
                0,
                ptr::null(),
                0,
                D3D11_SDK_VERSION,
                &mut device,
                null_mut(),
                null_mut(),
            );
            created(hr, device, "D3D11CreateDevice").unwrap()
        }
    }

    fn read_buffer(device: &Com<ID3D11Device>, buffer: &Com<ID3D11Buffer>, size: u32) -> Vec<u8> {
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: size,
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ,
            MiscFlags: 0,
            StructureByteStride: 0,
        };
        let context = device.immediate_context().unwrap();

        unsafe {
            let mut raw = null_mut();
            let hr = device.CreateBuffer(&desc, ptr::null(), &mut raw);
            let staging = created(hr, raw, "CreateBuffer").unwrap();
            context.CopyResource(staging.as_raw() as _, buffer.as_raw() as _);

            let mut mapped: D3D11_MAPPED_SUBRESOURCE = mem::zeroed();
            check(
                context.Map(staging.as_raw() as _, 0, D3D11_MAP_READ, 0, &mut mapped),
                "Map",
            )
            .unwrap();
            let contents =
                std::slice::from_raw_parts(mapped.pData as *const u8, size as usize).to_vec();
            context.Unmap(staging.as_raw() as _, 0);
            contents
        }
    }

    #[test]
    fn constant_buffer_updates_are_zero_padded() {
        let device = warp_device();
        let context = device.immediate_context().unwrap();
        let buffer = device.create_constant_buffer(32).unwrap();

        context.update_buffer(&buffer, &[0xff; 32]);
        context.update_buffer(&buffer, &[1, 2, 3, 4]);

        let mut expected = vec![0; 32];
        expected[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(read_buffer(&device, &buffer, 32), expected);
    }

    #[test]
    fn texture_device_is_the_creating_device() {
        let device = warp_device();
        let texture = device
            .create_texture(&TextureDesc::storage(16, 16, Format::R8G8B8A8_UNORM), None)
            .unwrap();

        assert_eq!(D3D11::texture_device(&texture).unwrap(), device);
        assert!(device.immediate_context().is_ok());
    }
}
