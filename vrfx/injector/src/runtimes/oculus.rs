use super::*;
use std::{
    fmt::Debug,
    mem::{self, size_of},
    os::raw::c_void,
    ptr,
};

const TRACE_CONTEXT: &str = "Oculus";

pub const LAYER_TYPE_EYE_FOV: u32 = 1;
pub const LAYER_TYPE_EYE_FOV_DEPTH: u32 = 2;
pub const LAYER_FLAG_TEXTURE_ORIGIN_AT_BOTTOM_LEFT: u32 = 0x02;

// Runtimes requested with this minor version or later use the extended layer header.
pub const MODERN_HEADER_MINOR_VERSION: u32 = 25;

pub const FORMAT_R8G8B8A8_UNORM: i32 = 4;
pub const FORMAT_R8G8B8A8_UNORM_SRGB: i32 = 5;
pub const FORMAT_B8G8R8A8_UNORM: i32 = 6;
pub const FORMAT_B8G8R8A8_UNORM_SRGB: i32 = 7;
pub const FORMAT_B8G8R8X8_UNORM: i32 = 8;
pub const FORMAT_B8G8R8X8_UNORM_SRGB: i32 = 9;

pub const TEXTURE_MISC_DX_TYPELESS: u32 = 0x1;
pub const TEXTURE_MISC_AUTO_GENERATE_MIPS: u32 = 0x8;
pub const TEXTURE_BIND_DX_UNORDERED_ACCESS: u32 = 0x2;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct InitParams {
    pub flags: u32,
    pub requested_minor_version: u32,
    pub log_callback: usize,
    pub user_data: usize,
    pub connection_timeout_ms: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LayerAbi {
    Legacy,
    Modern,
}

pub fn layer_abi(params: Option<&InitParams>) -> LayerAbi {
    match params {
        Some(params) if params.requested_minor_version >= MODERN_HEADER_MINOR_VERSION => {
            LayerAbi::Modern
        }
        _ => LayerAbi::Legacy,
    }
}

pub trait LayerHeader: Copy + 'static {
    fn layer_type(&self) -> u32;
    fn flags(&self) -> u32;
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LegacyLayerHeader {
    pub layer_type: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ModernLayerHeader {
    pub layer_type: u32,
    pub flags: u32,
    pub reserved: [u8; 128],
}

impl LayerHeader for LegacyLayerHeader {
    fn layer_type(&self) -> u32 {
        self.layer_type
    }

    fn flags(&self) -> u32 {
        self.flags
    }
}

impl LayerHeader for ModernLayerHeader {
    fn layer_type(&self) -> u32 {
        self.layer_type
    }

    fn flags(&self) -> u32 {
        self.flags
    }
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Default, Debug)]
pub struct Sizei {
    pub w: i32,
    pub h: i32,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Default, Debug)]
pub struct Recti {
    pub x: i32,
    pub y: i32,
    pub size: Sizei,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Default, Debug)]
pub struct FovPort {
    pub up_tan: f32,
    pub down_tan: f32,
    pub left_tan: f32,
    pub right_tan: f32,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Default, Debug)]
pub struct Posef {
    pub orientation: [f32; 4],
    pub position: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct EyeFovData {
    pub color_texture: [*mut c_void; 2],
    pub viewport: [Recti; 2],
    pub fov: [FovPort; 2],
    pub render_pose: [Posef; 2],
    pub sensor_sample_time: f64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DepthData {
    pub depth_texture: [*mut c_void; 2],
    pub projection_desc: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct LayerEyeFov<H> {
    pub header: H,
    pub eye_fov: EyeFovData,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct LayerEyeFovDepth<H> {
    pub header: H,
    pub eye_fov: EyeFovData,
    pub depth: DepthData,
}

// Copy an eye layer into a zeroed depth layer, only as many bytes as its type defines.
unsafe fn copy_layer<H: LayerHeader>(layer: *const c_void) -> Box<LayerEyeFovDepth<H>> {
    let size = if (*(layer as *const H)).layer_type() == LAYER_TYPE_EYE_FOV_DEPTH {
        size_of::<LayerEyeFovDepth<H>>()
    } else {
        size_of::<LayerEyeFov<H>>()
    };

    let mut copy = Box::new(mem::zeroed::<LayerEyeFovDepth<H>>());
    ptr::copy_nonoverlapping(
        layer as *const u8,
        &mut *copy as *mut LayerEyeFovDepth<H> as *mut u8,
        size,
    );
    copy
}

/// Private copy of the first eye layer of a frame, substituted for the host's one on submission.
pub enum EyeFovLayerCopy {
    Legacy(Box<LayerEyeFovDepth<LegacyLayerHeader>>),
    Modern(Box<LayerEyeFovDepth<ModernLayerHeader>>),
}

impl EyeFovLayerCopy {
    /// Index and copy of the first eye layer in `layers`.
    ///
    /// # Safety
    /// Every non null pointer in `layers` must point to a live layer using the header of `abi`.
    pub unsafe fn find(abi: LayerAbi, layers: &[*const c_void]) -> Option<(usize, Self)> {
        let index = layers.iter().position(|&layer| {
            if layer.is_null() {
                return false;
            }
            // both header layouts start with the layer type
            let layer_type = *(layer as *const u32);
            layer_type == LAYER_TYPE_EYE_FOV || layer_type == LAYER_TYPE_EYE_FOV_DEPTH
        })?;

        let copy = match abi {
            LayerAbi::Legacy => Self::Legacy(copy_layer(layers[index])),
            LayerAbi::Modern => Self::Modern(copy_layer(layers[index])),
        };
        Some((index, copy))
    }

    fn parts(&self) -> (u32, &EyeFovData) {
        match self {
            Self::Legacy(layer) => (layer.header.flags(), &layer.eye_fov),
            Self::Modern(layer) => (layer.header.flags(), &layer.eye_fov),
        }
    }

    fn eye_fov_mut(&mut self) -> &mut EyeFovData {
        match self {
            Self::Legacy(layer) => &mut layer.eye_fov,
            Self::Modern(layer) => &mut layer.eye_fov,
        }
    }

    pub fn eye_layer(&self) -> EyeLayer<*mut c_void> {
        let (flags, data) = self.parts();
        let texture = |eye: usize| Some(data.color_texture[eye]).filter(|t| !t.is_null());
        let viewport = |eye: usize| {
            let rect = &data.viewport[eye];
            Viewport::new(
                rect.x.max(0) as u32,
                rect.y.max(0) as u32,
                rect.size.w.max(0) as u32,
                rect.size.h.max(0) as u32,
            )
        };
        let fov = |eye: usize| {
            let fov = &data.fov[eye];
            FovTangents {
                up: fov.up_tan,
                down: fov.down_tan,
                left: fov.left_tan,
                right: fov.right_tan,
            }
        };

        EyeLayer {
            color_textures: [texture(0), texture(1)],
            viewports: [viewport(0), viewport(1)],
            fov: [fov(0), fov(1)],
            origin_bottom_left: flags & LAYER_FLAG_TEXTURE_ORIGIN_AT_BOTTOM_LEFT != 0,
        }
    }

    /// Store the textures and viewports of `layer` into the copy.
    pub fn write_back(&mut self, layer: &EyeLayer<*mut c_void>) {
        let data = self.eye_fov_mut();
        for eye in 0..2 {
            data.color_texture[eye] = layer.color_textures[eye].unwrap_or(ptr::null_mut());
            let viewport = &layer.viewports[eye];
            data.viewport[eye] = Recti {
                x: viewport.x as i32,
                y: viewport.y as i32,
                size: Sizei {
                    w: viewport.width as i32,
                    h: viewport.height as i32,
                },
            };
        }
    }

    pub fn header_ptr(&self) -> *const c_void {
        match self {
            Self::Legacy(layer) => &**layer as *const _ as *const c_void,
            Self::Modern(layer) => &**layer as *const _ as *const c_void,
        }
    }
}

/// Render target size reported to the host, reduced by the configured render scale.
pub fn adjust_fov_texture_size(upscaling: &UpscalingDesc, size: Sizei) -> Sizei {
    if size.w <= 0 || size.h <= 0 {
        return size;
    }
    let (w, h) = resolution::adjust_render_resolution(upscaling, size.w as u32, size.h as u32);
    Sizei {
        w: w as i32,
        h: h as i32,
    }
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Default, Debug)]
pub struct SwapChainDesc {
    pub texture_type: i32,
    pub format: i32,
    pub array_size: i32,
    pub width: i32,
    pub height: i32,
    pub mip_levels: i32,
    pub sample_count: i32,
    pub static_image: u8,
    pub misc_flags: u32,
    pub bind_flags: u32,
}

// The upscaler reads sRGB input as linear values, so the output of a typed sRGB chain is linear.
fn output_format(desc: &SwapChainDesc) -> i32 {
    if desc.misc_flags & TEXTURE_MISC_DX_TYPELESS != 0 {
        return desc.format;
    }
    match desc.format {
        FORMAT_B8G8R8A8_UNORM_SRGB => FORMAT_B8G8R8A8_UNORM,
        FORMAT_B8G8R8X8_UNORM_SRGB => FORMAT_B8G8R8X8_UNORM,
        FORMAT_R8G8B8A8_UNORM_SRGB => FORMAT_R8G8B8A8_UNORM,
        format => format,
    }
}

fn should_create_typeless(format: i32) -> bool {
    match format {
        FORMAT_R8G8B8A8_UNORM
        | FORMAT_R8G8B8A8_UNORM_SRGB
        | FORMAT_B8G8R8A8_UNORM
        | FORMAT_B8G8R8A8_UNORM_SRGB
        | FORMAT_B8G8R8X8_UNORM
        | FORMAT_B8G8R8X8_UNORM_SRGB => true,
        _ => false,
    }
}

/// Swap chain services of the Oculus runtime.
pub trait OculusRuntime<B: Backend> {
    type Session: Copy + Eq + Debug;
    type SwapChain: Copy + Eq + Debug;

    fn chain_length(&self, session: Self::Session, chain: Self::SwapChain) -> StrResult<usize>;

    fn chain_texture(
        &self,
        session: Self::Session,
        chain: Self::SwapChain,
        index: usize,
    ) -> StrResult<B::Texture>;

    fn chain_desc(&self, session: Self::Session, chain: Self::SwapChain)
        -> StrResult<SwapChainDesc>;

    fn current_index(&self, session: Self::Session, chain: Self::SwapChain) -> StrResult<usize>;

    fn create_chain(
        &self,
        session: Self::Session,
        device: &B::Device,
        desc: &SwapChainDesc,
    ) -> StrResult<Self::SwapChain>;

    fn commit_chain(&self, session: Self::Session, chain: Self::SwapChain) -> StrResult;

    fn destroy_chain(&self, session: Self::Session, chain: Self::SwapChain);
}

struct EyeResources<B: Backend> {
    input_textures: Vec<B::Texture>,
    input_views: Vec<B::ShaderResourceView>,
    resolve_texture: Option<B::Texture>,
    needs_resolve: bool,
    output_textures: Vec<B::Texture>,
    output_uavs: Vec<B::UnorderedAccessView>,
}

impl<B: Backend> Clone for EyeResources<B> {
    fn clone(&self) -> Self {
        Self {
            input_textures: self.input_textures.clone(),
            input_views: self.input_views.clone(),
            resolve_texture: self.resolve_texture.clone(),
            needs_resolve: self.needs_resolve,
            output_textures: self.output_textures.clone(),
            output_uavs: self.output_uavs.clone(),
        }
    }
}

fn single_slice(array_size: u32) -> Option<u32> {
    if array_size > 1 {
        Some(0)
    } else {
        None
    }
}

struct OculusState<B: Backend, E: ShadingRateExtension<B> + 'static, R: OculusRuntime<B>> {
    session: R::Session,
    submitted: [Option<R::SwapChain>; 2],
    // the right eye shares the left chain when the host submits one texture for both eyes
    output_chains: [R::SwapChain; 2],
    eyes: [EyeResources<B>; 2],
    using_array: bool,
    context: B::Context,
    frame: FrameProcessor<B, E>,
}

/// Post-processes the eye layer submitted to the Oculus runtime into swap chains of its own.
pub struct OculusManager<B: Backend, E: ShadingRateExtension<B> + 'static, R: OculusRuntime<B>> {
    settings: Arc<SettingsStore>,
    kernels: Arc<dyn KernelSource>,
    load_extension: ExtensionLoader<B, E>,
    runtime: R,
    state: Option<OculusState<B, E, R>>,
    failed: bool,
}

impl<B: Backend, E: ShadingRateExtension<B> + 'static, R: OculusRuntime<B>> OculusManager<B, E, R> {
    pub fn new(
        settings: Arc<SettingsStore>,
        kernels: Arc<dyn KernelSource>,
        load_extension: ExtensionLoader<B, E>,
        runtime: R,
    ) -> Self {
        Self {
            settings,
            kernels,
            load_extension,
            runtime,
            state: None,
            failed: false,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn shutdown(&mut self) {
        if let Some(state) = self.state.take() {
            let [left, right] = state.output_chains;
            self.runtime.destroy_chain(state.session, left);
            if right != left {
                self.runtime.destroy_chain(state.session, right);
            }
            info!("Oculus resources released");
        }
        self.failed = false;
    }

    /// Process the eye layer of a frame. On success `layer` references the output swap chains.
    pub fn on_frame_submission(
        &mut self,
        session: R::Session,
        layer: &mut EyeLayer<R::SwapChain>,
    ) {
        if self.failed || layer.color_textures[0].is_none() {
            return;
        }

        if let Err(e) = self.ensure_init(session, layer.color_textures) {
            error!("Failed to create graphics resources: {}", e);
            self.shutdown();
            self.failed = true;
            return;
        }

        let mut processed = layer.clone();
        match self.process(&mut processed) {
            Ok(()) => *layer = processed,
            Err(e) => {
                error!("Failed during post processing: {}", e);
                self.shutdown();
                self.failed = true;
            }
        }
    }

    fn ensure_init(
        &mut self,
        session: R::Session,
        submitted: [Option<R::SwapChain>; 2],
    ) -> StrResult {
        if let Some(state) = &self.state {
            if state.session == session && state.submitted == submitted {
                return Ok(());
            }
        }

        self.shutdown();
        info!("Initializing Oculus frame submission...");

        let mut created = vec![];
        match self.create_state(session, submitted, &mut created) {
            Ok(state) => {
                info!("D3D11 resource creation complete");
                self.state = Some(state);
                Ok(())
            }
            Err(e) => {
                for chain in created {
                    self.runtime.destroy_chain(session, chain);
                }
                Err(e)
            }
        }
    }

    fn create_eye(
        &self,
        session: R::Session,
        chain: R::SwapChain,
        eye: Eye,
        created: &mut Vec<R::SwapChain>,
    ) -> StrResult<(EyeResources<B>, R::SwapChain, B::Device)> {
        let runtime = &self.runtime;

        let length = runtime.chain_length(session, chain)?;
        let input_textures = (0..length)
            .map(|index| runtime.chain_texture(session, chain, index))
            .collect::<StrResult<Vec<_>>>()?;
        let first_texture = trace_none!(input_textures.first(), "Empty swap chain")?;
        let device = B::texture_device(first_texture)?;
        let texture_desc = B::texture_desc(first_texture);

        let mut chain_desc = runtime.chain_desc(session, chain)?;
        info!(
            "Swap chain has format {}, bind flags {} and misc flags {}",
            chain_desc.format, chain_desc.bind_flags, chain_desc.misc_flags
        );

        let resolve_texture = if chain_desc.sample_count > 1 {
            info!("Submitted textures are multi-sampled, creating resolve texture");
            let resolve_desc = TextureDesc {
                mip_levels: 1,
                sample_count: 1,
                bind_flags: BindFlags::SHADER_RESOURCE,
                ..texture_desc
            };
            Some(device.create_texture(&resolve_desc, None)?)
        } else {
            None
        };

        let view_format = texture_desc.format.typeless_to_typed();
        let input_views = input_textures
            .iter()
            .map(|texture| {
                let source = resolve_texture.as_ref().unwrap_or(texture);
                device.create_shader_resource_view(
                    source,
                    view_format,
                    single_slice(texture_desc.array_size),
                )
            })
            .collect::<StrResult<Vec<_>>>()?;

        let output_format = output_format(&chain_desc);
        chain_desc.sample_count = 1;
        chain_desc.mip_levels = 1;
        chain_desc.bind_flags = TEXTURE_BIND_DX_UNORDERED_ACCESS;
        chain_desc.misc_flags = TEXTURE_MISC_AUTO_GENERATE_MIPS;
        if should_create_typeless(output_format) {
            chain_desc.misc_flags |= TEXTURE_MISC_DX_TYPELESS;
        }
        chain_desc.format = output_format;
        chain_desc.static_image = 0;

        info!(
            "Eye {:?}: submitted textures have resolution {}x{}",
            eye, chain_desc.width, chain_desc.height
        );
        let settings = self.settings.snapshot();
        let (width, height) = resolution::adjust_output_resolution(
            &settings.upscaling,
            chain_desc.width.max(0) as u32,
            chain_desc.height.max(0) as u32,
        );
        chain_desc.width = width as i32;
        chain_desc.height = height as i32;
        info!("Eye {:?}: output resolution is {}x{}", eye, width, height);

        info!("Creating output swapchain in format {}", chain_desc.format);
        let output_chain = runtime.create_chain(session, &device, &chain_desc)?;
        created.push(output_chain);

        let output_length = runtime.chain_length(session, output_chain)?;
        let output_textures = (0..output_length)
            .map(|index| runtime.chain_texture(session, output_chain, index))
            .collect::<StrResult<Vec<_>>>()?;
        let output_uavs = output_textures
            .iter()
            .map(|texture| {
                let desc = B::texture_desc(texture);
                device.create_unordered_access_view(
                    texture,
                    desc.format.typeless_to_typed(),
                    single_slice(desc.array_size),
                )
            })
            .collect::<StrResult<Vec<_>>>()?;

        let resources = EyeResources {
            input_textures,
            input_views,
            needs_resolve: resolve_texture.is_some(),
            resolve_texture,
            output_textures,
            output_uavs,
        };
        Ok((resources, output_chain, device))
    }

    // Views of the second slice for hosts rendering both eyes into one array texture.
    fn second_slice(&self, left: &EyeResources<B>, device: &B::Device) -> StrResult<EyeResources<B>> {
        let mut right = left.clone();

        right.input_views = left
            .input_textures
            .iter()
            .map(|texture| {
                let source = left.resolve_texture.as_ref().unwrap_or(texture);
                let format = B::texture_desc(source).format.typeless_to_typed();
                device.create_shader_resource_view(source, format, Some(1))
            })
            .collect::<StrResult<Vec<_>>>()?;
        right.output_uavs = left
            .output_textures
            .iter()
            .map(|texture| {
                let format = B::texture_desc(texture).format.typeless_to_typed();
                device.create_unordered_access_view(texture, format, Some(1))
            })
            .collect::<StrResult<Vec<_>>>()?;

        Ok(right)
    }

    fn create_state(
        &self,
        session: R::Session,
        submitted: [Option<R::SwapChain>; 2],
        created: &mut Vec<R::SwapChain>,
    ) -> StrResult<OculusState<B, E, R>> {
        let left_chain = trace_none!(submitted[0])?;
        let (left, left_output, device) = self.create_eye(session, left_chain, Eye::Left, created)?;

        let mut using_array = false;
        let (right, right_output) = match submitted[1] {
            Some(chain) if chain != left_chain => {
                let (right, right_output, _) = self.create_eye(session, chain, Eye::Right, created)?;
                (right, right_output)
            }
            _ => {
                info!("Game is using a single texture for both eyes");
                let desc = self.runtime.chain_desc(session, left_chain)?;
                let right = if desc.array_size > 1 {
                    info!("Game is using an array texture");
                    using_array = true;
                    self.second_slice(&left, &device)?
                } else {
                    // both halves come out of the left eye resolve
                    EyeResources {
                        needs_resolve: false,
                        ..left.clone()
                    }
                };
                (right, left_output)
            }
        };

        let extension = (self.load_extension)(&device);
        let context = device.immediate_context()?;
        let frame = FrameProcessor::new(
            self.settings.clone(),
            device,
            self.kernels.clone(),
            extension,
        )?;

        Ok(OculusState {
            session,
            submitted,
            output_chains: [left_output, right_output],
            eyes: [left, right],
            using_array,
            context,
            frame,
        })
    }

    fn process(&mut self, layer: &mut EyeLayer<R::SwapChain>) -> StrResult {
        let runtime = &self.runtime;
        let state = trace_none!(self.state.as_mut())?;

        let centers = fov_projection_centers(&layer.fov);
        let flip_y = layer.origin_bottom_left;
        let centers = [
            flip_center(centers[0], false, flip_y),
            flip_center(centers[1], false, flip_y),
        ];

        let shared_chain = state.submitted[1].is_none() || state.submitted[1] == state.submitted[0];
        let mode = match (shared_chain, state.using_array) {
            (true, true) => TextureMode::Array,
            (true, false) => TextureMode::Combined,
            (false, _) => TextureMode::Single,
        };

        let mut processed = false;
        for &eye in Eye::BOTH.iter() {
            let resources = &state.eyes[eye.index()];
            let chain = trace_none!(state.submitted[eye.index()].or(state.submitted[0]))?;

            // the submitted texture was already committed, the current index is one past it
            let length = resources.input_textures.len();
            let index = (runtime.current_index(state.session, chain)? + length - 1) % length;
            let input_texture = &resources.input_textures[index];

            if let (Some(resolve_texture), true) =
                (&resources.resolve_texture, resources.needs_resolve)
            {
                let desc = B::texture_desc(input_texture);
                let slice = if state.using_array {
                    eye.index() as u32
                } else {
                    0
                };
                state.context.resolve_subresource(
                    resolve_texture,
                    slice,
                    input_texture,
                    slice * desc.mip_levels,
                    desc.format.typeless_to_typed(),
                );
            }

            let output_chain = state.output_chains[eye.index()];
            let output_index = runtime
                .current_index(state.session, output_chain)
                .unwrap_or(0);
            let input = PostProcessInput {
                input_texture: input_texture.clone(),
                input_view: resources.input_views[index].clone(),
                output_texture: trace_none!(resources.output_textures.get(output_index))?.clone(),
                output_uav: trace_none!(resources.output_uavs.get(output_index))?.clone(),
                input_viewport: layer.viewports[eye.index()],
                eye,
                mode,
                projection_center: centers[eye.index()],
            };

            if let Some(viewport) = state.frame.apply(&input) {
                layer.color_textures[eye.index()] = Some(output_chain);
                layer.viewports[eye.index()] = viewport;
                processed = true;
            }

            let input_desc = B::texture_desc(input_texture);
            state
                .frame
                .update_foveation_target(input_desc.width, input_desc.height, mode, centers);
        }

        state.frame.end_frame();

        if processed {
            let [left, right] = state.output_chains;
            runtime.commit_chain(state.session, left)?;
            if right != left {
                runtime.commit_chain(state.session, right)?;
            }
        }

        Ok(())
    }
}

impl<B: Backend, E: ShadingRateExtension<B> + 'static, R: OculusRuntime<B>> Drop
    for OculusManager<B, E, R>
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
