use super::*;
use std::{collections::HashMap, os::raw::c_void, ptr};

const TRACE_CONTEXT: &str = "OpenVR";

pub const TEXTURE_TYPE_DIRECTX: i32 = 0;

pub const COLOR_SPACE_AUTO: i32 = 0;
pub const COLOR_SPACE_GAMMA: i32 = 1;
pub const COLOR_SPACE_LINEAR: i32 = 2;

pub const SUBMIT_TEXTURE_WITH_POSE: u32 = 0x08;
pub const SUBMIT_TEXTURE_WITH_DEPTH: u32 = 0x10;

// Resources survive texture size changes of up to this many pixels (dynamic resolution).
const SIZE_SLACK: u32 = 10;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Texture {
    pub handle: *mut c_void,
    pub texture_type: i32,
    pub color_space: i32,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct TextureBounds {
    pub u_min: f32,
    pub v_min: f32,
    pub u_max: f32,
    pub v_max: f32,
}

impl Default for TextureBounds {
    fn default() -> Self {
        Self {
            u_min: 0.,
            v_min: 0.,
            u_max: 1.,
            v_max: 1.,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HmdMatrix34 {
    pub m: [[f32; 4]; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HmdMatrix44 {
    pub m: [[f32; 4]; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TextureDepthInfo {
    pub handle: *mut c_void,
    pub projection: HmdMatrix44,
    pub range: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TextureWithPose {
    pub texture: Texture,
    pub device_to_absolute_tracking: HmdMatrix34,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TextureWithDepth {
    pub texture: Texture,
    pub depth: TextureDepthInfo,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TextureWithPoseAndDepth {
    pub with_pose: TextureWithPose,
    pub depth: TextureDepthInfo,
}

/// Private copy of a submitted texture description, in the layout announced by the submit flags.
#[derive(Clone, Copy, Debug)]
pub enum SubmittedTexture {
    Plain(Texture),
    WithPose(TextureWithPose),
    WithDepth(TextureWithDepth),
    WithPoseAndDepth(TextureWithPoseAndDepth),
}

impl SubmittedTexture {
    /// # Safety
    /// `texture` must point to a live texture structure of the variant selected by `submit_flags`.
    pub unsafe fn copy_from(texture: *const Texture, submit_flags: u32) -> Self {
        let with_pose = submit_flags & SUBMIT_TEXTURE_WITH_POSE != 0;
        let with_depth = submit_flags & SUBMIT_TEXTURE_WITH_DEPTH != 0;
        match (with_pose, with_depth) {
            (true, true) => {
                Self::WithPoseAndDepth(ptr::read(texture as *const TextureWithPoseAndDepth))
            }
            (false, true) => Self::WithDepth(ptr::read(texture as *const TextureWithDepth)),
            (true, false) => Self::WithPose(ptr::read(texture as *const TextureWithPose)),
            (false, false) => Self::Plain(ptr::read(texture)),
        }
    }

    pub fn texture(&self) -> &Texture {
        match self {
            Self::Plain(texture) => texture,
            Self::WithPose(texture) => &texture.texture,
            Self::WithDepth(texture) => &texture.texture,
            Self::WithPoseAndDepth(texture) => &texture.with_pose.texture,
        }
    }

    pub fn texture_mut(&mut self) -> &mut Texture {
        match self {
            Self::Plain(texture) => texture,
            Self::WithPose(texture) => &mut texture.texture,
            Self::WithDepth(texture) => &mut texture.texture,
            Self::WithPoseAndDepth(texture) => &mut texture.with_pose.texture,
        }
    }

    // Every variant starts with the plain texture description.
    pub fn as_ptr(&self) -> *const Texture {
        self.texture()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenVrInterface {
    ClientCore(u32),
    Compositor(u32),
    System(u32),
    Other,
}

fn interface_version(name: &str, prefix: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?;
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| digits.len());
    digits[..end].parse().ok()
}

pub fn parse_interface_name(name: &str) -> OpenVrInterface {
    if let Some(version) = interface_version(name, "IVRClientCore_") {
        OpenVrInterface::ClientCore(version)
    } else if let Some(version) = interface_version(name, "IVRCompositor_") {
        OpenVrInterface::Compositor(version)
    } else if let Some(version) = interface_version(name, "IVRSystem_") {
        OpenVrInterface::System(version)
    } else {
        OpenVrInterface::Other
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenVrMethod {
    GetGenericInterface,
    Cleanup,
    Submit,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VirtualHook {
    pub name: &'static str,
    pub slot: usize,
    pub method: OpenVrMethod,
}

/// Virtual methods to redirect on a freshly handed out interface instance.
pub fn hook_plan(interface: OpenVrInterface) -> Vec<VirtualHook> {
    match interface {
        OpenVrInterface::ClientCore(version) if version <= 3 => vec![
            VirtualHook {
                name: "IVRClientCore::GetGenericInterface",
                slot: 3,
                method: OpenVrMethod::GetGenericInterface,
            },
            VirtualHook {
                name: "IVRClientCore::Cleanup",
                slot: 1,
                method: OpenVrMethod::Cleanup,
            },
        ],
        OpenVrInterface::Compositor(version) if version >= 12 => vec![VirtualHook {
            name: "IVRCompositor::Submit",
            slot: 6,
            method: OpenVrMethod::Submit,
        }],
        OpenVrInterface::ClientCore(version) => {
            error!("Don't know how to inject into version {} of IVRClientCore", version);
            vec![]
        }
        OpenVrInterface::Compositor(version) => {
            error!("Don't know how to inject into version {} of IVRCompositor", version);
            vec![]
        }
        OpenVrInterface::System(_) | OpenVrInterface::Other => vec![],
    }
}

/// Queries on the runtime's system interface.
pub trait VrSystem {
    fn projection_raw(&self, eye: Eye) -> RawProjection;

    fn eye_to_head_transform(&self, eye: Eye) -> HmdMatrix34;

    fn recommended_render_target_size(&self) -> (u32, u32);
}

fn projection_centers(system: Option<&dyn VrSystem>) -> ProjectionCenters {
    let system = match system {
        Some(system) => system,
        None => {
            error!("Failed to acquire VRSystem interface, can't calculate projection centers");
            return [ProjectionCenter::default(); 2];
        }
    };

    let forward = |eye| {
        let m = system.eye_to_head_transform(eye).m;
        [m[2][0], m[2][1], m[2][2]]
    };
    let (left_forward, right_forward) = (forward(Eye::Left), forward(Eye::Right));

    let mut centers = [ProjectionCenter::default(); 2];
    for &eye in Eye::BOTH.iter() {
        let projection = system.projection_raw(eye);
        info!("Raw projection for eye {:?}: {:?}", eye, projection);

        let angle = canted_angle(left_forward, right_forward, eye);
        info!("Display is canted by {} RAD", angle);

        centers[eye.index()] = raw_projection_center(&projection, angle);
        info!("Projection center for eye {:?}: {:?}", eye, centers[eye.index()]);
    }
    centers
}

// SteamVR applies a different color conversion to 10 bit textures, the output has to match.
fn output_format(input_format: Format) -> Format {
    if input_format.is_10_bit() {
        Format::R10G10B10A2_UNORM
    } else {
        Format::R8G8B8A8_UNORM
    }
}

// Typeless textures are treated as sRGB by the compositor.
fn is_considered_srgb(format: Format) -> bool {
    format.is_srgb()
        || format == Format::B8G8R8A8_TYPELESS
        || format == Format::R8G8B8A8_TYPELESS
        || format == Format::B8G8R8X8_TYPELESS
        || format == Format::R10G10B10A2_TYPELESS
}

pub struct SubmitRequest<B: Backend> {
    pub eye: Eye,
    pub texture: B::Texture,
    pub bounds: TextureBounds,
    pub color_space: i32,
}

/// Replacement for the texture part of a submission.
#[derive(Debug)]
pub struct SubmitOverride<B: Backend> {
    pub texture: B::Texture,
    pub bounds: TextureBounds,
    pub color_space: i32,
}

struct OpenVrResources<B: Backend, E: ShadingRateExtension<B> + 'static> {
    frame: FrameProcessor<B, E>,
    context: B::Context,
    texture_width: u32,
    texture_height: u32,
    using_array: bool,
    resolve: Option<(B::Texture, B::ShaderResourceView)>,
    input_views: HashMap<B::Texture, [B::ShaderResourceView; 2]>,
    output_texture: B::Texture,
    output_uav: B::UnorderedAccessView,
    projection_centers: ProjectionCenters,
    aspect_ratio: f32,
}

impl<B: Backend, E: ShadingRateExtension<B> + 'static> OpenVrResources<B, E> {
    fn input_view(&mut self, texture: &B::Texture, eye: Eye) -> StrResult<B::ShaderResourceView> {
        let desc = B::texture_desc(texture);

        if let Some((resolve_texture, resolve_view)) = &self.resolve {
            let source_subresource = if self.using_array {
                eye.index() as u32 * desc.mip_levels
            } else {
                0
            };
            if desc.sample_count > 1 {
                self.context.resolve_subresource(
                    resolve_texture,
                    0,
                    texture,
                    source_subresource,
                    desc.format,
                );
            } else {
                self.context.copy_subresource_region(
                    resolve_texture,
                    0,
                    texture,
                    source_subresource,
                    desc.width,
                    desc.height,
                );
            }
            return Ok(resolve_view.clone());
        }

        if let Some(views) = self.input_views.get(texture) {
            return Ok(views[eye.index()].clone());
        }

        info!("Creating shader resource view for input texture {:?}", texture);
        let device = self.frame.device();
        let format = desc.format.typeless_to_typed();
        let views = if desc.array_size > 1 {
            [
                device.create_shader_resource_view(texture, format, Some(0))?,
                device.create_shader_resource_view(texture, format, Some(1))?,
            ]
        } else {
            let view = device.create_shader_resource_view(texture, format, None)?;
            [view.clone(), view]
        };
        let view = views[eye.index()].clone();
        self.input_views.insert(texture.clone(), views);

        Ok(view)
    }
}

/// Post-processes the eye textures handed to the OpenVR compositor.
pub struct OpenVrManager<B: Backend, E: ShadingRateExtension<B> + 'static> {
    settings: Arc<SettingsStore>,
    kernels: Arc<dyn KernelSource>,
    load_extension: ExtensionLoader<B, E>,
    resources: Option<OpenVrResources<B, E>>,
    failed: bool,
}

impl<B: Backend, E: ShadingRateExtension<B> + 'static> OpenVrManager<B, E> {
    pub fn new(
        settings: Arc<SettingsStore>,
        kernels: Arc<dyn KernelSource>,
        load_extension: ExtensionLoader<B, E>,
    ) -> Self {
        Self {
            settings,
            kernels,
            load_extension,
            resources: None,
            failed: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.resources.is_some()
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn shutdown(&mut self) {
        if self.resources.take().is_some() {
            info!("OpenVR resources released");
        }
        self.failed = false;
    }

    /// Process one eye submission. Returns the texture to submit instead, if any.
    pub fn on_submit(
        &mut self,
        request: &SubmitRequest<B>,
        system: Option<&dyn VrSystem>,
    ) -> Option<SubmitOverride<B>> {
        if self.failed {
            return None;
        }

        match self.process(request, system) {
            Ok(submission) => submission,
            Err(e) => {
                error!("Error during OpenVR submit: {}", e);
                self.shutdown();
                self.failed = true;
                None
            }
        }
    }

    fn process(
        &mut self,
        request: &SubmitRequest<B>,
        system: Option<&dyn VrSystem>,
    ) -> StrResult<Option<SubmitOverride<B>>> {
        self.ensure_init(&request.texture, system)?;
        let resources = trace_none!(self.resources.as_mut())?;

        let input_desc = B::texture_desc(&request.texture);
        let output_desc = B::texture_desc(&resources.output_texture);
        let bounds = &request.bounds;
        let flip_x = bounds.u_min > bounds.u_max;
        let flip_y = bounds.v_min > bounds.v_max;

        let input_is_srgb = request.color_space == COLOR_SPACE_GAMMA
            || (request.color_space == COLOR_SPACE_AUTO && is_considered_srgb(input_desc.format));
        let is_combined = input_desc.width as f32 / input_desc.height as f32
            >= 1.5 * resources.aspect_ratio
            && (bounds.u_max - bounds.u_min).abs() <= 0.5;
        let mode = if resources.using_array {
            TextureMode::Array
        } else if is_combined {
            TextureMode::Combined
        } else {
            TextureMode::Single
        };

        let scale = |size: u32, a: f32, b: f32| (size as f32 * a.min(b)).round() as u32;
        let extent = |size: u32, a: f32, b: f32| (size as f32 * (b - a).abs()).round() as u32;
        let input = PostProcessInput {
            input_view: resources.input_view(&request.texture, request.eye)?,
            input_texture: request.texture.clone(),
            output_texture: resources.output_texture.clone(),
            output_uav: resources.output_uav.clone(),
            input_viewport: Viewport::new(
                scale(input_desc.width, bounds.u_min, bounds.u_max),
                scale(input_desc.height, bounds.v_min, bounds.v_max),
                extent(input_desc.width, bounds.u_min, bounds.u_max),
                extent(input_desc.height, bounds.v_min, bounds.v_max),
            ),
            eye: request.eye,
            mode,
            projection_center: flip_center(
                resources.projection_centers[request.eye.index()],
                flip_x,
                flip_y,
            ),
        };

        let submission = resources.frame.apply(&input).map(|viewport| {
            let width = output_desc.width as f32;
            let height = output_desc.height as f32;
            let mut output_bounds = TextureBounds {
                u_min: viewport.x as f32 / width,
                v_min: viewport.y as f32 / height,
                u_max: (viewport.x + viewport.width) as f32 / width,
                v_max: (viewport.y + viewport.height) as f32 / height,
            };
            if flip_x {
                std::mem::swap(&mut output_bounds.u_min, &mut output_bounds.u_max);
            }
            if flip_y {
                std::mem::swap(&mut output_bounds.v_min, &mut output_bounds.v_max);
            }

            SubmitOverride {
                texture: resources.output_texture.clone(),
                bounds: output_bounds,
                color_space: if input_is_srgb {
                    COLOR_SPACE_GAMMA
                } else {
                    COLOR_SPACE_AUTO
                },
            }
        });

        let centers = resources.projection_centers;
        resources.frame.update_foveation_target(
            input_desc.width,
            input_desc.height,
            mode,
            [
                flip_center(centers[0], flip_x, flip_y),
                flip_center(centers[1], flip_x, flip_y),
            ],
        );
        resources.frame.end_frame();

        Ok(submission)
    }

    fn ensure_init(&mut self, texture: &B::Texture, system: Option<&dyn VrSystem>) -> StrResult {
        let desc = B::texture_desc(texture);
        if let Some(resources) = &self.resources {
            let fits = |size: u32, previous: u32| {
                size <= previous && size >= previous.saturating_sub(SIZE_SLACK)
            };
            if fits(desc.width, resources.texture_width)
                && fits(desc.height, resources.texture_height)
                && resources.using_array == (desc.array_size > 1)
            {
                return Ok(());
            }
        }

        self.shutdown();
        self.resources = Some(self.create_resources(texture, &desc, system)?);
        Ok(())
    }

    fn create_resources(
        &self,
        texture: &B::Texture,
        desc: &TextureDesc,
        system: Option<&dyn VrSystem>,
    ) -> StrResult<OpenVrResources<B, E>> {
        info!("Game is submitting D3D11 textures, creating necessary output resources...");

        let device = B::texture_device(texture)?;
        let context = device.immediate_context()?;

        let requires_resolve = desc.sample_count > 1
            || !desc.bind_flags.contains(BindFlags::SHADER_RESOURCE)
            || desc.format.is_srgb();
        let resolve = if requires_resolve {
            info!("Input texture can't be bound directly, need to resolve");
            let resolve_desc = TextureDesc {
                mip_levels: 1,
                array_size: 1,
                format: desc.format.srgb_to_typeless(),
                sample_count: 1,
                bind_flags: BindFlags::SHADER_RESOURCE,
                ..*desc
            };
            let resolve_texture = device.create_texture(&resolve_desc, None)?;
            let resolve_view = device.create_shader_resource_view(
                &resolve_texture,
                desc.format.srgb_to_linear().typeless_to_typed(),
                None,
            )?;
            Some((resolve_texture, resolve_view))
        } else {
            None
        };

        let settings = self.settings.snapshot();
        let (output_width, output_height) =
            resolution::adjust_output_resolution(&settings.upscaling, desc.width, desc.height);
        let output_format = output_format(desc.format);
        let output_texture = device.create_texture(
            &TextureDesc::storage(output_width, output_height, output_format),
            None,
        )?;
        let output_uav = device.create_unordered_access_view(&output_texture, output_format, None)?;

        let aspect_ratio = match system {
            Some(system) => {
                let (width, height) = system.recommended_render_target_size();
                width as f32 / height as f32
            }
            None => {
                error!("Failed to acquire VRSystem interface, can't calculate aspect ratio");
                0.
            }
        };

        let extension = (self.load_extension)(&device);
        let frame = FrameProcessor::new(
            self.settings.clone(),
            device,
            self.kernels.clone(),
            extension,
        )?;

        Ok(OpenVrResources {
            frame,
            context,
            texture_width: desc.width,
            texture_height: desc.height,
            using_array: desc.array_size > 1,
            resolve,
            input_views: HashMap::new(),
            output_texture,
            output_uav,
            projection_centers: projection_centers(system),
            aspect_ratio,
        })
    }
}
