mod cas;
mod fsr;
pub mod kernels;
mod nis;
mod nis_coefficients;
mod packing;
mod profiler;
mod samplers;

pub use cas::*;
pub use fsr::*;
pub use nis::*;
pub use profiler::*;
pub use samplers::*;

use crate::{graphics::*, injector::RenderListener};
use kernels::KernelSource;
use log::*;
use std::sync::Arc;
use vrfx_common::{data::*, *};

const TRACE_CONTEXT: &str = "Post-processing";

/// One eye worth of post-processing work.
pub struct PostProcessInput<B: Backend> {
    pub input_texture: B::Texture,
    pub output_texture: B::Texture,
    pub input_view: B::ShaderResourceView,
    pub output_uav: B::UnorderedAccessView,
    pub input_viewport: Viewport,
    pub eye: Eye,
    pub mode: TextureMode,
    pub projection_center: ProjectionCenter,
}

pub trait Upscaler<B: Backend> {
    fn upscale(
        &mut self,
        context: &B::Context,
        input: &PostProcessInput<B>,
        output_viewport: &Viewport,
        settings: &Settings,
    ) -> StrResult;
}

/// Area around the projection center that receives the full quality filter, in output pixels.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FocusArea {
    pub projection_center: [u32; 2],
    pub squared_radius: u32,
}

impl FocusArea {
    pub fn new(output_viewport: &Viewport, center: ProjectionCenter, radius: f32) -> Self {
        let radius = 0.5 * radius * output_viewport.height as f32;
        Self {
            projection_center: [
                packing::truncate(output_viewport.width as f32 * center.x),
                packing::truncate(output_viewport.height as f32 * center.y),
            ],
            squared_radius: packing::truncate(radius * radius),
        }
    }
}

pub fn dispatch_groups_16(viewport: &Viewport) -> [u32; 3] {
    [(viewport.width + 15) >> 4, (viewport.height + 15) >> 4, 1]
}

// Constant buffers are sized in 16 byte units, large enough for every block uploaded into them.
fn create_constant_buffer<B: Backend>(
    device: &B::Device,
    block_sizes: &[usize],
) -> StrResult<B::Buffer> {
    let size = block_sizes.iter().copied().max().unwrap_or(16);
    device.create_constant_buffer(((size + 15) & !15) as u32)
}

/// Rectangle of the output texture the given eye is written to.
pub fn output_viewport(output_desc: &TextureDesc, mode: TextureMode, eye: Eye) -> Viewport {
    let mut viewport = Viewport::new(0, 0, output_desc.width, output_desc.height);
    if mode == TextureMode::Combined {
        viewport.width /= 2;
        if eye == Eye::Right {
            viewport.x += viewport.width;
        }
    }
    viewport
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct ResourceKey {
    method: UpscaleMethod,
    width: u32,
    height: u32,
    format: Format,
}

pub struct PostProcessor<B: Backend> {
    settings: Arc<SettingsStore>,
    device: B::Device,
    context: B::Context,
    kernels: Arc<dyn KernelSource>,
    upscaler: Option<(ResourceKey, Box<dyn Upscaler<B>>)>,
    samplers: SamplerRewriter<B>,
    mip_lod_bias: f32,
    profiler: Option<Profiler<B>>,
    rebuild_count: usize,
}

impl<B: Backend> PostProcessor<B> {
    pub fn new(
        settings: Arc<SettingsStore>,
        device: B::Device,
        kernels: Arc<dyn KernelSource>,
    ) -> StrResult<Self> {
        let context = device.immediate_context()?;
        Ok(Self {
            settings,
            device,
            context,
            kernels,
            upscaler: None,
            samplers: SamplerRewriter::new(),
            mip_lod_bias: 0.,
            profiler: None,
            rebuild_count: 0,
        })
    }

    pub fn mip_lod_bias(&self) -> f32 {
        self.mip_lod_bias
    }

    /// Number of times the upscaler resources were (re)created.
    pub fn rebuild_count(&self) -> usize {
        self.rebuild_count
    }

    /// Run the configured upscaler for one eye. Returns the viewport of the output texture that
    /// now holds the eye image, or `None` if nothing was done. A failure disables upscaling.
    pub fn apply(&mut self, input: &PostProcessInput<B>) -> Option<Viewport> {
        let settings = self.settings.snapshot();
        if settings.debug_mode {
            self.start_profiling();
        }

        let output_viewport = if settings.upscaling.enabled {
            match self.upscale(input, &settings) {
                Ok(viewport) => Some(viewport),
                Err(e) => {
                    error!("Upscaling failed: {}", e);
                    self.settings.update(|settings| settings.upscaling.enabled = false);
                    None
                }
            }
        } else {
            None
        };

        if settings.debug_mode {
            self.end_profiling();
        }

        output_viewport
    }

    fn upscale(&mut self, input: &PostProcessInput<B>, settings: &Settings) -> StrResult<Viewport> {
        let snapshot = PipelineSnapshot::<B>::capture(&self.context);
        // the input texture may still be bound as a render target
        self.context.set_render_targets(&[], None);

        let result = self.run_upscaler(input, settings);

        snapshot.restore(&self.context);
        result
    }

    fn run_upscaler(
        &mut self,
        input: &PostProcessInput<B>,
        settings: &Settings,
    ) -> StrResult<Viewport> {
        if input.input_viewport.is_empty() {
            return trace_str!("Empty input viewport {:?}", input.input_viewport);
        }

        let output_desc = B::texture_desc(&input.output_texture);
        let output_viewport = output_viewport(&output_desc, input.mode, input.eye);
        if output_viewport.is_empty() {
            return trace_str!("Empty output texture {:?}", output_desc);
        }

        self.prepare_upscaler(settings.upscaling.method, &output_desc)?;
        let upscaler = match &mut self.upscaler {
            Some((_, upscaler)) => upscaler,
            None => return trace_str!("Upscaler unavailable"),
        };
        upscaler.upscale(&self.context, input, &output_viewport, settings)?;

        let mip_lod_bias =
            -(output_viewport.width as f32 / input.input_viewport.width as f32).log2();
        if mip_lod_bias != self.mip_lod_bias {
            debug!(
                "MIP LOD bias changed from {} to {}, recreating samplers",
                self.mip_lod_bias, mip_lod_bias
            );
            self.samplers.invalidate();
            self.mip_lod_bias = mip_lod_bias;
        }

        Ok(output_viewport)
    }

    fn prepare_upscaler(
        &mut self,
        method: UpscaleMethod,
        output_desc: &TextureDesc,
    ) -> StrResult {
        let key = ResourceKey {
            method,
            width: output_desc.width,
            height: output_desc.height,
            format: output_desc.format,
        };

        let outdated = match &self.upscaler {
            Some((current_key, _)) => *current_key != key,
            None => true,
        };
        if outdated {
            // resources are released before the replacements are created
            self.upscaler = None;
            self.samplers.invalidate();

            let kernels = &*self.kernels;
            let upscaler: Box<dyn Upscaler<B>> = match method {
                UpscaleMethod::Fsr => {
                    Box::new(FsrUpscaler::<B>::new(&self.device, kernels, output_desc)?)
                }
                UpscaleMethod::Nis => Box::new(NisUpscaler::<B>::new(&self.device, kernels)?),
                UpscaleMethod::Cas => Box::new(CasUpscaler::<B>::new(&self.device, kernels)?),
            };
            self.upscaler = Some((key, upscaler));
            self.rebuild_count += 1;
        }

        Ok(())
    }

    fn start_profiling(&mut self) {
        if self.profiler.is_none() {
            match Profiler::new(&self.device) {
                Ok(profiler) => self.profiler = Some(profiler),
                Err(e) => {
                    warn!("Cannot create profiling queries: {}", e);
                    return;
                }
            }
        }
        if let Some(profiler) = &self.profiler {
            profiler.begin(&self.context);
        }
    }

    fn end_profiling(&mut self) {
        if let Some(profiler) = &mut self.profiler {
            profiler.end(&self.context);
        }
    }
}

impl<B: Backend> RenderListener<B> for PostProcessor<B> {
    fn pre_ps_set_samplers(&mut self, start_slot: u32, samplers: &[Option<B::SamplerState>]) -> bool {
        let enabled = self.settings.snapshot().upscaling.apply_mip_bias;
        match self
            .samplers
            .rewrite(&self.device, samplers, self.mip_lod_bias, enabled)
        {
            Some(samplers) => {
                self.context.set_ps_samplers(start_slot, &samplers);
                true
            }
            None => false,
        }
    }
}
