use super::{kernels::*, nis_coefficients::*, *};
use safe_transmute::*;
use std::mem::size_of;

#[repr(C, align(256))]
#[derive(Clone, Copy, PartialEq, Default, Debug)]
pub struct NisConstants {
    pub detect_ratio: f32,
    pub detect_threshold: f32,
    pub min_contrast_ratio: f32,
    pub ratio_norm: f32,

    pub contrast_boost: f32,
    pub eps: f32,
    pub sharp_start_y: f32,
    pub sharp_scale_y: f32,

    pub sharp_strength_min: f32,
    pub sharp_strength_scale: f32,
    pub sharp_limit_min: f32,
    pub sharp_limit_scale: f32,

    pub scale_x: f32,
    pub scale_y: f32,
    pub dst_norm_x: f32,
    pub dst_norm_y: f32,

    pub src_norm_x: f32,
    pub src_norm_y: f32,

    pub input_viewport_origin_x: u32,
    pub input_viewport_origin_y: u32,
    pub input_viewport_width: u32,
    pub input_viewport_height: u32,

    pub output_viewport_origin_x: u32,
    pub output_viewport_origin_y: u32,
    pub output_viewport_width: u32,
    pub output_viewport_height: u32,

    pub reserved0: f32,
    pub reserved1: f32,

    pub proj_centre: [u32; 2],
    pub squared_radius: u32,
    pub debug_mode: u32,

    pub padding: [u32; 32],
}

unsafe impl TriviallyTransmutable for NisConstants {}

const UPSCALE_BLOCK_WIDTH: u32 = 32;
const UPSCALE_BLOCK_HEIGHT: u32 = 24;
const SHARPEN_BLOCK_WIDTH: u32 = 32;
const SHARPEN_BLOCK_HEIGHT: u32 = 32;

/// Fill the scaler block for SDR content. Fails on empty viewports and on scale factors outside
/// of [0.5, 1].
pub fn nis_config(
    sharpness: f32,
    input_viewport: &Viewport,
    input_size: (u32, u32),
    output_viewport: &Viewport,
    output_size: (u32, u32),
) -> StrResult<NisConstants> {
    if input_viewport.is_empty() || output_viewport.is_empty() {
        return trace_str!(
            "Empty viewport: input {:?}, output {:?}",
            input_viewport,
            output_viewport
        );
    }

    let sharpness = sharpness.min(1.).max(0.);
    // 0..1 mapped to -0.5..0.5
    let slider = sharpness - 0.5;

    let min_scale = if slider >= 0. { 1.25 } else { 1. };
    let limit_scale = if slider >= 0. { 1.25 } else { 1. };

    let min_contrast_ratio = 2.;
    let max_contrast_ratio = 10.;
    let sharp_start_y = 0.45;
    let sharp_end_y = 0.9;
    let sharp_strength_min = (0.4 + slider * min_scale * 1.2).max(0.);
    let sharp_strength_max = 1.6 + slider * 1.8;
    let sharp_limit_min = (0.14 + slider * limit_scale * 0.32).max(0.1);
    let sharp_limit_max = 0.5 + slider * limit_scale * 0.6;

    let scale_x = input_viewport.width as f32 / output_viewport.width as f32;
    let scale_y = input_viewport.height as f32 / output_viewport.height as f32;
    if scale_x < 0.5 || scale_x > 1. || scale_y < 0.5 || scale_y > 1. {
        return trace_str!("Unsupported scale {}x{}", scale_x, scale_y);
    }

    Ok(NisConstants {
        detect_ratio: 1127. / 1024.,
        detect_threshold: 64. / 1024.,
        min_contrast_ratio,
        ratio_norm: 1. / (max_contrast_ratio - min_contrast_ratio),
        contrast_boost: 1.,
        eps: 1.,
        sharp_start_y,
        sharp_scale_y: 1. / (sharp_end_y - sharp_start_y),
        sharp_strength_min,
        sharp_strength_scale: sharp_strength_max - sharp_strength_min,
        sharp_limit_min,
        sharp_limit_scale: sharp_limit_max - sharp_limit_min,
        scale_x,
        scale_y,
        dst_norm_x: 1. / output_size.0 as f32,
        dst_norm_y: 1. / output_size.1 as f32,
        src_norm_x: 1. / input_size.0 as f32,
        src_norm_y: 1. / input_size.1 as f32,
        input_viewport_origin_x: input_viewport.x,
        input_viewport_origin_y: input_viewport.y,
        input_viewport_width: input_viewport.width,
        input_viewport_height: input_viewport.height,
        output_viewport_origin_x: output_viewport.x,
        output_viewport_origin_y: output_viewport.y,
        output_viewport_width: output_viewport.width,
        output_viewport_height: output_viewport.height,
        ..Default::default()
    })
}

fn dispatch_groups(viewport: &Viewport, block_width: u32, block_height: u32) -> [u32; 3] {
    [
        (viewport.width as f32 / block_width as f32).ceil() as u32,
        (viewport.height as f32 / block_height as f32).ceil() as u32,
        1,
    ]
}

pub fn upscale_dispatch_groups(viewport: &Viewport) -> [u32; 3] {
    dispatch_groups(viewport, UPSCALE_BLOCK_WIDTH, UPSCALE_BLOCK_HEIGHT)
}

pub fn sharpen_dispatch_groups(viewport: &Viewport) -> [u32; 3] {
    dispatch_groups(viewport, SHARPEN_BLOCK_WIDTH, SHARPEN_BLOCK_HEIGHT)
}

fn create_coefficients_texture<B: Backend>(
    device: &B::Device,
    coefficients: &[[f32; FILTER_SIZE]; PHASE_COUNT],
) -> StrResult<(B::Texture, B::ShaderResourceView)> {
    let values = coefficients.iter().flatten().copied().collect::<Vec<f32>>();
    let desc = TextureDesc {
        width: (FILTER_SIZE / 4) as _,
        height: PHASE_COUNT as _,
        mip_levels: 1,
        array_size: 1,
        format: Format::R32G32B32A32_FLOAT,
        sample_count: 1,
        bind_flags: BindFlags::SHADER_RESOURCE,
    };
    let texture = device.create_texture(
        &desc,
        Some(InitialData {
            bytes: transmute_to_bytes(&values),
            row_pitch: (FILTER_SIZE * size_of::<f32>()) as _,
        }),
    )?;
    let view = device.create_shader_resource_view(&texture, desc.format, None)?;

    Ok((texture, view))
}

/// Directional scaling with adaptive sharpening. The filter taps come from two coefficient
/// tables bound next to the input.
pub struct NisUpscaler<B: Backend> {
    upscale: B::ComputeShader,
    sharpen: B::ComputeShader,
    constant_buffer: B::Buffer,
    sampler: B::SamplerState,
    _coefficient_textures: [B::Texture; 2],
    scale_coefficients: B::ShaderResourceView,
    usm_coefficients: B::ShaderResourceView,
}

impl<B: Backend> NisUpscaler<B> {
    pub fn new(device: &B::Device, kernels: &dyn KernelSource) -> StrResult<Self> {
        info!("Creating resources for NIS upscaling...");

        let (scale_texture, scale_coefficients) =
            create_coefficients_texture::<B>(device, &COEFFICIENTS_SCALE)?;
        let (usm_texture, usm_coefficients) =
            create_coefficients_texture::<B>(device, &COEFFICIENTS_USM)?;

        Ok(Self {
            upscale: device.create_compute_shader(&kernels.bytecode(Kernel::NisUpscale)?)?,
            sharpen: device.create_compute_shader(&kernels.bytecode(Kernel::NisSharpen)?)?,
            constant_buffer: create_constant_buffer::<B>(device, &[size_of::<NisConstants>()])?,
            sampler: device.create_sampler(&SamplerDesc::linear_clamp())?,
            _coefficient_textures: [scale_texture, usm_texture],
            scale_coefficients,
            usm_coefficients,
        })
    }
}

impl<B: Backend> Upscaler<B> for NisUpscaler<B> {
    fn upscale(
        &mut self,
        context: &B::Context,
        input: &PostProcessInput<B>,
        output_viewport: &Viewport,
        settings: &Settings,
    ) -> StrResult {
        let input_desc = B::texture_desc(&input.input_texture);
        let output_desc = B::texture_desc(&input.output_texture);

        let mut constants = nis_config(
            settings.upscaling.sharpness,
            &input.input_viewport,
            (input_desc.width, input_desc.height),
            output_viewport,
            (output_desc.width, output_desc.height),
        )?;
        let focus = FocusArea::new(output_viewport, input.projection_center, settings.upscaling.radius);
        constants.proj_centre = focus.projection_center;
        constants.squared_radius = focus.squared_radius;
        constants.debug_mode = settings.debug_mode as u32;

        context.set_cs_samplers(0, &[Some(self.sampler.clone())]);
        context.set_cs_shader_resources(0, &[Some(input.input_view.clone())]);
        context.set_cs_unordered_access_views(0, &[Some(input.output_uav.clone())]);
        context.update_buffer(
            &self.constant_buffer,
            transmute_to_bytes(std::slice::from_ref(&constants)),
        );
        context.set_constant_buffer(ShaderStage::Compute, Some(&self.constant_buffer));

        let groups = if input.input_viewport != *output_viewport {
            context.set_cs_shader_resources(
                1,
                &[
                    Some(self.scale_coefficients.clone()),
                    Some(self.usm_coefficients.clone()),
                ],
            );
            context.set_compute_shader(Some(&self.upscale));
            upscale_dispatch_groups(output_viewport)
        } else {
            context.set_compute_shader(Some(&self.sharpen));
            sharpen_dispatch_groups(output_viewport)
        };
        context.dispatch(groups[0], groups[1], groups[2]);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaler_block() {
        let constants = nis_config(
            0.5,
            &Viewport::new(1000, 0, 1000, 1000),
            (2000, 1000),
            &Viewport::new(1429, 0, 1429, 1430),
            (2858, 1430),
        )
        .unwrap();

        assert_eq!(constants.detect_ratio, 1127. / 1024.);
        assert_eq!(constants.detect_threshold, 0.0625);
        assert_eq!(constants.min_contrast_ratio, 2.);
        assert_eq!(constants.ratio_norm, 0.125);
        assert_eq!(constants.contrast_boost, 1.);
        assert_eq!(constants.eps, 1.);
        assert_eq!(constants.sharp_start_y, 0.45);
        assert_eq!(constants.sharp_scale_y, 1. / (0.9f32 - 0.45));
        assert_eq!(constants.sharp_strength_min, 0.4);
        assert_eq!(constants.sharp_strength_scale, 1.6f32 - 0.4);
        assert_eq!(constants.sharp_limit_min, 0.14);
        assert_eq!(constants.sharp_limit_scale, 0.5f32 - 0.14);
        assert_eq!(constants.scale_x, 1000. / 1429.);
        assert_eq!(constants.scale_y, 1000. / 1430.);
        assert_eq!(constants.dst_norm_x, 1. / 2858.);
        assert_eq!(constants.src_norm_y, 1. / 1000.);
        assert_eq!(
            [
                constants.input_viewport_origin_x,
                constants.input_viewport_width,
                constants.output_viewport_origin_x,
                constants.output_viewport_height
            ],
            [1000, 1000, 1429, 1430]
        );
        assert_eq!(size_of::<NisConstants>(), 256);
    }

    #[test]
    fn slider_ranges() {
        let viewport = Viewport::new(0, 0, 100, 100);

        let soft = nis_config(0., &viewport, (100, 100), &viewport, (100, 100)).unwrap();
        assert_eq!(soft.sharp_strength_min, 0.);
        assert_eq!(soft.sharp_limit_min, 0.1);

        // values above 1 are clamped
        let sharp = nis_config(4., &viewport, (100, 100), &viewport, (100, 100)).unwrap();
        let full = nis_config(1., &viewport, (100, 100), &viewport, (100, 100)).unwrap();
        assert_eq!(sharp, full);
        assert_eq!(full.sharp_strength_min, 0.4 + 0.5 * 1.25 * 1.2);
    }

    #[test]
    fn invalid_geometry() {
        let output = Viewport::new(0, 0, 1000, 1000);
        assert!(nis_config(0.5, &Viewport::new(0, 0, 0, 10), (10, 10), &output, (1000, 1000)).is_err());
        assert!(
            nis_config(0.5, &Viewport::new(0, 0, 400, 1000), (400, 1000), &output, (1000, 1000))
                .is_err()
        );
        assert!(
            nis_config(0.5, &Viewport::new(0, 0, 1200, 1000), (1200, 1000), &output, (1000, 1000))
                .is_err()
        );
        assert!(
            nis_config(0.5, &Viewport::new(0, 0, 500, 1000), (500, 1000), &output, (1000, 1000))
                .is_ok()
        );
    }

    #[test]
    fn dispatch_sizes() {
        let viewport = Viewport::new(1429, 0, 1429, 1430);
        assert_eq!(upscale_dispatch_groups(&viewport), [45, 60, 1]);
        assert_eq!(sharpen_dispatch_groups(&viewport), [45, 45, 1]);
    }
}
