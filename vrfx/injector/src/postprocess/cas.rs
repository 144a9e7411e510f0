use super::{kernels::*, packing::*, *};
use safe_transmute::*;
use std::mem::size_of;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct CasConstants {
    pub const0: [u32; 4],
    pub const1: [u32; 4],
    pub input_offset: [u32; 2],
    pub output_offset: [u32; 2],
    pub input_texture_size: [u32; 2],
    pub output_texture_size: [u32; 2],
    pub proj_centre: [u32; 2],
    pub squared_radius: u32,
    pub debug_mode: u32,
}

unsafe impl TriviallyTransmutable for CasConstants {}

fn lerp(x: f32, y: f32, a: f32) -> f32 {
    y * a + (-x * a + x)
}

pub fn cas_setup(
    sharpness: f32,
    input_width: f32,
    input_height: f32,
    output_width: f32,
    output_height: f32,
) -> ([u32; 4], [u32; 4]) {
    let scale_x = input_width * (1. / output_width);
    let scale_y = input_height * (1. / output_height);

    let const0 = [
        float_bits(scale_x),
        float_bits(scale_y),
        float_bits(0.5 * input_width * (1. / output_width) - 0.5),
        float_bits(0.5 * input_height * (1. / output_height) - 0.5),
    ];

    let sharp = -(1. / lerp(8., 5., sharpness.max(0.).min(1.)));
    let const1 = [
        float_bits(sharp),
        pack_half2(sharp, 0.),
        float_bits(8. * input_width * (1. / output_width)),
        0,
    ];

    (const0, const1)
}

pub fn cas_constants(
    settings: &Settings,
    input_viewport: &Viewport,
    input_size: (u32, u32),
    output_viewport: &Viewport,
    output_size: (u32, u32),
    focus: &FocusArea,
) -> CasConstants {
    let (const0, const1) = cas_setup(
        settings.upscaling.sharpness,
        input_viewport.width as f32,
        input_viewport.height as f32,
        output_viewport.width as f32,
        output_viewport.height as f32,
    );

    CasConstants {
        const0,
        const1,
        input_offset: [input_viewport.x, input_viewport.y],
        output_offset: [output_viewport.x, output_viewport.y],
        input_texture_size: [input_size.0, input_size.1],
        output_texture_size: [output_size.0, output_size.1],
        proj_centre: focus.projection_center,
        squared_radius: focus.squared_radius,
        debug_mode: settings.debug_mode as u32,
    }
}

/// Contrast adaptive sharpening, optionally combined with a bilinear upscale, in one pass.
pub struct CasUpscaler<B: Backend> {
    upscale: B::ComputeShader,
    sharpen: B::ComputeShader,
    constant_buffer: B::Buffer,
    sampler: B::SamplerState,
}

impl<B: Backend> CasUpscaler<B> {
    pub fn new(device: &B::Device, kernels: &dyn KernelSource) -> StrResult<Self> {
        info!("Creating resources for CAS upscaling...");

        Ok(Self {
            upscale: device.create_compute_shader(&kernels.bytecode(Kernel::CasUpscale)?)?,
            sharpen: device.create_compute_shader(&kernels.bytecode(Kernel::CasSharpen)?)?,
            constant_buffer: create_constant_buffer::<B>(device, &[size_of::<CasConstants>()])?,
            sampler: device.create_sampler(&SamplerDesc::linear_clamp())?,
        })
    }
}

impl<B: Backend> Upscaler<B> for CasUpscaler<B> {
    fn upscale(
        &mut self,
        context: &B::Context,
        input: &PostProcessInput<B>,
        output_viewport: &Viewport,
        settings: &Settings,
    ) -> StrResult {
        let input_desc = B::texture_desc(&input.input_texture);
        let output_desc = B::texture_desc(&input.output_texture);

        context.set_cs_samplers(0, &[Some(self.sampler.clone())]);
        context.set_cs_shader_resources(0, &[Some(input.input_view.clone())]);
        context.set_cs_unordered_access_views(0, &[Some(input.output_uav.clone())]);

        let constants = cas_constants(
            settings,
            &input.input_viewport,
            (input_desc.width, input_desc.height),
            output_viewport,
            (output_desc.width, output_desc.height),
            &FocusArea::new(output_viewport, input.projection_center, settings.upscaling.radius),
        );
        context.update_buffer(
            &self.constant_buffer,
            transmute_to_bytes(std::slice::from_ref(&constants)),
        );
        context.set_constant_buffer(ShaderStage::Compute, Some(&self.constant_buffer));

        if input.input_viewport != *output_viewport {
            context.set_compute_shader(Some(&self.upscale));
        } else {
            context.set_compute_shader(Some(&self.sharpen));
        }
        let groups = dispatch_groups_16(output_viewport);
        context.dispatch(groups[0], groups[1], groups[2]);

        Ok(())
    }
}
