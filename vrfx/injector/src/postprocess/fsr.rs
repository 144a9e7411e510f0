use super::{kernels::*, packing::*, *};
use safe_transmute::*;
use std::mem::size_of;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct EasuConstants {
    pub const0: [u32; 4],
    pub const1: [u32; 4],
    pub const2: [u32; 4],
    // the last two words carry the output viewport origin
    pub const3: [u32; 4],
    pub proj_centre: [u32; 2],
    pub squared_radius: u32,
    pub padding: u32,
}

unsafe impl TriviallyTransmutable for EasuConstants {}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct RcasConstants {
    // the last two words carry the output viewport origin
    pub const0: [u32; 4],
    pub proj_centre: [u32; 2],
    pub squared_radius: u32,
    pub debug_mode: u32,
}

unsafe impl TriviallyTransmutable for RcasConstants {}

#[allow(clippy::too_many_arguments)]
pub fn fsr_easu_con_offset(
    input_viewport_width: f32,
    input_viewport_height: f32,
    input_width: f32,
    input_height: f32,
    output_width: f32,
    output_height: f32,
    input_offset_x: f32,
    input_offset_y: f32,
) -> [[u32; 4]; 4] {
    let rcp_input_width = 1. / input_width;
    let rcp_input_height = 1. / input_height;
    let rcp_output_width = 1. / output_width;
    let rcp_output_height = 1. / output_height;

    [
        [
            float_bits(input_viewport_width * rcp_output_width),
            float_bits(input_viewport_height * rcp_output_height),
            float_bits(0.5 * input_viewport_width * rcp_output_width - 0.5 + input_offset_x),
            float_bits(0.5 * input_viewport_height * rcp_output_height - 0.5 + input_offset_y),
        ],
        [
            float_bits(rcp_input_width),
            float_bits(rcp_input_height),
            float_bits(1. * rcp_input_width),
            float_bits(-1. * rcp_input_height),
        ],
        [
            float_bits(-1. * rcp_input_width),
            float_bits(2. * rcp_input_height),
            float_bits(1. * rcp_input_width),
            float_bits(2. * rcp_input_height),
        ],
        [
            float_bits(0. * rcp_input_width),
            float_bits(4. * rcp_input_height),
            0,
            0,
        ],
    ]
}

/// `sharpness` is in stops: 0 is the strongest sharpening.
pub fn fsr_rcas_con(sharpness: f32) -> [u32; 4] {
    let sharpness = (-sharpness).exp2();
    [float_bits(sharpness), pack_half2(sharpness, sharpness), 0, 0]
}

pub fn easu_constants(
    input_viewport: &Viewport,
    input_size: (u32, u32),
    output_viewport: &Viewport,
    focus: &FocusArea,
) -> EasuConstants {
    let [const0, const1, const2, mut const3] = fsr_easu_con_offset(
        input_viewport.width as f32,
        input_viewport.height as f32,
        input_size.0 as f32,
        input_size.1 as f32,
        output_viewport.width as f32,
        output_viewport.height as f32,
        input_viewport.x as f32,
        input_viewport.y as f32,
    );
    const3[2] = output_viewport.x;
    const3[3] = output_viewport.y;

    EasuConstants {
        const0,
        const1,
        const2,
        const3,
        proj_centre: focus.projection_center,
        squared_radius: focus.squared_radius,
        padding: 0,
    }
}

pub fn rcas_constants(
    sharpness: f32,
    output_viewport: &Viewport,
    focus: &FocusArea,
    debug_mode: bool,
) -> RcasConstants {
    let mut const0 = fsr_rcas_con(2. - 2. * sharpness);
    const0[2] = output_viewport.x;
    const0[3] = output_viewport.y;

    RcasConstants {
        const0,
        proj_centre: focus.projection_center,
        squared_radius: focus.squared_radius,
        debug_mode: debug_mode as u32,
    }
}

/// Edge adaptive upscaling into an intermediate texture followed by contrast adaptive
/// sharpening into the output.
pub struct FsrUpscaler<B: Backend> {
    easu: B::ComputeShader,
    rcas: B::ComputeShader,
    constant_buffer: B::Buffer,
    sampler: B::SamplerState,
    _upscaled_texture: B::Texture,
    upscaled_view: B::ShaderResourceView,
    upscaled_uav: B::UnorderedAccessView,
}

impl<B: Backend> FsrUpscaler<B> {
    pub fn new(
        device: &B::Device,
        kernels: &dyn KernelSource,
        output_desc: &TextureDesc,
    ) -> StrResult<Self> {
        info!("Creating resources for FSR upscaling...");

        let easu = device.create_compute_shader(&kernels.bytecode(Kernel::FsrEasu)?)?;
        let rcas = device.create_compute_shader(&kernels.bytecode(Kernel::FsrRcas)?)?;
        let constant_buffer = create_constant_buffer::<B>(
            device,
            &[size_of::<EasuConstants>(), size_of::<RcasConstants>()],
        )?;
        let sampler = device.create_sampler(&SamplerDesc::linear_clamp())?;

        let format = output_desc.format.typeless_to_typed();
        let upscaled_texture = device.create_texture(
            &TextureDesc::storage(output_desc.width, output_desc.height, format),
            None,
        )?;
        let upscaled_view = device.create_shader_resource_view(&upscaled_texture, format, None)?;
        let upscaled_uav = device.create_unordered_access_view(&upscaled_texture, format, None)?;

        Ok(Self {
            easu,
            rcas,
            constant_buffer,
            sampler,
            _upscaled_texture: upscaled_texture,
            upscaled_view,
            upscaled_uav,
        })
    }
}

impl<B: Backend> Upscaler<B> for FsrUpscaler<B> {
    fn upscale(
        &mut self,
        context: &B::Context,
        input: &PostProcessInput<B>,
        output_viewport: &Viewport,
        settings: &Settings,
    ) -> StrResult {
        let input_desc = B::texture_desc(&input.input_texture);
        let focus = FocusArea::new(output_viewport, input.projection_center, settings.upscaling.radius);
        let groups = dispatch_groups_16(output_viewport);

        context.set_cs_samplers(0, &[Some(self.sampler.clone())]);
        let mut source = input.input_view.clone();

        if input.input_viewport != *output_viewport {
            let constants = easu_constants(
                &input.input_viewport,
                (input_desc.width, input_desc.height),
                output_viewport,
                &focus,
            );
            context.update_buffer(
                &self.constant_buffer,
                transmute_to_bytes(std::slice::from_ref(&constants)),
            );

            context.set_cs_unordered_access_views(0, &[Some(self.upscaled_uav.clone())]);
            context.set_constant_buffer(ShaderStage::Compute, Some(&self.constant_buffer));
            context.set_cs_shader_resources(0, &[Some(source)]);
            context.set_compute_shader(Some(&self.easu));
            context.dispatch(groups[0], groups[1], groups[2]);

            source = self.upscaled_view.clone();
        }

        let constants = rcas_constants(
            settings.upscaling.sharpness,
            output_viewport,
            &focus,
            settings.debug_mode,
        );
        context.update_buffer(
            &self.constant_buffer,
            transmute_to_bytes(std::slice::from_ref(&constants)),
        );

        // The output view replaces the intermediate one before the intermediate texture is
        // bound for reading.
        context.set_cs_unordered_access_views(0, &[Some(input.output_uav.clone())]);
        context.set_constant_buffer(ShaderStage::Compute, Some(&self.constant_buffer));
        context.set_cs_shader_resources(0, &[Some(source)]);
        context.set_compute_shader(Some(&self.rcas));
        context.dispatch(groups[0], groups[1], groups[2]);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn easu_block() {
        let focus = FocusArea {
            projection_center: [300, 400],
            squared_radius: 90_000,
        };
        let constants = easu_constants(
            &Viewport::new(512, 0, 512, 256),
            (1024, 256),
            &Viewport::new(1024, 0, 1024, 512),
            &focus,
        );

        assert_eq!(
            constants.const0,
            [
                0.5f32.to_bits(),
                0.5f32.to_bits(),
                511.75f32.to_bits(),
                (-0.25f32).to_bits()
            ]
        );
        assert_eq!(
            constants.const1,
            [
                (1. / 1024f32).to_bits(),
                (1. / 256f32).to_bits(),
                (1. / 1024f32).to_bits(),
                (-1. / 256f32).to_bits()
            ]
        );
        assert_eq!(
            constants.const2,
            [
                (-1. / 1024f32).to_bits(),
                (2. / 256f32).to_bits(),
                (1. / 1024f32).to_bits(),
                (2. / 256f32).to_bits()
            ]
        );
        assert_eq!(constants.const3, [0, (4. / 256f32).to_bits(), 1024, 0]);
        assert_eq!(constants.proj_centre, [300, 400]);
        assert_eq!(constants.squared_radius, 90_000);
        assert_eq!(constants.padding, 0);
        assert_eq!(size_of::<EasuConstants>(), 80);
    }

    #[test]
    fn easu_gather_points_form_twelve_tap_footprint() {
        let con = fsr_easu_con_offset(512., 256., 1024., 256., 1024., 512., 0., 0.);
        let texels = |x: u32, y: u32| {
            [
                f32::from_bits(x) * 1024.,
                f32::from_bits(y) * 256.,
            ]
        };

        let p0 = texels(con[1][2], con[1][3]);
        let to_p1 = texels(con[2][0], con[2][1]);
        let to_p2 = texels(con[2][2], con[2][3]);
        let to_p3 = texels(con[3][0], con[3][1]);

        assert_eq!(p0, [1., -1.]);
        assert_eq!([p0[0] + to_p1[0], p0[1] + to_p1[1]], [0., 1.]);
        assert_eq!([p0[0] + to_p2[0], p0[1] + to_p2[1]], [2., 1.]);
        assert_eq!([p0[0] + to_p3[0], p0[1] + to_p3[1]], [1., 3.]);
    }

    #[test]
    fn rcas_block() {
        let focus = FocusArea {
            projection_center: [714, 715],
            squared_radius: 12,
        };
        let constants = rcas_constants(0.5, &Viewport::new(1429, 0, 1429, 1430), &focus, true);

        assert_eq!(constants.const0, [0x3f00_0000, 0x3800_3800, 1429, 0]);
        assert_eq!(constants.proj_centre, [714, 715]);
        assert_eq!(constants.squared_radius, 12);
        assert_eq!(constants.debug_mode, 1);

        // full sharpness: 2^0
        assert_eq!(fsr_rcas_con(0.), [1f32.to_bits(), 0x3c00_3c00, 0, 0]);
        assert_eq!(size_of::<RcasConstants>(), 32);
    }
}
