pub mod oculus;
pub mod openvr;

use crate::{
    foveation::*,
    graphics::*,
    injector::DeviceInjector,
    postprocess::{kernels::KernelSource, *},
};
use log::*;
use parking_lot::Mutex;
use std::sync::Arc;
use vrfx_common::{data::*, *};

/// Tangents of the half angles of an eye's field of view.
#[derive(Clone, Copy, PartialEq, Default, Debug)]
pub struct FovTangents {
    pub up: f32,
    pub down: f32,
    pub left: f32,
    pub right: f32,
}

/// Edges of an eye's projection as returned by the VR runtime: tangents, left and top negative.
#[derive(Clone, Copy, PartialEq, Default, Debug)]
pub struct RawProjection {
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

/// Runtime-neutral view of the stereo layer submitted by the host.
#[derive(Clone, PartialEq, Debug)]
pub struct EyeLayer<T> {
    pub color_textures: [Option<T>; 2],
    pub viewports: [Viewport; 2],
    pub fov: [FovTangents; 2],
    pub origin_bottom_left: bool,
}

pub fn fov_projection_centers(fov: &[FovTangents; 2]) -> ProjectionCenters {
    let center = |fov: &FovTangents| ProjectionCenter {
        x: 0.5 * (1. + (fov.left - fov.right) / (fov.right + fov.left)),
        y: 0.5 * (1. + (fov.down - fov.up) / (fov.down + fov.up)),
    };
    [center(&fov[0]), center(&fov[1])]
}

/// Half the angle between the forward axes of the two eye displays, positive for the left eye.
pub fn canted_angle(left_forward: [f32; 3], right_forward: [f32; 3], eye: Eye) -> f32 {
    let dot = left_forward
        .iter()
        .zip(right_forward.iter())
        .map(|(l, r)| l * r)
        .sum::<f32>()
        .max(-1.)
        .min(1.);
    let angle = (dot.acos() / 2.).abs();
    if eye == Eye::Right {
        -angle
    } else {
        angle
    }
}

pub fn raw_projection_center(projection: &RawProjection, canted_angle: f32) -> ProjectionCenter {
    let RawProjection {
        left,
        right,
        top,
        bottom,
    } = *projection;
    let canted = canted_angle.tan();

    ProjectionCenter {
        x: 0.5 * (1. + (right + left - 2. * canted) / (left - right)),
        y: 0.5 * (1. + (bottom + top) / (top - bottom)),
    }
}

pub fn flip_center(center: ProjectionCenter, flip_x: bool, flip_y: bool) -> ProjectionCenter {
    ProjectionCenter {
        x: if flip_x { 1. - center.x } else { center.x },
        y: if flip_y { 1. - center.y } else { center.y },
    }
}

pub type ExtensionLoader<B, E> = Box<dyn Fn(&<B as Backend>::Device) -> Option<E>>;

/// Post-processing and foveation for one host device, wired to the device's intercepted calls
/// for as long as it lives.
pub struct FrameProcessor<B: Backend, E: ShadingRateExtension<B> + 'static> {
    device: B::Device,
    injector: Arc<DeviceInjector<B>>,
    post_processor: Arc<Mutex<PostProcessor<B>>>,
    foveation: Arc<Mutex<FoveationEngine<B, E>>>,
}

impl<B: Backend, E: ShadingRateExtension<B> + 'static> FrameProcessor<B, E> {
    pub fn new(
        settings: Arc<SettingsStore>,
        device: B::Device,
        kernels: Arc<dyn KernelSource>,
        extension: Option<E>,
    ) -> StrResult<Self> {
        let post_processor = Arc::new(Mutex::new(PostProcessor::new(
            settings.clone(),
            device.clone(),
            kernels,
        )?));
        let foveation = Arc::new(Mutex::new(FoveationEngine::new(
            settings,
            device.clone(),
            extension,
        )?));

        let injector = Arc::new(DeviceInjector::new());
        injector.add_listener(post_processor.clone());
        injector.add_listener(foveation.clone());
        device.attach_injector(&injector)?;

        Ok(Self {
            device,
            injector,
            post_processor,
            foveation,
        })
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn apply(&self, input: &PostProcessInput<B>) -> Option<Viewport> {
        self.post_processor.lock().apply(input)
    }

    pub fn update_foveation_target(
        &self,
        width: u32,
        height: u32,
        mode: TextureMode,
        centers: ProjectionCenters,
    ) {
        self.foveation
            .lock()
            .update_target_information(width, height, mode, centers);
    }

    pub fn end_frame(&self) {
        self.foveation.lock().end_frame();
    }
}

impl<B: Backend, E: ShadingRateExtension<B> + 'static> Drop for FrameProcessor<B, E> {
    fn drop(&mut self) {
        self.device.detach_injector(&self.injector);
        debug!("Frame processor released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::mock::*;
    use crate::postprocess::kernels::KernelNames;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn fov_centers() {
        let symmetric = FovTangents {
            up: 1.,
            down: 1.,
            left: 1.,
            right: 1.,
        };
        let asymmetric = FovTangents {
            up: 1.,
            down: 1.5,
            left: 1.,
            right: 0.8,
        };
        let centers = fov_projection_centers(&[symmetric, asymmetric]);
        assert_eq!(centers[0], ProjectionCenter::default());
        assert!(approx(centers[1].x, 0.5 * (1. + 0.2 / 1.8)));
        assert!(approx(centers[1].y, 0.6));
    }

    #[test]
    fn raw_projection_centers() {
        let projection = RawProjection {
            left: -1.5,
            right: 0.5,
            top: -1.,
            bottom: 1.,
        };
        let center = raw_projection_center(&projection, 0.);
        assert!(approx(center.x, 0.75));
        assert!(approx(center.y, 0.5));

        let forward = |angle: f32| [angle.sin(), 0., angle.cos()];
        let left = canted_angle(forward(0.1), forward(-0.1), Eye::Left);
        let right = canted_angle(forward(0.1), forward(-0.1), Eye::Right);
        assert!(approx(left, 0.1));
        assert!(approx(right, -0.1));

        let symmetric = RawProjection {
            left: -1.,
            right: 1.,
            top: -1.,
            bottom: 1.,
        };
        let canted = raw_projection_center(&symmetric, left);
        assert!(approx(canted.x, 0.5 * (1. + 0.1f32.tan())));
    }

    #[test]
    fn flips() {
        let center = ProjectionCenter { x: 0.4, y: 0.3 };
        assert_eq!(flip_center(center, false, false), center);
        let flipped = flip_center(center, true, true);
        assert!(approx(flipped.x, 0.6) && approx(flipped.y, 0.7));
    }

    #[test]
    fn frame_processor_is_wired_to_the_device() {
        let device = MockDevice::new();
        let settings = Arc::new(SettingsStore::new(Settings::default()));
        let processor = FrameProcessor::<Mock, NoShadingRateExtension>::new(
            settings,
            device.clone(),
            Arc::new(KernelNames),
            None,
        )
        .unwrap();
        assert_eq!(device.attached_injectors(), 1);
        assert_eq!(processor.injector.listener_count(), 2);

        drop(processor);
        assert_eq!(device.attached_injectors(), 0);
    }
}
