use crate::{classifier::*, graphics::*, injector::RenderListener};
use log::*;
use std::sync::Arc;
use vrfx_common::{data::*, *};

const TRACE_CONTEXT: &str = "Foveation";

pub const SHADING_RATE_TILE_SIZE: u32 = 16;
pub const SHADING_RATE_TABLE_SIZE: usize = 16;
const VIEWPORT_COUNT: usize = 2;

// Native shading rate values, one shading pass per the given block of raster pixels.
pub const RATE_1X1: u8 = 5;
pub const RATE_1X2: u8 = 6;
pub const RATE_2X1: u8 = 7;
pub const RATE_2X2: u8 = 8;
pub const RATE_4X4: u8 = 11;

/// Shading rate lookup of one viewport: pattern texels index into `table`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ViewportShadingRate {
    pub enabled: bool,
    pub table: [u8; SHADING_RATE_TABLE_SIZE],
}

impl ViewportShadingRate {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            table: [0; SHADING_RATE_TABLE_SIZE],
        }
    }

    pub fn foveated(favor_horizontal: bool) -> Self {
        let mut table = [RATE_1X1; SHADING_RATE_TABLE_SIZE];
        table[1] = if favor_horizontal { RATE_2X1 } else { RATE_1X2 };
        table[2] = RATE_2X2;
        table[3] = RATE_4X4;

        Self {
            enabled: true,
            table,
        }
    }
}

/// Native variable rate shading support, usually a vendor driver extension.
pub trait ShadingRateExtension<B: Backend> {
    type View: Handle;

    fn create_view(
        &mut self,
        device: &B::Device,
        pattern: &B::Texture,
        array_size: u32,
    ) -> StrResult<Self::View>;

    fn bind_view(&mut self, context: &B::Context, view: &Self::View) -> StrResult;

    fn set_viewport_rates(&mut self, context: &B::Context, rates: &[ViewportShadingRate])
        -> StrResult;

    fn unload(&mut self);
}

/// Stand-in for devices without a shading rate extension.
pub enum NoShadingRateExtension {}

impl<B: Backend> ShadingRateExtension<B> for NoShadingRateExtension {
    type View = ();

    fn create_view(&mut self, _: &B::Device, _: &B::Texture, _: u32) -> StrResult {
        match *self {}
    }

    fn bind_view(&mut self, _: &B::Context, _: &()) -> StrResult {
        match *self {}
    }

    fn set_viewport_rates(&mut self, _: &B::Context, _: &[ViewportShadingRate]) -> StrResult {
        match *self {}
    }

    fn unload(&mut self) {
        match *self {}
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct BandThresholds {
    pub inner: f32,
    pub mid: f32,
    pub outer: f32,
}

impl From<&FixedFoveatedDesc> for BandThresholds {
    fn from(desc: &FixedFoveatedDesc) -> Self {
        Self {
            inner: desc.inner_radius,
            mid: desc.mid_radius,
            outer: desc.outer_radius,
        }
    }
}

pub fn distance_to_band(distance: f32, thresholds: &BandThresholds) -> u8 {
    if distance < thresholds.inner {
        0
    } else if distance < thresholds.mid {
        1
    } else if distance < thresholds.outer {
        2
    } else {
        3
    }
}

fn tile_band(
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    center: ProjectionCenter,
    thresholds: &BandThresholds,
) -> u8 {
    let fx = (x as f32 + 0.5) / width as f32;
    let fy = (y as f32 + 0.5) / height as f32;
    let distance = 2. * ((fx - center.x).powi(2) + (fy - center.y).powi(2)).sqrt();
    distance_to_band(distance, thresholds)
}

/// One band per tile of a `width` x `height` tile grid, row major.
pub fn single_eye_pattern(
    width: u32,
    height: u32,
    center: ProjectionCenter,
    thresholds: &BandThresholds,
) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            data.push(tile_band(x, y, width, height, center, thresholds));
        }
    }
    data
}

/// Pattern for both eyes side by side, each half around its own projection center.
pub fn combined_pattern(
    width: u32,
    height: u32,
    centers: &ProjectionCenters,
    thresholds: &BandThresholds,
) -> Vec<u8> {
    let half_width = width / 2;
    let mut data = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let (eye, local_x) = if x < half_width {
                (Eye::Left, x)
            } else {
                (Eye::Right, x - half_width)
            };
            data.push(tile_band(
                local_x,
                y,
                half_width,
                height,
                centers[eye.index()],
                thresholds,
            ));
        }
    }
    data
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PatternKind {
    Combined,
    Array,
    SingleEye(Eye),
}

impl PatternKind {
    fn slot(self) -> usize {
        match self {
            PatternKind::Combined => 0,
            PatternKind::Array => 1,
            PatternKind::SingleEye(eye) => 2 + eye.index(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
struct PatternKey {
    tiles_x: u32,
    tiles_y: u32,
    centers: ProjectionCenters,
    thresholds: BandThresholds,
}

struct Pattern<B: Backend, V> {
    key: PatternKey,
    _texture: B::Texture,
    view: V,
}

fn tile_count(pixels: u32) -> u32 {
    (pixels + SHADING_RATE_TILE_SIZE - 1) / SHADING_RATE_TILE_SIZE
}

/// Arms fixed foveated shading for the host's eye render targets. Patterns are built lazily per
/// target kind and kept until the tile grid, projection centers or thresholds change.
pub struct FoveationEngine<B: Backend, E: ShadingRateExtension<B>> {
    settings: Arc<SettingsStore>,
    device: B::Device,
    context: B::Context,
    extension: Option<E>,
    classifier: EyeClassifier,
    centers: ProjectionCenters,
    patterns: [Option<Pattern<B, E::View>>; 4],
    rebuild_count: usize,
}

impl<B: Backend, E: ShadingRateExtension<B>> FoveationEngine<B, E> {
    pub fn new(
        settings: Arc<SettingsStore>,
        device: B::Device,
        extension: Option<E>,
    ) -> StrResult<Self> {
        if extension.is_some() {
            info!("Variable rate shading is available");
        } else {
            info!("Variable rate shading is not available");
        }

        let context = device.immediate_context()?;
        Ok(Self {
            settings,
            device,
            context,
            extension,
            classifier: EyeClassifier::new(),
            centers: [ProjectionCenter::default(); 2],
            patterns: [None, None, None, None],
            rebuild_count: 0,
        })
    }

    pub fn is_active(&self) -> bool {
        self.extension.is_some()
    }

    pub fn rebuild_count(&self) -> usize {
        self.rebuild_count
    }

    pub fn update_target_information(
        &mut self,
        width: u32,
        height: u32,
        mode: TextureMode,
        centers: ProjectionCenters,
    ) {
        self.classifier.set_target(width, height, mode);
        self.centers = centers;
    }

    pub fn end_frame(&mut self) {
        let settings = self.settings.snapshot();
        self.classifier
            .end_frame(&settings.fixed_foveated.override_single_eye_order);
    }

    /// React to the host binding a new set of render targets, described by its first target.
    pub fn on_render_targets_bound(&mut self, target: Option<&RenderTargetInfo>) {
        if !self.is_active() {
            return;
        }

        let settings = self.settings.snapshot();
        let target = match target {
            Some(target) if settings.fixed_foveated.enabled => target,
            _ => return self.disable(),
        };

        let kind = match self
            .classifier
            .classify(target, &ClassifierPolicy::from(&settings.classifier))
        {
            TargetClass::Combined => PatternKind::Combined,
            TargetClass::Array => PatternKind::Array,
            TargetClass::SingleEye(eye) => PatternKind::SingleEye(eye),
            TargetClass::Opaque | TargetClass::UnknownSingle => return self.disable(),
        };

        let centers = self.centers;
        let result = self.arm(
            kind,
            target.width,
            target.height,
            &centers,
            settings.fixed_foveated.favor_horizontal,
        );
        if let Err(e) = result {
            error!("Error while arming variable rate shading: {}", e);
            self.shutdown();
        }
    }

    fn arm(
        &mut self,
        kind: PatternKind,
        width: u32,
        height: u32,
        centers: &ProjectionCenters,
        favor_horizontal: bool,
    ) -> StrResult {
        self.ensure_built(kind, width, height, centers)?;

        let view = &trace_none!(self.patterns[kind.slot()].as_ref())?.view;
        let extension = trace_none!(self.extension.as_mut())?;
        extension.bind_view(&self.context, view)?;
        extension.set_viewport_rates(
            &self.context,
            &[ViewportShadingRate::foveated(favor_horizontal); VIEWPORT_COUNT],
        )
    }

    /// Build the pattern for `kind` unless the cached one already fits.
    pub fn ensure_built(
        &mut self,
        kind: PatternKind,
        width: u32,
        height: u32,
        centers: &ProjectionCenters,
    ) -> StrResult {
        let settings = self.settings.snapshot();
        let thresholds = BandThresholds::from(&settings.fixed_foveated);

        let mut tiles_x = tile_count(width);
        let mut tiles_y = tile_count(height);
        if kind == PatternKind::Combined {
            // both halves must cover the same number of tiles
            tiles_x += tiles_x & 1;
            tiles_y += tiles_y & 1;
        }
        let key = PatternKey {
            tiles_x,
            tiles_y,
            centers: *centers,
            thresholds,
        };

        let slot = kind.slot();
        if let Some(pattern) = &self.patterns[slot] {
            if pattern.key == key {
                return Ok(());
            }
        }
        self.patterns[slot] = None;

        info!(
            "Creating {:?} shading rate pattern of {}x{} tiles for {}x{} pixels",
            kind, tiles_x, tiles_y, width, height
        );

        let extension = trace_none!(self.extension.as_mut(), "Variable rate shading inactive")?;
        let desc = TextureDesc {
            width: tiles_x,
            height: tiles_y,
            mip_levels: 1,
            array_size: if kind == PatternKind::Array { 2 } else { 1 },
            format: Format::R8_UINT,
            sample_count: 1,
            bind_flags: BindFlags::SHADER_RESOURCE,
        };

        let texture = match kind {
            PatternKind::SingleEye(eye) => {
                let data = single_eye_pattern(tiles_x, tiles_y, centers[eye.index()], &thresholds);
                let initial_data = InitialData {
                    bytes: &data,
                    row_pitch: tiles_x,
                };
                self.device.create_texture(&desc, Some(initial_data))?
            }
            PatternKind::Combined => {
                let data = combined_pattern(tiles_x, tiles_y, centers, &thresholds);
                let initial_data = InitialData {
                    bytes: &data,
                    row_pitch: tiles_x,
                };
                self.device.create_texture(&desc, Some(initial_data))?
            }
            PatternKind::Array => {
                let texture = self.device.create_texture(&desc, None)?;
                for &eye in Eye::BOTH.iter() {
                    // stereo array targets are rendered upside down
                    let center = ProjectionCenter {
                        x: centers[eye.index()].x,
                        y: 1. - centers[eye.index()].y,
                    };
                    let data = single_eye_pattern(tiles_x, tiles_y, center, &thresholds);
                    self.context
                        .update_texture(&texture, eye.index() as u32, &data, tiles_x);
                }
                texture
            }
        };

        let view = extension.create_view(&self.device, &texture, desc.array_size)?;
        self.patterns[slot] = Some(Pattern {
            key,
            _texture: texture,
            view,
        });
        self.rebuild_count += 1;

        Ok(())
    }

    pub fn disable(&mut self) {
        if let Some(extension) = &mut self.extension {
            let rates = [ViewportShadingRate::disabled(); VIEWPORT_COUNT];
            if let Err(e) = extension.set_viewport_rates(&self.context, &rates) {
                error!("Error while disabling variable rate shading: {}", e);
                self.shutdown();
            }
        }
    }

    /// Disable shading rates for good: patterns are released and the extension unloaded.
    pub fn shutdown(&mut self) {
        if let Some(mut extension) = self.extension.take() {
            let rates = [ViewportShadingRate::disabled(); VIEWPORT_COUNT];
            extension.set_viewport_rates(&self.context, &rates).ok();
            self.patterns = [None, None, None, None];
            extension.unload();
            info!("Variable rate shading shut down");
        }
    }
}

impl<B: Backend, E: ShadingRateExtension<B>> RenderListener<B> for FoveationEngine<B, E> {
    fn post_om_set_render_targets(
        &mut self,
        views: &[Option<B::RenderTargetView>],
        _: Option<&B::DepthStencilView>,
    ) {
        let target = views
            .first()
            .and_then(|view| view.as_ref())
            .map(B::render_target_info);
        self.on_render_targets_bound(target.as_ref());
    }
}

impl<B: Backend, E: ShadingRateExtension<B>> Drop for FoveationEngine<B, E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::mock::*;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Clone, PartialEq, Debug)]
    enum ExtensionCall {
        CreateView(String, u32),
        BindView(String),
        SetRates(Vec<ViewportShadingRate>),
        Unload,
    }

    #[derive(Clone, Default)]
    struct MockExtension {
        calls: Rc<RefCell<Vec<ExtensionCall>>>,
        fail_bind: bool,
    }

    impl ShadingRateExtension<Mock> for MockExtension {
        type View = MockHandle;

        fn create_view(
            &mut self,
            device: &MockDevice,
            pattern: &MockHandle,
            array_size: u32,
        ) -> StrResult<MockHandle> {
            self.calls.borrow_mut().push(ExtensionCall::CreateView(
                pattern.label().to_owned(),
                array_size,
            ));
            Ok(device.create_object(&format!("shading rate view {}", pattern.label())))
        }

        fn bind_view(&mut self, _: &MockContext, view: &MockHandle) -> StrResult {
            self.calls
                .borrow_mut()
                .push(ExtensionCall::BindView(view.label().to_owned()));
            if self.fail_bind {
                trace_str!("bind failed")
            } else {
                Ok(())
            }
        }

        fn set_viewport_rates(&mut self, _: &MockContext, rates: &[ViewportShadingRate]) -> StrResult {
            self.calls
                .borrow_mut()
                .push(ExtensionCall::SetRates(rates.to_vec()));
            Ok(())
        }

        fn unload(&mut self) {
            self.calls.borrow_mut().push(ExtensionCall::Unload);
        }
    }

    fn setup(
        extension: Option<MockExtension>,
    ) -> (MockDevice, Arc<SettingsStore>, FoveationEngine<Mock, MockExtension>) {
        let device = MockDevice::new();
        let mut settings = Settings::default();
        settings.fixed_foveated.enabled = true;
        let settings = Arc::new(SettingsStore::new(settings));
        let engine = FoveationEngine::new(settings.clone(), device.clone(), extension).unwrap();
        (device, settings, engine)
    }

    fn enabled_rates(favor_horizontal: bool) -> ExtensionCall {
        ExtensionCall::SetRates(vec![ViewportShadingRate::foveated(favor_horizontal); 2])
    }

    fn disabled_rates() -> ExtensionCall {
        ExtensionCall::SetRates(vec![ViewportShadingRate::disabled(); 2])
    }

    #[test]
    fn distance_bands() {
        let thresholds = BandThresholds::from(&FixedFoveatedDesc::default());
        let bands = [0.5, 0.7, 0.9, 1.1]
            .iter()
            .map(|&distance| distance_to_band(distance, &thresholds))
            .collect::<Vec<_>>();
        assert_eq!(bands, vec![0, 1, 2, 3]);
    }

    #[test]
    fn shading_rate_tables() {
        let horizontal = ViewportShadingRate::foveated(true);
        assert!(horizontal.enabled);
        assert_eq!(&horizontal.table[..5], &[RATE_1X1, RATE_2X1, RATE_2X2, RATE_4X4, RATE_1X1]);
        assert!(horizontal.table[4..].iter().all(|&rate| rate == RATE_1X1));
        assert_eq!(ViewportShadingRate::foveated(false).table[1], RATE_1X2);
        assert_eq!(ViewportShadingRate::disabled().table, [0; SHADING_RATE_TABLE_SIZE]);
    }

    #[test]
    fn single_eye_bands_from_tile_centers() {
        let thresholds = BandThresholds::from(&FixedFoveatedDesc::default());
        let pattern = single_eye_pattern(4, 4, ProjectionCenter::default(), &thresholds);
        assert_eq!(
            pattern,
            vec![
                3, 1, 1, 3, //
                1, 0, 0, 1, //
                1, 0, 0, 1, //
                3, 1, 1, 3,
            ]
        );
    }

    #[test]
    fn combined_halves_use_their_own_center() {
        let thresholds = BandThresholds::from(&FixedFoveatedDesc::default());
        let centers = [
            ProjectionCenter { x: 0.125, y: 0.5 },
            ProjectionCenter { x: 0.875, y: 0.5 },
        ];
        let pattern = combined_pattern(8, 1, &centers, &thresholds);
        assert_eq!(pattern, vec![0, 0, 3, 3, 3, 3, 0, 0]);
    }

    #[test]
    fn combined_target_is_armed_and_cached() {
        let extension = MockExtension::default();
        let calls = extension.calls.clone();
        let (device, _, mut engine) = setup(Some(extension));
        engine.update_target_information(2000, 1000, TextureMode::Combined, [ProjectionCenter::default(); 2]);

        let target = render_target(2000, 1000, 1);
        engine.on_render_targets_bound(Some(&target));
        engine.on_render_targets_bound(Some(&target));

        assert_eq!(device.created(), vec!["texture 126x64x1".to_owned()]);
        assert_eq!(engine.rebuild_count(), 1);
        assert_eq!(
            *calls.borrow(),
            vec![
                ExtensionCall::CreateView("texture 126x64x1".into(), 1),
                ExtensionCall::BindView("shading rate view texture 126x64x1".into()),
                enabled_rates(true),
                ExtensionCall::BindView("shading rate view texture 126x64x1".into()),
                enabled_rates(true),
            ]
        );

        // new projection centers invalidate the pattern
        engine.update_target_information(
            2000,
            1000,
            TextureMode::Combined,
            [ProjectionCenter { x: 0.45, y: 0.5 }, ProjectionCenter { x: 0.55, y: 0.5 }],
        );
        engine.on_render_targets_bound(Some(&target));
        assert_eq!(engine.rebuild_count(), 2);
    }

    #[test]
    fn array_pattern_is_uploaded_per_slice() {
        let (device, _, mut engine) = setup(Some(MockExtension::default()));
        let centers = [
            ProjectionCenter { x: 0.3, y: 0.2 },
            ProjectionCenter { x: 0.7, y: 0.25 },
        ];
        engine.update_target_information(1000, 1100, TextureMode::Array, centers);
        engine.on_render_targets_bound(Some(&render_target(1000, 1100, 2)));

        let uploads = device.uploads();
        assert_eq!(uploads.len(), 2);
        assert!(uploads.iter().all(|(label, _)| label == "texture 63x69x2"));
        assert_ne!(uploads[0].1, uploads[1].1);

        // slices are flipped vertically
        let thresholds = BandThresholds::from(&FixedFoveatedDesc::default());
        for &eye in Eye::BOTH.iter() {
            let center = centers[eye.index()];
            let flipped = ProjectionCenter {
                x: center.x,
                y: 1. - center.y,
            };
            assert_eq!(
                uploads[eye.index()].1,
                single_eye_pattern(63, 69, flipped, &thresholds)
            );
        }
    }

    #[test]
    fn single_eye_targets_follow_the_learned_order() {
        let extension = MockExtension::default();
        let calls = extension.calls.clone();
        let (device, _, mut engine) = setup(Some(extension));
        engine.update_target_information(1000, 1100, TextureMode::Single, [ProjectionCenter::default(); 2]);
        let target = render_target(1000, 1100, 1);

        engine.on_render_targets_bound(Some(&target));
        engine.on_render_targets_bound(Some(&target));
        assert_eq!(*calls.borrow(), vec![disabled_rates(), disabled_rates()]);
        engine.end_frame();

        engine.on_render_targets_bound(Some(&target));
        engine.on_render_targets_bound(Some(&target));
        assert_eq!(engine.rebuild_count(), 2);
        assert_eq!(device.created_count("texture 63x69x1"), 2);
    }

    #[test]
    fn disarmed_for_other_targets_and_when_disabled() {
        let extension = MockExtension::default();
        let calls = extension.calls.clone();
        let (device, settings, mut engine) = setup(Some(extension));
        engine.update_target_information(2000, 1000, TextureMode::Combined, [ProjectionCenter::default(); 2]);

        engine.on_render_targets_bound(Some(&render_target(1024, 1024, 1)));
        engine.on_render_targets_bound(None);
        settings.update(|settings| settings.fixed_foveated.enabled = false);
        engine.on_render_targets_bound(Some(&render_target(2000, 1000, 1)));

        assert_eq!(*calls.borrow(), vec![disabled_rates(); 3]);
        assert!(device.created().is_empty());
    }

    #[test]
    fn failure_shuts_down_for_good() {
        let extension = MockExtension {
            fail_bind: true,
            ..Default::default()
        };
        let calls = extension.calls.clone();
        let (_, _, mut engine) = setup(Some(extension));
        engine.update_target_information(2000, 1000, TextureMode::Combined, [ProjectionCenter::default(); 2]);

        engine.on_render_targets_bound(Some(&render_target(2000, 1000, 1)));
        assert!(!engine.is_active());
        assert_eq!(calls.borrow().last(), Some(&ExtensionCall::Unload));

        let count = calls.borrow().len();
        engine.on_render_targets_bound(Some(&render_target(2000, 1000, 1)));
        assert_eq!(calls.borrow().len(), count);
    }

    #[test]
    fn inactive_without_extension() {
        let (device, _, mut engine) = setup(None);
        engine.update_target_information(2000, 1000, TextureMode::Combined, [ProjectionCenter::default(); 2]);
        engine.on_render_targets_bound(Some(&render_target(2000, 1000, 1)));
        assert!(device.created().is_empty());
        assert!(engine
            .ensure_built(PatternKind::Combined, 2000, 1000, &[ProjectionCenter::default(); 2])
            .is_err());
    }

    #[test]
    fn listens_to_render_target_binds() {
        let extension = MockExtension::default();
        let calls = extension.calls.clone();
        let (device, _, mut engine) = setup(Some(extension));
        engine.update_target_information(2000, 1000, TextureMode::Combined, [ProjectionCenter::default(); 2]);

        let view = device.create_render_target(render_target(2000, 1000, 1));
        engine.post_om_set_render_targets(&[Some(view)], None);
        assert_eq!(calls.borrow().last(), Some(&enabled_rates(true)));

        engine.post_om_set_render_targets(&[], None);
        assert_eq!(calls.borrow().last(), Some(&disabled_rates()));
    }
}
