use crate::graphics::{RenderTargetInfo, ViewDimension};
use log::*;
use vrfx_common::data::*;

/// Which part of the stereo image a render target bind draws into.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TargetClass {
    /// Not an eye target (shadow map, UI, post-process buffer...).
    Opaque,
    /// Both eyes side by side.
    Combined,
    /// One array slice per eye.
    Array,
    SingleEye(Eye),
    /// Eye-sized target whose eye could not be determined.
    UnknownSingle,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClassifierPolicy {
    pub resolution_tolerance: u32,
    pub reject_square_targets: bool,
}

impl From<&ClassifierDesc> for ClassifierPolicy {
    fn from(desc: &ClassifierDesc) -> Self {
        Self {
            resolution_tolerance: desc.resolution_tolerance,
            reject_square_targets: desc.reject_square_targets,
        }
    }
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        (&ClassifierDesc::default()).into()
    }
}

/// Matches render target binds against the eye texture geometry submitted to the VR runtime.
/// Games that render each eye into its own texture are told apart only by bind order, which is
/// learned over the previous frame.
pub struct EyeClassifier {
    target_width: u32,
    target_height: u32,
    target_mode: TextureMode,
    single_eye_order: Vec<u8>,
    single_eye_count: usize,
}

impl Default for EyeClassifier {
    fn default() -> Self {
        Self {
            target_width: 0,
            target_height: 0,
            target_mode: TextureMode::Single,
            single_eye_order: vec![],
            single_eye_count: 0,
        }
    }
}

impl EyeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_target(&mut self, width: u32, height: u32, mode: TextureMode) {
        self.target_width = width;
        self.target_height = height;
        self.target_mode = mode;
    }

    pub fn single_eye_order(&self) -> String {
        String::from_utf8_lossy(&self.single_eye_order).into_owned()
    }

    pub fn classify(&mut self, target: &RenderTargetInfo, policy: &ClassifierPolicy) -> TargetClass {
        if !target.dimension.is_texture_2d() {
            return TargetClass::Opaque;
        }
        // most likely a shadow map
        if policy.reject_square_targets && target.width == target.height {
            return TargetClass::Opaque;
        }

        let matches = |actual: u32, expected: u32| {
            actual >= expected && actual <= expected + policy.resolution_tolerance
        };
        let width_matches = matches(target.width, self.target_width);
        let height_matches = matches(target.height, self.target_height);

        match self.target_mode {
            TextureMode::Single if matches(target.width, 2 * self.target_width) && height_matches => {
                TargetClass::Combined
            }
            TextureMode::Combined if width_matches && height_matches => TargetClass::Combined,
            mode if mode != TextureMode::Combined
                && target.array_size == 2
                && width_matches
                && height_matches =>
            {
                TargetClass::Array
            }
            TextureMode::Single if target.array_size == 1 && width_matches && height_matches => {
                let class = match self.single_eye_order.get(self.single_eye_count) {
                    Some(b'L') | Some(b'l') => TargetClass::SingleEye(Eye::Left),
                    Some(b'R') | Some(b'r') => TargetClass::SingleEye(Eye::Right),
                    Some(_) => TargetClass::UnknownSingle,
                    None => {
                        debug!("Single eye target, don't know which eye");
                        TargetClass::UnknownSingle
                    }
                };
                self.single_eye_count += 1;
                class
            }
            _ => TargetClass::Opaque,
        }
    }

    /// Update the eye order guess from the single eye binds seen during the frame that just ended.
    pub fn end_frame(&mut self, order_override: &str) {
        let count = self.single_eye_count;
        self.single_eye_count = 0;

        if count == 0 || count == self.single_eye_order.len() {
            return;
        }

        debug!("Found {} single eye render targets in current frame", count);
        let mut order = vec![b'L'; count / 2];
        order.extend(vec![b'R'; count / 2]);
        order.resize(count, b'S');
        debug!("Guessing order of render targets as {}", String::from_utf8_lossy(&order));

        if !order_override.is_empty() {
            if order_override.len() == count {
                debug!("Overriding order with {}", order_override);
                order = order_override.as_bytes().to_vec();
            } else {
                debug!(
                    "Configured order {} does not match the number of render targets",
                    order_override
                );
            }
        }

        self.single_eye_order = order;
    }
}

#[cfg(test)]
pub fn render_target(width: u32, height: u32, array_size: u32) -> RenderTargetInfo {
    RenderTargetInfo {
        dimension: if array_size > 1 {
            ViewDimension::Texture2DArray
        } else {
            ViewDimension::Texture2D
        },
        width,
        height,
        array_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(width: u32, height: u32, mode: TextureMode) -> EyeClassifier {
        let mut classifier = EyeClassifier::new();
        classifier.set_target(width, height, mode);
        classifier
    }

    #[test]
    fn tolerance_window() {
        let policy = ClassifierPolicy::default();
        let mut classifier = classifier(1000, 1100, TextureMode::Combined);

        let classes = [999, 1000, 1001, 1002, 1003]
            .iter()
            .map(|&w| classifier.classify(&render_target(w, 1100, 1), &policy))
            .collect::<Vec<_>>();
        assert_eq!(
            classes,
            vec![
                TargetClass::Opaque,
                TargetClass::Combined,
                TargetClass::Combined,
                TargetClass::Combined,
                TargetClass::Opaque
            ]
        );

        let wide_policy = ClassifierPolicy {
            resolution_tolerance: 4,
            ..policy
        };
        assert_eq!(
            classifier.classify(&render_target(1003, 1100, 1), &wide_policy),
            TargetClass::Combined
        );
    }

    #[test]
    fn square_targets_and_other_dimensions_are_opaque() {
        let policy = ClassifierPolicy::default();
        let mut classifier = classifier(1000, 1000, TextureMode::Combined);
        assert_eq!(
            classifier.classify(&render_target(1000, 1000, 1), &policy),
            TargetClass::Opaque
        );

        let permissive = ClassifierPolicy {
            reject_square_targets: false,
            ..policy
        };
        assert_eq!(
            classifier.classify(&render_target(1000, 1000, 1), &permissive),
            TargetClass::Combined
        );

        let mut target = render_target(1000, 1000, 1);
        target.dimension = ViewDimension::Texture3D;
        assert_eq!(classifier.classify(&target, &permissive), TargetClass::Opaque);
    }

    #[test]
    fn combined_and_array() {
        let policy = ClassifierPolicy::default();

        let mut single = classifier(1000, 1100, TextureMode::Single);
        assert_eq!(
            single.classify(&render_target(2000, 1100, 1), &policy),
            TargetClass::Combined
        );
        assert_eq!(
            single.classify(&render_target(1000, 1100, 2), &policy),
            TargetClass::Array
        );

        let mut array = classifier(1000, 1100, TextureMode::Array);
        assert_eq!(
            array.classify(&render_target(1001, 1101, 2), &policy),
            TargetClass::Array
        );
        assert_eq!(
            array.classify(&render_target(1000, 1100, 1), &policy),
            TargetClass::Opaque
        );

        let mut combined = classifier(2000, 1100, TextureMode::Combined);
        assert_eq!(
            combined.classify(&render_target(2000, 1100, 2), &policy),
            TargetClass::Combined
        );
    }

    #[test]
    fn single_eye_order_is_learned() {
        let policy = ClassifierPolicy::default();
        let mut classifier = classifier(1000, 1100, TextureMode::Single);
        let eye_target = render_target(1000, 1100, 1);

        // first frame: nothing known yet
        for _ in 0..4 {
            assert_eq!(
                classifier.classify(&eye_target, &policy),
                TargetClass::UnknownSingle
            );
        }
        classifier.end_frame("");
        assert_eq!(classifier.single_eye_order(), "LLRR");

        let classes = (0..5)
            .map(|_| classifier.classify(&eye_target, &policy))
            .collect::<Vec<_>>();
        assert_eq!(
            classes,
            vec![
                TargetClass::SingleEye(Eye::Left),
                TargetClass::SingleEye(Eye::Left),
                TargetClass::SingleEye(Eye::Right),
                TargetClass::SingleEye(Eye::Right),
                TargetClass::UnknownSingle,
            ]
        );

        classifier.end_frame("");
        assert_eq!(classifier.single_eye_order(), "LLRRS");
    }

    #[test]
    fn end_frame_keeps_matching_guess() {
        let policy = ClassifierPolicy::default();
        let mut classifier = classifier(1000, 1100, TextureMode::Single);
        let eye_target = render_target(1000, 1100, 1);

        classifier.classify(&eye_target, &policy);
        classifier.classify(&eye_target, &policy);
        classifier.end_frame("");
        assert_eq!(classifier.single_eye_order(), "LR");

        // same count: the (possibly overridden) order is kept
        classifier.classify(&eye_target, &policy);
        classifier.classify(&eye_target, &policy);
        classifier.end_frame("RL");
        assert_eq!(classifier.single_eye_order(), "LR");

        // no single eye targets at all: unchanged
        classifier.end_frame("");
        assert_eq!(classifier.single_eye_order(), "LR");
    }

    #[test]
    fn order_override() {
        let policy = ClassifierPolicy::default();
        let mut classifier = classifier(1000, 1100, TextureMode::Single);
        let eye_target = render_target(1000, 1100, 1);

        for _ in 0..3 {
            classifier.classify(&eye_target, &policy);
        }
        classifier.end_frame("RSL");
        assert_eq!(classifier.single_eye_order(), "RSL");
        assert_eq!(
            classifier.classify(&eye_target, &policy),
            TargetClass::SingleEye(Eye::Right)
        );
        assert_eq!(
            classifier.classify(&eye_target, &policy),
            TargetClass::UnknownSingle
        );
        assert_eq!(
            classifier.classify(&eye_target, &policy),
            TargetClass::SingleEye(Eye::Left)
        );
        classifier.end_frame("");
        assert_eq!(classifier.single_eye_order(), "RSL");

        // length mismatch: the override is ignored
        for _ in 0..4 {
            classifier.classify(&eye_target, &policy);
        }
        classifier.end_frame("RL");
        assert_eq!(classifier.single_eye_order(), "LLRR");
    }

    #[test]
    fn odd_count_falls_back_to_left_right_unknown() {
        let policy = ClassifierPolicy::default();
        let mut classifier = classifier(1000, 1100, TextureMode::Single);
        let eye_target = render_target(1000, 1100, 1);

        for _ in 0..3 {
            classifier.classify(&eye_target, &policy);
        }
        classifier.end_frame("");
        assert_eq!(classifier.single_eye_order(), "LRS");

        let classes = (0..3)
            .map(|_| classifier.classify(&eye_target, &policy))
            .collect::<Vec<_>>();
        assert_eq!(
            classes,
            vec![
                TargetClass::SingleEye(Eye::Left),
                TargetClass::SingleEye(Eye::Right),
                TargetClass::UnknownSingle,
            ]
        );
    }

    #[test]
    fn identical_frames_are_labelled_identically() {
        let policy = ClassifierPolicy::default();
        let mut classifier = classifier(1000, 1100, TextureMode::Single);
        let frame = [
            render_target(1000, 1100, 1),
            render_target(2000, 1100, 1),
            render_target(1000, 1100, 1),
            render_target(640, 480, 1),
            render_target(1000, 1100, 1),
            render_target(1000, 1100, 1),
        ];

        let run_frame = |classifier: &mut EyeClassifier| {
            let classes = frame
                .iter()
                .map(|target| classifier.classify(target, &policy))
                .collect::<Vec<_>>();
            classifier.end_frame("");
            classes
        };

        run_frame(&mut classifier);
        let second = run_frame(&mut classifier);
        let third = run_frame(&mut classifier);
        assert_eq!(second, third);
        assert_eq!(
            second,
            vec![
                TargetClass::SingleEye(Eye::Left),
                TargetClass::Combined,
                TargetClass::SingleEye(Eye::Left),
                TargetClass::Opaque,
                TargetClass::SingleEye(Eye::Right),
                TargetClass::SingleEye(Eye::Right),
            ]
        );
    }
}
