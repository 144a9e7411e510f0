use crate::*;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, path::*};

const TRACE_CONTEXT: &str = "Settings";

const MIN_RENDER_SCALE: f32 = 0.5;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum UpscaleMethod {
    Fsr,
    Nis,
    Cas,
}

impl UpscaleMethod {
    pub fn next(self) -> Self {
        match self {
            UpscaleMethod::Fsr => UpscaleMethod::Nis,
            UpscaleMethod::Nis => UpscaleMethod::Cas,
            UpscaleMethod::Cas => UpscaleMethod::Fsr,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default)]
pub struct UpscalingDesc {
    pub enabled: bool,
    pub method: UpscaleMethod,
    pub render_scale: f32,
    pub sharpness: f32,

    // Fraction of the image (relative to half its height) that receives the full upscaling
    // treatment; outside of it a cheaper filter is used.
    pub radius: f32,

    pub apply_mip_bias: bool,
}

impl Default for UpscalingDesc {
    fn default() -> Self {
        Self {
            enabled: false,
            method: UpscaleMethod::Fsr,
            render_scale: 1.,
            sharpness: 0.7,
            radius: 0.6,
            apply_mip_bias: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum FoveatedMethod {
    Vrs,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default)]
pub struct FixedFoveatedDesc {
    pub enabled: bool,
    pub method: FoveatedMethod,
    pub favor_horizontal: bool,
    pub inner_radius: f32,
    pub mid_radius: f32,
    pub outer_radius: f32,

    // Sequence of 'L', 'R' and 'S' labels, one for each single-eye render target bound during a
    // frame. Ignored when its length does not match the observed number of binds.
    pub override_single_eye_order: String,
}

impl Default for FixedFoveatedDesc {
    fn default() -> Self {
        Self {
            enabled: false,
            method: FoveatedMethod::Vrs,
            favor_horizontal: true,
            inner_radius: 0.6,
            mid_radius: 0.8,
            outer_radius: 1.,
            override_single_eye_order: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default)]
pub struct ClassifierDesc {
    pub resolution_tolerance: u32,
    pub reject_square_targets: bool,
}

impl Default for ClassifierDesc {
    fn default() -> Self {
        Self {
            resolution_tolerance: 2,
            reject_square_targets: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Default, Debug)]
#[serde(default)]
pub struct Settings {
    pub upscaling: UpscalingDesc,
    pub fixed_foveated: FixedFoveatedDesc,
    pub classifier: ClassifierDesc,
    pub debug_mode: bool,
}

impl Settings {
    pub fn sanitized(mut self) -> Self {
        if self.upscaling.render_scale < MIN_RENDER_SCALE {
            warn!(
                "Render scale {} is too low, using {}",
                self.upscaling.render_scale, MIN_RENDER_SCALE
            );
            self.upscaling.render_scale = MIN_RENDER_SCALE;
        }
        self.upscaling.sharpness = self.upscaling.sharpness.max(0.);
        self.upscaling.radius = self.upscaling.radius.max(0.);
        self
    }
}

pub fn parse_settings(json_text: &str) -> StrResult<Settings> {
    Ok(trace_err!(serde_json::from_str::<Settings>(json_text))?.sanitized())
}

pub fn load_settings(path: &Path) -> StrResult<Settings> {
    parse_settings(&trace_err!(fs::read_to_string(path))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let settings = parse_settings(r#"{ "upscaling": { "enabled": true, "method": "Nis" } }"#)
            .unwrap();

        assert!(settings.upscaling.enabled);
        assert_eq!(settings.upscaling.method, UpscaleMethod::Nis);
        assert_eq!(settings.upscaling.render_scale, 1.);
        assert_eq!(settings.upscaling.sharpness, 0.7);
        assert!(settings.upscaling.apply_mip_bias);
        assert_eq!(settings.fixed_foveated, FixedFoveatedDesc::default());
        assert_eq!(settings.classifier.resolution_tolerance, 2);
        assert!(!settings.debug_mode);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let settings = parse_settings(
            r#"{ "upscaling": { "render_scale": 0.2, "sharpness": -1.0, "radius": -0.5 } }"#,
        )
        .unwrap();

        assert_eq!(settings.upscaling.render_scale, 0.5);
        assert_eq!(settings.upscaling.sharpness, 0.);
        assert_eq!(settings.upscaling.radius, 0.);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_settings("{ upscaling: ").is_err());
        assert!(load_settings(Path::new("/nonexistent/vrfx.json")).is_err());
    }

    #[test]
    fn method_cycle() {
        assert_eq!(UpscaleMethod::Fsr.next(), UpscaleMethod::Nis);
        assert_eq!(UpscaleMethod::Nis.next(), UpscaleMethod::Cas);
        assert_eq!(UpscaleMethod::Cas.next(), UpscaleMethod::Fsr);
    }
}
