use super::*;
use crate::*;
use log::*;
use parking_lot::RwLock;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

const ADJUSTMENT_STEP: f32 = 0.05;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SettingsAction {
    CycleUpscaleMethod,
    IncreaseRadius,
    DecreaseRadius,
    IncreaseSharpness,
    DecreaseSharpness,
    ToggleDebugMode,
    ToggleMipBias,
    ToggleFixedFoveated,
    ToggleFavorHorizontal,
}

impl SettingsAction {
    pub fn apply(self, settings: &mut Settings) {
        let upscaling = &mut settings.upscaling;
        let foveated = &mut settings.fixed_foveated;
        match self {
            SettingsAction::CycleUpscaleMethod => {
                upscaling.method = upscaling.method.next();
                info!("Upscaling method: {:?}", upscaling.method);
            }
            SettingsAction::IncreaseRadius => {
                upscaling.radius += ADJUSTMENT_STEP;
                info!("Upscaling radius: {:.2}", upscaling.radius);
            }
            SettingsAction::DecreaseRadius => {
                upscaling.radius = (upscaling.radius - ADJUSTMENT_STEP).max(0.);
                info!("Upscaling radius: {:.2}", upscaling.radius);
            }
            SettingsAction::IncreaseSharpness => {
                upscaling.sharpness = (upscaling.sharpness + ADJUSTMENT_STEP).min(1.);
                info!("Upscaling sharpness: {:.2}", upscaling.sharpness);
            }
            SettingsAction::DecreaseSharpness => {
                upscaling.sharpness = (upscaling.sharpness - ADJUSTMENT_STEP).max(0.);
                info!("Upscaling sharpness: {:.2}", upscaling.sharpness);
            }
            SettingsAction::ToggleDebugMode => {
                settings.debug_mode = !settings.debug_mode;
                info!("Debug mode: {}", settings.debug_mode);
            }
            SettingsAction::ToggleMipBias => {
                upscaling.apply_mip_bias = !upscaling.apply_mip_bias;
                info!("MIP LOD bias: {}", upscaling.apply_mip_bias);
            }
            SettingsAction::ToggleFixedFoveated => {
                foveated.enabled = !foveated.enabled;
                info!("Fixed foveated rendering: {}", foveated.enabled);
            }
            SettingsAction::ToggleFavorHorizontal => {
                foveated.favor_horizontal = !foveated.favor_horizontal;
                info!("Favor horizontal shading rate: {}", foveated.favor_horizontal);
            }
        }
    }
}

/// Shared, refreshable settings. Readers take a snapshot and keep using it for the whole
/// operation, so a concurrent update only becomes visible from the next operation on.
pub struct SettingsStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<Settings>>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(settings)),
        }
    }

    // Falls back to the defaults when the file is missing or malformed.
    pub fn load(path: &Path) -> Self {
        let settings = match load_settings(path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Could not load settings, using defaults: {}", e);
                Settings::default()
            }
        };
        info!("Settings: {:?}", settings);

        Self {
            path: Some(path.to_owned()),
            current: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current.read().clone()
    }

    pub fn update(&self, update_fn: impl FnOnce(&mut Settings)) {
        let mut current = self.current.write();
        let mut settings = (**current).clone();
        update_fn(&mut settings);
        *current = Arc::new(settings);
    }

    pub fn apply(&self, action: SettingsAction) {
        self.update(|settings| action.apply(settings));
    }

    pub fn reload(&self) -> StrResult {
        if let Some(path) = &self.path {
            let settings = load_settings(path)?;
            info!("Settings reloaded: {:?}", settings);
            *self.current.write() = Arc::new(settings);
        }
        Ok(())
    }
}
