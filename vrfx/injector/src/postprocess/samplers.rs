use crate::graphics::*;
use log::*;
use std::collections::{HashMap, HashSet};

/// Replaces the host's anisotropic samplers with copies carrying a negative MIP LOD bias, so that
/// textures keep the sharpness of the upscaled output resolution.
pub struct SamplerRewriter<B: Backend> {
    pass_through: HashSet<B::SamplerState>,
    replacements: HashMap<B::SamplerState, B::SamplerState>,
}

impl<B: Backend> Default for SamplerRewriter<B> {
    fn default() -> Self {
        Self {
            pass_through: HashSet::new(),
            replacements: HashMap::new(),
        }
    }
}

impl<B: Backend> SamplerRewriter<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self) {
        self.pass_through.clear();
        self.replacements.clear();
    }

    pub fn replacement_count(&self) -> usize {
        self.replacements.len()
    }

    /// The sampler list to bind instead of `samplers`, or `None` when rewriting is disabled.
    pub fn rewrite(
        &mut self,
        device: &B::Device,
        samplers: &[Option<B::SamplerState>],
        mip_lod_bias: f32,
        enabled: bool,
    ) -> Option<Vec<Option<B::SamplerState>>> {
        if !enabled {
            self.invalidate();
            return None;
        }

        let rewritten = samplers
            .iter()
            .map(|sampler| {
                sampler
                    .as_ref()
                    .map(|sampler| self.replacement(device, sampler, mip_lod_bias))
            })
            .collect();

        Some(rewritten)
    }

    fn replacement(
        &mut self,
        device: &B::Device,
        sampler: &B::SamplerState,
        mip_lod_bias: f32,
    ) -> B::SamplerState {
        if self.pass_through.contains(sampler) {
            return sampler.clone();
        }
        if let Some(replacement) = self.replacements.get(sampler) {
            return replacement.clone();
        }

        let mut desc = B::sampler_desc(sampler);
        // samplers that are already biased or not anisotropic are left alone
        if desc.mip_lod_bias != 0. || desc.max_anisotropy == 1 {
            self.pass_through.insert(sampler.clone());
            return sampler.clone();
        }

        desc.mip_lod_bias = mip_lod_bias;
        match device.create_sampler(&desc) {
            Ok(replacement) => {
                info!(
                    "Creating replacement sampler for {:?} with MIP LOD bias {}",
                    sampler, mip_lod_bias
                );
                self.pass_through.insert(replacement.clone());
                self.replacements.insert(sampler.clone(), replacement.clone());
                replacement
            }
            Err(e) => {
                warn!("Cannot create replacement sampler: {}", e);
                self.pass_through.insert(sampler.clone());
                sampler.clone()
            }
        }
    }
}
