mod settings;
mod store;

use serde::{Deserialize, Serialize};

pub use settings::*;
pub use store::*;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }
}

/// How the two eye images are laid out in the textures handed to the VR runtime.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum TextureMode {
    /// One texture per eye.
    Single,
    /// Both eyes side by side in one texture.
    Combined,
    /// One texture with an array slice per eye.
    Array,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, Debug, Hash)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Point of a per-eye image (normalized to [0, 1]) the optical axis passes through.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug)]
pub struct ProjectionCenter {
    pub x: f32,
    pub y: f32,
}

impl Default for ProjectionCenter {
    fn default() -> Self {
        Self { x: 0.5, y: 0.5 }
    }
}

pub type ProjectionCenters = [ProjectionCenter; 2];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_equality_is_structural() {
        let viewport = Viewport::new(10, 20, 300, 400);
        assert_eq!(viewport, viewport);
        assert_eq!(viewport, Viewport::new(10, 20, 300, 400));

        let mutations: [fn(&mut Viewport); 4] = [
            |v| v.x += 1,
            |v| v.y += 1,
            |v| v.width += 1,
            |v| v.height += 1,
        ];
        for mutate in mutations.iter() {
            let mut changed = viewport;
            mutate(&mut changed);
            assert_ne!(changed, viewport);
        }
    }
}

