//! Texture to canvas projection backends.
//!
//! [`quad_warp::QuadWarp`] approximates perspective with affine strips;
//! [`scene::Scene`] ray-casts a lit textured plane through a camera. The two
//! are calibrated independently and are not expected to agree numerically.

pub mod quad_warp;
pub mod scene;
pub mod shading;

use crate::error::PipelineError;
use crate::tiling::Texture;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

pub use quad_warp::{Quad, QuadWarp, SampleFilter};
pub use scene::{Camera, LightingControls, PlaneMesh, Scene, SceneConfig};

pub trait Projector: Send {
    fn name(&self) -> &'static str;

    /// Renders `texture` into a canvas of the given size. Zero-area input
    /// yields a transparent canvas rather than an error.
    fn project(
        &mut self,
        texture: &Texture,
        canvas_width: u32,
        canvas_height: u32,
    ) -> Result<RgbaImage, PipelineError>;

    /// Lighting sliders; backends without lights ignore them.
    fn apply_lighting(&mut self, _lighting: &LightingControls) {}

    /// Frees whatever the last `project` left bound to the texture.
    fn release_texture(&mut self) {}
}

pub(crate) fn empty_canvas(width: u32, height: u32) -> RgbaImage {
    RgbaImage::new(width, height)
}

/// Serializable backend selection with its calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BackendConfig {
    QuadWarp(QuadWarp),
    Scene(SceneConfig),
}

impl BackendConfig {
    pub fn into_projector(self) -> Box<dyn Projector> {
        match self {
            Self::QuadWarp(warp) => Box::new(warp),
            Self::Scene(config) => Box::new(Scene::new(config)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::QuadWarp(_) => "quad-warp",
            Self::Scene(_) => "scene",
        }
    }

    /// Calibrated lighting, for backends that are lit.
    pub fn lighting(&self) -> Option<LightingControls> {
        match self {
            Self::QuadWarp(_) => None,
            Self::Scene(config) => Some(config.lighting),
        }
    }
}
