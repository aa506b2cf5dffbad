//! Room manifests and loading of their raster assets.

use crate::asset_cache::{load_bitmap, AssetCache};
use crate::compositor::{FloorRule, RoomAsset};
use crate::error::{Notice, PipelineError};
use crate::projection::{BackendConfig, Quad, QuadWarp, SceneConfig};
use glam::Vec2;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const CANVAS_WIDTH: u32 = 1366;
pub const CANVAS_HEIGHT: u32 = 768;

fn default_canvas_width() -> u32 {
    CANVAS_WIDTH
}

fn default_canvas_height() -> u32 {
    CANVAS_HEIGHT
}

fn default_shadow_intensity() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomManifest {
    pub name: String,
    #[serde(default = "default_canvas_width")]
    pub canvas_width: u32,
    #[serde(default = "default_canvas_height")]
    pub canvas_height: u32,
    pub base_image: String,
    #[serde(default)]
    pub mask_image: Option<String>,
    #[serde(default)]
    pub shadow_image: Option<String>,
    #[serde(default = "default_shadow_intensity")]
    pub shadow_intensity: f32,
    #[serde(default)]
    pub floor_rule: FloorRule,
    pub backend: BackendConfig,
}

impl RoomManifest {
    /// Perspective kitchen: near-black floor area keyed from the photo.
    pub fn kitchen(base_image: &str) -> Self {
        Self {
            name: "kitchen".to_string(),
            canvas_width: CANVAS_WIDTH,
            canvas_height: CANVAS_HEIGHT,
            base_image: base_image.to_string(),
            mask_image: None,
            shadow_image: None,
            shadow_intensity: 1.0,
            floor_rule: FloorRule::Threshold {
                threshold: 25,
                average_below: Some(10),
            },
            backend: BackendConfig::Scene(SceneConfig::kitchen()),
        }
    }

    /// Orthographic living room with a magenta floor mask and baked shadows.
    pub fn living_room(base_image: &str, mask_image: &str, shadow_image: &str) -> Self {
        Self {
            name: "living-room".to_string(),
            canvas_width: CANVAS_WIDTH,
            canvas_height: CANVAS_HEIGHT,
            base_image: base_image.to_string(),
            mask_image: Some(mask_image.to_string()),
            shadow_image: Some(shadow_image.to_string()),
            shadow_intensity: 1.0,
            floor_rule: FloorRule::magenta_key(),
            backend: BackendConfig::Scene(SceneConfig::living_room()),
        }
    }

    /// Flat 2D preview: an oversized trapezoid turned 40 degrees clockwise
    /// about the canvas center, filled with the pattern at 0.4 scale, under a
    /// brightness mask.
    pub fn quad_preview(base_image: &str, mask_image: &str) -> Self {
        let (w, h) = (CANVAS_WIDTH as f32, CANVAS_HEIGHT as f32);
        let quad = Quad::new(
            Vec2::new(-0.4 * w, -0.1 * h),
            Vec2::new(1.3 * w, 0.05 * h),
            Vec2::new(1.5 * w, 1.2 * h),
            Vec2::new(-0.6 * w, 1.25 * h),
        )
        .rotated_about(Vec2::new(w / 2.0, h / 2.0), 40.0);
        let mut warp = QuadWarp::new(quad);
        warp.pattern_scale = Some(0.4);
        Self {
            name: "quad-preview".to_string(),
            canvas_width: CANVAS_WIDTH,
            canvas_height: CANVAS_HEIGHT,
            base_image: base_image.to_string(),
            mask_image: Some(mask_image.to_string()),
            shadow_image: None,
            shadow_intensity: 0.0,
            floor_rule: FloorRule::MaskBrightness { threshold: 40 },
            backend: BackendConfig::QuadWarp(warp),
        }
    }

    /// Parses a manifest, resolving relative asset paths against `base_dir`.
    pub fn from_json(raw: &str, base_dir: Option<&Path>) -> Result<Self, PipelineError> {
        let mut manifest: RoomManifest = serde_json::from_str(raw)
            .map_err(|e| PipelineError::InvalidParameter(format!("room manifest: {}", e)))?;
        if manifest.canvas_width == 0 || manifest.canvas_height == 0 {
            return Err(PipelineError::InvalidParameter(format!(
                "room {} has an empty canvas",
                manifest.name
            )));
        }
        if let Some(dir) = base_dir {
            manifest.resolve_paths(dir);
        }
        Ok(manifest)
    }

    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| PipelineError::asset_load(&path.to_string_lossy(), e))?;
        Self::from_json(&raw, path.parent())
    }

    fn resolve_paths(&mut self, dir: &Path) {
        let resolve = |key: &mut String| {
            if key.starts_with("data:") || Path::new(key.as_str()).is_absolute() {
                return;
            }
            *key = dir.join(key.as_str()).to_string_lossy().to_string();
        };
        resolve(&mut self.base_image);
        if let Some(mask) = self.mask_image.as_mut() {
            resolve(mask);
        }
        if let Some(shadow) = self.shadow_image.as_mut() {
            resolve(shadow);
        }
    }
}

/// A room ready for compositing, with whatever failed along the way.
#[derive(Debug)]
pub struct LoadedRoom {
    pub manifest: RoomManifest,
    pub asset: RoomAsset,
    pub shadow: Option<Arc<RgbaImage>>,
    pub notices: Vec<Notice>,
}

impl LoadedRoom {
    pub fn canvas_size(&self) -> (u32, u32) {
        (self.manifest.canvas_width, self.manifest.canvas_height)
    }
}

/// Loads every raster a manifest names.
///
/// A missing photo becomes a transparent placeholder and a missing shadow is
/// skipped; an unreadable mask leaves the photo unprocessed. Each recovery
/// adds a notice.
pub async fn load_room(
    cache: &AssetCache<RgbaImage>,
    manifest: RoomManifest,
) -> Result<LoadedRoom, PipelineError> {
    let mut notices = Vec::new();
    let (cw, ch) = (manifest.canvas_width, manifest.canvas_height);

    let photo = match load_bitmap(cache, &manifest.base_image).await {
        Ok(photo) => photo,
        Err(err) => {
            log::warn!("Room photo unavailable, using placeholder: {}", err);
            notices.push(Notice::from_error(&err));
            Arc::new(RgbaImage::new(cw, ch))
        }
    };

    let asset = match &manifest.mask_image {
        Some(key) => match load_bitmap(cache, key).await {
            Ok(mask) => RoomAsset::new(&manifest.name, photo, Some(mask), manifest.floor_rule)?,
            Err(err) => {
                log::warn!("Room mask unavailable, floor left unmasked: {}", err);
                notices.push(Notice::from_error(&err));
                RoomAsset::with_unreadable_mask(
                    &manifest.name,
                    photo,
                    manifest.floor_rule,
                    &err.to_string(),
                )
            }
        },
        None => RoomAsset::new(&manifest.name, photo, None, manifest.floor_rule)?,
    };

    let shadow = match &manifest.shadow_image {
        Some(key) => match load_bitmap(cache, key).await {
            Ok(shadow) => Some(shadow),
            Err(err) => {
                log::warn!("Shadow layer skipped: {}", err);
                notices.push(Notice::from_error(&err));
                None
            }
        },
        None => None,
    };

    if asset.dimensions() != (cw, ch) {
        log::warn!(
            "Room {} photo is {}x{}, canvas is {}x{}",
            manifest.name,
            asset.dimensions().0,
            asset.dimensions().1,
            cw,
            ch
        );
    }

    Ok(LoadedRoom {
        manifest,
        asset,
        shadow,
        notices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use image::Rgba;

    #[test]
    fn presets_serialize_and_parse_back() {
        for manifest in [
            RoomManifest::kitchen("/rooms/kitchen.png"),
            RoomManifest::living_room("/rooms/living.png", "/rooms/mask.png", "/rooms/shadow.png"),
            RoomManifest::quad_preview("/rooms/fabric.png", "/rooms/fabric_mask.png"),
        ] {
            let json = serde_json::to_string_pretty(&manifest).expect("serialize");
            let parsed = RoomManifest::from_json(&json, None).expect("parse");
            assert_eq!(parsed, manifest);
        }
    }

    #[test]
    fn quad_preview_corners_are_rotated_clockwise() {
        let manifest = RoomManifest::quad_preview("fabric.png", "fabric_mask.png");
        let warp = match manifest.backend {
            BackendConfig::QuadWarp(warp) => warp,
            other => panic!("unexpected backend {:?}", other),
        };
        let (w, h) = (CANVAS_WIDTH as f32, CANVAS_HEIGHT as f32);
        let (cx, cy) = (w / 2.0, h / 2.0);
        let (sin, cos) = 40f32.to_radians().sin_cos();
        let expected = [(-0.4, -0.1), (1.3, 0.05), (1.5, 1.2), (-0.6, 1.25)].map(|(fx, fy)| {
            let (dx, dy) = (fx * w - cx, fy * h - cy);
            (cx + dx * cos - dy * sin, cy + dx * sin + dy * cos)
        });
        let got = [warp.quad.p1, warp.quad.p2, warp.quad.p3, warp.quad.p4];
        for (corner, (ex, ey)) in got.iter().zip(expected) {
            assert!((corner.x - ex).abs() < 0.01 && (corner.y - ey).abs() < 0.01, "{corner:?}");
        }
        assert!((got[0].x - 37.4).abs() < 0.5 && (got[0].y + 759.2).abs() < 0.5);
        assert_eq!(warp.pattern_scale, Some(0.4));
    }

    #[test]
    fn relative_paths_resolve_against_manifest_dir() {
        let raw = r#"{
            "name": "test",
            "baseImage": "base.png",
            "maskImage": "/abs/mask.png",
            "floorRule": {"rule": "maskBrightness"},
            "backend": {"kind": "quadWarp", "quad": {"p1": [0,0], "p2": [10,0], "p3": [10,10], "p4": [0,10]}}
        }"#;
        let manifest = RoomManifest::from_json(raw, Some(Path::new("/rooms"))).expect("parse");
        assert_eq!(manifest.base_image, "/rooms/base.png");
        assert_eq!(manifest.mask_image.as_deref(), Some("/abs/mask.png"));
        assert_eq!(manifest.canvas_width, CANVAS_WIDTH);
        assert_eq!(manifest.floor_rule, FloorRule::MaskBrightness { threshold: 40 });
        match manifest.backend {
            BackendConfig::QuadWarp(warp) => assert_eq!(warp.strips, 250),
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn missing_assets_degrade_with_notices() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("base.png");
        RgbaImage::from_pixel(4, 3, Rgba([200, 200, 200, 255]))
            .save(&base)
            .expect("save");

        let mut manifest = RoomManifest::living_room(
            &base.to_string_lossy(),
            &dir.path().join("missing_mask.png").to_string_lossy(),
            &dir.path().join("missing_shadow.png").to_string_lossy(),
        );
        manifest.canvas_width = 4;
        manifest.canvas_height = 3;

        let cache = AssetCache::new();
        let room = smol::block_on(load_room(&cache, manifest)).expect("room");
        assert!(room.shadow.is_none());
        let kinds: Vec<_> = room.notices.iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![FailureKind::AssetLoad, FailureKind::AssetLoad]);
        assert!(room.notices[0].message.contains("missing_mask.png"));
        assert!(room.asset.foreground_layer().pixels().all(|p| p.0[3] == 255));
    }

    #[test]
    fn missing_photo_becomes_transparent_placeholder() {
        let mut manifest = RoomManifest::kitchen("/nowhere/kitchen.png");
        manifest.canvas_width = 5;
        manifest.canvas_height = 2;
        let cache = AssetCache::new();
        let room = smol::block_on(load_room(&cache, manifest)).expect("room");
        assert_eq!(room.asset.dimensions(), (5, 2));
        assert_eq!(room.notices[0].kind, FailureKind::AssetLoad);
    }

    #[test]
    fn empty_canvas_is_rejected() {
        let raw = r#"{"name": "x", "canvasWidth": 0, "baseImage": "a.png",
                      "backend": {"kind": "quadWarp", "quad": {"p1": [0,0], "p2": [1,0], "p3": [1,1], "p4": [0,1]}}}"#;
        assert!(RoomManifest::from_json(raw, None).is_err());
    }
}
