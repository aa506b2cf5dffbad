use crate::catalog::Rgb8;
use crate::error::PipelineError;
use crate::pattern::{PatternDocument, RegionColorMap};
use image::{imageops, Rgba, RgbaImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Edge length of a single rasterised tile. Documents are stretched to fit.
pub const TILE_RASTER_SIZE: u32 = 512;
/// Tiles per axis in the mosaic handed to the projection stage.
pub const DEFAULT_REPEAT: u32 = 4;

/// Tile rotation, clockwise.
///
/// Only quarter turns keep a square tile seamless; free angles are accepted
/// for single-tile previews.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "f32", into = "f32")]
pub enum Rotation {
    QuarterTurns(u8),
    Free(f32),
}

impl Default for Rotation {
    fn default() -> Self {
        Self::QuarterTurns(0)
    }
}

impl Rotation {
    pub fn from_degrees(degrees: f32) -> Self {
        let normalized = degrees.rem_euclid(360.0);
        let turns = normalized / 90.0;
        if (turns - turns.round()).abs() < 1e-4 {
            Self::QuarterTurns((turns.round() as u8) % 4)
        } else {
            Self::Free(normalized)
        }
    }

    pub fn degrees(self) -> f32 {
        match self {
            Self::QuarterTurns(n) => (n % 4) as f32 * 90.0,
            Self::Free(deg) => deg,
        }
    }

    pub fn is_tileable(self) -> bool {
        matches!(self, Self::QuarterTurns(_))
    }

    /// Rotates a tile bitmap about its centre.
    pub fn apply(self, tile: &RgbaImage) -> RgbaImage {
        match self {
            Self::QuarterTurns(n) => match n % 4 {
                1 => imageops::rotate90(tile),
                2 => imageops::rotate180(tile),
                3 => imageops::rotate270(tile),
                _ => tile.clone(),
            },
            Self::Free(deg) => rotate_about_center(
                tile,
                deg.to_radians(),
                Interpolation::Bilinear,
                Rgba([0, 0, 0, 0]),
            ),
        }
    }
}

impl From<f32> for Rotation {
    fn from(degrees: f32) -> Self {
        Self::from_degrees(degrees)
    }
}

impl From<Rotation> for f32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// A seamless bitmap made of `repeat` x `repeat` copies of one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct Texture {
    pub image: RgbaImage,
    pub repeat: u32,
}

impl Texture {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// Flat single-tile stand-in used when the pattern cannot be loaded.
    pub fn placeholder(color: Rgb8) -> Self {
        Self {
            image: RgbaImage::from_pixel(
                TILE_RASTER_SIZE,
                TILE_RASTER_SIZE,
                Rgba([color.red, color.green, color.blue, 255]),
            ),
            repeat: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewMode {
    #[default]
    OneTile,
    FourTiles,
}

impl ViewMode {
    /// Tiles per axis for the flat 2D preview.
    pub fn preview_repeat(self) -> u32 {
        match self {
            Self::OneTile => 1,
            Self::FourTiles => 2,
        }
    }
}

pub fn build_tile(
    doc: &PatternDocument,
    colors: &RegionColorMap,
    default_color: Rgb8,
    rotation: Rotation,
) -> Result<RgbaImage, PipelineError> {
    let start = Instant::now();
    let raster = doc.render(colors, default_color, TILE_RASTER_SIZE, TILE_RASTER_SIZE)?;
    let tile = rotation.apply(&raster);
    log::debug!(
        "Built tile for {} at {} deg in {}ms",
        doc.source_key,
        rotation.degrees(),
        start.elapsed().as_millis()
    );
    Ok(tile)
}

/// Replicates `tile` on a `repeat` x `repeat` grid. Every cell is a copy of
/// the same bitmap, so shared edges line up exactly.
pub fn build_mosaic(tile: &RgbaImage, repeat: u32) -> Result<Texture, PipelineError> {
    if repeat == 0 {
        return Err(PipelineError::InvalidParameter(
            "repeat factor must be at least 1".to_string(),
        ));
    }
    let (tw, th) = tile.dimensions();
    let width = tw.checked_mul(repeat).ok_or_else(|| {
        PipelineError::InvalidParameter(format!("mosaic width overflows: {} x {}", tw, repeat))
    })?;
    let height = th.checked_mul(repeat).ok_or_else(|| {
        PipelineError::InvalidParameter(format!("mosaic height overflows: {} x {}", th, repeat))
    })?;

    let mut image = RgbaImage::new(width, height);
    for row in 0..repeat {
        for col in 0..repeat {
            imageops::replace(
                &mut image,
                tile,
                i64::from(col * tw),
                i64::from(row * th),
            );
        }
    }
    Ok(Texture { image, repeat })
}

/// Tile then mosaic. Rejects angles that would break seamlessness.
pub fn build_texture(
    doc: &PatternDocument,
    colors: &RegionColorMap,
    default_color: Rgb8,
    rotation: Rotation,
    repeat: u32,
) -> Result<Texture, PipelineError> {
    if !rotation.is_tileable() {
        return Err(PipelineError::NonTileableRotation(rotation.degrees()));
    }
    let start = Instant::now();
    let tile = build_tile(doc, colors, default_color, rotation)?;
    let texture = build_mosaic(&tile, repeat)?;
    log::info!(
        "Texture {}x{} ({}x{} tiles) ready in {}ms",
        texture.width(),
        texture.height(),
        repeat,
        repeat,
        start.elapsed().as_millis()
    );
    Ok(texture)
}

/// Pattern-fills a `width`x`height` canvas with `source` scaled by `scale`,
/// anchored at the origin.
pub fn fill_repeat(
    source: &RgbaImage,
    width: u32,
    height: u32,
    scale: f32,
) -> Result<RgbaImage, PipelineError> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(PipelineError::InvalidParameter(format!(
            "fill scale must be positive, got {}",
            scale
        )));
    }
    let (sw, sh) = source.dimensions();
    let mut out = RgbaImage::new(width, height);
    if sw == 0 || sh == 0 || width == 0 || height == 0 {
        return Ok(out);
    }

    out.par_chunks_exact_mut(width as usize * 4)
        .enumerate()
        .for_each(|(y, row)| {
            let sy = ((y as f32 + 0.5) / scale).floor() as i64;
            let sy = sy.rem_euclid(sh as i64) as u32;
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let sx = ((x as f32 + 0.5) / scale).floor() as i64;
                let sx = sx.rem_euclid(sw as i64) as u32;
                px.copy_from_slice(&source.get_pixel(sx, sy).0);
            }
        });
    Ok(out)
}

/// Maps a point on a rotated tile preview back to document coordinates.
///
/// Points beyond the tile wrap, so clicks on any cell of a mosaic preview
/// resolve to the same region. Returns `None` where a free rotation exposes
/// empty corners.
pub fn tile_point_to_document(
    point: (f32, f32),
    rotation: Rotation,
    tile_size: f32,
    doc_width: f32,
    doc_height: f32,
) -> Option<(f32, f32)> {
    if tile_size <= 0.0 {
        return None;
    }
    let (x, y) = (point.0.rem_euclid(tile_size), point.1.rem_euclid(tile_size));
    let c = tile_size / 2.0;
    let theta = -rotation.degrees().to_radians();
    let (sin, cos) = theta.sin_cos();
    let (dx, dy) = (x - c, y - c);
    let ux = c + dx * cos - dy * sin;
    let uy = c + dx * sin + dy * cos;

    let eps = 1e-3;
    if ux < -eps || uy < -eps || ux > tile_size + eps || uy > tile_size + eps {
        return None;
    }
    Some((
        ux.clamp(0.0, tile_size) / tile_size * doc_width,
        uy.clamp(0.0, tile_size) / tile_size * doc_height,
    ))
}
