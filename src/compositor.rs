use crate::error::{Notice, PipelineError};
use image::{imageops, GrayImage, Luma, RgbaImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

pub const FLOOR: u8 = 255;
pub const FOREGROUND: u8 = 0;

fn default_threshold() -> u8 {
    40
}

fn default_true() -> bool {
    true
}

/// How a room decides which pixels are floor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "camelCase")]
pub enum FloorRule {
    /// Photo pixels with every channel below `threshold` (or, when set, an
    /// average below `average_below`) are floor.
    #[serde(rename_all = "camelCase")]
    Threshold {
        #[serde(default = "default_threshold")]
        threshold: u8,
        #[serde(default)]
        average_below: Option<u8>,
    },
    /// Mask pixels within `tolerance` of `key` on every channel are floor.
    #[serde(rename_all = "camelCase")]
    KeyColor {
        key: [u8; 3],
        tolerance: [u8; 3],
        #[serde(default = "default_true")]
        erode: bool,
    },
    /// Mask pixels brighter than `threshold` on average are floor.
    #[serde(rename_all = "camelCase")]
    MaskBrightness {
        #[serde(default = "default_threshold")]
        threshold: u8,
    },
}

impl Default for FloorRule {
    fn default() -> Self {
        Self::Threshold {
            threshold: default_threshold(),
            average_below: None,
        }
    }
}

impl FloorRule {
    /// Saturated magenta key with a one pixel erosion.
    pub fn magenta_key() -> Self {
        Self::KeyColor {
            key: [255, 0, 255],
            tolerance: [15, 10, 15],
            erode: true,
        }
    }

    pub fn needs_mask(&self) -> bool {
        !matches!(self, Self::Threshold { .. })
    }

    fn is_floor(&self, px: &[u8]) -> bool {
        match *self {
            Self::Threshold {
                threshold,
                average_below,
            } => {
                let dark = px[..3].iter().all(|&c| c < threshold);
                let dim = average_below
                    .map(|limit| average(px) < limit as f32)
                    .unwrap_or(false);
                dark || dim
            }
            Self::KeyColor { key, tolerance, .. } => px[..3]
                .iter()
                .zip(key.iter().zip(tolerance.iter()))
                .all(|(&c, (&k, &t))| c.abs_diff(k) < t),
            Self::MaskBrightness { threshold } => average(px) > threshold as f32,
        }
    }
}

fn average(px: &[u8]) -> f32 {
    (px[0] as f32 + px[1] as f32 + px[2] as f32) / 3.0
}

/// Per-pixel floor classification: [`FLOOR`] or [`FOREGROUND`].
#[derive(Debug, Clone, PartialEq)]
pub struct FloorMask {
    pub mask: GrayImage,
}

impl FloorMask {
    pub fn width(&self) -> u32 {
        self.mask.width()
    }

    pub fn height(&self) -> u32 {
        self.mask.height()
    }

    pub fn is_floor(&self, x: u32, y: u32) -> bool {
        self.mask.get_pixel(x, y).0[0] == FLOOR
    }

    pub fn floor_count(&self) -> usize {
        self.mask.as_raw().par_iter().filter(|&&v| v == FLOOR).count()
    }

    pub fn coverage(&self) -> f32 {
        let total = self.mask.as_raw().len();
        if total == 0 {
            return 0.0;
        }
        self.floor_count() as f32 / total as f32
    }

    /// Keeps a pixel only if its whole 3x3 neighbourhood is floor. Border
    /// pixels never survive.
    pub fn eroded(&self) -> FloorMask {
        let (w, h) = self.mask.dimensions();
        if w == 0 || h == 0 {
            return self.clone();
        }
        let mut mask = erode(&self.mask, Norm::LInf, 1);
        for x in 0..w {
            mask.put_pixel(x, 0, Luma([FOREGROUND]));
            mask.put_pixel(x, h - 1, Luma([FOREGROUND]));
        }
        for y in 0..h {
            mask.put_pixel(0, y, Luma([FOREGROUND]));
            mask.put_pixel(w - 1, y, Luma([FOREGROUND]));
        }
        FloorMask { mask }
    }
}

/// Classifies `source` pixel by pixel under `rule`.
pub fn classify(source: &RgbaImage, rule: &FloorRule) -> FloorMask {
    let (w, h) = source.dimensions();
    let data: Vec<u8> = source
        .as_raw()
        .par_chunks_exact(4)
        .map(|px| if rule.is_floor(px) { FLOOR } else { FOREGROUND })
        .collect();
    let mask = GrayImage::from_raw(w, h, data).unwrap_or_else(|| GrayImage::new(w, h));
    let mask = FloorMask { mask };
    match rule {
        FloorRule::KeyColor { erode: true, .. } if w > 0 && h > 0 => mask.eroded(),
        _ => mask,
    }
}

#[derive(Debug, Clone)]
enum MaskSource {
    None,
    Image(Arc<RgbaImage>),
    /// The mask exists but its pixels could not be read.
    Unreadable(String),
}

/// A room photograph with its floor rule. Derived layers are computed once.
#[derive(Debug)]
pub struct RoomAsset {
    pub name: String,
    photo: Arc<RgbaImage>,
    mask: MaskSource,
    rule: FloorRule,
    floor: OnceLock<Arc<FloorMask>>,
    foreground: OnceLock<Arc<RgbaImage>>,
}

impl RoomAsset {
    pub fn new(
        name: &str,
        photo: Arc<RgbaImage>,
        mask: Option<Arc<RgbaImage>>,
        rule: FloorRule,
    ) -> Result<Self, PipelineError> {
        if let Some(mask) = &mask {
            if mask.dimensions() != photo.dimensions() {
                return Err(PipelineError::DimensionMismatch {
                    expected_width: photo.width(),
                    expected_height: photo.height(),
                    actual_width: mask.width(),
                    actual_height: mask.height(),
                });
            }
        }
        if rule.needs_mask() && mask.is_none() {
            return Err(PipelineError::InvalidParameter(format!(
                "room {} uses a mask rule but has no mask image",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            photo,
            mask: mask.map(MaskSource::Image).unwrap_or(MaskSource::None),
            rule,
            floor: OnceLock::new(),
            foreground: OnceLock::new(),
        })
    }

    /// A room whose mask could not be read; it keeps the photo unprocessed.
    pub fn with_unreadable_mask(
        name: &str,
        photo: Arc<RgbaImage>,
        rule: FloorRule,
        reason: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            photo,
            mask: MaskSource::Unreadable(reason.to_string()),
            rule,
            floor: OnceLock::new(),
            foreground: OnceLock::new(),
        }
    }

    pub fn photo(&self) -> &Arc<RgbaImage> {
        &self.photo
    }

    pub fn rule(&self) -> &FloorRule {
        &self.rule
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.photo.dimensions()
    }

    /// Set when mask pixels were unavailable and the photo is drawn as-is.
    pub fn readback_notice(&self) -> Option<Notice> {
        match &self.mask {
            MaskSource::Unreadable(reason) => Some(Notice::from_error(
                &PipelineError::PixelReadback(format!("{}: {}", self.name, reason)),
            )),
            _ => None,
        }
    }

    pub fn classify_floor(&self) -> Arc<FloorMask> {
        self.floor
            .get_or_init(|| {
                let start = Instant::now();
                let (w, h) = self.photo.dimensions();
                let mask = match &self.mask {
                    MaskSource::Unreadable(_) => FloorMask {
                        mask: GrayImage::new(w, h),
                    },
                    MaskSource::Image(mask) if self.rule.needs_mask() => classify(mask, &self.rule),
                    _ => classify(&self.photo, &self.rule),
                };
                log::info!(
                    "Classified floor for {}: {:.1}% of {}x{} in {}ms",
                    self.name,
                    mask.coverage() * 100.0,
                    w,
                    h,
                    start.elapsed().as_millis()
                );
                Arc::new(mask)
            })
            .clone()
    }

    /// Photo with floor pixels made fully transparent.
    pub fn foreground_layer(&self) -> Arc<RgbaImage> {
        self.foreground
            .get_or_init(|| {
                if let MaskSource::Unreadable(reason) = &self.mask {
                    log::warn!(
                        "Mask for {} unreadable ({}); drawing the photo unprocessed",
                        self.name,
                        reason
                    );
                    return self.photo.clone();
                }
                let floor = self.classify_floor();
                let mut layer = (*self.photo).clone();
                layer
                    .par_chunks_exact_mut(4)
                    .zip(floor.mask.as_raw().par_iter())
                    .for_each(|(px, &class)| {
                        if class == FLOOR {
                            px[3] = 0;
                        }
                    });
                Arc::new(layer)
            })
            .clone()
    }
}

/// Flattened output at canvas resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeResult {
    pub image: RgbaImage,
    pub notices: Vec<Notice>,
}

fn fit_layer<'a>(
    layer: &'a RgbaImage,
    width: u32,
    height: u32,
    label: &str,
) -> std::borrow::Cow<'a, RgbaImage> {
    if layer.dimensions() == (width, height) {
        return std::borrow::Cow::Borrowed(layer);
    }
    log::warn!(
        "Stretching {} layer from {}x{} to {}x{}",
        label,
        layer.width(),
        layer.height(),
        width,
        height
    );
    std::borrow::Cow::Owned(imageops::resize(
        layer,
        width,
        height,
        imageops::FilterType::Triangle,
    ))
}

#[derive(Clone, Copy)]
enum Blend {
    Normal,
    Multiply,
}

/// Draws `src` over `dst` with canvas-style separable blending.
fn draw(dst: &mut RgbaImage, src: &RgbaImage, blend: Blend, global_alpha: f32) {
    dst.par_chunks_exact_mut(4)
        .zip(src.as_raw().par_chunks_exact(4))
        .for_each(|(d, s)| {
            let a_s = s[3] as f32 / 255.0 * global_alpha;
            if a_s <= 0.0 {
                return;
            }
            let a_b = d[3] as f32 / 255.0;
            let a_o = a_s + a_b * (1.0 - a_s);
            for c in 0..3 {
                let cs = s[c] as f32 / 255.0;
                let cb = d[c] as f32 / 255.0;
                let mixed = match blend {
                    Blend::Normal => cs,
                    Blend::Multiply => (1.0 - a_b) * cs + a_b * cs * cb,
                };
                let co = (a_s * mixed + a_b * cb * (1.0 - a_s)) / a_o;
                d[c] = (co * 255.0).round().clamp(0.0, 255.0) as u8;
            }
            d[3] = (a_o * 255.0).round().clamp(0.0, 255.0) as u8;
        });
}

/// Floor, then the optional shadow multiplied at `intensity`, then the
/// foreground. Layers of another size are stretched to the canvas.
pub fn composite(
    floor: &RgbaImage,
    shadow: Option<(&RgbaImage, f32)>,
    foreground: &RgbaImage,
    width: u32,
    height: u32,
) -> RgbaImage {
    let start = Instant::now();
    let mut canvas = RgbaImage::new(width, height);
    if width == 0 || height == 0 {
        return canvas;
    }

    draw(&mut canvas, &fit_layer(floor, width, height, "floor"), Blend::Normal, 1.0);
    if let Some((shadow, intensity)) = shadow {
        let intensity = intensity.clamp(0.0, 1.0);
        if intensity > 0.0 {
            draw(
                &mut canvas,
                &fit_layer(shadow, width, height, "shadow"),
                Blend::Multiply,
                intensity,
            );
        }
    }
    draw(
        &mut canvas,
        &fit_layer(foreground, width, height, "foreground"),
        Blend::Normal,
        1.0,
    );

    log::debug!(
        "Composited {}x{} in {}ms",
        width,
        height,
        start.elapsed().as_millis()
    );
    canvas
}
