//! Piecewise-affine perspective approximation.
//!
//! The source is cut into horizontal strips. Each strip lands on the
//! parallelogram spanned by interpolating the quad's left (p1 -> p4) and right
//! (p2 -> p3) edges at the strip's top and bottom, and is drawn through the
//! affine map defined by that parallelogram's top-left corner, top edge and
//! left edge. Output is clipped to the quad.

use super::{empty_canvas, Projector};
use crate::error::PipelineError;
use crate::tiling::{fill_repeat, Texture};
use glam::Vec2;
use image::RgbaImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const DEFAULT_STRIPS: u32 = 250;

/// Destination corners, clockwise from top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quad {
    pub p1: Vec2,
    pub p2: Vec2,
    pub p3: Vec2,
    pub p4: Vec2,
}

impl Quad {
    pub fn new(p1: Vec2, p2: Vec2, p3: Vec2, p4: Vec2) -> Self {
        Self { p1, p2, p3, p4 }
    }

    pub fn from_rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(
            Vec2::new(x, y),
            Vec2::new(x + width, y),
            Vec2::new(x + width, y + height),
            Vec2::new(x, y + height),
        )
    }

    pub fn points(&self) -> [Vec2; 4] {
        [self.p1, self.p2, self.p3, self.p4]
    }

    /// Rotates every corner about `center`; positive degrees turn clockwise
    /// on screen.
    pub fn rotated_about(&self, center: Vec2, degrees: f32) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        let rotate = |p: Vec2| {
            let d = p - center;
            center + Vec2::new(d.x * cos - d.y * sin, d.x * sin + d.y * cos)
        };
        Self::new(
            rotate(self.p1),
            rotate(self.p2),
            rotate(self.p3),
            rotate(self.p4),
        )
    }

    /// Nonzero-winding containment, so self-intersecting quads still clip.
    pub fn contains(&self, p: Vec2) -> bool {
        let pts = self.points();
        let mut wn = 0i32;
        for i in 0..4 {
            let a = pts[i];
            let b = pts[(i + 1) % 4];
            let side = (b - a).perp_dot(p - a);
            if a.y <= p.y {
                if b.y > p.y && side > 0.0 {
                    wn += 1;
                }
            } else if b.y <= p.y && side < 0.0 {
                wn -= 1;
            }
        }
        wn != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleFilter {
    #[default]
    Nearest,
    Bilinear,
}

fn default_strips() -> u32 {
    DEFAULT_STRIPS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuadWarp {
    pub quad: Quad,
    #[serde(default = "default_strips")]
    pub strips: u32,
    #[serde(default)]
    pub filter: SampleFilter,
    /// When set, the texture is first pattern-filled at this scale over a
    /// canvas twice the destination size and that fill is warped instead.
    #[serde(default)]
    pub pattern_scale: Option<f32>,
}

impl QuadWarp {
    pub fn new(quad: Quad) -> Self {
        Self {
            quad,
            strips: DEFAULT_STRIPS,
            filter: SampleFilter::Nearest,
            pattern_scale: None,
        }
    }

    /// Warps `source` into a `width`x`height` canvas.
    pub fn warp(
        &self,
        source: &RgbaImage,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, PipelineError> {
        if self.strips == 0 {
            return Err(PipelineError::InvalidParameter(
                "strip count must be at least 1".to_string(),
            ));
        }
        let (sw, sh) = source.dimensions();
        if sw == 0 || sh == 0 || width == 0 || height == 0 {
            return Ok(empty_canvas(width, height));
        }

        let strips = build_strips(&self.quad, self.strips);
        let strip_h = sh as f32 / self.strips as f32;
        let quad = self.quad;
        let filter = self.filter;

        let mut out = RgbaImage::new(width, height);
        out.par_chunks_exact_mut(width as usize * 4)
            .enumerate()
            .for_each(|(y, row)| {
                let py = y as f32 + 0.5;
                for strip in &strips {
                    let Some((x0, x1)) = strip.span(py, width) else {
                        continue;
                    };
                    for x in x0..=x1 {
                        let p = Vec2::new(x as f32 + 0.5, py);
                        if !quad.contains(p) {
                            continue;
                        }
                        let (a, b) = strip.local(p);
                        let sx = a.clamp(0.0, 1.0) * sw as f32;
                        let sy = (strip.index as f32 + b.clamp(0.0, 1.0)) * strip_h;
                        let px = match filter {
                            SampleFilter::Nearest => sample_nearest(source, sx, sy),
                            SampleFilter::Bilinear => sample_bilinear(source, sx, sy),
                        };
                        let offset = x as usize * 4;
                        row[offset..offset + 4].copy_from_slice(&px);
                    }
                }
            });
        Ok(out)
    }
}

impl Projector for QuadWarp {
    fn name(&self) -> &'static str {
        "quad-warp"
    }

    fn project(
        &mut self,
        texture: &Texture,
        canvas_width: u32,
        canvas_height: u32,
    ) -> Result<RgbaImage, PipelineError> {
        let start = Instant::now();
        if texture.is_empty() || canvas_width == 0 || canvas_height == 0 {
            return Ok(empty_canvas(canvas_width, canvas_height));
        }

        let out = match self.pattern_scale {
            Some(scale) => {
                let fill = fill_repeat(&texture.image, canvas_width * 2, canvas_height * 2, scale)?;
                self.warp(&fill, canvas_width, canvas_height)?
            }
            None => self.warp(&texture.image, canvas_width, canvas_height)?,
        };
        log::debug!(
            "Quad warp {}x{} with {} strips in {}ms",
            canvas_width,
            canvas_height,
            self.strips,
            start.elapsed().as_millis()
        );
        Ok(out)
    }
}

/// Inverse affine of one strip: destination point -> (a, b) in [0, 1]^2.
struct Strip {
    index: u32,
    origin: Vec2,
    // rows of the inverse basis matrix
    inv_a: Vec2,
    inv_b: Vec2,
}

const SPAN_EPS: f32 = 1e-4;

impl Strip {
    fn local(&self, p: Vec2) -> (f32, f32) {
        let d = p - self.origin;
        (self.inv_a.dot(d), self.inv_b.dot(d))
    }

    /// Pixel columns on row `py` whose centres map inside the strip.
    fn span(&self, py: f32, width: u32) -> Option<(u32, u32)> {
        let dy = py - self.origin.y;
        let mut lo = f32::NEG_INFINITY;
        let mut hi = f32::INFINITY;

        for inv in [self.inv_a, self.inv_b] {
            // value(px) = inv.x * (px - origin.x) + inv.y * dy
            let base = inv.y * dy;
            if inv.x.abs() < 1e-12 {
                if base < -SPAN_EPS || base > 1.0 + SPAN_EPS {
                    return None;
                }
                continue;
            }
            let e0 = (-SPAN_EPS - base) / inv.x + self.origin.x;
            let e1 = (1.0 + SPAN_EPS - base) / inv.x + self.origin.x;
            lo = lo.max(e0.min(e1));
            hi = hi.min(e0.max(e1));
        }
        if lo > hi {
            return None;
        }

        let first = (lo - 0.5).ceil().max(0.0);
        let last = (hi - 0.5).floor().min(width as f32 - 1.0);
        if first > last {
            return None;
        }
        Some((first as u32, last as u32))
    }
}

fn build_strips(quad: &Quad, count: u32) -> Vec<Strip> {
    (0..count)
        .filter_map(|i| {
            let t0 = i as f32 / count as f32;
            let t1 = (i + 1) as f32 / count as f32;
            let top_left = quad.p1.lerp(quad.p4, t0);
            let top_right = quad.p2.lerp(quad.p3, t0);
            let bottom_left = quad.p1.lerp(quad.p4, t1);

            let u = top_right - top_left;
            let v = bottom_left - top_left;
            let det = u.perp_dot(v);
            if det.abs() < 1e-9 {
                return None;
            }
            Some(Strip {
                index: i,
                origin: top_left,
                inv_a: Vec2::new(v.y, -v.x) / det,
                inv_b: Vec2::new(-u.y, u.x) / det,
            })
        })
        .collect()
}

fn sample_nearest(img: &RgbaImage, sx: f32, sy: f32) -> [u8; 4] {
    let x = (sx.floor() as i64).clamp(0, img.width() as i64 - 1) as u32;
    let y = (sy.floor() as i64).clamp(0, img.height() as i64 - 1) as u32;
    img.get_pixel(x, y).0
}

fn sample_bilinear(img: &RgbaImage, sx: f32, sy: f32) -> [u8; 4] {
    let max_x = img.width() as f32 - 1.0;
    let max_y = img.height() as f32 - 1.0;
    let fx = (sx - 0.5).clamp(0.0, max_x);
    let fy = (sy - 0.5).clamp(0.0, max_y);
    let (x0, y0) = (fx.floor() as u32, fy.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(img.width() - 1), (y0 + 1).min(img.height() - 1));
    let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);

    let p00 = img.get_pixel(x0, y0).0;
    let p10 = img.get_pixel(x1, y0).0;
    let p01 = img.get_pixel(x0, y1).0;
    let p11 = img.get_pixel(x1, y1).0;
    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = p00[c] as f32 * (1.0 - tx) + p10[c] as f32 * tx;
        let bottom = p01[c] as f32 * (1.0 - tx) + p11[c] as f32 * tx;
        out[c] = (top * (1.0 - ty) + bottom * ty).round().clamp(0.0, 255.0) as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8, 255])
        })
    }

    #[test]
    fn full_canvas_quad_matches_direct_draw() {
        let source = gradient(40, 30);
        let warp = QuadWarp::new(Quad::from_rect(0.0, 0.0, 40.0, 30.0));
        let out = warp.warp(&source, 40, 30).expect("warp");
        assert_eq!(out.as_raw(), source.as_raw());
    }

    #[test]
    fn fewer_strips_than_rows_still_covers_every_pixel() {
        let source = gradient(32, 64);
        let mut warp = QuadWarp::new(Quad::from_rect(0.0, 0.0, 32.0, 64.0));
        warp.strips = 7;
        let out = warp.warp(&source, 32, 64).expect("warp");
        assert!(out.pixels().all(|p| p.0[3] == 255));
    }

    #[test]
    fn output_is_clipped_to_the_quad() {
        let source = RgbaImage::from_pixel(10, 10, Rgba([255, 255, 255, 255]));
        let quad = Quad::new(
            Vec2::new(20.0, 10.0),
            Vec2::new(80.0, 10.0),
            Vec2::new(100.0, 60.0),
            Vec2::new(0.0, 60.0),
        );
        let out = QuadWarp::new(quad).warp(&source, 100, 80).expect("warp");
        assert_eq!(out.get_pixel(50, 30).0, [255, 255, 255, 255]);
        assert_eq!(out.get_pixel(2, 12).0[3], 0);
        assert_eq!(out.get_pixel(50, 70).0[3], 0);
    }

    #[test]
    fn partially_offscreen_and_self_intersecting_quads_do_not_panic() {
        let source = gradient(16, 16);
        let offscreen = Quad::from_rect(-50.0, -20.0, 200.0, 100.0);
        let bowtie = Quad::new(
            Vec2::new(0.0, 0.0),
            Vec2::new(20.0, 20.0),
            Vec2::new(20.0, 0.0),
            Vec2::new(0.0, 20.0),
        );
        assert!(QuadWarp::new(offscreen).warp(&source, 30, 30).is_ok());
        assert!(QuadWarp::new(bowtie).warp(&source, 30, 30).is_ok());
    }

    #[test]
    fn rotation_is_clockwise_about_center() {
        let quad = Quad::from_rect(0.0, 0.0, 2.0, 2.0).rotated_about(Vec2::new(1.0, 1.0), 90.0);
        assert!(quad.p1.abs_diff_eq(Vec2::new(2.0, 0.0), 1e-5));
        assert!(quad.p2.abs_diff_eq(Vec2::new(2.0, 2.0), 1e-5));
    }

    #[test]
    fn empty_inputs_give_empty_output() {
        let mut warp = QuadWarp::new(Quad::from_rect(0.0, 0.0, 10.0, 10.0));
        let empty = Texture {
            image: RgbaImage::new(0, 0),
            repeat: 1,
        };
        let out = warp.project(&empty, 10, 10).expect("project");
        assert!(out.pixels().all(|p| p.0[3] == 0));

        let texture = Texture {
            image: gradient(4, 4),
            repeat: 1,
        };
        let out = warp.project(&texture, 0, 10).expect("project");
        assert_eq!(out.dimensions(), (0, 10));
    }

    #[test]
    fn zero_strips_are_rejected() {
        let mut warp = QuadWarp::new(Quad::from_rect(0.0, 0.0, 4.0, 4.0));
        warp.strips = 0;
        assert!(warp.warp(&gradient(4, 4), 4, 4).is_err());
    }

    #[test]
    fn bilinear_blends_between_texels() {
        let mut source = RgbaImage::new(2, 1);
        source.put_pixel(0, 0, Rgba([0, 0, 0, 255]));
        source.put_pixel(1, 0, Rgba([200, 200, 200, 255]));
        assert_eq!(sample_bilinear(&source, 1.0, 0.5), [100, 100, 100, 255]);
        assert_eq!(sample_nearest(&source, 1.0, 0.5), [200, 200, 200, 255]);
    }
}
