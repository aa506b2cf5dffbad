//! Vector pattern documents: region identifiers, recolouring, hit-testing.
//!
//! Source markup is normalised once so every `path`, `polygon` and `rect`
//! carries a unique `id`, then parsed with usvg. The parsed shapes are kept as
//! owned geometry; recolouring is applied at rasterisation time from a
//! [`RegionColorMap`] and never touches the document itself.

use crate::asset_cache::{read_source, AssetCache};
use crate::catalog::Rgb8;
use crate::error::PipelineError;
use regex::{Captures, Regex};
use resvg::tiny_skia::{self, Pixmap, Transform};
use resvg::usvg;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use image::RgbaImage;

pub type RegionId = String;

const AUTO_ID_PREFIX: &str = "auto-shape-";
const CURVE_STEPS: usize = 16;

static SHAPE_TAG: OnceLock<Regex> = OnceLock::new();
static ID_ATTR: OnceLock<Regex> = OnceLock::new();

fn shape_tag_pattern() -> &'static Regex {
    SHAPE_TAG.get_or_init(|| {
        Regex::new(r"(?s)<(path|polygon|rect)(\s[^>]*?)?(/?)>").expect("static shape tag pattern")
    })
}

fn id_attr_pattern() -> &'static Regex {
    ID_ATTR.get_or_init(|| {
        Regex::new(r#"(\s)id\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("static id attribute pattern")
    })
}

/// Gives every drawable shape a unique id, in document order.
///
/// Missing, blank or repeated ids become `auto-shape-{index}` where `index`
/// counts all scanned shapes. Running it on its own output changes nothing.
pub fn assign_region_ids(markup: &str) -> (String, Vec<RegionId>) {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut index = 0usize;

    let normalized = shape_tag_pattern().replace_all(markup, |caps: &Captures| {
        let tag = &caps[1];
        let attrs = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let close = &caps[3];
        let existing = id_attr_pattern().captures(attrs).and_then(|c| {
            c.get(2)
                .or_else(|| c.get(3))
                .map(|m| m.as_str().trim().to_string())
        });

        let id = match existing {
            Some(id) if !id.is_empty() && !seen.contains(&id) => id,
            _ => format!("{}{}", AUTO_ID_PREFIX, index),
        };
        index += 1;
        seen.insert(id.clone());

        let attrs = if id_attr_pattern().is_match(attrs) {
            id_attr_pattern()
                .replace(attrs, |c: &Captures| format!("{}id=\"{}\"", &c[1], id))
                .into_owned()
        } else {
            format!(" id=\"{}\"{}", id, attrs)
        };
        ids.push(id);
        format!("<{}{}{}>", tag, attrs, close)
    });

    (normalized.into_owned(), ids)
}

#[derive(Debug, Clone, Copy)]
struct ShapeFill {
    rule: tiny_skia::FillRule,
    source_color: Option<Rgb8>,
    opacity: f32,
}

#[derive(Debug, Clone, Copy)]
struct ShapeStroke {
    color: Rgb8,
    opacity: f32,
    width: f32,
    miter_limit: f32,
}

#[derive(Debug, Clone)]
struct Shape {
    region: Option<RegionId>,
    path: tiny_skia::Path,
    transform: Transform,
    fill: Option<ShapeFill>,
    stroke: Option<ShapeStroke>,
    /// Flattened contours in path-local space.
    contours: Vec<Vec<(f32, f32)>>,
}

/// A parsed pattern with stable region identifiers. Immutable once built.
#[derive(Debug, Clone)]
pub struct PatternDocument {
    pub source_key: String,
    pub markup: String,
    pub region_ids: Vec<RegionId>,
    pub width: f32,
    pub height: f32,
    shapes: Vec<Shape>,
}

/// Result of loading a pattern source.
#[derive(Debug, Clone)]
pub enum LoadedPattern {
    Vector(Arc<PatternDocument>),
    /// Source could not be parsed; the raw content is kept for display and
    /// region features are disabled.
    Passthrough { raw: String, reason: String },
}

impl LoadedPattern {
    pub fn document(&self) -> Option<&Arc<PatternDocument>> {
        match self {
            Self::Vector(doc) => Some(doc),
            Self::Passthrough { .. } => None,
        }
    }

    pub fn region_ids(&self) -> &[RegionId] {
        self.document()
            .map(|doc| doc.region_ids.as_slice())
            .unwrap_or(&[])
    }

    /// Parses `raw`, falling back to passthrough on malformed markup.
    pub fn from_markup(source_key: &str, raw: &str) -> Self {
        match PatternDocument::parse(source_key, raw) {
            Ok(doc) => Self::Vector(Arc::new(doc)),
            Err(err) => {
                log::warn!("Pattern {} passed through unprocessed: {}", source_key, err);
                Self::Passthrough {
                    raw: raw.to_string(),
                    reason: err.to_string(),
                }
            }
        }
    }
}

impl PatternDocument {
    pub fn parse(source_key: &str, raw: &str) -> Result<Self, PipelineError> {
        let start = Instant::now();
        let (markup, region_ids) = assign_region_ids(raw);
        let tree = usvg::Tree::from_str(&markup, &usvg::Options::default()).map_err(|e| {
            PipelineError::Parse {
                source_key: source_key.to_string(),
                reason: e.to_string(),
            }
        })?;

        let size = tree.size();
        let known: HashSet<&str> = region_ids.iter().map(String::as_str).collect();
        let mut shapes = Vec::new();
        collect_shapes(tree.root(), None, &known, &mut shapes);

        log::debug!(
            "Parsed pattern {} ({} regions, {} shapes) in {}ms",
            source_key,
            region_ids.len(),
            shapes.len(),
            start.elapsed().as_millis()
        );

        Ok(Self {
            source_key: source_key.to_string(),
            markup,
            region_ids,
            width: size.width(),
            height: size.height(),
            shapes,
        })
    }

    pub fn has_region(&self, id: &str) -> bool {
        self.region_ids.iter().any(|r| r == id)
    }

    /// Rasterises the document stretched to `width`x`height` with region
    /// fills taken from `colors`.
    pub fn render(
        &self,
        colors: &RegionColorMap,
        default_color: Rgb8,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, PipelineError> {
        let mut pixmap = Pixmap::new(width, height).ok_or_else(|| {
            PipelineError::SurfaceUnavailable(format!("cannot allocate {}x{} raster", width, height))
        })?;
        let base = Transform::from_scale(
            width as f32 / self.width.max(f32::EPSILON),
            height as f32 / self.height.max(f32::EPSILON),
        );

        for shape in &self.shapes {
            let transform = base.pre_concat(shape.transform);

            if let Some(fill) = shape.fill {
                let color = match &shape.region {
                    Some(region) => colors.resolve(region, default_color),
                    None => fill.source_color.unwrap_or(default_color),
                };
                let paint = solid_paint(color, fill.opacity);
                pixmap.fill_path(&shape.path, &paint, fill.rule, transform, None);
            }

            if let Some(stroke) = shape.stroke {
                let paint = solid_paint(stroke.color, stroke.opacity);
                let style = tiny_skia::Stroke {
                    width: stroke.width,
                    miter_limit: stroke.miter_limit,
                    ..Default::default()
                };
                pixmap.stroke_path(&shape.path, &paint, &style, transform, None);
            }
        }

        let mut out = RgbaImage::new(width, height);
        for (dst, src) in out.pixels_mut().zip(pixmap.pixels()) {
            let c = src.demultiply();
            dst.0 = [c.red(), c.green(), c.blue(), c.alpha()];
        }
        Ok(out)
    }

    /// Topmost region whose fill contains `point` (document coordinates).
    pub fn hit_test(&self, point: (f32, f32)) -> Option<&str> {
        self.shapes.iter().rev().find_map(|shape| {
            let region = shape.region.as_deref()?;
            let fill = shape.fill?;
            let local = invert_point(&shape.transform, point)?;
            contains(&shape.contours, local, fill.rule).then_some(region)
        })
    }

    /// Bounding boxes of rendered regions in document space, in id order.
    pub fn region_bounds(&self) -> Vec<RegionBounds> {
        let mut boxes: BTreeMap<&str, (f32, f32, f32, f32)> = BTreeMap::new();
        for shape in &self.shapes {
            let Some(region) = shape.region.as_deref() else {
                continue;
            };
            for &(x, y) in shape.contours.iter().flatten() {
                let (dx, dy) = map_point(&shape.transform, (x, y));
                let entry = boxes.entry(region).or_insert((dx, dy, dx, dy));
                entry.0 = entry.0.min(dx);
                entry.1 = entry.1.min(dy);
                entry.2 = entry.2.max(dx);
                entry.3 = entry.3.max(dy);
            }
        }

        self.region_ids
            .iter()
            .filter_map(|id| {
                let (x0, y0, x1, y1) = boxes.get(id.as_str())?;
                Some(RegionBounds {
                    id: id.clone(),
                    x: *x0,
                    y: *y0,
                    width: x1 - x0,
                    height: y1 - y0,
                })
            })
            .collect()
    }
}

fn collect_shapes(
    group: &usvg::Group,
    inherited: Option<&str>,
    known: &HashSet<&str>,
    out: &mut Vec<Shape>,
) {
    for node in group.children() {
        match node {
            usvg::Node::Group(child) => {
                let region = if known.contains(child.id()) {
                    Some(child.id())
                } else {
                    inherited
                };
                collect_shapes(child, region, known, out);
            }
            usvg::Node::Path(path) => {
                let region = if known.contains(path.id()) {
                    Some(path.id())
                } else {
                    inherited
                };
                out.push(Shape {
                    region: region.map(str::to_string),
                    path: path.data().clone(),
                    transform: path.abs_transform(),
                    fill: path.fill().map(|fill| ShapeFill {
                        rule: match fill.rule() {
                            usvg::FillRule::NonZero => tiny_skia::FillRule::Winding,
                            usvg::FillRule::EvenOdd => tiny_skia::FillRule::EvenOdd,
                        },
                        source_color: paint_color(fill.paint()),
                        opacity: fill.opacity().get(),
                    }),
                    stroke: path.stroke().map(|stroke| ShapeStroke {
                        color: paint_color(stroke.paint()).unwrap_or(Rgb8::new(0, 0, 0)),
                        opacity: stroke.opacity().get(),
                        width: stroke.width().get(),
                        miter_limit: stroke.miterlimit().get(),
                    }),
                    contours: flatten(path.data()),
                });
            }
            _ => {}
        }
    }
}

fn paint_color(paint: &usvg::Paint) -> Option<Rgb8> {
    match paint {
        usvg::Paint::Color(c) => Some(Rgb8::new(c.red, c.green, c.blue)),
        _ => None,
    }
}

fn solid_paint(color: Rgb8, opacity: f32) -> tiny_skia::Paint<'static> {
    let mut paint = tiny_skia::Paint::default();
    let alpha = (opacity.clamp(0.0, 1.0) * 255.0).round() as u8;
    paint.set_color_rgba8(color.red, color.green, color.blue, alpha);
    paint.anti_alias = true;
    paint
}

fn map_point(t: &Transform, (x, y): (f32, f32)) -> (f32, f32) {
    (t.sx * x + t.kx * y + t.tx, t.ky * x + t.sy * y + t.ty)
}

fn invert_point(t: &Transform, (x, y): (f32, f32)) -> Option<(f32, f32)> {
    let det = t.sx * t.sy - t.kx * t.ky;
    if det.abs() < f32::EPSILON {
        return None;
    }
    let (px, py) = (x - t.tx, y - t.ty);
    Some(((t.sy * px - t.kx * py) / det, (t.sx * py - t.ky * px) / det))
}

fn flatten(path: &tiny_skia::Path) -> Vec<Vec<(f32, f32)>> {
    use tiny_skia::PathSegment;

    let mut contours: Vec<Vec<(f32, f32)>> = Vec::new();
    let mut current: Vec<(f32, f32)> = Vec::new();
    let mut last = (0.0f32, 0.0f32);

    for segment in path.segments() {
        match segment {
            PathSegment::MoveTo(p) => {
                if current.len() > 1 {
                    contours.push(std::mem::take(&mut current));
                }
                current.clear();
                last = (p.x, p.y);
                current.push(last);
            }
            PathSegment::LineTo(p) => {
                last = (p.x, p.y);
                current.push(last);
            }
            PathSegment::QuadTo(c, p) => {
                let (x0, y0) = last;
                for i in 1..=CURVE_STEPS {
                    let t = i as f32 / CURVE_STEPS as f32;
                    let mt = 1.0 - t;
                    current.push((
                        mt * mt * x0 + 2.0 * mt * t * c.x + t * t * p.x,
                        mt * mt * y0 + 2.0 * mt * t * c.y + t * t * p.y,
                    ));
                }
                last = (p.x, p.y);
            }
            PathSegment::CubicTo(c1, c2, p) => {
                let (x0, y0) = last;
                for i in 1..=CURVE_STEPS {
                    let t = i as f32 / CURVE_STEPS as f32;
                    let mt = 1.0 - t;
                    let (a, b, c, d) = (mt * mt * mt, 3.0 * mt * mt * t, 3.0 * mt * t * t, t * t * t);
                    current.push((
                        a * x0 + b * c1.x + c * c2.x + d * p.x,
                        a * y0 + b * c1.y + c * c2.y + d * p.y,
                    ));
                }
                last = (p.x, p.y);
            }
            PathSegment::Close => {
                if let Some(&first) = current.first() {
                    last = first;
                }
                if current.len() > 1 {
                    contours.push(std::mem::take(&mut current));
                }
                current.push(last);
            }
        }
    }
    if current.len() > 1 {
        contours.push(current);
    }
    contours
}

/// Winding number of `point` against implicitly closed contours.
fn winding(contours: &[Vec<(f32, f32)>], (px, py): (f32, f32)) -> i32 {
    let mut wn = 0;
    for contour in contours {
        let n = contour.len();
        for i in 0..n {
            let (x0, y0) = contour[i];
            let (x1, y1) = contour[(i + 1) % n];
            let side = (x1 - x0) * (py - y0) - (px - x0) * (y1 - y0);
            if y0 <= py {
                if y1 > py && side > 0.0 {
                    wn += 1;
                }
            } else if y1 <= py && side < 0.0 {
                wn -= 1;
            }
        }
    }
    wn
}

fn contains(contours: &[Vec<(f32, f32)>], point: (f32, f32), rule: tiny_skia::FillRule) -> bool {
    let wn = winding(contours, point);
    match rule {
        tiny_skia::FillRule::Winding => wn != 0,
        tiny_skia::FillRule::EvenOdd => wn % 2 != 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionBounds {
    pub id: RegionId,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Paint assignments keyed by region id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionColorMap {
    colors: BTreeMap<RegionId, Rgb8>,
}

impl RegionColorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gives every listed region `color` unless it is already painted.
    pub fn seed(&mut self, ids: &[RegionId], color: Rgb8) {
        for id in ids {
            self.colors.entry(id.clone()).or_insert(color);
        }
    }

    pub fn paint(&mut self, id: &str, color: Rgb8) {
        self.colors.insert(id.to_string(), color);
    }

    pub fn get(&self, id: &str) -> Option<Rgb8> {
        self.colors.get(id).copied()
    }

    pub fn resolve(&self, id: &str, default_color: Rgb8) -> Rgb8 {
        self.get(id).unwrap_or(default_color)
    }

    /// Drops every entry, used when the active pattern changes.
    pub fn reset(&mut self) {
        self.colors.clear();
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RegionId, &Rgb8)> {
        self.colors.iter()
    }
}

static PATTERN_CACHE: OnceLock<AssetCache<LoadedPattern>> = OnceLock::new();

pub fn pattern_cache() -> &'static AssetCache<LoadedPattern> {
    PATTERN_CACHE.get_or_init(AssetCache::new)
}

/// Loads a pattern source through `cache`.
///
/// I/O failures are returned as errors. Malformed markup resolves to
/// [`LoadedPattern::Passthrough`] and is cached like a parsed document.
pub async fn load_pattern(
    cache: &AssetCache<LoadedPattern>,
    key: &str,
) -> Result<Arc<LoadedPattern>, PipelineError> {
    cache
        .get_or_load(key, || async {
            let bytes = read_source(key).await?;
            let owned_key = key.to_string();
            smol::unblock(move || {
                let raw = String::from_utf8_lossy(&bytes).into_owned();
                Ok(LoadedPattern::from_markup(&owned_key, &raw))
            })
            .await
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_REGION_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="100" height="100" viewBox="0 0 100 100">
  <rect x="0" y="0" width="100" height="100" fill="#ffffff"/>
  <path id="centro" d="M25 25 L75 25 L75 75 L25 75 Z" fill="#000000"/>
  <polygon points="0,0 10,0 0,10" fill="#ff0000"></polygon>
</svg>"##;

    #[test]
    fn ids_are_assigned_in_document_order() {
        let (markup, ids) = assign_region_ids(TWO_REGION_SVG);
        assert_eq!(ids, vec!["auto-shape-0", "centro", "auto-shape-2"]);
        assert!(markup.contains(r#"<rect id="auto-shape-0""#));
        assert!(markup.contains(r#"<polygon id="auto-shape-2""#));
    }

    #[test]
    fn id_assignment_is_idempotent() {
        let (once, ids_once) = assign_region_ids(TWO_REGION_SVG);
        let (twice, ids_twice) = assign_region_ids(&once);
        assert_eq!(once, twice);
        assert_eq!(ids_once, ids_twice);
    }

    #[test]
    fn blank_and_duplicate_ids_are_replaced() {
        let raw = r#"<svg><path id="" d="M0 0"/><rect id='a'/><rect id="a"/></svg>"#;
        let (markup, ids) = assign_region_ids(raw);
        assert_eq!(ids, vec!["auto-shape-0", "a", "auto-shape-2"]);
        assert!(markup.contains(r#"<path id="auto-shape-0" d="M0 0"/>"#));
        assert!(!markup.contains("data-id"));
    }

    #[test]
    fn data_attributes_are_not_mistaken_for_ids() {
        let (_, ids) = assign_region_ids(r#"<svg><rect data-id="x"/></svg>"#);
        assert_eq!(ids, vec!["auto-shape-0"]);
    }

    #[test]
    fn hit_test_returns_topmost_region() {
        let doc = PatternDocument::parse("test.svg", TWO_REGION_SVG).expect("parse");
        assert_eq!(doc.hit_test((50.0, 50.0)), Some("centro"));
        assert_eq!(doc.hit_test((90.0, 90.0)), Some("auto-shape-0"));
        assert_eq!(doc.hit_test((2.0, 2.0)), Some("auto-shape-2"));
        assert_eq!(doc.hit_test((150.0, 50.0)), None);
    }

    #[test]
    fn render_applies_map_and_default() {
        let doc = PatternDocument::parse("test.svg", TWO_REGION_SVG).expect("parse");
        let mut colors = RegionColorMap::new();
        colors.paint("centro", Rgb8::new(200, 106, 74));
        let img = doc
            .render(&colors, Rgb8::new(10, 20, 30), 100, 100)
            .expect("render");

        assert_eq!(img.get_pixel(50, 50).0, [200, 106, 74, 255]);
        assert_eq!(img.get_pixel(90, 90).0, [10, 20, 30, 255]);
    }

    #[test]
    fn recolor_leaves_document_untouched_and_is_repeatable() {
        let doc = PatternDocument::parse("test.svg", TWO_REGION_SVG).expect("parse");
        let before = doc.markup.clone();
        let mut colors = RegionColorMap::new();
        colors.seed(&doc.region_ids, Rgb8::new(245, 245, 245));
        colors.paint("auto-shape-2", Rgb8::new(0, 0, 255));

        let a = doc.render(&colors, Rgb8::new(0, 0, 0), 64, 64).expect("a");
        let b = doc.render(&colors, Rgb8::new(0, 0, 0), 64, 64).expect("b");
        assert_eq!(a.as_raw(), b.as_raw());
        assert_eq!(doc.markup, before);
    }

    #[test]
    fn region_bounds_cover_geometry() {
        let doc = PatternDocument::parse("test.svg", TWO_REGION_SVG).expect("parse");
        let bounds = doc.region_bounds();
        let centro = bounds.iter().find(|b| b.id == "centro").expect("centro");
        assert!((centro.x - 25.0).abs() < 1e-3);
        assert!((centro.width - 50.0).abs() < 1e-3);
        assert_eq!(bounds[0].id, "auto-shape-0");
    }

    #[test]
    fn seed_keeps_existing_paint_and_reset_clears() {
        let mut colors = RegionColorMap::new();
        colors.paint("a", Rgb8::new(1, 2, 3));
        colors.seed(&["a".to_string(), "b".to_string()], Rgb8::new(9, 9, 9));
        assert_eq!(colors.get("a"), Some(Rgb8::new(1, 2, 3)));
        assert_eq!(colors.get("b"), Some(Rgb8::new(9, 9, 9)));
        colors.reset();
        assert!(colors.is_empty());
    }

    #[test]
    fn malformed_markup_passes_through() {
        let loaded = LoadedPattern::from_markup("broken.svg", "<svg><path");
        match loaded {
            LoadedPattern::Passthrough { raw, .. } => assert_eq!(raw, "<svg><path"),
            LoadedPattern::Vector(_) => panic!("expected passthrough"),
        }
        assert!(LoadedPattern::from_markup("x", "not markup").region_ids().is_empty());
    }

    #[test]
    fn loading_twice_yields_same_ids_and_shares_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("p.svg");
        std::fs::write(&path, TWO_REGION_SVG).expect("write");
        let key = path.to_string_lossy().to_string();

        let cache = AssetCache::new();
        let first = smol::block_on(load_pattern(&cache, &key)).expect("first");
        let second = smol::block_on(load_pattern(&cache, &key)).expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.load_count(), 1);

        let fresh = AssetCache::new();
        let reloaded = smol::block_on(load_pattern(&fresh, &key)).expect("reload");
        assert_eq!(first.region_ids(), reloaded.region_ids());
    }
}
