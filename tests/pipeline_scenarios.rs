use image::{Rgba, RgbaImage};
use mosaico_lib::compositor::{classify, FloorRule, RoomAsset};
use mosaico_lib::pattern::{assign_region_ids, PatternDocument, RegionColorMap};
use mosaico_lib::pipeline::{PipelineEvent, PreviewPipeline, RebuildParams};
use mosaico_lib::projection::{BackendConfig, Projector, Quad, QuadWarp, Scene, SceneConfig};
use mosaico_lib::room::{LoadedRoom, RoomManifest};
use mosaico_lib::tiling::{build_mosaic, build_texture, build_tile, Rotation, Texture};
use mosaico_lib::{PipelineError, Rgb8};
use std::fs;
use std::sync::Arc;

const CHECKER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="2" height="2" viewBox="0 0 2 2">
  <rect id="a" x="0" y="0" width="1" height="1" fill="#000000"/>
  <rect id="b" x="1" y="0" width="1" height="1" fill="#ffffff"/>
  <rect id="c" x="0" y="1" width="1" height="1" fill="#ffffff"/>
  <rect id="d" x="1" y="1" width="1" height="1" fill="#000000"/>
</svg>"##;

const BLACK: Rgb8 = Rgb8::new(0, 0, 0);
const WHITE: Rgb8 = Rgb8::new(255, 255, 255);

fn checker_colors() -> RegionColorMap {
    let mut colors = RegionColorMap::new();
    colors.paint("a", BLACK);
    colors.paint("b", WHITE);
    colors.paint("c", WHITE);
    colors.paint("d", BLACK);
    colors
}

fn full_canvas_warp(size: u32) -> QuadWarp {
    QuadWarp::new(Quad::from_rect(0.0, 0.0, size as f32, size as f32))
}

fn black_room(size: u32) -> LoadedRoom {
    let mut manifest = RoomManifest::kitchen("unused.png");
    manifest.canvas_width = size;
    manifest.canvas_height = size;
    manifest.backend = BackendConfig::QuadWarp(full_canvas_warp(size));
    let photo = Arc::new(RgbaImage::from_pixel(size, size, Rgba([0, 0, 0, 255])));
    let asset = RoomAsset::new("black", photo, None, FloorRule::default()).expect("room");
    LoadedRoom {
        manifest,
        asset,
        shadow: None,
        notices: Vec::new(),
    }
}

#[test]
fn checkerboard_composite_center_is_a_tile_color() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("checker.svg");
    fs::write(&source, CHECKER_SVG).expect("write");

    let (pipeline, _events) = PreviewPipeline::new(black_room(64));
    let mut params = RebuildParams::new(&source.to_string_lossy(), WHITE);
    params.colors = checker_colors();
    params.repeat = 4;
    let result = smol::block_on(pipeline.rebuild(&params)).expect("rebuild");

    assert!(result.notices.is_empty());
    let center = result.image.get_pixel(32, 32).0;
    assert!(center == [0, 0, 0, 255] || center == [255, 255, 255, 255], "{center:?}");
    assert!(result.image.pixels().any(|p| p.0 == [0, 0, 0, 255]));
    assert!(result.image.pixels().any(|p| p.0 == [255, 255, 255, 255]));
}

#[test]
fn black_photo_is_all_floor_with_transparent_foreground() {
    let photo = RgbaImage::from_pixel(12, 8, Rgba([0, 0, 0, 255]));
    let mask = classify(&photo, &FloorRule::default());
    assert_eq!(mask.coverage(), 1.0);

    let room = RoomAsset::new("dark", Arc::new(photo), None, FloorRule::default()).expect("room");
    assert!(room.foreground_layer().pixels().all(|p| p.0[3] == 0));
}

#[test]
fn full_canvas_quad_reproduces_source() {
    let source = RgbaImage::from_fn(16, 16, |x, y| Rgba([(x * 16) as u8, (y * 16) as u8, 7, 255]));
    let out = full_canvas_warp(16).warp(&source, 16, 16).expect("warp");
    assert_eq!(out, source);
}

#[test]
fn mosaic_cells_match_across_shared_edges() {
    let doc = PatternDocument::parse("checker", CHECKER_SVG).expect("parse");
    let tile = build_tile(&doc, &checker_colors(), WHITE, Rotation::from_degrees(90.0))
        .expect("tile");
    let Texture { image, repeat } = build_mosaic(&tile, 3).expect("mosaic");
    assert_eq!(repeat, 3);
    let (tw, th) = tile.dimensions();
    for y in (0..th).step_by(37) {
        assert_eq!(image.get_pixel(tw - 1, y), image.get_pixel(2 * tw - 1, y));
        assert_eq!(image.get_pixel(tw, y), image.get_pixel(0, y));
    }
    for x in (0..tw).step_by(37) {
        assert_eq!(image.get_pixel(x, th), image.get_pixel(x, 0));
    }
}

#[test]
fn erosion_never_grows_the_floor() {
    let mask_image = RgbaImage::from_fn(20, 20, |x, y| {
        if (3..15).contains(&x) && (5..18).contains(&y) {
            Rgba([255, 0, 255, 255])
        } else {
            Rgba([30, 30, 30, 255])
        }
    });
    let rule = FloorRule::KeyColor {
        key: [255, 0, 255],
        tolerance: [15, 10, 15],
        erode: false,
    };
    let raw = classify(&mask_image, &rule);
    let eroded = raw.eroded();
    assert!(eroded.floor_count() < raw.floor_count());
    for y in 0..20 {
        for x in 0..20 {
            if eroded.is_floor(x, y) {
                assert!(raw.is_floor(x, y));
            }
        }
    }
}

#[test]
fn only_the_newest_rebuild_publishes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("checker.svg");
    fs::write(&source, CHECKER_SVG).expect("write");
    let source = source.to_string_lossy().to_string();

    let (pipeline, events) = PreviewPipeline::new(black_room(16));
    let mut first = RebuildParams::new(&source, WHITE);
    first.colors = checker_colors();
    let mut second = first.clone();
    second.default_color = BLACK;
    second.colors = RegionColorMap::new();

    let older = pipeline.begin();
    let newer = pipeline.begin();
    let (r1, r2) = smol::block_on(smol::future::zip(
        pipeline.rebuild_with(&older, &first),
        pipeline.rebuild_with(&newer, &second),
    ));

    assert!(matches!(r1, Err(PipelineError::Cancelled)));
    let published = r2.expect("newest rebuild");
    assert_eq!(published.image.get_pixel(8, 8).0, [0, 0, 0, 255]);
    assert_eq!(pipeline.latest().as_deref(), Some(published.as_ref()));

    let ready = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, PipelineEvent::CompositeReady(_)))
        .count();
    assert_eq!(ready, 1);
}

#[test]
fn region_ids_are_stable_across_parses() {
    let markup = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 10 10">
  <rect x="0" y="0" width="10" height="10" fill="#eee"/>
  <path id="" d="M0 0 L5 0 L5 5 Z" fill="#111"/>
  <polygon id="dup" points="5,5 10,5 10,10"/>
  <polygon id="dup" points="0,5 5,5 0,10"/>
</svg>"##;
    let (_, first) = assign_region_ids(markup);
    let (_, second) = assign_region_ids(markup);
    assert_eq!(first, second);
    assert_eq!(first, vec!["auto-shape-0", "auto-shape-1", "dup", "auto-shape-3"]);

    let a = PatternDocument::parse("k", markup).expect("parse");
    let b = PatternDocument::parse("k", markup).expect("parse");
    assert_eq!(a.region_ids, b.region_ids);
}

#[test]
fn repainting_with_the_same_color_changes_nothing() {
    let doc = PatternDocument::parse("checker", CHECKER_SVG).expect("parse");
    let mut colors = checker_colors();
    let before = build_tile(&doc, &colors, WHITE, Rotation::default()).expect("tile");
    colors.paint("a", BLACK);
    colors.paint("a", BLACK);
    let after = build_tile(&doc, &colors, WHITE, Rotation::default()).expect("tile");
    assert_eq!(before, after);
}

#[test]
fn kitchen_scene_draws_the_floor() {
    let doc = PatternDocument::parse("checker", CHECKER_SVG).expect("parse");
    let texture = build_texture(&doc, &checker_colors(), WHITE, Rotation::default(), 2)
        .expect("texture");
    let config = SceneConfig::kitchen();
    let clear = config.clear_color;
    let mut scene = Scene::new(config);
    let out = scene.project(&texture, 96, 54).expect("render");
    assert!(out.pixels().any(|p| p.0[..3] != clear));
    assert!(scene.has_texture());
}
