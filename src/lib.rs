pub mod asset_cache;
pub mod catalog;
mod cli;
pub mod compositor;
pub mod error;
pub mod export;
pub mod pattern;
pub mod pipeline;
pub mod projection;
pub mod room;
pub mod tiling;

pub use catalog::{Catalog, Rgb8};
pub use compositor::{CompositeResult, FloorMask, FloorRule, RoomAsset};
pub use error::{FailureKind, Notice, PipelineError};
pub use pattern::{LoadedPattern, PatternDocument, RegionColorMap, RegionId};
pub use pipeline::{PipelineEvent, PreviewPipeline, RebuildParams, RebuildTicket};
pub use projection::{BackendConfig, LightingControls, Projector};
pub use room::{LoadedRoom, RoomManifest};
pub use tiling::{Rotation, Texture, ViewMode};

use anyhow::{anyhow, bail, Context, Result};
use asset_cache::bitmap_cache;
use clap::Parser;
use cli::{Cli, Commands};
use pattern::{load_pattern, pattern_cache};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

fn parse_paint(entry: &str) -> Result<(String, Rgb8)> {
    let (id, hex) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("paint must look like ID=#RRGGBB, got {entry}"))?;
    let color = catalog::parse_hex(hex).with_context(|| format!("paint for region {id}"))?;
    Ok((id.trim().to_string(), color))
}

fn color_map(doc: &PatternDocument, base: Rgb8, paint: &[String]) -> Result<RegionColorMap> {
    let mut colors = RegionColorMap::new();
    colors.seed(&doc.region_ids, base);
    for entry in paint {
        let (id, color) = parse_paint(entry)?;
        if !doc.has_region(&id) {
            log::warn!("Pattern {} has no region {}; paint ignored", doc.source_key, id);
            continue;
        }
        colors.paint(&id, color);
    }
    Ok(colors)
}

async fn vector_pattern(key: &str) -> Result<Arc<PatternDocument>> {
    let loaded = load_pattern(pattern_cache(), key).await?;
    match loaded.as_ref() {
        LoadedPattern::Vector(doc) => Ok(Arc::clone(doc)),
        LoadedPattern::Passthrough { reason, .. } => {
            bail!("{key} is not a usable vector pattern: {reason}")
        }
    }
}

fn regions_command(pattern: &str, json: bool) -> Result<()> {
    let doc = smol::block_on(vector_pattern(pattern))?;
    if json {
        let bounds = doc.region_bounds();
        println!("{}", serde_json::to_string_pretty(&bounds)?);
    } else {
        for id in &doc.region_ids {
            println!("{id}");
        }
    }
    Ok(())
}

fn texture_command(
    pattern: &str,
    out: &Path,
    rotation: f32,
    repeat: u32,
    base: &str,
    paint: &[String],
) -> Result<()> {
    let start = Instant::now();
    let doc = smol::block_on(vector_pattern(pattern))?;
    let base = catalog::parse_hex(base)?;
    let colors = color_map(&doc, base, paint)?;
    let texture =
        tiling::build_texture(&doc, &colors, base, Rotation::from_degrees(rotation), repeat)?;
    export::write_png(out, &texture.image)?;
    log::info!(
        "Wrote {}x{} texture to {} in {}ms",
        texture.width(),
        texture.height(),
        out.display(),
        start.elapsed().as_millis()
    );
    Ok(())
}

struct RenderArgs {
    room: PathBuf,
    pattern: String,
    out: Option<PathBuf>,
    rotation: f32,
    repeat: u32,
    base: String,
    paint: Vec<String>,
    shadow: Option<f32>,
    exposure: Option<f32>,
}

fn render_command(args: RenderArgs) -> Result<()> {
    let manifest = RoomManifest::from_path(&args.room)
        .with_context(|| format!("reading room manifest {}", args.room.display()))?;
    let base = catalog::parse_hex(&args.base)?;

    smol::block_on(async {
        let room = room::load_room(bitmap_cache(), manifest).await?;
        let (pipeline, events) = PreviewPipeline::new(room);

        let mut params = RebuildParams::new(&args.pattern, base);
        params.rotation = Rotation::from_degrees(args.rotation);
        params.repeat = args.repeat;
        params.shadow_intensity = args.shadow;
        params.lighting = args.exposure.map(|exposure| LightingControls {
            exposure,
            ..pipeline.room().manifest.backend.lighting().unwrap_or_default()
        });
        if let Ok(doc) = vector_pattern(&args.pattern).await {
            params.colors = color_map(&doc, base, &args.paint)?;
        }

        let result = pipeline.rebuild(&params).await?;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::Notice(notice) = event {
                log::warn!("{:?}: {}", notice.kind, notice.message);
            }
        }

        let path = match &args.out {
            Some(path) => {
                export::write_png(path, &result.image)?;
                path.clone()
            }
            None => pipeline.export_to_dir(Path::new(".")).await?,
        };
        println!("{}", path.display());
        Ok::<(), anyhow::Error>(())
    })
}

/// Parses the command line and runs the selected command.
pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Regions { pattern, json } => regions_command(&pattern, json),
        Commands::Texture {
            pattern,
            out,
            rotation,
            repeat,
            base,
            paint,
        } => texture_command(&pattern, &out, rotation, repeat, &base, &paint),
        Commands::Render {
            room,
            pattern,
            out,
            rotation,
            repeat,
            base,
            paint,
            shadow,
            exposure,
        } => render_command(RenderArgs {
            room,
            pattern,
            out,
            rotation,
            repeat,
            base,
            paint,
            shadow,
            exposure,
        }),
    }
}
