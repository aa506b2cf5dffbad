//! Command-line argument definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Mosaico - tile pattern textures and room floor previews
#[derive(Parser)]
#[command(name = "mosaico")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List the paintable regions of a vector pattern
    Regions {
        /// Path or data URL of the SVG pattern
        pattern: String,

        /// Print region bounds as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render a seamless texture from a pattern
    Texture {
        /// Path or data URL of the SVG pattern
        pattern: String,

        /// Output PNG path
        #[arg(short, long)]
        out: PathBuf,

        /// Quarter-turn rotation in degrees (0, 90, 180, 270)
        #[arg(long, default_value_t = 0.0)]
        rotation: f32,

        /// Tiles per side
        #[arg(long, default_value_t = 4)]
        repeat: u32,

        /// Base colour for unpainted regions
        #[arg(long, default_value = "#ffffff")]
        base: String,

        /// Region paint as ID=#RRGGBB, repeatable
        #[arg(long = "paint", value_name = "ID=HEX")]
        paint: Vec<String>,
    },

    /// Composite a pattern onto a room floor
    Render {
        /// Room manifest JSON
        #[arg(long)]
        room: PathBuf,

        /// Path or data URL of the SVG pattern
        #[arg(long)]
        pattern: String,

        /// Output PNG path; defaults to the room's export name in the
        /// current directory
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Quarter-turn rotation in degrees (0, 90, 180, 270)
        #[arg(long, default_value_t = 0.0)]
        rotation: f32,

        /// Tiles per side
        #[arg(long, default_value_t = 4)]
        repeat: u32,

        /// Base colour for unpainted regions
        #[arg(long, default_value = "#ffffff")]
        base: String,

        /// Region paint as ID=#RRGGBB, repeatable
        #[arg(long = "paint", value_name = "ID=HEX")]
        paint: Vec<String>,

        /// Overrides the room's shadow intensity (0..1)
        #[arg(long)]
        shadow: Option<f32>,

        /// Scene exposure multiplier; defaults to the room's calibration
        #[arg(long)]
        exposure: Option<f32>,
    },
}
