use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{ImageFormat, RgbaImage};
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Instant;
use tempfile::NamedTempFile;

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, PipelineError> {
    let start = Instant::now();
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| PipelineError::Encode(format!("PNG encode failed: {}", e)))?;
    log::debug!(
        "Encoded {}x{} PNG ({} bytes) in {}ms",
        image.width(),
        image.height(),
        bytes.len(),
        start.elapsed().as_millis()
    );
    Ok(bytes)
}

pub fn to_data_url(png: &[u8]) -> String {
    format!("{}{}", PNG_DATA_URL_PREFIX, STANDARD.encode(png))
}

/// Default download name for a room export.
pub fn export_file_name(room_name: &str) -> String {
    let slug: String = room_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "floor-preview.png".to_string()
    } else {
        format!("{}-floor-preview.png", slug)
    }
}

/// Writes `contents` to a temp file next to `path`, then persists it over
/// `path` so readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PipelineError> {
    let io_err = |err: std::io::Error| PipelineError::Encode(format!("{}: {}", path.display(), err));
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent).map_err(io_err)?;
            parent
        }
        None => Path::new("."),
    };

    let mut staged = NamedTempFile::new_in(dir).map_err(io_err)?;
    staged.write_all(contents).map_err(io_err)?;
    staged.persist(path).map_err(|err| io_err(err.error))?;
    Ok(())
}

/// Encodes `image` and writes it atomically.
pub fn write_png(path: &Path, image: &RgbaImage) -> Result<(), PipelineError> {
    let png = encode_png(image)?;
    write_atomic(path, &png)?;
    log::info!("Exported {} ({}x{})", path.display(), image.width(), image.height());
    Ok(())
}
