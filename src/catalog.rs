//! Pattern, color and size catalogs supplied by the product-selection layer.

use crate::error::PipelineError;
use palette::Srgb;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Opaque 8-bit sRGB color used for region fills.
pub type Rgb8 = Srgb<u8>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternZone {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternDescriptor {
    pub id: String,
    pub code: String,
    pub name: String,
    pub preview_url: String,
    #[serde(default)]
    pub svg_path: Option<String>,
    #[serde(default)]
    pub zones: Option<Vec<PatternZone>>,
}

impl PatternDescriptor {
    pub fn has_vector_source(&self) -> bool {
        self.svg_path
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false)
    }

    /// UI label for a region, when the catalog names it.
    pub fn zone_label(&self, region_id: &str) -> Option<&str> {
        self.zones
            .as_ref()?
            .iter()
            .find(|zone| zone.id == region_id)
            .map(|zone| zone.label.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorDescriptor {
    pub id: String,
    pub name: String,
    pub hex: String,
}

impl ColorDescriptor {
    pub fn rgb(&self) -> Result<Rgb8, PipelineError> {
        parse_hex(&self.hex)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeDescriptor {
    pub id: String,
    pub label: String,
    pub width_cm: f32,
    pub height_cm: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub patterns: Vec<PatternDescriptor>,
    pub colors: Vec<ColorDescriptor>,
    pub sizes: Vec<SizeDescriptor>,
}

impl Catalog {
    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        let catalog: Catalog = serde_json::from_str(raw)
            .map_err(|err| PipelineError::InvalidParameter(format!("catalog: {err}")))?;
        for color in &catalog.colors {
            color.rgb()?;
        }
        Ok(catalog)
    }

    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| PipelineError::asset_load(&path.to_string_lossy(), err))?;
        Self::from_json(&raw)
    }

    /// Falls back to the first pattern when `id` is unknown.
    pub fn pattern(&self, id: &str) -> Option<&PatternDescriptor> {
        self.patterns
            .iter()
            .find(|p| p.id == id)
            .or_else(|| self.patterns.first())
    }

    pub fn color(&self, id: &str) -> Option<&ColorDescriptor> {
        self.colors.iter().find(|c| c.id == id)
    }

    /// Falls back to the first size when `id` is unknown.
    pub fn size(&self, id: &str) -> Option<&SizeDescriptor> {
        self.sizes
            .iter()
            .find(|s| s.id == id)
            .or_else(|| self.sizes.first())
    }

    /// Base color new regions are seeded with.
    pub fn base_color(&self) -> Rgb8 {
        self.colors
            .first()
            .and_then(|c| c.rgb().ok())
            .unwrap_or(Srgb::new(0xf5, 0xf5, 0xf5))
    }
}

/// Accepts `#rrggbb`, `rrggbb` and `#rgb`.
pub fn parse_hex(hex: &str) -> Result<Rgb8, PipelineError> {
    hex.trim()
        .parse::<Rgb8>()
        .map_err(|err| PipelineError::InvalidParameter(format!("color {hex:?}: {err}")))
}

pub fn to_hex(color: Rgb8) -> String {
    format!("#{:02X}{:02X}{:02X}", color.red, color.green, color.blue)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r##"{
        "patterns": [
            {"id": "pattern-A", "code": "A", "name": "Mosaico A", "previewUrl": "/patterns/10667.svg", "svgPath": "/patterns/10667.svg",
             "zones": [{"id": "borde", "label": "Borde"}]},
            {"id": "pattern-B", "code": "B", "name": "Mosaico B", "previewUrl": "/patterns/10446.png"}
        ],
        "colors": [
            {"id": "c1", "name": "Blanco puro", "hex": "#ffffff"},
            {"id": "c11", "name": "Terracota", "hex": "#c86a4a"}
        ],
        "sizes": [
            {"id": "15x15", "label": "15 x 15 cm", "widthCm": 15, "heightCm": 15},
            {"id": "20x20", "label": "20 x 20 cm", "widthCm": 20, "heightCm": 20}
        ]
    }"##;

    #[test]
    fn test_hex_conversion() {
        assert_eq!(parse_hex("#FF0000").unwrap(), Srgb::new(255, 0, 0));
        assert_eq!(parse_hex("00ff00").unwrap(), Srgb::new(0, 255, 0));
        assert_eq!(parse_hex("#fff").unwrap(), Srgb::new(255, 255, 255));
        assert_eq!(to_hex(Srgb::new(200, 106, 74)), "#C86A4A");
        assert!(parse_hex("#zzzzzz").is_err());
    }

    #[test]
    fn catalog_lookups_fall_back_to_first_entry() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.pattern("missing").unwrap().id, "pattern-A");
        assert_eq!(catalog.size("20x20").unwrap().width_cm, 20.0);
        assert_eq!(catalog.size("nope").unwrap().id, "15x15");
        assert!(catalog.color("nope").is_none());
        assert_eq!(catalog.base_color(), Srgb::new(255, 255, 255));
    }

    #[test]
    fn patterns_without_svg_have_no_vector_source() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        assert!(catalog.patterns[0].has_vector_source());
        assert!(!catalog.patterns[1].has_vector_source());
        assert_eq!(catalog.patterns[0].zone_label("borde"), Some("Borde"));
    }

    #[test]
    fn invalid_color_rejects_catalog() {
        let raw = r#"{"patterns": [], "colors": [{"id": "x", "name": "x", "hex": "nothex"}], "sizes": []}"#;
        assert!(Catalog::from_json(raw).is_err());
    }
}
