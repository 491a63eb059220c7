//! Microscope handler contract (spec §4.2). Each handler parses a vendor's
//! filename convention into a component tuple. Grounded on the teacher's
//! `MicroscopeHandler`-shaped capability traits elsewhere in the pack
//! (`turbulance/orchestrator.rs` dispatches on trait objects the same way:
//! one concrete type per backend, selected by configuration rather than by
//! inheritance).

use crate::config_error;
use crate::error::Result;
use crate::model::{ComponentKind, ComponentTuple, ComponentValue};
use regex::Regex;
use once_cell::sync::Lazy;

/// Decoded position metadata for a single microscope field-of-view.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    pub well: String,
    pub site: Option<u32>,
    pub channel: Option<u32>,
    pub z_index: Option<u32>,
    pub timepoint: Option<u32>,
}

impl ParsedFile {
    pub fn into_components(self) -> ComponentTuple {
        let mut out = ComponentTuple::new();
        out.push((ComponentKind::Well, ComponentValue::Text(self.well)));
        if let Some(site) = self.site {
            out.push((ComponentKind::Site, ComponentValue::Index(site)));
        }
        if let Some(channel) = self.channel {
            out.push((ComponentKind::Channel, ComponentValue::Index(channel)));
        }
        if let Some(z) = self.z_index {
            out.push((ComponentKind::ZIndex, ComponentValue::Index(z)));
        }
        if let Some(t) = self.timepoint {
            out.push((ComponentKind::Timepoint, ComponentValue::Index(t)));
        }
        out
    }
}

/// Pixel size in microns per pixel, (x, y).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelSize {
    pub x: f64,
    pub y: f64,
}

/// Grid dimensions of the plate (rows, columns of wells).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDimensions {
    pub rows: u32,
    pub columns: u32,
}

/// External capability contract a storage format implements to let pattern
/// discovery and the path planner enumerate and address its files (spec
/// §4.2).
pub trait MicroscopeHandler: Send + Sync {
    fn parse(&self, file_name: &str) -> Result<ParsedFile>;
    fn list_wells(&self, file_names: &[String]) -> Result<Vec<String>>;
    fn grid_dimensions(&self) -> GridDimensions;
    fn pixel_size(&self) -> PixelSize;
}

static IMAGEXPRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<well>[A-Z]\d{2})_s(?P<site>\d+)_w(?P<channel>\d+)(?:_z(?P<z>\d+))?(?:_t(?P<t>\d+))?\.tif+$")
        .unwrap()
});

/// Molecular Devices ImageXpress naming: `A01_s1_w1_z001_t001.tif`.
pub struct ImageXpressHandler {
    grid: GridDimensions,
    pixel_size: PixelSize,
}

impl ImageXpressHandler {
    pub fn new(grid: GridDimensions, pixel_size: PixelSize) -> Self {
        Self { grid, pixel_size }
    }
}

impl MicroscopeHandler for ImageXpressHandler {
    fn parse(&self, file_name: &str) -> Result<ParsedFile> {
        let caps = IMAGEXPRESS_RE
            .captures(file_name)
            .ok_or_else(|| config_error!(format!("'{file_name}' does not match the ImageXpress naming convention")))?;
        Ok(ParsedFile {
            well: caps["well"].to_string(),
            site: caps.name("site").map(|m| m.as_str().parse().unwrap()),
            channel: caps.name("channel").map(|m| m.as_str().parse().unwrap()),
            z_index: caps.name("z").map(|m| m.as_str().parse().unwrap()),
            timepoint: caps.name("t").map(|m| m.as_str().parse().unwrap()),
        })
    }

    fn list_wells(&self, file_names: &[String]) -> Result<Vec<String>> {
        list_wells_via(self, file_names)
    }

    fn grid_dimensions(&self) -> GridDimensions {
        self.grid
    }

    fn pixel_size(&self) -> PixelSize {
        self.pixel_size
    }
}

static OPERA_PHENIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^r(?P<row>\d+)c(?P<col>\d+)f(?P<site>\d+)p(?P<z>\d+)-ch(?P<channel>\d+)sk(?P<t>\d+)\.tiff?$").unwrap()
});

/// PerkinElmer Opera Phenix naming: `r01c01f01p01-ch1sk1.tiff`.
pub struct OperaPhenixHandler {
    grid: GridDimensions,
    pixel_size: PixelSize,
}

impl OperaPhenixHandler {
    pub fn new(grid: GridDimensions, pixel_size: PixelSize) -> Self {
        Self { grid, pixel_size }
    }

    fn well_label(row: u32, col: u32) -> String {
        let letter = (b'A' + (row.saturating_sub(1) as u8)) as char;
        format!("{letter}{col:02}")
    }
}

impl MicroscopeHandler for OperaPhenixHandler {
    fn parse(&self, file_name: &str) -> Result<ParsedFile> {
        let caps = OPERA_PHENIX_RE
            .captures(file_name)
            .ok_or_else(|| config_error!(format!("'{file_name}' does not match the Opera Phenix naming convention")))?;
        let row: u32 = caps["row"].parse().unwrap();
        let col: u32 = caps["col"].parse().unwrap();
        Ok(ParsedFile {
            well: Self::well_label(row, col),
            site: caps.name("site").map(|m| m.as_str().parse().unwrap()),
            channel: caps.name("channel").map(|m| m.as_str().parse().unwrap()),
            z_index: caps.name("z").map(|m| m.as_str().parse().unwrap()),
            timepoint: caps.name("t").map(|m| m.as_str().parse().unwrap()),
        })
    }

    fn list_wells(&self, file_names: &[String]) -> Result<Vec<String>> {
        list_wells_via(self, file_names)
    }

    fn grid_dimensions(&self) -> GridDimensions {
        self.grid
    }

    fn pixel_size(&self) -> PixelSize {
        self.pixel_size
    }
}

static NATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<well>[A-Z]\d{2})__s(?P<site>\d+)__w(?P<channel>\d+)__z(?P<z>\d+)__t(?P<t>\d+)\.bin$").unwrap()
});

/// OpenHCS's own flat-file naming for already-materialized archives.
pub struct NativeHandler {
    grid: GridDimensions,
    pixel_size: PixelSize,
}

impl NativeHandler {
    pub fn new(grid: GridDimensions, pixel_size: PixelSize) -> Self {
        Self { grid, pixel_size }
    }
}

impl MicroscopeHandler for NativeHandler {
    fn parse(&self, file_name: &str) -> Result<ParsedFile> {
        let caps = NATIVE_RE
            .captures(file_name)
            .ok_or_else(|| config_error!(format!("'{file_name}' does not match the native naming convention")))?;
        Ok(ParsedFile {
            well: caps["well"].to_string(),
            site: Some(caps["site"].parse().unwrap()),
            channel: Some(caps["channel"].parse().unwrap()),
            z_index: Some(caps["z"].parse().unwrap()),
            timepoint: Some(caps["t"].parse().unwrap()),
        })
    }

    fn list_wells(&self, file_names: &[String]) -> Result<Vec<String>> {
        list_wells_via(self, file_names)
    }

    fn grid_dimensions(&self) -> GridDimensions {
        self.grid
    }

    fn pixel_size(&self) -> PixelSize {
        self.pixel_size
    }
}

fn list_wells_via(handler: &dyn MicroscopeHandler, file_names: &[String]) -> Result<Vec<String>> {
    let mut wells: Vec<String> = file_names
        .iter()
        .filter_map(|name| handler.parse(name).ok())
        .map(|p| p.well)
        .collect();
    wells.sort();
    wells.dedup();
    Ok(wells)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> GridDimensions {
        GridDimensions { rows: 8, columns: 12 }
    }
    fn pixels() -> PixelSize {
        PixelSize { x: 0.65, y: 0.65 }
    }

    #[test]
    fn imagexpress_parses_full_filename() {
        let handler = ImageXpressHandler::new(grid(), pixels());
        let parsed = handler.parse("A01_s1_w2_z003_t001.tif").unwrap();
        assert_eq!(parsed.well, "A01");
        assert_eq!(parsed.site, Some(1));
        assert_eq!(parsed.channel, Some(2));
        assert_eq!(parsed.z_index, Some(3));
        assert_eq!(parsed.timepoint, Some(1));
    }

    #[test]
    fn imagexpress_tolerates_missing_optional_fields() {
        let handler = ImageXpressHandler::new(grid(), pixels());
        let parsed = handler.parse("A01_s1_w2.tif").unwrap();
        assert_eq!(parsed.z_index, None);
        assert_eq!(parsed.timepoint, None);
    }

    #[test]
    fn imagexpress_rejects_foreign_filename() {
        let handler = ImageXpressHandler::new(grid(), pixels());
        assert!(handler.parse("r01c01f01p01-ch1sk1.tiff").is_err());
    }

    #[test]
    fn opera_phenix_derives_well_label_from_row_col() {
        let handler = OperaPhenixHandler::new(grid(), pixels());
        let parsed = handler.parse("r02c05f01p01-ch1sk1.tiff").unwrap();
        assert_eq!(parsed.well, "B05");
    }

    #[test]
    fn list_wells_dedupes_and_sorts() {
        let handler = ImageXpressHandler::new(grid(), pixels());
        let files = vec![
            "B01_s1_w1.tif".to_string(),
            "A01_s1_w1.tif".to_string(),
            "A01_s2_w1.tif".to_string(),
        ];
        assert_eq!(handler.list_wells(&files).unwrap(), vec!["A01".to_string(), "B01".to_string()]);
    }
}
