//! Images as they leave the engine.

use crate::axis::AxisCoords;
use serde::{Deserialize, Serialize};

/// Physical parameters recorded with every image.
///
/// `coords`, `z_um` and `xy_um` are exactly what was used to position the
/// hardware for this image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Run the image belongs to.
    pub run_uid: String,
    /// Position of the image in the acquisition stream, from 0.
    pub seq_num: u64,
    /// Channel preset name.
    pub channel: Option<String>,
    /// Focus position in µm, channel offset included.
    pub z_um: Option<f64>,
    /// XY stage position in µm.
    pub xy_um: Option<(f64, f64)>,
    /// Position label.
    pub position_label: Option<String>,
    /// Tile grid row.
    pub grid_row: Option<i64>,
    /// Tile grid column.
    pub grid_col: Option<i64>,
    /// Tile overlap in pixels along X and Y.
    pub overlap_px: Option<(u32, u32)>,
    /// Exposure in ms.
    pub exposure_ms: Option<f64>,
    /// Milliseconds since the run started.
    pub elapsed_ms: f64,
    /// Wall clock at readout, ns since Unix epoch.
    pub timestamp_ns: u64,
    /// Shutter was left open after this image.
    pub shutter_open: bool,
}

/// Image plus the coordinates and metadata it was acquired with.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedImage {
    /// Row-major pixel data.
    pub pixels: Vec<u16>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Axis coordinates of the event that produced the image.
    pub coords: AxisCoords,
    /// Physical metadata.
    pub metadata: ImageMetadata,
}

impl TaggedImage {
    /// Metadata as JSON, as written next to the pixels by datastores.
    pub fn metadata_json(&self) -> serde_json::Result<serde_json::Value> {
        let mut value = serde_json::to_value(&self.metadata)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("coords".to_string(), serde_json::to_value(&self.coords)?);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::AxisKind;

    #[test]
    fn test_metadata_json_contains_coords() {
        let image = TaggedImage {
            pixels: vec![0; 4],
            width: 2,
            height: 2,
            coords: AxisCoords::new()
                .with(AxisKind::Time, 1)
                .with(AxisKind::Channel, 0),
            metadata: ImageMetadata {
                run_uid: "run".into(),
                seq_num: 7,
                channel: Some("DAPI".into()),
                z_um: Some(1.5),
                xy_um: None,
                position_label: None,
                grid_row: None,
                grid_col: None,
                overlap_px: None,
                exposure_ms: Some(10.0),
                elapsed_ms: 12.0,
                timestamp_ns: 0,
                shutter_open: false,
            },
        };
        let json = image.metadata_json().unwrap();
        assert_eq!(json["seq_num"], 7);
        assert_eq!(json["coords"]["time"], 1);
        assert_eq!(json["coords"]["channel"], 0);
    }
}
