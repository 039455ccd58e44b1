#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect,
    clippy::match_result_ok,
    clippy::cmp_owned,
    clippy::op_ref
)]

pub mod aggregate;
pub mod cluster;
pub mod config;
pub mod field_match;
pub mod metadata;
pub mod pipeline;
pub mod projection;
pub mod store;

use chrono::NaiveDateTime;
use geo_types::Polygon;
use serde::{Deserialize, Serialize};

pub const WGS_84_SRID: u32 = 4326;
pub const WEB_MERCATOR_SRID: u32 = 3857;

/// Sensor family an image came from, derived from the camera model tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    Multispectral,
    Rgb,
    Unknown,
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageType::Multispectral => write!(f, "Multispectral"),
            ImageType::Rgb => write!(f, "RGB"),
            ImageType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One geotagged image as seen by the matching and clustering core.
///
/// Longitude and latitude are degrees in WGS84. Construction goes through
/// [`ImagePosition::new`] so a record with coordinates outside the valid
/// angular domain is never built. Positions without a GPS fix are rejected
/// upstream (see [`metadata`]); there is no (0, 0) sentinel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImagePosition {
    pub id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub timestamp: Option<NaiveDateTime>,
    pub image_type: ImageType,
}

impl ImagePosition {
    pub fn new(
        id: String,
        longitude: f64,
        latitude: f64,
        timestamp: Option<NaiveDateTime>,
        image_type: ImageType,
    ) -> Result<ImagePosition, projection::ProjectionError> {
        if !(-180.0..=180.0).contains(&longitude) || !(-90.0..=90.0).contains(&latitude) {
            return Err(projection::ProjectionError::CoordinateOutOfRange {
                longitude,
                latitude,
            });
        }
        Ok(ImagePosition {
            id,
            longitude,
            latitude,
            timestamp,
            image_type,
        })
    }

    pub fn point(&self) -> geo_types::Point<f64> {
        geo_types::Point::new(self.longitude, self.latitude)
    }
}

/// A surveyed field plot. The boundary stays in the angular frame (WGS84);
/// reprojection and buffering happen per matching pass.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldPolygon {
    pub field_id: String,
    pub boundary: Polygon<f64>,
}

/// Final per-image routing decision handed to the file organizer.
///
/// An image inside the overlap of several buffered fields produces one
/// `Assignment` per field, each with that field's independently computed
/// cluster label. An image matching no field produces a single record with
/// `field_id: None` and `out_of_bounds: true`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub image_id: String,
    pub field_id: Option<String>,
    pub cluster_label: Option<u32>,
    pub out_of_bounds: bool,
}
