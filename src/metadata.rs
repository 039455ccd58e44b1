// ===========================================================================
// Metadata Provider Boundary
// ===========================================================================
// EXIF/XMP byte decoding lives outside this crate; the core consumes one
// `ImagePosition` record per image. This module fixes the contract at that
// boundary: camera models map to a tagged capability profile instead of
// per-vendor attribute probing, and a missing GPS fix is a reported failure,
// never a silent (0, 0) default.

use crate::{ImagePosition, ImageType};
use chrono::NaiveDateTime;
use log::warn;
use thiserror::Error;

/// EXIF `DateTimeOriginal` layout.
pub const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";
const ISO_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Camera families the fleet flies. Each profile answers the same questions;
/// adding a camera means adding a variant, not another attribute probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraProfile {
    /// Parrot Sequoia multispectral sensor.
    Sequoia,
    /// DJI Zenmuse H20T RGB/thermal gimbal.
    Zh20t,
    Unknown,
}

impl CameraProfile {
    pub fn from_model(model: &str) -> CameraProfile {
        match model {
            "Sequoia" => CameraProfile::Sequoia,
            "ZH20T" => CameraProfile::Zh20t,
            _ => CameraProfile::Unknown,
        }
    }

    pub fn image_type(&self) -> ImageType {
        match self {
            CameraProfile::Sequoia => ImageType::Multispectral,
            CameraProfile::Zh20t => ImageType::Rgb,
            CameraProfile::Unknown => ImageType::Unknown,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetadataError {
    #[error("no GPS fix recorded for {0}")]
    MissingGpsFix(String),
    #[error("coordinates ({longitude}, {latitude}) for {id} outside the WGS84 domain")]
    InvalidCoordinate {
        id: String,
        longitude: f64,
        latitude: f64,
    },
    #[error("malformed capture timestamp {value:?} for {id}")]
    MalformedTimestamp { id: String, value: String },
    #[error("could not read metadata for {id}: {reason}")]
    Unreadable { id: String, reason: String },
}

/// Raw tag values as a decoder hands them over, before validation.
#[derive(Clone, Debug, Default)]
pub struct RawImageMetadata {
    pub camera_model: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub timestamp: Option<String>,
}

/// Validate raw tag values into an [`ImagePosition`].
///
/// An absent coordinate pair and the literal (0, 0) both count as a missing
/// fix: receivers that lost lock emit (0, 0), and no survey flies over Null
/// Island. A malformed timestamp fails the record rather than truncating it.
pub fn position_from_raw(
    image_id: &str,
    raw: &RawImageMetadata,
) -> Result<ImagePosition, MetadataError> {
    let (Some(longitude), Some(latitude)) = (raw.longitude, raw.latitude) else {
        return Err(MetadataError::MissingGpsFix(image_id.to_string()));
    };
    if longitude == 0.0 && latitude == 0.0 {
        return Err(MetadataError::MissingGpsFix(image_id.to_string()));
    }

    let timestamp = match &raw.timestamp {
        None => None,
        Some(value) => Some(
            NaiveDateTime::parse_from_str(value, EXIF_DATETIME_FORMAT)
                .or_else(|_| NaiveDateTime::parse_from_str(value, ISO_DATETIME_FORMAT))
                .map_err(|_| MetadataError::MalformedTimestamp {
                    id: image_id.to_string(),
                    value: value.clone(),
                })?,
        ),
    };

    let profile = CameraProfile::from_model(raw.camera_model.as_deref().unwrap_or("Unknown"));

    ImagePosition::new(
        image_id.to_string(),
        longitude,
        latitude,
        timestamp,
        profile.image_type(),
    )
    .map_err(|_| MetadataError::InvalidCoordinate {
        id: image_id.to_string(),
        longitude,
        latitude,
    })
}

/// Resolves positions for image identifiers. Implementations wrap whatever
/// actually reads the tags (a file decoder, a sidecar index, a test stub).
pub trait MetadataProvider {
    fn resolve(&self, image_id: &str) -> Result<ImagePosition, MetadataError>;
}

#[derive(Clone, Debug)]
pub struct ResolutionFailure {
    pub image_id: String,
    pub error: MetadataError,
}

/// Fail-soft batch resolution: failed images are dropped from the position
/// set and reported individually so the rest of the batch proceeds.
pub fn resolve_batch(
    provider: &dyn MetadataProvider,
    image_ids: &[String],
) -> (Vec<ImagePosition>, Vec<ResolutionFailure>) {
    let mut positions = Vec::with_capacity(image_ids.len());
    let mut failures = Vec::new();
    for image_id in image_ids {
        match provider.resolve(image_id) {
            Ok(position) => positions.push(position),
            Err(error) => {
                warn!("metadata resolution failed for {image_id}: {error}");
                failures.push(ResolutionFailure {
                    image_id: image_id.clone(),
                    error,
                });
            }
        }
    }
    (positions, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    fn raw(lon: Option<f64>, lat: Option<f64>) -> RawImageMetadata {
        RawImageMetadata {
            camera_model: Some("Sequoia".to_string()),
            longitude: lon,
            latitude: lat,
            timestamp: Some("2024:06:12 10:30:00".to_string()),
        }
    }

    #[test]
    fn test_valid_record_resolves() {
        let position = position_from_raw("IMG_0001.TIF", &raw(Some(-0.37), Some(39.47))).unwrap();
        assert_eq!(position.image_type, ImageType::Multispectral);
        let ts = position.timestamp.unwrap();
        assert_eq!(ts.date(), NaiveDate::from_ymd_opt(2024, 6, 12).unwrap());
        assert_eq!(ts.hour(), 10);
    }

    #[test]
    fn test_missing_fix_is_an_error_not_null_island() {
        assert!(matches!(
            position_from_raw("a.jpg", &raw(None, None)),
            Err(MetadataError::MissingGpsFix(_))
        ));
        assert!(matches!(
            position_from_raw("a.jpg", &raw(Some(0.0), Some(0.0))),
            Err(MetadataError::MissingGpsFix(_))
        ));
    }

    #[test]
    fn test_out_of_range_coordinates_rejected() {
        assert!(matches!(
            position_from_raw("a.jpg", &raw(Some(200.0), Some(39.0))),
            Err(MetadataError::InvalidCoordinate { .. })
        ));
    }

    #[test]
    fn test_malformed_timestamp_rejected() {
        let mut record = raw(Some(-0.37), Some(39.47));
        record.timestamp = Some("yesterday".to_string());
        assert!(matches!(
            position_from_raw("a.jpg", &record),
            Err(MetadataError::MalformedTimestamp { .. })
        ));
    }

    #[test]
    fn test_camera_profiles() {
        assert_eq!(
            CameraProfile::from_model("Sequoia").image_type(),
            ImageType::Multispectral
        );
        assert_eq!(CameraProfile::from_model("ZH20T").image_type(), ImageType::Rgb);
        assert_eq!(
            CameraProfile::from_model("FC6310").image_type(),
            ImageType::Unknown
        );
    }

    struct StubProvider;

    impl MetadataProvider for StubProvider {
        fn resolve(&self, image_id: &str) -> Result<ImagePosition, MetadataError> {
            if image_id.starts_with("bad") {
                Err(MetadataError::Unreadable {
                    id: image_id.to_string(),
                    reason: "truncated file".to_string(),
                })
            } else {
                position_from_raw(image_id, &raw(Some(-0.37), Some(39.47)))
            }
        }
    }

    #[test]
    fn test_batch_resolution_is_fail_soft() {
        let ids = vec![
            "ok1.jpg".to_string(),
            "bad1.jpg".to_string(),
            "ok2.jpg".to_string(),
        ];
        let (positions, failures) = resolve_batch(&StubProvider, &ids);
        assert_eq!(positions.len(), 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].image_id, "bad1.jpg");
    }
}
