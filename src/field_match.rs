// ===========================================================================
// Field Matching
// ===========================================================================
// Field boundaries arrive in WGS84. Buffering in angular degrees would make
// the tolerance shrink with latitude, so boundaries are reprojected to Web
// Mercator and expanded there; the buffer is meters on the projected plane.
// Membership is a closed predicate and deliberately multi-valued: buffers of
// adjacent fields overlap near shared edges and an image there belongs to
// both.

use crate::projection::{self, Frame, ProjectionError};
use crate::{FieldPolygon, ImagePosition};
use ahash::AHashMap;
use geo::Intersects;
use geo_types::{MultiPolygon, Point};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("buffer size must be non-negative, got {0}")]
    NegativeBuffer(f64),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

/// A field boundary reprojected to the metric frame and expanded outward.
/// Ephemeral: rebuilt for every matching pass, never cached.
#[derive(Clone, Debug)]
pub struct BufferedField {
    pub field_id: String,
    region: MultiPolygon<f64>,
}

impl BufferedField {
    pub fn build(field: &FieldPolygon, buffer_m: f64) -> Result<BufferedField, MatchError> {
        if buffer_m < 0.0 || !buffer_m.is_finite() {
            return Err(MatchError::NegativeBuffer(buffer_m));
        }
        let projected = projection::project_polygon(&field.boundary, Frame::Wgs84, Frame::WebMercator)?;
        let region = if buffer_m > 0.0 {
            geo_buffer::buffer_polygon(&projected, buffer_m)
        } else {
            MultiPolygon::new(vec![projected])
        };
        Ok(BufferedField {
            field_id: field.field_id.clone(),
            region,
        })
    }

    /// Closed containment: interior, boundary, and the buffered rim all match.
    pub fn contains(&self, point_merc: &Point<f64>) -> bool {
        self.region.intersects(point_merc)
    }
}

/// Compute, per image, every field whose buffered boundary contains the
/// image position. Images matching nothing get an empty list; the caller
/// treats those as out of bounds.
///
/// O(positions x fields); candidate sets come pre-filtered from the polygon
/// store and stay small, so no index is built over the buffered regions.
pub fn match_positions(
    positions: &[ImagePosition],
    candidate_fields: &[FieldPolygon],
    buffer_m: f64,
) -> Result<AHashMap<String, Vec<String>>, MatchError> {
    let buffered = candidate_fields
        .iter()
        .map(|field| BufferedField::build(field, buffer_m))
        .collect::<Result<Vec<_>, _>>()?;

    let mut matches: AHashMap<String, Vec<String>> = AHashMap::with_capacity(positions.len());
    for position in positions {
        let (x, y) = projection::lat_lng_to_web_merc(position.longitude, position.latitude)?;
        let point = Point::new(x, y);

        // A multi-part field appears once per part in the candidate list;
        // dedupe so an image never gets the same field twice.
        let mut field_ids: Vec<String> = Vec::new();
        for field in buffered.iter().filter(|f| f.contains(&point)) {
            if !field_ids.contains(&field.field_id) {
                field_ids.push(field.field_id.clone());
            }
        }
        matches.insert(position.id.clone(), field_ids);
    }
    Ok(matches)
}
