// ===========================================================================
// Polygon Store
// ===========================================================================
// The field-boundary database is an external collaborator. The engine only
// needs one coarse query: which fields could plausibly contain any of these
// positions. The trait is injected into the pipeline so the caller owns the
// connection lifecycle; `MemoryPolygonStore` is the in-process implementation
// used by the CLI and tests.

use crate::{FieldPolygon, ImagePosition};
use geo::BoundingRect;
use rstar::{AABB, RTree, RTreeObject};
use thiserror::Error;

const METERS_PER_DEGREE_LATITUDE: f64 = 111_320.0;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("polygon store backend error: {0}")]
    Backend(String),
}

/// Read-only source of candidate field boundaries. Boundaries are assumed
/// stable for the duration of one matching pass; a new pass re-queries.
pub trait PolygonStore: Sync {
    /// Coarse, unbuffered candidate query: every field whose neighborhood
    /// could contain any of the given positions. Over-approximation is fine;
    /// the matcher applies the exact buffered predicate afterwards.
    fn candidate_fields(&self, positions: &[ImagePosition])
    -> Result<Vec<FieldPolygon>, StoreError>;
}

struct IndexedField {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedField {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// In-memory store over an R-tree of field bounding boxes (angular frame).
pub struct MemoryPolygonStore {
    fields: Vec<FieldPolygon>,
    tree: RTree<IndexedField>,
    search_radius_m: f64,
}

impl MemoryPolygonStore {
    /// `search_radius_m` pads the per-position query window so fields whose
    /// buffered rim could reach a position are not filtered out early. Pick
    /// it at least as large as the matching buffer.
    pub fn new(fields: Vec<FieldPolygon>, search_radius_m: f64) -> MemoryPolygonStore {
        let entries: Vec<IndexedField> = fields
            .iter()
            .enumerate()
            .filter_map(|(index, field)| {
                field.boundary.bounding_rect().map(|rect| IndexedField {
                    index,
                    envelope: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();
        MemoryPolygonStore {
            tree: RTree::bulk_load(entries),
            fields,
            search_radius_m,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl PolygonStore for MemoryPolygonStore {
    fn candidate_fields(
        &self,
        positions: &[ImagePosition],
    ) -> Result<Vec<FieldPolygon>, StoreError> {
        let mut hit = vec![false; self.fields.len()];
        let pad_lat = self.search_radius_m / METERS_PER_DEGREE_LATITUDE;

        for position in positions {
            // Longitude degrees shrink with latitude; widen the pad
            // accordingly. The clamp keeps the window finite near the poles.
            let cos_lat = position.latitude.to_radians().cos().max(0.01);
            let pad_lon = pad_lat / cos_lat;
            let query = AABB::from_corners(
                [position.longitude - pad_lon, position.latitude - pad_lat],
                [position.longitude + pad_lon, position.latitude + pad_lat],
            );
            for field in self.tree.locate_in_envelope_intersecting(&query) {
                hit[field.index] = true;
            }
        }

        Ok(self
            .fields
            .iter()
            .enumerate()
            .filter(|(index, _)| hit[*index])
            .map(|(_, field)| field.clone())
            .collect())
    }
}
