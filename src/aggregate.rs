// ===========================================================================
// Assignment Aggregation
// ===========================================================================
// Pure merge of the matcher's field memberships with the per-field cluster
// labelings. Clustering always ran inside one field's subset, so labels are
// only meaningful next to their field id; an image in two fields gets two
// assignments with independent labels.

use crate::{Assignment, ImagePosition};
use ahash::AHashMap;
use chrono::Datelike;

/// Per-field cluster labelings, keyed by field id then image id.
pub type FieldLabels = AHashMap<String, AHashMap<String, u32>>;

/// Merge field memberships and cluster labels into the final assignment
/// list, one record per (image, field) pair plus one out-of-bounds record
/// per unmatched image. Output order follows the input position order.
pub fn aggregate(
    positions: &[ImagePosition],
    field_matches: &AHashMap<String, Vec<String>>,
    field_labels: &FieldLabels,
) -> Vec<Assignment> {
    let mut assignments = Vec::with_capacity(positions.len());
    for position in positions {
        let fields = field_matches
            .get(&position.id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        if fields.is_empty() {
            assignments.push(Assignment {
                image_id: position.id.clone(),
                field_id: None,
                cluster_label: None,
                out_of_bounds: true,
            });
            continue;
        }
        for field_id in fields {
            let cluster_label = field_labels
                .get(field_id)
                .and_then(|labels| labels.get(&position.id))
                .copied();
            assignments.push(Assignment {
                image_id: position.id.clone(),
                field_id: Some(field_id.clone()),
                cluster_label,
                out_of_bounds: false,
            });
        }
    }
    assignments
}

/// Destination components the file organizer sorts an image under:
/// a week/field/sensor folder and, inside it, a per-cluster folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationKey {
    pub folder: String,
    pub cluster_folder: Option<String>,
}

/// Build the `W{iso_week}_{field_id}_{image_type}` / `Cluster_{label}` key
/// for one assignment. Out-of-bounds assignments have no destination; an
/// image without a capture timestamp files under week 0.
pub fn destination_key(position: &ImagePosition, assignment: &Assignment) -> Option<DestinationKey> {
    let field_id = assignment.field_id.as_ref()?;
    let week = position
        .timestamp
        .map(|t| t.iso_week().week())
        .unwrap_or(0);
    Some(DestinationKey {
        folder: format!("W{}_{}_{}", week, field_id, position.image_type),
        cluster_folder: assignment
            .cluster_label
            .map(|label| format!("Cluster_{label}")),
    })
}
