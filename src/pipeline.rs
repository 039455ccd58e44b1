// ===========================================================================
// Sorting Pipeline
// ===========================================================================
// positions -> coarse candidate query -> buffered field matching ->
// per-field adaptive clustering -> assignment aggregation.
//
// Each field's subset is clustered independently (label spaces are local to
// one field), so the clustering stage fans out across fields with rayon.

use crate::aggregate::{self, FieldLabels};
use crate::cluster::{self, ClusterError};
use crate::config::SortParams;
use crate::field_match::{self, MatchError};
use crate::store::{PolygonStore, StoreError};
use crate::{Assignment, ImagePosition};
use ahash::AHashMap;
use geo_types::Point;
use itertools::Itertools;
use log::info;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub assignments: Vec<Assignment>,
    /// Fields that received at least one image.
    pub fields_matched: usize,
    /// Distinct (field, cluster label) pairs across the whole run.
    pub clusters_built: usize,
    pub out_of_bounds: usize,
}

/// Run the full matching + clustering pass for one batch of positions.
pub fn run(
    positions: &[ImagePosition],
    store: &dyn PolygonStore,
    params: &SortParams,
) -> Result<RunSummary, PipelineError> {
    if positions.is_empty() {
        return Ok(RunSummary::default());
    }

    let candidates = store.candidate_fields(positions)?;
    if candidates.is_empty() {
        // Informational, not fatal: the whole batch is out of bounds.
        info!(
            "no candidate fields intersect this batch; all {} positions out of bounds",
            positions.len()
        );
    }

    let matches = field_match::match_positions(positions, &candidates, params.buffer_m)?;

    // Per-field subsets, in input position order. A multi-part field shows
    // up once per part in the candidate list but clusters as one subset.
    let field_order: Vec<String> = candidates
        .iter()
        .map(|field| field.field_id.clone())
        .unique()
        .collect();
    let mut subsets: AHashMap<&str, Vec<&ImagePosition>> = AHashMap::new();
    for position in positions {
        for field_id in matches.get(&position.id).into_iter().flatten() {
            subsets.entry(field_id.as_str()).or_default().push(position);
        }
    }
    let jobs: Vec<(&String, &[&ImagePosition])> = field_order
        .iter()
        .filter_map(|field_id| {
            subsets
                .get(field_id.as_str())
                .map(|subset| (field_id, subset.as_slice()))
        })
        .collect();

    let labeled: Vec<(String, AHashMap<String, u32>)> = jobs
        .par_iter()
        .map(|(field_id, subset)| -> Result<_, ClusterError> {
            let points: Vec<Point<f64>> = subset.iter().map(|p| p.point()).collect();
            let labels = cluster::cluster_positions(&points, &params.cluster)?;
            let by_image: AHashMap<String, u32> = subset
                .iter()
                .zip(labels)
                .map(|(position, label)| (position.id.clone(), label))
                .collect();
            Ok(((*field_id).clone(), by_image))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut field_labels: FieldLabels = AHashMap::new();
    let mut clusters_built = 0usize;
    for (field_id, by_image) in labeled {
        clusters_built += by_image.values().unique().count();
        field_labels.insert(field_id, by_image);
    }

    let assignments = aggregate::aggregate(positions, &matches, &field_labels);
    let out_of_bounds = assignments.iter().filter(|a| a.out_of_bounds).count();
    let fields_matched = field_labels.len();

    info!(
        "assigned {} positions: {} field assignments across {} fields and {} clusters, {} out of bounds",
        positions.len(),
        assignments.len() - out_of_bounds,
        fields_matched,
        clusters_built,
        out_of_bounds
    );

    Ok(RunSummary {
        assignments,
        fields_matched,
        clusters_built,
        out_of_bounds,
    })
}
