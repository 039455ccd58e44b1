use anyhow::{Context, Result, bail};
use clap::Parser;
use fieldsort::aggregate::destination_key;
use fieldsort::config::{self, SortParams};
use fieldsort::metadata::{self, RawImageMetadata, ResolutionFailure};
use fieldsort::pipeline;
use fieldsort::store::MemoryPolygonStore;
use fieldsort::{FieldPolygon, ImagePosition};
use geojson::GeoJson;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Assign images to fields and size-bounded clusters
    Assign {
        /// GeoJSON FeatureCollection of field boundaries (WGS84)
        #[arg(long)]
        fields: PathBuf,
        /// CSV of image positions: id, longitude, latitude, timestamp, camera_model
        #[arg(long)]
        positions: PathBuf,
        /// JSON file with sorting parameters; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the assignment report here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        /// Search radius in meters for the coarse candidate query
        #[arg(long, default_value_t = 500.0)]
        search_radius: f64,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    match args.cmd {
        Command::Assign {
            fields,
            positions,
            config,
            out,
            search_radius,
        } => assign(&fields, &positions, config.as_deref(), out.as_deref(), search_radius),
    }
}

fn assign(
    fields_path: &Path,
    positions_path: &Path,
    config_path: Option<&Path>,
    out_path: Option<&Path>,
    search_radius: f64,
) -> Result<()> {
    let params = match config_path {
        Some(path) => config::load_params(path)?,
        None => SortParams::default(),
    };

    let fields = load_fields(fields_path)?;
    info!("loaded {} field boundaries from {}", fields.len(), fields_path.display());

    let (positions, failures) = load_positions(positions_path)?;
    info!(
        "loaded {} image positions from {} ({} unresolvable)",
        positions.len(),
        positions_path.display(),
        failures.len()
    );

    let store = MemoryPolygonStore::new(fields, search_radius.max(params.buffer_m));
    let summary = pipeline::run(&positions, &store, &params)?;

    let report = build_report(&positions, &summary.assignments, &failures);
    match out_path {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            serde_json::to_writer_pretty(file, &report)?;
            info!("wrote report to {}", path.display());
        }
        None => {
            serde_json::to_writer_pretty(std::io::stdout().lock(), &report)?;
            println!();
        }
    }

    info!(
        "{} fields matched, {} clusters, {} out of bounds, {} metadata failures",
        summary.fields_matched,
        summary.clusters_built,
        summary.out_of_bounds,
        failures.len()
    );
    Ok(())
}

fn load_fields(path: &Path) -> Result<Vec<FieldPolygon>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let geojson: GeoJson = contents
        .parse()
        .with_context(|| format!("failed to parse GeoJSON in {}", path.display()))?;
    let GeoJson::FeatureCollection(collection) = geojson else {
        bail!("{} is not a GeoJSON FeatureCollection", path.display());
    };

    let mut fields = Vec::new();
    for (index, feature) in collection.features.into_iter().enumerate() {
        let field_id = feature
            .properties
            .as_ref()
            .and_then(|props| props.get("field").or_else(|| props.get("field_id")))
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("field_{index}"));
        let Some(geometry) = feature.geometry else {
            warn!("feature {field_id} has no geometry, skipping");
            continue;
        };
        match geo_types::Geometry::<f64>::try_from(geometry) {
            Ok(geo_types::Geometry::Polygon(boundary)) => fields.push(FieldPolygon {
                field_id,
                boundary,
            }),
            Ok(geo_types::Geometry::MultiPolygon(parts)) => {
                for boundary in parts {
                    fields.push(FieldPolygon {
                        field_id: field_id.clone(),
                        boundary,
                    });
                }
            }
            Ok(_) => warn!("feature {field_id} is not a polygon, skipping"),
            Err(error) => warn!("feature {field_id} has unusable geometry: {error}"),
        }
    }
    Ok(fields)
}

#[derive(Debug, Deserialize)]
struct PositionRecord {
    id: String,
    longitude: Option<f64>,
    latitude: Option<f64>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    camera_model: Option<String>,
}

/// Read positions from CSV, dropping and reporting unresolvable rows so one
/// bad image never sinks the batch.
fn load_positions(path: &Path) -> Result<(Vec<ImagePosition>, Vec<ResolutionFailure>)> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut positions = Vec::new();
    let mut failures = Vec::new();
    for record in reader.deserialize() {
        let record: PositionRecord =
            record.with_context(|| format!("malformed CSV row in {}", path.display()))?;
        let raw = RawImageMetadata {
            camera_model: record.camera_model,
            longitude: record.longitude,
            latitude: record.latitude,
            timestamp: record.timestamp,
        };
        match metadata::position_from_raw(&record.id, &raw) {
            Ok(position) => positions.push(position),
            Err(error) => {
                warn!("skipping {}: {error}", record.id);
                failures.push(ResolutionFailure {
                    image_id: record.id,
                    error,
                });
            }
        }
    }
    Ok((positions, failures))
}

#[derive(Debug, Serialize)]
struct ReportRow {
    image_id: String,
    field_id: Option<String>,
    cluster_label: Option<u32>,
    out_of_bounds: bool,
    destination: Option<String>,
}

#[derive(Debug, Serialize)]
struct Report {
    assignments: Vec<ReportRow>,
    metadata_failures: Vec<FailureRow>,
}

#[derive(Debug, Serialize)]
struct FailureRow {
    image_id: String,
    error: String,
}

fn build_report(
    positions: &[ImagePosition],
    assignments: &[fieldsort::Assignment],
    failures: &[ResolutionFailure],
) -> Report {
    let by_id: ahash::AHashMap<&str, &ImagePosition> = positions
        .iter()
        .map(|position| (position.id.as_str(), position))
        .collect();

    let rows = assignments
        .iter()
        .map(|assignment| {
            let destination = by_id
                .get(assignment.image_id.as_str())
                .and_then(|position| destination_key(position, assignment))
                .map(|key| match key.cluster_folder {
                    Some(cluster) => format!("{}/{}", key.folder, cluster),
                    None => key.folder,
                });
            ReportRow {
                image_id: assignment.image_id.clone(),
                field_id: assignment.field_id.clone(),
                cluster_label: assignment.cluster_label,
                out_of_bounds: assignment.out_of_bounds,
                destination,
            }
        })
        .collect();

    Report {
        assignments: rows,
        metadata_failures: failures
            .iter()
            .map(|failure| FailureRow {
                image_id: failure.image_id.clone(),
                error: failure.error.to_string(),
            })
            .collect(),
    }
}
