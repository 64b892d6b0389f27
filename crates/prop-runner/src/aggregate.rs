//! Collect committed run records into one flat benchmark table.

use crate::error::Result;
use prop_types::{DataSet, RequestResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const BENCHMARK_FILE: &str = "benchmarks.csv";

/// One estimated property joined with its reference measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkRow {
    pub id: String,
    pub index: usize,
    #[serde(rename = "type")]
    pub property_type: String,
    pub forcefield: String,
    pub replicate: u32,
    pub value: f64,
    pub uncertainty: f64,
    pub reference_value: f64,
    pub reference_uncertainty: f64,
}

/// A record that could not be joined or placed.
#[derive(Debug, Clone, PartialEq)]
pub struct Inconsistency {
    pub path: PathBuf,
    pub id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Gathered {
    pub rows: Vec<BenchmarkRow>,
    pub inconsistencies: Vec<Inconsistency>,
    /// Result files without a ledger entry; skipped.
    pub incomplete: Vec<PathBuf>,
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Trailing `-N` of a file stem, e.g. 12 for `prop-0012`.
fn stem_offset(path: &Path) -> Option<usize> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.rsplit('-').next())
        .and_then(|n| n.parse().ok())
}

/// Walk `<root>/rep-*/*/*.json` and join every estimated property against `reference`.
pub fn gather(reference: &DataSet, root: &Path) -> Result<Gathered> {
    let by_id = reference.by_id();
    let mut gathered = Gathered::default();

    for rep_dir in sorted_entries(root)? {
        let Some(suffix) = file_name(&rep_dir).strip_prefix("rep-") else {
            continue;
        };
        if !rep_dir.is_dir() {
            continue;
        }
        let Ok(replicate) = suffix.parse::<u32>() else {
            gathered.inconsistencies.push(Inconsistency {
                path: rep_dir.clone(),
                id: None,
                reason: format!("cannot read a replicate number from '{suffix}'"),
            });
            continue;
        };

        for ff_dir in sorted_entries(&rep_dir)? {
            if !ff_dir.is_dir() {
                continue;
            }
            let forcefield = file_name(&ff_dir).to_string();
            for file in sorted_entries(&ff_dir)? {
                if file.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if !file.with_extension("done").exists() {
                    warn!(file = %file.display(), "no ledger entry, skipping");
                    gathered.incomplete.push(file);
                    continue;
                }
                let result: RequestResult = match std::fs::read(&file)
                    .map_err(|e| e.to_string())
                    .and_then(|b| serde_json::from_slice(&b).map_err(|e| e.to_string()))
                {
                    Ok(result) => result,
                    Err(reason) => {
                        gathered.inconsistencies.push(Inconsistency {
                            path: file,
                            id: None,
                            reason,
                        });
                        continue;
                    }
                };
                debug!(file = %file.display(), estimated = result.estimated.len(), "read result");

                let offset = stem_offset(&file);
                for (position, property) in result.estimated.iter().enumerate() {
                    let Some(reference) = by_id.get(property.id.as_str()) else {
                        gathered.inconsistencies.push(Inconsistency {
                            path: file.clone(),
                            id: Some(property.id.clone()),
                            reason: "id not present in the reference dataset".to_string(),
                        });
                        continue;
                    };
                    gathered.rows.push(BenchmarkRow {
                        id: property.id.clone(),
                        index: offset.map_or(position, |o| o + position),
                        property_type: property.property_type.to_string(),
                        forcefield: forcefield.clone(),
                        replicate,
                        value: property.value,
                        uncertainty: property.uncertainty,
                        reference_value: reference.value,
                        reference_uncertainty: reference.uncertainty,
                    });
                }
            }
        }
    }

    gathered.rows.sort_by(|a, b| {
        (a.replicate, &a.forcefield, &a.id, a.index)
            .cmp(&(b.replicate, &b.forcefield, &b.id, b.index))
    });
    Ok(gathered)
}

/// Write rows as CSV to `<output_directory>/benchmarks.csv`; returns the file path.
pub fn write_csv(rows: &[BenchmarkRow], output_directory: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(output_directory)?;
    let path = output_directory.join(BENCHMARK_FILE);
    let mut writer = csv::Writer::from_path(&path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{self, RunPaths};
    use prop_types::{EstimatedProperty, PhysicalProperty, PropertyType};

    fn reference(ids: &[&str]) -> DataSet {
        DataSet::new(
            ids.iter()
                .map(|id| PhysicalProperty {
                    id: id.to_string(),
                    property_type: PropertyType::Density,
                    value: 1.0,
                    uncertainty: 0.1,
                    parameters: serde_json::Value::Null,
                })
                .collect(),
        )
    }

    fn estimated(id: &str, replicate: u32, ff: &str) -> EstimatedProperty {
        EstimatedProperty {
            id: id.to_string(),
            property_type: PropertyType::Density,
            replicate,
            force_field: ff.to_string(),
            value: 0.9,
            uncertainty: 0.01,
            cache_key: format!("{id}-{replicate}-{ff}"),
            from_cache: false,
        }
    }

    async fn write_run(root: &Path, replicate: u32, ff: &str, index: Option<usize>, ids: &[&str]) {
        let paths = RunPaths::new(root, replicate, ff, index);
        let mut result = RequestResult::new(format!("{ff}-{replicate}"));
        for id in ids {
            result.estimated.push(estimated(id, replicate, ff));
        }
        ledger::persist(&paths, &result).await.unwrap();
        ledger::commit(&paths, &result).await.unwrap();
    }

    #[tokio::test]
    async fn one_row_per_property_replicate_and_force_field() {
        let dir = tempfile::tempdir().unwrap();
        let ids = ["a", "b", "c"];
        for replicate in [1, 2] {
            for ff in ["ff-1", "ff-2"] {
                for (i, id) in ids.iter().enumerate() {
                    write_run(dir.path(), replicate, ff, Some(i), &[id]).await;
                }
            }
        }

        let gathered = gather(&reference(&ids), dir.path()).unwrap();
        assert_eq!(gathered.rows.len(), 3 * 2 * 2);
        assert!(gathered.inconsistencies.is_empty());
        assert!(gathered.incomplete.is_empty());

        let first = &gathered.rows[0];
        assert_eq!(
            (first.replicate, first.forcefield.as_str(), first.id.as_str()),
            (1, "ff-1", "a")
        );
        assert_eq!(first.index, 0);
        assert_eq!(first.reference_value, 1.0);
        let c = gathered.rows.iter().find(|r| r.id == "c").unwrap();
        assert_eq!(c.index, 2);
    }

    #[tokio::test]
    async fn whole_dataset_files_index_by_position() {
        let dir = tempfile::tempdir().unwrap();
        write_run(dir.path(), 1, "ff", None, &["x", "y"]).await;
        let gathered = gather(&reference(&["x", "y"]), dir.path()).unwrap();
        let indices: Vec<_> = gathered.rows.iter().map(|r| (r.id.as_str(), r.index)).collect();
        assert_eq!(indices, vec![("x", 0), ("y", 1)]);
    }

    #[tokio::test]
    async fn unknown_ids_and_uncommitted_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_run(dir.path(), 1, "ff", Some(0), &["known", "stray"]).await;
        let uncommitted = RunPaths::new(dir.path(), 1, "ff", Some(1));
        ledger::persist(&uncommitted, &RequestResult::new("r")).await.unwrap();

        let gathered = gather(&reference(&["known"]), dir.path()).unwrap();
        assert_eq!(gathered.rows.len(), 1);
        assert_eq!(gathered.inconsistencies.len(), 1);
        assert_eq!(gathered.inconsistencies[0].id.as_deref(), Some("stray"));
        assert_eq!(gathered.incomplete, vec![uncommitted.json_path()]);
    }

    #[tokio::test]
    async fn csv_has_the_benchmark_columns() {
        let dir = tempfile::tempdir().unwrap();
        write_run(dir.path(), 3, "openff-2.2.1", Some(5), &["p"]).await;
        let gathered = gather(&reference(&["p"]), dir.path()).unwrap();
        let path = write_csv(&gathered.rows, &dir.path().join("output")).unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("id,index,type,forcefield,replicate,value,uncertainty,reference_value,reference_uncertainty")
        );
        assert_eq!(lines.next(), Some("p,5,Density,openff-2.2.1,3,0.9,0.01,1.0,0.1"));
    }
}
