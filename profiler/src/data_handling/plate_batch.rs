use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{debug, error, info};

use crate::helper_functions::read_csv;
use crate::models::{cast_profile_columns, polars_err, Dataset};

/// One experimental batch laid out as `<batch_dir>/<plate>/<plate>_<suffix>.csv`.
pub struct PlateBatch {
    pub batch_dir: PathBuf,
    /// Substring a plate file name must contain to be picked up,
    /// e.g. `normalized_variable_selected.csv`.
    pub file_pattern: String,
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(true)
}

fn sorted_entries(dir: &Path) -> PolarsResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| {
            error!("Failed to list {}: {}", dir.display(), e);
            PolarsError::from(e)
        })?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| polars_err(Box::new(e)))?;
    entries.sort();
    Ok(entries)
}

impl PlateBatch {
    pub fn new(batch_dir: impl Into<PathBuf>, file_pattern: impl Into<String>) -> Self {
        Self {
            batch_dir: batch_dir.into(),
            file_pattern: file_pattern.into(),
        }
    }

    /// Every matching plate file, plate directories and files in sorted order.
    pub fn plate_files(&self) -> PolarsResult<Vec<PathBuf>> {
        let mut files = Vec::new();

        for plate_dir in sorted_entries(&self.batch_dir)? {
            if is_hidden(&plate_dir) || !plate_dir.is_dir() {
                debug!("Skipping non-plate entry {}", plate_dir.display());
                continue;
            }

            for plate_file in sorted_entries(&plate_dir)? {
                if is_hidden(&plate_file) || !plate_file.is_file() {
                    continue;
                }
                let matches = plate_file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.contains(self.file_pattern.as_str()))
                    .unwrap_or(false);
                if matches {
                    files.push(plate_file);
                }
            }
        }

        if files.is_empty() {
            error!(
                "No files matching `{}` under {}",
                self.file_pattern,
                self.batch_dir.display()
            );
            return Err(PolarsError::NoData(
                format!(
                    "no files matched `{}` under {}",
                    self.file_pattern,
                    self.batch_dir.display()
                )
                .into(),
            ));
        }

        Ok(files)
    }
}

/// Read a single plate file with profile dtypes applied.
pub fn load_plate(path: &Path) -> PolarsResult<DataFrame> {
    let df = read_csv(path)?;
    info!("reading {} with profile count: {}", path.display(), df.height());
    cast_profile_columns(df)
}

/// Stack plate tables on top of each other. All frames must carry the same
/// column set; order may differ and is taken from the first frame.
pub fn stack_plates(plates: Vec<(PathBuf, DataFrame)>) -> PolarsResult<DataFrame> {
    let mut plates = plates.into_iter();
    let (first_path, mut combined) = plates
        .next()
        .ok_or_else(|| PolarsError::NoData("no plate tables to combine".into()))?;

    let reference: Vec<String> = combined
        .get_column_names()
        .iter()
        .map(|c| c.to_string())
        .collect();
    let reference_set: BTreeSet<&str> = reference.iter().map(|c| c.as_str()).collect();

    for (path, df) in plates {
        let names: BTreeSet<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
        let names_ref: BTreeSet<&str> = names.iter().map(|c| c.as_str()).collect();

        if names_ref != reference_set {
            let missing: Vec<&str> = reference_set.difference(&names_ref).copied().collect();
            let extra: Vec<&str> = names_ref.difference(&reference_set).copied().collect();
            error!(
                "{} does not match the columns of {}: missing {:?}, extra {:?}",
                path.display(),
                first_path.display(),
                missing,
                extra
            );
            return Err(PolarsError::SchemaMismatch(
                format!(
                    "{} has columns that differ from {} (missing: {:?}, extra: {:?})",
                    path.display(),
                    first_path.display(),
                    missing,
                    extra
                )
                .into(),
            ));
        }

        let aligned = df.select(reference.iter().map(|c| c.as_str()))?;
        combined.vstack_mut(&aligned)?;
    }

    combined.align_chunks();
    Ok(combined)
}

impl Dataset for PlateBatch {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Building profiles for batch {}", self.batch_dir.display());

        let mut plates = Vec::new();
        for path in self.plate_files()? {
            let df = load_plate(&path)?;
            plates.push((path, df));
        }

        let combined = stack_plates(plates)?;
        info!(
            "Combined batch {}: {} rows x {} cols",
            self.batch_dir.display(),
            combined.height(),
            combined.width()
        );
        Ok(combined)
    }
}
