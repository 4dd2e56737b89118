//! Bring batches with different feature sets into one table.
//!
//! Policy: the union of all columns is built, missing cells are filled with
//! nulls, rows are stacked, and then every column that holds a null anywhere
//! is removed. Only columns present (and complete) in every batch survive;
//! nothing is imputed.

use std::collections::{HashMap, HashSet};

use polars::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::models::is_metadata;

/// Rewrites the part of a feature name that identifies an assay channel,
/// e.g. `Mito` -> `BODIPY`, so two batches name the same stain alike.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRename {
    pub from: String,
    pub to: String,
}

/// The combined table plus the columns that were discarded while combining.
#[derive(Debug)]
pub struct Harmonized {
    pub profiles: DataFrame,
    pub dropped_columns: Vec<String>,
}

/// Apply a channel rename to every feature column whose name contains
/// `rename.from` (exact, case sensitive). Metadata columns are never touched.
///
/// Fails with `Duplicate` when two columns would end up with the same name.
pub fn rename_channel(mut df: DataFrame, rename: &ChannelRename) -> PolarsResult<DataFrame> {
    if rename.from.is_empty() {
        return Err(PolarsError::InvalidOperation(
            "channel rename needs a non-empty source substring".into(),
        ));
    }

    let current: Vec<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
    let mut renamed = Vec::with_capacity(current.len());
    let mut owners: HashMap<String, &str> = HashMap::with_capacity(current.len());
    let mut changed = 0usize;

    for name in &current {
        let new_name = if !is_metadata(name) && name.contains(rename.from.as_str()) {
            changed += 1;
            name.replace(rename.from.as_str(), rename.to.as_str())
        } else {
            name.clone()
        };

        if let Some(previous) = owners.insert(new_name.clone(), name.as_str()) {
            return Err(PolarsError::Duplicate(
                format!(
                    "renaming `{}` -> `{}` maps `{}` and `{}` onto `{}`",
                    rename.from, rename.to, previous, name, new_name
                )
                .into(),
            ));
        }
        renamed.push(new_name);
    }

    debug!("Renamed {} columns `{}` -> `{}`", changed, rename.from, rename.to);
    df.set_column_names(renamed.iter().map(|c| c.as_str()))?;
    Ok(df)
}

/// Add (or overwrite) a constant batch identifier column.
pub fn tag_batch(mut df: DataFrame, batch_column: &str, batch_id: &str) -> PolarsResult<DataFrame> {
    let batch = Series::new(batch_column.into(), vec![batch_id; df.height()]);
    df.with_column(batch)?;
    Ok(df)
}

/// Combine several profile tables into one, keeping only the columns that
/// every table carries without missing values.
pub fn harmonize(tables: Vec<DataFrame>) -> PolarsResult<Harmonized> {
    if tables.is_empty() {
        return Err(PolarsError::NoData("no batches to harmonize".into()));
    }

    // Union of columns in first-seen order, remembering the dtype.
    let mut union: Vec<(String, DataType)> = Vec::new();
    let mut seen = HashSet::new();
    for df in &tables {
        for column in df.get_columns() {
            let name = column.name().to_string();
            if seen.insert(name.clone()) {
                union.push((name, column.dtype().clone()));
            }
        }
    }

    let mut combined: Option<DataFrame> = None;
    for (idx, mut df) in tables.into_iter().enumerate() {
        let height = df.height();
        for (name, dtype) in &union {
            let current = df.column(name).ok().map(|c| c.dtype().clone());
            match current {
                Some(current) if &current != dtype => {
                    let cast = df.column(name)?.cast(dtype)?;
                    df.with_column(cast)?;
                }
                Some(_) => {}
                None => {
                    debug!("Batch #{} lacks `{}`, filling with nulls", idx, name);
                    df.with_column(Series::full_null(name.as_str().into(), height, dtype))?;
                }
            }
        }

        let aligned = df.select(union.iter().map(|(name, _)| name.as_str()))?;
        match combined.as_mut() {
            Some(acc) => {
                acc.vstack_mut(&aligned)?;
            }
            None => combined = Some(aligned),
        }
    }

    let mut combined = combined.ok_or_else(|| PolarsError::NoData("no batches to harmonize".into()))?;
    combined.align_chunks();

    let dropped_columns: Vec<String> = combined
        .get_columns()
        .iter()
        .filter(|c| c.null_count() > 0)
        .map(|c| c.name().to_string())
        .collect();

    if !dropped_columns.is_empty() {
        let features = dropped_columns.iter().filter(|c| !is_metadata(c)).count();
        warn!(
            "Dropping {} columns with missing values after combining batches ({} features, {} metadata)",
            dropped_columns.len(),
            features,
            dropped_columns.len() - features
        );
        debug!("Dropped columns: {:?}", dropped_columns);
    }

    let kept: Vec<String> = combined
        .get_column_names()
        .iter()
        .map(|c| c.to_string())
        .filter(|c| !dropped_columns.contains(c))
        .collect();
    let profiles = combined.select(kept)?;
    info!("Harmonized profiles: {} rows x {} cols", profiles.height(), profiles.width());

    Ok(Harmonized {
        profiles,
        dropped_columns,
    })
}
