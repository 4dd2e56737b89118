//! `.gct` (version 1.3) export for the Morpheus heatmap viewer.
//!
//! Layout: features are rows, profiles are columns. Every non-feature column
//! of the input becomes a column annotation line; optional row annotations
//! are parsed from the feature names.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use polars::prelude::*;
use regex::Regex;
use tracing::info;

use crate::helper_functions::ensure_parent_dir;
use crate::models::{is_metadata, polars_err};

pub const DEFAULT_FEATURE_REGEX: &str = "^Nuclei_|^Cells_|^Cytoplasm_";

const ROW_ANNOTATIONS: [&str; 4] = ["compartment", "feature_group", "measurement", "channel"];

/// `Cells_Intensity_MeanIntensity_OrigBODIPY` ->
/// `[Cells, Intensity, MeanIntensity, OrigBODIPY]`; absent parts are `none`.
pub fn feature_annotations(feature: &str) -> [String; 4] {
    let mut parts = feature.splitn(4, '_').map(|p| p.to_string());
    let mut next = || parts.next().filter(|p| !p.is_empty()).unwrap_or_else(|| "none".to_string());
    [next(), next(), next(), next()]
}

fn select_features(df: &DataFrame, feature_regex: Option<&Regex>) -> Vec<String> {
    df.get_column_names()
        .iter()
        .map(|c| c.as_str())
        .filter(|name| match feature_regex {
            Some(re) => re.is_match(name),
            None => !is_metadata(name),
        })
        .map(|name| name.to_string())
        .collect()
}

/// Numbers print the same way in annotation lines as in the matrix body.
fn render_values(column: &Column) -> PolarsResult<Vec<String>> {
    if column.dtype().is_float() {
        let values = column.cast(&DataType::Float64)?;
        Ok(values
            .f64()?
            .into_iter()
            .map(|v| v.map(|v| v.to_string()).unwrap_or_else(|| "NA".to_string()))
            .collect())
    } else {
        let values = column.cast(&DataType::String)?;
        Ok(values
            .str()?
            .into_iter()
            .map(|v| v.unwrap_or("NA").to_string())
            .collect())
    }
}

fn csv_err(e: csv::Error) -> PolarsError {
    polars_err(Box::new(e))
}

/// Write `df` as GCT to any writer.
pub fn write_gct_to<W: Write>(
    df: &DataFrame,
    writer: W,
    feature_regex: Option<&Regex>,
    create_row_annotations: bool,
) -> PolarsResult<()> {
    let features = select_features(df, feature_regex);
    if features.is_empty() {
        return Err(PolarsError::NoData(
            "no columns match the feature pattern; nothing to write".into(),
        ));
    }
    let annotations: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|c| c.to_string())
        .filter(|c| !features.contains(c))
        .collect();

    let n_samples = df.height();
    let row_annot = if create_row_annotations { ROW_ANNOTATIONS.len() } else { 0 };

    let mut out = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .quote_style(csv::QuoteStyle::Never)
        .from_writer(writer);

    out.write_record(["#1.3"]).map_err(csv_err)?;
    out.write_record([
        features.len().to_string(),
        n_samples.to_string(),
        row_annot.to_string(),
        annotations.len().to_string(),
    ])
    .map_err(csv_err)?;

    let mut header = Vec::with_capacity(1 + row_annot + n_samples);
    header.push("id".to_string());
    if create_row_annotations {
        header.extend(ROW_ANNOTATIONS.iter().map(|a| a.to_string()));
    }
    header.extend((1..=n_samples).map(|i| format!("SAMPLE_{}", i)));
    out.write_record(&header).map_err(csv_err)?;

    for name in &annotations {
        let mut record = Vec::with_capacity(header.len());
        record.push(name.clone());
        record.extend(std::iter::repeat("na".to_string()).take(row_annot));
        record.extend(render_values(df.column(name)?)?);
        out.write_record(&record).map_err(csv_err)?;
    }

    for name in &features {
        let values = df.column(name)?.cast(&DataType::Float64)?;
        let values = values.f64()?;
        let mut record = Vec::with_capacity(header.len());
        record.push(name.clone());
        if create_row_annotations {
            record.extend(feature_annotations(name));
        }
        record.extend(
            values
                .into_iter()
                .map(|v| v.map(|v| v.to_string()).unwrap_or_else(|| "NaN".to_string())),
        );
        out.write_record(&record).map_err(csv_err)?;
    }

    out.flush().map_err(|e| polars_err(Box::new(e)))?;
    Ok(())
}

/// Write `df` as GCT to `path`, creating parent directories.
pub fn write_gct(
    df: &DataFrame,
    path: &Path,
    feature_regex: Option<&Regex>,
    create_row_annotations: bool,
) -> PolarsResult<()> {
    ensure_parent_dir(path)?;
    let file = File::create(path).map_err(|e| polars_err(Box::new(e)))?;
    write_gct_to(df, BufWriter::new(file), feature_regex, create_row_annotations)?;
    info!("Wrote {} profiles to {}", df.height(), path.display());
    Ok(())
}
