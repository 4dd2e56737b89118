use polars::prelude::*;

/// Every column whose name starts with this prefix describes where a profile
/// came from (plate, well, patient, treatment, ...). Everything else is a
/// measured feature.
pub const METADATA_PREFIX: &str = "Metadata_";

/// Wrap a foreign error (io, csv, plotters, ...) so it can travel through
/// `PolarsResult`.
pub fn polars_err(e: Box<dyn std::error::Error>) -> PolarsError {
    PolarsError::ComputeError(e.to_string().into())
}

/// A source of profiles or annotations that can be materialised as a frame.
pub trait Dataset {
    fn load(&self) -> PolarsResult<DataFrame>;
}

pub fn is_metadata(name: &str) -> bool {
    name.starts_with(METADATA_PREFIX)
}

pub fn metadata_columns(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .iter()
        .filter(|name| is_metadata(name.as_str()))
        .map(|name| name.to_string())
        .collect()
}

pub fn feature_columns(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .iter()
        .filter(|name| !is_metadata(name.as_str()))
        .map(|name| name.to_string())
        .collect()
}

/// Normalise dtypes of a freshly read profile table: metadata becomes `String`
/// (so that e.g. `Metadata_diff_day` values `15` and `15+iso` live in one
/// column type), features become `Float64`.
///
/// Casts are strict; a feature column holding text fails here instead of
/// turning into nulls further down the pipeline.
pub fn cast_profile_columns(df: DataFrame) -> PolarsResult<DataFrame> {
    let casts: Vec<Expr> = df
        .get_column_names()
        .iter()
        .map(|name| {
            let name = name.as_str();
            if is_metadata(name) {
                col(name).cast(DataType::String)
            } else {
                col(name).strict_cast(DataType::Float64)
            }
        })
        .collect();

    if casts.is_empty() {
        return Ok(df);
    }

    df.lazy().with_columns(casts).collect()
}

/// Fail with `ColumnNotFound` unless every name in `columns` exists in `df`.
pub fn require_columns<S: AsRef<str>>(df: &DataFrame, columns: &[S]) -> PolarsResult<()> {
    for name in columns {
        let name = name.as_ref();
        if df.column(name).is_err() {
            return Err(PolarsError::ColumnNotFound(
                format!("required column `{}` is missing", name).into(),
            ));
        }
    }
    Ok(())
}
