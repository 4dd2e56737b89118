use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::models::{feature_columns, metadata_columns, require_columns};

/// Average replicate profiles.
///
/// One output row per distinct combination of `keys`; every feature column
/// becomes the arithmetic mean over the rows sharing that combination. Key
/// columns are carried through unchanged. Metadata columns that are not part
/// of the key are dropped, since they cannot be averaged.
///
/// Rows with a null in any key column belong to no replicate group and are
/// left out.
///
/// Rows are sorted by the key columns, so the output does not depend on the
/// order of the input rows.
pub fn collapse_replicates<S: AsRef<str>>(df: &DataFrame, keys: &[S]) -> PolarsResult<DataFrame> {
    if keys.is_empty() {
        return Err(PolarsError::InvalidOperation(
            "replicate collapsing needs at least one key column".into(),
        ));
    }
    require_columns(df, keys)?;

    let key_names: Vec<&str> = keys.iter().map(|k| k.as_ref()).collect();
    let is_key = |name: &str| key_names.iter().any(|k| *k == name);

    let features: Vec<String> = feature_columns(df).into_iter().filter(|f| !is_key(f)).collect();
    let discarded: Vec<String> = metadata_columns(df).into_iter().filter(|m| !is_key(m)).collect();

    if !discarded.is_empty() {
        debug!("Metadata not in the replicate key is dropped: {:?}", discarded);
    }

    let key_exprs: Vec<Expr> = key_names.iter().map(|k| col(*k)).collect();
    let aggregations: Vec<Expr> = features
        .iter()
        .map(|f| col(f.as_str()).cast(DataType::Float64).mean())
        .collect();

    let complete_keys = key_exprs
        .iter()
        .map(|k| k.clone().is_not_null())
        .reduce(|acc, e| acc.and(e))
        .unwrap_or_else(|| lit(true));
    let keyed = df.clone().lazy().filter(complete_keys).collect()?;
    let without_key = df.height() - keyed.height();
    if without_key > 0 {
        warn!(
            "{} profiles have a missing value in {:?} and are left out of the replicate groups",
            without_key, key_names
        );
    }

    let collapsed = keyed
        .lazy()
        .group_by(key_exprs.clone())
        .agg(aggregations)
        .sort_by_exprs(key_exprs, SortMultipleOptions::default())
        .collect()?;

    info!(
        "Collapsed {} profiles into {} replicate groups over {:?}",
        df.height(),
        collapsed.height(),
        key_names
    );
    Ok(collapsed)
}
