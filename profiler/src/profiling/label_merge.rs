use std::collections::{BTreeSet, HashSet};

use polars::prelude::*;
use serde::Deserialize;
use tracing::{info, warn};

use crate::models::require_columns;

/// Translate profile patient ids into the ids used by the label sheet:
/// strip one exact prefix and prepend another (`PAC_5` -> `m5`).
#[derive(Debug, Clone, Deserialize)]
pub struct IdRecoder {
    pub strip_prefix: String,
    pub add_prefix: String,
}

impl Default for IdRecoder {
    fn default() -> Self {
        Self {
            strip_prefix: "PAC_".to_string(),
            add_prefix: "m".to_string(),
        }
    }
}

impl IdRecoder {
    /// `None` when `raw` does not start with the expected prefix.
    pub fn recode(&self, raw: &str) -> Option<String> {
        raw.strip_prefix(self.strip_prefix.as_str())
            .map(|rest| format!("{}{}", self.add_prefix, rest))
    }
}

/// Rewrite `column` in place with recoded ids. Ids that cannot be recoded
/// become null and will never match a label.
pub fn recode_ids(mut df: DataFrame, column: &str, recoder: &IdRecoder) -> PolarsResult<DataFrame> {
    let raw = df.column(column)?.str()?;

    let mut failed = 0usize;
    let recoded: Vec<Option<String>> = raw
        .into_iter()
        .map(|id| {
            let out = id.and_then(|id| recoder.recode(id));
            if out.is_none() {
                failed += 1;
            }
            out
        })
        .collect();

    if failed > 0 {
        warn!(
            "{} of {} `{}` values lack the `{}` prefix and cannot be matched to labels",
            failed,
            df.height(),
            column,
            recoder.strip_prefix
        );
    }

    df.with_column(Series::new(column.into(), recoded))?;
    Ok(df)
}

/// What an inner join left behind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelMergeReport {
    pub matched_rows: usize,
    pub unmatched_profile_rows: usize,
    pub unmatched_profile_ids: Vec<String>,
    pub unused_label_ids: Vec<String>,
}

/// Inner join profiles to labels on `profile_id == label_id`.
///
/// Label ids must be unique, so every profile row appears at most once in the
/// result. Rows on either side without a partner are dropped and listed in
/// the returned report.
///
/// The join keys are coalesced: the result keeps `profile_id` (holding the
/// recoded ids) and has no separate `label_id` column.
pub fn merge_labels(
    profiles: &DataFrame,
    labels: &DataFrame,
    profile_id: &str,
    label_id: &str,
) -> PolarsResult<(DataFrame, LabelMergeReport)> {
    require_columns(profiles, &[profile_id])?;
    require_columns(labels, &[label_id])?;

    let label_ids = labels.column(label_id)?.str()?;
    let mut label_set: HashSet<&str> = HashSet::with_capacity(label_ids.len());
    for id in label_ids.into_iter().flatten() {
        if !label_set.insert(id) {
            return Err(PolarsError::Duplicate(
                format!("label id `{}` is listed more than once", id).into(),
            ));
        }
    }

    let profile_ids = profiles.column(profile_id)?.str()?;
    let mut report = LabelMergeReport::default();
    let mut unmatched = BTreeSet::new();
    let mut used = HashSet::new();
    for id in profile_ids.into_iter() {
        match id {
            Some(id) if label_set.contains(id) => {
                report.matched_rows += 1;
                used.insert(id);
            }
            Some(id) => {
                report.unmatched_profile_rows += 1;
                unmatched.insert(id.to_string());
            }
            None => report.unmatched_profile_rows += 1,
        }
    }
    report.unmatched_profile_ids = unmatched.into_iter().collect();
    let mut unused: Vec<String> = label_set
        .iter()
        .filter(|id| !used.contains(*id))
        .map(|id| id.to_string())
        .collect();
    unused.sort();
    report.unused_label_ids = unused;

    let merged = profiles.join(
        labels,
        [profile_id],
        [label_id],
        JoinArgs::from(JoinType::Inner),
        None,
    )?;

    info!(
        "Merged labels: {} of {} profiles matched",
        merged.height(),
        profiles.height()
    );
    if report.unmatched_profile_rows > 0 {
        warn!(
            "{} profiles had no label (ids: {:?})",
            report.unmatched_profile_rows, report.unmatched_profile_ids
        );
    }
    if !report.unused_label_ids.is_empty() {
        warn!(
            "{} labels matched no profile (ids: {:?})",
            report.unused_label_ids.len(),
            report.unused_label_ids
        );
    }

    Ok((merged, report))
}

/// Keep rows where `column == value`.
pub fn filter_equals(df: &DataFrame, column: &str, value: &str) -> PolarsResult<DataFrame> {
    require_columns(df, &[column])?;
    df.clone().lazy().filter(col(column).eq(lit(value))).collect()
}

fn membership_mask<S: AsRef<str>>(df: &DataFrame, column: &str, values: &[S]) -> PolarsResult<BooleanChunked> {
    require_columns(df, &[column])?;
    let ca = df.column(column)?.str()?;
    Ok(ca
        .into_iter()
        .map(|v| Some(v.map(|v| values.iter().any(|x| x.as_ref() == v)).unwrap_or(false)))
        .collect())
}

/// Split rows into (`column` in `values`, everything else). Rows with a null
/// in `column` land in the second part.
pub fn split_by_values<S: AsRef<str>>(
    df: &DataFrame,
    column: &str,
    values: &[S],
) -> PolarsResult<(DataFrame, DataFrame)> {
    let mask = membership_mask(df, column, values)?;
    let inside = df.filter(&mask)?;
    let outside = df.filter(&!&mask)?;
    Ok((inside, outside))
}
