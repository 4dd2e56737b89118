//! Two-group comparison of every feature within fixed experimental conditions.
//!
//! Each feature is tested independently with an unpaired, two-sided Student
//! t-test assuming equal variances (pooled variance, `na + nb - 2` degrees of
//! freedom).

use polars::prelude::*;
use serde::Deserialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::{debug, info, warn};

use crate::models::{polars_err, require_columns};
use crate::profiling::label_merge::filter_equals;

/// Smallest p-value used for `-log10(p)`; a p-value of exactly zero is
/// reported at this cap instead of as infinity.
pub const P_VALUE_FLOOR: f64 = f64::MIN_POSITIVE;

/// One fixed condition a comparison was run under, e.g. `Metadata_FFA == 0`.
/// `label` names the column it gets in the results table (`FFA`).
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub label: String,
    pub value: String,
}

/// All values one condition column is compared across.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionAxis {
    pub column: String,
    pub label: String,
    pub values: Vec<String>,
}

/// Which column defines the two groups and which values they carry.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupSplit {
    pub column: String,
    pub group_a: String,
    pub group_b: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TTest {
    pub t_stat: f64,
    pub p_value: f64,
    pub dof: f64,
}

/// A feature together with its statistic, so the two can never be misaligned.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonRecord {
    pub feature: String,
    pub t_stat: Option<f64>,
    pub p_value: Option<f64>,
    pub conditions: Vec<Condition>,
}

impl ComparisonRecord {
    pub fn neg_log_10_p(&self) -> Option<f64> {
        self.p_value.map(neg_log10_p)
    }
}

/// `-log10(p)`, with `p == 0` capped at `-log10(P_VALUE_FLOOR)`.
pub fn neg_log10_p(p_value: f64) -> f64 {
    0.0 - p_value.max(P_VALUE_FLOOR).log10()
}

fn mean_and_var(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

/// Pooled-variance t-test of `a` against `b`.
///
/// Both samples need at least two values, all finite. Returns `Ok(None)` when
/// the pooled variance is zero and the statistic is undefined.
pub fn student_t_test(a: &[f64], b: &[f64]) -> PolarsResult<Option<TTest>> {
    if a.len() < 2 || b.len() < 2 {
        return Err(PolarsError::ComputeError(
            format!(
                "t-test needs at least 2 samples per group, got {} and {}",
                a.len(),
                b.len()
            )
            .into(),
        ));
    }

    if let Some(bad) = a.iter().chain(b).find(|v| !v.is_finite()) {
        return Err(PolarsError::ComputeError(
            format!("t-test input holds a non-finite value ({})", bad).into(),
        ));
    }

    let (na, nb) = (a.len() as f64, b.len() as f64);
    let (mean_a, var_a) = mean_and_var(a);
    let (mean_b, var_b) = mean_and_var(b);

    let dof = na + nb - 2.0;
    let pooled = ((na - 1.0) * var_a + (nb - 1.0) * var_b) / dof;
    let std_err = (pooled * (1.0 / na + 1.0 / nb)).sqrt();
    if std_err == 0.0 || !std_err.is_finite() {
        return Ok(None);
    }

    let t_stat = (mean_a - mean_b) / std_err;
    let dist = StudentsT::new(0.0, 1.0, dof).map_err(|e| polars_err(Box::new(e)))?;
    let p_value = (2.0 * dist.sf(t_stat.abs())).min(1.0);

    Ok(Some(TTest { t_stat, p_value, dof }))
}

fn describe(conditions: &[Condition]) -> String {
    if conditions.is_empty() {
        return "all profiles".to_string();
    }
    conditions
        .iter()
        .map(|c| format!("{}={}", c.column, c.value))
        .collect::<Vec<_>>()
        .join(", ")
}

fn group_values(df: &DataFrame, feature: &str) -> PolarsResult<Vec<f64>> {
    let values = df.column(feature)?.cast(&DataType::Float64)?;
    Ok(values.f64()?.into_iter().flatten().collect())
}

/// Compare group `a` against group `b` for every feature, within the rows
/// matching all `conditions`. Result rows are tagged with the conditions.
///
/// Fails when either group has fewer than two values for a feature.
pub fn compare_groups<S: AsRef<str>>(
    df: &DataFrame,
    features: &[S],
    split: &GroupSplit,
    conditions: &[Condition],
) -> PolarsResult<Vec<ComparisonRecord>> {
    require_columns(df, features)?;

    let mut subset = df.clone();
    for condition in conditions {
        subset = filter_equals(&subset, &condition.column, &condition.value)?;
    }
    let group_a = filter_equals(&subset, &split.column, &split.group_a)?;
    let group_b = filter_equals(&subset, &split.column, &split.group_b)?;
    let context = describe(conditions);
    debug!(
        "{}: {} profiles in {}={}, {} in {}={}",
        context,
        group_a.height(),
        split.column,
        split.group_a,
        group_b.height(),
        split.column,
        split.group_b
    );

    let mut records = Vec::with_capacity(features.len());
    for feature in features {
        let feature = feature.as_ref();
        let a = group_values(&group_a, feature)?;
        let b = group_values(&group_b, feature)?;

        for (group, values) in [(&split.group_a, &a), (&split.group_b, &b)] {
            if values.len() < 2 {
                return Err(PolarsError::ComputeError(
                    format!(
                        "cannot compare `{}` under {}: group {}={} has {} sample(s), need at least 2",
                        feature,
                        context,
                        split.column,
                        group,
                        values.len()
                    )
                    .into(),
                ));
            }
        }

        let non_finite = a.iter().chain(&b).filter(|v| !v.is_finite()).count();
        if non_finite > 0 {
            warn!(
                "`{}` has {} NaN or infinite value(s) under {}; no statistic",
                feature, non_finite, context
            );
            records.push(ComparisonRecord {
                feature: feature.to_string(),
                t_stat: None,
                p_value: None,
                conditions: conditions.to_vec(),
            });
            continue;
        }

        let (t_stat, p_value) = match student_t_test(&a, &b)? {
            Some(test) => (Some(test.t_stat), Some(test.p_value)),
            None => {
                warn!("`{}` has zero variance under {}; no statistic", feature, context);
                (None, None)
            }
        };

        records.push(ComparisonRecord {
            feature: feature.to_string(),
            t_stat,
            p_value,
            conditions: conditions.to_vec(),
        });
    }

    Ok(records)
}

/// Run [`compare_groups`] for every combination of the axes' values and
/// return all records sorted by feature, then by condition values.
pub fn compare_across_conditions<S: AsRef<str>>(
    df: &DataFrame,
    features: &[S],
    split: &GroupSplit,
    axes: &[ConditionAxis],
) -> PolarsResult<Vec<ComparisonRecord>> {
    let mut combinations: Vec<Vec<Condition>> = vec![Vec::new()];
    for axis in axes {
        let mut next = Vec::with_capacity(combinations.len() * axis.values.len());
        for prefix in &combinations {
            for value in &axis.values {
                let mut combination = prefix.clone();
                combination.push(Condition {
                    column: axis.column.clone(),
                    label: axis.label.clone(),
                    value: value.clone(),
                });
                next.push(combination);
            }
        }
        combinations = next;
    }

    let mut all = Vec::new();
    for conditions in &combinations {
        let records = compare_groups(df, features, split, conditions)?;
        info!("{}: compared {} features", describe(conditions), records.len());
        all.extend(records);
    }

    all.sort_by(|x, y| {
        x.feature.cmp(&y.feature).then_with(|| {
            let xv = x.conditions.iter().map(|c| c.value.as_str());
            let yv = y.conditions.iter().map(|c| c.value.as_str());
            xv.cmp(yv)
        })
    });
    Ok(all)
}

/// Results table: `cp_feature`, `t_stat`, `p_val`, one column per condition
/// label, `neg_log_10_p`.
pub fn records_to_frame(records: &[ComparisonRecord]) -> PolarsResult<DataFrame> {
    let labels: Vec<String> = records
        .first()
        .map(|r| r.conditions.iter().map(|c| c.label.clone()).collect())
        .unwrap_or_default();

    let mut columns = vec![
        Column::new(
            "cp_feature".into(),
            records.iter().map(|r| r.feature.as_str()).collect::<Vec<_>>(),
        ),
        Column::new("t_stat".into(), records.iter().map(|r| r.t_stat).collect::<Vec<_>>()),
        Column::new("p_val".into(), records.iter().map(|r| r.p_value).collect::<Vec<_>>()),
    ];

    for (idx, label) in labels.iter().enumerate() {
        let mut values = Vec::with_capacity(records.len());
        for record in records {
            let condition = record
                .conditions
                .get(idx)
                .filter(|c| &c.label == label)
                .ok_or_else(|| {
                    PolarsError::ShapeMismatch(
                        format!("record for `{}` lacks condition `{}`", record.feature, label).into(),
                    )
                })?;
            values.push(condition.value.as_str());
        }
        columns.push(Column::new(label.as_str().into(), values));
    }

    columns.push(Column::new(
        "neg_log_10_p".into(),
        records.iter().map(|r| r.neg_log_10_p()).collect::<Vec<_>>(),
    ));

    DataFrame::new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    fn split() -> GroupSplit {
        GroupSplit {
            column: "Metadata_category".to_string(),
            group_a: "1".to_string(),
            group_b: "0".to_string(),
        }
    }

    fn profiles() -> DataFrame {
        df![
            "Metadata_FFA" => &["0", "0", "0", "0", "1", "1", "1", "1"],
            "Metadata_category" => &["1", "1", "0", "0", "1", "1", "0", "0"],
            "Cells_Intensity_BODIPY" => &[1.0, 2.0, 4.0, 5.0, 3.0, 3.5, 3.0, 3.5],
            "Nuclei_Area" => &[10.0, 12.0, 10.0, 12.0, 8.0, 9.0, 7.0, 9.5]
        ]
        .unwrap()
    }

    #[test]
    fn neg_log_10_p_reference_points() {
        assert_eq!(neg_log10_p(1.0), 0.0);
        assert!(neg_log10_p(1.0).is_sign_positive());
        assert!((neg_log10_p(0.01) - 2.0).abs() < 1e-12);
        let capped = neg_log10_p(0.0);
        assert!(capped.is_finite());
        assert!((capped - 307.65).abs() < 0.01);
    }

    #[test]
    fn pooled_t_test_matches_reference() {
        let test = student_t_test(&[1.0, 2.0, 3.0, 4.0, 5.0], &[2.0, 4.0, 6.0, 8.0, 10.0])
            .unwrap()
            .unwrap();
        assert!((test.t_stat + 1.897_366_596).abs() < 1e-6);
        assert_eq!(test.dof, 8.0);
        assert!(test.p_value > 0.09 && test.p_value < 0.10, "{}", test.p_value);
    }

    #[test]
    fn identical_groups_give_p_one() {
        let test = student_t_test(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).unwrap().unwrap();
        assert_eq!(test.t_stat, 0.0);
        assert!((test.p_value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_variance_has_no_statistic() {
        assert_eq!(student_t_test(&[2.0, 2.0], &[2.0, 2.0]).unwrap(), None);
    }

    #[test]
    fn nan_input_is_not_mistaken_for_zero_variance() {
        let err = student_t_test(&[1.0, f64::NAN], &[2.0, 3.0]).unwrap_err();
        assert!(err.to_string().contains("NaN"));
    }

    #[test]
    fn nan_feature_yields_an_empty_record() {
        let df = df![
            "Metadata_category" => &["1", "1", "0", "0"],
            "Cells_Area" => &[1.0, f64::NAN, 3.0, 4.0],
            "Nuclei_Area" => &[1.0, 2.0, 3.0, 5.0]
        ]
        .unwrap();
        let records = compare_groups(&df, &["Cells_Area", "Nuclei_Area"], &split(), &[]).unwrap();
        assert_eq!(records[0].t_stat, None);
        assert_eq!(records[0].p_value, None);
        assert!(records[1].t_stat.is_some());
    }

    #[test]
    fn swapping_groups_negates_t_only() {
        let features = ["Cells_Intensity_BODIPY", "Nuclei_Area"];
        let forward = compare_groups(&profiles(), &features, &split(), &[]).unwrap();
        let swapped = GroupSplit {
            column: "Metadata_category".to_string(),
            group_a: "0".to_string(),
            group_b: "1".to_string(),
        };
        let backward = compare_groups(&profiles(), &features, &swapped, &[]).unwrap();

        for (f, b) in forward.iter().zip(&backward) {
            assert_eq!(f.feature, b.feature);
            let (ft, bt) = (f.t_stat.unwrap(), b.t_stat.unwrap());
            assert!((ft + bt).abs() < 1e-12);
            assert!((f.p_value.unwrap() - b.p_value.unwrap()).abs() < 1e-12);
        }
    }

    #[test]
    fn records_carry_feature_and_condition() {
        let condition = Condition {
            column: "Metadata_FFA".to_string(),
            label: "FFA".to_string(),
            value: "0".to_string(),
        };
        let records = compare_groups(
            &profiles(),
            &["Nuclei_Area", "Cells_Intensity_BODIPY"],
            &split(),
            &[condition.clone()],
        )
        .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].feature, "Nuclei_Area");
        assert_eq!(records[0].conditions, vec![condition]);
        // Same values in both groups under FFA=0.
        assert!((records[0].t_stat.unwrap()).abs() < 1e-12);
        assert!(records[1].t_stat.unwrap() < 0.0);
    }

    #[test]
    fn too_few_samples_fail_naming_the_condition() {
        let df = df![
            "Metadata_FFA" => &["0", "0", "0"],
            "Metadata_category" => &["1", "0", "0"],
            "Nuclei_Area" => &[1.0, 2.0, 3.0]
        ]
        .unwrap();
        let condition = Condition {
            column: "Metadata_FFA".to_string(),
            label: "FFA".to_string(),
            value: "0".to_string(),
        };

        let err = compare_groups(&df, &["Nuclei_Area"], &split(), &[condition]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Metadata_FFA=0"), "{}", msg);
        assert!(msg.contains("Metadata_category=1"), "{}", msg);
    }

    #[test]
    fn all_condition_combinations_are_compared_and_tabulated() {
        let axes = vec![ConditionAxis {
            column: "Metadata_FFA".to_string(),
            label: "FFA".to_string(),
            values: vec!["0".to_string(), "1".to_string()],
        }];
        let records = compare_across_conditions(
            &profiles(),
            &["Nuclei_Area", "Cells_Intensity_BODIPY"],
            &split(),
            &axes,
        )
        .unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].feature, "Cells_Intensity_BODIPY");
        assert_eq!(records[0].conditions[0].value, "0");
        assert_eq!(records[1].conditions[0].value, "1");

        let table = records_to_frame(&records).unwrap();
        let names: Vec<String> = table.get_column_names().iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["cp_feature", "t_stat", "p_val", "FFA", "neg_log_10_p"]);
        assert_eq!(table.height(), 4);
    }
}
