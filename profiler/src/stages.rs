//! The pipeline's stages, each a one-shot transformation from input files
//! to output files driven by [`PipelineConfig`].

use std::collections::BTreeMap;
use std::path::Path;

use polars::prelude::*;
use regex::Regex;
use tracing::{info, warn};

use crate::analysis::group_comparison::{compare_across_conditions, records_to_frame};
use crate::analysis::volcano_plot::{plot_facet_scatter, FacetScatter};
use crate::config::{FatGlobuleConfig, HarmonizeConfig, MergedBatchConfig, PipelineConfig, PlateBatchConfig};
use crate::data_handling::category_labels::CategoryLabels;
use crate::data_handling::merged_profiles::MergedProfiles;
use crate::data_handling::plate_batch::{load_plate, PlateBatch};
use crate::helper_functions::{dataframe_to_tsv, read_tsv};
use crate::models::{cast_profile_columns, feature_columns, polars_err, require_columns, Dataset};
use crate::morpheus::write_gct;
use crate::profiling::collapse::collapse_replicates;
use crate::profiling::harmonize::{harmonize, rename_channel, tag_batch};
use crate::profiling::label_merge::{filter_equals, merge_labels, recode_ids, split_by_values, LabelMergeReport};

fn feature_regex(config: &PipelineConfig) -> PolarsResult<Regex> {
    Regex::new(&config.morpheus.feature_regex).map_err(|e| polars_err(Box::new(e)))
}

fn export_gct(config: &PipelineConfig, df: &DataFrame, file: &str) -> PolarsResult<()> {
    let regex = feature_regex(config)?;
    write_gct(
        df,
        &config.morpheus_path(file),
        Some(&regex),
        config.morpheus.create_row_annotations,
    )
}

fn value_counts(df: &DataFrame, column: &str) -> PolarsResult<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    for value in df.column(column)?.str()?.into_iter() {
        *counts.entry(value.unwrap_or("null").to_string()).or_insert(0) += 1;
    }
    Ok(counts)
}

/// Load one plate batch, write the combined table and its Morpheus files.
/// Returns the combined (uncollapsed) profiles.
pub fn run_plate_batch(config: &PipelineConfig, batch: &PlateBatchConfig) -> PolarsResult<DataFrame> {
    let id = batch.batch_id.as_str();
    let plates = PlateBatch::new(config.backend_dir().join(id), batch.file_pattern.as_str());
    let mut profiles = plates.load()?;

    dataframe_to_tsv(&mut profiles, config.data_path(&batch.combined_output))?;
    export_gct(config, &profiles, &format!("full_{}_morpheus.gct", id))?;

    match &batch.day15_split {
        Some(split) => {
            let (day15, rest) = split_by_values(&profiles, &split.column, &split.values)?;
            info!("{}: {} day-15 profiles, {} others", id, day15.height(), rest.height());

            let day15_collapsed = collapse_replicates(&day15, &batch.replicate_cols)?;
            let rest_collapsed = collapse_replicates(&rest, &batch.replicate_cols)?;

            export_gct(config, &day15, &format!("full_{}_morpheus_day15.gct", id))?;
            export_gct(config, &rest, &format!("full_{}_morpheus_nonday15.gct", id))?;
            export_gct(config, &day15_collapsed, &format!("full_{}_morpheus_day15_collapsed.gct", id))?;
            export_gct(config, &rest_collapsed, &format!("full_{}_morpheus_nonday15_collapsed.gct", id))?;
        }
        None => {
            let collapsed = collapse_replicates(&profiles, &batch.replicate_cols)?;
            export_gct(config, &collapsed, &format!("collapsed_{}_morpheus.gct", id))?;
        }
    }

    if batch.per_plate_gct {
        for path in plates.plate_files()? {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("plate")
                .to_string();
            let plate = load_plate(&path)?;
            export_gct(config, &plate, &format!("{}_{}_morpheus.gct", stem, id))?;
        }
    }

    Ok(profiles)
}

/// A batch that ships as a single merged profile file.
pub fn run_merged_batch(config: &PipelineConfig, batch: &MergedBatchConfig) -> PolarsResult<DataFrame> {
    let id = batch.batch_id.as_str();
    let profiles = MergedProfiles {
        path: config.data_path(&batch.file),
    }
    .load()?;
    let collapsed = collapse_replicates(&profiles, &batch.replicate_cols)?;

    export_gct(config, &profiles, &format!("full_{}_morpheus.gct", id))?;
    export_gct(config, &collapsed, &format!("collapsed_{}_morpheus.gct", id))?;
    Ok(profiles)
}

/// Rename channels, tag and combine the configured batches, and write the
/// combined table.
pub fn run_harmonize(
    config: &PipelineConfig,
    harmonize_config: &HarmonizeConfig,
    loaded: &[(PlateBatchConfig, DataFrame)],
) -> PolarsResult<DataFrame> {
    let mut tables = Vec::with_capacity(harmonize_config.batches.len());
    for id in &harmonize_config.batches {
        let (batch, df) = loaded
            .iter()
            .find(|(batch, _)| &batch.batch_id == id)
            .ok_or_else(|| {
                PolarsError::ComputeError(
                    format!("batch `{}` is not among the loaded plate batches", id).into(),
                )
            })?;

        let mut df = df.clone();
        for rename in &batch.channel_renames {
            df = rename_channel(df, rename)?;
        }
        tables.push(tag_batch(df, &harmonize_config.batch_column, id)?);
    }

    let mut harmonized = harmonize(tables)?;
    dataframe_to_tsv(&mut harmonized.profiles, config.data_path(&harmonize_config.output))?;
    Ok(harmonized.profiles)
}

/// Aggregate, label and compare: everything of the fat globule analysis
/// except writing files.
pub fn fat_globule_results(
    fat: &FatGlobuleConfig,
    profiles: &DataFrame,
    labels: &DataFrame,
) -> PolarsResult<(DataFrame, LabelMergeReport)> {
    require_columns(profiles, &fat.drop_columns)?;
    let keep: Vec<String> = profiles
        .get_column_names()
        .iter()
        .filter(|c| !fat.drop_columns.iter().any(|d| d == c.as_str()))
        .map(|c| c.to_string())
        .collect();
    let profiles = profiles.select(keep)?;
    info!("Profiles for aggregation: {:?}", profiles.shape());

    let aggregated = collapse_replicates(&profiles, &fat.aggregate_cols)?;
    let aggregated = recode_ids(aggregated, &fat.patient_column, &fat.recode)?;
    let (grouped, report) = merge_labels(&aggregated, labels, &fat.patient_column, &fat.label_id_column)?;
    info!("Labelled profiles: {:?}", grouped.shape());

    let highlighted = feature_columns(&grouped)
        .into_iter()
        .filter(|f| f.contains(fat.highlight_channel.as_str()))
        .count();
    info!("{} features measure the {} channel", highlighted, fat.highlight_channel);
    info!("Profiles per patient: {:?}", value_counts(&grouped, &fat.patient_column)?);
    info!("Profiles per cell line: {:?}", value_counts(&grouped, &fat.cell_line_column)?);

    let subset = filter_equals(&grouped, &fat.cell_line_column, &fat.cell_line)?;
    let features = feature_columns(&subset);
    let records = compare_across_conditions(&subset, &features, &fat.groups, &fat.conditions)?;
    let results = records_to_frame(&records)?;
    info!("Comparison results: {:?}", results.shape());

    Ok((results, report))
}

fn load_profiles(path: &Path) -> PolarsResult<DataFrame> {
    cast_profile_columns(read_tsv(path)?)
}

/// Run the fat globule analysis and write its table and plot. Uses
/// `profiles` when given, otherwise reads the configured profile file.
pub fn run_fat_globule(
    config: &PipelineConfig,
    fat: &FatGlobuleConfig,
    profiles: Option<DataFrame>,
) -> PolarsResult<DataFrame> {
    let profiles = match profiles {
        Some(df) => df,
        None => load_profiles(&config.data_path(&fat.profiles_file))?,
    };
    let labels = CategoryLabels {
        path: config.data_path(&fat.labels_file),
        id_column: fat.label_id_column.clone(),
    }
    .load()?;

    let (mut results, _report) = fat_globule_results(fat, &profiles, &labels)?;
    dataframe_to_tsv(&mut results, config.results_path(&fat.results_file))?;

    match fat.conditions.as_slice() {
        [rows, cols] => {
            let layout = FacetScatter {
                x: "t_stat",
                y: "neg_log_10_p",
                row_facet: &rows.label,
                col_facet: &cols.label,
            };
            plot_facet_scatter(&results, &layout, &config.results_path(&fat.plot_file))?;
        }
        other => warn!(
            "Faceted plot needs exactly two condition axes, got {}; skipping",
            other.len()
        ),
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::group_comparison::ConditionAxis;
    use crate::config::PathConfig;
    use crate::profiling::harmonize::ChannelRename;
    use polars::df;
    use std::fs::{create_dir_all, write};
    use std::path::PathBuf;

    const HEADER: &str = "Metadata_Plate,Metadata_Plate_Map_Name,Metadata_Assay_Plate_Barcode,\
Metadata_well_position,Metadata_cell_line,Metadata_patient,Metadata_FFA,Metadata_diff_day,\
Cells_Intensity_MeanIntensity_OrigBODIPY,Nuclei_AreaShape_Area";

    /// Patients 1/2 are category 1, 3/4 category 0, 9 has no label.
    fn plate_csv(plate: &str, extra_feature: &str, shift: f64) -> String {
        let mut out = format!("{},{}\n", HEADER, extra_feature);
        let mut well = 0;
        for ffa in [0, 1] {
            for (patient, bodipy) in [(1, 5.0), (2, 6.0), (3, 1.0), (4, 2.0), (9, 3.0)] {
                for replicate in [0.0, 0.5] {
                    well += 1;
                    out.push_str(&format!(
                        "{plate},map,bc{plate},W{well},vc,PAC_{patient},{ffa},0,{},{},{}\n",
                        bodipy + replicate + shift,
                        10.0 + patient as f64 * replicate + ffa as f64,
                        well as f64
                    ));
                }
            }
        }
        out.push_str(&format!("{plate},map,bc{plate},W99,sc,PAC_1,0,0,1.0,1.0,1.0\n"));
        out
    }

    fn write_batch(root: &Path, batch: &str, plate: &str, extra: &str, shift: f64) {
        let dir = root.join("backend").join(batch).join(plate);
        create_dir_all(&dir).unwrap();
        write(
            dir.join(format!("{}_normalized_variable_selected.csv", plate)),
            plate_csv(plate, extra, shift),
        )
        .unwrap();
    }

    fn plate_batch(id: &str, per_plate_gct: bool) -> PlateBatchConfig {
        PlateBatchConfig {
            batch_id: id.to_string(),
            file_pattern: "normalized_variable_selected.csv".to_string(),
            replicate_cols: vec![
                "Metadata_Plate".to_string(),
                "Metadata_patient".to_string(),
                "Metadata_FFA".to_string(),
            ],
            combined_output: format!("{}_combined.tsv", id),
            day15_split: None,
            per_plate_gct,
            channel_renames: Vec::new(),
        }
    }

    fn test_config(root: &Path) -> PipelineConfig {
        let mut fat = FatGlobuleConfig::default();
        fat.conditions = vec![
            ConditionAxis {
                column: "Metadata_FFA".to_string(),
                label: "FFA".to_string(),
                values: vec!["0".to_string(), "1".to_string()],
            },
            ConditionAxis {
                column: "Metadata_diff_day".to_string(),
                label: "diff_day".to_string(),
                values: vec!["0".to_string()],
            },
        ];
        PipelineConfig {
            paths: PathConfig {
                backend_dir: root.join("backend"),
                data_dir: root.join("data"),
                results_dir: root.join("results"),
            },
            plate_batches: vec![plate_batch("batch1", true), plate_batch("batch3", false)],
            merged_batches: Vec::new(),
            harmonize: Some(HarmonizeConfig {
                batches: vec!["batch1".to_string(), "batch3".to_string()],
                batch_column: "Metadata_Batch".to_string(),
                output: "combined.tsv".to_string(),
            }),
            fat_globule: Some(fat),
            ..PipelineConfig::default()
        }
    }

    fn labels() -> DataFrame {
        df![
            "Metadata_IID" => &["m1", "m2", "m3", "m4", "m7"],
            "Metadata_category" => &["1", "1", "0", "0", "0"]
        ]
        .unwrap()
    }

    #[test]
    fn batches_flow_through_to_comparison_results() {
        let root = tempfile::tempdir().unwrap();
        write_batch(root.path(), "batch1", "PLATE_1", "Cells_Only_Batch1", 0.0);
        write_batch(root.path(), "batch3", "PLATE_3", "Cytoplasm_Only_Batch3", 0.2);
        let config = test_config(root.path());

        let mut loaded = Vec::new();
        for batch in &config.plate_batches {
            let df = run_plate_batch(&config, batch).unwrap();
            assert_eq!(df.height(), 21);
            loaded.push((batch.clone(), df));
        }

        let morpheus: PathBuf = root.path().join("results").join("morpheus");
        assert!(morpheus.join("full_batch1_morpheus.gct").is_file());
        assert!(morpheus.join("collapsed_batch3_morpheus.gct").is_file());
        assert!(morpheus
            .join("PLATE_1_normalized_variable_selected_batch1_morpheus.gct")
            .is_file());
        assert!(root.path().join("data").join("batch1_combined.tsv").is_file());

        let harmonize_config = config.harmonize.clone().unwrap();
        let combined = run_harmonize(&config, &harmonize_config, &loaded).unwrap();
        assert_eq!(combined.height(), 42);
        assert_eq!(
            feature_columns(&combined),
            vec!["Cells_Intensity_MeanIntensity_OrigBODIPY", "Nuclei_AreaShape_Area"]
        );

        let fat = config.fat_globule.clone().unwrap();
        let (results, report) = fat_globule_results(&fat, &combined, &labels()).unwrap();

        assert_eq!(report.unmatched_profile_ids, vec!["m9".to_string()]);
        assert_eq!(report.unused_label_ids, vec!["m7".to_string()]);
        // 2 features x 2 FFA values x 1 day.
        assert_eq!(results.height(), 4);

        let features = results.column("cp_feature").unwrap().str().unwrap();
        let t_stats = results.column("t_stat").unwrap().f64().unwrap();
        for i in 0..results.height() {
            if features.get(i) == Some("Cells_Intensity_MeanIntensity_OrigBODIPY") {
                assert!(t_stats.get(i).unwrap() > 0.0);
            }
        }
    }

    #[test]
    fn fat_globule_stage_reads_labels_and_writes_table_and_plot() {
        let root = tempfile::tempdir().unwrap();
        write_batch(root.path(), "batch1", "PLATE_1", "Cells_Only_Batch1", 0.0);
        write_batch(root.path(), "batch3", "PLATE_3", "Cytoplasm_Only_Batch3", 0.2);
        let mut config = test_config(root.path());
        if let Some(fat) = config.fat_globule.as_mut() {
            fat.profiles_file = "combined.tsv".to_string();
        }
        create_dir_all(root.path().join("data")).unwrap();
        write(
            root.path().join("data").join("category_labels.csv"),
            "IID,category,sex\nm1,1,F\nm2,1,M\nm3,0,F\nm4,0,M\nm7,0,F\n",
        )
        .unwrap();

        let mut loaded = Vec::new();
        for batch in &config.plate_batches {
            loaded.push((batch.clone(), run_plate_batch(&config, batch).unwrap()));
        }
        run_harmonize(&config, config.harmonize.as_ref().unwrap(), &loaded).unwrap();

        // Profiles come back from the harmonized TSV on disk.
        let fat = config.fat_globule.clone().unwrap();
        let results = run_fat_globule(&config, &fat, None).unwrap();
        assert_eq!(results.height(), 4);

        let table = root.path().join("results").join(&fat.results_file);
        let written = read_tsv(&table).unwrap();
        assert_eq!(written.height(), 4);
        assert!(written.column("neg_log_10_p").is_ok());
        assert!(root.path().join("results").join(&fat.plot_file).is_file());
    }

    #[test]
    fn fat_globule_stage_without_label_file_fails() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let fat = config.fat_globule.clone().unwrap();
        let profiles = df![
            "Metadata_patient" => &["PAC_1"],
            "Cells_Area" => &[1.0]
        ]
        .unwrap();
        assert!(run_fat_globule(&config, &fat, Some(profiles)).is_err());
    }

    #[test]
    fn unknown_batch_in_harmonize_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let harmonize_config = HarmonizeConfig {
            batches: vec!["batch2".to_string()],
            batch_column: "Metadata_Batch".to_string(),
            output: "combined.tsv".to_string(),
        };
        let err = run_harmonize(&config, &harmonize_config, &[]).unwrap_err();
        assert!(err.to_string().contains("batch2"));
    }

    #[test]
    fn channel_rename_is_applied_per_batch() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let mut batch3 = plate_batch("batch3", false);
        batch3.channel_renames = vec![ChannelRename {
            from: "OrigBODIPY".to_string(),
            to: "OrigLipid".to_string(),
        }];
        let df = df![
            "Metadata_Plate" => &["P"],
            "Cells_Intensity_MeanIntensity_OrigBODIPY" => &[1.0],
            "Nuclei_AreaShape_Area" => &[2.0]
        ]
        .unwrap();
        let loaded = vec![(plate_batch("batch1", false), df.clone()), (batch3, df)];

        let combined = run_harmonize(&config, config.harmonize.as_ref().unwrap(), &loaded).unwrap();
        assert_eq!(feature_columns(&combined), vec!["Nuclei_AreaShape_Area"]);
    }
}
