use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::analysis::group_comparison::{ConditionAxis, GroupSplit};
use crate::helper_functions::resolve;
use crate::morpheus::DEFAULT_FEATURE_REGEX;
use crate::profiling::harmonize::ChannelRename;
use crate::profiling::label_merge::IdRecoder;

pub const CONFIG_ENV: &str = "PROFILER_CONFIG";

const PLATE_FILE_PATTERN: &str = "normalized_variable_selected.csv";

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn plate_replicate_cols() -> Vec<String> {
    strings(&[
        "Metadata_Plate",
        "Metadata_cell_line",
        "Metadata_patient",
        "Metadata_FFA",
        "Metadata_diff_day",
    ])
}

/// Everything the pipeline needs to know; defaults reproduce the 2019
/// experiment layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathConfig,
    pub plate_batches: Vec<PlateBatchConfig>,
    pub merged_batches: Vec<MergedBatchConfig>,
    pub harmonize: Option<HarmonizeConfig>,
    pub fat_globule: Option<FatGlobuleConfig>,
    pub morpheus: MorpheusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Root holding one directory per batch, each with one directory per plate.
    pub backend_dir: PathBuf,
    pub data_dir: PathBuf,
    pub results_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Day15Split {
    pub column: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlateBatchConfig {
    pub batch_id: String,
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
    pub replicate_cols: Vec<String>,
    /// File name of the combined table under `data_dir`.
    pub combined_output: String,
    #[serde(default)]
    pub day15_split: Option<Day15Split>,
    #[serde(default)]
    pub per_plate_gct: bool,
    #[serde(default)]
    pub channel_renames: Vec<ChannelRename>,
}

fn default_file_pattern() -> String {
    PLATE_FILE_PATTERN.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergedBatchConfig {
    pub batch_id: String,
    /// File name under `data_dir`.
    pub file: String,
    pub replicate_cols: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HarmonizeConfig {
    /// Plate batches to combine, by `batch_id`.
    pub batches: Vec<String>,
    pub batch_column: String,
    pub output: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FatGlobuleConfig {
    pub labels_file: String,
    pub label_id_column: String,
    /// Read from `data_dir` when the harmonize stage did not run.
    pub profiles_file: String,
    pub drop_columns: Vec<String>,
    pub aggregate_cols: Vec<String>,
    pub patient_column: String,
    #[serde(default)]
    pub recode: IdRecoder,
    pub cell_line_column: String,
    pub cell_line: String,
    pub conditions: Vec<ConditionAxis>,
    pub groups: GroupSplit,
    /// Substring marking the lipid-stain features that get reported separately.
    pub highlight_channel: String,
    pub results_file: String,
    pub plot_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MorpheusConfig {
    pub feature_regex: String,
    pub create_row_annotations: bool,
    /// Sub-directory of `results_dir`.
    pub output_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            backend_dir: PathBuf::from("../../backend"),
            data_dir: PathBuf::from("data"),
            results_dir: PathBuf::from("results"),
        }
    }
}

impl Default for MorpheusConfig {
    fn default() -> Self {
        Self {
            feature_regex: DEFAULT_FEATURE_REGEX.to_string(),
            create_row_annotations: true,
            output_dir: PathBuf::from("morpheus"),
        }
    }
}

impl Default for HarmonizeConfig {
    fn default() -> Self {
        Self {
            batches: strings(&["2019_04_16_Batch1", "2019_08_06_Batch3"]),
            batch_column: "Metadata_Batch".to_string(),
            output: "batch1_batch3_combined_normalized_variable_selected.tsv".to_string(),
        }
    }
}

impl Default for FatGlobuleConfig {
    fn default() -> Self {
        Self {
            labels_file: "category_labels.csv".to_string(),
            label_id_column: "Metadata_IID".to_string(),
            profiles_file: "batch1_batch3_combined_normalized_variable_selected.tsv".to_string(),
            drop_columns: strings(&[
                "Metadata_Plate",
                "Metadata_Assay_Plate_Barcode",
                "Metadata_well_position",
            ]),
            aggregate_cols: strings(&[
                "Metadata_Plate_Map_Name",
                "Metadata_cell_line",
                "Metadata_patient",
                "Metadata_FFA",
                "Metadata_diff_day",
                "Metadata_Batch",
            ]),
            patient_column: "Metadata_patient".to_string(),
            recode: IdRecoder::default(),
            cell_line_column: "Metadata_cell_line".to_string(),
            cell_line: "vc".to_string(),
            conditions: vec![
                ConditionAxis {
                    column: "Metadata_FFA".to_string(),
                    label: "FFA".to_string(),
                    values: strings(&["0", "1"]),
                },
                ConditionAxis {
                    column: "Metadata_diff_day".to_string(),
                    label: "diff_day".to_string(),
                    values: strings(&["0", "3", "14"]),
                },
            ],
            groups: GroupSplit {
                column: "Metadata_category".to_string(),
                group_a: "1".to_string(),
                group_b: "0".to_string(),
            },
            highlight_channel: "BODIPY".to_string(),
            results_file: "fat_globule_analysis_results.tsv".to_string(),
            plot_file: "fat_globule_volcano.png".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            paths: PathConfig::default(),
            plate_batches: vec![
                PlateBatchConfig {
                    batch_id: "2019_04_16_Batch1".to_string(),
                    file_pattern: default_file_pattern(),
                    replicate_cols: plate_replicate_cols(),
                    combined_output: "combined_normalized_variable_selected.tsv".to_string(),
                    day15_split: Some(Day15Split {
                        column: "Metadata_diff_day".to_string(),
                        values: strings(&["15", "15+iso"]),
                    }),
                    per_plate_gct: true,
                    channel_renames: Vec::new(),
                },
                PlateBatchConfig {
                    batch_id: "2019_08_06_Batch3".to_string(),
                    file_pattern: default_file_pattern(),
                    replicate_cols: plate_replicate_cols(),
                    combined_output: "2019_08_06_Batch3_combined_normalized_variable_selected.tsv"
                        .to_string(),
                    day15_split: None,
                    per_plate_gct: false,
                    channel_renames: Vec::new(),
                },
            ],
            merged_batches: vec![MergedBatchConfig {
                batch_id: "2019_06_11_Batch2".to_string(),
                file: "merged_profiles_2019_06_11_Batch2.tsv.gz".to_string(),
                replicate_cols: strings(&[
                    "Metadata_Plate",
                    "Metadata_cell_line",
                    "Metadata_condition_O2",
                    "Metadata_treatment",
                ]),
            }],
            harmonize: Some(HarmonizeConfig::default()),
            fat_globule: Some(FatGlobuleConfig::default()),
            morpheus: MorpheusConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("cannot open config file {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Config file from the first CLI argument, else `$PROFILER_CONFIG`,
    /// else the built-in defaults.
    pub fn from_env(arg: Option<String>) -> Result<Self> {
        let path = arg.or_else(|| std::env::var(CONFIG_ENV).ok());
        match path {
            Some(path) => Self::from_path(&resolve(path)),
            None => Ok(Self::default()),
        }
    }

    pub fn backend_dir(&self) -> PathBuf {
        resolve(&self.paths.backend_dir)
    }

    pub fn data_path(&self, file: &str) -> PathBuf {
        resolve(self.paths.data_dir.join(file))
    }

    pub fn results_path(&self, file: &str) -> PathBuf {
        resolve(self.paths.results_dir.join(file))
    }

    pub fn morpheus_path(&self, file: &str) -> PathBuf {
        resolve(self.paths.results_dir.join(&self.morpheus.output_dir).join(file))
    }
}
