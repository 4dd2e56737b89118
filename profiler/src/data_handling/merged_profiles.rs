use std::path::PathBuf;

use polars::prelude::*;
use tracing::{error, info};

use crate::helper_functions::read_tsv;
use crate::models::{cast_profile_columns, Dataset};

/// A batch delivered as one pre-merged, tab separated profile file
/// (`merged_profiles_<batch>.tsv.gz`).
pub struct MergedProfiles {
    pub path: PathBuf,
}

impl Dataset for MergedProfiles {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Reading merged profiles from {}", self.path.display());
        let df = match read_tsv(&self.path) {
            Ok(df) => df,
            Err(e) => {
                error!("Failed to read merged profiles: {}", e);
                return Err(e);
            }
        };

        if df.height() == 0 {
            return Err(PolarsError::NoData(
                format!("{} contains no profiles", self.path.display()).into(),
            ));
        }

        info!("Merged profiles shape: {:?}", df.shape());
        cast_profile_columns(df)
    }
}
