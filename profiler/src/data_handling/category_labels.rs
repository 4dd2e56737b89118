use std::collections::HashSet;
use std::path::PathBuf;

use polars::prelude::*;
use tracing::{error, info};

use crate::helper_functions::read_csv;
use crate::models::{Dataset, METADATA_PREFIX};

/// Manually curated patient labels, one row per patient id.
///
/// Every column is renamed to `Metadata_<name>` so the table can be merged
/// into profiles without its columns being mistaken for features, and cast
/// to `String` like the rest of the metadata.
pub struct CategoryLabels {
    pub path: PathBuf,
    /// Id column after prefixing, e.g. `Metadata_IID`.
    pub id_column: String,
}

/// Prefix and stringify every column in one projection, so no plan ever
/// refers to a name that was already renamed.
fn prefix_columns(df: DataFrame) -> PolarsResult<DataFrame> {
    let projection: Vec<Expr> = df
        .get_column_names()
        .iter()
        .map(|name| {
            let name = name.as_str();
            let prefixed = if name.starts_with(METADATA_PREFIX) {
                name.to_string()
            } else {
                format!("{}{}", METADATA_PREFIX, name)
            };
            col(name).cast(DataType::String).alias(prefixed)
        })
        .collect();
    df.lazy().select(projection).collect()
}

fn ensure_unique_ids(df: &DataFrame, id_column: &str) -> PolarsResult<()> {
    let ids = df.column(id_column)?.str()?;
    let mut seen = HashSet::new();
    for id in ids.into_iter().flatten() {
        if !seen.insert(id) {
            error!("Label id {} appears more than once", id);
            return Err(PolarsError::Duplicate(
                format!("label id `{}` is listed more than once in `{}`", id, id_column).into(),
            ));
        }
    }
    Ok(())
}

impl Dataset for CategoryLabels {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Reading category labels from {}", self.path.display());
        let df = prefix_columns(read_csv(&self.path)?)?;

        if df.column(&self.id_column).is_err() {
            return Err(PolarsError::ColumnNotFound(
                format!("label file has no `{}` column", self.id_column).into(),
            ));
        }
        ensure_unique_ids(&df, &self.id_column)?;

        info!("Loaded {} patient labels", df.height());
        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(contents: &str) -> PolarsResult<DataFrame> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("category_labels.csv");
        std::fs::write(&path, contents).unwrap();
        CategoryLabels {
            path,
            id_column: "Metadata_IID".to_string(),
        }
        .load()
    }

    #[test]
    fn prefixes_and_stringifies_columns() {
        let df = labels("IID,category,sex\nm5,1,F\nm7,0,M\n").unwrap();
        let names: Vec<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["Metadata_IID", "Metadata_category", "Metadata_sex"]);
        assert_eq!(
            df.column("Metadata_category").unwrap().str().unwrap().get(0),
            Some("1")
        );
    }

    #[test]
    fn already_prefixed_columns_keep_their_name() {
        let df = labels("Metadata_IID,category\nm5,1\n").unwrap();
        let names: Vec<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["Metadata_IID", "Metadata_category"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = labels("IID,category\nm5,1\nm5,0\n").unwrap_err();
        assert!(matches!(err, PolarsError::Duplicate(_)));
    }

    #[test]
    fn missing_id_column_is_named() {
        let err = labels("patient,category\nm5,1\n").unwrap_err();
        assert!(err.to_string().contains("Metadata_IID"));
    }
}
