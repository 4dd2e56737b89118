use std::env;
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::info;

use crate::models::polars_err;

pub fn project_root() -> PathBuf {
    match env::var_os("PROJECT_ROOT") {
        Some(val) => PathBuf::from(val),
        None => {
            // Fall back to current directory if PROJECT_ROOT not set
            env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        }
    }
}

/// Anchor a relative path at the project root; absolute paths pass through.
pub fn resolve(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root().join(path)
    }
}

pub fn read_csv(file_path: impl AsRef<Path>) -> PolarsResult<DataFrame> {
    read_delimited(file_path.as_ref(), b',')
}

/// Tab separated input. Gzip compressed files (`.tsv.gz`) are decompressed
/// transparently by the reader.
pub fn read_tsv(file_path: impl AsRef<Path>) -> PolarsResult<DataFrame> {
    read_delimited(file_path.as_ref(), b'\t')
}

fn read_delimited(file_path: &Path, separator: u8) -> PolarsResult<DataFrame> {
    if !file_path.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("input file {} does not exist", file_path.display()),
        )
        .into());
    }

    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(None)
        .map_parse_options(|opts| opts.with_separator(separator))
        .try_into_reader_with_file_path(Some(file_path.to_path_buf()))?
        .finish()
}

pub fn ensure_parent_dir(path: &Path) -> PolarsResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            create_dir_all(parent).map_err(|e| polars_err(Box::new(e)))?;
        }
    }
    Ok(())
}

pub fn dataframe_to_tsv(df: &mut DataFrame, path: impl AsRef<Path>) -> PolarsResult<()> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;

    let mut file = File::create(path).map_err(|e| polars_err(Box::new(e)))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b'\t')
        .finish(df)?;

    info!("Wrote {} rows x {} cols to {}", df.height(), df.width(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    #[test]
    fn tsv_written_then_read_keeps_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("profiles.tsv");
        let mut df = df![
            "Metadata_Plate" => &["P1", "P2", "P3"],
            "Cells_AreaShape_Area" => &[1.5, 2.5, 3.5]
        ]
        .unwrap();

        dataframe_to_tsv(&mut df, &path).unwrap();
        let back = read_tsv(&path).unwrap();
        assert_eq!(back.shape(), (3, 2));
        assert_eq!(
            back.column("Cells_AreaShape_Area").unwrap().f64().unwrap().get(2),
            Some(3.5)
        );
    }

    #[test]
    fn missing_input_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_csv(dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, PolarsError::IO { .. }));
    }

    #[test]
    fn absolute_paths_are_not_rebased() {
        let abs = if cfg!(windows) { PathBuf::from(r"C:\data") } else { PathBuf::from("/data") };
        assert_eq!(resolve(&abs), abs);
    }
}
