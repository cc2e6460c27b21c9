use anyhow::{Context, Result};
use pivot_engine::table::column_names;
use polars::prelude::*;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        }
    }
}

/// Writes result tables under `<root>/<scenario>/<result>.<ext>`.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    root: PathBuf,
    format: OutputFormat,
}

impl OutputWriter {
    pub fn new(root: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            root: root.into(),
            format,
        }
    }

    pub fn path_for(&self, scenario: &str, result: &str) -> PathBuf {
        self.root
            .join(file_safe(scenario))
            .join(format!("{}.{}", file_safe(result), self.format.extension()))
    }

    /// Write one table. Float columns have NaN and infinities replaced by
    /// nulls first.
    pub fn write(&self, scenario: &str, result: &str, df: &DataFrame) -> Result<PathBuf> {
        let path = self.path_for(scenario, result);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let float_columns: Vec<String> = column_names(df)
            .into_iter()
            .filter(|name| {
                df.column(name)
                    .map(|c| matches!(c.dtype(), DataType::Float32 | DataType::Float64))
                    .unwrap_or(false)
            })
            .collect();
        let float_refs: Vec<&str> = float_columns.iter().map(String::as_str).collect();
        let mut cleaned = pivot_engine::table::replace_non_finite(df.clone(), &float_refs)?;

        let file = fs::File::create(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        match self.format {
            OutputFormat::Csv => {
                CsvWriter::new(file).include_header(true).finish(&mut cleaned)?;
            }
            OutputFormat::Parquet => {
                ParquetWriter::new(file).finish(&mut cleaned)?;
            }
        }
        Ok(path)
    }
}

/// Result names carry spaces and parentheses; only path separators are
/// replaced.
fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}
