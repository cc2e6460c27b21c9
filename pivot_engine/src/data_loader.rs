use anyhow::{bail, Context, Result};
use log::debug;
use polars::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Source of raw model tables by name.
pub trait TableLoader: Send + Sync {
    fn load(&self, table: &str) -> Result<DataFrame>;

    /// Like `load`, but a missing table comes back as `None`.
    fn load_optional(&self, table: &str) -> Result<Option<DataFrame>> {
        if self.contains(table) {
            self.load(table).map(Some)
        } else {
            Ok(None)
        }
    }

    fn contains(&self, table: &str) -> bool;
}

/// Fails when a table the current computation depends on was absent or
/// empty in the run.
pub fn ensure_present(present: bool, table: &str) -> Result<()> {
    if !present {
        bail!("required table '{}' is missing or empty", table);
    }
    Ok(())
}

/// Reads `<run>/outputs/<table>.csv`.
pub struct CsvTableLoader {
    dir: PathBuf,
}

impl CsvTableLoader {
    /// Loader over a scenario run folder.
    pub fn for_run(run_dir: &Path) -> Self {
        Self::new(run_dir.join("outputs"))
    }

    /// Loader over a directory that holds the CSV tables directly.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", table))
    }
}

impl TableLoader for CsvTableLoader {
    fn load(&self, table: &str) -> Result<DataFrame> {
        let path = self.table_path(table);
        if !path.exists() {
            bail!("table file {} does not exist", path.display());
        }
        debug!("Loading {}", path.display());
        let df = LazyCsvReader::new(&path)
            .with_has_header(true)
            .with_infer_schema_length(Some(10000))
            .finish()?
            .collect()
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(df)
    }

    fn contains(&self, table: &str) -> bool {
        self.table_path(table).exists()
    }
}

/// Serves frames registered up front. Used by tests and callers that build
/// tables in memory.
#[derive(Default)]
pub struct InMemoryLoader {
    tables: HashMap<String, DataFrame>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, df: DataFrame) -> Self {
        self.insert(table, df);
        self
    }

    pub fn insert(&mut self, table: &str, df: DataFrame) {
        self.tables.insert(table.to_string(), df);
    }
}

impl TableLoader for InMemoryLoader {
    fn load(&self, table: &str) -> Result<DataFrame> {
        self.tables
            .get(table)
            .cloned()
            .with_context(|| format!("table '{}' not loaded", table))
    }

    fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }
}
