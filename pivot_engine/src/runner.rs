use crate::data_loader::TableLoader;
use crate::error::PipelineError;
use crate::models::{NamedPresets, RunConfig};
use crate::reference_data::ReferenceData;
use crate::registry::{Registry, ResultSpec};
use crate::table::first_missing;
use log::{debug, info, warn};
use polars::prelude::*;

/// Output of one pipeline run.
#[derive(Debug, Clone)]
pub struct ResultTable {
    pub name: String,
    pub data: DataFrame,
    pub index: Vec<String>,
    pub presets: NamedPresets,
}

/// Executes result specs against a table loader.
pub struct PipelineRunner<'a> {
    registry: &'a Registry,
    config: RunConfig,
    reference: &'a ReferenceData,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(registry: &'a Registry, config: RunConfig, reference: &'a ReferenceData) -> Self {
        Self {
            registry,
            config,
            reference,
        }
    }

    pub fn run(&self, name: &str, loader: &dyn TableLoader) -> Result<ResultTable, PipelineError> {
        let spec = self.registry.get(name)?;
        self.run_spec(spec, loader)
    }

    /// Load the source table, keep the declared columns and apply every step
    /// in order.
    pub fn run_spec(
        &self,
        spec: &ResultSpec,
        loader: &dyn TableLoader,
    ) -> Result<ResultTable, PipelineError> {
        let raw = loader
            .load(&spec.source_table)
            .map_err(|source| PipelineError::TableLoad {
                result: spec.name.clone(),
                table: spec.source_table.clone(),
                source,
            })?;

        let mut df = if spec.columns.is_empty() {
            raw
        } else {
            if let Some(column) = first_missing(&raw, &spec.columns) {
                return Err(PipelineError::MissingColumn {
                    result: spec.name.clone(),
                    table: spec.source_table.clone(),
                    column: column.to_string(),
                });
            }
            raw.select(spec.columns.iter().map(|c| c.as_str()))?
        };

        for (step_index, step) in spec.steps.iter().enumerate() {
            debug!("{}: step {} {}", spec.name, step_index, step.kind());
            df = step
                .apply(df, self.reference, self.config.dollar_year)
                .map_err(|source| PipelineError::Step {
                    result: spec.name.clone(),
                    table: spec.source_table.clone(),
                    step: step_index,
                    kind: step.kind(),
                    source,
                })?;
        }

        if let Some(column) = first_missing(&df, &spec.index) {
            return Err(PipelineError::IndexLost {
                result: spec.name.clone(),
                column: column.to_string(),
            });
        }

        Ok(ResultTable {
            name: spec.name.clone(),
            data: df,
            index: spec.index.clone(),
            presets: spec.presets.clone(),
        })
    }

    /// Run every registered result in name order. A failing result is logged
    /// and reported without stopping the others.
    pub fn run_all(&self, loader: &dyn TableLoader) -> Vec<(String, Result<ResultTable, PipelineError>)> {
        let outcomes: Vec<_> = self
            .registry
            .iter()
            .map(|spec| {
                let outcome = self.run_spec(spec, loader);
                if let Err(e) = &outcome {
                    warn!("{}", e);
                }
                (spec.name.clone(), outcome)
            })
            .collect();
        let succeeded = outcomes.iter().filter(|(_, r)| r.is_ok()).count();
        info!("Processed {} of {} results", succeeded, outcomes.len());
        outcomes
    }
}
