//! Declarative result definitions: which table to load, which transforms to
//! run in which order, and how the output should be charted.

use crate::error::{PipelineError, TransformError};
use crate::models::{ChartType, NamedPresets, Preset};
use crate::reference_data::ReferenceData;
use crate::transforms::{self, SumArgs};
use polars::prelude::DataFrame;
use serde::Serialize;
use std::collections::BTreeMap;

/// One transform invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Step {
    SumOverCols(SumArgs),
    SumOverMonths(SumArgs),
    SumOverDays(SumArgs),
    SumOverHours(SumArgs),
    ScaleColumn {
        column: String,
        scale_factor: f64,
    },
    ScaleColumnFiltered {
        by_column: String,
        by_values: Vec<String>,
        change_column: String,
        scale_factor: f64,
    },
    ApplyInflation {
        column: String,
    },
}

impl Step {
    pub fn scale(column: &str, scale_factor: f64) -> Self {
        Step::ScaleColumn {
            column: column.to_string(),
            scale_factor,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::SumOverCols(_) => "sum_over_cols",
            Step::SumOverMonths(_) => "sum_over_months",
            Step::SumOverDays(_) => "sum_over_days",
            Step::SumOverHours(_) => "sum_over_hours",
            Step::ScaleColumn { .. } => "scale_column",
            Step::ScaleColumnFiltered { .. } => "scale_column_filtered",
            Step::ApplyInflation { .. } => "apply_inflation",
        }
    }

    /// Dispatch to the transform implementation.
    pub fn apply(
        &self,
        df: DataFrame,
        reference: &ReferenceData,
        dollar_year: i32,
    ) -> Result<DataFrame, TransformError> {
        match self {
            Step::SumOverCols(args) => transforms::sum_over_cols(df, args),
            Step::SumOverMonths(args) => transforms::sum_over_months(df, args),
            Step::SumOverDays(args) => transforms::sum_over_days(df, args),
            Step::SumOverHours(args) => transforms::sum_over_hours(df, args),
            Step::ScaleColumn {
                column,
                scale_factor,
            } => transforms::scale_column(df, column, *scale_factor),
            Step::ScaleColumnFiltered {
                by_column,
                by_values,
                change_column,
                scale_factor,
            } => transforms::scale_column_filtered(
                df,
                by_column,
                by_values,
                change_column,
                *scale_factor,
            ),
            Step::ApplyInflation { column } => {
                let factor = reference.inflation_factor(dollar_year)?;
                transforms::apply_inflation(df, column, factor)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSpec {
    pub name: String,
    pub source_table: String,
    pub columns: Vec<String>,
    pub steps: Vec<Step>,
    pub index: Vec<String>,
    pub presets: NamedPresets,
}

impl ResultSpec {
    pub fn new(name: &str, source_table: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            source_table: source_table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            steps: Vec::new(),
            index: Vec::new(),
            presets: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn index(mut self, index: &[&str]) -> Self {
        self.index = index.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn preset(mut self, name: &str, preset: Preset) -> Self {
        self.presets.push((name.to_string(), preset));
        self
    }
}

/// Result specs keyed by name; iteration is alphabetical.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    specs: BTreeMap<String, ResultSpec>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, spec: ResultSpec) -> Option<ResultSpec> {
        self.specs.insert(spec.name.clone(), spec)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.keys().map(|k| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultSpec> {
        self.specs.values()
    }

    pub fn get(&self, name: &str) -> Result<&ResultSpec, PipelineError> {
        self.specs
            .get(name)
            .ok_or_else(|| PipelineError::UnknownResult(name.to_string()))
    }

    /// Presets of one result without touching its data.
    pub fn presets(&self, name: &str) -> Result<&NamedPresets, PipelineError> {
        self.get(name).map(|spec| &spec.presets)
    }

    /// Results shipped with the engine for the standard model outputs.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for (label, table, value) in [
            ("Capacity National", "cap", "Capacity (GW)"),
            ("Battery Load", "bat_load", "Load (GW)"),
        ] {
            for spec in resolution_family(label, table, "tech", value) {
                registry.insert(spec);
            }
        }
        for spec in generation_results() {
            registry.insert(spec);
        }
        for spec in emissions_results() {
            registry.insert(spec);
        }
        registry
    }
}

fn spec_with_columns(name: &str, table: &str, series: &str, value: &str) -> ResultSpec {
    ResultSpec::new(
        name,
        table,
        &[series, "rb", "year", "month", "day", "hour", value],
    )
}

fn yearly(name: &str, table: &str, series: &str, value: &str) -> ResultSpec {
    spec_with_columns(name, table, series, value)
        .step(Step::SumOverCols(SumArgs::dropping(
            &["rb", "month", "day", "hour"],
            &[series, "year"],
        )))
        .index(&[series, "year"])
}

fn monthly(name: &str, table: &str, series: &str, value: &str) -> ResultSpec {
    spec_with_columns(name, table, series, value)
        .step(Step::SumOverMonths(
            SumArgs::dropping(&["rb", "day", "hour"], &[series, "year"]).month("month"),
        ))
        .index(&[series, "year", "month"])
}

fn daily(name: &str, table: &str, series: &str, value: &str) -> ResultSpec {
    spec_with_columns(name, table, series, value)
        .step(Step::SumOverDays(
            SumArgs::dropping(&["rb", "hour"], &[series, "year"])
                .month("month")
                .day("day"),
        ))
        .index(&[series, "year", "month", "day"])
}

fn hourly(name: &str, table: &str, series: &str, value: &str) -> ResultSpec {
    spec_with_columns(name, table, series, value)
        .step(Step::SumOverHours(
            SumArgs::dropping(&["rb"], &[series, "year"])
                .month("month")
                .day("day")
                .hour("hour"),
        ))
        .index(&[series, "year", "month", "day", "hour"])
}

/// Yearly/Monthly/Daily/Hourly variants of a national result scaled to GW.
fn resolution_family(label: &str, table: &str, series: &str, value: &str) -> Vec<ResultSpec> {
    vec![
        yearly(&format!("{label} (Yearly)"), table, series, value)
            .step(Step::scale(value, 1e-6))
            .preset("Stacked Bars", Preset::stacked_bars("year", value, series)),
        monthly(&format!("{label} (Monthly)"), table, series, value)
            .step(Step::scale(value, 1e-6))
            .preset(
                "Stacked Bars",
                Preset::stacked_bars("month", value, series).filter_last("year"),
            ),
        daily(&format!("{label} (Daily)"), table, series, value)
            .step(Step::scale(value, 1e-6))
            .preset(
                "Stacked Bars",
                Preset::stacked_bars("day", value, series)
                    .filter_last("year")
                    .filter_last("month"),
            ),
        hourly(&format!("{label} (Hourly)"), table, series, value)
            .step(Step::scale(value, 1e-6))
            .preset(
                "Stacked Bars",
                Preset::stacked_bars("hour", value, series)
                    .filter_last("year")
                    .filter_last("month")
                    .filter_last("day"),
            ),
    ]
}

fn generation_results() -> Vec<ResultSpec> {
    let value = "Generation (TWh)";
    vec![
        yearly("Generation National (TWh)", "gen_ann", "tech", value)
            .step(Step::scale(value, 1e-6))
            .preset(
                "Stacked Area",
                Preset::new("year", value, "tech", "scenario", ChartType::Area),
            )
            .preset("Stacked Bars", Preset::stacked_bars("year", value, "tech"))
            .preset(
                "Stacked Bars Gen Frac",
                Preset::stacked_bars("year", value, "tech").ratio_of("tech", "Total"),
            )
            .preset(
                "Explode By Tech",
                Preset::new("year", value, "scenario", "tech", ChartType::Line),
            ),
        monthly("Generation National Month", "gen_ann", "tech", value)
            .step(Step::scale(value, 1e-6))
            .preset(
                "Stacked Bars",
                Preset::stacked_bars("month", value, "tech").filter_last("year"),
            ),
        daily("Generation National Day", "gen_ann", "tech", value)
            .step(Step::scale(value, 1e-6))
            .preset(
                "Stacked Bars",
                Preset::stacked_bars("day", value, "tech")
                    .filter_last("year")
                    .filter_last("month"),
            ),
        hourly("Generation National hour", "gen_ann", "tech", value)
            .step(Step::scale(value, 1e-6))
            .preset(
                "Stacked Bars",
                Preset::stacked_bars("hour", value, "tech")
                    .filter_last("year")
                    .filter_last("month")
                    .filter_last("day"),
            ),
    ]
}

fn emissions_results() -> Vec<ResultSpec> {
    let value = "Emissions (tonne)";
    vec![
        yearly("CO2 Emissions by Generator (Yearly)", "emit_r", "e", value)
            .preset("Stacked Bars", Preset::stacked_bars("year", value, "e")),
        yearly("CO2 Emissions National (Yearly)", "emit_r", "e", value).preset(
            "Stacked Bars",
            Preset::stacked_bars("year", value, "e").filter_values("e", &["co2"]),
        ),
        monthly("CO2 Emissions National (Monthly)", "emit_r", "e", value).preset(
            "Stacked Bars",
            Preset::stacked_bars("month", value, "e")
                .filter_last("year")
                .filter_values("e", &["co2"]),
        ),
        daily("CO2 Emissions National (Daily)", "emit_r", "e", value).preset(
            "Stacked Bars",
            Preset::stacked_bars("day", value, "e")
                .filter_last("year")
                .filter_last("month")
                .filter_values("e", &["co2"]),
        ),
        hourly("CO2 Emissions National (Hourly)", "emit_r", "e", value).preset(
            "Stacked Bars",
            Preset::stacked_bars("hour", value, "e")
                .filter_last("year")
                .filter_last("month")
                .filter_last("day")
                .filter_values("e", &["co2"]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_sorted_and_stable() {
        let registry = Registry::builtin();
        let names = registry.names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names, Registry::builtin().names());
        assert_eq!(registry.len(), 17);
        assert_eq!(names[0], "Battery Load (Daily)");
    }

    #[test]
    fn test_unknown_result_is_lookup_error() {
        let registry = Registry::builtin();
        assert!(matches!(
            registry.get("Capacity Regional"),
            Err(PipelineError::UnknownResult(name)) if name == "Capacity Regional"
        ));
    }

    #[test]
    fn test_presets_without_running() {
        let registry = Registry::builtin();
        let presets = registry.presets("Generation National (TWh)").unwrap();
        let names: Vec<&str> = presets.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["Stacked Area", "Stacked Bars", "Stacked Bars Gen Frac", "Explode By Tech"]
        );
        assert_eq!(presets[2].1.adv_col_base.as_deref(), Some("Total"));
    }

    #[test]
    fn test_builtin_specs_keep_index_columns_in_declared_columns() {
        for spec in Registry::builtin().iter() {
            for column in &spec.index {
                assert!(spec.columns.contains(column), "{} lost {}", spec.name, column);
            }
            assert!(!spec.steps.is_empty(), "{} has no steps", spec.name);
        }
    }

    #[test]
    fn test_step_kinds() {
        let spec = Registry::builtin();
        let spec = spec.get("Capacity National (Monthly)").unwrap();
        let kinds: Vec<&str> = spec.steps.iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec!["sum_over_months", "scale_column"]);
        assert_eq!(spec.index, vec!["tech", "year", "month"]);
    }
}
