use crate::error::TransformError;
use crate::models::CostKind;
use crate::table::{float_values, string_values, year_values};
use anyhow::{Context, Result};
use log::{info, warn};
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Investment categories recovered over the transmission recovery period.
pub const TRANSMISSION_CATEGORIES: [&str; 3] = [
    "inv_converter_costs",
    "inv_substation_investment_costs",
    "inv_transmission_line_investment",
];

/// Category that receives historical (pre-model) capital payments.
pub const HISTORICAL_CAPEX_CATEGORY: &str = "inv_investment_capacity_costs";

/// Cost categories present in a table, split by kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostClassification {
    pub capital: Vec<String>,
    pub operation: Vec<String>,
    pub unmapped: Vec<String>,
}

impl CostClassification {
    pub fn is_transmission(category: &str) -> bool {
        TRANSMISSION_CATEGORIES.contains(&category)
    }

    pub fn kind_of(&self, category: &str) -> Option<CostKind> {
        if self.capital.iter().any(|c| c == category) {
            Some(CostKind::Capital)
        } else if self.operation.iter().any(|c| c == category) {
            Some(CostKind::Operation)
        } else {
            None
        }
    }
}

/// Static lookup tables: deflators, cost category kinds, the region
/// hierarchy and time-slice durations.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    deflators: BTreeMap<i32, f64>,
    cost_kinds: HashMap<String, CostKind>,
    supply_to_balancing: HashMap<String, String>,
    timeslice_hours: HashMap<String, f64>,
}

impl ReferenceData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `deflator.csv`, `cost_cat_type.csv`, `rsmap.csv` and `hours.csv`
    /// from a reference directory. Missing files leave the lookup empty.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut reference = Self::new();

        let deflator_path = dir.join("deflator.csv");
        if deflator_path.exists() {
            let df = read_csv(&deflator_path)?;
            // first column is the dollar year, as in the model's deflator export
            let year_col = df
                .get_column_names()
                .first()
                .map(|c| c.to_string())
                .context("deflator.csv has no columns")?;
            let years = year_values(&df, &year_col)?;
            let factors = float_values(&df, "Deflator")?;
            for (year, factor) in years.into_iter().zip(factors) {
                if let (Some(year), Some(factor)) = (year, factor) {
                    reference.add_deflator(year, factor);
                }
            }
        } else {
            warn!("No deflator table at {}", deflator_path.display());
        }

        let cost_type_path = dir.join("cost_cat_type.csv");
        if cost_type_path.exists() {
            let df = read_csv(&cost_type_path)?;
            let categories = string_values(&df, "cost_cat")?;
            let kinds = string_values(&df, "type")?;
            for (category, kind) in categories.into_iter().zip(kinds) {
                match (category, kind.as_deref().and_then(CostKind::parse)) {
                    (Some(category), Some(kind)) => reference.add_cost_kind(&category, kind),
                    (Some(category), None) => {
                        warn!("Cost category '{}' has an unrecognised type", category)
                    }
                    _ => {}
                }
            }
        }

        let rsmap_path = dir.join("rsmap.csv");
        if rsmap_path.exists() {
            let df = read_csv(&rsmap_path)?;
            let supply = string_values(&df, "rs")?;
            let balancing_col = if df.column("*r").is_ok() { "*r" } else { "r" };
            let balancing = string_values(&df, balancing_col)?;
            for (rs, r) in supply.into_iter().zip(balancing) {
                if let (Some(rs), Some(r)) = (rs, r) {
                    reference.add_region_mapping(&rs, &r);
                }
            }
        }

        let hours_path = dir.join("hours.csv");
        if hours_path.exists() {
            let df = read_csv(&hours_path)?;
            let slices = string_values(&df, "timeslice")?;
            let hours = float_values(&df, "hours")?;
            for (slice, hours) in slices.into_iter().zip(hours) {
                if let (Some(slice), Some(hours)) = (slice, hours) {
                    reference.add_timeslice_hours(&slice, hours);
                }
            }
        }

        info!(
            "Loaded reference data: {} deflators, {} cost categories, {} region mappings, {} time slices",
            reference.deflators.len(),
            reference.cost_kinds.len(),
            reference.supply_to_balancing.len(),
            reference.timeslice_hours.len()
        );
        Ok(reference)
    }

    pub fn add_deflator(&mut self, year: i32, factor: f64) {
        self.deflators.insert(year, factor);
    }

    pub fn add_cost_kind(&mut self, category: &str, kind: CostKind) {
        self.cost_kinds.insert(category.to_string(), kind);
    }

    pub fn add_region_mapping(&mut self, supply_region: &str, balancing_region: &str) {
        self.supply_to_balancing
            .insert(supply_region.to_string(), balancing_region.to_string());
    }

    pub fn add_timeslice_hours(&mut self, timeslice: &str, hours: f64) {
        self.timeslice_hours.insert(timeslice.to_string(), hours);
    }

    /// Multiplier converting deflator-indexed values into `dollar_year` dollars.
    pub fn inflation_factor(&self, dollar_year: i32) -> Result<f64, TransformError> {
        self.deflators
            .get(&dollar_year)
            .map(|deflator| 1.0 / deflator)
            .ok_or(TransformError::MissingDeflator(dollar_year))
    }

    pub fn cost_kind(&self, category: &str) -> Option<CostKind> {
        self.cost_kinds.get(category).copied()
    }

    /// Split categories into capital and operation lists, preserving input
    /// order. Unclassified categories are reported and left out of both.
    pub fn classify_costs<I, S>(&self, categories: I) -> CostClassification
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut classification = CostClassification::default();
        for category in categories {
            let category = category.as_ref();
            let bucket = match self.cost_kind(category) {
                Some(CostKind::Capital) => &mut classification.capital,
                Some(CostKind::Operation) => &mut classification.operation,
                None => &mut classification.unmapped,
            };
            if !bucket.iter().any(|c| c == category) {
                bucket.push(category.to_string());
            }
        }
        if !classification.unmapped.is_empty() {
            warn!(
                "Not all cost categories have been mapped; categories without a mapping: {:?}",
                classification.unmapped
            );
        }
        classification
    }

    /// Balancing region for a supply region. Balancing regions map to
    /// themselves.
    pub fn balancing_region<'a>(&'a self, region: &'a str) -> &'a str {
        self.supply_to_balancing
            .get(region)
            .map(|r| r.as_str())
            .unwrap_or(region)
    }

    pub fn timeslice_hours(&self, timeslice: &str) -> Option<f64> {
        self.timeslice_hours.get(timeslice).copied()
    }

    /// Time-slice durations as a two-column frame for joins.
    pub fn hours_frame(&self) -> PolarsResult<DataFrame> {
        let mut slices: Vec<(&String, &f64)> = self.timeslice_hours.iter().collect();
        slices.sort_by(|a, b| a.0.cmp(b.0));
        let names: Vec<&str> = slices.iter().map(|(name, _)| name.as_str()).collect();
        let hours: Vec<f64> = slices.iter().map(|(_, hours)| **hours).collect();
        df!(
            crate::table::TIMESLICE => names,
            "hours" => hours
        )
    }
}

fn read_csv(path: &Path) -> Result<DataFrame> {
    LazyCsvReader::new(path)
        .with_has_header(true)
        .finish()?
        .collect()
        .with_context(|| format!("reading {}", path.display()))
}
