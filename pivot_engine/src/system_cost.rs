//! System cost annualization and discounting.
//!
//! Raw investment and operation cost streams come in as long rows of
//! `(cost_cat, [r], year, Cost (Bil $))` in raw dollars. The engine converts
//! them to billions of output-year dollars and then either discounts them
//! as-is, annualizes capital over its recovery window, or applies the model's
//! objective-function present-value factors.

use crate::capital_recovery::{
    forward_fill, rolling_sum, shift_forward, CapitalTiming, CrfSchedule, CrfSource,
};
use crate::data_loader::{ensure_present, TableLoader};
use crate::models::{CostKind, RunConfig};
use crate::reference_data::{CostClassification, ReferenceData, HISTORICAL_CAPEX_CATEGORY};
use crate::table::{
    column_names, float_values, normalize, string_values, year_map, year_values, COST, COST_CAT,
    DISCOUNTED_COST, QUANTITY, REGION, REQ_TYPE, YEAR,
};
use anyhow::{bail, Context, Result};
use log::{debug, info};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

pub const SYSTEM_COST_TABLE: &str = "systemcost";
pub const SWITCHES_TABLE: &str = "switches";
pub const SCALARS_TABLE: &str = "scalars";
pub const CRF_TABLE: &str = "crf";
pub const CAPEX_INIT_TABLE: &str = "df_capex_init";
pub const VALID_BA_TABLE: &str = "valid_ba_list";
pub const PVF_CAPITAL_TABLE: &str = "pvf_capital";
pub const PVF_ONM_TABLE: &str = "pvf_onm";

pub const EMISSIONS_TABLE: &str = "emit";

pub const AVERAGE_COST: &str = "Average cost ($/MWh)";

pub const CO2_MMTON: &str = "CO2 (MMton)";
/// Category and type label of the emission rows in the abatement table.
pub const CO2_LABEL: &str = "CO2 (Bil metric ton)";
pub const VALUE_TYPE: &str = "type";
pub const VALUE: &str = "val";
pub const DISCOUNTED_VALUE: &str = "disc val";
pub const CUMULATIVE_VALUE: &str = "cum val";
pub const CUMULATIVE_DISCOUNTED_VALUE: &str = "cum disc val";

/// Capital spending on capacity that predates the first modelled year.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalCapex {
    pub year: i32,
    pub region: String,
    pub capex: f64,
}

/// Everything the cost engine reads from a run.
#[derive(Debug, Clone)]
pub struct CostTables {
    pub costs: DataFrame,
    pub sys_eval_years: u32,
    pub trans_crp: u32,
    pub model_crf: Vec<(i32, f64)>,
    pub historical_capex: Vec<HistoricalCapex>,
    /// Modelled balancing regions. Empty means no restriction.
    pub valid_regions: Vec<String>,
    pub pvf_capital: BTreeMap<i32, f64>,
    pub pvf_onm: BTreeMap<i32, f64>,
}

impl CostTables {
    pub fn new(costs: DataFrame, sys_eval_years: u32, trans_crp: u32) -> Self {
        Self {
            costs,
            sys_eval_years,
            trans_crp,
            model_crf: Vec::new(),
            historical_capex: Vec::new(),
            valid_regions: Vec::new(),
            pvf_capital: BTreeMap::new(),
            pvf_onm: BTreeMap::new(),
        }
    }

    /// Read the cost table, run switches and scalars, plus whichever optional
    /// CRF, historical capex, region and present-value tables the run has.
    pub fn load(loader: &dyn TableLoader) -> Result<Self> {
        let costs = loader
            .load(SYSTEM_COST_TABLE)
            .context("loading system cost table")?;
        let switches = loader.load(SWITCHES_TABLE).context("loading run switches")?;
        let scalars = loader.load(SCALARS_TABLE).context("loading run scalars")?;

        let sys_eval_years = lookup_value(&switches, "switch", "sys_eval_years")? as u32;
        let trans_crp = lookup_value(&scalars, "scalar", "trans_crp")? as u32;
        let mut tables = Self::new(costs, sys_eval_years, trans_crp);

        if let Some(df) = loader.load_optional(CRF_TABLE)? {
            tables.model_crf = year_map(&df, "crf")?.into_iter().collect();
        }
        if let Some(df) = loader.load_optional(CAPEX_INIT_TABLE)? {
            let years = year_values(&df, "t")?;
            let regions = string_values(&df, "region")?;
            let capex = float_values(&df, "capex")?;
            for ((year, region), capex) in years.into_iter().zip(regions).zip(capex) {
                if let (Some(year), Some(region), Some(capex)) = (year, region, capex) {
                    tables.historical_capex.push(HistoricalCapex { year, region, capex });
                }
            }
        }
        if let Some(df) = loader.load_optional(VALID_BA_TABLE)? {
            let column = if df.column(REGION).is_ok() {
                REGION.to_string()
            } else {
                column_names(&df)
                    .into_iter()
                    .next()
                    .context("valid_ba_list has no columns")?
            };
            tables.valid_regions = string_values(&df, &column)?.into_iter().flatten().collect();
        }
        if let Some(df) = loader.load_optional(PVF_CAPITAL_TABLE)? {
            tables.pvf_capital = year_map(&df, "pvfcap")?;
        }
        if let Some(df) = loader.load_optional(PVF_ONM_TABLE)? {
            tables.pvf_onm = year_map(&df, "pvfonm")?;
        }

        debug!(
            "Cost tables: {} rows, sys_eval_years={}, trans_crp={}, {} CRF points, {} capex rows",
            tables.costs.height(),
            tables.sys_eval_years,
            tables.trans_crp,
            tables.model_crf.len(),
            tables.historical_capex.len()
        );
        Ok(tables)
    }

    fn add_years(&self) -> i32 {
        self.sys_eval_years.max(self.trans_crp) as i32
    }
}

/// Value of the `value` column on the row whose `key_column` equals `key`.
fn lookup_value(df: &DataFrame, key_column: &str, key: &str) -> Result<f64> {
    let keys = string_values(df, key_column)?;
    let values = float_values(df, "value")?;
    keys.iter()
        .zip(values)
        .find(|(k, _)| k.as_deref() == Some(key))
        .and_then(|(_, v)| v)
        .with_context(|| format!("no '{}' entry in {} table", key, key_column))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnnualizeOptions {
    /// Keep the region column instead of aggregating nationally.
    pub by_region: bool,
    pub crf_source: CrfSource,
    pub capital_timing: CapitalTiming,
    /// Drop years before the present-value year and skip the historical
    /// capital backfill.
    pub remove_existing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostMode {
    Raw,
    Annualized(AnnualizeOptions),
    Objective,
}

/// How costs and emissions are put on a common footing for abatement cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbatementMode {
    /// Objective-function costs next to emissions weighted by the O&M
    /// present-value factor.
    Objective,
    /// Costs annualized with the closed-form CRF next to annual emissions,
    /// with discounted and cumulative values.
    Annualized(CapitalTiming),
}

/// National CO2 emissions per year, in million metric tons.
pub fn load_emissions(loader: &dyn TableLoader) -> Result<BTreeMap<i32, f64>> {
    let df = loader.load(EMISSIONS_TABLE).context("loading emissions")?;
    let years = year_values(&df, YEAR)?;
    let amounts = float_values(&df, CO2_MMTON)?;
    let mut emissions = BTreeMap::new();
    for (year, amount) in years.into_iter().zip(amounts) {
        if let (Some(year), Some(amount)) = (year, amount) {
            *emissions.entry(year).or_insert(0.0) += amount;
        }
    }
    Ok(emissions)
}

/// Running total that skips missing entries and leaves them missing.
fn cumulative(categories: &[String], values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut totals: HashMap<&str, f64> = HashMap::new();
    categories
        .iter()
        .zip(values)
        .map(|(category, value)| {
            let value = (*value)?;
            let total = totals.entry(category.as_str()).or_insert(0.0);
            *total += value;
            Some(*total)
        })
        .collect()
}

/// One inflated cost row.
#[derive(Debug, Clone)]
struct CostRow {
    category: String,
    region: String,
    year: i32,
    amount: f64,
}

pub struct SystemCostEngine<'a> {
    config: RunConfig,
    reference: &'a ReferenceData,
}

impl<'a> SystemCostEngine<'a> {
    pub fn new(config: RunConfig, reference: &'a ReferenceData) -> Self {
        Self { config, reference }
    }

    pub fn compute(&self, tables: &CostTables, mode: CostMode) -> Result<DataFrame> {
        match mode {
            CostMode::Raw => self.raw(tables),
            CostMode::Annualized(options) => self.annualize(tables, &options),
            CostMode::Objective => self.objective(tables),
        }
    }

    /// Output-year billions multiplier for raw model dollars.
    fn dollar_scale(&self) -> Result<f64> {
        Ok(self.reference.inflation_factor(self.config.dollar_year)? * 1e-9)
    }

    fn inflated_costs(&self, tables: &CostTables) -> Result<DataFrame> {
        let scale = self.dollar_scale()?;
        let df = normalize(tables.costs.clone(), &[COST_CAT, REGION], &[YEAR], &[COST])?;
        let df = df
            .lazy()
            .with_column((col(COST) * lit(scale)).alias(COST))
            .collect()?;
        Ok(df)
    }

    fn classify(&self, df: &DataFrame) -> Result<CostClassification> {
        let categories = string_values(df, COST_CAT)?;
        Ok(self
            .reference
            .classify_costs(categories.iter().flatten()))
    }

    /// Inflated rows with the discounted column appended.
    pub fn raw(&self, tables: &CostTables) -> Result<DataFrame> {
        let mut df = self.inflated_costs(tables)?;
        self.classify(&df)?;
        let years = year_values(&df, YEAR)?;
        let costs = float_values(&df, COST)?;
        let discounted: Vec<Option<f64>> = years
            .into_iter()
            .zip(costs)
            .map(|(year, cost)| Some(self.config.discount(cost?, year?)))
            .collect();
        df.with_column(Series::new(DISCOUNTED_COST.into(), discounted))?;
        Ok(df)
    }

    /// Capital rows scaled by the capital present-value factor and operation
    /// rows by the O&M factor for their year. Unclassified rows pass through.
    pub fn objective(&self, tables: &CostTables) -> Result<DataFrame> {
        let mut df = self.inflated_costs(tables)?;
        let classification = self.classify(&df)?;
        if !classification.capital.is_empty() {
            ensure_present(!tables.pvf_capital.is_empty(), PVF_CAPITAL_TABLE)?;
        }
        if !classification.operation.is_empty() {
            ensure_present(!tables.pvf_onm.is_empty(), PVF_ONM_TABLE)?;
        }
        let categories = string_values(&df, COST_CAT)?;
        let years = year_values(&df, YEAR)?;
        let costs = float_values(&df, COST)?;

        let adjusted: Vec<Option<f64>> = categories
            .iter()
            .zip(years)
            .zip(costs)
            .map(|((category, year), cost)| {
                let cost = cost?;
                let kind = category.as_deref().and_then(|c| classification.kind_of(c));
                let factors = match kind {
                    Some(CostKind::Capital) => &tables.pvf_capital,
                    Some(CostKind::Operation) => &tables.pvf_onm,
                    None => return Some(cost),
                };
                factors.get(&year?).map(|factor| cost * factor)
            })
            .collect();
        df.with_column(Series::new(COST.into(), adjusted))?;
        Ok(df)
    }

    fn cost_rows(&self, df: &DataFrame, by_region: bool) -> Result<Vec<CostRow>> {
        let categories = string_values(df, COST_CAT)?;
        let years = year_values(df, YEAR)?;
        let amounts = float_values(df, COST)?;
        let regions = if by_region {
            if df.column(REGION).is_err() {
                bail!("regional annualization needs a '{}' column", REGION);
            }
            string_values(df, REGION)?
        } else {
            vec![None; df.height()]
        };

        let mut rows = Vec::with_capacity(df.height());
        for (((category, year), amount), region) in
            categories.into_iter().zip(years).zip(amounts).zip(regions)
        {
            if let (Some(category), Some(year), Some(amount)) = (category, year, amount) {
                rows.push(CostRow {
                    category,
                    region: region.unwrap_or_default(),
                    year,
                    amount,
                });
            }
        }
        Ok(rows)
    }

    /// Historical capex in billions of output-year dollars keyed by
    /// (balancing region, year), or by ("", year) for national output. Only
    /// years before `first_year` in modelled regions are kept.
    fn historical_capex(
        &self,
        tables: &CostTables,
        first_year: i32,
        by_region: bool,
    ) -> Result<HashMap<(String, i32), f64>> {
        let scale = self.dollar_scale()?;
        let mut capex = HashMap::new();
        for entry in &tables.historical_capex {
            if entry.year >= first_year {
                continue;
            }
            let region = self.reference.balancing_region(&entry.region);
            if !tables.valid_regions.is_empty() && !tables.valid_regions.iter().any(|r| r == region) {
                continue;
            }
            let key = if by_region { region.to_string() } else { String::new() };
            *capex.entry((key, entry.year)).or_insert(0.0) += entry.capex * scale;
        }
        Ok(capex)
    }

    /// Spread capital over its recovery window, carry operation costs over
    /// the evaluation period and discount the result.
    pub fn annualize(&self, tables: &CostTables, options: &AnnualizeOptions) -> Result<DataFrame> {
        if options.crf_source == CrfSource::Model {
            ensure_present(!tables.model_crf.is_empty(), CRF_TABLE)?;
        }
        let df = self.inflated_costs(tables)?;
        let mut classification = self.classify(&df)?;
        let rows = self.cost_rows(&df, options.by_region)?;

        let first_year = rows.iter().map(|r| r.year).min().context("cost table is empty")?;
        let last_year = rows.iter().map(|r| r.year).max().context("cost table is empty")?;
        let sys_eval = tables.sys_eval_years as i32;
        let axis: Vec<i32> = (first_year - sys_eval..=last_year + tables.add_years()).collect();
        let width = axis.len();

        let mut regions: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut grid: HashMap<(String, String), Vec<f64>> = HashMap::new();
        for row in &rows {
            if options.remove_existing && row.year < self.config.pv_year {
                continue;
            }
            if seen.insert(row.region.clone()) {
                regions.push(row.region.clone());
            }
            if classification.kind_of(&row.category).is_none() {
                continue;
            }
            let pos = (row.year - axis[0]) as usize;
            let column = grid
                .entry((row.region.clone(), row.category.clone()))
                .or_insert_with(|| vec![f64::NAN; width]);
            column[pos] = if column[pos].is_nan() {
                row.amount
            } else {
                column[pos] + row.amount
            };
        }

        if !options.remove_existing {
            let capex = self.historical_capex(tables, first_year, options.by_region)?;
            let backfill = !capex.is_empty()
                && self.reference.cost_kind(HISTORICAL_CAPEX_CATEGORY) == Some(CostKind::Capital);
            if backfill {
                if !classification.capital.iter().any(|c| c == HISTORICAL_CAPEX_CATEGORY) {
                    classification.capital.push(HISTORICAL_CAPEX_CATEGORY.to_string());
                }
                for region in &regions {
                    let column = grid
                        .entry((region.clone(), HISTORICAL_CAPEX_CATEGORY.to_string()))
                        .or_insert_with(|| vec![f64::NAN; width]);
                    for (pos, year) in axis.iter().enumerate().take_while(|(_, y)| **y < first_year) {
                        column[pos] = capex
                            .get(&(region.clone(), *year))
                            .copied()
                            .unwrap_or(f64::NAN);
                    }
                }
                info!("Backfilled historical capital for {} region-years", capex.len());
            }
        }

        let crf = match options.crf_source {
            CrfSource::User => CrfSchedule::user(&self.config, tables.sys_eval_years, &axis),
            CrfSource::Model => CrfSchedule::from_model(&tables.model_crf, &axis),
        }
        .with_timing(options.capital_timing, self.config.discount_rate);

        let start = sys_eval.max(0) as usize;
        let kept_years = &axis[start.min(width)..];
        let ffill_limit = tables.sys_eval_years.saturating_sub(1) as usize;

        let mut annualized: HashMap<(String, String), Vec<f64>> = HashMap::new();
        for region in &regions {
            for category in &classification.capital {
                let key = (region.clone(), category.clone());
                let mut values = grid.remove(&key).unwrap_or_else(|| vec![f64::NAN; width]);
                if options.capital_timing == CapitalTiming::NextYear {
                    values = shift_forward(&values);
                }
                for (value, factor) in values.iter_mut().zip(crf.factors()) {
                    let amount = if value.is_nan() { 0.0 } else { *value };
                    *value = amount * factor;
                }
                let window = if CostClassification::is_transmission(category) {
                    tables.trans_crp
                } else {
                    tables.sys_eval_years
                };
                let values = rolling_sum(&values, window as usize);
                annualized.insert(key, values[start.min(width)..].to_vec());
            }
            for category in &classification.operation {
                let key = (region.clone(), category.clone());
                let values = grid.remove(&key).unwrap_or_else(|| vec![f64::NAN; width]);
                let mut values = values[start.min(width)..].to_vec();
                forward_fill(&mut values, ffill_limit);
                annualized.insert(key, values);
            }
        }

        let mut out_regions = Vec::new();
        let mut out_years = Vec::new();
        let mut out_categories = Vec::new();
        let mut out_costs = Vec::new();
        let mut out_discounted = Vec::new();
        for category in classification.capital.iter().chain(&classification.operation) {
            for (i, year) in kept_years.iter().enumerate() {
                for region in &regions {
                    let value = annualized
                        .get(&(region.clone(), category.clone()))
                        .and_then(|values| values.get(i).copied())
                        .filter(|v| !v.is_nan())
                        .unwrap_or(0.0);
                    out_regions.push(region.clone());
                    out_years.push(*year as i64);
                    out_categories.push(category.clone());
                    out_costs.push(value);
                    out_discounted.push(self.config.discount(value, *year));
                }
            }
        }

        let mut columns = Vec::new();
        if options.by_region {
            columns.push(Series::new(REGION.into(), out_regions));
        }
        columns.push(Series::new(YEAR.into(), out_years));
        columns.push(Series::new(COST_CAT.into(), out_categories));
        columns.push(Series::new(COST.into(), out_costs));
        columns.push(Series::new(DISCOUNTED_COST.into(), out_discounted));
        let out = DataFrame::new(columns)?;
        info!(
            "Annualized {} cost categories over {}-{} ({} rows)",
            classification.capital.len() + classification.operation.len(),
            kept_years.first().copied().unwrap_or(first_year),
            kept_years.last().copied().unwrap_or(last_year),
            out.height()
        );
        Ok(out)
    }

    /// National costs and CO2 emissions (billion metric tons) in one long
    /// table keyed by (cost_cat, year), for abatement cost charts.
    pub fn abatement_cost(
        &self,
        tables: &CostTables,
        emissions: &BTreeMap<i32, f64>,
        mode: AbatementMode,
    ) -> Result<DataFrame> {
        let mut categories: Vec<String> = Vec::new();
        let mut years: Vec<i32> = Vec::new();
        let mut values: Vec<Option<f64>> = Vec::new();
        let mut types: Vec<&str> = Vec::new();

        match mode {
            AbatementMode::Objective => {
                let df = self.objective(tables)?;
                let mut index: HashMap<(String, i32), usize> = HashMap::new();
                let costs = float_values(&df, COST)?;
                for ((category, year), cost) in string_values(&df, COST_CAT)?
                    .into_iter()
                    .zip(year_values(&df, YEAR)?)
                    .zip(costs)
                {
                    let (Some(category), Some(year)) = (category, year) else {
                        continue;
                    };
                    let pos = *index.entry((category.clone(), year)).or_insert_with(|| {
                        categories.push(category);
                        years.push(year);
                        values.push(None);
                        types.push(COST);
                        values.len() - 1
                    });
                    if let Some(cost) = cost {
                        values[pos] = Some(values[pos].unwrap_or(0.0) + cost);
                    }
                }
                ensure_present(!tables.pvf_onm.is_empty(), PVF_ONM_TABLE)?;
                for (year, amount) in emissions {
                    categories.push(CO2_LABEL.to_string());
                    years.push(*year);
                    values.push(tables.pvf_onm.get(year).map(|pvf| amount * 1e-3 * pvf));
                    types.push(CO2_LABEL);
                }
            }
            AbatementMode::Annualized(timing) => {
                let options = AnnualizeOptions {
                    by_region: false,
                    crf_source: CrfSource::User,
                    capital_timing: timing,
                    remove_existing: false,
                };
                let df = self.annualize(tables, &options)?;
                let cost_years = year_values(&df, YEAR)?;
                for ((category, year), cost) in string_values(&df, COST_CAT)?
                    .into_iter()
                    .zip(cost_years.iter().copied())
                    .zip(float_values(&df, COST)?)
                {
                    if let (Some(category), Some(year)) = (category, year) {
                        categories.push(category);
                        years.push(year);
                        values.push(cost);
                        types.push(COST);
                    }
                }
                let first = cost_years.iter().flatten().min().copied();
                let last = cost_years.iter().flatten().max().copied();
                if let (Some(first), Some(last)) = (first, last) {
                    let mut carried = None;
                    for year in first..=last {
                        if let Some(amount) = emissions.get(&year) {
                            carried = Some(amount * 1e-3);
                        }
                        categories.push(CO2_LABEL.to_string());
                        years.push(year);
                        values.push(carried);
                        types.push(CO2_LABEL);
                    }
                }
            }
        }

        let mut columns = vec![
            Series::new(COST_CAT.into(), categories.clone()),
            Series::new(YEAR.into(), years.iter().map(|y| *y as i64).collect::<Vec<_>>()),
            Series::new(VALUE_TYPE.into(), types),
            Series::new(VALUE.into(), values.clone()),
        ];
        if let AbatementMode::Annualized(_) = mode {
            let discounted: Vec<Option<f64>> = values
                .iter()
                .zip(&years)
                .map(|(value, year)| value.map(|v| self.config.discount(v, *year)))
                .collect();
            columns.push(Series::new(
                CUMULATIVE_VALUE.into(),
                cumulative(&categories, &values),
            ));
            columns.push(Series::new(
                CUMULATIVE_DISCOUNTED_VALUE.into(),
                cumulative(&categories, &discounted),
            ));
            columns.insert(4, Series::new(DISCOUNTED_VALUE.into(), discounted));
        }
        let out = DataFrame::new(columns)?;
        info!("Built abatement cost table with {} rows", out.height());
        Ok(out)
    }

    /// National annualized cost divided by national load. Load years missing
    /// from the requirement table carry the previous year's load.
    pub fn national_average_cost(
        &self,
        tables: &CostTables,
        quantities: &DataFrame,
        options: &AnnualizeOptions,
    ) -> Result<DataFrame> {
        let options = AnnualizeOptions {
            by_region: false,
            ..*options
        };
        let costs = self.annualize(tables, &options)?;

        let types = string_values(quantities, REQ_TYPE)?;
        let years = year_values(quantities, YEAR)?;
        let amounts = float_values(quantities, QUANTITY)?;
        let mut load: BTreeMap<i32, f64> = BTreeMap::new();
        for ((kind, year), q) in types.iter().zip(years).zip(amounts) {
            if let (Some("load"), Some(year), Some(q)) = (kind.as_deref(), year, q) {
                *load.entry(year).or_insert(0.0) += q;
            }
        }

        let cost_years = year_values(&costs, YEAR)?;
        let (first, last) = match (
            cost_years.iter().flatten().min(),
            cost_years.iter().flatten().max(),
        ) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Ok(costs),
        };
        let mut national_load: BTreeMap<i32, f64> = BTreeMap::new();
        let mut carried = None;
        for year in first..=last {
            if let Some(q) = load.get(&year) {
                carried = Some(*q);
            }
            if let Some(q) = carried {
                national_load.insert(year, q);
            }
        }

        let cost_values = float_values(&costs, COST)?;
        let year_load: Vec<Option<f64>> = cost_years
            .iter()
            .map(|y| y.and_then(|y| national_load.get(&y).copied()))
            .collect();
        let average: Vec<Option<f64>> = cost_values
            .iter()
            .zip(&year_load)
            .map(|(cost, q)| Some(cost.as_ref()? * 1e9 / q.as_ref()?))
            .collect();

        let mut out = costs;
        out.with_column(Series::new(QUANTITY.into(), year_load))?;
        out.with_column(Series::new(AVERAGE_COST.into(), average))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loader::InMemoryLoader;
    use crate::table::value_at;

    fn reference() -> ReferenceData {
        let mut reference = ReferenceData::new();
        reference.add_deflator(2004, 1.0);
        reference.add_deflator(2020, 0.5);
        reference.add_cost_kind("inv_capacity", CostKind::Capital);
        reference.add_cost_kind(HISTORICAL_CAPEX_CATEGORY, CostKind::Capital);
        reference.add_cost_kind("inv_transmission_line_investment", CostKind::Capital);
        reference.add_cost_kind("op_fuel", CostKind::Operation);
        reference.add_region_mapping("s1", "p1");
        reference.add_region_mapping("s9", "p9");
        reference
    }

    fn two_year_costs() -> DataFrame {
        df!(
            "cost_cat" => ["inv_capacity", "inv_capacity", "op_fuel", "op_fuel"],
            "r" => ["p1", "p1", "p1", "p1"],
            "year" => [2026i64, 2027, 2026, 2027],
            "Cost (Bil $)" => [100.0e9, 100.0e9, 10.0e9, 10.0e9]
        )
        .unwrap()
    }

    fn cost(df: &DataFrame, category: &str, year: i32) -> f64 {
        value_at(df, &[("cost_cat", category), ("year", &year.to_string())], COST).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {}, got {}", expected, actual);
    }

    #[test]
    fn test_two_year_annualization() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::default(), &reference);
        let mut tables = CostTables::new(two_year_costs(), 2, 2);
        tables.model_crf = vec![(2026, 0.6)];

        let out = engine.annualize(&tables, &AnnualizeOptions::default()).unwrap();
        assert_eq!(out.height(), 8);
        assert_close(cost(&out, "inv_capacity", 2026), 0.0);
        assert_close(cost(&out, "inv_capacity", 2027), 60.0);
        assert_close(cost(&out, "inv_capacity", 2028), 120.0);
        assert_close(cost(&out, "inv_capacity", 2029), 60.0);
        for year in 2026..=2028 {
            assert_close(cost(&out, "op_fuel", year), 10.0);
        }
        assert_close(cost(&out, "op_fuel", 2029), 0.0);
    }

    #[test]
    fn test_same_year_timing_starts_payments_immediately() {
        let reference = reference();
        let config = RunConfig::default();
        let engine = SystemCostEngine::new(config, &reference);
        let mut tables = CostTables::new(two_year_costs(), 2, 2);
        tables.model_crf = vec![(2026, 0.6)];
        let options = AnnualizeOptions {
            capital_timing: CapitalTiming::SameYear,
            ..Default::default()
        };

        let out = engine.annualize(&tables, &options).unwrap();
        let payment = 100.0 * 0.6 / 1.05;
        assert_close(cost(&out, "inv_capacity", 2026), payment);
        assert_close(cost(&out, "inv_capacity", 2027), 2.0 * payment);
        assert_close(cost(&out, "inv_capacity", 2028), payment);
        assert_close(cost(&out, "inv_capacity", 2029), 0.0);
    }

    #[test]
    fn test_constant_investment_reaches_steady_state() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::default(), &reference);
        let years: Vec<i64> = (2030..2040).collect();
        let costs = df!(
            "cost_cat" => vec!["inv_capacity"; years.len()],
            "year" => years.clone(),
            "Cost (Bil $)" => vec![10.0e9; years.len()]
        )
        .unwrap();
        let mut tables = CostTables::new(costs, 3, 1);
        tables.model_crf = vec![(2030, 0.1)];

        let out = engine.annualize(&tables, &AnnualizeOptions::default()).unwrap();
        assert_close(cost(&out, "inv_capacity", 2032), 2.0);
        for year in 2033..=2039 {
            assert_close(cost(&out, "inv_capacity", year), 10.0 * 0.1 * 3.0);
        }
        // payments run off after the last investment
        assert_close(cost(&out, "inv_capacity", 2042), 0.1 * 10.0);
    }

    #[test]
    fn test_transmission_uses_its_own_recovery_period() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::default(), &reference);
        let costs = df!(
            "cost_cat" => ["inv_transmission_line_investment", "inv_capacity"],
            "year" => [2030i64, 2030],
            "Cost (Bil $)" => [1.0e9, 1.0e9]
        )
        .unwrap();
        let mut tables = CostTables::new(costs, 1, 3);
        tables.model_crf = vec![(2030, 1.0)];

        let out = engine.annualize(&tables, &AnnualizeOptions::default()).unwrap();
        // one-year window for generation capital, three years for transmission
        assert_close(cost(&out, "inv_capacity", 2031), 1.0);
        assert_close(cost(&out, "inv_capacity", 2032), 0.0);
        for year in 2031..=2033 {
            assert_close(cost(&out, "inv_transmission_line_investment", year), 1.0);
        }
    }

    #[test]
    fn test_regional_backfill_from_historical_capex() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::default(), &reference);
        let costs = df!(
            "cost_cat" => ["op_fuel", "op_fuel"],
            "r" => ["p1", "p2"],
            "year" => [2026i64, 2026],
            "Cost (Bil $)" => [1.0e9, 2.0e9]
        )
        .unwrap();
        let mut tables = CostTables::new(costs, 2, 1);
        tables.model_crf = vec![(2026, 0.5)];
        tables.valid_regions = vec!["p1".to_string(), "p2".to_string()];
        tables.historical_capex = vec![
            HistoricalCapex { year: 2024, region: "s1".to_string(), capex: 20.0e9 },
            HistoricalCapex { year: 2025, region: "s1".to_string(), capex: 40.0e9 },
            HistoricalCapex { year: 2025, region: "s9".to_string(), capex: 99.0e9 },
            HistoricalCapex { year: 2026, region: "p2".to_string(), capex: 7.0e9 },
        ];
        let options = AnnualizeOptions {
            by_region: true,
            ..Default::default()
        };

        let out = engine.annualize(&tables, &options).unwrap();
        let at = |r: &str, category: &str, year: &str| {
            value_at(&out, &[("r", r), ("cost_cat", category), ("year", year)], COST).unwrap()
        };
        assert_close(at("p1", HISTORICAL_CAPEX_CATEGORY, "2026"), 30.0);
        assert_close(at("p1", HISTORICAL_CAPEX_CATEGORY, "2027"), 20.0);
        assert_close(at("p1", HISTORICAL_CAPEX_CATEGORY, "2028"), 0.0);
        assert_close(at("p2", HISTORICAL_CAPEX_CATEGORY, "2026"), 0.0);
        assert_close(at("p2", "op_fuel", "2027"), 2.0);
        assert_close(at("p2", "op_fuel", "2028"), 0.0);
        assert!(value_at(&out, &[("r", "p9")], COST).is_none());
    }

    #[test]
    fn test_remove_existing_drops_early_years() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::new(0.05, 2028, 2004), &reference);
        let costs = df!(
            "cost_cat" => ["op_fuel", "op_fuel"],
            "year" => [2026i64, 2030],
            "Cost (Bil $)" => [5.0e9, 3.0e9]
        )
        .unwrap();
        let mut tables = CostTables::new(costs, 1, 1);
        tables.historical_capex = vec![HistoricalCapex {
            year: 2025,
            region: "p1".to_string(),
            capex: 1.0e9,
        }];
        let options = AnnualizeOptions {
            remove_existing: true,
            crf_source: CrfSource::User,
            ..Default::default()
        };

        let out = engine.annualize(&tables, &options).unwrap();
        assert_close(cost(&out, "op_fuel", 2026), 0.0);
        assert_close(cost(&out, "op_fuel", 2030), 3.0);
        assert!(value_at(&out, &[("cost_cat", HISTORICAL_CAPEX_CATEGORY)], COST).is_none());
    }

    #[test]
    fn test_remove_existing_drops_regions_without_later_years() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::new(0.05, 2028, 2004), &reference);
        let costs = df!(
            "cost_cat" => ["op_fuel", "op_fuel", "op_fuel"],
            "r" => ["p1", "p2", "p2"],
            "year" => [2026i64, 2026, 2030],
            "Cost (Bil $)" => [5.0e9, 1.0e9, 2.0e9]
        )
        .unwrap();
        let tables = CostTables::new(costs, 1, 1);
        let options = AnnualizeOptions {
            by_region: true,
            remove_existing: true,
            crf_source: CrfSource::User,
            ..Default::default()
        };

        let out = engine.annualize(&tables, &options).unwrap();
        assert!(value_at(&out, &[("r", "p1")], COST).is_none());
        let p2 = [("r", "p2"), ("cost_cat", "op_fuel"), ("year", "2030")];
        assert_close(value_at(&out, &p2, COST).unwrap(), 2.0);
    }

    #[test]
    fn test_model_crf_without_crf_table_is_error() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::default(), &reference);
        let tables = CostTables::new(two_year_costs(), 2, 2);

        let err = engine.annualize(&tables, &AnnualizeOptions::default()).unwrap_err();
        assert!(err.to_string().contains(CRF_TABLE));
        let user = AnnualizeOptions {
            crf_source: CrfSource::User,
            ..Default::default()
        };
        assert!(engine.annualize(&tables, &user).is_ok());
    }

    #[test]
    fn test_objective_without_pv_factors_is_error() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::default(), &reference);
        let mut tables = CostTables::new(two_year_costs(), 2, 2);

        let err = engine.compute(&tables, CostMode::Objective).unwrap_err();
        assert!(err.to_string().contains(PVF_CAPITAL_TABLE));
        tables.pvf_capital.insert(2026, 0.5);
        let err = engine.compute(&tables, CostMode::Objective).unwrap_err();
        assert!(err.to_string().contains(PVF_ONM_TABLE));
    }

    #[test]
    fn test_missing_run_tables_are_errors() {
        let switches = df!("switch" => ["sys_eval_years"], "value" => ["20"]).unwrap();
        let scalars = df!("scalar" => ["trans_crp"], "value" => [40.0]).unwrap();

        let loader = InMemoryLoader::new()
            .with_table(SWITCHES_TABLE, switches.clone())
            .with_table(SCALARS_TABLE, scalars.clone());
        let err = CostTables::load(&loader).unwrap_err();
        assert!(format!("{:#}", err).contains("system cost"));

        let loader = InMemoryLoader::new()
            .with_table(SYSTEM_COST_TABLE, two_year_costs())
            .with_table(SCALARS_TABLE, scalars);
        let err = CostTables::load(&loader).unwrap_err();
        assert!(format!("{:#}", err).contains("run switches"));

        let loader = InMemoryLoader::new()
            .with_table(SYSTEM_COST_TABLE, two_year_costs())
            .with_table(SWITCHES_TABLE, switches)
            .with_table(SCALARS_TABLE, df!("scalar" => ["other"], "value" => [1.0]).unwrap());
        let err = CostTables::load(&loader).unwrap_err();
        assert!(err.to_string().contains("trans_crp"));
    }

    #[test]
    fn test_unmapped_categories_are_left_out() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::default(), &reference);
        let costs = df!(
            "cost_cat" => ["op_fuel", "mystery"],
            "year" => [2026i64, 2026],
            "Cost (Bil $)" => [1.0e9, 1.0e9]
        )
        .unwrap();
        let mut tables = CostTables::new(costs, 1, 1);
        tables.model_crf = vec![(2026, 0.1)];
        let out = engine.annualize(&tables, &AnnualizeOptions::default()).unwrap();
        assert!(value_at(&out, &[("cost_cat", "mystery")], COST).is_none());
        assert_close(cost(&out, "op_fuel", 2026), 1.0);
    }

    #[test]
    fn test_raw_discount_round_trip_and_inflation() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::new(0.05, 2026, 2020), &reference);
        let tables = CostTables::new(two_year_costs(), 2, 2);

        let out = engine.compute(&tables, CostMode::Raw).unwrap();
        let row = [("cost_cat", "op_fuel"), ("year", "2026")];
        assert_close(value_at(&out, &row, COST).unwrap(), 20.0);
        assert_close(value_at(&out, &row, DISCOUNTED_COST).unwrap(), 20.0);
        let later = [("cost_cat", "op_fuel"), ("year", "2027")];
        assert_close(value_at(&out, &later, DISCOUNTED_COST).unwrap(), 20.0 / 1.05);
    }

    #[test]
    fn test_objective_applies_pv_factors() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::default(), &reference);
        let costs = df!(
            "cost_cat" => ["inv_capacity", "op_fuel", "mystery", "op_fuel"],
            "year" => [2026i64, 2026, 2026, 2027],
            "Cost (Bil $)" => [1.0e9, 1.0e9, 1.0e9, 1.0e9]
        )
        .unwrap();
        let mut tables = CostTables::new(costs, 1, 1);
        tables.pvf_capital.insert(2026, 0.5);
        tables.pvf_onm.insert(2026, 4.0);

        let out = engine.compute(&tables, CostMode::Objective).unwrap();
        let values = float_values(&out, COST).unwrap();
        assert_eq!(values, vec![Some(0.5), Some(4.0), Some(1.0), None]);
        assert!(out.column(DISCOUNTED_COST).is_err());
    }

    #[test]
    fn test_objective_abatement_cost() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::default(), &reference);
        let mut tables = CostTables::new(two_year_costs(), 2, 2);
        tables.pvf_capital = BTreeMap::from([(2026, 0.5), (2027, 0.4)]);
        tables.pvf_onm = BTreeMap::from([(2026, 2.0), (2027, 1.5)]);
        let emissions = BTreeMap::from([(2026, 200.0)]);

        let out = engine
            .abatement_cost(&tables, &emissions, AbatementMode::Objective)
            .unwrap();
        assert_eq!(out.height(), 5);
        let at = |category: &str, year: &str| {
            value_at(&out, &[("cost_cat", category), ("year", year)], VALUE).unwrap()
        };
        assert_close(at("inv_capacity", "2026"), 50.0);
        assert_close(at("inv_capacity", "2027"), 40.0);
        assert_close(at("op_fuel", "2027"), 15.0);
        // 200 MMton is 0.2 billion tons, weighted by pvfonm
        assert_close(at(CO2_LABEL, "2026"), 0.4);
        let types = string_values(&out, VALUE_TYPE).unwrap();
        assert_eq!(types[4].as_deref(), Some(CO2_LABEL));
        assert!(out.column(CUMULATIVE_VALUE).is_err());
    }

    #[test]
    fn test_annualized_abatement_cost_accumulates() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::new(0.05, 2026, 2004), &reference);
        let costs = df!(
            "cost_cat" => ["op_fuel"],
            "year" => [2026i64],
            "Cost (Bil $)" => [10.0e9]
        )
        .unwrap();
        let tables = CostTables::new(costs, 2, 1);
        let emissions = BTreeMap::from([(2027, 100.0)]);

        let out = engine
            .abatement_cost(&tables, &emissions, AbatementMode::Annualized(CapitalTiming::NextYear))
            .unwrap();
        assert_eq!(out.height(), 6);
        let at = |category: &str, year: &str, column: &str| {
            value_at(&out, &[("cost_cat", category), ("year", year)], column)
        };
        assert_close(at("op_fuel", "2027", DISCOUNTED_VALUE).unwrap(), 10.0 / 1.05);
        assert_close(at("op_fuel", "2028", CUMULATIVE_VALUE).unwrap(), 20.0);
        assert_close(
            at("op_fuel", "2028", CUMULATIVE_DISCOUNTED_VALUE).unwrap(),
            10.0 + 10.0 / 1.05,
        );
        // emissions start in 2027 and carry forward
        assert!(at(CO2_LABEL, "2026", VALUE).is_none());
        assert!(at(CO2_LABEL, "2026", CUMULATIVE_VALUE).is_none());
        assert_close(at(CO2_LABEL, "2028", VALUE).unwrap(), 0.1);
        assert_close(at(CO2_LABEL, "2028", CUMULATIVE_VALUE).unwrap(), 0.2);
    }

    #[test]
    fn test_missing_emissions_table_is_error() {
        let err = load_emissions(&InMemoryLoader::new()).unwrap_err();
        assert!(format!("{:#}", err).contains("emissions"));
        let loader = InMemoryLoader::new().with_table(
            EMISSIONS_TABLE,
            df!("year" => [2030i64, 2030], "CO2 (MMton)" => [1.0, 2.0]).unwrap(),
        );
        assert_eq!(load_emissions(&loader).unwrap(), BTreeMap::from([(2030, 3.0)]));
    }

    #[test]
    fn test_national_average_cost() {
        let reference = reference();
        let engine = SystemCostEngine::new(RunConfig::default(), &reference);
        let mut tables = CostTables::new(two_year_costs(), 2, 2);
        tables.model_crf = vec![(2026, 0.6)];
        let quantities = df!(
            "type" => ["load", "load", "res_marg"],
            "subtype" => ["na", "na", "na"],
            "rb" => ["p1", "p2", "p1"],
            "timeslice" => ["h1", "h1", "h1"],
            "year" => [2026i64, 2026, 2026],
            "q" => [1.0e6, 1.0e6, 5.0e6]
        )
        .unwrap();

        let out = engine
            .national_average_cost(&tables, &quantities, &AnnualizeOptions::default())
            .unwrap();
        let row = [("cost_cat", "inv_capacity"), ("year", "2027")];
        assert_close(value_at(&out, &row, QUANTITY).unwrap(), 2.0e6);
        assert_close(value_at(&out, &row, AVERAGE_COST).unwrap(), 60.0e9 / 2.0e6);
    }

    #[test]
    fn test_load_tables_from_loader() {
        let loader = InMemoryLoader::new()
            .with_table(SYSTEM_COST_TABLE, two_year_costs())
            .with_table(
                SWITCHES_TABLE,
                df!("switch" => ["sys_eval_years", "other"], "value" => ["20", "x"]).unwrap(),
            )
            .with_table(SCALARS_TABLE, df!("scalar" => ["trans_crp"], "value" => [40.0]).unwrap())
            .with_table(CRF_TABLE, df!("t" => [2026i64, 2030], "crf" => [0.08, 0.07]).unwrap())
            .with_table(
                CAPEX_INIT_TABLE,
                df!("t" => [2020i64], "region" => ["s1"], "capex" => [5.0e9]).unwrap(),
            )
            .with_table(VALID_BA_TABLE, df!("r" => ["p1", "p2"]).unwrap())
            .with_table(PVF_ONM_TABLE, df!("t" => [2026i64], "pvfonm" => [3.5]).unwrap());

        let tables = CostTables::load(&loader).unwrap();
        assert_eq!(tables.sys_eval_years, 20);
        assert_eq!(tables.trans_crp, 40);
        assert_eq!(tables.model_crf, vec![(2026, 0.08), (2030, 0.07)]);
        assert_eq!(tables.historical_capex.len(), 1);
        assert_eq!(tables.valid_regions, vec!["p1", "p2"]);
        assert!(tables.pvf_capital.is_empty());
        assert_eq!(tables.pvf_onm.get(&2026), Some(&3.5));
    }
}
