//! Average cost of serving load in each balancing region.
//!
//! Annualized system costs are kept per balancing region, existing-capacity
//! payments are added to capital, and each region is charged for the
//! capacity and energy it imports and credited for what it exports. The
//! total is divided by the region's load.

use crate::benchmarks::{PRICE_TABLE, QUANTITY_TABLE};
use crate::data_loader::TableLoader;
use crate::models::RunConfig;
use crate::reference_data::{ReferenceData, HISTORICAL_CAPEX_CATEGORY};
use crate::system_cost::{AnnualizeOptions, CostTables, SystemCostEngine, AVERAGE_COST};
use crate::table::{
    float_values, has_column, normalize, string_values, year_values, BA, COST, COST_CAT, PRICE,
    QUANTITY, REGION, REQ_TYPE, TIMESLICE, YEAR,
};
use anyhow::{bail, Context, Result};
use log::info;
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};

pub const EXISTING_CAPACITY_TABLE: &str = "existcap";
pub const CAPACITY_TRADE_TABLE: &str = "captrade";
pub const UPSTREAM_FRACTION_TABLE: &str = "powerfrac_upstream";
pub const DOWNSTREAM_FRACTION_TABLE: &str = "powerfrac_downstream";
pub const TIMESLICE_GENERATION_TABLE: &str = "gen_h";

pub const CAPACITY_IMPORT: &str = "cap_trade_import_cost";
pub const CAPACITY_EXPORT: &str = "cap_trade_export_cost";
pub const ENERGY_IMPORT: &str = "energy_trade_import_cost";
pub const ENERGY_EXPORT: &str = "energy_trade_export_cost";
pub const LOAD_MWH: &str = "load (MWh)";

const EXPORTING_REGION: &str = "rb_out";
const IMPORTING_REGION: &str = "rb_in";
const SEASON: &str = "season";
const TRADED_MW: &str = "Amount (MW)";
const PARTNER_REGION: &str = "rr";
const FRACTION: &str = "frac";
const GENERATION_GW: &str = "Generation (GW)";
const EXISTING_REGION: &str = "region";
const EXISTING_CAPITAL: &str = "existingcap";

type SliceKey = (String, String, i32);

/// Trade, generation and requirement tables a regional average cost needs
/// on top of the system cost tables.
#[derive(Debug, Clone)]
pub struct RegionalCostInputs {
    /// (year, region, existingcap) in billions of model-year dollars.
    pub existing_capacity: DataFrame,
    /// (rb_out, rb_in, season, year, Amount (MW)).
    pub capacity_trade: DataFrame,
    /// (r, rr, timeslice, year, frac): share of r's load served from rr.
    pub upstream: DataFrame,
    /// (r, rr, timeslice, year, frac): share of rr's generation sent to r.
    pub downstream: DataFrame,
    /// (r, timeslice, year, Generation (GW)).
    pub generation: DataFrame,
    pub prices: DataFrame,
    pub quantities: DataFrame,
}

impl RegionalCostInputs {
    pub fn load(loader: &dyn TableLoader) -> Result<Self> {
        let load = |table: &str| {
            loader
                .load(table)
                .with_context(|| format!("loading {} for regional average cost", table))
        };
        Ok(Self {
            existing_capacity: load(EXISTING_CAPACITY_TABLE)?,
            capacity_trade: load(CAPACITY_TRADE_TABLE)?,
            upstream: load(UPSTREAM_FRACTION_TABLE)?,
            downstream: load(DOWNSTREAM_FRACTION_TABLE)?,
            generation: load(TIMESLICE_GENERATION_TABLE)?,
            prices: load(PRICE_TABLE)?,
            quantities: load(QUANTITY_TABLE)?,
        })
    }
}

#[derive(Debug, Clone)]
struct RegionCost {
    region: String,
    year: i32,
    category: String,
    cost: f64,
}

fn add_to(totals: &mut BTreeMap<(String, i32), f64>, region: &str, year: i32, amount: f64) {
    *totals.entry((region.to_string(), year)).or_insert(0.0) += amount;
}

pub struct RegionalCostEngine<'a> {
    config: RunConfig,
    reference: &'a ReferenceData,
}

impl<'a> RegionalCostEngine<'a> {
    pub fn new(config: RunConfig, reference: &'a ReferenceData) -> Self {
        Self { config, reference }
    }

    /// Annualized costs by balancing region, trade costs included, divided by
    /// regional load. Region-years without load are dropped. Columns: rb,
    /// year, cost_cat, Cost (Bil $), load (MWh), Average cost ($/MWh).
    pub fn average_cost(
        &self,
        tables: &CostTables,
        inputs: &RegionalCostInputs,
        options: &AnnualizeOptions,
    ) -> Result<DataFrame> {
        let factor = self.reference.inflation_factor(self.config.dollar_year)?;
        let mut rows = self.annualized(tables, options)?;
        self.add_existing_capacity(&mut rows, inputs, factor)?;

        let rows_before_trade = rows.len();
        self.add_capacity_trade(&mut rows, inputs, factor)?;
        self.add_energy_trade(&mut rows, inputs, factor)?;
        info!(
            "Regional average cost: {} cost rows, {} trade rows",
            rows_before_trade,
            rows.len() - rows_before_trade
        );

        let load = self.regional_load(inputs)?;
        let mut regions = Vec::new();
        let mut years = Vec::new();
        let mut categories = Vec::new();
        let mut costs = Vec::new();
        let mut loads = Vec::new();
        let mut averages = Vec::new();
        for row in rows {
            let Some(q) = load.get(&(row.region.clone(), row.year)).copied() else {
                continue;
            };
            averages.push(row.cost * 1e9 / q);
            regions.push(row.region);
            years.push(row.year as i64);
            categories.push(row.category);
            costs.push(row.cost);
            loads.push(q);
        }

        Ok(DataFrame::new(vec![
            Series::new(BA.into(), regions),
            Series::new(YEAR.into(), years),
            Series::new(COST_CAT.into(), categories),
            Series::new(COST.into(), costs),
            Series::new(LOAD_MWH.into(), loads),
            Series::new(AVERAGE_COST.into(), averages),
        ])?)
    }

    /// Costs mapped onto balancing regions and annualized per region. The
    /// historical capital backfill is replaced by the existing-capacity table.
    fn annualized(&self, tables: &CostTables, options: &AnnualizeOptions) -> Result<Vec<RegionCost>> {
        let mut costs = normalize(tables.costs.clone(), &[COST_CAT, REGION], &[YEAR], &[COST])?;
        if !has_column(&costs, REGION) {
            bail!("regional average cost needs a '{}' column in the cost table", REGION);
        }
        let mapped: Vec<Option<String>> = string_values(&costs, REGION)?
            .into_iter()
            .map(|r| r.map(|r| self.reference.balancing_region(&r).to_string()))
            .collect();
        costs.with_column(Series::new(REGION.into(), mapped))?;

        let regional = CostTables {
            costs,
            historical_capex: Vec::new(),
            ..tables.clone()
        };
        let options = AnnualizeOptions {
            by_region: true,
            ..*options
        };
        let df = SystemCostEngine::new(self.config, self.reference).annualize(&regional, &options)?;

        let regions = string_values(&df, REGION)?;
        let years = year_values(&df, YEAR)?;
        let categories = string_values(&df, COST_CAT)?;
        let amounts = float_values(&df, COST)?;
        let mut rows = Vec::with_capacity(df.height());
        for (((region, year), category), cost) in regions.into_iter().zip(years).zip(categories).zip(amounts) {
            if let (Some(region), Some(year), Some(category), Some(cost)) = (region, year, category, cost) {
                rows.push(RegionCost { region, year, category, cost });
            }
        }
        Ok(rows)
    }

    /// Inflated existing-capacity payments added to capacity capital for
    /// region-years already in the cost rows.
    fn add_existing_capacity(
        &self,
        rows: &mut Vec<RegionCost>,
        inputs: &RegionalCostInputs,
        factor: f64,
    ) -> Result<()> {
        let df = &inputs.existing_capacity;
        let years = year_values(df, YEAR)?;
        let regions = string_values(df, EXISTING_REGION)?;
        let amounts = float_values(df, EXISTING_CAPITAL)?;
        let mut existing: BTreeMap<(String, i32), f64> = BTreeMap::new();
        for ((year, region), amount) in years.into_iter().zip(regions).zip(amounts) {
            if let (Some(year), Some(region), Some(amount)) = (year, region, amount) {
                add_to(&mut existing, self.reference.balancing_region(&region), year, amount * factor);
            }
        }

        let covered: HashSet<(String, i32)> = rows.iter().map(|r| (r.region.clone(), r.year)).collect();
        for ((region, year), amount) in existing {
            if !covered.contains(&(region.clone(), year)) {
                continue;
            }
            let existing_row = rows
                .iter_mut()
                .find(|r| r.region == region && r.year == year && r.category == HISTORICAL_CAPEX_CATEGORY);
            match existing_row {
                Some(row) => row.cost += amount,
                None => rows.push(RegionCost {
                    region,
                    year,
                    category: HISTORICAL_CAPEX_CATEGORY.to_string(),
                    cost: amount,
                }),
            }
        }
        Ok(())
    }

    /// Inflated prices of one requirement type keyed by (rb, timeslice, year).
    fn prices_of(&self, inputs: &RegionalCostInputs, kind: &str, factor: f64) -> Result<HashMap<SliceKey, f64>> {
        let df = normalize(inputs.prices.clone(), &[REQ_TYPE, BA, TIMESLICE], &[YEAR], &[PRICE])?;
        let types = string_values(&df, REQ_TYPE)?;
        let regions = string_values(&df, BA)?;
        let slices = string_values(&df, TIMESLICE)?;
        let years = year_values(&df, YEAR)?;
        let prices = float_values(&df, PRICE)?;
        let mut out = HashMap::new();
        for i in 0..df.height() {
            if types[i].as_deref() != Some(kind) {
                continue;
            }
            if let (Some(rb), Some(ts), Some(year), Some(p)) =
                (regions[i].clone(), slices[i].clone(), years[i], prices[i])
            {
                out.entry((rb, ts, year)).or_insert(p * factor);
            }
        }
        Ok(out)
    }

    /// Reserve-margin price times traded capacity. The importer pays, the
    /// exporter is credited. Trades without a price are skipped.
    fn add_capacity_trade(
        &self,
        rows: &mut Vec<RegionCost>,
        inputs: &RegionalCostInputs,
        factor: f64,
    ) -> Result<()> {
        let prices = self.prices_of(inputs, "res_marg", factor)?;
        let df = &inputs.capacity_trade;
        let exporters = string_values(df, EXPORTING_REGION)?;
        let importers = string_values(df, IMPORTING_REGION)?;
        let seasons = string_values(df, SEASON)?;
        let years = year_values(df, YEAR)?;
        let amounts = float_values(df, TRADED_MW)?;

        let mut imports = BTreeMap::new();
        let mut exports = BTreeMap::new();
        for i in 0..df.height() {
            let (Some(from), Some(to), Some(season), Some(year), Some(mw)) = (
                exporters[i].clone(),
                importers[i].clone(),
                seasons[i].clone(),
                years[i],
                amounts[i],
            ) else {
                continue;
            };
            let Some(price) = prices.get(&(from.clone(), season, year)) else {
                continue;
            };
            let cost = price * mw * 1e3 / 1e9;
            add_to(&mut imports, &to, year, cost);
            add_to(&mut exports, &from, year, -cost);
        }
        push_totals(rows, imports, CAPACITY_IMPORT);
        push_totals(rows, exports, CAPACITY_EXPORT);
        Ok(())
    }

    /// Energy bought from upstream regions at their load price, and energy
    /// sent downstream credited at the exporter's own load price. Flows within
    /// a region are ignored.
    fn add_energy_trade(
        &self,
        rows: &mut Vec<RegionCost>,
        inputs: &RegionalCostInputs,
        factor: f64,
    ) -> Result<()> {
        let prices = self.prices_of(inputs, "load", factor)?;
        let generation = self.timeslice_generation(inputs)?;
        let energy_cost = |fraction: f64, generator: &SliceKey, priced: &SliceKey| -> Option<f64> {
            let gen = generation.get(generator)?;
            let price = prices.get(priced)?;
            let hours = self.reference.timeslice_hours(&generator.1)?;
            Some(fraction * gen * price * hours / 1e9)
        };

        let mut imports = BTreeMap::new();
        for (r, rr, ts, year, fraction) in fractions(&inputs.upstream)? {
            let amount = energy_cost(fraction, &(r.clone(), ts.clone(), year), &(rr, ts, year));
            add_to(&mut imports, &r, year, amount.unwrap_or(0.0));
        }

        let mut sent: BTreeMap<SliceKey, f64> = BTreeMap::new();
        for (_, rr, ts, year, fraction) in fractions(&inputs.downstream)? {
            *sent.entry((rr, ts, year)).or_insert(0.0) += fraction;
        }
        let mut exports = BTreeMap::new();
        for (key, fraction) in sent {
            let amount = energy_cost(fraction, &key, &key);
            add_to(&mut exports, &key.0, key.2, -amount.unwrap_or(0.0));
        }

        push_totals(rows, imports, ENERGY_IMPORT);
        push_totals(rows, exports, ENERGY_EXPORT);
        Ok(())
    }

    fn timeslice_generation(&self, inputs: &RegionalCostInputs) -> Result<HashMap<SliceKey, f64>> {
        let df = &inputs.generation;
        let regions = string_values(df, REGION)?;
        let slices = string_values(df, TIMESLICE)?;
        let years = year_values(df, YEAR)?;
        let amounts = float_values(df, GENERATION_GW)?;
        let mut out = HashMap::new();
        for i in 0..df.height() {
            if let (Some(r), Some(ts), Some(year), Some(gen)) =
                (regions[i].clone(), slices[i].clone(), years[i], amounts[i])
            {
                *out.entry((r, ts, year)).or_insert(0.0) += gen;
            }
        }
        Ok(out)
    }

    fn regional_load(&self, inputs: &RegionalCostInputs) -> Result<HashMap<(String, i32), f64>> {
        let df = &inputs.quantities;
        let types = string_values(df, REQ_TYPE)?;
        let regions = string_values(df, BA)?;
        let years = year_values(df, YEAR)?;
        let amounts = float_values(df, QUANTITY)?;
        let mut load = HashMap::new();
        for i in 0..df.height() {
            if types[i].as_deref() != Some("load") {
                continue;
            }
            if let (Some(rb), Some(year), Some(q)) = (regions[i].clone(), years[i], amounts[i]) {
                *load.entry((rb, year)).or_insert(0.0) += q;
            }
        }
        Ok(load)
    }
}

/// Cross-region rows of a power-fraction table.
fn fractions(df: &DataFrame) -> Result<Vec<(String, String, String, i32, f64)>> {
    let regions = string_values(df, REGION)?;
    let partners = string_values(df, PARTNER_REGION)?;
    let slices = string_values(df, TIMESLICE)?;
    let years = year_values(df, YEAR)?;
    let values = float_values(df, FRACTION)?;
    let mut out = Vec::new();
    for i in 0..df.height() {
        if let (Some(r), Some(rr), Some(ts), Some(year), Some(frac)) =
            (regions[i].clone(), partners[i].clone(), slices[i].clone(), years[i], values[i])
        {
            if r != rr {
                out.push((r, rr, ts, year, frac));
            }
        }
    }
    Ok(out)
}

fn push_totals(rows: &mut Vec<RegionCost>, totals: BTreeMap<(String, i32), f64>, category: &str) {
    rows.extend(totals.into_iter().map(|((region, year), cost)| RegionCost {
        region,
        year,
        category: category.to_string(),
        cost,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loader::InMemoryLoader;
    use crate::models::CostKind;
    use crate::table::value_at;

    fn reference() -> ReferenceData {
        let mut reference = ReferenceData::new();
        reference.add_deflator(2004, 1.0);
        reference.add_cost_kind("op_fom", CostKind::Operation);
        reference.add_cost_kind(HISTORICAL_CAPEX_CATEGORY, CostKind::Capital);
        reference.add_region_mapping("s1", "p1");
        reference.add_timeslice_hours("h1", 10.0);
        reference
    }

    fn tables() -> CostTables {
        let costs = df!(
            "cost_cat" => ["op_fom"],
            "r" => ["s1"],
            "year" => [2026i64],
            "Cost (Bil $)" => [10.0e9]
        )
        .unwrap();
        let mut tables = CostTables::new(costs, 2, 2);
        tables.model_crf = vec![(2026, 0.6)];
        tables
    }

    fn inputs() -> RegionalCostInputs {
        RegionalCostInputs {
            existing_capacity: df!(
                "year" => [2026i64, 2040],
                "region" => ["p1", "p1"],
                "existingcap" => [1.0, 9.0]
            )
            .unwrap(),
            capacity_trade: df!(
                "rb_out" => ["p2", "p2"],
                "rb_in" => ["p1", "p1"],
                "season" => ["h1", "h2"],
                "year" => [2026i64, 2026],
                "Amount (MW)" => [100.0, 999.0]
            )
            .unwrap(),
            upstream: df!(
                "r" => ["p1", "p1"],
                "rr" => ["p2", "p1"],
                "timeslice" => ["h1", "h1"],
                "year" => [2026i64, 2026],
                "frac" => [0.5, 0.5]
            )
            .unwrap(),
            downstream: df!(
                "r" => ["p1", "p2"],
                "rr" => ["p2", "p2"],
                "timeslice" => ["h1", "h1"],
                "year" => [2026i64, 2026],
                "frac" => [0.25, 0.75]
            )
            .unwrap(),
            generation: df!(
                "r" => ["p1", "p2"],
                "timeslice" => ["h1", "h1"],
                "year" => [2026i64, 2026],
                "Generation (GW)" => [4.0, 2.0]
            )
            .unwrap(),
            prices: df!(
                "type" => ["res_marg", "load"],
                "subtype" => ["na", "na"],
                "rb" => ["p2", "p2"],
                "timeslice" => ["h1", "h1"],
                "year" => [2026i64, 2026],
                "p" => [50.0, 30.0]
            )
            .unwrap(),
            quantities: df!(
                "type" => ["load", "load", "load", "res_marg"],
                "subtype" => ["na", "na", "na", "na"],
                "rb" => ["p1", "p1", "p2", "p1"],
                "timeslice" => ["h1", "h1", "h1", "h1"],
                "year" => [2026i64, 2027, 2026, 2026],
                "q" => [1000.0, 1000.0, 500.0, 7.0]
            )
            .unwrap(),
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {}, got {}", expected, actual);
    }

    fn average(df: &DataFrame, rb: &str, category: &str, year: &str) -> f64 {
        value_at(df, &[("rb", rb), ("cost_cat", category), ("year", year)], AVERAGE_COST).unwrap()
    }

    #[test]
    fn test_regional_average_cost_with_trade() {
        let reference = reference();
        let engine = RegionalCostEngine::new(RunConfig::default(), &reference);
        let out = engine
            .average_cost(&tables(), &inputs(), &AnnualizeOptions::default())
            .unwrap();

        // supply region s1 is reported under p1; 2028 has no load
        assert_close(average(&out, "p1", "op_fom", "2026"), 10.0e9 / 1000.0);
        assert_close(average(&out, "p1", "op_fom", "2027"), 10.0e9 / 1000.0);
        assert!(value_at(&out, &[("year", "2028")], AVERAGE_COST).is_none());
        // existing capacity outside the cost years is ignored
        assert_close(average(&out, "p1", HISTORICAL_CAPEX_CATEGORY, "2026"), 1.0e9 / 1000.0);

        // 50 $/MW × 100 MW × 1e3, only the priced season counts
        assert_close(average(&out, "p1", CAPACITY_IMPORT, "2026"), 5.0e6 / 1000.0);
        assert_close(average(&out, "p2", CAPACITY_EXPORT, "2026"), -5.0e6 / 500.0);
        // 0.5 × 4 GW × 30 $/MWh × 10 h from p2
        assert_close(average(&out, "p1", ENERGY_IMPORT, "2026"), 600.0 / 1000.0);
        // 0.25 of p2's 2 GW sent to p1 at p2's own price
        assert_close(average(&out, "p2", ENERGY_EXPORT, "2026"), -150.0 / 500.0);

        assert_eq!(out.height(), 7);
        let loads = float_values(&out, LOAD_MWH).unwrap();
        assert!(loads.iter().all(|q| q.is_some()));
    }

    #[test]
    fn test_regional_average_cost_needs_regions() {
        let reference = reference();
        let engine = RegionalCostEngine::new(RunConfig::default(), &reference);
        let mut tables = tables();
        tables.costs = tables.costs.drop("r").unwrap();
        let err = engine
            .average_cost(&tables, &inputs(), &AnnualizeOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("'r'"));
    }

    #[test]
    fn test_missing_trade_table_is_error() {
        let inputs = inputs();
        let loader = InMemoryLoader::new()
            .with_table(EXISTING_CAPACITY_TABLE, inputs.existing_capacity.clone())
            .with_table(UPSTREAM_FRACTION_TABLE, inputs.upstream.clone())
            .with_table(DOWNSTREAM_FRACTION_TABLE, inputs.downstream.clone())
            .with_table(TIMESLICE_GENERATION_TABLE, inputs.generation.clone())
            .with_table(PRICE_TABLE, inputs.prices.clone())
            .with_table(QUANTITY_TABLE, inputs.quantities.clone());
        let err = RegionalCostInputs::load(&loader).unwrap_err();
        assert!(format!("{:#}", err).contains(CAPACITY_TRADE_TABLE));

        let loader = loader.with_table(CAPACITY_TRADE_TABLE, inputs.capacity_trade.clone());
        assert!(RegionalCostInputs::load(&loader).is_ok());
    }
}
