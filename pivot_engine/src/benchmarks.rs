//! Benchmark prices built from requirement prices and quantities, and the
//! value-factor table that compares each technology's value streams against
//! them.

use crate::data_loader::{ensure_present, TableLoader};
use crate::models::RunConfig;
use crate::reference_data::ReferenceData;
use crate::table::{
    float_values, is_one_of, key_exprs, left_join, normalize, string_values, year_map,
    year_values, BA, CON_NAME, DOLLARS, MWH, PRICE, QUANTITY, REQ_SUBTYPE, REQ_TYPE, TECH,
    TIMESLICE, VAR_NAME, VINTAGE, YEAR,
};
use anyhow::{Context, Result};
use log::{info, warn};
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};

pub const VALUE_STREAMS_TABLE: &str = "valuestreams";
pub const GENERATION_TABLE: &str = "gen";
pub const PRICE_TABLE: &str = "p";
pub const QUANTITY_TABLE: &str = "q";
pub const COST_SCALE_TABLE: &str = "cost_scale";
pub const PVF_CAPITAL_TABLE: &str = "pvf_capital";
pub const PVF_ONM_TABLE: &str = "pvf_onm";

pub const ENERGY_CONSTRAINT: &str = "eq_supply_demand_balance";
pub const RESERVE_MARGIN_CONSTRAINT: &str = "eq_reserve_margin";

/// Constraints whose duals count as market value.
pub const VALUE_FACTOR_STREAMS: [&str; 8] = [
    ENERGY_CONSTRAINT,
    RESERVE_MARGIN_CONSTRAINT,
    "eq_opres_requirement",
    "eq_rec_requirement",
    "eq_curt_gen_balance",
    "eq_curtailment",
    "eq_storage_in_max",
    "eq_storage_in_min",
];

/// Constraints whose duals count as cost.
pub const COST_STREAMS: [&str; 6] = [
    "eq_gasaccounting_regional",
    "eq_gasaccounting_national",
    "eq_bioused",
    "eq_gasused",
    "eq_objfn_inv",
    "eq_objfn_op",
];

/// Requirement type to the constraint that prices it. The curtailment types
/// never appear in requirement tables.
pub const REQUIREMENT_CONSTRAINTS: [(&str, &str); 6] = [
    ("load", ENERGY_CONSTRAINT),
    ("res_marg", RESERVE_MARGIN_CONSTRAINT),
    ("oper_res", "eq_opres_requirement"),
    ("state_rps", "eq_rec_requirement"),
    ("curt_realize", "eq_curt_gen_balance"),
    ("curt_cause", "eq_curtailment"),
];

/// Requirement types summed into the `tot` price row.
pub const PRICE_TYPES: [&str; 5] = ["load", "res_marg", "oper_res", "state_rps", "nat_gen"];

pub const ALL_IN_LOCAL: &str = "$ all-in loc";
pub const ALL_IN_SYSTEM: &str = "$ all-in sys";
pub const FLAT_LOCAL: &str = "$ flat loc";
pub const FLAT_SYSTEM: &str = "$ flat sys";
pub const BENCHMARK_COLUMNS: [&str; 4] = [ALL_IN_LOCAL, ALL_IN_SYSTEM, FLAT_LOCAL, FLAT_SYSTEM];

const REQUIREMENT_KEYS: [&str; 5] = [REQ_TYPE, REQ_SUBTYPE, BA, TIMESLICE, YEAR];
const VALUE_FACTOR_COLUMNS: [&str; 9] = [
    TECH,
    BA,
    YEAR,
    CON_NAME,
    DOLLARS,
    ALL_IN_LOCAL,
    ALL_IN_SYSTEM,
    FLAT_LOCAL,
    FLAT_SYSTEM,
];

/// Annual energy of a 1 kW flat block, in MWh.
const FLAT_BLOCK_MWH_PER_KW: f64 = 8.76;

/// Value streams, generation and requirement tables of one run.
#[derive(Debug, Clone)]
pub struct ValueStreamInputs {
    pub value_streams: DataFrame,
    pub generation: DataFrame,
    pub prices: DataFrame,
    pub quantities: DataFrame,
    pub pvf_capital: BTreeMap<i32, f64>,
    pub pvf_onm: BTreeMap<i32, f64>,
    pub cost_scale: f64,
}

impl ValueStreamInputs {
    pub fn load(loader: &dyn TableLoader) -> Result<Self> {
        let value_streams = loader
            .load(VALUE_STREAMS_TABLE)
            .context("loading value streams")?;
        let generation = loader.load(GENERATION_TABLE).context("loading generation")?;
        let prices = loader.load(PRICE_TABLE).context("loading requirement prices")?;
        let quantities = loader
            .load(QUANTITY_TABLE)
            .context("loading requirement quantities")?;

        let pvf_capital = match loader.load_optional(PVF_CAPITAL_TABLE)? {
            Some(df) => year_map(&df, "pvfcap")?,
            None => BTreeMap::new(),
        };
        let pvf_onm = match loader.load_optional(PVF_ONM_TABLE)? {
            Some(df) => year_map(&df, "pvfonm")?,
            None => BTreeMap::new(),
        };
        let cost_scale = match loader.load_optional(COST_SCALE_TABLE)? {
            Some(df) => {
                let column = df
                    .get_column_names()
                    .first()
                    .map(|c| c.to_string())
                    .context("cost_scale table has no columns")?;
                float_values(&df, &column)?
                    .into_iter()
                    .flatten()
                    .next()
                    .context("cost_scale table is empty")?
            }
            None => {
                warn!("No cost_scale table; value streams are used unscaled");
                1.0
            }
        };

        Ok(Self {
            value_streams,
            generation,
            prices,
            quantities,
            pvf_capital,
            pvf_onm,
            cost_scale,
        })
    }
}

pub struct BenchmarkEngine<'a> {
    config: RunConfig,
    reference: &'a ReferenceData,
}

impl<'a> BenchmarkEngine<'a> {
    pub fn new(config: RunConfig, reference: &'a ReferenceData) -> Self {
        Self { config, reference }
    }

    fn inflation(&self) -> Result<f64> {
        Ok(self.reference.inflation_factor(self.config.dollar_year)?)
    }

    fn quantities(&self, inputs: &ValueStreamInputs) -> Result<DataFrame> {
        Ok(normalize(
            inputs.quantities.clone(),
            &[REQ_TYPE, REQ_SUBTYPE, BA, TIMESLICE],
            &[YEAR],
            &[QUANTITY],
        )?)
    }

    /// Requirement quantities with their inflated prices attached. Missing
    /// prices are zero.
    fn requirements(&self, inputs: &ValueStreamInputs) -> Result<LazyFrame> {
        let factor = self.inflation()?;
        let prices = normalize(
            inputs.prices.clone(),
            &[REQ_TYPE, REQ_SUBTYPE, BA, TIMESLICE],
            &[YEAR],
            &[PRICE],
        )?
        .lazy()
        .select(
            REQUIREMENT_KEYS
                .iter()
                .map(|c| col(*c))
                .chain([(col(PRICE) * lit(factor)).alias(PRICE)])
                .collect::<Vec<_>>(),
        );
        let quantities = self.quantities(inputs)?.lazy();
        Ok(left_join(quantities, prices, &REQUIREMENT_KEYS)
            .with_column(col(PRICE).fill_null(lit(0.0))))
    }

    /// `p × q` per requirement row, a `tot` row per (rb, timeslice, year)
    /// summing the benchmark price types, and the quantities themselves as
    /// `q_<type>` rows. Columns: type, subtype, rb, timeslice, year, $.
    pub fn requirement_prices(&self, inputs: &ValueStreamInputs) -> Result<DataFrame> {
        let joined = self.requirements(inputs)?.collect()?;
        let mut dollars = joined
            .clone()
            .lazy()
            .with_column((col(PRICE) * col(QUANTITY)).alias(DOLLARS))
            .select(key_exprs(&[REQ_TYPE, REQ_SUBTYPE, BA, TIMESLICE, YEAR, DOLLARS]))
            .collect()?;

        let total = dollars
            .clone()
            .lazy()
            .filter(is_one_of(REQ_TYPE, &PRICE_TYPES))
            .group_by_stable(key_exprs(&[BA, TIMESLICE, YEAR]))
            .agg([col(DOLLARS).sum()])
            .select([
                lit("tot").alias(REQ_TYPE),
                lit("na").alias(REQ_SUBTYPE),
                col(BA),
                col(TIMESLICE),
                col(YEAR),
                col(DOLLARS),
            ])
            .collect()?;

        let mut quantity_rows = self
            .quantities(inputs)?
            .select([REQ_TYPE, REQ_SUBTYPE, BA, TIMESLICE, YEAR, QUANTITY])?;
        let renamed: Vec<Option<String>> = string_values(&quantity_rows, REQ_TYPE)?
            .into_iter()
            .map(|t| t.map(|t| format!("q_{}", t)))
            .collect();
        quantity_rows.with_column(Series::new(REQ_TYPE.into(), renamed))?;
        quantity_rows.rename(QUANTITY, DOLLARS.into())?;

        dollars.vstack_mut(&total)?;
        dollars.vstack_mut(&quantity_rows)?;
        Ok(dollars)
    }

    /// Annual load per (rb, year).
    fn annual_load(&self, inputs: &ValueStreamInputs) -> Result<DataFrame> {
        Ok(self
            .quantities(inputs)?
            .lazy()
            .filter(col(REQ_TYPE).eq(lit("load")))
            .group_by_stable(key_exprs(&[BA, YEAR]))
            .agg([col(QUANTITY).sum()])
            .collect()?)
    }

    /// Value streams per (tech, rb, year, con_name) in annual model-year
    /// dollars, with every value-factor constraint present for every
    /// (tech, rb, year).
    fn annual_value_streams(&self, inputs: &ValueStreamInputs) -> Result<DataFrame> {
        ensure_present(!inputs.pvf_onm.is_empty(), PVF_ONM_TABLE)?;
        let factor = self.inflation()?;
        let streams = normalize(
            inputs.value_streams.clone(),
            &[TECH, VINTAGE, BA, VAR_NAME, CON_NAME],
            &[YEAR],
            &[DOLLARS],
        )?
        .lazy()
        .with_column((col(DOLLARS) * lit(factor)).alias(DOLLARS))
        .group_by_stable(key_exprs(&[TECH, BA, YEAR, CON_NAME]))
        .agg([col(DOLLARS).sum()])
        .filter(is_one_of(CON_NAME, &VALUE_FACTOR_STREAMS))
        .collect()?;

        let techs = string_values(&streams, TECH)?;
        let regions = string_values(&streams, BA)?;
        let years = year_values(&streams, YEAR)?;
        let constraints = string_values(&streams, CON_NAME)?;
        let amounts = float_values(&streams, DOLLARS)?;

        let mut combos: Vec<(String, String, i32)> = Vec::new();
        let mut seen_combos = HashSet::new();
        let mut present: Vec<String> = Vec::new();
        let mut amount_of: HashMap<(String, String, i32, String), f64> = HashMap::new();
        for i in 0..streams.height() {
            let (Some(tech), Some(rb), Some(year), Some(con)) = (
                techs[i].clone(),
                regions[i].clone(),
                years[i],
                constraints[i].clone(),
            ) else {
                continue;
            };
            if seen_combos.insert((tech.clone(), rb.clone(), year)) {
                combos.push((tech.clone(), rb.clone(), year));
            }
            if !present.contains(&con) {
                present.push(con.clone());
            }
            amount_of.insert((tech, rb, year, con), amounts[i].unwrap_or(0.0));
        }

        let mut out_tech = Vec::new();
        let mut out_rb = Vec::new();
        let mut out_year = Vec::new();
        let mut out_con = Vec::new();
        let mut out_dollars = Vec::new();
        for con in &present {
            for (tech, rb, year) in &combos {
                let amount = amount_of
                    .get(&(tech.clone(), rb.clone(), *year, con.clone()))
                    .copied()
                    .unwrap_or(0.0);
                let annual = inputs
                    .pvf_onm
                    .get(year)
                    .map(|pvf| amount / inputs.cost_scale / pvf);
                out_tech.push(tech.clone());
                out_rb.push(rb.clone());
                out_year.push(*year as i64);
                out_con.push(con.clone());
                out_dollars.push(annual);
            }
        }

        Ok(DataFrame::new(vec![
            Series::new(TECH.into(), out_tech),
            Series::new(BA.into(), out_rb),
            Series::new(YEAR.into(), out_year),
            Series::new(CON_NAME.into(), out_con),
            Series::new(DOLLARS.into(), out_dollars),
        ])?)
    }

    /// Value streams next to the four benchmark values for the same energy,
    /// plus one `MWh` row per (tech, rb, year) carrying the generation in
    /// every value column.
    pub fn value_factors(&self, inputs: &ValueStreamInputs) -> Result<DataFrame> {
        let streams = self.annual_value_streams(inputs)?;
        let generation = normalize(inputs.generation.clone(), &[TECH, VINTAGE, BA], &[YEAR], &[MWH])?
            .lazy()
            .group_by_stable(key_exprs(&[TECH, BA, YEAR]))
            .agg([col(MWH).sum()])
            .collect()?;
        let load = self.annual_load(inputs)?;

        let constraint_map = df!(
            REQ_TYPE => REQUIREMENT_CONSTRAINTS.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            CON_NAME => REQUIREMENT_CONSTRAINTS.iter().map(|(_, c)| *c).collect::<Vec<_>>()
        )?;
        let requirement_types: Vec<&str> = REQUIREMENT_CONSTRAINTS.iter().map(|(t, _)| *t).collect();
        let priced = left_join(
            self.requirements(inputs)?
                .filter(is_one_of(REQ_TYPE, &requirement_types)),
            constraint_map.lazy(),
            &[REQ_TYPE],
        )
        .select(key_exprs(&[BA, TIMESLICE, YEAR, CON_NAME, PRICE, QUANTITY]))
        .collect()?;

        // all-in: requirement value over energy served
        let all_in = left_join(
            priced
                .clone()
                .lazy()
                .with_column((col(PRICE) * col(QUANTITY)).alias(DOLLARS))
                .group_by_stable(key_exprs(&[CON_NAME, BA, YEAR]))
                .agg([col(DOLLARS).sum()]),
            load.clone().lazy(),
            &[BA, YEAR],
        )
        .collect()?;
        let all_in_local = all_in.clone().lazy().select([
            col(CON_NAME),
            col(BA),
            col(YEAR),
            (col(DOLLARS) / col(QUANTITY)).alias(ALL_IN_LOCAL),
        ]);
        let all_in_system = all_in
            .lazy()
            .group_by_stable(key_exprs(&[YEAR, CON_NAME]))
            .agg([col(DOLLARS).sum(), col(QUANTITY).sum()])
            .select([
                col(YEAR),
                col(CON_NAME),
                (col(DOLLARS) / col(QUANTITY)).alias(ALL_IN_SYSTEM),
            ]);

        // flat block: annual $/kW of an always-on kilowatt, energy and capacity only
        let flat_local = left_join(
            priced
                .lazy()
                .filter(is_one_of(CON_NAME, &[ENERGY_CONSTRAINT, RESERVE_MARGIN_CONSTRAINT])),
            self.reference.hours_frame()?.lazy(),
            &[TIMESLICE],
        )
        .with_column(
            when(col(CON_NAME).eq(lit(ENERGY_CONSTRAINT)))
                .then(col(PRICE) * col("hours") / lit(1000.0))
                .otherwise(col(PRICE))
                .alias(PRICE),
        )
        .group_by_stable(key_exprs(&[YEAR, BA, CON_NAME]))
        .agg([col(PRICE).sum()])
        .select([
            col(YEAR),
            col(BA),
            col(CON_NAME),
            (col(PRICE) / lit(FLAT_BLOCK_MWH_PER_KW)).alias(FLAT_LOCAL),
        ])
        .collect()?;
        let flat_system = left_join(flat_local.clone().lazy(), load.lazy(), &[BA, YEAR])
            .with_column((col(FLAT_LOCAL) * col(QUANTITY)).alias(DOLLARS))
            .group_by_stable(key_exprs(&[CON_NAME, YEAR]))
            .agg([col(DOLLARS).sum(), col(QUANTITY).sum()])
            .select([
                col(CON_NAME),
                col(YEAR),
                (col(DOLLARS) / col(QUANTITY)).alias(FLAT_SYSTEM),
            ]);

        let mut joined = left_join(streams.lazy(), all_in_local, &[YEAR, BA, CON_NAME]);
        joined = left_join(joined, all_in_system, &[YEAR, CON_NAME]);
        joined = left_join(joined, flat_local.lazy(), &[YEAR, BA, CON_NAME]);
        joined = left_join(joined, flat_system, &[YEAR, CON_NAME]);
        joined = left_join(joined, generation.clone().lazy(), &[TECH, BA, YEAR]);
        let mut out = joined
            .with_columns(
                BENCHMARK_COLUMNS
                    .iter()
                    .map(|c| (col(*c) * col(MWH)).alias(*c))
                    .collect::<Vec<_>>(),
            )
            .select(key_exprs(&VALUE_FACTOR_COLUMNS))
            .collect()?;

        let generation_rows = generation
            .lazy()
            .select([
                col(TECH),
                col(BA),
                col(YEAR),
                lit(MWH).alias(CON_NAME),
                col(MWH).alias(DOLLARS),
                col(MWH).alias(ALL_IN_LOCAL),
                col(MWH).alias(ALL_IN_SYSTEM),
                col(MWH).alias(FLAT_LOCAL),
                col(MWH).alias(FLAT_SYSTEM),
            ])
            .collect()?;
        out.vstack_mut(&generation_rows)?;

        let value_columns: Vec<Expr> = [DOLLARS]
            .iter()
            .chain(BENCHMARK_COLUMNS.iter())
            .map(|c| col(*c).fill_nan(lit(0.0)).fill_null(lit(0.0)).alias(*c))
            .collect();
        let out = out.lazy().with_columns(value_columns).collect()?;
        info!("Built value-factor table with {} rows", out.height());
        Ok(out)
    }

    /// National benchmark price per year:
    /// `(load + res_marg + oper_res + state_rps) / q_load`. The national
    /// generation constraint is left out. A year missing any of the four
    /// price types, or without load quantities, has no price.
    pub fn national_benchmark_price(
        &self,
        inputs: &ValueStreamInputs,
    ) -> Result<BTreeMap<i32, Option<f64>>> {
        const NUMERATOR: [&str; 4] = ["load", "res_marg", "oper_res", "state_rps"];
        let prices = self.requirement_prices(inputs)?;
        let types = string_values(&prices, REQ_TYPE)?;
        let years = year_values(&prices, YEAR)?;
        let dollars = float_values(&prices, DOLLARS)?;

        let mut numerator: BTreeMap<i32, f64> = BTreeMap::new();
        let mut present: HashSet<(i32, &str)> = HashSet::new();
        let mut load: BTreeMap<i32, f64> = BTreeMap::new();
        for ((kind, year), amount) in types.iter().zip(years).zip(dollars) {
            let (Some(kind), Some(year)) = (kind.as_deref(), year) else {
                continue;
            };
            let amount = amount.unwrap_or(0.0);
            if kind == "q_load" {
                *load.entry(year).or_insert(0.0) += amount;
                numerator.entry(year).or_insert(0.0);
            } else if let Some(kind) = NUMERATOR.iter().find(|t| **t == kind) {
                *numerator.entry(year).or_insert(0.0) += amount;
                present.insert((year, *kind));
            }
        }

        Ok(numerator
            .into_iter()
            .map(|(year, value)| {
                let complete = NUMERATOR.iter().all(|kind| present.contains(&(year, *kind)));
                let price = if complete {
                    load.get(&year).map(|q| value / q)
                } else {
                    None
                };
                (year, price)
            })
            .collect())
    }
}
