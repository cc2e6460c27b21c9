//! Per-technology competitiveness metrics from discounted value streams.

use crate::benchmarks::{
    BenchmarkEngine, ValueStreamInputs, COST_STREAMS, PVF_CAPITAL_TABLE, PVF_ONM_TABLE,
    VALUE_FACTOR_STREAMS,
};
use crate::data_loader::ensure_present;
use crate::models::RunConfig;
use crate::reference_data::ReferenceData;
use crate::table::{
    float_values, normalize, replace_non_finite, string_values, year_values, BA, CON_NAME,
    DOLLARS, MWH, TECH, VAR_NAME, VINTAGE, YEAR,
};
use anyhow::Result;
use log::info;
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};

pub const COST_DOLLARS: &str = "Cost $";
pub const VALUE_DOLLARS: &str = "Value $";
pub const BENCHMARK_PRICE: &str = "P_b";

pub const METRIC_COLUMNS: [&str; 8] = [
    "LCOE",
    "LVOE",
    "NVOE",
    "BCR",
    "PLCOE",
    "value factor",
    "integration cost",
    "SLCOE",
];

type TechKey = (String, String, String, i32);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Totals {
    cost: Option<f64>,
    value: Option<f64>,
    energy: Option<f64>,
}

fn accumulate(slot: &mut Option<f64>, amount: f64) {
    *slot = Some(slot.unwrap_or(0.0) + amount);
}

pub struct CompetitivenessEngine<'a> {
    config: RunConfig,
    reference: &'a ReferenceData,
}

impl<'a> CompetitivenessEngine<'a> {
    pub fn new(config: RunConfig, reference: &'a ReferenceData) -> Self {
        Self { config, reference }
    }

    /// Cost, value and energy per (tech, vintage, rb, year), all as bulk
    /// present values discounted to the present-value year. Only keys with
    /// cost streams are kept.
    fn totals(&self, inputs: &ValueStreamInputs) -> Result<(Vec<TechKey>, HashMap<TechKey, Totals>)> {
        ensure_present(!inputs.pvf_capital.is_empty(), PVF_CAPITAL_TABLE)?;
        ensure_present(!inputs.pvf_onm.is_empty(), PVF_ONM_TABLE)?;
        let factor = self.reference.inflation_factor(self.config.dollar_year)?;
        let streams = normalize(
            inputs.value_streams.clone(),
            &[TECH, VINTAGE, BA, VAR_NAME, CON_NAME],
            &[YEAR],
            &[DOLLARS],
        )?;

        let mut order: Vec<TechKey> = Vec::new();
        let mut ordered: HashSet<TechKey> = HashSet::new();
        let mut totals: HashMap<TechKey, Totals> = HashMap::new();

        let techs = string_values(&streams, TECH)?;
        let vintages = string_values(&streams, VINTAGE)?;
        let regions = string_values(&streams, BA)?;
        let years = year_values(&streams, YEAR)?;
        let constraints = string_values(&streams, CON_NAME)?;
        let dollars = float_values(&streams, DOLLARS)?;
        for i in 0..streams.height() {
            let (Some(tech), Some(vintage), Some(rb), Some(year), Some(con)) = (
                techs[i].clone(),
                vintages[i].clone(),
                regions[i].clone(),
                years[i],
                constraints[i].as_deref(),
            ) else {
                continue;
            };
            let is_cost = COST_STREAMS.contains(&con);
            let is_value = VALUE_FACTOR_STREAMS.contains(&con);
            if !is_cost && !is_value {
                continue;
            }
            let key = (tech, vintage, rb, year);
            let bulk = match (dollars[i], inputs.pvf_capital.get(&year)) {
                (Some(amount), Some(pvf)) => {
                    Some(self.config.discount(amount * factor / inputs.cost_scale / pvf, year))
                }
                _ => None,
            };
            if is_cost && ordered.insert(key.clone()) {
                order.push(key.clone());
            }
            let entry = totals.entry(key).or_default();
            if is_cost {
                accumulate(&mut entry.cost, -bulk.unwrap_or(0.0));
            } else {
                accumulate(&mut entry.value, bulk.unwrap_or(0.0));
            }
        }

        let generation = normalize(inputs.generation.clone(), &[TECH, VINTAGE, BA], &[YEAR], &[MWH])?;
        let techs = string_values(&generation, TECH)?;
        let vintages = string_values(&generation, VINTAGE)?;
        let regions = string_values(&generation, BA)?;
        let years = year_values(&generation, YEAR)?;
        let energy = float_values(&generation, MWH)?;
        for i in 0..generation.height() {
            let (Some(tech), Some(vintage), Some(rb), Some(year)) = (
                techs[i].clone(),
                vintages[i].clone(),
                regions[i].clone(),
                years[i],
            ) else {
                continue;
            };
            let bulk = match (energy[i], inputs.pvf_onm.get(&year), inputs.pvf_capital.get(&year)) {
                (Some(mwh), Some(onm), Some(cap)) => {
                    Some(self.config.discount(mwh * onm / cap, year))
                }
                _ => None,
            };
            let entry = totals.entry((tech, vintage, rb, year)).or_default();
            accumulate(&mut entry.energy, bulk.unwrap_or(0.0));
        }

        Ok((order, totals))
    }

    /// LCOE, LVOE, NVOE, BCR, PLCOE, value factor, integration cost and
    /// SLCOE per (tech, vintage, rb, year). Undefined ratios are null.
    pub fn metrics(&self, inputs: &ValueStreamInputs) -> Result<DataFrame> {
        let (order, totals) = self.totals(inputs)?;
        let benchmark: BTreeMap<i32, Option<f64>> =
            BenchmarkEngine::new(self.config, self.reference).national_benchmark_price(inputs)?;

        let mut techs = Vec::with_capacity(order.len());
        let mut vintages = Vec::with_capacity(order.len());
        let mut regions = Vec::with_capacity(order.len());
        let mut years = Vec::with_capacity(order.len());
        let mut cost_col = Vec::with_capacity(order.len());
        let mut energy_col = Vec::with_capacity(order.len());
        let mut value_col = Vec::with_capacity(order.len());
        let mut price_col = Vec::with_capacity(order.len());
        let mut metric_cols: Vec<Vec<Option<f64>>> = vec![Vec::with_capacity(order.len()); 8];

        for key in &order {
            let entry = totals.get(key).copied().unwrap_or_default();
            let price = benchmark.get(&key.3).copied().flatten();
            let metrics = Metrics::compute(entry.cost, entry.value, entry.energy, price);

            techs.push(key.0.clone());
            vintages.push(key.1.clone());
            regions.push(key.2.clone());
            years.push(key.3 as i64);
            cost_col.push(entry.cost);
            energy_col.push(entry.energy);
            value_col.push(entry.value);
            price_col.push(price);
            for (column, value) in metric_cols.iter_mut().zip(metrics.values()) {
                column.push(value);
            }
        }

        let mut columns = vec![
            Series::new(TECH.into(), techs),
            Series::new(VINTAGE.into(), vintages),
            Series::new(BA.into(), regions),
            Series::new(YEAR.into(), years),
            Series::new(COST_DOLLARS.into(), cost_col),
            Series::new(MWH.into(), energy_col),
            Series::new(VALUE_DOLLARS.into(), value_col),
            Series::new(BENCHMARK_PRICE.into(), price_col),
        ];
        for (name, values) in METRIC_COLUMNS.iter().zip(metric_cols) {
            columns.push(Series::new((*name).into(), values));
        }
        let df = DataFrame::new(columns)?;

        let mut cleaned_columns = vec![COST_DOLLARS, MWH, VALUE_DOLLARS, BENCHMARK_PRICE];
        cleaned_columns.extend(METRIC_COLUMNS);
        let df = replace_non_finite(df, &cleaned_columns)?;
        info!("Computed competitiveness metrics for {} technology-years", df.height());
        Ok(df)
    }
}

/// Ratios comparing a technology's cost and value with the benchmark price.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics {
    pub lcoe: Option<f64>,
    pub lvoe: Option<f64>,
    pub nvoe: Option<f64>,
    pub bcr: Option<f64>,
    pub plcoe: Option<f64>,
    pub value_factor: Option<f64>,
    pub integration_cost: Option<f64>,
    pub slcoe: Option<f64>,
}

impl Metrics {
    pub fn compute(cost: Option<f64>, value: Option<f64>, energy: Option<f64>, price: Option<f64>) -> Self {
        let div = |a: Option<f64>, b: Option<f64>| Some(a? / b?);
        let lcoe = div(cost, energy);
        let lvoe = div(value, energy);
        let nvoe = lvoe.zip(lcoe).map(|(v, c)| v - c);
        let bcr = div(value, cost);
        let plcoe = price.zip(div(cost, value)).map(|(p, r)| p * r);
        let value_factor = div(lvoe, price);
        let integration_cost = price.zip(lvoe).map(|(p, v)| p - v);
        let slcoe = lcoe.zip(integration_cost).map(|(l, i)| l + i);
        Self {
            lcoe,
            lvoe,
            nvoe,
            bcr,
            plcoe,
            value_factor,
            integration_cost,
            slcoe,
        }
    }

    /// Values in `METRIC_COLUMNS` order.
    pub fn values(&self) -> [Option<f64>; 8] {
        [
            self.lcoe,
            self.lvoe,
            self.nvoe,
            self.bcr,
            self.plcoe,
            self.value_factor,
            self.integration_cost,
            self.slcoe,
        ]
    }
}
