//! Bulk value-stream table: every value stream of every technology vintage
//! as a present value in the year it was earned, next to the energy and
//! capacity that earned it.

use crate::benchmarks::{ValueStreamInputs, PVF_CAPITAL_TABLE, PVF_ONM_TABLE};
use crate::data_loader::{ensure_present, TableLoader};
use crate::models::RunConfig;
use crate::reference_data::ReferenceData;
use crate::table::{
    float_values, normalize, string_values, year_values, BA, CON_NAME, DOLLARS, MWH, TECH,
    VAR_NAME, VINTAGE, YEAR,
};
use anyhow::{Context, Result};
use log::info;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const VINTAGE_CAPACITY_TABLE: &str = "cap_vintage";
pub const UNCURTAILED_GENERATION_TABLE: &str = "gen_uncurt";

pub const BULK_DOLLARS: &str = "Bulk $";
pub const BULK_DOLLARS_DISCOUNTED: &str = "Bulk $ Dis";
pub const TECH_VINTAGE: &str = "tech, vintage";
pub const VAR_CON: &str = "var, con";
pub const CON_ADJ: &str = "con_adj";

const CAPACITY_REGION: &str = "region";
const CAPACITY_MW: &str = "MW";

/// Investment variables.
pub const INVESTMENT_VARS: [&str; 4] = ["inv", "inv_refurb", "upgrades", "invtran"];
/// Capacity variables that investments link to.
pub const CAPACITY_VARS: [&str; 2] = ["cap", "captran"];
/// Variables whose streams accumulate over the life of a vintage.
pub const CUMULATIVE_VARS: [&str; 16] = [
    "gen",
    "cap",
    "opres",
    "storage_in",
    "captran",
    "flow",
    "opres_flow",
    "prmtrade",
    "storage_in_pvb_p",
    "storage_in_pvb_g",
    "cap_sdbin",
    "storage_level",
    "recs",
    "gen_pvb_p",
    "gen_pvb_b",
    "produce",
];
/// Constraints tying new investment to capacity.
pub const LINKING_CONSTRAINTS: [&str; 5] = [
    "eq_cap_new_noret",
    "eq_cap_new_retub",
    "eq_cap_new_retmo",
    "eq_cap_upgrade",
    "eq_captran",
];
/// Objective-function constraints reported by variable in `con_adj`.
const OBJECTIVE_CONSTRAINTS: [&str; 2] = ["eq_objfn_inv", "eq_objfn_op"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValueStreamOptions {
    /// Drop the streams of investment variables.
    pub remove_inv: bool,
    /// Use uncurtailed generation for technologies that report it.
    pub uncurt: bool,
    /// Keep only investment years, scaling cumulative streams and generation
    /// to the size of the investment.
    pub investment_only: bool,
}

/// Value streams, generation and vintage capacity of one run.
#[derive(Debug, Clone)]
pub struct BulkValueStreamInputs {
    pub streams: ValueStreamInputs,
    /// (tech, vintage, region, year, MW) with supply or balancing regions.
    pub capacity: DataFrame,
    pub uncurtailed: Option<DataFrame>,
}

impl BulkValueStreamInputs {
    pub fn load(loader: &dyn TableLoader) -> Result<Self> {
        Ok(Self {
            streams: ValueStreamInputs::load(loader)?,
            capacity: loader
                .load(VINTAGE_CAPACITY_TABLE)
                .context("loading vintage capacity")?,
            uncurtailed: loader.load_optional(UNCURTAILED_GENERATION_TABLE)?,
        })
    }
}

/// (tech, vintage, rb, year)
type IndexKey = (String, String, String, i32);

#[derive(Debug, Clone)]
struct Stream {
    key: IndexKey,
    var_name: String,
    con_name: String,
    amount: Option<f64>,
}

fn is_in(value: &str, set: &[&str]) -> bool {
    set.contains(&value)
}

/// Sums per key in first-appearance order. Missing amounts count as zero.
fn group_sum(rows: impl IntoIterator<Item = (IndexKey, Option<f64>)>) -> Vec<(IndexKey, f64)> {
    let mut order: Vec<(IndexKey, f64)> = Vec::new();
    let mut index: HashMap<IndexKey, usize> = HashMap::new();
    for (key, amount) in rows {
        let pos = *index.entry(key.clone()).or_insert_with(|| {
            order.push((key, 0.0));
            order.len() - 1
        });
        order[pos].1 += amount.unwrap_or(0.0);
    }
    order
}

pub struct ValueStreamEngine<'a> {
    config: RunConfig,
    reference: &'a ReferenceData,
}

impl<'a> ValueStreamEngine<'a> {
    pub fn new(config: RunConfig, reference: &'a ReferenceData) -> Self {
        Self { config, reference }
    }

    fn streams(&self, df: &DataFrame) -> Result<Vec<Stream>> {
        let df = normalize(df.clone(), &[TECH, VINTAGE, BA, VAR_NAME, CON_NAME], &[YEAR], &[DOLLARS])?;
        let techs = string_values(&df, TECH)?;
        let vintages = string_values(&df, VINTAGE)?;
        let regions = string_values(&df, BA)?;
        let years = year_values(&df, YEAR)?;
        let vars = string_values(&df, VAR_NAME)?;
        let cons = string_values(&df, CON_NAME)?;
        let amounts = float_values(&df, DOLLARS)?;
        let mut out = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            if let (Some(tech), Some(vintage), Some(rb), Some(year), Some(var_name), Some(con_name)) = (
                techs[i].clone(),
                vintages[i].clone(),
                regions[i].clone(),
                years[i],
                vars[i].clone(),
                cons[i].clone(),
            ) {
                out.push(Stream {
                    key: (tech, vintage, rb, year),
                    var_name,
                    con_name,
                    amount: amounts[i],
                });
            }
        }
        Ok(out)
    }

    fn keyed_amounts(
        &self,
        df: &DataFrame,
        region_column: &str,
        value_column: &str,
    ) -> Result<Vec<(IndexKey, Option<f64>)>> {
        let df = normalize(df.clone(), &[TECH, VINTAGE, region_column], &[YEAR], &[value_column])?;
        let techs = string_values(&df, TECH)?;
        let vintages = string_values(&df, VINTAGE)?;
        let regions = string_values(&df, region_column)?;
        let years = year_values(&df, YEAR)?;
        let amounts = float_values(&df, value_column)?;
        let mut out = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            if let (Some(tech), Some(vintage), Some(region), Some(year)) =
                (techs[i].clone(), vintages[i].clone(), regions[i].clone(), years[i])
            {
                let rb = self.reference.balancing_region(&region).to_string();
                out.push(((tech, vintage, rb, year), amounts[i]));
            }
        }
        Ok(out)
    }

    /// Scaling factor per investment key: minus the investment stream over
    /// the capacity stream on the linking constraints. Keys without both are
    /// left out.
    fn investment_scale(&self, streams: &[Stream]) -> Vec<(IndexKey, f64)> {
        let links: Vec<&Stream> = streams
            .iter()
            .filter(|s| is_in(&s.con_name, &LINKING_CONSTRAINTS))
            .collect();
        let investment = group_sum(
            links
                .iter()
                .filter(|s| is_in(&s.var_name, &INVESTMENT_VARS))
                .map(|s| (s.key.clone(), s.amount)),
        );
        let capacity: HashMap<IndexKey, f64> = group_sum(
            links
                .iter()
                .filter(|s| is_in(&s.var_name, &CAPACITY_VARS))
                .map(|s| (s.key.clone(), s.amount)),
        )
        .into_iter()
        .collect();
        investment
            .into_iter()
            .filter_map(|(key, inv)| {
                let cap = capacity.get(&key)?;
                Some((key, -inv / cap))
            })
            .collect()
    }

    /// Columns: tech, vintage, rb, year, var_name, con_name, Bulk $,
    /// Bulk $ Dis, "tech, vintage", "var, con", con_adj. Value streams are in
    /// bulk dollars, `MWh` rows hold bulk energy and `kW` rows capacity.
    pub fn bulk_value_streams(
        &self,
        inputs: &BulkValueStreamInputs,
        options: &ValueStreamOptions,
    ) -> Result<DataFrame> {
        let base = &inputs.streams;
        ensure_present(!base.pvf_capital.is_empty(), PVF_CAPITAL_TABLE)?;
        ensure_present(!base.pvf_onm.is_empty(), PVF_ONM_TABLE)?;
        let factor = self.reference.inflation_factor(self.config.dollar_year)?;

        let mut streams = self.streams(&base.value_streams)?;
        if options.remove_inv {
            streams.retain(|s| !is_in(&s.var_name, &INVESTMENT_VARS));
        }

        let mut generation = self.keyed_amounts(&base.generation, BA, MWH)?;
        if options.uncurt {
            let uncurtailed = inputs
                .uncurtailed
                .as_ref()
                .with_context(|| {
                    format!(
                        "uncurtailed generation needs the '{}' table",
                        UNCURTAILED_GENERATION_TABLE
                    )
                })?;
            let uncurtailed = self.keyed_amounts(uncurtailed, BA, MWH)?;
            let replaced: HashSet<&str> = uncurtailed.iter().map(|(key, _)| key.0.as_str()).collect();
            generation.retain(|(key, _)| !replaced.contains(key.0.as_str()));
            generation.extend(uncurtailed);
        }

        if options.investment_only {
            let scale = self.investment_scale(&streams);
            let mut scaled: Vec<Stream> = streams
                .iter()
                .filter(|s| is_in(&s.var_name, &INVESTMENT_VARS))
                .cloned()
                .collect();
            for (key, mult) in &scale {
                scaled.extend(
                    streams
                        .iter()
                        .filter(|s| &s.key == key && is_in(&s.var_name, &CUMULATIVE_VARS))
                        .map(|s| Stream {
                            amount: s.amount.map(|a| a * mult),
                            ..s.clone()
                        }),
                );
            }
            streams = scaled;

            let mut scaled_generation = Vec::new();
            for (key, mult) in &scale {
                let matching: Vec<Option<f64>> = generation
                    .iter()
                    .filter(|(k, _)| k == key)
                    .map(|(_, mwh)| mwh.map(|m| m * mult))
                    .collect();
                if matching.is_empty() {
                    scaled_generation.push((key.clone(), None));
                }
                scaled_generation.extend(matching.into_iter().map(|mwh| (key.clone(), mwh)));
            }
            generation = scaled_generation;
            info!("Scaled value streams to {} investment years", scale.len());
        }

        let mut rows: Vec<(IndexKey, String, String, Option<f64>)> = Vec::new();
        for stream in streams {
            let bulk = match (stream.amount, base.pvf_capital.get(&stream.key.3)) {
                (Some(amount), Some(pvf)) => Some(amount * factor / base.cost_scale / pvf),
                _ => None,
            };
            rows.push((stream.key, stream.var_name, stream.con_name, bulk));
        }
        for (key, mwh) in group_sum(generation) {
            let year = key.3;
            let bulk = match (base.pvf_onm.get(&year), base.pvf_capital.get(&year)) {
                (Some(onm), Some(cap)) => Some(mwh * onm / cap),
                _ => None,
            };
            rows.push((key, MWH.to_string(), MWH.to_string(), bulk));
        }
        let capacity = self.keyed_amounts(&inputs.capacity, CAPACITY_REGION, CAPACITY_MW)?;
        for (key, mw) in group_sum(capacity) {
            rows.push((key, "kW".to_string(), "kW".to_string(), Some(mw * 1000.0)));
        }

        let n = rows.len();
        let mut techs = Vec::with_capacity(n);
        let mut vintages = Vec::with_capacity(n);
        let mut regions = Vec::with_capacity(n);
        let mut years = Vec::with_capacity(n);
        let mut var_names = Vec::with_capacity(n);
        let mut con_names = Vec::with_capacity(n);
        let mut bulk = Vec::with_capacity(n);
        let mut discounted = Vec::with_capacity(n);
        let mut tech_vintage = Vec::with_capacity(n);
        let mut var_con = Vec::with_capacity(n);
        let mut con_adj = Vec::with_capacity(n);
        for ((tech, vintage, rb, year), var_name, con_name, amount) in rows {
            let label = format!("{}, {}", var_name, con_name);
            con_adj.push(if is_in(&con_name, &OBJECTIVE_CONSTRAINTS) {
                label.clone()
            } else {
                con_name.clone()
            });
            tech_vintage.push(format!("{}, {}", tech, vintage));
            var_con.push(label);
            discounted.push(amount.map(|a| self.config.discount(a, year)));
            bulk.push(amount);
            techs.push(tech);
            vintages.push(vintage);
            regions.push(rb);
            years.push(year as i64);
            var_names.push(var_name);
            con_names.push(con_name);
        }

        let df = DataFrame::new(vec![
            Series::new(TECH.into(), techs),
            Series::new(VINTAGE.into(), vintages),
            Series::new(BA.into(), regions),
            Series::new(YEAR.into(), years),
            Series::new(VAR_NAME.into(), var_names),
            Series::new(CON_NAME.into(), con_names),
            Series::new(BULK_DOLLARS.into(), bulk),
            Series::new(BULK_DOLLARS_DISCOUNTED.into(), discounted),
            Series::new(TECH_VINTAGE.into(), tech_vintage),
            Series::new(VAR_CON.into(), var_con),
            Series::new(CON_ADJ.into(), con_adj),
        ])?;
        info!("Built bulk value-stream table with {} rows", df.height());
        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmarks::tests::{inputs, reference};
    use crate::benchmarks::{ENERGY_CONSTRAINT, GENERATION_TABLE, PRICE_TABLE, QUANTITY_TABLE, VALUE_STREAMS_TABLE};
    use crate::data_loader::InMemoryLoader;
    use crate::table::value_at;

    fn bulk_inputs() -> BulkValueStreamInputs {
        BulkValueStreamInputs {
            streams: inputs(),
            capacity: df!(
                "tech" => ["wind", "wind"],
                "vintage" => ["v1", "v1"],
                "region" => ["s1", "p1"],
                "year" => [2030i64, 2030],
                "MW" => [2.0, 3.0]
            )
            .unwrap(),
            uncurtailed: None,
        }
    }

    fn mapped_reference() -> ReferenceData {
        let mut reference = reference();
        reference.add_region_mapping("s1", "p1");
        reference
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {}, got {}", expected, actual);
    }

    fn bulk(df: &DataFrame, keys: &[(&str, &str)]) -> f64 {
        value_at(df, keys, BULK_DOLLARS).unwrap()
    }

    #[test]
    fn test_bulk_value_streams() {
        let reference = mapped_reference();
        let engine = ValueStreamEngine::new(RunConfig::new(0.05, 2029, 2004), &reference);
        let out = engine
            .bulk_value_streams(&bulk_inputs(), &ValueStreamOptions::default())
            .unwrap();

        // 4 streams, 3 generation keys, 1 capacity key
        assert_eq!(out.height(), 8);
        let energy = [("rb", "p1"), ("con_name", ENERGY_CONSTRAINT)];
        assert_close(bulk(&out, &energy), 1000.0 / 0.5);
        assert_close(
            value_at(&out, &energy, BULK_DOLLARS_DISCOUNTED).unwrap(),
            2000.0 / 1.05,
        );
        // MWh × pvfonm / pvfcap
        let v2 = [("vintage", "v2"), ("con_name", "MWh")];
        assert_close(bulk(&out, &v2), 5.0 * 2.0 / 0.5);
        // supply region s1 folds into p1, MW to kW
        assert_close(bulk(&out, &[("con_name", "kW")]), 5000.0);

        let labels = string_values(&out, CON_ADJ).unwrap();
        let var_con = string_values(&out, VAR_CON).unwrap();
        let cons = string_values(&out, CON_NAME).unwrap();
        for ((adj, label), con) in labels.iter().zip(&var_con).zip(&cons) {
            if con.as_deref() == Some("eq_objfn_inv") {
                assert_eq!(adj.as_deref(), Some("inv, eq_objfn_inv"));
            } else {
                assert_eq!(adj, con);
            }
            assert!(label.is_some());
        }
        let tech_vintage = string_values(&out, TECH_VINTAGE).unwrap();
        assert_eq!(tech_vintage[0].as_deref(), Some("wind, v1"));
    }

    #[test]
    fn test_remove_inv_drops_investment_streams() {
        let reference = mapped_reference();
        let engine = ValueStreamEngine::new(RunConfig::default(), &reference);
        let options = ValueStreamOptions {
            remove_inv: true,
            ..Default::default()
        };
        let out = engine.bulk_value_streams(&bulk_inputs(), &options).unwrap();
        assert_eq!(out.height(), 7);
        assert!(value_at(&out, &[("var_name", "inv")], BULK_DOLLARS).is_none());
    }

    #[test]
    fn test_uncurtailed_generation_replaces_reported_techs() {
        let reference = mapped_reference();
        let engine = ValueStreamEngine::new(RunConfig::default(), &reference);
        let options = ValueStreamOptions {
            uncurt: true,
            ..Default::default()
        };
        let mut inputs = bulk_inputs();
        assert!(engine.bulk_value_streams(&inputs, &options).is_err());

        inputs.uncurtailed = Some(
            df!(
                "tech" => ["wind"],
                "vintage" => ["v1"],
                "rb" => ["p1"],
                "year" => [2030i64],
                "MWh" => [12.0]
            )
            .unwrap(),
        );
        let out = engine.bulk_value_streams(&inputs, &options).unwrap();
        assert_eq!(out.height(), 4 + 1 + 1);
        assert_close(bulk(&out, &[("con_name", "MWh")]), 12.0 * 4.0);
    }

    #[test]
    fn test_investment_only_scales_cumulative_streams() {
        let reference = mapped_reference();
        let engine = ValueStreamEngine::new(RunConfig::default(), &reference);
        let mut inputs = bulk_inputs();
        inputs.streams.value_streams = df!(
            "tech" => ["wind"; 5],
            "vintage" => ["v1"; 5],
            "rb" => ["p1", "p1", "p1", "p1", "p2"],
            "year" => [2030i64; 5],
            "var_name" => ["inv", "cap", "gen", "inv", "gen"],
            "con_name" => ["eq_cap_new_noret", "eq_cap_new_noret", ENERGY_CONSTRAINT, "eq_objfn_inv", ENERGY_CONSTRAINT],
            "$" => [300.0, -100.0, 50.0, -40.0, 70.0]
        )
        .unwrap();
        let options = ValueStreamOptions {
            investment_only: true,
            ..Default::default()
        };

        let out = engine.bulk_value_streams(&inputs, &options).unwrap();
        // two investment streams, two scaled cumulative streams, one MWh, one kW
        assert_eq!(out.height(), 6);
        let at = |var: &str, con: &str| bulk(&out, &[("rb", "p1"), ("var_name", var), ("con_name", con)]);
        assert_close(at("inv", "eq_cap_new_noret"), 600.0);
        assert_close(at("inv", "eq_objfn_inv"), -80.0);
        // multiplier -(300 / -100) = 3
        assert_close(at("cap", "eq_cap_new_noret"), -600.0);
        assert_close(at("gen", ENERGY_CONSTRAINT), 300.0);
        assert!(value_at(&out, &[("rb", "p2")], BULK_DOLLARS).is_none());
        assert_close(bulk(&out, &[("con_name", "MWh")]), 30.0 * 4.0);
    }

    #[test]
    fn test_missing_vintage_capacity_table_is_error() {
        let inputs = inputs();
        let loader = InMemoryLoader::new()
            .with_table(VALUE_STREAMS_TABLE, inputs.value_streams.clone())
            .with_table(GENERATION_TABLE, inputs.generation.clone())
            .with_table(PRICE_TABLE, inputs.prices.clone())
            .with_table(QUANTITY_TABLE, inputs.quantities.clone());
        let err = BulkValueStreamInputs::load(&loader).unwrap_err();
        assert!(format!("{:#}", err).contains("vintage capacity"));
    }

    #[test]
    fn test_bulk_value_streams_require_capital_factors() {
        let reference = mapped_reference();
        let engine = ValueStreamEngine::new(RunConfig::default(), &reference);
        let mut inputs = bulk_inputs();
        inputs.streams.pvf_capital.clear();
        let err = engine
            .bulk_value_streams(&inputs, &ValueStreamOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains(PVF_CAPITAL_TABLE));
    }
}
