use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scalar run parameters shared by the cost and benchmark engines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub discount_rate: f64, // fraction, e.g. 0.05
    pub pv_year: i32,       // present-value reference year
    pub dollar_year: i32,   // output dollar year
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            discount_rate: 0.05,
            pv_year: 2024,
            dollar_year: 2004,
        }
    }
}

impl RunConfig {
    pub fn new(discount_rate: f64, pv_year: i32, dollar_year: i32) -> Self {
        Self {
            discount_rate,
            pv_year,
            dollar_year,
        }
    }

    /// Present-value divisor for a given year: `(1+d)^(year - pv_year)`.
    pub fn discount_divisor(&self, year: i32) -> f64 {
        (1.0 + self.discount_rate).powi(year - self.pv_year)
    }

    pub fn discount(&self, amount: f64, year: i32) -> f64 {
        amount / self.discount_divisor(year)
    }

    /// Closed-form annuity factor for `periods` years at the run discount rate.
    pub fn capital_recovery_factor(&self, periods: u32) -> f64 {
        let d = self.discount_rate;
        let growth = (1.0 + d).powi(periods as i32);
        d * growth / (growth - 1.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CostKind {
    Capital,
    Operation,
}

impl CostKind {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim() {
            "Capital" | "capital" => Some(CostKind::Capital),
            "Operation" | "operation" | "Operating" | "operating" => Some(CostKind::Operation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChartType {
    Bar,
    Area,
    Line,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterKeyword {
    Last,
}

/// Filter applied by a preset before charting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PresetFilter {
    Keyword(FilterKeyword),
    Values(Vec<String>),
}

/// Chart configuration attached to a registry result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preset {
    pub x: String,
    pub y: String,
    pub series: String,
    pub explode: String,
    pub chart_type: ChartType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bar_width: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub filter: BTreeMap<String, PresetFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adv_op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adv_col: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adv_col_base: Option<String>,
}

impl Preset {
    pub fn new(x: &str, y: &str, series: &str, explode: &str, chart_type: ChartType) -> Self {
        Self {
            x: x.to_string(),
            y: y.to_string(),
            series: series.to_string(),
            explode: explode.to_string(),
            chart_type,
            bar_width: None,
            filter: BTreeMap::new(),
            adv_op: None,
            adv_col: None,
            adv_col_base: None,
        }
    }

    /// Stacked bars of `y` by `series` along `x`, one chart per scenario.
    pub fn stacked_bars(x: &str, y: &str, series: &str) -> Self {
        Self::new(x, y, series, "scenario", ChartType::Bar).with_bar_width("1")
    }

    pub fn with_bar_width(mut self, width: &str) -> Self {
        self.bar_width = Some(width.to_string());
        self
    }

    pub fn filter_last(mut self, column: &str) -> Self {
        self.filter
            .insert(column.to_string(), PresetFilter::Keyword(FilterKeyword::Last));
        self
    }

    pub fn filter_values(mut self, column: &str, values: &[&str]) -> Self {
        self.filter.insert(
            column.to_string(),
            PresetFilter::Values(values.iter().map(|v| v.to_string()).collect()),
        );
        self
    }

    pub fn ratio_of(mut self, column: &str, base: &str) -> Self {
        self.adv_op = Some("Ratio".to_string());
        self.adv_col = Some(column.to_string());
        self.adv_col_base = Some(base.to_string());
        self
    }
}

/// Presets keep their declaration order.
pub type NamedPresets = Vec<(String, Preset)>;
