//! Aggregation and scaling transforms used as pipeline steps.
//!
//! Every transform takes a frame by value and returns a new one. Column
//! dropping happens before grouping, and groups keep first-appearance order.

use crate::error::TransformError;
use crate::table::{column_names, has_column, is_one_of};
use polars::prelude::*;
use serde::Serialize;

/// Which non-group columns survive into the aggregation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ColumnSelection {
    /// Drop these columns (absent ones are ignored) and sum everything else.
    Drop(Vec<String>),
    /// Keep only the group columns and these value columns.
    Values(Vec<String>),
}

/// Time resolution of an aggregation: which of the month/day/hour columns
/// take part in the group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolution {
    Year,
    Month,
    Day,
    Hour,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SumArgs {
    pub group_cols: Vec<String>,
    pub selection: ColumnSelection,
    pub month_col: Option<String>,
    pub day_col: Option<String>,
    pub hour_col: Option<String>,
}

impl SumArgs {
    pub fn dropping(drop_cols: &[&str], group_cols: &[&str]) -> Self {
        Self {
            group_cols: to_strings(group_cols),
            selection: ColumnSelection::Drop(to_strings(drop_cols)),
            month_col: None,
            day_col: None,
            hour_col: None,
        }
    }

    pub fn keeping(val_cols: &[&str], group_cols: &[&str]) -> Self {
        Self {
            selection: ColumnSelection::Values(to_strings(val_cols)),
            ..Self::dropping(&[], group_cols)
        }
    }

    pub fn month(mut self, column: &str) -> Self {
        self.month_col = Some(column.to_string());
        self
    }

    pub fn day(mut self, column: &str) -> Self {
        self.day_col = Some(column.to_string());
        self
    }

    pub fn hour(mut self, column: &str) -> Self {
        self.hour_col = Some(column.to_string());
        self
    }

    /// Group key for a resolution: the declared group columns plus the time
    /// columns that resolution keeps.
    pub fn group_columns(&self, resolution: Resolution) -> Vec<String> {
        let mut group = self.group_cols.clone();
        let time_cols = match resolution {
            Resolution::Year => vec![],
            Resolution::Month => vec![&self.month_col],
            Resolution::Day => vec![&self.month_col, &self.day_col],
            Resolution::Hour => vec![&self.month_col, &self.day_col, &self.hour_col],
        };
        for column in time_cols.into_iter().flatten() {
            if !group.contains(column) {
                group.push(column.clone());
            }
        }
        group
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Group by the resolution's key and sum every retained value column.
pub fn sum_over(
    df: DataFrame,
    args: &SumArgs,
    resolution: Resolution,
) -> Result<DataFrame, TransformError> {
    let group_cols = args.group_columns(resolution);
    let all_cols = column_names(&df);

    let retained: Vec<String> = match &args.selection {
        ColumnSelection::Drop(drop) => all_cols
            .iter()
            .filter(|c| !drop.contains(c))
            .cloned()
            .collect(),
        ColumnSelection::Values(values) => {
            if let Some(missing) = values.iter().find(|v| !all_cols.contains(v)) {
                return Err(TransformError::MissingColumn(missing.clone()));
            }
            all_cols
                .iter()
                .filter(|c| group_cols.contains(c) || values.contains(c))
                .cloned()
                .collect()
        }
    };

    if let Some(missing) = group_cols.iter().find(|g| !retained.contains(g)) {
        return Err(TransformError::MissingColumn(missing.clone()));
    }

    let keys: Vec<Expr> = group_cols.iter().map(|c| col(c.as_str())).collect();
    let sums: Vec<Expr> = retained
        .iter()
        .filter(|c| !group_cols.contains(c))
        .map(|c| col(c.as_str()).sum())
        .collect();

    let out = df.lazy().group_by_stable(keys).agg(sums).collect()?;
    Ok(out)
}

/// Sum over everything but the group columns (annual resolution).
pub fn sum_over_cols(df: DataFrame, args: &SumArgs) -> Result<DataFrame, TransformError> {
    sum_over(df, args, Resolution::Year)
}

/// Sum over days and hours, keeping months.
pub fn sum_over_months(df: DataFrame, args: &SumArgs) -> Result<DataFrame, TransformError> {
    sum_over(df, args, Resolution::Month)
}

/// Sum over hours, keeping months and days.
pub fn sum_over_days(df: DataFrame, args: &SumArgs) -> Result<DataFrame, TransformError> {
    sum_over(df, args, Resolution::Day)
}

/// Group at full hourly resolution (collapses duplicate keys only).
pub fn sum_over_hours(df: DataFrame, args: &SumArgs) -> Result<DataFrame, TransformError> {
    sum_over(df, args, Resolution::Hour)
}

/// Multiply one column by a constant.
pub fn scale_column(
    df: DataFrame,
    column: &str,
    scale_factor: f64,
) -> Result<DataFrame, TransformError> {
    if !has_column(&df, column) {
        return Err(TransformError::MissingColumn(column.to_string()));
    }
    let out = df
        .lazy()
        .with_column((col(column) * lit(scale_factor)).alias(column))
        .collect()?;
    Ok(out)
}

/// Multiply `change_column` by a constant on rows whose `by_column` value is
/// one of `by_values`.
pub fn scale_column_filtered(
    df: DataFrame,
    by_column: &str,
    by_values: &[String],
    change_column: &str,
    scale_factor: f64,
) -> Result<DataFrame, TransformError> {
    for column in [by_column, change_column] {
        if !has_column(&df, column) {
            return Err(TransformError::MissingColumn(column.to_string()));
        }
    }
    let out = df
        .lazy()
        .with_column(
            when(is_one_of(by_column, by_values))
                .then(col(change_column).cast(DataType::Float64) * lit(scale_factor))
                .otherwise(col(change_column).cast(DataType::Float64))
                .alias(change_column),
        )
        .collect()?;
    Ok(out)
}

/// Convert a dollar column to the output dollar year.
pub fn apply_inflation(
    df: DataFrame,
    column: &str,
    inflation_factor: f64,
) -> Result<DataFrame, TransformError> {
    scale_column(df, column, inflation_factor)
}
