//! Column names shared across engines and small helpers for moving data
//! between polars frames and plain vectors.

use polars::prelude::*;
use std::collections::BTreeMap;

pub const YEAR: &str = "year";
pub const REGION: &str = "r";
pub const BA: &str = "rb";
pub const TECH: &str = "tech";
pub const VINTAGE: &str = "vintage";
pub const TIMESLICE: &str = "timeslice";
pub const COST_CAT: &str = "cost_cat";
pub const COST: &str = "Cost (Bil $)";
pub const DISCOUNTED_COST: &str = "Discounted Cost (Bil $)";
pub const CON_NAME: &str = "con_name";
pub const VAR_NAME: &str = "var_name";
pub const DOLLARS: &str = "$";
pub const MWH: &str = "MWh";
pub const PRICE: &str = "p";
pub const QUANTITY: &str = "q";
pub const REQ_TYPE: &str = "type";
pub const REQ_SUBTYPE: &str = "subtype";

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.column(name).is_ok()
}

pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names().iter().map(|c| c.to_string()).collect()
}

/// First column in `required` that `df` lacks.
pub fn first_missing<'a>(df: &DataFrame, required: &'a [String]) -> Option<&'a str> {
    required
        .iter()
        .find(|name| !has_column(df, name))
        .map(|name| name.as_str())
}

pub fn string_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<String>>> {
    let series = df.column(name)?.cast(&DataType::String)?;
    Ok(series
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

pub fn float_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<f64>>> {
    let series = df.column(name)?.cast(&DataType::Float64)?;
    Ok(series.f64()?.into_iter().collect())
}

pub fn year_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<i32>>> {
    let series = df.column(name)?.cast(&DataType::Int64)?;
    Ok(series
        .i64()?
        .into_iter()
        .map(|v| v.map(|year| year as i32))
        .collect())
}

/// Year-indexed factor table: the first column is the year and
/// `value_column` holds the factor. Rows with either side missing are skipped.
pub fn year_map(df: &DataFrame, value_column: &str) -> PolarsResult<BTreeMap<i32, f64>> {
    let year_column = match df.get_column_names().first() {
        Some(name) => name.to_string(),
        None => return Err(PolarsError::NoData("year table has no columns".into())),
    };
    let years = year_values(df, &year_column)?;
    let values = float_values(df, value_column)?;
    Ok(years
        .into_iter()
        .zip(values)
        .filter_map(|(year, value)| Some((year?, value?)))
        .collect())
}

/// Casts key columns to strings, year columns to Int64 and value columns to
/// Float64 so frames from different sources join cleanly.
pub fn normalize(
    df: DataFrame,
    string_keys: &[&str],
    year_keys: &[&str],
    values: &[&str],
) -> PolarsResult<DataFrame> {
    let mut casts = Vec::new();
    for name in string_keys {
        if has_column(&df, name) {
            casts.push(col(*name).cast(DataType::String));
        }
    }
    for name in year_keys {
        if has_column(&df, name) {
            casts.push(col(*name).cast(DataType::Int64));
        }
    }
    for name in values {
        if has_column(&df, name) {
            casts.push(col(*name).cast(DataType::Float64));
        }
    }
    if casts.is_empty() {
        return Ok(df);
    }
    df.lazy().with_columns(casts).collect()
}

/// `column IN values` without pulling in the `is_in` kernel. The column is
/// compared in its string form.
pub fn is_one_of<S: AsRef<str>>(column: &str, values: &[S]) -> Expr {
    values.iter().fold(lit(false), |acc, value| {
        acc.or(col(column)
            .cast(DataType::String)
            .eq(lit(value.as_ref().to_string())))
    })
}

pub fn key_exprs(columns: &[&str]) -> Vec<Expr> {
    columns.iter().map(|name| col(*name)).collect()
}

pub fn left_join(left: LazyFrame, right: LazyFrame, on: &[&str]) -> LazyFrame {
    left.join(
        right,
        key_exprs(on),
        key_exprs(on),
        JoinArgs::new(JoinType::Left),
    )
}

/// Replaces infinite and NaN entries with nulls.
pub fn replace_non_finite(mut df: DataFrame, columns: &[&str]) -> PolarsResult<DataFrame> {
    for name in columns {
        if !has_column(&df, name) {
            continue;
        }
        let cleaned: Vec<Option<f64>> = float_values(&df, name)?
            .into_iter()
            .map(|v| v.filter(|x| x.is_finite()))
            .collect();
        df.with_column(Series::new((*name).into(), cleaned))?;
    }
    Ok(df)
}

/// Value of `value_col` on the first row whose key columns render as the
/// given strings.
#[cfg(test)]
pub(crate) fn value_at(df: &DataFrame, keys: &[(&str, &str)], value_col: &str) -> Option<f64> {
    let key_columns: Vec<Vec<Option<String>>> = keys
        .iter()
        .map(|(name, _)| string_values(df, name).unwrap())
        .collect();
    let values = float_values(df, value_col).unwrap();
    (0..df.height())
        .find(|&row| {
            keys.iter()
                .zip(&key_columns)
                .all(|((_, wanted), column)| column[row].as_deref() == Some(*wanted))
        })
        .and_then(|row| values[row])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_non_finite() {
        let df = df!(
            "tech" => ["a", "b", "c", "d"],
            "v" => [1.0, f64::INFINITY, f64::NAN, f64::NEG_INFINITY]
        )
        .unwrap();
        let cleaned = replace_non_finite(df, &["v", "absent"]).unwrap();
        let values = float_values(&cleaned, "v").unwrap();
        assert_eq!(values, vec![Some(1.0), None, None, None]);
    }

    #[test]
    fn test_normalize_and_lookup() {
        let df = df!(
            "year" => [2026.0, 2027.0],
            "rb" => [1i64, 2],
            "MWh" => [5i64, 7]
        )
        .unwrap();
        let df = normalize(df, &["rb"], &["year"], &["MWh"]).unwrap();
        assert_eq!(df.column("year").unwrap().dtype(), &DataType::Int64);
        assert_eq!(value_at(&df, &[("year", "2027"), ("rb", "2")], "MWh"), Some(7.0));
        assert_eq!(value_at(&df, &[("year", "2030")], "MWh"), None);
    }

    #[test]
    fn test_year_map_uses_first_column() {
        let df = df!("t" => [2026i64, 2027, 2028], "pvfonm" => [Some(1.5), None, Some(0.5)]).unwrap();
        let map = year_map(&df, "pvfonm").unwrap();
        assert_eq!(map.into_iter().collect::<Vec<_>>(), vec![(2026, 1.5), (2028, 0.5)]);
    }

    #[test]
    fn test_is_one_of_filters_rows() {
        let df = df!("con_name" => ["a", "b", "c"], "v" => [1.0, 2.0, 3.0]).unwrap();
        let kept = df
            .lazy()
            .filter(is_one_of("con_name", &["a", "c"]))
            .collect()
            .unwrap();
        assert_eq!(kept.height(), 2);
    }
}
