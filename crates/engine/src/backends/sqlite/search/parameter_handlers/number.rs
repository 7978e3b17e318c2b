//! Number parameter SQL handler.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::error::SearchError;
use crate::types::SearchPrefix;

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles number parameter SQL generation.
pub struct NumberHandler;

impl NumberHandler {
    /// Builds SQL for a number value.
    ///
    /// Equality honours the implicit precision of the value: `100` matches
    /// `[99.5, 100.5)` and `100.00` matches `[99.995, 100.005)`. `sa` and
    /// `eb` are only meaningful for values with decimal places.
    pub fn build_sql(
        parameter: &str,
        prefix: SearchPrefix,
        value: Decimal,
    ) -> Result<SqlFragment, SearchError> {
        if value.scale() == 0 && matches!(prefix, SearchPrefix::Sa | SearchPrefix::Eb) {
            return Err(SearchError::InvalidFilter {
                parameter: parameter.to_string(),
                message: format!("prefix {prefix} not allowed for integer value {value}"),
            });
        }

        let float = |d: Decimal| -> Result<SqlParam, SearchError> {
            d.to_f64()
                .map(SqlParam::Float)
                .ok_or_else(|| SearchError::InvalidFilter {
                    parameter: parameter.to_string(),
                    message: format!("number out of range: {d}"),
                })
        };

        let fragment = match prefix {
            SearchPrefix::Eq => {
                let half = Self::half_precision(value);
                SqlFragment::with_params(
                    "index_value >= ? AND index_value < ?",
                    vec![float(value - half)?, float(value + half)?],
                )
            }
            SearchPrefix::Ne => {
                let half = Self::half_precision(value);
                SqlFragment::with_params(
                    "(index_value < ? OR index_value >= ?)",
                    vec![float(value - half)?, float(value + half)?],
                )
            }
            SearchPrefix::Gt | SearchPrefix::Sa => {
                SqlFragment::with_params("index_value > ?", vec![float(value)?])
            }
            SearchPrefix::Lt | SearchPrefix::Eb => {
                SqlFragment::with_params("index_value < ?", vec![float(value)?])
            }
            SearchPrefix::Ge => SqlFragment::with_params("index_value >= ?", vec![float(value)?]),
            SearchPrefix::Le => SqlFragment::with_params("index_value <= ?", vec![float(value)?]),
            SearchPrefix::Ap => {
                let margin = (value / Decimal::TEN).abs();
                SqlFragment::with_params(
                    "index_value >= ? AND index_value <= ?",
                    vec![float(value - margin)?, float(value + margin)?],
                )
            }
        };
        Ok(fragment)
    }

    /// Half of one unit in the last significant place.
    fn half_precision(value: Decimal) -> Decimal {
        Decimal::try_new(5, value.scale() + 1).unwrap_or(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn floats(frag: &SqlFragment) -> Vec<f64> {
        frag.params
            .iter()
            .map(|p| match p {
                SqlParam::Float(f) => *f,
                other => panic!("expected float, got {other:?}"),
            })
            .collect()
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{a} != {e}");
        }
    }

    #[test]
    fn test_number_eq_uses_implicit_precision() {
        let frag = NumberHandler::build_sql("n", SearchPrefix::Eq, dec("100")).unwrap();
        assert_eq!(frag.sql, "index_value >= ? AND index_value < ?");
        assert_eq!(frag.params, vec![SqlParam::Float(99.5), SqlParam::Float(100.5)]);

        let frag = NumberHandler::build_sql("n", SearchPrefix::Eq, dec("100.00")).unwrap();
        assert_close(&floats(&frag), &[99.995, 100.005]);
    }

    #[test]
    fn test_number_ne() {
        let frag = NumberHandler::build_sql("n", SearchPrefix::Ne, dec("2.5")).unwrap();
        assert_eq!(frag.sql, "(index_value < ? OR index_value >= ?)");
        assert_close(&floats(&frag), &[2.45, 2.55]);
    }

    #[test]
    fn test_number_comparisons() {
        let cases = [
            (SearchPrefix::Gt, "index_value > ?"),
            (SearchPrefix::Lt, "index_value < ?"),
            (SearchPrefix::Ge, "index_value >= ?"),
            (SearchPrefix::Le, "index_value <= ?"),
        ];
        for (prefix, sql) in cases {
            let frag = NumberHandler::build_sql("n", prefix, dec("7")).unwrap();
            assert_eq!(frag.sql, sql);
            assert_eq!(frag.params, vec![SqlParam::Float(7.0)]);
        }
    }

    #[test]
    fn test_number_ap() {
        let frag = NumberHandler::build_sql("n", SearchPrefix::Ap, dec("100")).unwrap();
        assert_eq!(frag.sql, "index_value >= ? AND index_value <= ?");
        assert_eq!(frag.params, vec![SqlParam::Float(90.0), SqlParam::Float(110.0)]);
    }

    #[test]
    fn test_number_sa_eb_need_decimal_places() {
        assert!(NumberHandler::build_sql("n", SearchPrefix::Sa, dec("5")).is_err());
        let frag = NumberHandler::build_sql("n", SearchPrefix::Eb, dec("5.0")).unwrap();
        assert_eq!(frag.sql, "index_value < ?");
    }
}
