//! Quantity parameter SQL handler.

use rust_decimal::Decimal;

use crate::error::SearchError;
use crate::types::SearchPrefix;

use super::NumberHandler;
use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles quantity parameter SQL generation.
pub struct QuantityHandler;

impl QuantityHandler {
    /// Builds SQL for a quantity value.
    ///
    /// With a system the unit must equal the stored code; without one it may
    /// equal either the stored code or the human-readable unit. The value
    /// comparison follows [`NumberHandler`].
    pub fn build_sql(
        parameter: &str,
        prefix: SearchPrefix,
        value: Decimal,
        system: Option<&str>,
        unit: Option<&str>,
    ) -> Result<SqlFragment, SearchError> {
        let mut frag = SqlFragment::new("");
        let mut parts = Vec::new();

        if let Some(system) = system {
            parts.push("index_system = ?");
            frag.params.push(SqlParam::string(system));
        }
        if let Some(unit) = unit {
            if system.is_some() {
                parts.push("index_code = ?");
                frag.params.push(SqlParam::string(unit));
            } else {
                parts.push("(index_code = ? OR index_unit = ?)");
                frag.params.push(SqlParam::string(unit));
                frag.params.push(SqlParam::string(unit));
            }
        }

        let number = NumberHandler::build_sql(parameter, prefix, value)?;
        parts.push(&number.sql);
        frag.sql = parts.join(" AND ");
        frag.params.extend(number.params.iter().cloned());
        Ok(frag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_system_and_code() {
        let frag = QuantityHandler::build_sql(
            "value-quantity",
            SearchPrefix::Gt,
            Decimal::new(5, 0),
            Some("http://unitsofmeasure.org"),
            Some("mg"),
        )
        .unwrap();

        assert_eq!(frag.sql, "index_system = ? AND index_code = ? AND index_value > ?");
        assert_eq!(
            frag.params,
            vec![
                SqlParam::string("http://unitsofmeasure.org"),
                SqlParam::string("mg"),
                SqlParam::Float(5.0),
            ]
        );
    }

    #[test]
    fn test_quantity_unit_without_system() {
        let frag = QuantityHandler::build_sql(
            "value-quantity",
            SearchPrefix::Le,
            Decimal::new(5, 0),
            None,
            Some("mg"),
        )
        .unwrap();

        assert_eq!(
            frag.sql,
            "(index_code = ? OR index_unit = ?) AND index_value <= ?"
        );
        assert_eq!(frag.params.len(), 3);
    }

    #[test]
    fn test_quantity_value_only() {
        let frag = QuantityHandler::build_sql(
            "value-quantity",
            SearchPrefix::Eq,
            Decimal::new(5, 0),
            None,
            None,
        )
        .unwrap();

        assert_eq!(frag.sql, "index_value >= ? AND index_value < ?");
        assert_eq!(frag.params, vec![SqlParam::Float(4.5), SqlParam::Float(5.5)]);
    }
}
