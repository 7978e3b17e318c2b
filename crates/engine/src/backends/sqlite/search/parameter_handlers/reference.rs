//! Reference parameter SQL handler.

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles reference parameter SQL generation.
pub struct ReferenceHandler;

impl ReferenceHandler {
    /// Builds SQL for an exact `Type/id` reference.
    pub fn build_sql(reference: &str) -> SqlFragment {
        SqlFragment::with_params("index_value = ?", vec![SqlParam::string(reference)])
    }
}
