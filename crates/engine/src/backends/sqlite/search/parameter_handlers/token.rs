//! Token parameter SQL handler.

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles token parameter SQL generation.
pub struct TokenHandler;

impl TokenHandler {
    /// Builds SQL for a token value.
    ///
    /// With a system, rows stored without one compare as the empty string,
    /// so `system|code` with an empty system matches system-less codes.
    /// Without a system any system matches.
    pub fn build_sql(system: Option<&str>, code: &str) -> SqlFragment {
        match system {
            Some(system) => SqlFragment::with_params(
                "index_value = ? AND IFNULL(index_system, '') = ?",
                vec![SqlParam::string(code), SqlParam::string(system)],
            ),
            None => SqlFragment::with_params("index_value = ?", vec![SqlParam::string(code)]),
        }
    }
}
