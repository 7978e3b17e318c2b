//! URI parameter SQL handler.

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles URI parameter SQL generation.
pub struct UriHandler;

impl UriHandler {
    /// Builds SQL for an exact URI match.
    pub fn build_sql(uri: &str) -> SqlFragment {
        SqlFragment::with_params("index_value = ?", vec![SqlParam::string(uri)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri() {
        let frag = UriHandler::build_sql("http://example.org/profile");

        assert_eq!(frag.sql, "index_value = ?");
        assert_eq!(
            frag.params,
            vec![SqlParam::string("http://example.org/profile")]
        );
    }
}
