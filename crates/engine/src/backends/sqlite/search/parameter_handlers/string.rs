//! String parameter SQL handler.

use crate::types::StringModifier;

use super::super::query_builder::{SqlFragment, SqlParam};

/// Handles string parameter SQL generation.
pub struct StringHandler;

impl StringHandler {
    /// Builds SQL for a string value.
    ///
    /// Default behavior is case-insensitive prefix match. Full-text criteria
    /// are not handled here; see [`StringHandler::fts_match_expression`].
    pub fn build_sql(value: &str, modifier: StringModifier) -> SqlFragment {
        match modifier {
            StringModifier::MatchesExactly => {
                SqlFragment::with_params("index_value = ?", vec![SqlParam::string(value)])
            }
            StringModifier::Contains => SqlFragment::with_params(
                "index_value LIKE '%' || ? || '%' ESCAPE '\\' COLLATE NOCASE",
                vec![SqlParam::string(Self::escape_like(value))],
            ),
            StringModifier::StartsWith | StringModifier::MatchesFts => SqlFragment::with_params(
                "index_value LIKE ? || '%' ESCAPE '\\' COLLATE NOCASE",
                vec![SqlParam::string(Self::escape_like(value))],
            ),
        }
    }

    /// Builds one FTS5 MATCH expression from several values.
    ///
    /// Every value becomes a quoted phrase so FTS5 operators inside user
    /// input are taken literally.
    pub fn fts_match_expression<'a>(
        values: impl IntoIterator<Item = &'a str>,
        operator: &str,
    ) -> String {
        values
            .into_iter()
            .map(|v| format!("\"{}\"", v.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(&format!(" {operator} "))
    }

    fn escape_like(value: &str) -> String {
        let mut escaped = String::with_capacity(value.len());
        for c in value.chars() {
            if matches!(c, '%' | '_' | '\\') {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        escaped
    }
}
