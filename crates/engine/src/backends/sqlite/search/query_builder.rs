//! SQL query builder for declarative searches.
//!
//! Every criterion becomes a subquery over its index table selecting the
//! `resource_uuid`s it matches. Criteria on one parameter combine with
//! `INTERSECT`/`UNION` inside a single `a.resource_uuid IN (...)` test, and
//! those tests combine with the search's own `AND`/`OR`, always inside
//! parentheses. Nested searches add one more test each, selecting the
//! resources referenced by matches of the nested search. Values are bound through anonymous `?` placeholders in
//! the same order as [`SqlFragment::params`].

use chrono::{DateTime, Utc};
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value as SqlValue};

use crate::error::SearchError;
use crate::index::IndexFamily;
use crate::types::{FilterCriterion, NestedSearch, Operation, Search, SearchFilter, SortOrder};

use super::parameter_handlers::{
    DateHandler, NumberHandler, QuantityHandler, ReferenceHandler, StringHandler, TokenHandler,
    UriHandler,
};

/// Columns selected for every matched resource, in row order.
pub const RESOURCE_COLUMNS: &str = "a.resource_uuid, a.resource_type, a.resource_id, \
     a.serialized_resource, a.version_id, a.last_updated_remote, a.last_updated_local";

/// A fragment of SQL with bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    /// The SQL clause.
    pub sql: String,
    /// Bound parameter values, one per `?`.
    pub params: Vec<SqlParam>,
}

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// String parameter.
    String(String),
    /// Integer parameter.
    Integer(i64),
    /// Float parameter.
    Float(f64),
    /// Null parameter.
    Null,
}

impl SqlParam {
    /// Creates a string parameter.
    pub fn string(s: impl Into<String>) -> Self {
        SqlParam::String(s.into())
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::String(s) => ToSqlOutput::from(s.as_str()),
            SqlParam::Integer(i) => ToSqlOutput::from(*i),
            SqlParam::Float(f) => ToSqlOutput::from(*f),
            SqlParam::Null => ToSqlOutput::Owned(SqlValue::Null),
        })
    }
}

impl SqlFragment {
    /// Creates a new SQL fragment.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Creates a fragment with parameters.
    pub fn with_params(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Appends another fragment's SQL and parameters.
    pub fn push(&mut self, other: SqlFragment) {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
    }

    /// Joins fragments with `separator`, keeping parameter order.
    pub fn join(fragments: Vec<SqlFragment>, separator: &str) -> SqlFragment {
        let mut joined = SqlFragment::new("");
        for (i, fragment) in fragments.into_iter().enumerate() {
            if i > 0 {
                joined.sql.push_str(separator);
            }
            joined.push(fragment);
        }
        joined
    }

    /// Returns true if this fragment is empty.
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Builds SQL queries from a [`Search`].
pub struct QueryBuilder<'a> {
    search: &'a Search,
    now: DateTime<Utc>,
}

impl<'a> QueryBuilder<'a> {
    /// Creates a query builder for `search`.
    pub fn new(search: &'a Search) -> Self {
        Self {
            search,
            now: Utc::now(),
        }
    }

    /// Sets the instant the `ap` date prefix is relative to.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Builds the query selecting [`RESOURCE_COLUMNS`] of every match,
    /// sorted and paged as requested.
    pub fn build(&self) -> Result<SqlFragment, SearchError> {
        let mut query = SqlFragment::new(format!("SELECT {RESOURCE_COLUMNS} FROM resources a"));
        query.push(self.build_where()?);
        query.push(self.build_order_by()?);
        query.push(self.build_limit());
        Ok(query)
    }

    /// Builds the query counting every match.
    pub fn build_count(&self) -> Result<SqlFragment, SearchError> {
        let mut query = SqlFragment::new("SELECT COUNT(*) FROM resources a");
        query.push(self.build_where()?);
        Ok(query)
    }

    fn build_where(&self) -> Result<SqlFragment, SearchError> {
        let mut clause = SqlFragment::with_params(
            " WHERE a.resource_type = ?",
            vec![SqlParam::string(&self.search.resource_type)],
        );
        if let Some(mut conditions) = self.build_conditions("a.resource_uuid", 0)? {
            conditions.sql = format!(" AND ({})", conditions.sql);
            clause.push(conditions);
        }
        Ok(clause)
    }

    /// Every filter and nested search as a test on `column`, combined with
    /// the search's operation. `None` when the search has neither.
    fn build_conditions(
        &self,
        column: &str,
        depth: usize,
    ) -> Result<Option<SqlFragment>, SearchError> {
        let mut conditions = self
            .search
            .filters
            .iter()
            .filter(|f| !f.criteria.is_empty())
            .map(|f| self.build_filter(f, column))
            .collect::<Result<Vec<_>, _>>()?;
        for nested in &self.search.nested {
            conditions.push(self.build_nested(nested, column, depth + 1)?);
        }

        if conditions.is_empty() {
            return Ok(None);
        }
        let separator = format!(" {} ", self.search.operation.logical_operator());
        Ok(Some(SqlFragment::join(conditions, &separator)))
    }

    /// `column IN (...)` for one parameter.
    fn build_filter(&self, filter: &SearchFilter, column: &str) -> Result<SqlFragment, SearchError> {
        let (full_text, other): (Vec<_>, Vec<_>) =
            filter.criteria.iter().partition(|c| c.is_full_text());

        let mut subqueries = other
            .into_iter()
            .map(|c| self.build_criterion(&filter.parameter, c))
            .collect::<Result<Vec<_>, _>>()?;

        if !full_text.is_empty() {
            subqueries.push(self.build_full_text(&filter.parameter, &full_text, filter.operation));
        }

        let separator = format!(" {} ", filter.operation.set_operator());
        let mut fragment = SqlFragment::join(subqueries, &separator);
        fragment.sql = format!("{column} IN ({})", fragment.sql);
        Ok(fragment)
    }

    /// `column IN (...)` selecting the resources of this search's type that
    /// a match of the nested search references through its parameter.
    ///
    /// Aliases carry `depth` so nested searches can nest again.
    fn build_nested(
        &self,
        nested: &NestedSearch,
        column: &str,
        depth: usize,
    ) -> Result<SqlFragment, SearchError> {
        let target = format!("n{depth}");
        let referrer = format!("r{depth}");
        let mut fragment = SqlFragment::with_params(
            format!(
                "{column} IN (SELECT {target}.resource_uuid FROM resources {target} \
                 JOIN reference_index {referrer} \
                 ON ({referrer}.index_value = {target}.resource_type || '/' || {target}.resource_id \
                 OR {referrer}.index_value LIKE {target}.resource_type || '/' || {target}.resource_id || '/_history/%') \
                 WHERE {target}.resource_type = ? AND {referrer}.resource_type = ? AND {referrer}.index_name = ?"
            ),
            vec![
                SqlParam::string(&self.search.resource_type),
                SqlParam::string(&nested.search.resource_type),
                SqlParam::string(&nested.parameter),
            ],
        );

        let inner = QueryBuilder {
            search: &nested.search,
            now: self.now,
        };
        if let Some(mut conditions) =
            inner.build_conditions(&format!("{referrer}.resource_uuid"), depth)?
        {
            conditions.sql = format!(" AND ({})", conditions.sql);
            fragment.push(conditions);
        }
        fragment.sql.push(')');
        Ok(fragment)
    }

    fn build_criterion(
        &self,
        parameter: &str,
        criterion: &FilterCriterion,
    ) -> Result<SqlFragment, SearchError> {
        let condition = match criterion {
            FilterCriterion::String { value, modifier } => {
                StringHandler::build_sql(value, *modifier)
            }
            FilterCriterion::Token { system, code } => {
                TokenHandler::build_sql(system.as_deref(), code)
            }
            FilterCriterion::Reference { value } => ReferenceHandler::build_sql(value),
            FilterCriterion::Uri { value } => UriHandler::build_sql(value),
            FilterCriterion::Number { prefix, value } => {
                NumberHandler::build_sql(parameter, *prefix, *value)?
            }
            FilterCriterion::Quantity {
                prefix,
                value,
                system,
                unit,
            } => QuantityHandler::build_sql(
                parameter,
                *prefix,
                *value,
                system.as_deref(),
                unit.as_deref(),
            )?,
            FilterCriterion::Date { prefix, value } => {
                DateHandler::build_sql(*prefix, value, self.now)
            }
        };

        let mut subquery = SqlFragment::with_params(
            format!(
                "SELECT resource_uuid FROM {} WHERE resource_type = ? AND index_name = ? AND (",
                criterion.family().table_name()
            ),
            vec![
                SqlParam::string(&self.search.resource_type),
                SqlParam::string(parameter),
            ],
        );
        subquery.push(condition);
        subquery.sql.push(')');
        Ok(subquery)
    }

    /// One subquery for all full-text criteria of a parameter.
    ///
    /// MATCH takes a single query string, so the criteria combine inside it
    /// with the FTS5 `AND`/`OR` operators rather than in SQL.
    fn build_full_text(
        &self,
        parameter: &str,
        criteria: &[&FilterCriterion],
        operation: Operation,
    ) -> SqlFragment {
        let values = criteria.iter().filter_map(|c| match c {
            FilterCriterion::String { value, .. } => Some(value.as_str()),
            _ => None,
        });
        let expression = StringHandler::fts_match_expression(values, operation.logical_operator());

        SqlFragment::with_params(
            "SELECT s.resource_uuid FROM string_index s \
             JOIN string_index_fts ON string_index_fts.rowid = s.id \
             WHERE s.resource_type = ? AND s.index_name = ? AND string_index_fts MATCH ?",
            vec![
                SqlParam::string(&self.search.resource_type),
                SqlParam::string(parameter),
                SqlParam::String(expression),
            ],
        )
    }

    /// Orders by the lowest (ascending) or highest (descending) indexed
    /// value of the sort parameter, then by insertion order.
    fn build_order_by(&self) -> Result<SqlFragment, SearchError> {
        let Some(sort) = &self.search.sort else {
            return Ok(SqlFragment::new(" ORDER BY a.id ASC"));
        };

        let column = match sort.family {
            IndexFamily::String | IndexFamily::Number => "index_value",
            IndexFamily::Date | IndexFamily::DateTime => "index_from",
            _ => {
                return Err(SearchError::UnsupportedSort {
                    parameter: sort.parameter.clone(),
                });
            }
        };
        let (aggregate, direction) = match sort.order {
            SortOrder::Ascending => ("MIN", "ASC"),
            SortOrder::Descending => ("MAX", "DESC"),
        };

        Ok(SqlFragment::with_params(
            format!(
                " ORDER BY (SELECT {aggregate}(b.{column}) FROM {} b \
                 WHERE b.resource_uuid = a.resource_uuid AND b.index_name = ?) {direction}, a.id ASC",
                sort.family.table_name()
            ),
            vec![SqlParam::string(&sort.parameter)],
        ))
    }

    fn build_limit(&self) -> SqlFragment {
        match (self.search.count, self.search.from) {
            (None, None) => SqlFragment::new(""),
            (Some(count), None) => {
                SqlFragment::with_params(" LIMIT ?", vec![SqlParam::Integer(count.into())])
            }
            (count, Some(from)) => SqlFragment::with_params(
                " LIMIT ? OFFSET ?",
                vec![
                    SqlParam::Integer(count.map(i64::from).unwrap_or(-1)),
                    SqlParam::Integer(from.into()),
                ],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SearchPrefix, SortDirective, StringModifier};
    use rust_decimal::Decimal;

    fn s(value: &str) -> SqlParam {
        SqlParam::string(value)
    }

    #[test]
    fn test_no_filters() {
        let search = Search::new("Patient");
        let query = QueryBuilder::new(&search).build().unwrap();

        assert_eq!(
            query.sql,
            format!("SELECT {RESOURCE_COLUMNS} FROM resources a WHERE a.resource_type = ? ORDER BY a.id ASC")
        );
        assert_eq!(query.params, vec![s("Patient")]);
    }

    #[test]
    fn test_single_token_filter() {
        let search = Search::new("Patient").with_filter(SearchFilter::new(
            "gender",
            vec![FilterCriterion::token(None, "female")],
        ));
        let query = QueryBuilder::new(&search).build_count().unwrap();

        assert_eq!(
            query.sql,
            "SELECT COUNT(*) FROM resources a WHERE a.resource_type = ? AND (a.resource_uuid IN (\
             SELECT resource_uuid FROM token_index WHERE resource_type = ? AND index_name = ? \
             AND (index_value = ?)))"
        );
        assert_eq!(
            query.params,
            vec![s("Patient"), s("Patient"), s("gender"), s("female")]
        );
    }

    #[test]
    fn test_multi_value_filter_is_grouped() {
        // given=Ann OR given=Anne, AND gender=female
        let search = Search::new("Patient")
            .with_filter(
                SearchFilter::new(
                    "given",
                    vec![
                        FilterCriterion::string("Ann", StringModifier::MatchesExactly),
                        FilterCriterion::string("Anne", StringModifier::MatchesExactly),
                    ],
                )
                .with_operation(Operation::Or),
            )
            .with_filter(SearchFilter::new(
                "gender",
                vec![FilterCriterion::token(Some("urn:g"), "female")],
            ));
        let query = QueryBuilder::new(&search).build_count().unwrap();

        assert_eq!(
            query.sql,
            "SELECT COUNT(*) FROM resources a WHERE a.resource_type = ? AND (\
             a.resource_uuid IN (\
             SELECT resource_uuid FROM string_index WHERE resource_type = ? AND index_name = ? AND (index_value = ?) \
             UNION \
             SELECT resource_uuid FROM string_index WHERE resource_type = ? AND index_name = ? AND (index_value = ?)) \
             AND a.resource_uuid IN (\
             SELECT resource_uuid FROM token_index WHERE resource_type = ? AND index_name = ? \
             AND (index_value = ? AND IFNULL(index_system, '') = ?)))"
        );
        assert_eq!(
            query.params,
            vec![
                s("Patient"),
                s("Patient"),
                s("given"),
                s("Ann"),
                s("Patient"),
                s("given"),
                s("Anne"),
                s("Patient"),
                s("gender"),
                s("female"),
                s("urn:g"),
            ]
        );
        assert_eq!(query.sql.matches('?').count(), query.params.len());
    }

    #[test]
    fn test_or_search_keeps_parentheses() {
        let search = Search::new("Observation")
            .with_operation(Operation::Or)
            .with_filter(SearchFilter::new(
                "subject",
                vec![FilterCriterion::reference("Patient/p1")],
            ))
            .with_filter(SearchFilter::new(
                "value-quantity",
                vec![FilterCriterion::quantity(
                    SearchPrefix::Gt,
                    Decimal::new(5, 0),
                    None,
                    Some("mg"),
                )],
            ));
        let query = QueryBuilder::new(&search).build_count().unwrap();

        assert!(query.sql.contains("AND (a.resource_uuid IN ("));
        assert!(query.sql.contains(")) OR a.resource_uuid IN ("));
        assert!(query.sql.ends_with("index_value > ?)))"));
        assert_eq!(
            query.params,
            vec![
                s("Observation"),
                s("Observation"),
                s("subject"),
                s("Patient/p1"),
                s("Observation"),
                s("value-quantity"),
                s("mg"),
                s("mg"),
                SqlParam::Float(5.0),
            ]
        );
    }

    #[test]
    fn test_date_filter_uses_table_per_value_kind() {
        let search = Search::new("Observation").with_filter(SearchFilter::new(
            "date",
            vec![
                FilterCriterion::date(SearchPrefix::Ge, "2020-01-01").unwrap(),
                FilterCriterion::date(SearchPrefix::Lt, "2020-06-01T00:00:00Z").unwrap(),
            ],
        ).with_operation(Operation::And));
        let query = QueryBuilder::new(&search).build_count().unwrap();

        assert!(query.sql.contains("FROM date_index WHERE"));
        assert!(query.sql.contains(" INTERSECT SELECT resource_uuid FROM date_time_index WHERE"));
        assert_eq!(query.sql.matches('?').count(), query.params.len());
        assert_eq!(query.params[3], SqlParam::Integer(18262));
    }

    #[test]
    fn test_uri_and_number_filters() {
        let search = Search::new("Questionnaire")
            .with_filter(SearchFilter::new(
                "url",
                vec![FilterCriterion::uri("http://example.org/q")],
            ))
            .with_filter(SearchFilter::new(
                "version",
                vec![FilterCriterion::number(SearchPrefix::Le, Decimal::new(3, 0))],
            ));
        let query = QueryBuilder::new(&search).build_count().unwrap();

        assert!(query.sql.contains("FROM uri_index WHERE"));
        assert!(query.sql.contains("FROM number_index WHERE"));
        assert_eq!(query.params[3], s("http://example.org/q"));
        assert_eq!(query.params[6], SqlParam::Float(3.0));
    }

    #[test]
    fn test_full_text_criteria_share_one_match() {
        let search = Search::new("Patient").with_filter(
            SearchFilter::new(
                "name",
                vec![
                    FilterCriterion::string("ann", StringModifier::MatchesFts),
                    FilterCriterion::string("bob", StringModifier::MatchesFts),
                    FilterCriterion::string("Car", StringModifier::StartsWith),
                ],
            )
            .with_operation(Operation::Or),
        );
        let query = QueryBuilder::new(&search).build_count().unwrap();

        assert_eq!(query.sql.matches("MATCH ?").count(), 1);
        assert!(query.sql.contains("JOIN string_index_fts ON string_index_fts.rowid = s.id"));
        assert_eq!(
            query.params,
            vec![
                s("Patient"),
                s("Patient"),
                s("name"),
                s("Car"),
                s("Patient"),
                s("name"),
                s("\"ann\" OR \"bob\""),
            ]
        );
    }

    #[test]
    fn test_nested_search() {
        // Patients with a heart-rate observation, and female
        let search = Search::new("Patient")
            .with_filter(SearchFilter::new(
                "gender",
                vec![FilterCriterion::token(None, "female")],
            ))
            .with_nested(
                "subject",
                Search::new("Observation").with_filter(SearchFilter::new(
                    "code",
                    vec![FilterCriterion::token(Some("http://loinc.org"), "8867-4")],
                )),
            );
        let query = QueryBuilder::new(&search).build_count().unwrap();

        assert_eq!(
            query.sql,
            "SELECT COUNT(*) FROM resources a WHERE a.resource_type = ? AND (\
             a.resource_uuid IN (\
             SELECT resource_uuid FROM token_index WHERE resource_type = ? AND index_name = ? \
             AND (index_value = ?)) \
             AND a.resource_uuid IN (SELECT n1.resource_uuid FROM resources n1 \
             JOIN reference_index r1 \
             ON (r1.index_value = n1.resource_type || '/' || n1.resource_id \
             OR r1.index_value LIKE n1.resource_type || '/' || n1.resource_id || '/_history/%') \
             WHERE n1.resource_type = ? AND r1.resource_type = ? AND r1.index_name = ? \
             AND (r1.resource_uuid IN (\
             SELECT resource_uuid FROM token_index WHERE resource_type = ? AND index_name = ? \
             AND (index_value = ? AND IFNULL(index_system, '') = ?)))))"
        );
        assert_eq!(
            query.params,
            vec![
                s("Patient"),
                s("Patient"),
                s("gender"),
                s("female"),
                s("Patient"),
                s("Observation"),
                s("subject"),
                s("Observation"),
                s("code"),
                s("8867-4"),
                s("http://loinc.org"),
            ]
        );
    }

    #[test]
    fn test_nested_search_without_filters_and_twice_nested() {
        // Practitioners referenced by a patient who has any encounter
        let search = Search::new("Practitioner").with_nested(
            "general-practitioner",
            Search::new("Patient").with_nested("subject", Search::new("Encounter")),
        );
        let query = QueryBuilder::new(&search).build_count().unwrap();

        assert!(query.sql.contains("FROM resources n1 JOIN reference_index r1"));
        assert!(query.sql.contains("AND (r1.resource_uuid IN (SELECT n2.resource_uuid FROM resources n2"));
        assert!(query.sql.ends_with("r2.index_name = ?))))"));
        assert_eq!(query.sql.matches('?').count(), query.params.len());
        assert_eq!(
            &query.params[1..],
            &[
                s("Practitioner"),
                s("Patient"),
                s("general-practitioner"),
                s("Patient"),
                s("Encounter"),
                s("subject"),
            ]
        );
    }

    #[test]
    fn test_sort_and_paging() {
        let search = Search::new("Patient")
            .with_sort(SortDirective::new("birthdate", IndexFamily::Date, SortOrder::Descending))
            .with_count(10)
            .with_from(20);
        let query = QueryBuilder::new(&search).build().unwrap();

        assert!(query.sql.contains(
            "ORDER BY (SELECT MAX(b.index_from) FROM date_index b \
             WHERE b.resource_uuid = a.resource_uuid AND b.index_name = ?) DESC, a.id ASC"
        ));
        assert!(query.sql.ends_with(" LIMIT ? OFFSET ?"));
        assert_eq!(
            query.params,
            vec![
                s("Patient"),
                s("birthdate"),
                SqlParam::Integer(10),
                SqlParam::Integer(20)
            ]
        );
    }

    #[test]
    fn test_offset_without_count() {
        let search = Search::new("Patient").with_from(5);
        let query = QueryBuilder::new(&search).build().unwrap();
        assert_eq!(
            &query.params[1..],
            &[SqlParam::Integer(-1), SqlParam::Integer(5)]
        );
    }

    #[test]
    fn test_unsupported_sort() {
        let search = Search::new("Patient").with_sort(SortDirective::new(
            "gender",
            IndexFamily::Token,
            SortOrder::Ascending,
        ));
        assert!(matches!(
            QueryBuilder::new(&search).build(),
            Err(SearchError::UnsupportedSort { .. })
        ));
    }

    #[test]
    fn test_invalid_number_prefix_is_reported() {
        let search = Search::new("RiskAssessment").with_filter(SearchFilter::new(
            "probability",
            vec![FilterCriterion::number(SearchPrefix::Sa, Decimal::new(1, 0))],
        ));
        assert!(matches!(
            QueryBuilder::new(&search).build(),
            Err(SearchError::InvalidFilter { .. })
        ));
    }
}
