//! Declarative search filters.
//!
//! A [`Search`] holds one [`SearchFilter`] per search parameter. Each filter
//! carries one or more [`FilterCriterion`] values for that parameter and the
//! operation combining them; the filters themselves are combined with the
//! search's own operation.
//!
//! ```
//! use helios_engine::types::{FilterCriterion, Operation, Search, SearchFilter, StringModifier};
//!
//! let search = Search::new("Patient")
//!     .with_filter(SearchFilter::new(
//!         "gender",
//!         vec![FilterCriterion::token(None, "female")],
//!     ))
//!     .with_filter(
//!         SearchFilter::new(
//!             "name",
//!             vec![
//!                 FilterCriterion::string("Ann", StringModifier::StartsWith),
//!                 FilterCriterion::string("Anne", StringModifier::StartsWith),
//!             ],
//!         )
//!         .with_operation(Operation::Or),
//!     )
//!     .with_count(20);
//!
//! assert_eq!(search.filters.len(), 2);
//! ```

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::index::IndexFamily;
use crate::types::date::{FhirDate, FhirDateTime};

/// Boolean combination of criteria or filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// All must match.
    #[default]
    And,
    /// Any may match.
    Or,
}

impl Operation {
    /// SQL boolean operator.
    pub fn logical_operator(&self) -> &'static str {
        match self {
            Operation::And => "AND",
            Operation::Or => "OR",
        }
    }

    /// SQL compound-select operator combining result sets.
    pub fn set_operator(&self) -> &'static str {
        match self {
            Operation::And => "INTERSECT",
            Operation::Or => "UNION",
        }
    }
}

/// Comparison prefixes for ordered values.
///
/// See: https://build.fhir.org/search.html#prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchPrefix {
    /// Equal (default).
    #[default]
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Less than.
    Lt,
    /// Greater than or equal.
    Ge,
    /// Less than or equal.
    Le,
    /// Starts after.
    Sa,
    /// Ends before.
    Eb,
    /// Approximately equal.
    Ap,
}

impl fmt::Display for SearchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchPrefix::Eq => "eq",
            SearchPrefix::Ne => "ne",
            SearchPrefix::Gt => "gt",
            SearchPrefix::Lt => "lt",
            SearchPrefix::Ge => "ge",
            SearchPrefix::Le => "le",
            SearchPrefix::Sa => "sa",
            SearchPrefix::Eb => "eb",
            SearchPrefix::Ap => "ap",
        };
        f.write_str(s)
    }
}

impl FromStr for SearchPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eq" => Ok(SearchPrefix::Eq),
            "ne" => Ok(SearchPrefix::Ne),
            "gt" => Ok(SearchPrefix::Gt),
            "lt" => Ok(SearchPrefix::Lt),
            "ge" => Ok(SearchPrefix::Ge),
            "le" => Ok(SearchPrefix::Le),
            "sa" => Ok(SearchPrefix::Sa),
            "eb" => Ok(SearchPrefix::Eb),
            "ap" => Ok(SearchPrefix::Ap),
            _ => Err(format!("unknown search prefix: {}", s)),
        }
    }
}

impl SearchPrefix {
    /// Extracts a prefix from the beginning of a value string.
    ///
    /// Returns the prefix and the remaining value.
    pub fn extract(value: &str) -> (Self, &str) {
        if let Some(prefix) = value.get(..2) {
            if let Ok(p) = prefix.parse() {
                return (p, &value[2..]);
            }
        }
        (SearchPrefix::Eq, value)
    }
}

/// String matching modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringModifier {
    /// Case-insensitive prefix match.
    #[default]
    StartsWith,
    /// Exact, case-sensitive equality.
    MatchesExactly,
    /// Case-insensitive substring match.
    Contains,
    /// Full-text match against the FTS index.
    MatchesFts,
}

/// A date search value; picks the date or the date-time index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateFilterValue {
    /// Day-precision value, searched in `date_index`.
    Date(FhirDate),
    /// Instant-precision value, searched in `date_time_index`.
    DateTime(FhirDateTime),
}

impl DateFilterValue {
    /// Parses a value, choosing date-time when a time part is present.
    pub fn parse(value: &str) -> Option<Self> {
        if value.contains('T') {
            FhirDateTime::parse(value).map(DateFilterValue::DateTime)
        } else {
            FhirDate::parse(value).map(DateFilterValue::Date)
        }
    }
}

/// One criterion on one search parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterCriterion {
    /// Match against `string_index`.
    String {
        value: String,
        modifier: StringModifier,
    },
    /// Match against `token_index`; code-only when `system` is absent.
    Token {
        system: Option<String>,
        code: String,
    },
    /// Exact `Type/id` match against `reference_index`.
    Reference { value: String },
    /// Exact match against `uri_index`.
    Uri { value: String },
    /// Compare against `number_index`.
    Number { prefix: SearchPrefix, value: Decimal },
    /// Compare against `quantity_index`.
    Quantity {
        prefix: SearchPrefix,
        value: Decimal,
        system: Option<String>,
        unit: Option<String>,
    },
    /// Range comparison against `date_index` or `date_time_index`.
    Date {
        prefix: SearchPrefix,
        value: DateFilterValue,
    },
}

impl FilterCriterion {
    /// String criterion.
    pub fn string(value: impl Into<String>, modifier: StringModifier) -> Self {
        FilterCriterion::String {
            value: value.into(),
            modifier,
        }
    }

    /// Token criterion.
    pub fn token(system: Option<&str>, code: impl Into<String>) -> Self {
        FilterCriterion::Token {
            system: system.map(String::from),
            code: code.into(),
        }
    }

    /// Reference criterion (`Type/id`).
    pub fn reference(value: impl Into<String>) -> Self {
        FilterCriterion::Reference {
            value: value.into(),
        }
    }

    /// Uri criterion.
    pub fn uri(value: impl Into<String>) -> Self {
        FilterCriterion::Uri {
            value: value.into(),
        }
    }

    /// Number criterion.
    pub fn number(prefix: SearchPrefix, value: Decimal) -> Self {
        FilterCriterion::Number { prefix, value }
    }

    /// Quantity criterion.
    pub fn quantity(
        prefix: SearchPrefix,
        value: Decimal,
        system: Option<&str>,
        unit: Option<&str>,
    ) -> Self {
        FilterCriterion::Quantity {
            prefix,
            value,
            system: system.map(String::from),
            unit: unit.map(String::from),
        }
    }

    /// Date criterion parsed from a FHIR date or dateTime string.
    pub fn date(prefix: SearchPrefix, value: &str) -> Option<Self> {
        DateFilterValue::parse(value).map(|value| FilterCriterion::Date { prefix, value })
    }

    /// The index family this criterion reads.
    pub fn family(&self) -> IndexFamily {
        match self {
            FilterCriterion::String { .. } => IndexFamily::String,
            FilterCriterion::Token { .. } => IndexFamily::Token,
            FilterCriterion::Reference { .. } => IndexFamily::Reference,
            FilterCriterion::Uri { .. } => IndexFamily::Uri,
            FilterCriterion::Number { .. } => IndexFamily::Number,
            FilterCriterion::Quantity { .. } => IndexFamily::Quantity,
            FilterCriterion::Date {
                value: DateFilterValue::Date(_),
                ..
            } => IndexFamily::Date,
            FilterCriterion::Date {
                value: DateFilterValue::DateTime(_),
                ..
            } => IndexFamily::DateTime,
        }
    }

    /// Returns true for full-text string criteria.
    pub fn is_full_text(&self) -> bool {
        matches!(
            self,
            FilterCriterion::String {
                modifier: StringModifier::MatchesFts,
                ..
            }
        )
    }
}

/// All criteria for one search parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// The search parameter name (e.g. `gender`).
    pub parameter: String,
    /// Values to match.
    pub criteria: Vec<FilterCriterion>,
    /// How the criteria combine. Defaults to OR, like comma-separated values.
    pub operation: Operation,
}

impl SearchFilter {
    /// Creates a filter whose criteria are OR-combined.
    pub fn new(parameter: impl Into<String>, criteria: Vec<FilterCriterion>) -> Self {
        Self {
            parameter: parameter.into(),
            criteria,
            operation: Operation::Or,
        }
    }

    /// Sets the combining operation.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }
}

/// Sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending order.
    #[default]
    Ascending,
    /// Descending order.
    Descending,
}

/// Sort by the values of one indexed parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDirective {
    /// The parameter to sort by.
    pub parameter: String,
    /// The index family holding the parameter's values.
    pub family: IndexFamily,
    /// The sort order.
    pub order: SortOrder,
}

impl SortDirective {
    /// Creates a sort directive.
    pub fn new(parameter: impl Into<String>, family: IndexFamily, order: SortOrder) -> Self {
        Self {
            parameter: parameter.into(),
            family,
            order,
        }
    }
}

/// A reverse-chained condition: keep resources that some resource of
/// another type references through `parameter`, where that referrer
/// matches `search`.
///
/// `Patient` with a nested `Observation` search on `subject` and
/// `code=8867-4` finds the patients that have a heart-rate observation.
/// Only the filters and nested searches of the inner search apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedSearch {
    /// Reference parameter on the referring type (e.g. `subject`).
    pub parameter: String,
    /// Search over the referring type.
    pub search: Search,
}

/// A complete search over one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Search {
    /// The resource type being searched.
    pub resource_type: String,
    /// One filter per parameter.
    pub filters: Vec<SearchFilter>,
    /// Reverse-chained conditions, combined with the filters.
    #[serde(default)]
    pub nested: Vec<NestedSearch>,
    /// How the filters combine.
    pub operation: Operation,
    /// Optional ordering.
    pub sort: Option<SortDirective>,
    /// Maximum number of results.
    pub count: Option<u32>,
    /// Number of results to skip.
    pub from: Option<u32>,
}

impl Search {
    /// Creates an unfiltered search.
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            filters: Vec::new(),
            nested: Vec::new(),
            operation: Operation::And,
            sort: None,
            count: None,
            from: None,
        }
    }

    /// Adds a filter.
    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds a reverse-chained condition over resources referring to this
    /// type through `parameter`.
    pub fn with_nested(mut self, parameter: impl Into<String>, search: Search) -> Self {
        self.nested.push(NestedSearch {
            parameter: parameter.into(),
            search,
        });
        self
    }

    /// Returns the first parameter with full-text criteria, nested
    /// searches included.
    pub fn full_text_parameter(&self) -> Option<&str> {
        self.filters
            .iter()
            .find(|f| f.criteria.iter().any(FilterCriterion::is_full_text))
            .map(|f| f.parameter.as_str())
            .or_else(|| {
                self.nested
                    .iter()
                    .find_map(|n| n.search.full_text_parameter())
            })
    }

    /// Sets how filters combine.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    /// Sets the sort.
    pub fn with_sort(mut self, sort: SortDirective) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Sets the result limit.
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Sets the offset.
    pub fn with_from(mut self, from: u32) -> Self {
        self.from = Some(from);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_extract() {
        assert_eq!(SearchPrefix::extract("ge2020"), (SearchPrefix::Ge, "2020"));
        assert_eq!(SearchPrefix::extract("2020"), (SearchPrefix::Eq, "2020"));
        assert_eq!(SearchPrefix::extract("5"), (SearchPrefix::Eq, "5"));
    }

    #[test]
    fn test_date_criterion_family() {
        let date = FilterCriterion::date(SearchPrefix::Eq, "2020-01-01").unwrap();
        let date_time = FilterCriterion::date(SearchPrefix::Eq, "2020-01-01T10:00:00Z").unwrap();
        assert_eq!(date.family(), IndexFamily::Date);
        assert_eq!(date_time.family(), IndexFamily::DateTime);
        assert!(FilterCriterion::date(SearchPrefix::Eq, "yesterday").is_none());
    }

    #[test]
    fn test_operation_sql() {
        assert_eq!(Operation::And.set_operator(), "INTERSECT");
        assert_eq!(Operation::Or.logical_operator(), "OR");
    }

    #[test]
    fn test_full_text_parameter_looks_into_nested_searches() {
        let plain = Search::new("Patient").with_filter(SearchFilter::new(
            "name",
            vec![FilterCriterion::string("ann", StringModifier::StartsWith)],
        ));
        assert_eq!(plain.full_text_parameter(), None);

        let nested = plain.with_nested(
            "subject",
            Search::new("Observation").with_filter(SearchFilter::new(
                "note",
                vec![FilterCriterion::string("fever", StringModifier::MatchesFts)],
            )),
        );
        assert_eq!(nested.full_text_parameter(), Some("note"));
    }

    #[test]
    fn test_filter_defaults_to_or() {
        let filter = SearchFilter::new("name", vec![]);
        assert_eq!(filter.operation, Operation::Or);
        assert_eq!(Search::new("Patient").operation, Operation::And);
    }
}
