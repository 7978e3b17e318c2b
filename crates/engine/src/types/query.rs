//! x-fhir-query translation.
//!
//! Turns a FHIR search string such as
//! `Patient?gender=female&name:exact=Ann,Anne&_sort=-birthdate&_count=10`
//! into a [`Search`], using search parameter definitions to decide how each
//! value is read.

use rust_decimal::Decimal;
use url::form_urlencoded;

use crate::error::SearchError;
use crate::index::{IndexFamily, SearchParamDefinition, SearchParamType};

use super::search::{
    FilterCriterion, Search, SearchFilter, SearchPrefix, SortDirective, SortOrder, StringModifier,
};

const SORT_PARAM: &str = "_sort";
const COUNT_PARAM: &str = "_count";

impl Search {
    /// Translates an x-fhir-query string.
    ///
    /// Parameters are resolved against `definitions` for the query's
    /// resource type. Comma-separated values of one parameter match any of
    /// them; repeated parameters must all match. Number, date and quantity
    /// values take FHIR prefixes (`ge2020-01-01`), tokens take
    /// `system|code`, quantities take `value|system|code`, and string
    /// parameters take the `:exact`, `:contains` and `:text` modifiers.
    /// Parameters without a value are skipped. `_sort` uses its first key.
    ///
    /// ```
    /// use helios_engine::index::SearchParamIndexer;
    /// use helios_engine::types::{Search, SortOrder};
    ///
    /// let indexer = SearchParamIndexer::with_defaults();
    /// let search = Search::from_query_string(
    ///     "Patient?gender=female&active=&_sort=-birthdate&_count=10",
    ///     indexer.definitions(),
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(search.filters.len(), 1);
    /// assert_eq!(search.count, Some(10));
    /// assert_eq!(search.sort.unwrap().order, SortOrder::Descending);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::InvalidQuery`] for a malformed resource type or
    /// `_count`, [`SearchError::InvalidFilter`] for an unknown parameter,
    /// modifier or value, and [`SearchError::UnsupportedSort`] for a sort on
    /// a parameter that has no order.
    pub fn from_query_string(
        query: &str,
        definitions: &[SearchParamDefinition],
    ) -> Result<Self, SearchError> {
        let (resource_type, params) = query.split_once('?').unwrap_or((query, ""));
        let valid_type = resource_type.starts_with(|c: char| c.is_ascii_uppercase())
            && resource_type.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid_type {
            return Err(invalid_query(
                query,
                format!("'{resource_type}' is not a resource type"),
            ));
        }

        let mut search = Search::new(resource_type);
        for (name, value) in form_urlencoded::parse(params.as_bytes()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match name.as_ref() {
                COUNT_PARAM => {
                    let count = value
                        .parse()
                        .map_err(|_| invalid_query(query, format!("invalid _count '{value}'")))?;
                    search.count = Some(count);
                }
                SORT_PARAM => {
                    search.sort = parse_sort(resource_type, value, definitions)?;
                }
                _ => search
                    .filters
                    .push(parse_filter(resource_type, &name, value, definitions)?),
            }
        }
        Ok(search)
    }
}

fn invalid_query(query: &str, message: String) -> SearchError {
    SearchError::InvalidQuery {
        query: query.to_string(),
        message,
    }
}

fn invalid_filter(parameter: &str, message: String) -> SearchError {
    SearchError::InvalidFilter {
        parameter: parameter.to_string(),
        message,
    }
}

fn find_definition<'a>(
    resource_type: &str,
    parameter: &str,
    definitions: &'a [SearchParamDefinition],
) -> Result<&'a SearchParamDefinition, SearchError> {
    definitions
        .iter()
        .find(|d| d.name == parameter && d.applies_to(resource_type))
        .ok_or_else(|| invalid_filter(parameter, format!("not a search parameter of {resource_type}")))
}

fn parse_filter(
    resource_type: &str,
    name: &str,
    value: &str,
    definitions: &[SearchParamDefinition],
) -> Result<SearchFilter, SearchError> {
    let (parameter, modifier) = match name.split_once(':') {
        Some((parameter, modifier)) => (parameter, Some(modifier)),
        None => (name, None),
    };
    let definition = find_definition(resource_type, parameter, definitions)?;

    let string_modifier = match (definition.param_type, modifier) {
        (SearchParamType::Special, _) => {
            return Err(invalid_filter(
                parameter,
                "special parameters cannot be queried".to_string(),
            ));
        }
        (_, None) => StringModifier::StartsWith,
        (SearchParamType::String, Some("exact")) => StringModifier::MatchesExactly,
        (SearchParamType::String, Some("contains")) => StringModifier::Contains,
        (SearchParamType::String, Some("text")) => StringModifier::MatchesFts,
        (_, Some(modifier)) => {
            return Err(invalid_filter(
                parameter,
                format!("unsupported modifier ':{modifier}'"),
            ));
        }
    };

    let criteria = value
        .split(',')
        .filter(|v| !v.is_empty())
        .map(|v| {
            parse_criterion(definition.param_type, v, string_modifier).ok_or_else(|| {
                invalid_filter(
                    parameter,
                    format!("'{v}' is not a valid {} value", definition.param_type),
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SearchFilter::new(parameter, criteria))
}

fn parse_criterion(
    param_type: SearchParamType,
    value: &str,
    modifier: StringModifier,
) -> Option<FilterCriterion> {
    match param_type {
        SearchParamType::String => Some(FilterCriterion::string(value, modifier)),
        SearchParamType::Token => Some(match value.split_once('|') {
            Some((system, code)) => {
                FilterCriterion::token(Some(system).filter(|s| !s.is_empty()), code)
            }
            None => FilterCriterion::token(None, value),
        }),
        SearchParamType::Reference => Some(FilterCriterion::reference(value)),
        SearchParamType::Uri => Some(FilterCriterion::uri(value)),
        SearchParamType::Number => {
            let (prefix, number) = SearchPrefix::extract(value);
            let number = number.parse::<Decimal>().ok()?;
            Some(FilterCriterion::number(prefix, number))
        }
        SearchParamType::Date => {
            let (prefix, date) = SearchPrefix::extract(value);
            FilterCriterion::date(prefix, date)
        }
        SearchParamType::Quantity => {
            let (prefix, rest) = SearchPrefix::extract(value);
            let mut parts = rest.splitn(3, '|');
            let number = parts.next()?.parse::<Decimal>().ok()?;
            let system = parts.next().filter(|s| !s.is_empty());
            let code = parts.next().filter(|s| !s.is_empty());
            Some(FilterCriterion::quantity(prefix, number, system, code))
        }
        SearchParamType::Special => None,
    }
}

fn parse_sort(
    resource_type: &str,
    value: &str,
    definitions: &[SearchParamDefinition],
) -> Result<Option<SortDirective>, SearchError> {
    let Some(key) = value.split(',').map(str::trim).find(|k| !k.is_empty()) else {
        return Ok(None);
    };
    let (parameter, order) = match key.strip_prefix('-') {
        Some(parameter) => (parameter, SortOrder::Descending),
        None => (key, SortOrder::Ascending),
    };
    let definition = find_definition(resource_type, parameter, definitions)?;

    let family = match definition.param_type {
        SearchParamType::String => IndexFamily::String,
        SearchParamType::Number => IndexFamily::Number,
        // lastUpdated is always an instant; other dates sort by day
        SearchParamType::Date if parameter == "_lastUpdated" => IndexFamily::DateTime,
        SearchParamType::Date => IndexFamily::Date,
        _ => {
            return Err(SearchError::UnsupportedSort {
                parameter: parameter.to_string(),
            });
        }
    };
    Ok(Some(SortDirective::new(parameter, family, order)))
}
