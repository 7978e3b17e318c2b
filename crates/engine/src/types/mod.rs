//! Core types for the engine.
//!
//! - [`ResourceRecord`] - a stored resource with its sync markers
//! - [`LocalChange`], [`SquashedLocalChange`] - journal records
//! - [`Search`], [`SearchFilter`], [`FilterCriterion`] - declarative search, also
//!   translated from x-fhir-query strings by [`Search::from_query_string`]
//! - [`FhirDate`], [`FhirDateTime`] - partial-precision dates and their ranges

mod date;
mod local_change;
mod query;
mod resource;
mod search;

pub use date::{DatePrecision, DateTimePrecision, FhirDate, FhirDateTime, epoch_day};
pub use local_change::{LocalChange, LocalChangeToken, LocalChangeType, SquashedLocalChange};
pub use resource::{
    ResourceRecord, meta_last_updated, meta_version_id, resource_id_of, resource_type_of,
};
pub use search::{
    DateFilterValue, FilterCriterion, NestedSearch, Operation, Search, SearchFilter,
    SearchPrefix, SortDirective, SortOrder, StringModifier,
};
