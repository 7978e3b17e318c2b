//! Path-based index extraction.

use serde_json::Value;

use super::converters::ValueConverter;
use super::definitions::{SearchParamDefinition, default_definitions};
use super::{IndexEntry, ResourceIndexer};
use crate::error::StorageResult;
use crate::types::resource_type_of;

/// Indexes resources from a set of [`SearchParamDefinition`]s.
///
/// Paths are dotted element names starting with the resource type
/// (`Patient.name.given`). Arrays are flattened at every step and a
/// segment that names a choice element (`Observation.effective`) matches
/// the single typed element starting with it (`effectiveDateTime`).
///
/// ```
/// use helios_engine::index::{
///     IndexValue, ResourceIndexer, SearchParamDefinition, SearchParamIndexer, SearchParamType,
/// };
/// use serde_json::json;
///
/// let indexer = SearchParamIndexer::empty().with_definition(SearchParamDefinition::new(
///     "Patient",
///     "gender",
///     SearchParamType::Token,
///     "Patient.gender",
/// ));
///
/// let entries = indexer
///     .index(&json!({"resourceType": "Patient", "id": "p1", "gender": "male"}))
///     .unwrap();
/// assert_eq!(entries.len(), 1);
/// assert_eq!(
///     entries[0].value,
///     IndexValue::Token { system: None, code: "male".into() }
/// );
/// ```
#[derive(Debug, Clone)]
pub struct SearchParamIndexer {
    definitions: Vec<SearchParamDefinition>,
}

impl SearchParamIndexer {
    /// Creates an indexer with no definitions.
    pub fn empty() -> Self {
        Self {
            definitions: Vec::new(),
        }
    }

    /// Creates an indexer with `_lastUpdated`, `_tag` and `_profile` on every type.
    pub fn new() -> Self {
        Self {
            definitions: super::definitions::common_definitions(),
        }
    }

    /// Creates an indexer with a common R4 subset of parameters.
    pub fn with_defaults() -> Self {
        Self {
            definitions: default_definitions(),
        }
    }

    /// Adds a definition.
    pub fn with_definition(mut self, definition: SearchParamDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Returns the registered definitions.
    pub fn definitions(&self) -> &[SearchParamDefinition] {
        &self.definitions
    }

    fn parse_path(path: &str) -> Vec<&str> {
        let mut segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        // Skip the resource type prefix (e.g., "Patient.")
        if segments
            .first()
            .and_then(|s| s.chars().next())
            .is_some_and(char::is_uppercase)
        {
            segments.remove(0);
        }
        segments
    }

    fn navigate<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
        let Some((segment, remaining)) = segments.split_first() else {
            out.push(value);
            return;
        };
        match value {
            Value::Object(obj) => {
                if let Some(child) = obj.get(*segment) {
                    Self::navigate(child, remaining, out);
                } else {
                    let mut candidates = obj.iter().filter(|(k, _)| {
                        k.starts_with(segment)
                            && k[segment.len()..]
                                .chars()
                                .next()
                                .is_some_and(char::is_uppercase)
                    });
                    if let (Some((_, child)), None) = (candidates.next(), candidates.next()) {
                        Self::navigate(child, remaining, out);
                    }
                }
            }
            Value::Array(arr) => {
                for item in arr {
                    Self::navigate(item, segments, out);
                }
            }
            _ => {}
        }
    }
}

impl Default for SearchParamIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceIndexer for SearchParamIndexer {
    fn index(&self, resource: &Value) -> StorageResult<Vec<IndexEntry>> {
        let resource_type = resource_type_of(resource)?;
        let mut entries = Vec::new();
        for definition in self
            .definitions
            .iter()
            .filter(|d| d.applies_to(resource_type))
        {
            let mut found = Vec::new();
            Self::navigate(resource, &Self::parse_path(&definition.path), &mut found);
            for value in found {
                entries.extend(
                    ValueConverter::convert(value, definition.param_type)
                        .into_iter()
                        .map(|v| IndexEntry::new(&definition.name, &definition.path, v)),
                );
            }
        }
        Ok(entries)
    }
}
