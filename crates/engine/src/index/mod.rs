//! Search index entries and the indexing collaborator.
//!
//! The store never decides what to index. It persists exactly the entries a
//! [`ResourceIndexer`] returns for a resource body, one row per entry in the
//! table of the entry's [`IndexFamily`], and regenerates them whenever the
//! body changes.

mod converters;
mod definitions;
mod extractor;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageResult;

pub use converters::ValueConverter;
pub use definitions::{SearchParamDefinition, SearchParamType};
pub use extractor::SearchParamIndexer;

/// A group of index tables specialized for one value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexFamily {
    String,
    Token,
    Reference,
    Quantity,
    Number,
    Uri,
    Date,
    DateTime,
    Position,
}

impl IndexFamily {
    /// All families, in schema order.
    pub const ALL: [IndexFamily; 9] = [
        IndexFamily::String,
        IndexFamily::Token,
        IndexFamily::Reference,
        IndexFamily::Quantity,
        IndexFamily::Number,
        IndexFamily::Uri,
        IndexFamily::Date,
        IndexFamily::DateTime,
        IndexFamily::Position,
    ];

    /// The table holding this family's rows.
    pub fn table_name(&self) -> &'static str {
        match self {
            IndexFamily::String => "string_index",
            IndexFamily::Token => "token_index",
            IndexFamily::Reference => "reference_index",
            IndexFamily::Quantity => "quantity_index",
            IndexFamily::Number => "number_index",
            IndexFamily::Uri => "uri_index",
            IndexFamily::Date => "date_index",
            IndexFamily::DateTime => "date_time_index",
            IndexFamily::Position => "position_index",
        }
    }
}

impl fmt::Display for IndexFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name().trim_end_matches("_index"))
    }
}

/// A typed index value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexValue {
    /// String value for string parameters.
    String(String),

    /// Token value (code with optional system).
    Token {
        /// Code system URI (e.g., "http://loinc.org").
        system: Option<String>,
        /// Code value.
        code: String,
    },

    /// Relative reference (e.g., "Patient/123").
    Reference(String),

    /// Quantity value with optional unit.
    Quantity {
        /// Numeric value.
        value: f64,
        /// Unit system URI (e.g., "http://unitsofmeasure.org").
        system: Option<String>,
        /// Unit code (e.g., "kg").
        code: Option<String>,
        /// Human readable unit.
        unit: Option<String>,
    },

    /// Numeric value.
    Number(f64),

    /// URI value.
    Uri(String),

    /// Inclusive range of epoch days.
    Date {
        /// First day.
        from: i64,
        /// Last day.
        to: i64,
    },

    /// Inclusive range of epoch milliseconds.
    DateTime {
        /// First millisecond.
        from: i64,
        /// Last millisecond.
        to: i64,
    },

    /// Geographic position.
    Position {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
    },
}

impl IndexValue {
    /// The family (and so the table) this value belongs to.
    pub fn family(&self) -> IndexFamily {
        match self {
            IndexValue::String(_) => IndexFamily::String,
            IndexValue::Token { .. } => IndexFamily::Token,
            IndexValue::Reference(_) => IndexFamily::Reference,
            IndexValue::Quantity { .. } => IndexFamily::Quantity,
            IndexValue::Number(_) => IndexFamily::Number,
            IndexValue::Uri(_) => IndexFamily::Uri,
            IndexValue::Date { .. } => IndexFamily::Date,
            IndexValue::DateTime { .. } => IndexFamily::DateTime,
            IndexValue::Position { .. } => IndexFamily::Position,
        }
    }
}

/// One index row for a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Search parameter name.
    pub name: String,
    /// Path expression the value was read from.
    pub path: String,
    /// The value.
    pub value: IndexValue,
}

impl IndexEntry {
    /// Creates an entry.
    pub fn new(name: impl Into<String>, path: impl Into<String>, value: IndexValue) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            value,
        }
    }
}

/// Derives index entries from a resource body.
///
/// Implementations know the search parameter definitions per resource type.
pub trait ResourceIndexer: Send + Sync {
    /// Returns every index entry implied by the body.
    fn index(&self, resource: &Value) -> StorageResult<Vec<IndexEntry>>;
}
