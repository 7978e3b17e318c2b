//! SQLite search implementation.
//!
//! - [`QueryBuilder`] translates a [`Search`](crate::types::Search) into one
//!   parameterized statement
//! - [`parameter_handlers`] emit the per-family conditions

pub mod parameter_handlers;
pub mod query_builder;

pub use query_builder::{QueryBuilder, RESOURCE_COLUMNS, SqlFragment, SqlParam};
