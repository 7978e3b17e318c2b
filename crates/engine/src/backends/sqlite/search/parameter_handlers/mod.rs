//! Per-family SQL handlers.
//!
//! Each handler turns one criterion into a condition over the columns of
//! its index table. Conditions never reference a table alias; the query
//! builder places them inside a per-table subquery.

mod date;
mod number;
mod quantity;
mod reference;
mod string;
mod token;
mod uri;

pub use date::DateHandler;
pub use number::NumberHandler;
pub use quantity::QuantityHandler;
pub use reference::ReferenceHandler;
pub use string::StringHandler;
pub use token::TokenHandler;
pub use uri::UriHandler;
