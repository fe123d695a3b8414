pub mod execute;
pub mod operators;
pub mod types;

pub use operators::{and_filters, matches_filter};
pub use types::{SortDirection, SortEntry};
