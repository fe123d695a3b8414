pub mod error;

pub mod context;
pub mod converters;
pub mod entity;
pub mod field;
pub mod filter;
pub mod live_query;
pub mod provider;
pub mod relation;
pub mod repository;
pub mod validation;

pub use context::{Remult, RemultOptions};
pub use entity::{entity, EntityDefinition, EntityMetadata, EntityRow};
pub use error::{RemultError, Result};
pub use field::Fields;
pub use filter::{SortDirection, SortEntry};
pub use provider::{DataProvider, InMemoryDataProvider};
pub use relation::Relations;
pub use repository::{FindIdOptions, FindOptions, Repository};
pub use validation::Validators;
