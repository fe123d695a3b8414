pub mod builder;
pub mod metadata;
pub mod options;

pub use builder::{make_title, FieldDeclaration, Fields};
pub use metadata::{CompoundIdField, FieldMetadata, IdMetadata};
pub use options::{FieldContribution, FieldOptions, FieldSavingEvent, ValueType};
