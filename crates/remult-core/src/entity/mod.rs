pub mod definition;
pub mod metadata;
pub mod row;

pub use definition::{entity, EntityBuilder, EntityDefinition, EntityOptions};
pub use metadata::{ApiPermissions, EntityMetadata};
pub use row::{EntityRow, Related};
