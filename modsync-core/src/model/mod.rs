//! Module data model
//!
//! Types shared by the repository aggregator, the local scanner and the
//! install pipeline.

mod flags;
mod id;
mod metadata;

pub use flags::StatusFlags;
pub use id::{is_dangerous_id, ModuleId, ModuleIdError, RESERVED_HELPER_ID};
pub use metadata::{
    CatalogEntry, LocalModuleRecord, ModuleMetadata, PendingUpdate, Quality, RepositoryConfig,
};
