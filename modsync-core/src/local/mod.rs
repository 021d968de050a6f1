//! Modules installed on the device

mod fs;
mod scanner;
mod update;

pub use fs::{LocalFs, RootFs};
pub use scanner::{is_safe_extra_path, LocalModuleMap, LocalModuleScanner};
pub use update::{can_check_update, check_update, MAX_CHANGELOG_CHARS};
