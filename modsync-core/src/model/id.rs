//! Validated module identities

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Id used by the AnyKernel3 helper; never a real catalog module
pub const RESERVED_HELPER_ID: &str = "ak3-helper";

static MODULE_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._-]+$").expect("module id pattern is valid"));

/// Why a string was refused as a module id
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleIdError {
    #[error("module id is empty")]
    Empty,

    #[error("module id '{0}' is reserved")]
    Reserved(String),

    #[error("module id '{0}' does not match ^[A-Za-z][A-Za-z0-9._-]+$")]
    Malformed(String),
}

/// Immutable, case-sensitive module identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleId(String);

impl ModuleId {
    pub fn parse(raw: &str) -> Result<Self, ModuleIdError> {
        if raw.is_empty() {
            return Err(ModuleIdError::Empty);
        }
        if raw == RESERVED_HELPER_ID {
            return Err(ModuleIdError::Reserved(raw.to_string()));
        }
        if !MODULE_ID_PATTERN.is_match(raw) {
            return Err(ModuleIdError::Malformed(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ModuleId {
    type Error = ModuleIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ModuleId> for String {
    fn from(id: ModuleId) -> Self {
        id.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ModuleId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An id is dangerous to hand to an install script when it could escape
/// the modules directory.
pub fn is_dangerous_id(id: &str) -> bool {
    id.is_empty()
        || id.contains('/')
        || id.contains('\0')
        || (id.starts_with('.') && id.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        for id in ["foo", "Zygisk_LSPosed", "a1", "my.module-x_y"] {
            assert_eq!(ModuleId::parse(id).unwrap().as_str(), id);
        }
    }

    #[test]
    fn test_rejects_bad_ids() {
        assert_eq!(ModuleId::parse(""), Err(ModuleIdError::Empty));
        assert!(matches!(
            ModuleId::parse(RESERVED_HELPER_ID),
            Err(ModuleIdError::Reserved(_))
        ));
        for id in ["1abc", ".hidden", "a", "has space", "slash/y", "_x"] {
            assert!(
                matches!(ModuleId::parse(id), Err(ModuleIdError::Malformed(_))),
                "{id} should be malformed"
            );
        }
    }

    #[test]
    fn test_case_sensitive() {
        assert_ne!(ModuleId::parse("Foo").unwrap(), ModuleId::parse("foo").unwrap());
    }

    #[test]
    fn test_serde_validates() {
        let ok: ModuleId = serde_json::from_str("\"foo\"").unwrap();
        assert_eq!(ok.as_str(), "foo");
        assert!(serde_json::from_str::<ModuleId>("\"9x\"").is_err());
    }

    #[test]
    fn test_dangerous_ids() {
        assert!(is_dangerous_id(""));
        assert!(is_dangerous_id("../x"));
        assert!(is_dangerous_id("a\0b"));
        assert!(is_dangerous_id(".."));
        assert!(is_dangerous_id(".x."));
        assert!(!is_dangerous_id(".x"));
        assert!(!is_dangerous_id("safe_id"));
    }
}
