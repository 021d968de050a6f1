//! Per-module compatibility overrides
//!
//! A small table of module ids (or repository ids) mapped to flags that
//! override what a module's own metadata would suggest. Loaded from a
//! `compat.txt` file with one `<id>/<flag>[,<flag>...]` entry per line.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::repo::{ALT_REPO_ID, CUSTOM_REPO_PREFIX};

/// Compatibility override bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CompatFlags(u32);

impl CompatFlags {
    pub const LOW_QUALITY: Self = Self(0x0001);
    pub const NO_EXT: Self = Self(0x0002);
    pub const MAGISK_CMD: Self = Self(0x0004);
    pub const NEED_32BIT: Self = Self(0x0008);
    pub const MALWARE: Self = Self(0x0010);
    pub const NO_ANSI: Self = Self(0x0020);
    pub const FORCE_ANSI: Self = Self(0x0040);
    pub const FORCE_HIDE: Self = Self(0x0080);
    pub const MMT_REBORN: Self = Self(0x0100);
    pub const ZIP_WRAPPER: Self = Self(0x0200);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    fn from_name(name: &str) -> Option<Self> {
        let flag = match name.to_ascii_lowercase().as_str() {
            "lowquality" => Self::LOW_QUALITY,
            "noext" => Self::NO_EXT,
            "magiskcmd" => Self::MAGISK_CMD,
            "need32bit" => Self::NEED_32BIT,
            "malware" => Self::MALWARE,
            "noansi" => Self::NO_ANSI,
            "forceansi" => Self::FORCE_ANSI,
            "forcehide" => Self::FORCE_HIDE,
            "mmtreborn" => Self::MMT_REBORN,
            "zipwrapper" => Self::ZIP_WRAPPER,
            _ => return None,
        };
        Some(flag)
    }
}

impl std::ops::BitOr for CompatFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Lookup table of compatibility flags keyed by module or repository id
#[derive(Debug, Clone, Default)]
pub struct CompatTable {
    flags: HashMap<String, CompatFlags>,
}

impl CompatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a file, treating a missing file as an empty table
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read compat table: {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut table = Self::default();
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((id, names)) = line.split_once('/') else {
                warn!("compat.txt:{}: missing '/' separator", line_num + 1);
                continue;
            };
            let entry = table.flags.entry(id.trim().to_string()).or_default();
            for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                match CompatFlags::from_name(name) {
                    Some(flag) => entry.insert(flag),
                    None => warn!("compat.txt:{}: unknown flag '{}'", line_num + 1, name),
                }
            }
        }
        debug!("Loaded compatibility flags for {} ids", table.flags.len());
        table
    }

    pub fn set(&mut self, id: &str, flags: CompatFlags) {
        self.flags.insert(id.to_string(), flags);
    }

    pub fn flags_for(&self, id: &str) -> CompatFlags {
        self.flags.get(id).copied().unwrap_or_default()
    }

    /// Whether a repository must be hidden whatever its stored enabled flag
    pub fn should_force_hide(&self, repo_id: &str) -> bool {
        if repo_id.starts_with(CUSTOM_REPO_PREFIX) || repo_id == ALT_REPO_ID {
            return false;
        }
        self.flags_for(repo_id).contains(CompatFlags::FORCE_HIDE)
    }
}
