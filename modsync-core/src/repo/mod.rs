//! Remote module repositories
//!
//! # Overview
//!
//! Each configured repository is a [`RepositorySource`]: either a plain JSON
//! feed or the authenticated premium API. The [`RepositoryAggregator`] owns
//! every source, fetches their indexes in registration order and merges the
//! entries into one module map.
//!
//! ```text
//! RepositoryAggregator ── SyncManager<RepoState>
//!     │
//!     ├── PremiumSource   (token, blockade, device id)
//!     ├── PlainSource     (Magisk Alt Repo)
//!     └── PlainSource*    (custom repo_<sha256> feeds)
//!            │
//!            ▼
//!     RepoUpdater ── fetch_index / finish ──> CacheStore rows
//! ```

mod aggregator;
mod custom;
mod plain;
mod premium;
mod source;
mod updater;

pub use aggregator::{
    merge_entry, FailedSource, ModuleMap, RepoSummary, RepositoryAggregator, SyncReport,
    PROGRESS_TOTAL,
};
pub use custom::{can_add_custom, CustomRepoError, CustomRepoMeta};
pub use plain::PlainSource;
pub use premium::{
    DeviceFingerprint, HostFingerprint, PremiumSource, DEVICE_ID_TIMEOUT, PREMIUM_BLOCKADE,
    PREMIUM_RATE_LIMIT_BLOCKADE,
};
pub use source::{RepositorySource, SourceContext, SourceError, SourceInfo};
pub use updater::RepoUpdater;

use crate::checksum::sha256_hex;

pub const ALT_REPO_ID: &str = "magisk_alt_repo";
pub const ALT_REPO_URL: &str =
    "https://raw.githubusercontent.com/Magisk-Modules-Alt-Repo/json/main/modules.json";
pub const ALT_REPO_JSDELIVR_URL: &str =
    "https://cdn.jsdelivr.net/gh/Magisk-Modules-Alt-Repo/json@main/modules.json";
pub const ALT_REPO_HOMEPAGE: &str = "https://github.com/Magisk-Modules-Alt-Repo";
pub const ALT_REPO_SUBMIT: &str = "https://github.com/Magisk-Modules-Alt-Repo/submission/issues";
pub const ALT_REPO_NAME: &str = "Magisk Modules Alt Repo";

pub const PREMIUM_REPO_ID: &str = "androidacy_repo";
pub const PREMIUM_REPO_URL: &str = "https://production-api.androidacy.com/magisk/repo";
pub const PREMIUM_TEST_REPO_URL: &str = "https://staging-api.androidacy.com/magisk/repo";
pub const PREMIUM_REPO_HOMEPAGE: &str = "https://www.androidacy.com/modules-repo";

/// Prefix of every user-added repository id
pub const CUSTOM_REPO_PREFIX: &str = "repo_";

/// Map mirror URLs onto their canonical form
pub fn normalize_url(url: &str) -> &str {
    if url == ALT_REPO_JSDELIVR_URL {
        ALT_REPO_URL
    } else {
        url
    }
}

pub fn is_premium_url(url: &str) -> bool {
    url == PREMIUM_REPO_URL || url == PREMIUM_TEST_REPO_URL
}

pub fn is_built_in_url(url: &str) -> bool {
    is_premium_url(url) || url == ALT_REPO_URL || url == ALT_REPO_JSDELIVR_URL
}

/// Stable id of a repository URL
pub fn internal_id_of_url(url: &str) -> String {
    match url {
        ALT_REPO_URL | ALT_REPO_JSDELIVR_URL => ALT_REPO_ID.to_string(),
        PREMIUM_REPO_URL | PREMIUM_TEST_REPO_URL => PREMIUM_REPO_ID.to_string(),
        _ => format!("{CUSTOM_REPO_PREFIX}{}", sha256_hex(url)),
    }
}

pub fn is_custom_id(id: &str) -> bool {
    id.starts_with(CUSTOM_REPO_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_ids() {
        assert_eq!(internal_id_of_url(ALT_REPO_URL), ALT_REPO_ID);
        assert_eq!(internal_id_of_url(ALT_REPO_JSDELIVR_URL), ALT_REPO_ID);
        assert_eq!(internal_id_of_url(PREMIUM_TEST_REPO_URL), PREMIUM_REPO_ID);
        assert_eq!(
            internal_id_of_url("https://example.com/modules.json"),
            "repo_68f747da484d55fc4cded8837eabd4a50ed9efe06d26a8de5ccc46cff3da6d82"
        );
    }

    #[test]
    fn test_normalize_mirror() {
        assert_eq!(normalize_url(ALT_REPO_JSDELIVR_URL), ALT_REPO_URL);
        assert_eq!(normalize_url("https://x.test/a.json"), "https://x.test/a.json");
        assert!(is_built_in_url(ALT_REPO_JSDELIVR_URL));
        assert!(!is_built_in_url("https://x.test/a.json"));
    }
}
