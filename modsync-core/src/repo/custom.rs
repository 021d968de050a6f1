//! User-added repositories

use serde::Deserialize;
use thiserror::Error;

use super::{is_built_in_url, is_custom_id};
use crate::model::RepositoryConfig;
use crate::net::{HttpClient, HttpError};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum CustomRepoError {
    #[error("{0} is a built-in repository")]
    BuiltIn(String),

    #[error("Repository {0} is already added")]
    Duplicate(String),

    #[error("At most {0} custom repositories are allowed")]
    LimitReached(usize),

    #[error("Repository URL must be https:// with a path: {0}")]
    InvalidUrl(String),

    #[error("Repository index at {0} has no name")]
    MissingName(String),

    #[error("{0} is not a custom repository")]
    NotCustom(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Repository-level fields read once when a custom repository is added
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomRepoMeta {
    pub name: Option<String>,
    pub website: Option<String>,
    pub support: Option<String>,
    pub donate: Option<String>,
    pub submit_module: Option<String>,
}

impl CustomRepoMeta {
    pub async fn fetch(http: &HttpClient, url: &str) -> Result<Self, CustomRepoError> {
        let meta: Self = http.get_json(url).await?;
        match meta.name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(meta),
            _ => Err(CustomRepoError::MissingName(url.to_string())),
        }
    }

    pub fn apply(self, config: &mut RepositoryConfig) {
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());
        config.name = non_empty(self.name);
        config.website = non_empty(self.website);
        config.support = non_empty(self.support);
        config.donate = non_empty(self.donate);
        config.submit_module = non_empty(self.submit_module);
    }
}

/// Check whether `url` may be added next to the `existing` repositories
pub fn can_add_custom(
    url: &str,
    existing: &[RepositoryConfig],
    max: usize,
) -> Result<(), CustomRepoError> {
    if is_built_in_url(url) {
        return Err(CustomRepoError::BuiltIn(url.to_string()));
    }
    if existing.iter().any(|repo| repo.url == url) {
        return Err(CustomRepoError::Duplicate(url.to_string()));
    }
    let custom = existing.iter().filter(|repo| is_custom_id(&repo.id)).count();
    if custom >= max {
        return Err(CustomRepoError::LimitReached(max));
    }
    let has_path = url.get(9..).is_some_and(|rest| rest.contains('/'));
    if !url.starts_with("https://") || !has_path {
        return Err(CustomRepoError::InvalidUrl(url.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{internal_id_of_url, ALT_REPO_JSDELIVR_URL, PREMIUM_REPO_URL};

    fn custom(url: &str) -> RepositoryConfig {
        RepositoryConfig::new(internal_id_of_url(url), url)
    }

    #[test]
    fn test_rejects_built_in_and_duplicates() {
        assert!(matches!(
            can_add_custom(ALT_REPO_JSDELIVR_URL, &[], 5),
            Err(CustomRepoError::BuiltIn(_))
        ));
        assert!(matches!(
            can_add_custom(PREMIUM_REPO_URL, &[], 5),
            Err(CustomRepoError::BuiltIn(_))
        ));

        let existing = vec![custom("https://a.test/modules.json")];
        assert!(matches!(
            can_add_custom("https://a.test/modules.json", &existing, 5),
            Err(CustomRepoError::Duplicate(_))
        ));
    }

    #[test]
    fn test_limit_counts_only_custom_repos() {
        let mut existing: Vec<_> = (0..4)
            .map(|i| custom(&format!("https://r{i}.test/modules.json")))
            .collect();
        existing.push(RepositoryConfig::new("magisk_alt_repo", "https://alt.test/x.json"));
        assert!(can_add_custom("https://new.test/modules.json", &existing, 5).is_ok());

        existing.push(custom("https://r4.test/modules.json"));
        assert!(matches!(
            can_add_custom("https://new.test/modules.json", &existing, 5),
            Err(CustomRepoError::LimitReached(5))
        ));
    }

    #[test]
    fn test_requires_https_with_path() {
        assert!(can_add_custom("http://a.test/modules.json", &[], 5).is_err());
        assert!(can_add_custom("https://a.test", &[], 5).is_err());
        assert!(can_add_custom("https://a.test/m.json", &[], 5).is_ok());
    }

    #[test]
    fn test_apply_drops_empty_fields() {
        let mut config = custom("https://a.test/modules.json");
        CustomRepoMeta {
            name: Some("A".to_string()),
            website: Some(String::new()),
            support: Some("https://a.test/support".to_string()),
            ..CustomRepoMeta::default()
        }
        .apply(&mut config);
        assert_eq!(config.name.as_deref(), Some("A"));
        assert_eq!(config.website, None);
        assert_eq!(config.support.as_deref(), Some("https://a.test/support"));
    }
}
