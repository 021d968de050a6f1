//! Just-in-time update check for installed modules

use serde::Deserialize;
use tracing::{debug, warn};

use crate::model::{LocalModuleRecord, PendingUpdate, StatusFlags};
use crate::net::{hide_token, HttpClient, HttpError};
use crate::props::shorten_version_name;

/// Longest changelog kept on a record, in characters
pub const MAX_CHANGELOG_CHARS: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateJson {
    #[serde(default)]
    version: Option<String>,
    version_code: i64,
    zip_url: String,
    #[serde(default)]
    changelog: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
}

/// Whether `record` is eligible for an update check
pub fn can_check_update(record: &LocalModuleRecord) -> bool {
    record.meta.update_json.is_some()
        && !record.meta.has_flag(StatusFlags::SOURCED_FROM_REMOTE_CACHE)
}

/// Fetch the module's `updateJson` and its changelog into `record.update`.
///
/// Any failure of the update document clears the pending update. A missing
/// changelog only leaves the changelog empty. Returns true when an update
/// was recorded.
pub async fn check_update(record: &mut LocalModuleRecord, http: &HttpClient) -> bool {
    if !can_check_update(record) {
        return false;
    }
    let Some(url) = record.meta.update_json.clone() else {
        return false;
    };

    match fetch_update(&url, http).await {
        Ok(update) => {
            debug!(
                "Module {} advertises version code {}",
                record.id(),
                update.version_code
            );
            record.update = Some(update);
            true
        }
        Err(e) => {
            warn!(
                "Failed update checking for module {} ({}): {}",
                record.id(),
                hide_token(&url),
                e
            );
            record.update = None;
            false
        }
    }
}

async fn fetch_update(url: &str, http: &HttpClient) -> Result<PendingUpdate, HttpError> {
    let json: UpdateJson = http.get_json(url).await?;
    let zip_url = json.zip_url.trim().to_string();
    if zip_url.is_empty() {
        return Err(HttpError::Decode {
            url: hide_token(url),
            message: "empty zipUrl".to_string(),
        });
    }

    let changelog = match json.changelog.as_deref().filter(|c| !c.is_empty()) {
        Some(changelog_url) => match http.get_string(changelog_url).await {
            Ok(text) => truncate_chars(&text, MAX_CHANGELOG_CHARS),
            Err(e) => {
                debug!("No changelog at {}: {}", hide_token(changelog_url), e);
                String::new()
            }
        },
        None => String::new(),
    };

    Ok(PendingUpdate {
        version: shorten_version_name(json.version.as_deref(), json.version_code),
        version_code: json.version_code,
        zip_url,
        checksum: json.checksum.filter(|c| !c.is_empty()),
        changelog,
    })
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
