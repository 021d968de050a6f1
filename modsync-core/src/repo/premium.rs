//! Authenticated premium repository
//!
//! The premium API hands out anonymous device-bound tokens. `prepare()` pings
//! the service, validates or registers a token, and keeps a blockade window
//! so that repeated refreshes do not hammer the authentication endpoints.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::source::{
    opt_bool, opt_i64, opt_string, strip_official, SourceContext, SourceError, SourceInfo,
};
use super::{PREMIUM_REPO_URL, PREMIUM_TEST_REPO_URL};
use crate::checksum::sha256_hex;
use crate::model::{CatalogEntry, ModuleId, Quality, StatusFlags};
use crate::net::{hide_token, HttpError};
use crate::props::{apply_fallbacks, is_invalid_url, parse_magisk_version};
use crate::store::{PREF_DEVICE_ID, PREF_PREMIUM_TOKEN};

const PRODUCTION_HOST: &str = "production-api.androidacy.com";
const STAGING_HOST: &str = "staging-api.androidacy.com";
const DEFAULT_NAME: &str = "Androidacy Modules Repo";

/// Minimum spacing between two token validations
pub const PREMIUM_BLOCKADE: Duration = Duration::from_secs(30);
/// Cooldown after the API signalled rate limiting
pub const PREMIUM_RATE_LIMIT_BLOCKADE: Duration = Duration::from_secs(3600);
/// Upper bound on waiting for a device fingerprint
pub const DEVICE_ID_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of a stable per-device identifier
#[async_trait]
pub trait DeviceFingerprint: Send + Sync {
    async fn fingerprint(&self) -> Option<String>;
}

/// Fingerprint derived from the host machine id
pub struct HostFingerprint;

#[async_trait]
impl DeviceFingerprint for HostFingerprint {
    async fn fingerprint(&self) -> Option<String> {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(id) = tokio::fs::read_to_string(path).await {
                let id = id.trim();
                if !id.is_empty() {
                    return Some(sha256_hex(id));
                }
            }
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    token: String,
}

/// Why a token could not be validated
enum TokenCheck {
    Valid,
    Invalid,
    Failed(HttpError),
}

pub struct PremiumSource {
    pub info: SourceInfo,
    test_mode: bool,
    host: &'static str,
    token: Option<String>,
    blockade: Option<Instant>,
    device_id: Option<String>,
    member_level: Option<String>,
    fingerprint: std::sync::Arc<dyn DeviceFingerprint>,
}

impl PremiumSource {
    pub fn new(
        mut info: SourceInfo,
        test_mode: bool,
        fingerprint: std::sync::Arc<dyn DeviceFingerprint>,
    ) -> Self {
        info.default_name = DEFAULT_NAME.to_string();
        info.default_website = super::PREMIUM_REPO_HOMEPAGE.to_string();
        info.default_support = Some("https://t.me/androidacy_discussions".to_string());
        info.default_donate = Some(
            "https://www.androidacy.com/membership-account/membership-checkout/?level=2"
                .to_string(),
        );
        info.default_submit_module =
            Some("https://www.androidacy.com/module-repository-applications/".to_string());
        info.module_repo_name = DEFAULT_NAME.to_string();
        info.config.url = if test_mode {
            PREMIUM_TEST_REPO_URL
        } else {
            PREMIUM_REPO_URL
        }
        .to_string();

        Self {
            info,
            test_mode,
            host: if test_mode { STAGING_HOST } else { PRODUCTION_HOST },
            token: None,
            blockade: None,
            device_id: None,
            member_level: None,
            fingerprint,
        }
    }

    pub fn display_name(&self) -> String {
        if self.test_mode {
            format!("{} (Test Mode)", self.info.name())
        } else {
            self.info.name().to_string()
        }
    }

    pub fn member_level(&self) -> Option<&str> {
        self.member_level.as_deref()
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Forget the token so the next cycle registers a new one
    pub fn reset_token(&mut self, ctx: &SourceContext) {
        self.token = None;
        self.blockade = None;
        if let Err(e) = ctx.store.set_pref(PREF_PREMIUM_TOKEN, None) {
            warn!("Failed to clear premium token: {}", e);
        }
    }

    /// Cached id, then the stored one, then a fingerprint, then a random UUID
    pub async fn device_id(&mut self, ctx: &SourceContext) -> String {
        if let Some(id) = &self.device_id {
            return id.clone();
        }
        if let Ok(Some(id)) = ctx.store.pref(PREF_DEVICE_ID) {
            self.device_id = Some(id.clone());
            return id;
        }

        let id = match tokio::time::timeout(DEVICE_ID_TIMEOUT, self.fingerprint.fingerprint()).await
        {
            Ok(Some(fp)) => fp,
            Ok(None) => uuid::Uuid::new_v4().to_string(),
            Err(_) => {
                warn!("Device fingerprint timed out, using a random id");
                uuid::Uuid::new_v4().to_string()
            }
        };
        if let Err(e) = ctx.store.set_pref(PREF_DEVICE_ID, Some(&id)) {
            warn!("Failed to persist device id: {}", e);
        }
        self.device_id = Some(id.clone());
        id
    }

    fn client_id<'a>(&self, ctx: &'a SourceContext) -> &'a str {
        &ctx.settings.premium.client_id
    }

    pub async fn prepare(&mut self, ctx: &SourceContext) -> bool {
        if self.client_id(ctx).is_empty() {
            warn!("No premium client id configured, skipping {}", self.info.id());
            return false;
        }

        let ping = format!("https://{}/ping", self.host);
        if let Err(e) = ctx.http.get(&ping).await {
            if e.status() == Some(400) {
                warn!("Premium API rejected this client version, an update is needed");
            }
            error!("Failed to ping premium API: {}", e);
            return false;
        }

        let now = Instant::now();
        if self.blockade.is_some_and(|until| until > now) {
            debug!("Inside premium blockade, reusing cached token");
            return true;
        }
        self.blockade = Some(now + PREMIUM_BLOCKADE);

        if self.token.is_none() {
            self.token = ctx.store.pref(PREF_PREMIUM_TOKEN).ok().flatten();
        }
        if let Some(token) = self.token.clone() {
            match self.check_token(ctx, &token).await {
                TokenCheck::Valid => info!("Using validated cached token"),
                TokenCheck::Invalid => {
                    info!("Token expired or invalid, requesting new one");
                    self.reset_token(ctx);
                    self.blockade = Some(now + PREMIUM_BLOCKADE);
                }
                TokenCheck::Failed(e) => {
                    self.note_failure(now, &e);
                    return false;
                }
            }
        }

        if self.token.is_none() {
            info!("Requesting new premium token");
            let token = match self.request_new_token(ctx).await {
                Ok(token) => token,
                Err(e) => {
                    self.note_failure(now, &e);
                    error!("Failed to get a new token: {}", e);
                    return false;
                }
            };
            match self.check_token(ctx, &token).await {
                TokenCheck::Valid => {}
                TokenCheck::Invalid => {
                    error!("Failed to validate freshly registered token");
                    return false;
                }
                TokenCheck::Failed(e) => {
                    self.note_failure(now, &e);
                    return false;
                }
            }
            if let Err(e) = ctx.store.set_pref(PREF_PREMIUM_TOKEN, Some(&token)) {
                warn!("Failed to persist premium token: {}", e);
            }
            self.token = Some(token);
        }
        true
    }

    fn note_failure(&mut self, now: Instant, e: &HttpError) {
        if e.should_back_off() {
            error!("Premium API is rate limiting us: {}", e);
            self.blockade = Some(now + PREMIUM_RATE_LIMIT_BLOCKADE);
        }
    }

    async fn check_token(&mut self, ctx: &SourceContext, token: &str) -> TokenCheck {
        let device_id = self.device_id(ctx).await;
        let url = format!(
            "https://{}/auth/me?token={}&device_id={}&client_id={}",
            self.host,
            token,
            device_id,
            self.client_id(ctx)
        );
        match ctx.http.get_json::<MeResponse>(&url).await {
            Ok(me) => {
                debug!("Member level: {:?}", me.role);
                self.member_level = me.role;
                TokenCheck::Valid
            }
            Err(HttpError::Unauthorized { .. }) | Err(HttpError::Decode { .. }) => {
                TokenCheck::Invalid
            }
            Err(e) => TokenCheck::Failed(e),
        }
    }

    async fn request_new_token(&mut self, ctx: &SourceContext) -> Result<String, HttpError> {
        let device_id = self.device_id(ctx).await;
        let url = format!(
            "https://{}/auth/register?device_id={}&client_id={}",
            self.host,
            device_id,
            self.client_id(ctx)
        );
        let response: RegisterResponse = ctx.http.get_json(&url).await?;
        Ok(response.token)
    }

    pub async fn index_url(&mut self, ctx: &SourceContext) -> String {
        let Some(token) = self.token.clone() else {
            return self.info.url().to_string();
        };
        let device_id = self.device_id(ctx).await;
        format!(
            "{}?token={}&v={}&c={}&device_id={}&client_id={}",
            self.info.url(),
            token,
            ctx.settings.app_version_code,
            ctx.settings.app_version_name,
            device_id,
            self.client_id(ctx)
        )
    }

    pub async fn populate(
        &mut self,
        index: &Value,
        ctx: &SourceContext,
    ) -> Result<Vec<String>, SourceError> {
        let name = opt_string(index, "name").unwrap_or_else(|| DEFAULT_NAME.to_string());
        let items = index
            .get("data")
            .and_then(Value::as_array)
            .or_else(|| index.get("modules").and_then(Value::as_array))
            .ok_or_else(|| SourceError::InvalidIndex("missing \"data\" array".to_string()))?;

        let device_id = self.device_id(ctx).await;
        if self.token.is_none() {
            // Indexes rebuilt from cache rows skip prepare()
            self.token = ctx.store.pref(PREF_PREMIUM_TOKEN).ok().flatten();
        }
        let repo_id = self.info.id().to_string();
        self.info.begin_populate();

        let mut changed = Vec::new();
        let mut newest = 0i64;
        for item in items {
            let raw_id = opt_string(item, "codename")
                .filter(|c| !c.is_empty())
                .or_else(|| opt_string(item, "id"));
            let module_id = match raw_id.as_deref().map(ModuleId::parse) {
                Some(Ok(id)) => id,
                Some(Err(e)) => {
                    warn!("Skipping premium module: {}", e);
                    continue;
                }
                None => {
                    error!("Premium module without codename: {}", item);
                    continue;
                }
            };
            let (Some(module_name), Some(version_code)) =
                (opt_string(item, "name"), opt_i64(item, "versionCode"))
            else {
                warn!("Premium module {} lacks name or versionCode", module_id);
                continue;
            };

            let last_update = opt_i64(item, "updated_at")
                .or_else(|| opt_i64(item, "lastUpdate"))
                .unwrap_or(0)
                .saturating_mul(1000);
            newest = newest.max(last_update);

            let id = module_id.to_string();
            let is_new = !self.info.modules.contains_key(&id);
            let entry = self
                .info
                .modules
                .entry(id.clone())
                .or_insert_with(|| CatalogEntry::new(&repo_id, &id));
            if is_new || entry.meta.last_updated < last_update {
                changed.push(id.clone());
            }

            entry.processed = true;
            entry.zip_url = Some(inject_token(
                &filter_url(opt_string(item, "zipUrl"))
                    .unwrap_or_else(|| format!("https://{}/magisk/info/{}", self.host, id)),
                self.test_mode,
                self.token.as_deref(),
                &device_id,
            ));
            entry.notes_url = Some(inject_token(
                &filter_url(opt_string(item, "notesUrl"))
                    .unwrap_or_else(|| format!("https://{}/magisk/readme/{}", self.host, id)),
                self.test_mode,
                self.token.as_deref(),
                &device_id,
            ));
            entry.checksum = opt_string(item, "checksum").filter(|c| !c.is_empty());

            let downloads = opt_i64(item, "downloads").filter(|d| *d > 0);
            let downloads = downloads.or_else(|| opt_i64(item, "stats")).unwrap_or(0);
            let meta = &mut entry.meta;
            meta.quality = Some(Quality::Downloads(downloads.max(0) as u64));
            meta.last_updated = last_update;
            meta.name = Some(module_name);
            meta.version_code = version_code;
            meta.version = opt_string(item, "version").or_else(|| Some(format!("v{version_code}")));
            meta.author = opt_string(item, "author").or_else(|| Some("Unknown".to_string()));
            meta.description = opt_string(item, "description").or_else(|| Some(String::new()));
            meta.min_api = opt_i64(item, "minApi").unwrap_or(0).max(0) as u32;
            meta.max_api = opt_i64(item, "maxApi").unwrap_or(0).max(0) as u32;
            meta.min_magisk = opt_string(item, "minMagisk")
                .and_then(|v| parse_magisk_version(&v))
                .unwrap_or(0);
            meta.need_ramdisk = opt_bool(item, "needRamdisk").unwrap_or(false);
            meta.change_boot = opt_bool(item, "changeBoot").unwrap_or(false);
            meta.mmt_reborn = opt_bool(item, "mmtReborn").unwrap_or(false);
            meta.support = filter_url(opt_string(item, "support"));
            meta.donate = filter_url(opt_string(item, "donate"));
            meta.safe = opt_string(item, "vt_status")
                .is_some_and(|s| s.eq_ignore_ascii_case("clean"))
                || opt_bool(item, "safe").unwrap_or(false);
            meta.config = opt_string(item, "config").filter(|c| !c.is_empty());
            apply_fallbacks(meta);
            meta.flags.remove(StatusFlags::METADATA_INVALID);
        }

        self.info.modules.retain(|_, entry| entry.processed);
        for entry in self.info.modules.values() {
            entry.meta.verify();
        }

        self.info.module_repo_name = strip_official(&name);
        self.info.config.name = Some(name);
        self.info.config.last_update = newest;
        self.info.apply_index_links(index);
        Ok(changed)
    }

    /// Metadata lives in the index; a known id is always loadable
    pub fn try_load_metadata(&mut self, module_id: &str) -> bool {
        match self.info.modules.get_mut(module_id) {
            Some(entry) => {
                entry.meta.flags.remove(StatusFlags::METADATA_INVALID);
                true
            }
            None => false,
        }
    }
}

fn filter_url(url: Option<String>) -> Option<String> {
    url.filter(|u| !u.is_empty() && !is_invalid_url(u))
}

/// Links pointing at the premium service
pub fn is_premium_link(url: &str) -> bool {
    let Some(rest) = url.strip_prefix("https://") else {
        return false;
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    host == "androidacy.com" || host.ends_with(".androidacy.com")
}

/// Rewrite a premium link to the current mode's host and attach credentials
/// `url` without the `token` and `device_id` query parameters that
/// [`inject_token`] adds, so it can be persisted and re-tokenised later
pub(super) fn strip_session(url: &str) -> String {
    if !is_premium_link(url) {
        return url.to_string();
    }
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|p| !p.is_empty() && !p.starts_with("token=") && !p.starts_with("device_id="))
        .collect();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}

fn inject_token(url: &str, test_mode: bool, token: Option<&str>, device_id: &str) -> String {
    if !is_premium_link(url) {
        return url.to_string();
    }
    let production = format!("https://{PRODUCTION_HOST}/");
    let staging = format!("https://{STAGING_HOST}/");
    let mut url = url.to_string();
    if test_mode {
        if let Some(rest) = url.strip_prefix(&production) {
            error!("Got non test mode url: {}", hide_token(&url));
            url = format!("{staging}{rest}");
        }
    } else if let Some(rest) = url.strip_prefix(&staging) {
        error!("Got test mode url: {}", hide_token(&url));
        url = format!("{production}{rest}");
    }

    let Some(token) = token else {
        return url;
    };
    for param in [format!("token={token}"), format!("device_id={device_id}")] {
        if url.contains(&param) {
            continue;
        }
        let has_query = url.rfind('?').is_some_and(|q| url.rfind('/').unwrap_or(0) < q);
        url.push(if has_query { '&' } else { '?' });
        url.push_str(&param);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_session_round_trips_through_inject() {
        let tokenised = inject_token(
            "https://production-api.androidacy.com/magisk/info/foo?v=2",
            false,
            Some("tok"),
            "dev",
        );
        let stripped = strip_session(&tokenised);
        assert_eq!(
            stripped,
            "https://production-api.androidacy.com/magisk/info/foo?v=2"
        );
        assert_eq!(
            inject_token(&stripped, false, Some("fresh"), "dev"),
            "https://production-api.androidacy.com/magisk/info/foo?v=2&token=fresh&device_id=dev"
        );
        assert_eq!(
            strip_session("https://x.test/foo.zip?token=keep"),
            "https://x.test/foo.zip?token=keep"
        );
    }

    #[test]
    fn test_premium_link_detection() {
        assert!(is_premium_link("https://production-api.androidacy.com/x"));
        assert!(is_premium_link("https://androidacy.com/"));
        assert!(!is_premium_link("https://evilandroidacy.com/"));
        assert!(!is_premium_link("http://production-api.androidacy.com/x"));
    }

    #[test]
    fn test_inject_token_normalises_host() {
        let url = inject_token(
            "https://production-api.androidacy.com/magisk/info/foo",
            true,
            Some("tok"),
            "dev",
        );
        assert_eq!(
            url,
            "https://staging-api.androidacy.com/magisk/info/foo?token=tok&device_id=dev"
        );

        let url = inject_token(
            "https://staging-api.androidacy.com/magisk/info/foo?x=1",
            false,
            Some("tok"),
            "dev",
        );
        assert_eq!(
            url,
            "https://production-api.androidacy.com/magisk/info/foo?x=1&token=tok&device_id=dev"
        );
    }

    #[test]
    fn test_inject_token_leaves_foreign_links() {
        assert_eq!(
            inject_token("https://github.com/a/b.zip", false, Some("tok"), "dev"),
            "https://github.com/a/b.zip"
        );
    }

    #[test]
    fn test_inject_token_without_token_only_rewrites_host() {
        assert_eq!(
            inject_token(
                "https://staging-api.androidacy.com/magisk/readme/foo",
                false,
                None,
                "dev"
            ),
            "https://production-api.androidacy.com/magisk/readme/foo"
        );
    }
}
