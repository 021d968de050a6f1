//! `module.prop` parsing
//!
//! Reads the key=value module descriptor into [`ModuleMetadata`]. Local
//! descriptors (read from the device) are tolerant: problems flag the module
//! as `METADATA_INVALID` and parsing goes on. Remote descriptors (fetched from
//! a repository) are strict and any problem is an error.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use thiserror::Error;

use crate::compat::{CompatFlags, CompatTable};
use crate::model::{ModuleMetadata, StatusFlags, RESERVED_HELPER_ID};

/// Where a descriptor came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropMode {
    Local,
    Remote,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropError {
    #[error("{source_name}: invalid key at line {line}")]
    InvalidKey { source_name: String, line: usize },

    #[error("{source_name}: invalid value for key {key}")]
    InvalidValue { source_name: String, key: String },

    #[error("{source_name} has a non matching module id (expected \"{expected}\" got \"{found}\")")]
    IdMismatch {
        source_name: String,
        expected: String,
        found: String,
    },

    #[error("{source_name}: duplicate module name")]
    DuplicateName { source_name: String },

    #[error("{source_name}: invalid versionCode \"{value}\"")]
    BadVersionCode { source_name: String, value: String },

    #[error("{source_name}: didn't read module id at least once")]
    MissingId { source_name: String },

    #[error("{source_name}: didn't read module versionCode at least once")]
    MissingVersionCode { source_name: String },
}

/// Keys whose empty values are still meaningful
const IMPORTANT_KEYS: [&str; 4] = ["id", "name", "version", "versionCode"];

const XDA_FORUM_ROOT: &str = "https://forum.xda-developers.com/";

const RIRU_MIN_API: u32 = 23;

static SUPPORT_FALLBACKS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("aospill", "https://t.me/PannekoX"),
        ("bromitewebview", "https://t.me/androidacy_discussions"),
        ("fontrevival", "https://t.me/androidacy_discussions"),
        ("quickstepswitcher", "https://t.me/QuickstepSwitcherSupport"),
        ("riru_edxposed", "https://t.me/EdXposed"),
        ("riru_lsposed", "https://github.com/LSPosed/LSPosed/issues"),
        ("substratum", "https://github.com/substratum/substratum/issues"),
    ])
});

static CONFIG_FALLBACKS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("quickstepswitcher", "xyz.paphonb.quickstepswitcher"),
        ("hex_installer_module", "project.vivid.hex.bodhi"),
        ("riru_edxposed", "org.meowcat.edxposed.manager"),
        ("riru_lsposed", "org.lsposed.manager"),
        ("zygisk_lsposed", "org.lsposed.manager"),
        ("xposed_dalvik", "de.robv.android.xposed.installer"),
        ("xposed", "de.robv.android.xposed.installer"),
        ("substratum", "projekt.substratum"),
    ])
});

static MIN_API_FALLBACKS: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    HashMap::from([
        ("HideNavBar", 29),
        ("riru_ifw_enhance", 26),
        ("zygisk_ifw_enhance", 26),
        ("riru_edxposed", 26),
        ("zygisk_edxposed", 26),
        ("riru_lsposed", 27),
        ("zygisk_lsposed", 27),
        ("noneDisplayCutout", 28),
        ("quickstepswitcher", 28),
        ("riru_clipboard_whitelist", 29),
        ("riru-core", RIRU_MIN_API),
    ])
});

static UPDATE_JSON_FALLBACKS: Lazy<HashMap<String, String>> = Lazy::new(|| {
    let gh = "https://raw.githubusercontent.com/";
    let mut map = HashMap::new();
    map.insert(
        "BluetoothLibraryPatcher".to_string(),
        format!("{gh}3arthur6/BluetoothLibraryPatcher/master/update.json"),
    );
    map.insert(
        "Detach".to_string(),
        format!("{gh}xerta555/Detach-Files/blob/master/Updater.json"),
    );
    for module in [
        "busybox-ndk",
        "adb-ndk",
        "twrp-keep",
        "adreno-dev",
        "nano-ndk",
        "zipsigner",
        "nexusmedia",
        "mtd-ndk",
    ] {
        map.insert(
            module.to_string(),
            format!("{gh}Magisk-Modules-Repo/{module}/master/update.json"),
        );
    }
    map.insert(
        "riru_lsposed".to_string(),
        "https://lsposed.github.io/LSPosed/release/riru.json".to_string(),
    );
    map.insert(
        "zygisk_lsposed".to_string(),
        "https://lsposed.github.io/LSPosed/release/zygisk.json".to_string(),
    );
    map
});

/// Parse a descriptor into `meta`.
///
/// In local mode problems set `METADATA_INVALID` and `Ok(())` is returned.
/// In remote mode the first problem is returned as an error.
pub fn read_properties(
    meta: &mut ModuleMetadata,
    content: &str,
    source_name: &str,
    mode: PropMode,
    compat: &CompatTable,
) -> Result<(), PropError> {
    let local = mode == PropMode::Local;
    let mut invalid = false;
    let mut read_id = false;
    let mut read_name = false;
    let mut read_version = false;
    let mut read_version_code = false;
    let mut read_description = false;
    let mut read_update_json = false;
    let mut read_min_api = false;
    let mut read_max_api = false;
    let mut read_mmt_reborn = false;

    // Flags the record invalid in local mode, bails in remote mode.
    macro_rules! reject {
        ($err:expr) => {
            if local {
                invalid = true;
            } else {
                return Err($err);
            }
        };
    }

    for (index, raw_line) in content.lines().enumerate() {
        let line_num = index + 1;
        let line = if index == 0 {
            raw_line.trim_start_matches('\0')
        } else {
            raw_line
        };
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();

        if is_invalid_value(key) {
            reject!(PropError::InvalidKey {
                source_name: source_name.to_string(),
                line: line_num,
            });
            continue;
        }
        if value.is_empty() && !IMPORTANT_KEYS.contains(&key) {
            continue;
        }
        if is_invalid_value(value) {
            reject!(PropError::InvalidValue {
                source_name: source_name.to_string(),
                key: key.to_string(),
            });
            continue;
        }

        match key {
            "id" => {
                read_id = true;
                if meta.id != value {
                    reject!(PropError::IdMismatch {
                        source_name: source_name.to_string(),
                        expected: meta.id.clone(),
                        found: value.to_string(),
                    });
                }
            }
            "name" => {
                if read_name {
                    reject!(PropError::DuplicateName {
                        source_name: source_name.to_string(),
                    });
                    break;
                }
                read_name = true;
                meta.name = Some(value.to_string());
            }
            "version" => {
                read_version = true;
                meta.version = Some(value.to_string());
            }
            "versionCode" => {
                read_version_code = true;
                match value.parse::<i64>() {
                    Ok(code) => meta.version_code = code,
                    Err(_) => {
                        meta.version_code = 0;
                        reject!(PropError::BadVersionCode {
                            source_name: source_name.to_string(),
                            value: value.to_string(),
                        });
                    }
                }
            }
            "author" => {
                let author = value.strip_suffix(" development team").unwrap_or(value);
                meta.author = Some(author.to_string());
            }
            "description" => {
                read_description = true;
                meta.description = Some(value.to_string());
            }
            "updateJsonAk3" => {
                if meta.id == RESERVED_HELPER_ID && !is_invalid_url(value) {
                    meta.update_json = Some(value.to_string());
                    read_update_json = true;
                }
            }
            "updateJson" => {
                if !is_invalid_url(value) {
                    meta.update_json = Some(value.to_string());
                    read_update_json = true;
                }
            }
            "changeBoot" => meta.change_boot = parse_bool(value),
            "mmtReborn" => {
                meta.mmt_reborn = parse_bool(value);
                read_mmt_reborn = true;
            }
            "support" => {
                if !is_invalid_url(value) && value != XDA_FORUM_ROOT {
                    meta.support = Some(value.to_string());
                }
            }
            "donate" => {
                if !is_invalid_url(value) {
                    meta.donate = Some(value.to_string());
                }
            }
            "config" => meta.config = Some(value.to_string()),
            "needRamdisk" => meta.need_ramdisk = parse_bool(value),
            "minMagisk" => meta.min_magisk = parse_magisk_version(value).unwrap_or(0),
            // "10" means something else to Riru EdXposed
            "minApi" if value == "10" => {}
            "minApi" | "minSdkVersion" => match value.parse::<u32>() {
                Ok(api) => {
                    meta.min_api = api;
                    read_min_api = true;
                }
                Err(_) if !read_min_api => meta.min_api = 0,
                Err(_) => {}
            },
            "maxApi" | "maxSdkVersion" => match value.parse::<u32>() {
                Ok(api) => {
                    meta.max_api = api;
                    read_max_api = true;
                }
                Err(_) if !read_max_api => meta.max_api = 0,
                Err(_) => {}
            },
            _ => {}
        }
    }

    if !read_id && !local {
        return Err(PropError::MissingId {
            source_name: source_name.to_string(),
        });
    }
    if !read_version_code {
        meta.version_code = 0;
        reject!(PropError::MissingVersionCode {
            source_name: source_name.to_string(),
        });
    }
    let name_unusable = meta.name.as_deref().map(is_invalid_value).unwrap_or(true);
    let name_is_id = !read_id && meta.name.as_deref() == Some(meta.id.as_str());
    if !read_name || name_unusable || name_is_id {
        meta.name = Some(make_name_from_id(&meta.id));
    }
    meta.version = Some(if read_version {
        shorten_version_name(meta.version.as_deref(), meta.version_code)
    } else {
        format!("v{}", meta.version_code)
    });
    if !read_description || meta.description.as_deref().map(is_invalid_value).unwrap_or(true) {
        meta.description = Some(String::new());
    }
    if !read_update_json {
        meta.update_json = UPDATE_JSON_FALLBACKS.get(&meta.id).cloned();
    }
    if meta.min_api == 0 || !read_min_api {
        apply_min_api_fallback(meta);
    }
    if meta.support.is_none() {
        meta.support = SUPPORT_FALLBACKS.get(meta.id.as_str()).map(|s| s.to_string());
    }
    if meta.config.is_none() {
        meta.config = CONFIG_FALLBACKS.get(meta.id.as_str()).map(|s| s.to_string());
    }
    if !read_mmt_reborn {
        meta.mmt_reborn = compat.flags_for(&meta.id).contains(CompatFlags::MMT_REBORN);
    }
    if local && meta.author.is_none() {
        meta.author = Some("Unknown".to_string());
    }
    if invalid {
        meta.flags.insert(StatusFlags::METADATA_INVALID);
    }
    Ok(())
}

/// Fill support/config/minApi from the well-known module tables when unset
pub fn apply_fallbacks(meta: &mut ModuleMetadata) {
    if meta.support.as_deref().map(str::is_empty).unwrap_or(true) {
        meta.support = SUPPORT_FALLBACKS.get(meta.id.as_str()).map(|s| s.to_string());
    }
    if meta.config.as_deref().map(str::is_empty).unwrap_or(true) {
        meta.config = CONFIG_FALLBACKS.get(meta.id.as_str()).map(|s| s.to_string());
    }
    if meta.min_api == 0 {
        apply_min_api_fallback(meta);
    }
}

fn apply_min_api_fallback(meta: &mut ModuleMetadata) {
    if let Some(api) = MIN_API_FALLBACKS.get(meta.id.as_str()) {
        meta.min_api = *api;
    } else if meta.id.starts_with("riru_") || meta.id.starts_with("riru-") {
        meta.min_api = RIRU_MIN_API;
    }
}

/// Read a single key with a simple line scan, last occurrence wins
pub fn read_simple(content: &str, key: &str) -> Option<String> {
    let prefix = format!("{key}=");
    content
        .lines()
        .map(|line| line.trim_start_matches('\0'))
        .filter_map(|line| line.strip_prefix(prefix.as_str()))
        .map(|value| value.trim().to_string())
        .last()
}

pub fn read_module_id(content: &str) -> Option<String> {
    read_simple(content, "id")
}

/// Accepts `24100` as well as `24.1` (meaning 24100)
pub fn parse_magisk_version(value: &str) -> Option<u32> {
    match value.split_once('.') {
        None => value.parse().ok(),
        Some((major, minor)) => {
            let major: u32 = major.parse().ok()?;
            let minor: u32 = minor.parse().ok()?;
            Some(major * 1000 + minor * 100)
        }
    }
}

/// URLs must be https with a dotted host followed by a path
pub fn is_invalid_url(url: &str) -> bool {
    let tail = url.get(8..).unwrap_or("");
    let slash = tail.find('/');
    let dot = tail.find('.');
    match (slash, dot) {
        (Some(slash), Some(dot)) => {
            dot >= slash || !url.starts_with("https://") || url.len() <= 12 || url.contains('\0')
        }
        _ => true,
    }
}

/// `foo_bar` becomes `Foo bar`
pub fn make_name_from_id(module_id: &str) -> String {
    let mut chars = module_id.chars();
    match chars.next() {
        Some(first) => {
            let rest: String = chars.collect();
            format!("{}{}", first.to_uppercase(), rest.replace('_', " "))
        }
        None => String::new(),
    }
}

/// Keep version names at most 16 characters
pub fn shorten_version_name(version: Option<&str>, version_code: i64) -> String {
    let version = match version {
        Some(v) if !v.is_empty() && v != "null" => v,
        _ => return format!("v{version_code}"),
    };
    if version.chars().count() <= 16 {
        return version.to_string();
    }
    match (version.find('.'), version.rfind('.')) {
        (Some(first), Some(last)) if last <= 16 && first != last && !version.contains(' ') => {
            version[..last].to_string()
        }
        _ => format!("v{version_code}"),
    }
}

/// Heuristic for modules not worth listing
pub fn is_low_quality(meta: &ModuleMetadata, compat: &CompatTable) -> bool {
    let name = meta.name.as_deref().unwrap_or("");
    let description = match meta.description.as_deref() {
        Some(d) if !d.is_empty() && d != "null" && !is_invalid_value(d) => d,
        _ => return true,
    };
    let author_ok = meta.author.as_deref().map(|a| !is_invalid_value(a)).unwrap_or(false);

    meta.has_flag(StatusFlags::METADATA_INVALID)
        || name.chars().count() < 3
        || meta.version_code < 0
        || !author_ok
        || description.to_lowercase() == name.to_lowercase()
        || compat.flags_for(&meta.id).contains(CompatFlags::LOW_QUALITY)
        || meta.id.starts_with('.')
}

/// A value is invalid when it has no visible character or carries a NUL
fn is_invalid_value(value: &str) -> bool {
    !value.chars().any(|c| !c.is_whitespace() && !c.is_control()) || value.contains('\0')
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}
