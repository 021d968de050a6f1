//! Module archive inspection and repair
//!
//! Archives arrive in three shapes: a native module with `module.prop` at
//! its root, an AnyKernel3 style kernel package marked by
//! `tools/ak3-core.sh`, or a recovery flashable that wraps a module behind
//! `META-INF/com/google/android`. Each shape may also sit one folder deep,
//! as GitHub source exports do, in which case the archive is rewritten
//! before it is installed.

use serde::Serialize;
use std::collections::HashSet;
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::props::read_module_id;

pub const MODULE_PROP: &str = "module.prop";
pub const KERNEL_MARKER: &str = "tools/ak3-core.sh";
pub const WRAPPED_PROP: &str = "META-INF/com/google/android/magisk/module.prop";
pub const UPDATE_BINARY: &str = "META-INF/com/google/android/update-binary";

const VKS_INSTALL: &str = "common/addon/Volume-Key-Selector/install.sh";
const VKS_KEYCHECK_ARM64: &str = "common/addon/Volume-Key-Selector/tools/arm64/keycheck";
const ZBIN_KEYCHECK_ARM64: &str = "META-INF/zbin/keycheck_arm64";
const ZBIN_KEYCHECK_ARM: &str = "META-INF/zbin/keycheck_arm";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("File is not a valid zip file: {0}")]
    Zip(#[from] ZipError),

    #[error("Failed to rewrite archive: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    /// `module.prop` describes the module directly
    Module,
    /// AnyKernel3 style kernel package
    Kernel,
    /// Recovery flashable wrapping a module
    Wrapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ArchiveKind,
    /// Entries sit one folder deep and must be moved to the root
    pub needs_patch: bool,
}

/// Repair a header byte that makes some archives unreadable.
///
/// Returns whether the buffer was changed.
pub fn fix_header_quirk(bytes: &mut [u8]) -> bool {
    if bytes.len() > 8 && bytes[6] == 0 && bytes[7] == 0 && bytes[8] == 8 {
        bytes[7] = 8;
        return true;
    }
    false
}

/// Entry names in archive order
pub fn entry_names(bytes: &[u8]) -> Result<Vec<String>, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        names.push(archive.by_index(i)?.name().to_string());
    }
    Ok(names)
}

fn nested_under_one_folder(name: &str, marker: &str) -> bool {
    name.split_once('/')
        .is_some_and(|(prefix, rest)| !prefix.is_empty() && rest == marker)
}

/// Classify an archive by its entry names.
///
/// Root markers win over nested ones; within a level a native module wins
/// over a kernel package, which wins over a wrapped installer.
pub fn classify<S: AsRef<str>>(names: &[S]) -> Option<Classification> {
    let root: HashSet<&str> = names.iter().map(AsRef::as_ref).collect();
    let root_kind = if root.contains(MODULE_PROP) {
        Some(ArchiveKind::Module)
    } else if root.contains(KERNEL_MARKER) {
        Some(ArchiveKind::Kernel)
    } else if root.contains(WRAPPED_PROP) {
        Some(ArchiveKind::Wrapped)
    } else {
        None
    };
    if let Some(kind) = root_kind {
        return Some(Classification {
            kind,
            needs_patch: false,
        });
    }

    let nested = |marker: &str| root.iter().any(|name| nested_under_one_folder(name, marker));
    let kind = if nested(MODULE_PROP) {
        ArchiveKind::Module
    } else if nested(KERNEL_MARKER) {
        ArchiveKind::Kernel
    } else if nested(UPDATE_BINARY) {
        ArchiveKind::Wrapped
    } else {
        return None;
    };
    Some(Classification {
        kind,
        needs_patch: true,
    })
}

/// Copy every entry into a new archive, renaming or dropping it through
/// `rename`
fn rewrite<F>(bytes: &[u8], mut rename: F) -> Result<Vec<u8>, ArchiveError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(bytes.len())));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut buf = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(name) = rename(entry.name()) else {
            continue;
        };
        if entry.is_dir() {
            writer.add_directory(name, options)?;
            continue;
        }
        buf.clear();
        entry.read_to_end(&mut buf)?;
        writer.start_file(name, options)?;
        writer.write_all(&buf)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Move the contents of a single top-level folder to the archive root.
///
/// Only applies when the folder is the archive's sole top-level entry and
/// its contents form a recognised module once moved. Returns `None` when
/// the archive is left as is.
pub fn rehome(bytes: &[u8]) -> Result<Option<Vec<u8>>, ArchiveError> {
    let names = entry_names(bytes)?;
    if classify(&names).is_some_and(|c| !c.needs_patch) {
        return Ok(None);
    }

    let mut tops = names.iter().map(|name| name.split_once('/').map(|(top, _)| top));
    let Some(Some(top)) = tops.next() else {
        return Ok(None);
    };
    if top.is_empty() || !tops.all(|t| t == Some(top)) {
        return Ok(None);
    }

    let prefix = format!("{top}/");
    let inner: Vec<&str> = names
        .iter()
        .filter_map(|name| name.strip_prefix(prefix.as_str()))
        .filter(|name| !name.is_empty())
        .collect();
    if !classify(&inner).is_some_and(|c| !c.needs_patch) {
        return Ok(None);
    }

    tracing::debug!("Moving contents of {} to the archive root", prefix);
    let rehomed = rewrite(bytes, |name| {
        name.strip_prefix(prefix.as_str())
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    })?;
    Ok(Some(rehomed))
}

/// Strip the first path segment from every entry, dropping root-level
/// entries and version control metadata
pub fn patch(bytes: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    rewrite(bytes, |name| {
        let first = name.chars().next()?.len_utf8();
        let slash = name[first..].find('/')? + first;
        let rest = &name[slash + 1..];
        if rest.is_empty() || rest.starts_with(".git") {
            return None;
        }
        Some(rest.to_string())
    })
}

/// Signals read from an archive that is laid out at its root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub module_id: Option<String>,
    /// `module.prop` at the root
    pub magisk_module: bool,
    /// Module descriptor found only behind the recovery wrapper
    pub wrapped_module: bool,
    /// The update binary identifies itself as AnyKernel3
    pub any_kernel3: bool,
    /// Ships 32-bit only key check helpers
    pub needs_32bit: bool,
    /// Only a `setup.sh`, which needs the MMT-Reborn runtime
    pub mmt_reborn: bool,
}

fn read_entry(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, ArchiveError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut raw = Vec::new();
    entry.read_to_end(&mut raw)?;
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

pub fn inspect(bytes: &[u8]) -> Result<ArchiveInfo, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let names: HashSet<String> = archive.file_names().map(str::to_string).collect();
    let has = |name: &str| names.contains(name);

    let mut info = ArchiveInfo::default();
    if has(KERNEL_MARKER) {
        info.any_kernel3 = read_entry(&mut archive, UPDATE_BINARY)?
            .is_some_and(|script| script.lines().any(|l| l.contains("AnyKernel3")));
    }

    let vks_needs_32bit = !has(VKS_KEYCHECK_ARM64) && has(VKS_INSTALL);
    info.needs_32bit = (vks_needs_32bit || !has(ZBIN_KEYCHECK_ARM64)) && has(ZBIN_KEYCHECK_ARM);

    info.magisk_module = has(MODULE_PROP);
    info.mmt_reborn = info.magisk_module
        && !has("install.sh")
        && !has("customize.sh")
        && has("setup.sh");
    info.wrapped_module = !info.magisk_module && has(WRAPPED_PROP);

    let prop = if info.magisk_module {
        Some(MODULE_PROP)
    } else if info.wrapped_module {
        Some(WRAPPED_PROP)
    } else {
        None
    };
    if let Some(prop) = prop {
        info.module_id = read_entry(&mut archive, prop)?.and_then(|c| read_module_id(&c));
    }
    Ok(info)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Build an in-memory zip; names ending in `/` become directories
    pub(crate) fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, content) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn kind(names: &[&str]) -> Option<(ArchiveKind, bool)> {
        classify(names).map(|c| (c.kind, c.needs_patch))
    }

    #[test]
    fn test_classify_root_markers() {
        assert_eq!(
            kind(&["module.prop", "customize.sh"]),
            Some((ArchiveKind::Module, false))
        );
        assert_eq!(
            kind(&["tools/ak3-core.sh", "anykernel.sh"]),
            Some((ArchiveKind::Kernel, false))
        );
        assert_eq!(kind(&[WRAPPED_PROP]), Some((ArchiveKind::Wrapped, false)));
        assert_eq!(kind(&["README.md", "src/main.c"]), None);
    }

    #[test]
    fn test_classify_precedence() {
        assert_eq!(
            kind(&["tools/ak3-core.sh", "module.prop"]),
            Some((ArchiveKind::Module, false))
        );
        assert_eq!(
            kind(&[WRAPPED_PROP, "tools/ak3-core.sh"]),
            Some((ArchiveKind::Kernel, false))
        );
        // A root marker beats a nested one of a higher ranked kind
        assert_eq!(
            kind(&["repo-main/module.prop", WRAPPED_PROP]),
            Some((ArchiveKind::Wrapped, false))
        );
    }

    #[test]
    fn test_classify_nested_markers() {
        assert_eq!(
            kind(&["repo-main/", "repo-main/module.prop"]),
            Some((ArchiveKind::Module, true))
        );
        assert_eq!(
            kind(&["ak3-master/tools/ak3-core.sh"]),
            Some((ArchiveKind::Kernel, true))
        );
        assert_eq!(
            kind(&["x/META-INF/com/google/android/update-binary"]),
            Some((ArchiveKind::Wrapped, true))
        );
        // Two folders deep is not recognised
        assert_eq!(kind(&["a/b/module.prop"]), None);
    }

    #[test]
    fn test_fix_header_quirk() {
        let mut bytes = vec![0x50, 0x4b, 3, 4, 20, 0, 0, 0, 8, 0];
        assert!(fix_header_quirk(&mut bytes));
        assert_eq!(bytes[7], 8);
        assert!(!fix_header_quirk(&mut bytes));
        assert!(!fix_header_quirk(&mut [0, 0, 0]));
    }

    #[test]
    fn test_patch_strips_first_segment() {
        let zip = zip_of(&[
            ("README.md", "root file"),
            ("repo-main/", ""),
            ("repo-main/module.prop", "id=foo\n"),
            ("repo-main/.gitignore", "*.o"),
            ("repo-main/.git/HEAD", "ref"),
            ("repo-main/system/bin/foo", "bin"),
        ]);
        let patched = patch(&zip).unwrap();
        assert_eq!(
            entry_names(&patched).unwrap(),
            vec!["module.prop", "system/bin/foo"]
        );
    }

    #[test]
    fn test_patch_non_ascii_folder_name() {
        let zip = zip_of(&[
            ("émod/", ""),
            ("émod/module.prop", "id=emod\n"),
            ("émod/customize.sh", "ui_print hi"),
        ]);
        let patched = patch(&zip).unwrap();
        assert_eq!(
            entry_names(&patched).unwrap(),
            vec!["module.prop", "customize.sh"]
        );
    }

    #[test]
    fn test_rehome_single_folder() {
        let zip = zip_of(&[
            ("foo-1.0/", ""),
            ("foo-1.0/module.prop", "id=foo\n"),
            ("foo-1.0/customize.sh", "echo hi"),
        ]);
        let rehomed = rehome(&zip).unwrap().unwrap();
        let names = entry_names(&rehomed).unwrap();
        assert_eq!(names, vec!["module.prop", "customize.sh"]);
        assert_eq!(classify(&names).map(|c| c.needs_patch), Some(false));
    }

    #[test]
    fn test_rehome_leaves_other_layouts() {
        let flat = zip_of(&[("module.prop", "id=foo\n")]);
        assert_eq!(rehome(&flat).unwrap(), None);

        // META-INF alone is a wrapped installer, not a source folder
        let wrapped = zip_of(&[(WRAPPED_PROP, "id=foo\n"), (UPDATE_BINARY, "#!/sbin/sh")]);
        assert_eq!(rehome(&wrapped).unwrap(), None);

        let two_tops = zip_of(&[("a/module.prop", "id=foo\n"), ("b/x", "")]);
        assert_eq!(rehome(&two_tops).unwrap(), None);
    }

    #[test]
    fn test_inspect_module() {
        let zip = zip_of(&[
            ("module.prop", "id=my_mod\nname=Mine\n"),
            ("setup.sh", ""),
            (ZBIN_KEYCHECK_ARM, ""),
        ]);
        let info = inspect(&zip).unwrap();
        assert_eq!(info.module_id.as_deref(), Some("my_mod"));
        assert!(info.magisk_module);
        assert!(info.mmt_reborn);
        assert!(info.needs_32bit);
        assert!(!info.any_kernel3);
        assert!(!info.wrapped_module);
    }

    #[test]
    fn test_inspect_kernel_and_wrapped() {
        let kernel = zip_of(&[
            (KERNEL_MARKER, ""),
            (UPDATE_BINARY, "#!/sbin/sh\n# AnyKernel3 Backend\n"),
        ]);
        let info = inspect(&kernel).unwrap();
        assert!(info.any_kernel3);
        assert_eq!(info.module_id, None);

        let wrapped = zip_of(&[(WRAPPED_PROP, "id=wrapped_mod\n"), ("customize.sh", "")]);
        let info = inspect(&wrapped).unwrap();
        assert!(info.wrapped_module);
        assert!(!info.magisk_module);
        assert!(!info.mmt_reborn);
        assert_eq!(info.module_id.as_deref(), Some("wrapped_mod"));
    }

    #[test]
    fn test_invalid_zip() {
        assert!(matches!(entry_names(b"not a zip"), Err(ArchiveError::Zip(_))));
    }
}
