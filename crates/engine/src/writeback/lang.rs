//! Language file encoding and archive member access.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use zip::ZipArchive;
use zip::result::ZipError;

use modlocale_core::patch::language_content_hash;

use crate::error::EngineError;

pub type LanguageContent = BTreeMap<String, String>;

/// Pretty JSON with sorted keys and a trailing newline.
pub fn render(content: &LanguageContent) -> Result<Vec<u8>, EngineError> {
    let mut bytes =
        serde_json::to_vec_pretty(content).map_err(|e| EngineError::Validation(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn parse(bytes: &[u8]) -> Result<LanguageContent, EngineError> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::Validation(format!("invalid language file: {e}")))
}

/// Existing keys with `new` layered on top.
pub fn layer(existing: LanguageContent, new: &LanguageContent) -> LanguageContent {
    let mut merged = existing;
    merged.extend(new.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

pub fn content_hash(content: &LanguageContent) -> Result<String, EngineError> {
    Ok(language_content_hash(content)?)
}

/// Raw bytes of `member`, `None` when the archive has no such member.
pub fn read_member(archive_path: &Path, member: &str) -> Result<Option<Vec<u8>>, EngineError> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let mut file = match archive.by_name(member) {
        Ok(f) => f,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}

pub fn read_member_content(archive_path: &Path, member: &str) -> Result<Option<LanguageContent>, EngineError> {
    read_member(archive_path, member)?.map(|b| parse(&b)).transpose()
}

pub fn read_file_content(path: &Path) -> Result<Option<LanguageContent>, EngineError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(parse(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Temp file next to `target` that will be renamed over it. It carries the
/// target's permissions, or mode 0644 when the target does not exist yet.
pub fn temp_beside(target: &Path) -> Result<NamedTempFile, EngineError> {
    let dir = target
        .parent()
        .ok_or_else(|| EngineError::Validation(format!("no parent directory for {}", target.display())))?;
    let tmp = NamedTempFile::new_in(dir)?;
    match fs::metadata(target) {
        Ok(meta) => fs::set_permissions(tmp.path(), meta.permissions())?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => set_new_file_permissions(tmp.path())?,
        Err(e) => return Err(e.into()),
    }
    Ok(tmp)
}

#[cfg(unix)]
fn set_new_file_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_new_file_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Write `bytes` to `path` through a synced temp file in the same directory
/// and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    let mut tmp = temp_beside(path)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
