//! Full-file backups taken before destructive writes.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use modlocale_core::cid::ContentHasher;
use modlocale_core::ids::BackupId;
use modlocale_core::writeback::{BackupInfo, BackupState, BackupType};

use super::lang;
use crate::error::EngineError;

/// Backup files live in one directory; the registry tracks their state.
/// A backup is `Pending` while being copied and never cleaned up then.
pub struct BackupStore {
    dir: PathBuf,
    hasher: ContentHasher,
    registry: Mutex<BTreeMap<BackupId, BackupInfo>>,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>, hasher: ContentHasher) -> Self {
        Self {
            dir: dir.into(),
            hasher,
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve a backup slot for `original`.
    pub fn begin(&self, original: &Path) -> BackupInfo {
        let id = BackupId::new();
        let file_name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string());
        let info = BackupInfo {
            id,
            original_path: original.to_path_buf(),
            backup_path: self.dir.join(format!("{file_name}.{id}.bak")),
            backup_type: BackupType::Full,
            size_bytes: 0,
            content_hash: String::new(),
            created_at: Utc::now(),
            state: BackupState::Pending,
        };
        self.registry.lock().insert(id, info.clone());
        info
    }

    /// Copy, then check the copy against the original before marking it
    /// completed.
    pub fn create(&self, original: &Path) -> Result<BackupInfo, EngineError> {
        let mut info = self.begin(original);
        match self.copy_and_verify(&mut info) {
            Ok(()) => {
                info.state = BackupState::Completed;
                self.registry.lock().insert(info.id, info.clone());
                info!(
                    original = %original.display(),
                    backup = %info.backup_path.display(),
                    size = info.size_bytes,
                    "backup created"
                );
                Ok(info)
            }
            Err(e) => {
                self.registry.lock().remove(&info.id);
                let _ = fs::remove_file(&info.backup_path);
                Err(e)
            }
        }
    }

    fn copy_and_verify(&self, info: &mut BackupInfo) -> Result<(), EngineError> {
        fs::create_dir_all(&self.dir)?;
        let original_hash = self.hasher.compute_file(&info.original_path)?;
        fs::copy(&info.original_path, &info.backup_path)?;
        let copy_hash = self.hasher.compute_file(&info.backup_path)?;
        if copy_hash != original_hash {
            return Err(EngineError::Integrity {
                path: info.backup_path.display().to_string(),
                expected: original_hash.hash_value,
                actual: copy_hash.hash_value,
            });
        }
        info.size_bytes = copy_hash.byte_length;
        info.content_hash = copy_hash.hash_value;
        Ok(())
    }

    /// True when the backup file still hashes to its recorded value.
    pub fn verify(&self, info: &BackupInfo) -> Result<bool, EngineError> {
        match self.hasher.compute_file(&info.backup_path) {
            Ok(cid) => Ok(cid.hash_value == info.content_hash),
            Err(modlocale_core::CoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Put the backed-up bytes back over the original path atomically.
    pub fn restore(&self, info: &BackupInfo) -> Result<(), EngineError> {
        if !self.verify(info)? {
            return Err(EngineError::Integrity {
                path: info.backup_path.display().to_string(),
                expected: info.content_hash.clone(),
                actual: "unreadable or modified backup".to_string(),
            });
        }
        let mut tmp = lang::temp_beside(&info.original_path)?;
        if !info.original_path.exists() {
            // The copy kept the original's mode.
            fs::set_permissions(tmp.path(), fs::metadata(&info.backup_path)?.permissions())?;
        }
        io::copy(&mut fs::File::open(&info.backup_path)?, &mut tmp)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&info.original_path).map_err(|e| e.error)?;
        info!(original = %info.original_path.display(), backup = %info.backup_path.display(), "backup restored");
        Ok(())
    }

    pub fn get(&self, id: BackupId) -> Option<BackupInfo> {
        self.registry.lock().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<BackupInfo> {
        self.registry.lock().values().cloned().collect()
    }

    /// Track a backup created elsewhere, e.g. loaded from storage.
    pub fn register(&self, info: BackupInfo) {
        self.registry.lock().insert(info.id, info);
    }

    /// Delete completed backups older than `days`. Returns the removed ids.
    pub fn cleanup_older_than(&self, days: u32) -> Vec<BackupId> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let expired: Vec<BackupInfo> = {
            let mut registry = self.registry.lock();
            let ids: Vec<BackupId> = registry
                .values()
                .filter(|b| b.state == BackupState::Completed && b.created_at <= cutoff)
                .map(|b| b.id)
                .collect();
            ids.iter().filter_map(|id| registry.remove(id)).collect()
        };

        let mut removed = Vec::with_capacity(expired.len());
        for info in expired {
            match fs::remove_file(&info.backup_path) {
                Ok(()) => debug!(backup = %info.backup_path.display(), "expired backup removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(backup = %info.backup_path.display(), error = %e, "could not remove expired backup"),
            }
            removed.push(info.id);
        }
        removed
    }
}
