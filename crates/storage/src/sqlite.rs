use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};

use modlocale_core::{
    entry::{EntryStatus, QaFlags, TranslationEntry},
    ids::*,
    patch::PatchSet,
    writeback::{ApplyResult, BackupInfo},
};

use crate::error::StorageError;
use crate::traits::Storage;

const ENTRIES: &str = "entries";
const BASES: &str = "entry_bases";
const ENTRY_COLUMNS: &str = "uid, language_file_uid, key, src_text, dst_text, status, updated_at, qa_flags";

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("invalid timestamp {s}: {e}")))
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }
}

type EntryRow = (Vec<u8>, Vec<u8>, String, String, String, String, String, Vec<u8>);

fn entry_row(row: &rusqlite::Row) -> rusqlite::Result<EntryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn read_entry(row: EntryRow) -> Result<TranslationEntry, StorageError> {
    let (uid, file, key, src_text, dst_text, status, updated_at, qa_bytes) = row;
    let status = EntryStatus::parse(&status)
        .ok_or_else(|| StorageError::Serialization(format!("unknown entry status: {status}")))?;
    let qa_flags: QaFlags =
        rmp_serde::from_slice(&qa_bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(TranslationEntry {
        uid: EntryUid::from_bytes(to_array::<16>(uid, "uid")?),
        key,
        src_text,
        dst_text,
        status,
        language_file_uid: LanguageFileId::from_bytes(to_array::<16>(file, "language_file_uid")?),
        updated_at: parse_time(&updated_at)?,
        qa_flags,
    })
}

fn write_entry(conn: &Connection, table: &str, entry: &TranslationEntry) -> Result<(), StorageError> {
    let qa_bytes =
        rmp_serde::to_vec(&entry.qa_flags).map_err(|e| StorageError::Serialization(e.to_string()))?;
    conn.execute(
        &format!("INSERT OR REPLACE INTO {table} ({ENTRY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        rusqlite::params![
            entry.uid.as_bytes().as_slice(),
            entry.language_file_uid.as_bytes().as_slice(),
            entry.key,
            entry.src_text,
            entry.dst_text,
            entry.status.as_str(),
            format_time(&entry.updated_at),
            qa_bytes,
        ],
    )?;
    Ok(())
}

fn remove_entry(conn: &Connection, table: &str, uid: EntryUid) -> Result<bool, StorageError> {
    let n = conn.execute(
        &format!("DELETE FROM {table} WHERE uid = ?1"),
        rusqlite::params![uid.as_bytes().as_slice()],
    )?;
    Ok(n > 0)
}

impl SqliteStorage {
    fn query_entries(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<TranslationEntry>, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, entry_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(read_entry(row?)?);
        }
        Ok(out)
    }

    fn find_entry(&self, table: &str, uid: EntryUid) -> Result<Option<TranslationEntry>, StorageError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM {table} WHERE uid = ?1"),
                rusqlite::params![uid.as_bytes().as_slice()],
                entry_row,
            )
            .optional()?;
        row.map(read_entry).transpose()
    }

    fn query_apply_results(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ApplyResult>, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for payload in rows {
            out.push(ApplyResult::from_msgpack(&payload?)?);
        }
        Ok(out)
    }
}

fn decode_backup(payload: &[u8]) -> Result<BackupInfo, StorageError> {
    rmp_serde::from_slice(payload).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl Storage for SqliteStorage {
    fn get_entry(&self, uid: EntryUid) -> Result<Option<TranslationEntry>, StorageError> {
        self.find_entry(ENTRIES, uid)
    }

    fn put_entry(&mut self, entry: &TranslationEntry) -> Result<(), StorageError> {
        write_entry(&self.conn, ENTRIES, entry)
    }

    fn delete_entry(&mut self, uid: EntryUid) -> Result<bool, StorageError> {
        remove_entry(&self.conn, ENTRIES, uid)
    }

    fn list_entries(&self) -> Result<Vec<TranslationEntry>, StorageError> {
        self.query_entries(
            &format!("SELECT {ENTRY_COLUMNS} FROM {ENTRIES} ORDER BY language_file_uid, key"),
            [],
        )
    }

    fn entries_for_language_file(
        &self,
        language_file_uid: LanguageFileId,
    ) -> Result<Vec<TranslationEntry>, StorageError> {
        self.query_entries(
            &format!("SELECT {ENTRY_COLUMNS} FROM {ENTRIES} WHERE language_file_uid = ?1 ORDER BY key"),
            rusqlite::params![language_file_uid.as_bytes().as_slice()],
        )
    }

    fn get_base(&self, uid: EntryUid) -> Result<Option<TranslationEntry>, StorageError> {
        self.find_entry(BASES, uid)
    }

    fn put_base(&mut self, entry: &TranslationEntry) -> Result<(), StorageError> {
        write_entry(&self.conn, BASES, entry)
    }

    fn delete_base(&mut self, uid: EntryUid) -> Result<bool, StorageError> {
        remove_entry(&self.conn, BASES, uid)
    }

    fn list_bases(&self) -> Result<Vec<TranslationEntry>, StorageError> {
        self.query_entries(
            &format!("SELECT {ENTRY_COLUMNS} FROM {BASES} ORDER BY language_file_uid, key"),
            [],
        )
    }

    fn apply_merge(
        &mut self,
        uid: EntryUid,
        merged: Option<&TranslationEntry>,
        base: Option<&TranslationEntry>,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        match merged {
            Some(entry) => write_entry(&tx, ENTRIES, entry)?,
            None => {
                remove_entry(&tx, ENTRIES, uid)?;
            }
        }
        match base {
            Some(entry) => write_entry(&tx, BASES, entry)?,
            None => {
                remove_entry(&tx, BASES, uid)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn save_patch_set(&mut self, set: &PatchSet) -> Result<(), StorageError> {
        let manifest = set.export_manifest()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO patch_sets (id, name, status, version, manifest) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                set.id.as_bytes().as_slice(),
                set.name,
                set.status.as_str(),
                set.version,
                manifest,
            ],
        )?;
        Ok(())
    }

    fn get_patch_set(&self, id: PatchSetId) -> Result<Option<PatchSet>, StorageError> {
        let manifest: Option<String> = self
            .conn
            .query_row(
                "SELECT manifest FROM patch_sets WHERE id = ?1",
                rusqlite::params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        match manifest {
            Some(json) => Ok(Some(PatchSet::from_manifest(&json)?)),
            None => Ok(None),
        }
    }

    fn list_patch_sets(&self) -> Result<Vec<PatchSet>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT manifest FROM patch_sets ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for json in rows {
            out.push(PatchSet::from_manifest(&json?)?);
        }
        Ok(out)
    }

    fn append_apply_result(&mut self, result: &ApplyResult) -> Result<(), StorageError> {
        let payload = result.to_msgpack()?;
        self.conn.execute(
            "INSERT INTO apply_results (plan_id, target_path, success, payload) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                result.plan_id.as_bytes().as_slice(),
                result.target_path.to_string_lossy().into_owned(),
                result.success,
                payload,
            ],
        )?;
        Ok(())
    }

    fn apply_results_for_plan(&self, plan_id: PlanId) -> Result<Vec<ApplyResult>, StorageError> {
        self.query_apply_results(
            "SELECT payload FROM apply_results WHERE plan_id = ?1 ORDER BY rowid",
            rusqlite::params![plan_id.as_bytes().as_slice()],
        )
    }

    fn apply_results_for_target(&self, target: &Path) -> Result<Vec<ApplyResult>, StorageError> {
        self.query_apply_results(
            "SELECT payload FROM apply_results WHERE target_path = ?1 ORDER BY rowid",
            rusqlite::params![target.to_string_lossy().into_owned()],
        )
    }

    fn apply_result_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM apply_results", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn save_backup(&mut self, info: &BackupInfo) -> Result<(), StorageError> {
        let payload =
            rmp_serde::to_vec_named(info).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.conn.execute(
            "INSERT OR REPLACE INTO backups (id, original_path, backup_path, state, created_at, payload) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                info.id.as_bytes().as_slice(),
                info.original_path.to_string_lossy().into_owned(),
                info.backup_path.to_string_lossy().into_owned(),
                info.state.as_str(),
                format_time(&info.created_at),
                payload,
            ],
        )?;
        Ok(())
    }

    fn get_backup(&self, id: BackupId) -> Result<Option<BackupInfo>, StorageError> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM backups WHERE id = ?1",
                rusqlite::params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        payload.as_deref().map(decode_backup).transpose()
    }

    fn list_backups(&self) -> Result<Vec<BackupInfo>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT payload FROM backups ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for payload in rows {
            out.push(decode_backup(&payload?)?);
        }
        Ok(out)
    }

    fn delete_backup(&mut self, id: BackupId) -> Result<bool, StorageError> {
        let n = self.conn.execute(
            "DELETE FROM backups WHERE id = ?1",
            rusqlite::params![id.as_bytes().as_slice()],
        )?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlocale_core::field_value::FieldValue;
    use modlocale_core::patch::{PatchItem, PatchPolicy};
    use modlocale_core::writeback::{BackupState, BackupType, WritebackPlan, WritebackStatus, WritebackStrategy};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn entry(file: LanguageFileId, key: &str, dst: &str) -> TranslationEntry {
        let mut e = TranslationEntry::new(file, key, "source");
        e.translate(dst);
        e.qa_flags.insert("checked".into(), FieldValue::Boolean(true));
        e
    }

    #[test]
    fn entry_roundtrip_and_delete() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let e = entry(LanguageFileId::new(), "item.a", "A");
        storage.put_entry(&e).unwrap();
        assert_eq!(storage.get_entry(e.uid).unwrap(), Some(e.clone()));
        assert!(storage.delete_entry(e.uid).unwrap());
        assert!(!storage.delete_entry(e.uid).unwrap());
        assert!(storage.get_entry(e.uid).unwrap().is_none());
    }

    #[test]
    fn entries_are_grouped_by_language_file() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let de = LanguageFileId::new();
        let fr = LanguageFileId::new();
        storage.put_entry(&entry(de, "b", "B")).unwrap();
        storage.put_entry(&entry(de, "a", "A")).unwrap();
        storage.put_entry(&entry(fr, "a", "Á")).unwrap();

        let keys: Vec<String> = storage
            .entries_for_language_file(de)
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(storage.list_entries().unwrap().len(), 3);
    }

    #[test]
    fn apply_merge_writes_entry_and_base_together() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let e = entry(LanguageFileId::new(), "k", "v");
        storage.apply_merge(e.uid, Some(&e), Some(&e)).unwrap();
        assert!(storage.get_entry(e.uid).unwrap().is_some());
        assert!(storage.get_base(e.uid).unwrap().is_some());

        storage.apply_merge(e.uid, None, None).unwrap();
        assert!(storage.get_entry(e.uid).unwrap().is_none());
        assert!(storage.list_bases().unwrap().is_empty());
    }

    #[test]
    fn patch_set_roundtrip() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let mut set = PatchSet::new("release");
        let mut item = PatchItem::new(set.id, "jar", "mod", "de_de", PatchPolicy::Overlay);
        item.set_content(BTreeMap::from([("k".to_string(), "v".to_string())])).unwrap();
        set.add_item(item).unwrap();
        set.publish().unwrap();

        storage.save_patch_set(&set).unwrap();
        assert_eq!(storage.get_patch_set(set.id).unwrap(), Some(set.clone()));
        assert_eq!(storage.list_patch_sets().unwrap().len(), 1);
        assert!(storage.get_patch_set(PatchSetId::new()).unwrap().is_none());
    }

    #[test]
    fn apply_results_by_plan_and_target() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let plan = WritebackPlan {
            plan_id: PlanId::new(),
            strategy: WritebackStrategy::Overlay,
            target_path: PathBuf::from("/packs/mod_de_de"),
            content: BTreeMap::new(),
            expected_hash: None,
            expected_pre_image_hash: None,
            namespace: "mod".into(),
            locale: "de_de".into(),
            member_path: "assets/mod/lang/de_de.json".into(),
            merge_existing: false,
            backup_required: false,
            status: WritebackStatus::Pending,
            patch_item_id: None,
            error_message: None,
            created_at: Utc::now(),
            applied_at: None,
        };
        let mut first = ApplyResult::started(&plan);
        first.success = true;
        first.finish();
        let mut second = ApplyResult::started(&plan);
        second.fail("boom");
        second.finish();
        storage.append_apply_result(&first).unwrap();
        storage.append_apply_result(&second).unwrap();

        let by_plan = storage.apply_results_for_plan(plan.plan_id).unwrap();
        assert_eq!(by_plan, vec![first, second]);
        assert_eq!(storage.apply_results_for_target(Path::new("/packs/mod_de_de")).unwrap().len(), 2);
        assert!(storage.apply_results_for_target(Path::new("/elsewhere")).unwrap().is_empty());
        assert_eq!(storage.apply_result_count().unwrap(), 2);
    }

    #[test]
    fn backup_records() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let info = BackupInfo {
            id: BackupId::new(),
            original_path: PathBuf::from("/mods/a.jar"),
            backup_path: PathBuf::from("/backups/a.jar.bak"),
            backup_type: BackupType::Full,
            size_bytes: 42,
            content_hash: "ff".repeat(32),
            created_at: Utc::now(),
            state: BackupState::Completed,
        };
        storage.save_backup(&info).unwrap();
        assert_eq!(storage.get_backup(info.id).unwrap(), Some(info.clone()));
        assert_eq!(storage.list_backups().unwrap(), vec![info.clone()]);
        assert!(storage.delete_backup(info.id).unwrap());
        assert!(storage.get_backup(info.id).unwrap().is_none());
    }
}
