use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use modlocale_core::{entry::TranslationEntry, ids::*};
use modlocale_engine::writeback::lang::{self, LanguageContent};
use modlocale_engine::{Engine, EngineConfig};
use modlocale_storage::SqliteStorage;

pub struct TestPeer {
    pub engine: Engine,
    pub workspace: TempDir,
    pub language_file: LanguageFileId,
}

impl TestPeer {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_config(LanguageFileId::new(), EngineConfig::default())
    }

    /// Peer whose entries belong to `language_file`, with writeback
    /// directories inside a fresh temp workspace.
    pub fn with_config(
        language_file: LanguageFileId,
        config: EngineConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let workspace = tempfile::tempdir()?;
        let storage = SqliteStorage::open_in_memory()?;
        let engine = Engine::new(storage, config.with_workspace(workspace.path()))?;
        Ok(Self {
            engine,
            workspace,
            language_file,
        })
    }

    /// Create an entry, translated when `dst_text` is given.
    pub fn add_entry(
        &mut self,
        key: &str,
        src_text: &str,
        dst_text: Option<&str>,
    ) -> Result<EntryUid, Box<dyn std::error::Error>> {
        let mut entry = self.engine.create_entry(self.language_file, key, src_text)?;
        if let Some(dst) = dst_text {
            entry.translate(dst);
            self.engine.put_entry(&entry)?;
        }
        Ok(entry.uid)
    }

    pub fn translate(&mut self, uid: EntryUid, dst_text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.engine.translate(uid, dst_text)?;
        Ok(())
    }

    pub fn entry(&self, uid: EntryUid) -> Result<Option<TranslationEntry>, Box<dyn std::error::Error>> {
        Ok(self.engine.get_entry(uid)?)
    }

    pub fn dst_text(&self, uid: EntryUid) -> Result<Option<String>, Box<dyn std::error::Error>> {
        Ok(self.entry(uid)?.map(|e| e.dst_text))
    }

    /// Directory holding this peer's mod archives.
    pub fn mods_dir(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dir = self.workspace.path().join("mods");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Build a mod archive with a manifest, a class file and one language
    /// member.
    pub fn write_mod_jar(
        &self,
        name: &str,
        namespace: &str,
        locale: &str,
        content: &LanguageContent,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let path = self.mods_dir()?.join(name);
        write_jar(&path, &format!("assets/{namespace}/lang/{locale}.json"), &lang::render(content)?)?;
        Ok(path)
    }
}

fn write_jar(path: &Path, member: &str, lang_bytes: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = ZipWriter::new(fs::File::create(path)?);
    let options = SimpleFileOptions::default();
    writer.start_file("META-INF/MANIFEST.MF", options)?;
    writer.write_all(b"Manifest-Version: 1.0\n")?;
    writer.start_file("META-INF/mods.toml", options)?;
    writer.write_all(b"modLoader = \"javafml\"\n")?;
    writer.start_file(member, options)?;
    writer.write_all(lang_bytes)?;
    writer.start_file("com/example/ExampleMod.class", options)?;
    writer.write_all(&[0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 61])?;
    writer.finish()?;
    Ok(())
}
