use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use modlocale_core::{
    CoreError,
    ids::PlanId,
    patch::{PatchPolicy, PatchSet, PatchStatus},
    writeback::{WritebackStatus, WritebackStrategy},
};
use modlocale_engine::{
    Engine, EngineConfig, EngineError, PlanRequest, RollbackTarget,
    writeback::{
        failpoints::MID_REWRITE,
        lang::{self, LanguageContent},
    },
};
use modlocale_harness::{TestPeer, init_tracing};
use modlocale_storage::{SqliteStorage, Storage};
use zip::ZipArchive;

const LANG_MEMBER: &str = "assets/example/lang/de_de.json";

fn content(pairs: &[(&str, &str)]) -> LanguageContent {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Peer with two translated entries, one untranslated entry and a mod
/// archive whose German file only knows the gem.
fn translated_peer() -> Result<(TestPeer, std::path::PathBuf), Box<dyn std::error::Error>> {
    init_tracing();
    let mut peer = TestPeer::new()?;
    peer.add_entry("item.example.gem", "Gem", Some("Edelstein"))?;
    peer.add_entry("block.example.ore", "Ore", Some("Erz"))?;
    peer.add_entry("item.example.dust", "Dust", None)?;
    let jar = peer.write_mod_jar("example.jar", "example", "de_de", &content(&[("item.example.gem", "Gem")]))?;
    Ok((peer, jar))
}

/// Member name -> (crc32, decompressed bytes).
fn members(path: &Path) -> Result<BTreeMap<String, (u32, Vec<u8>)>, Box<dyn std::error::Error>> {
    let mut archive = ZipArchive::new(fs::File::open(path)?)?;
    let mut out = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        out.insert(file.name().to_string(), (file.crc32(), bytes));
    }
    Ok(out)
}

fn publish(peer: &mut TestPeer, policy: PatchPolicy, container: &str, anchor: Option<String>) -> Result<PatchSet, Box<dyn std::error::Error>> {
    let mut set = PatchSet::new("german update");
    let mut item = peer
        .engine
        .build_patch_item(set.id, peer.language_file, container, "example", "de_de", policy)?;
    if let Some(anchor) = anchor {
        item = item.with_anchor(anchor);
    }
    set.add_item(item)?;
    peer.engine.save_patch_set(&set)?;
    Ok(peer.engine.publish_patch_set(set.id)?)
}

// ============================================================================
// Patch model
// ============================================================================

#[test]
fn patch_item_holds_translated_entries_only() -> Result<(), Box<dyn std::error::Error>> {
    let (peer, _) = translated_peer()?;
    let set = PatchSet::new("draft");
    let item = peer
        .engine
        .build_patch_item(set.id, peer.language_file, "example.jar", "example", "de_de", PatchPolicy::Replace)?;

    assert_eq!(item.content, content(&[("block.example.ore", "Erz"), ("item.example.gem", "Edelstein")]));
    assert_eq!(item.expected_entry_count, Some(2));
    assert_eq!(item.content_hash(), Some(lang::content_hash(&item.content)?.as_str()));
    assert_eq!(item.target_path(), LANG_MEMBER);
    Ok(())
}

#[test]
fn empty_language_file_cannot_be_patched() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    peer.add_entry("item.example.dust", "Dust", None)?;
    let result = peer.engine.build_patch_item(
        PatchSet::new("x").id,
        peer.language_file,
        "example.jar",
        "example",
        "de_de",
        PatchPolicy::Replace,
    );
    assert!(matches!(result, Err(EngineError::Validation(_))));
    Ok(())
}

#[test]
fn manifest_survives_storage_and_export() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, _) = translated_peer()?;
    let published = publish(&mut peer, PatchPolicy::Replace, "example.jar", None)?;
    let stored = peer.engine.get_patch_set(published.id)?.ok_or("patch set missing")?;
    assert_eq!(stored, published);
    assert!(stored.verify_signature());

    let manifest = stored.export_manifest()?;
    assert_eq!(PatchSet::from_manifest(&manifest)?, stored);

    let tampered = manifest.replace("Edelstein", "Edelstain");
    assert!(matches!(PatchSet::from_manifest(&tampered), Err(CoreError::Integrity { .. })));

    let revision = stored.derive_revision();
    assert_ne!(revision.id, stored.id);
    assert_eq!(revision.status, PatchStatus::Draft);
    assert_eq!(revision.version, stored.version + 1);
    Ok(())
}

#[test]
fn merge_item_without_anchor_does_not_publish() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, _) = translated_peer()?;
    let result = publish(&mut peer, PatchPolicy::Merge, "example.jar", None);
    let err = result.err().ok_or("publish accepted a merge item without anchor")?;
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Core(CoreError::PatchValidation(_)))
    ));
    Ok(())
}

// ============================================================================
// Applying patch sets
// ============================================================================

#[test]
fn replace_rewrites_member_and_keeps_the_rest() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, jar) = translated_peer()?;
    let before = members(&jar)?;
    let set = publish(&mut peer, PatchPolicy::Replace, "example.jar", None)?;

    let results = peer.engine.apply_patch_set(set.id, &peer.mods_dir()?)?;
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(result.success, "{:?}", result.errors);
    assert!(result.hash_verified);
    assert!(result.backup.is_some());
    assert_eq!(result.entries_written, 2);

    let after = members(&jar)?;
    assert_eq!(before.keys().collect::<Vec<_>>(), after.keys().collect::<Vec<_>>());
    for (name, entry) in &before {
        if name != LANG_MEMBER {
            assert_eq!(Some(entry), after.get(name), "{name} changed");
        }
    }
    let written = lang::parse(&after[LANG_MEMBER].1)?;
    assert_eq!(written, content(&[("block.example.ore", "Erz"), ("item.example.gem", "Edelstein")]));

    let stored = peer.engine.get_patch_set(set.id)?.ok_or("patch set missing")?;
    assert_eq!(stored.status, PatchStatus::Applied);
    assert_eq!(peer.engine.apply_history_for_target(&jar)?.len(), 1);
    assert_eq!(peer.engine.storage().list_backups()?.len(), 1);
    Ok(())
}

#[test]
fn merge_layers_over_existing_member() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, jar) = translated_peer()?;
    let jar = {
        let existing = content(&[("item.example.gem", "Gem"), ("item.example.rod", "Stab")]);
        fs::remove_file(&jar)?;
        let rebuilt = peer.write_mod_jar("example.jar", "example", "de_de", &existing)?;
        assert_eq!(rebuilt, jar);
        rebuilt
    };
    let anchor = lang::content_hash(&content(&[("item.example.gem", "Gem"), ("item.example.rod", "Stab")]))?;
    let set = publish(&mut peer, PatchPolicy::Merge, "example.jar", Some(anchor))?;

    let results = peer.engine.apply_patch_set(set.id, &peer.mods_dir()?)?;
    assert!(results[0].success);
    assert_eq!(results[0].entries_skipped, 1);
    let written = lang::read_member_content(&jar, LANG_MEMBER)?.ok_or("member missing")?;
    assert_eq!(
        written,
        content(&[
            ("block.example.ore", "Erz"),
            ("item.example.gem", "Edelstein"),
            ("item.example.rod", "Stab"),
        ])
    );
    Ok(())
}

#[test]
fn stale_anchor_blocks_apply() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, jar) = translated_peer()?;
    let original = fs::read(&jar)?;
    let set = publish(&mut peer, PatchPolicy::Merge, "example.jar", Some("0".repeat(64)))?;

    let results = peer.engine.apply_patch_set(set.id, &peer.mods_dir()?)?;
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert!(results[0].errors[0].contains("preconditions failed"), "{:?}", results[0].errors);
    assert_eq!(fs::read(&jar)?, original);
    assert_eq!(peer.engine.apply_history_for_target(&jar)?.len(), 1);
    let stored = peer.engine.get_patch_set(set.id)?.ok_or("patch set missing")?;
    assert_eq!(stored.status, PatchStatus::Published);
    Ok(())
}

#[test]
fn failing_item_does_not_hide_earlier_results() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, jar) = translated_peer()?;
    let other = peer.write_mod_jar("other.jar", "example", "de_de", &content(&[("item.example.gem", "Gem")]))?;
    let other_original = fs::read(&other)?;

    let mut set = PatchSet::new("two mods");
    let replace = peer
        .engine
        .build_patch_item(set.id, peer.language_file, "example.jar", "example", "de_de", PatchPolicy::Replace)?;
    let stale = peer
        .engine
        .build_patch_item(set.id, peer.language_file, "other.jar", "example", "de_de", PatchPolicy::Merge)?
        .with_anchor("0".repeat(64));
    set.add_item(replace)?;
    set.add_item(stale)?;
    peer.engine.save_patch_set(&set)?;
    peer.engine.publish_patch_set(set.id)?;

    let results = peer.engine.apply_patch_set(set.id, &peer.mods_dir()?)?;
    assert_eq!(results.len(), 2);
    assert!(results[0].success, "{:?}", results[0].errors);
    assert_eq!(results[0].target_path, jar);
    assert!(!results[1].success);
    assert_eq!(results[1].strategy, WritebackStrategy::InPlace);
    assert_eq!(results[1].target_path, other);
    assert!(!results[1].errors.is_empty());

    assert_eq!(fs::read(&other)?, other_original);
    let written = lang::read_member_content(&jar, LANG_MEMBER)?.ok_or("member missing")?;
    assert_eq!(written.get("block.example.ore").map(String::as_str), Some("Erz"));
    assert_eq!(peer.engine.apply_history_for_target(&other)?.len(), 1);
    let stored = peer.engine.get_patch_set(set.id)?.ok_or("patch set missing")?;
    assert_eq!(stored.status, PatchStatus::Published);
    Ok(())
}

#[test]
fn draft_set_is_not_applied() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, _) = translated_peer()?;
    let mut set = PatchSet::new("draft");
    let item = peer
        .engine
        .build_patch_item(set.id, peer.language_file, "example.jar", "example", "de_de", PatchPolicy::Replace)?;
    set.add_item(item)?;
    peer.engine.save_patch_set(&set)?;
    assert!(matches!(
        peer.engine.apply_patch_set(set.id, &peer.mods_dir()?),
        Err(EngineError::Validation(_))
    ));
    Ok(())
}

#[test]
fn overlay_leaves_archive_untouched() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, jar) = translated_peer()?;
    let original = fs::read(&jar)?;
    let set = publish(&mut peer, PatchPolicy::Overlay, "example.jar", None)?;

    let results = peer.engine.apply_patch_set(set.id, &peer.mods_dir()?)?;
    assert!(results[0].success);
    assert_eq!(results[0].strategy, WritebackStrategy::Overlay);
    assert_eq!(fs::read(&jar)?, original);

    let pack = peer.workspace.path().join("overlays").join("example_de_de");
    let meta: serde_json::Value = serde_json::from_slice(&fs::read(pack.join("pack.mcmeta"))?)?;
    assert_eq!(meta["pack"]["pack_format"], 15);
    let overlay = lang::read_file_content(&pack.join(LANG_MEMBER))?.ok_or("overlay language file missing")?;
    assert_eq!(overlay.get("block.example.ore").map(String::as_str), Some("Erz"));
    Ok(())
}

#[test]
fn create_if_missing_builds_new_archive() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, _) = translated_peer()?;
    let set = publish(&mut peer, PatchPolicy::CreateIfMissing, "example-lang.zip", None)?;

    let results = peer.engine.apply_patch_set(set.id, &peer.mods_dir()?)?;
    assert!(results[0].success && results[0].hash_verified);
    let created = members(&peer.mods_dir()?.join("example-lang.zip"))?;
    assert_eq!(created.keys().collect::<Vec<_>>(), vec![LANG_MEMBER]);
    Ok(())
}

// ============================================================================
// Failure and rollback
// ============================================================================

#[test]
fn failure_mid_rewrite_restores_archive() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, jar) = translated_peer()?;
    let original = fs::read(&jar)?;
    let set = publish(&mut peer, PatchPolicy::Replace, "example.jar", None)?;

    peer.engine.writeback().failpoints().fail(MID_REWRITE, "simulated crash");
    let results = peer.engine.apply_patch_set(set.id, &peer.mods_dir()?)?;
    let result = &results[0];
    assert!(!result.success);
    assert!(result.rollback_performed);
    assert!(result.errors.iter().any(|e| e.contains("simulated crash")));
    assert_eq!(fs::read(&jar)?, original);

    let plan = peer.engine.writeback().get_plan(result.plan_id).ok_or("plan missing")?;
    assert_eq!(plan.status, WritebackStatus::RolledBack);
    let stored = peer.engine.get_patch_set(set.id)?.ok_or("patch set missing")?;
    assert_eq!(stored.status, PatchStatus::Published);
    assert_eq!(peer.engine.statistics().failed, 1);
    Ok(())
}

#[test]
fn pre_image_mismatch_is_recorded() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, jar) = translated_peer()?;
    let mut request = PlanRequest::new(WritebackStrategy::InPlace, &jar, "example", "de_de", content(&[("a", "b")]));
    request.expected_pre_image_hash = Some("f".repeat(64));
    let plan = peer.engine.create_plan(request)?;

    assert!(matches!(peer.engine.execute_plan(plan.plan_id), Err(EngineError::Integrity { .. })));
    let history = peer.engine.storage().apply_results_for_plan(plan.plan_id)?;
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    Ok(())
}

#[test]
fn rollback_restores_once() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, jar) = translated_peer()?;
    let original = fs::read(&jar)?;
    let set = publish(&mut peer, PatchPolicy::Replace, "example.jar", None)?;
    let results = peer.engine.apply_patch_set(set.id, &peer.mods_dir()?)?;
    assert_ne!(fs::read(&jar)?, original);

    assert!(peer.engine.rollback(RollbackTarget::Plan(results[0].plan_id))?);
    assert_eq!(fs::read(&jar)?, original);
    assert!(!peer.engine.rollback(RollbackTarget::Result(&results[0]))?);

    let stats = peer.engine.statistics();
    assert_eq!(stats.successful, 1);
    assert_eq!(stats.rolled_back, 1);
    Ok(())
}

#[test]
fn rollback_is_remembered_across_restarts() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, jar) = translated_peer()?;
    let db = peer.workspace.path().join("modlocale.db");
    let db = db.to_str().ok_or("workspace path is not UTF-8")?.to_string();
    let reopen = |peer: &TestPeer| -> Result<Engine, Box<dyn std::error::Error>> {
        let config = EngineConfig::default().with_workspace(peer.workspace.path());
        Ok(Engine::new(SqliteStorage::open(&db)?, config)?)
    };
    peer.engine = reopen(&peer)?;

    let original = fs::read(&jar)?;
    let request = PlanRequest::new(WritebackStrategy::InPlace, &jar, "example", "de_de", content(&[("a", "b")]));
    let plan = peer.engine.create_plan(request)?;
    assert!(peer.engine.execute_plan(plan.plan_id)?.success);

    peer.engine = reopen(&peer)?;
    assert!(peer.engine.rollback(RollbackTarget::Plan(plan.plan_id))?);
    assert_eq!(fs::read(&jar)?, original);

    peer.engine = reopen(&peer)?;
    assert!(!peer.engine.rollback(RollbackTarget::Plan(plan.plan_id))?);
    let history = peer.engine.storage().apply_results_for_plan(plan.plan_id)?;
    assert_eq!(history.len(), 2);
    assert!(history[1].rollback_performed);
    assert!(matches!(
        peer.engine.rollback(RollbackTarget::Plan(PlanId::new())),
        Err(EngineError::PlanNotFound(_))
    ));
    Ok(())
}

#[test]
fn cleanup_removes_expired_backups() -> Result<(), Box<dyn std::error::Error>> {
    let (mut peer, jar) = translated_peer()?;
    let set = publish(&mut peer, PatchPolicy::Replace, "example.jar", None)?;
    let results = peer.engine.apply_patch_set(set.id, &peer.mods_dir()?)?;
    let backup = results[0].backup.clone().ok_or("backup missing")?;
    assert!(backup.backup_path.is_file());
    assert_eq!(backup.original_path, jar);

    assert!(peer.engine.cleanup_old_backups(None)?.is_empty());
    assert_eq!(peer.engine.cleanup_old_backups(Some(0))?, vec![backup.id]);
    assert!(!backup.backup_path.exists());
    assert!(peer.engine.storage().list_backups()?.is_empty());
    Ok(())
}
