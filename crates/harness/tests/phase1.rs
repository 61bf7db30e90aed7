use std::collections::BTreeMap;

use modlocale_core::{
    CoreError,
    cid::{ContentAddresser, HashAlgorithm},
    codec::{CodecLimits, DeltaCodec},
    entry::{DeltaOperation, EntryDelta, TranslationEntry},
    ids::*,
};
use modlocale_engine::{EngineConfig, EngineError};
use modlocale_harness::{TestPeer, init_tracing};
use proptest::prelude::*;

// ============================================================================
// Content addressing
// ============================================================================

#[test]
fn structured_cid_ignores_key_order() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new()?;
    let a = serde_json::json!({"key": "item.gem", "text": "Gem", "meta": {"x": 1, "y": [1, 2]}});
    let b = serde_json::json!({"meta": {"y": [1, 2], "x": 1}, "text": "Gem", "key": "item.gem"});
    assert_eq!(peer.engine.compute_cid(&a)?, peer.engine.compute_cid(&b)?);

    let c = serde_json::json!({"key": "item.gem", "text": "Gem", "meta": {"x": 1, "y": [2, 1]}});
    assert_ne!(peer.engine.compute_cid(&a)?, peer.engine.compute_cid(&c)?);
    Ok(())
}

#[test]
fn floats_are_not_addressable() -> Result<(), Box<dyn std::error::Error>> {
    let peer = TestPeer::new()?;
    let value = serde_json::json!({"ratio": 0.5});
    assert!(matches!(
        peer.engine.compute_cid(&value),
        Err(EngineError::Core(CoreError::UnsupportedContent(_)))
    ));
    Ok(())
}

#[test]
fn entry_cid_tracks_content() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new()?;
    let uid = peer.add_entry("item.example.gem", "Gem", Some("Edelstein"))?;
    let entry = peer.entry(uid)?.ok_or("entry missing")?;
    let first = peer.engine.entry_cid(&entry)?;
    assert_eq!(first, peer.engine.entry_cid(&entry)?);

    peer.translate(uid, "Juwel")?;
    let changed = peer.entry(uid)?.ok_or("entry missing")?;
    assert_ne!(first, peer.engine.entry_cid(&changed)?);
    Ok(())
}

#[test]
fn algorithm_comes_from_config() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_toml_str("[addressing]\nalgorithm = \"sha256\"\n")?;
    let peer = TestPeer::with_config(LanguageFileId::new(), config)?;
    let cid = peer.engine.compute_cid("Gem")?;
    assert_eq!(cid.algorithm, HashAlgorithm::Sha256);
    assert_eq!(cid.hash_value.len(), 64);
    assert!(cid.to_string().starts_with("sha256:"));
    Ok(())
}

#[test]
fn cache_evicts_least_used() -> Result<(), Box<dyn std::error::Error>> {
    let addresser = ContentAddresser::new(HashAlgorithm::Blake3, 2);
    let a = addresser.store("a", BTreeMap::new())?;
    let b = addresser.store("b", BTreeMap::new())?;
    addresser.retrieve(&a);
    let c = addresser.store("c", BTreeMap::new())?;

    assert!(addresser.contains(&a));
    assert!(!addresser.contains(&b));
    assert!(addresser.contains(&c));
    let stats = addresser.stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.cached_entries, 2);
    assert_eq!(stats.cache_hits, 1);
    Ok(())
}

// ============================================================================
// Delta codec
// ============================================================================

fn deltas(n: usize) -> Vec<EntryDelta> {
    let file = LanguageFileId::new();
    (0..n)
        .map(|i| {
            let mut entry = TranslationEntry::new(file, format!("item.example.thing_{i}"), format!("Thing {i}"));
            entry.translate(format!("Ding {i}"));
            EntryDelta::create(&entry)
        })
        .collect()
}

#[test]
fn tampered_payload_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let codec = DeltaCodec::default();
    let mut payload = codec.encode(&deltas(3))?;
    let last = payload.bytes.len() - 1;
    payload.bytes[last] ^= 0xff;
    assert!(matches!(codec.decode_verified(&payload), Err(CoreError::Integrity { .. })));
    Ok(())
}

#[test]
fn split_respects_entry_limit_and_reassembles() -> Result<(), Box<dyn std::error::Error>> {
    let codec = DeltaCodec::new(
        Default::default(),
        CodecLimits {
            max_entries: 4,
            max_bytes: 1024 * 1024,
        },
    );
    let input = deltas(10);
    let mut batches = codec.split(&input)?;
    assert_eq!(batches.len(), 3);
    for (i, batch) in batches.iter().enumerate() {
        let header = codec.header(&batch.bytes)?;
        assert_eq!(header.batch_index as usize, i);
        assert_eq!(header.batch_count, 3);
    }

    batches.reverse();
    assert_eq!(codec.merge_batches(&batches)?, input);

    batches.remove(1);
    assert!(matches!(codec.merge_batches(&batches), Err(CoreError::Validation(_))));
    Ok(())
}

#[test]
fn oversize_entry_gets_own_batch() -> Result<(), Box<dyn std::error::Error>> {
    let codec = DeltaCodec::new(
        Default::default(),
        CodecLimits {
            max_entries: 100,
            max_bytes: 512,
        },
    );
    let mut input = deltas(2);
    let mut big = TranslationEntry::new(LanguageFileId::new(), "book.example.page", "x".repeat(2048));
    big.translate("y".repeat(2048));
    input.insert(1, EntryDelta::update(&big));

    let batches = codec.split(&input)?;
    assert_eq!(batches.len(), 3);
    assert_eq!(codec.decode(&batches[1].bytes)?, vec![input[1].clone()]);
    Ok(())
}

#[test]
fn engine_export_uses_configured_limits() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_toml_str("[codec]\nmax_batch_entries = 2\n")?;
    let mut peer = TestPeer::with_config(LanguageFileId::new(), config)?;
    for i in 0..5 {
        peer.add_entry(&format!("item.example.n{i}"), "Thing", Some("Ding"))?;
    }
    let (changes, payloads) = peer.engine.export_changes()?;
    assert_eq!(changes.len(), 5);
    assert!(changes.iter().all(|d| d.operation == DeltaOperation::Create));
    assert_eq!(payloads.len(), 3);
    assert_eq!(peer.engine.codec().merge_batches(&payloads)?, changes);
    Ok(())
}

proptest! {
    #[test]
    fn split_then_merge_preserves_order(n in 0usize..40, max_entries in 1usize..10) {
        let codec = DeltaCodec::new(Default::default(), CodecLimits { max_entries, max_bytes: 4096 });
        let input = deltas(n);
        let batches = codec.split(&input).unwrap();
        prop_assert_eq!(codec.merge_batches(&batches).unwrap(), input);
    }
}
