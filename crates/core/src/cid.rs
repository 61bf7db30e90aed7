//! Content addressing: deterministic identifiers for bytes, text and
//! structured records, plus a bounded in-memory content cache.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Digest as _;
use tracing::{debug, warn};

use crate::error::CoreError;

pub const FILE_CHUNK_SIZE: usize = 64 * 1024;
/// Number of chunks hashed between cooperative yields in `compute_file`.
pub const YIELD_EVERY_CHUNKS: usize = 10;
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
            Self::Sha256 => "sha256",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "blake3" => Ok(Self::Blake3),
            "sha256" => Ok(Self::Sha256),
            _ => Err(CoreError::Validation(format!("unknown hash algorithm: {s}"))),
        }
    }

    pub fn digest_size(&self) -> usize {
        32
    }
}

/// Identifier of a byte sequence. Equality and hashing ignore `byte_length`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentId {
    pub hash_value: String,
    pub algorithm: HashAlgorithm,
    pub byte_length: u64,
}

impl PartialEq for ContentId {
    fn eq(&self, other: &Self) -> bool {
        self.hash_value == other.hash_value && self.algorithm == other.algorithm
    }
}

impl Eq for ContentId {}

impl Hash for ContentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_value.hash(state);
        self.algorithm.hash(state);
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hash_value)
    }
}

impl ContentId {
    pub fn short(&self) -> &str {
        &self.hash_value[..self.hash_value.len().min(16)]
    }
}

/// Borrowed input to the addresser.
#[derive(Debug, Clone, Copy)]
pub enum Content<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
    Structured(&'a Value),
}

impl<'a> From<&'a [u8]> for Content<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Content::Bytes(bytes)
    }
}

impl<'a> From<&'a str> for Content<'a> {
    fn from(text: &'a str) -> Self {
        Content::Text(text)
    }
}

impl<'a> From<&'a Value> for Content<'a> {
    fn from(value: &'a Value) -> Self {
        Content::Structured(value)
    }
}

/// Owned copy of content held by the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredContent {
    Bytes(Vec<u8>),
    Text(String),
    Structured(Value),
}

impl StoredContent {
    fn from_content(content: Content<'_>) -> Self {
        match content {
            Content::Bytes(b) => Self::Bytes(b.to_vec()),
            Content::Text(t) => Self::Text(t.to_string()),
            Content::Structured(v) => Self::Structured(v.clone()),
        }
    }
}

/// Serialize a JSON value with sorted object keys and no insignificant
/// whitespace. Floats are rejected: their textual form is not stable.
pub fn canonical_json(value: &Value) -> Result<String, CoreError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), CoreError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if n.is_f64() {
                return Err(CoreError::UnsupportedContent(
                    "floating point numbers cannot be canonicalized".into(),
                ));
            }
            out.push_str(&n.to_string());
        }
        Value::String(s) => out.push_str(&encode_json_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&encode_json_string(key)?);
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn encode_json_string(s: &str) -> Result<String, CoreError> {
    serde_json::to_string(s).map_err(|e| CoreError::Serialization(e.to_string()))
}

enum StreamingDigest {
    Blake3(Box<blake3::Hasher>),
    Sha256(sha2::Sha256),
}

impl StreamingDigest {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Blake3(h) => {
                h.update(data);
            }
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Stateless hash computation. Cheap to copy into every component that
/// needs to fingerprint content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentHasher {
    algorithm: HashAlgorithm,
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn compute_bytes(&self, data: &[u8]) -> ContentId {
        let mut digest = StreamingDigest::new(self.algorithm);
        digest.update(data);
        ContentId {
            hash_value: digest.finalize_hex(),
            algorithm: self.algorithm,
            byte_length: data.len() as u64,
        }
    }

    pub fn compute_text(&self, text: &str) -> ContentId {
        self.compute_bytes(text.as_bytes())
    }

    pub fn compute_structured(&self, value: &Value) -> Result<ContentId, CoreError> {
        let canonical = canonical_json(value)?;
        Ok(self.compute_text(&canonical))
    }

    pub fn compute(&self, content: Content<'_>) -> Result<ContentId, CoreError> {
        match content {
            Content::Bytes(b) => Ok(self.compute_bytes(b)),
            Content::Text(t) => Ok(self.compute_text(t)),
            Content::Structured(v) => self.compute_structured(v),
        }
    }

    /// Address any serializable record through its canonical JSON form.
    pub fn compute_record<T: Serialize + ?Sized>(&self, record: &T) -> Result<ContentId, CoreError> {
        let value = serde_json::to_value(record)
            .map_err(|e| CoreError::UnsupportedContent(e.to_string()))?;
        self.compute_structured(&value)
    }

    /// Hash a file in fixed-size chunks, yielding the thread periodically so
    /// very large archives do not monopolise a cooperative scheduler.
    pub fn compute_file(&self, path: &Path) -> Result<ContentId, CoreError> {
        let mut file = File::open(path)?;
        let mut digest = StreamingDigest::new(self.algorithm);
        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        let mut total: u64 = 0;
        let mut chunks: usize = 0;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
            total += n as u64;
            chunks += 1;
            if chunks % YIELD_EVERY_CHUNKS == 0 {
                std::thread::yield_now();
            }
        }
        Ok(ContentId {
            hash_value: digest.finalize_hex(),
            algorithm: self.algorithm,
            byte_length: total,
        })
    }

    /// Hash of a file if it exists, `None` if it does not.
    pub fn compute_file_if_exists(&self, path: &Path) -> Result<Option<ContentId>, CoreError> {
        match self.compute_file(path) {
            Ok(cid) => Ok(Some(cid)),
            Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContentAddress {
    pub cid: ContentId,
    pub created_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    /// Logical clock of the last access; breaks ties between equal wall times.
    access_seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddresserStats {
    pub hash_operations: u64,
    pub bytes_processed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub cached_entries: usize,
}

impl AddresserStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    address: ContentAddress,
    content: StoredContent,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ContentId, CacheEntry>,
    stats: AddresserStats,
    seq: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.address.access_count, e.address.access_seq))
            .map(|(cid, _)| cid.clone());
        if let Some(cid) = victim {
            self.entries.remove(&cid);
            self.stats.evictions += 1;
            debug!(cid = cid.short(), "evicted least used content");
        }
    }
}

/// Hashing service with a bounded content cache.
///
/// The cache is shared mutable state; every access goes through one mutex.
/// A capacity of zero disables caching.
pub struct ContentAddresser {
    hasher: ContentHasher,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl Default for ContentAddresser {
    fn default() -> Self {
        Self::new(HashAlgorithm::default(), DEFAULT_CACHE_CAPACITY)
    }
}

impl ContentAddresser {
    pub fn new(algorithm: HashAlgorithm, capacity: usize) -> Self {
        Self {
            hasher: ContentHasher::new(algorithm),
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn hasher(&self) -> ContentHasher {
        self.hasher
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn record_hash(&self, cid: &ContentId) {
        let mut state = self.state.lock();
        state.stats.hash_operations += 1;
        state.stats.bytes_processed += cid.byte_length;
    }

    pub fn compute_cid<'a>(&self, content: impl Into<Content<'a>>) -> Result<ContentId, CoreError> {
        let cid = self.hasher.compute(content.into())?;
        self.record_hash(&cid);
        debug!(
            algorithm = cid.algorithm.as_str(),
            hash = cid.short(),
            size = cid.byte_length,
            "computed content id"
        );
        Ok(cid)
    }

    pub fn compute_record_cid<T: Serialize + ?Sized>(&self, record: &T) -> Result<ContentId, CoreError> {
        let cid = self.hasher.compute_record(record)?;
        self.record_hash(&cid);
        Ok(cid)
    }

    pub fn compute_file_cid(&self, path: &Path) -> Result<ContentId, CoreError> {
        let cid = self.hasher.compute_file(path)?;
        self.record_hash(&cid);
        debug!(path = %path.display(), hash = cid.short(), size = cid.byte_length, "computed file content id");
        Ok(cid)
    }

    pub fn verify<'a>(&self, content: impl Into<Content<'a>>, expected: &ContentId) -> bool {
        let hasher = ContentHasher::new(expected.algorithm);
        match hasher.compute(content.into()) {
            Ok(actual) if actual == *expected => true,
            Ok(actual) => {
                warn!(expected = %expected, actual = %actual, "content verification failed");
                false
            }
            Err(e) => {
                warn!(expected = %expected, error = %e, "content could not be hashed for verification");
                false
            }
        }
    }

    /// Address `content` and keep a copy in the cache.
    pub fn store<'a>(
        &self,
        content: impl Into<Content<'a>>,
        metadata: BTreeMap<String, String>,
    ) -> Result<ContentId, CoreError> {
        let content = content.into();
        let cid = self.compute_cid(content)?;
        if self.capacity == 0 {
            return Ok(cid);
        }

        let mut state = self.state.lock();
        let seq = state.next_seq();
        let now = Utc::now();
        if let Some(existing) = state.entries.get_mut(&cid) {
            existing.address.access_count += 1;
            existing.address.last_access = now;
            existing.address.access_seq = seq;
            existing.address.metadata.extend(metadata);
        } else {
            while state.entries.len() >= self.capacity {
                state.evict_one();
            }
            state.entries.insert(
                cid.clone(),
                CacheEntry {
                    address: ContentAddress {
                        cid: cid.clone(),
                        created_at: now,
                        access_count: 1,
                        last_access: now,
                        metadata,
                        access_seq: seq,
                    },
                    content: StoredContent::from_content(content),
                },
            );
        }
        state.stats.cached_entries = state.entries.len();
        Ok(cid)
    }

    pub fn retrieve(&self, cid: &ContentId) -> Option<StoredContent> {
        let mut state = self.state.lock();
        let seq = state.next_seq();
        let hit = state.entries.get_mut(cid).map(|entry| {
            entry.address.access_count += 1;
            entry.address.last_access = Utc::now();
            entry.address.access_seq = seq;
            entry.content.clone()
        });
        if hit.is_some() {
            state.stats.cache_hits += 1;
        } else {
            state.stats.cache_misses += 1;
        }
        hit
    }

    pub fn info(&self, cid: &ContentId) -> Option<ContentAddress> {
        self.state.lock().entries.get(cid).map(|e| e.address.clone())
    }

    pub fn contains(&self, cid: &ContentId) -> bool {
        self.state.lock().entries.contains_key(cid)
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let cleared = state.entries.len();
        state.entries.clear();
        state.stats.cached_entries = 0;
        cleared
    }

    pub fn stats(&self) -> AddresserStats {
        self.state.lock().stats.clone()
    }
}
