//! Delta exchange codec: MessagePack envelopes carrying ordered entry
//! changes, each addressed by the CID of its bytes.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cid::{ContentHasher, ContentId};
use crate::entry::EntryDelta;
use crate::error::CoreError;

pub const FORMAT_VERSION: u32 = 1;
pub const DEFAULT_MAX_BATCH_ENTRIES: usize = 500;
pub const DEFAULT_MAX_BATCH_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_BATCH_ENTRIES,
            max_bytes: DEFAULT_MAX_BATCH_BYTES,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    batch_index: u32,
    batch_count: u32,
    entries: Vec<EntryDelta>,
}

/// Only the header fields, for inspecting a payload without materialising
/// its entries.
#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    format_version: u32,
    batch_index: u32,
    batch_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub cid: ContentId,
}

impl EncodedPayload {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    pub batch_index: u32,
    pub batch_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DeltaCodec {
    hasher: ContentHasher,
    limits: CodecLimits,
}

impl DeltaCodec {
    pub fn new(hasher: ContentHasher, limits: CodecLimits) -> Self {
        Self { hasher, limits }
    }

    pub fn limits(&self) -> CodecLimits {
        self.limits
    }

    fn encode_envelope(&self, envelope: &Envelope) -> Result<EncodedPayload, CoreError> {
        let bytes = rmp_serde::to_vec_named(envelope).map_err(|e| CoreError::Serialization(e.to_string()))?;
        let cid = self.hasher.compute_bytes(&bytes);
        Ok(EncodedPayload { bytes, cid })
    }

    /// Encode the whole list as a single batch.
    pub fn encode(&self, entries: &[EntryDelta]) -> Result<EncodedPayload, CoreError> {
        let payload = self.encode_envelope(&Envelope {
            format_version: FORMAT_VERSION,
            batch_index: 0,
            batch_count: 1,
            entries: entries.to_vec(),
        })?;
        debug!(entries = entries.len(), bytes = payload.len(), cid = payload.cid.short(), "encoded delta payload");
        Ok(payload)
    }

    fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope, CoreError> {
        let header: EnvelopeHeader =
            rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))?;
        if header.format_version != FORMAT_VERSION {
            return Err(CoreError::Serialization(format!(
                "unsupported payload format version {}",
                header.format_version
            )));
        }
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<EntryDelta>, CoreError> {
        let envelope = self.decode_envelope(bytes)?;
        debug!(entries = envelope.entries.len(), "decoded delta payload");
        Ok(envelope.entries)
    }

    pub fn header(&self, bytes: &[u8]) -> Result<BatchHeader, CoreError> {
        let header: EnvelopeHeader =
            rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))?;
        Ok(BatchHeader {
            batch_index: header.batch_index,
            batch_count: header.batch_count,
        })
    }

    /// Check the payload CID before touching its contents.
    pub fn verify(&self, payload: &EncodedPayload) -> Result<(), CoreError> {
        let actual = ContentHasher::new(payload.cid.algorithm).compute_bytes(&payload.bytes);
        if actual != payload.cid {
            return Err(CoreError::Integrity {
                expected: payload.cid.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    pub fn decode_verified(&self, payload: &EncodedPayload) -> Result<Vec<EntryDelta>, CoreError> {
        self.verify(payload)?;
        self.decode(&payload.bytes)
    }

    fn entry_size(entry: &EntryDelta) -> Result<usize, CoreError> {
        rmp_serde::to_vec_named(entry)
            .map(|b| b.len())
            .map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Split into independently decodable batches. Batches are filled in
    /// order; an entry that alone exceeds `max_bytes` gets a batch of its own.
    pub fn split(&self, entries: &[EntryDelta]) -> Result<Vec<EncodedPayload>, CoreError> {
        let max_entries = self.limits.max_entries.max(1);
        let mut groups: Vec<Vec<EntryDelta>> = Vec::new();
        let mut current: Vec<EntryDelta> = Vec::new();
        let mut current_bytes = 0usize;

        for entry in entries {
            let size = Self::entry_size(entry)?;
            let over_count = current.len() >= max_entries;
            let over_bytes = !current.is_empty() && current_bytes + size > self.limits.max_bytes;
            if over_count || over_bytes {
                groups.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current.push(entry.clone());
            current_bytes += size;
        }
        if !current.is_empty() || groups.is_empty() {
            groups.push(current);
        }

        let batch_count = groups.len() as u32;
        let payloads = groups
            .into_iter()
            .enumerate()
            .map(|(idx, entries)| {
                self.encode_envelope(&Envelope {
                    format_version: FORMAT_VERSION,
                    batch_index: idx as u32,
                    batch_count,
                    entries,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(entries = entries.len(), batches = payloads.len(), "split delta payload");
        Ok(payloads)
    }

    /// Reassemble batches produced by `split`, in any arrival order.
    pub fn merge_batches(&self, batches: &[EncodedPayload]) -> Result<Vec<EntryDelta>, CoreError> {
        if batches.is_empty() {
            return Ok(Vec::new());
        }
        let mut envelopes = Vec::with_capacity(batches.len());
        for payload in batches {
            self.verify(payload)?;
            envelopes.push(self.decode_envelope(&payload.bytes)?);
        }
        envelopes.sort_by_key(|e| e.batch_index);

        let expected = envelopes[0].batch_count as usize;
        if envelopes.len() != expected {
            return Err(CoreError::Validation(format!(
                "incomplete batch set: expected {expected} batches, got {}",
                envelopes.len()
            )));
        }
        for (idx, envelope) in envelopes.iter().enumerate() {
            if envelope.batch_index as usize != idx || envelope.batch_count as usize != expected {
                return Err(CoreError::Validation(format!(
                    "batch {} of {} does not belong to a set of {expected}",
                    envelope.batch_index, envelope.batch_count
                )));
            }
        }

        Ok(envelopes.into_iter().flat_map(|e| e.entries).collect())
    }
}
