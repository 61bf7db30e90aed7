pub mod cid;
pub mod codec;
pub mod entry;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod patch;
pub mod writeback;

pub use cid::{Content, ContentAddresser, ContentHasher, ContentId, HashAlgorithm};
pub use codec::{CodecLimits, DeltaCodec, EncodedPayload};
pub use entry::{DeltaOperation, EntryDelta, EntryStatus, TranslationEntry};
pub use error::CoreError;
pub use field_value::FieldValue;
pub use ids::*;
pub use patch::{PatchItem, PatchPolicy, PatchSet, PatchStatus};
