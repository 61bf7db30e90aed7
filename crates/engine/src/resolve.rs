//! Pluggable conflict resolution for fields both sides changed differently.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use modlocale_core::field_value::FieldValue;

use crate::error::EngineError;

/// Resolutions at or below this confidence are not accepted by the chain.
pub const ACCEPT_CONFIDENCE: f64 = 0.5;
/// Field-level resolutions averaging below this need a human.
pub const FIELD_LEVEL_REVIEW_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictItem {
    pub field: String,
    pub local_value: FieldValue,
    pub remote_value: FieldValue,
    pub base_value: Option<FieldValue>,
    pub local_timestamp: Option<DateTime<Utc>>,
    pub remote_timestamp: Option<DateTime<Utc>>,
}

impl ConflictItem {
    pub fn new(field: impl Into<String>, local_value: FieldValue, remote_value: FieldValue) -> Self {
        Self {
            field: field.into(),
            local_value,
            remote_value,
            base_value: None,
            local_timestamp: None,
            remote_timestamp: None,
        }
    }

    pub fn with_base(mut self, base: FieldValue) -> Self {
        self.base_value = Some(base);
        self
    }

    pub fn with_timestamps(mut self, local: DateTime<Utc>, remote: DateTime<Utc>) -> Self {
        self.local_timestamp = Some(local);
        self.remote_timestamp = Some(remote);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    TakeLocal,
    TakeRemote,
    Newest,
    Oldest,
    ThreeWayMerge,
    FieldLevel,
    Interactive,
    ChainFailed,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TakeLocal => "take_local",
            Self::TakeRemote => "take_remote",
            Self::Newest => "newest",
            Self::Oldest => "oldest",
            Self::ThreeWayMerge => "three_way_merge",
            Self::FieldLevel => "field_level",
            Self::Interactive => "interactive",
            Self::ChainFailed => "chain_failed",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub resolved_value: FieldValue,
    pub strategy_used: ResolutionStrategy,
    pub confidence: f64,
    pub manual_review_required: bool,
    pub notes: Option<String>,
}

impl ConflictResolution {
    fn new(resolved_value: FieldValue, strategy_used: ResolutionStrategy, confidence: f64) -> Self {
        Self {
            resolved_value,
            strategy_used,
            confidence,
            manual_review_required: false,
            notes: None,
        }
    }

    fn needs_review(mut self, notes: impl Into<String>) -> Self {
        self.manual_review_required = true;
        self.notes = Some(notes.into());
        self
    }

    pub fn is_accepted(&self) -> bool {
        self.confidence > ACCEPT_CONFIDENCE && !self.manual_review_required
    }
}

pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &str;

    fn can_resolve(&self, item: &ConflictItem) -> bool;

    fn resolve(&self, item: &ConflictItem) -> Result<ConflictResolution, EngineError>;
}

// ============================================================================
// Timestamp
// ============================================================================

/// Picks a side by modification time. Ties go to the remote side.
#[derive(Debug, Clone, Copy)]
pub struct TimestampResolver {
    prefer_newest: bool,
}

impl Default for TimestampResolver {
    fn default() -> Self {
        Self { prefer_newest: true }
    }
}

impl TimestampResolver {
    pub fn new(prefer_newest: bool) -> Self {
        Self { prefer_newest }
    }
}

impl ConflictResolver for TimestampResolver {
    fn name(&self) -> &str {
        "timestamp"
    }

    fn can_resolve(&self, item: &ConflictItem) -> bool {
        item.local_timestamp.is_some() && item.remote_timestamp.is_some()
    }

    fn resolve(&self, item: &ConflictItem) -> Result<ConflictResolution, EngineError> {
        let (Some(local_ts), Some(remote_ts)) = (item.local_timestamp, item.remote_timestamp) else {
            return Err(EngineError::Validation(format!(
                "timestamp resolution of {} needs both timestamps",
                item.field
            )));
        };
        let local_wins = if self.prefer_newest {
            local_ts > remote_ts
        } else {
            local_ts < remote_ts
        };
        let value = if local_wins {
            item.local_value.clone()
        } else {
            item.remote_value.clone()
        };
        let strategy = if self.prefer_newest {
            ResolutionStrategy::Newest
        } else {
            ResolutionStrategy::Oldest
        };
        Ok(ConflictResolution::new(value, strategy, 0.9))
    }
}

// ============================================================================
// Three-way
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreeWayMergeResolver;

impl ConflictResolver for ThreeWayMergeResolver {
    fn name(&self) -> &str {
        "three_way"
    }

    fn can_resolve(&self, item: &ConflictItem) -> bool {
        item.base_value.is_some()
    }

    fn resolve(&self, item: &ConflictItem) -> Result<ConflictResolution, EngineError> {
        let Some(base) = &item.base_value else {
            return Err(EngineError::Validation(format!(
                "three-way resolution of {} needs a base value",
                item.field
            )));
        };
        let local = &item.local_value;
        let remote = &item.remote_value;

        let resolution = match (base, local, remote) {
            (FieldValue::Text(b), FieldValue::Text(l), FieldValue::Text(r)) => merge_text(b, l, r),
            (FieldValue::Map(b), FieldValue::Map(l), FieldValue::Map(r)) => merge_map(b, l, r),
            (FieldValue::List(b), FieldValue::List(l), FieldValue::List(r)) => ConflictResolution::new(
                FieldValue::List(merge_list(b, l, r)),
                ResolutionStrategy::ThreeWayMerge,
                0.75,
            ),
            _ => ConflictResolution::new(local.clone(), ResolutionStrategy::ThreeWayMerge, 0.0)
                .needs_review(format!("cannot merge {} values", local.kind())),
        };
        Ok(resolution)
    }
}

fn merge_text(base: &str, local: &str, remote: &str) -> ConflictResolution {
    let one_sided = if local == base || local == remote {
        Some(remote)
    } else if remote == base {
        Some(local)
    } else {
        None
    };
    if let Some(text) = one_sided {
        return ConflictResolution::new(FieldValue::Text(text.to_string()), ResolutionStrategy::ThreeWayMerge, 0.95);
    }

    let base_lines: Vec<&str> = base.split('\n').collect();
    let local_lines: Vec<&str> = local.split('\n').collect();
    let remote_lines: Vec<&str> = remote.split('\n').collect();
    match diff3_merge(&base_lines, &local_lines, &remote_lines) {
        Some(lines) => ConflictResolution::new(
            FieldValue::Text(lines.join("\n")),
            ResolutionStrategy::ThreeWayMerge,
            0.8,
        ),
        None => ConflictResolution::new(FieldValue::Text(local.to_string()), ResolutionStrategy::ThreeWayMerge, 0.0)
            .needs_review("overlapping line edits"),
    }
}

/// Index pairs of a longest common subsequence of `a` and `b`.
fn lcs_pairs(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

/// Line-level diff3. `None` when both sides changed the same region
/// differently.
fn diff3_merge(base: &[&str], local: &[&str], remote: &[&str]) -> Option<Vec<String>> {
    let to_local: BTreeMap<usize, usize> = lcs_pairs(base, local).into_iter().collect();
    let to_remote: BTreeMap<usize, usize> = lcs_pairs(base, remote).into_iter().collect();

    // base lines kept by both sides anchor the merge
    let mut anchors: Vec<(usize, usize, usize)> = to_local
        .iter()
        .filter_map(|(b, l)| to_remote.get(b).map(|r| (*b, *l, *r)))
        .collect();
    anchors.push((base.len(), local.len(), remote.len()));

    let mut out = Vec::new();
    let (mut bi, mut li, mut ri) = (0, 0, 0);
    for (sb, sl, sr) in anchors {
        let b = &base[bi..sb];
        let l = &local[li..sl];
        let r = &remote[ri..sr];
        let chunk = if l == b || l == r {
            r
        } else if r == b {
            l
        } else {
            return None;
        };
        out.extend(chunk.iter().map(|s| s.to_string()));
        if sb < base.len() {
            out.push(base[sb].to_string());
        }
        bi = sb + 1;
        li = sl + 1;
        ri = sr + 1;
    }
    Some(out)
}

fn merge_map(
    base: &BTreeMap<String, FieldValue>,
    local: &BTreeMap<String, FieldValue>,
    remote: &BTreeMap<String, FieldValue>,
) -> ConflictResolution {
    let keys: BTreeSet<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();
    let mut merged = BTreeMap::new();
    let mut conflicting = Vec::new();
    for key in keys {
        let (b, l, r) = (base.get(key), local.get(key), remote.get(key));
        let chosen = if l == b {
            r
        } else if r == b || l == r {
            l
        } else {
            conflicting.push(key.as_str());
            l
        };
        if let Some(value) = chosen {
            merged.insert(key.clone(), value.clone());
        }
    }

    if conflicting.is_empty() {
        ConflictResolution::new(FieldValue::Map(merged), ResolutionStrategy::ThreeWayMerge, 0.7)
    } else {
        ConflictResolution::new(FieldValue::Map(merged), ResolutionStrategy::ThreeWayMerge, 0.3)
            .needs_review(format!("conflicting keys: {}", conflicting.join(", ")))
    }
}

/// Order-preserving union: local order first, then remote additions.
/// An element one side removed from the base stays removed.
fn merge_list(base: &[FieldValue], local: &[FieldValue], remote: &[FieldValue]) -> Vec<FieldValue> {
    let removed_by_remote = |v: &FieldValue| base.contains(v) && !remote.contains(v);
    let removed_by_local = |v: &FieldValue| base.contains(v) && !local.contains(v);

    let mut out: Vec<FieldValue> = Vec::new();
    for value in local {
        if !removed_by_remote(value) && !out.contains(value) {
            out.push(value.clone());
        }
    }
    for value in remote {
        if !removed_by_local(value) && !out.contains(value) {
            out.push(value.clone());
        }
    }
    out
}

// ============================================================================
// Field level
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPolicy {
    Local,
    Remote,
    Merge,
    Newest,
}

/// Resolves map-valued conflicts key by key using caller policies.
#[derive(Debug, Clone, Default)]
pub struct FieldLevelResolver {
    policies: BTreeMap<String, FieldPolicy>,
}

impl FieldLevelResolver {
    pub fn new(policies: BTreeMap<String, FieldPolicy>) -> Self {
        Self { policies }
    }

    fn resolve_key(&self, item: &ConflictItem, key: &str, policy: Option<FieldPolicy>) -> (Option<FieldValue>, f64) {
        let local = item.local_value.as_map().and_then(|m| m.get(key)).cloned();
        let remote = item.remote_value.as_map().and_then(|m| m.get(key)).cloned();
        if local == remote {
            return (local, 1.0);
        }
        match policy {
            Some(FieldPolicy::Local) => (local, 1.0),
            Some(FieldPolicy::Remote) => (remote, 1.0),
            Some(FieldPolicy::Merge) => match (&local, &remote) {
                (Some(FieldValue::List(l)), Some(FieldValue::List(r))) => {
                    let base = item
                        .base_value
                        .as_ref()
                        .and_then(|b| b.as_map())
                        .and_then(|m| m.get(key))
                        .and_then(|v| v.as_list())
                        .unwrap_or(&[]);
                    (Some(FieldValue::List(merge_list(base, l, r))), 0.7)
                }
                _ => (local, 0.3),
            },
            Some(FieldPolicy::Newest) => match (item.local_timestamp, item.remote_timestamp) {
                (Some(lt), Some(rt)) if lt > rt => (local, 0.9),
                (Some(_), Some(_)) => (remote, 0.9),
                _ => (local, 0.5),
            },
            None => (local.or(remote), 0.5),
        }
    }
}

impl ConflictResolver for FieldLevelResolver {
    fn name(&self) -> &str {
        "field_level"
    }

    fn can_resolve(&self, item: &ConflictItem) -> bool {
        item.local_value.as_map().is_some() && item.remote_value.as_map().is_some()
    }

    fn resolve(&self, item: &ConflictItem) -> Result<ConflictResolution, EngineError> {
        let (Some(local), Some(remote)) = (item.local_value.as_map(), item.remote_value.as_map()) else {
            return Err(EngineError::Validation(format!(
                "field-level resolution of {} needs map values",
                item.field
            )));
        };
        let keys: BTreeSet<&String> = local.keys().chain(remote.keys()).chain(self.policies.keys()).collect();

        let mut merged = BTreeMap::new();
        let mut scores = Vec::new();
        for key in keys {
            let (value, score) = self.resolve_key(item, key, self.policies.get(key).copied());
            if let Some(value) = value {
                merged.insert(key.clone(), value);
            }
            scores.push(score);
        }

        let confidence = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        let resolution = ConflictResolution::new(FieldValue::Map(merged), ResolutionStrategy::FieldLevel, confidence);
        if confidence < FIELD_LEVEL_REVIEW_THRESHOLD {
            Ok(resolution.needs_review(format!("average confidence {confidence:.2}")))
        } else {
            Ok(resolution)
        }
    }
}

// ============================================================================
// Interactive
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum InteractiveChoice {
    UseLocal,
    UseRemote,
    UseValue(FieldValue),
    Manual,
}

type DecisionFn = dyn Fn(&ConflictItem) -> InteractiveChoice + Send + Sync;

/// Defers to an external decision, typically a human. Place it last.
pub struct InteractiveResolver {
    decide: Box<DecisionFn>,
}

impl InteractiveResolver {
    pub fn new(decide: impl Fn(&ConflictItem) -> InteractiveChoice + Send + Sync + 'static) -> Self {
        Self { decide: Box::new(decide) }
    }
}

impl ConflictResolver for InteractiveResolver {
    fn name(&self) -> &str {
        "interactive"
    }

    fn can_resolve(&self, _item: &ConflictItem) -> bool {
        true
    }

    fn resolve(&self, item: &ConflictItem) -> Result<ConflictResolution, EngineError> {
        let resolution = match (self.decide)(item) {
            InteractiveChoice::UseLocal => {
                ConflictResolution::new(item.local_value.clone(), ResolutionStrategy::Interactive, 1.0)
            }
            InteractiveChoice::UseRemote => {
                ConflictResolution::new(item.remote_value.clone(), ResolutionStrategy::Interactive, 1.0)
            }
            InteractiveChoice::UseValue(value) => {
                ConflictResolution::new(value, ResolutionStrategy::Interactive, 1.0)
            }
            InteractiveChoice::Manual => {
                ConflictResolution::new(item.local_value.clone(), ResolutionStrategy::Interactive, 0.0)
                    .needs_review("deferred to manual review")
            }
        };
        Ok(resolution)
    }
}

// ============================================================================
// Chain
// ============================================================================

pub struct ConflictResolverChain {
    resolvers: Vec<Box<dyn ConflictResolver>>,
}

impl Default for ConflictResolverChain {
    fn default() -> Self {
        Self::standard(true)
    }
}

impl ConflictResolverChain {
    pub fn empty() -> Self {
        Self { resolvers: Vec::new() }
    }

    /// Three-way first, then timestamps.
    pub fn standard(prefer_newest: bool) -> Self {
        Self::empty()
            .with(ThreeWayMergeResolver)
            .with(TimestampResolver::new(prefer_newest))
    }

    pub fn with(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn push(&mut self, resolver: Box<dyn ConflictResolver>) {
        self.resolvers.push(resolver);
    }

    pub fn names(&self) -> Vec<&str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }

    /// First accepted resolution, or a zero-confidence result keeping the
    /// local value.
    pub fn resolve(&self, item: &ConflictItem) -> ConflictResolution {
        for resolver in &self.resolvers {
            if !resolver.can_resolve(item) {
                continue;
            }
            match resolver.resolve(item) {
                Ok(resolution) if resolution.is_accepted() => {
                    debug!(
                        field = %item.field,
                        resolver = resolver.name(),
                        confidence = resolution.confidence,
                        "conflict resolved"
                    );
                    return resolution;
                }
                Ok(resolution) => {
                    debug!(
                        field = %item.field,
                        resolver = resolver.name(),
                        confidence = resolution.confidence,
                        "resolution rejected"
                    );
                }
                Err(e) => {
                    debug!(field = %item.field, resolver = resolver.name(), error = %e, "resolver failed");
                }
            }
        }
        ConflictResolution::new(item.local_value.clone(), ResolutionStrategy::ChainFailed, 0.0)
            .needs_review("no resolver could handle this conflict")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.into())
    }

    fn map(pairs: &[(&str, FieldValue)]) -> FieldValue {
        FieldValue::Map(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn timestamp_newest_and_tie() {
        let now = Utc::now();
        let item = ConflictItem::new("dst_text", text("local"), text("remote"))
            .with_timestamps(now + Duration::seconds(5), now);
        let res = TimestampResolver::default().resolve(&item).unwrap();
        assert_eq!(res.resolved_value, text("local"));
        assert_eq!(res.confidence, 0.9);
        assert_eq!(res.strategy_used, ResolutionStrategy::Newest);

        let tie = ConflictItem::new("dst_text", text("local"), text("remote")).with_timestamps(now, now);
        assert_eq!(TimestampResolver::default().resolve(&tie).unwrap().resolved_value, text("remote"));

        let oldest = TimestampResolver::new(false).resolve(&item).unwrap();
        assert_eq!(oldest.resolved_value, text("remote"));
    }

    #[test]
    fn timestamp_requires_both_timestamps() {
        let item = ConflictItem::new("dst_text", text("a"), text("b"));
        assert!(!TimestampResolver::default().can_resolve(&item));
        assert!(TimestampResolver::default().resolve(&item).is_err());
    }

    #[test]
    fn three_way_text_one_side() {
        let item = ConflictItem::new("dst_text", text("base"), text("remote")).with_base(text("base"));
        let res = ThreeWayMergeResolver.resolve(&item).unwrap();
        assert_eq!(res.resolved_value, text("remote"));
        assert_eq!(res.confidence, 0.95);
    }

    #[test]
    fn three_way_text_disjoint_lines() {
        let item = ConflictItem::new("dst_text", text("Zeile eins!\nzwei\ndrei"), text("eins\nzwei\nZeile drei!"))
            .with_base(text("eins\nzwei\ndrei"));
        let res = ThreeWayMergeResolver.resolve(&item).unwrap();
        assert_eq!(res.resolved_value, text("Zeile eins!\nzwei\nZeile drei!"));
        assert_eq!(res.confidence, 0.8);
        assert!(res.is_accepted());
    }

    #[test]
    fn three_way_text_overlap_needs_review() {
        let item = ConflictItem::new("dst_text", text("Schwert"), text("Klinge")).with_base(text("Sword"));
        let res = ThreeWayMergeResolver.resolve(&item).unwrap();
        assert_eq!(res.resolved_value, text("Schwert"));
        assert_eq!(res.confidence, 0.0);
        assert!(res.manual_review_required);
    }

    #[test]
    fn three_way_map() {
        let base = map(&[("a", text("1")), ("b", text("1"))]);
        let local = map(&[("a", text("2")), ("b", text("1"))]);
        let remote = map(&[("a", text("1")), ("b", text("1")), ("c", text("3"))]);
        let res = ThreeWayMergeResolver
            .resolve(&ConflictItem::new("qa_flags", local, remote).with_base(base.clone()))
            .unwrap();
        assert_eq!(res.resolved_value, map(&[("a", text("2")), ("b", text("1")), ("c", text("3"))]));
        assert_eq!(res.confidence, 0.7);

        let local = map(&[("a", text("2")), ("b", text("1"))]);
        let remote = map(&[("a", text("3")), ("b", text("1"))]);
        let res = ThreeWayMergeResolver
            .resolve(&ConflictItem::new("qa_flags", local, remote).with_base(base))
            .unwrap();
        assert_eq!(res.confidence, 0.3);
        assert!(res.manual_review_required);
    }

    #[test]
    fn three_way_list_honours_deletions() {
        let base = FieldValue::List(vec![text("a"), text("b"), text("c")]);
        let local = FieldValue::List(vec![text("a"), text("c"), text("d")]);
        let remote = FieldValue::List(vec![text("a"), text("b"), text("e")]);
        let res = ThreeWayMergeResolver
            .resolve(&ConflictItem::new("tags", local, remote).with_base(base))
            .unwrap();
        // b removed locally, c removed remotely
        assert_eq!(res.resolved_value, FieldValue::List(vec![text("a"), text("d"), text("e")]));
        assert_eq!(res.confidence, 0.75);
    }

    #[test]
    fn three_way_mismatched_types() {
        let item = ConflictItem::new("x", FieldValue::Integer(1), text("1")).with_base(FieldValue::Null);
        let res = ThreeWayMergeResolver.resolve(&item).unwrap();
        assert!(res.manual_review_required);
        assert_eq!(res.resolved_value, FieldValue::Integer(1));
    }

    #[test]
    fn field_level_averages_confidence() {
        let resolver = FieldLevelResolver::new(BTreeMap::from([
            ("dst_text".to_string(), FieldPolicy::Remote),
            ("status".to_string(), FieldPolicy::Local),
        ]));
        let local = map(&[("dst_text", text("l")), ("status", text("reviewed"))]);
        let remote = map(&[("dst_text", text("r")), ("status", text("translated"))]);
        let res = resolver.resolve(&ConflictItem::new("entry", local, remote)).unwrap();
        assert_eq!(res.resolved_value, map(&[("dst_text", text("r")), ("status", text("reviewed"))]));
        assert_eq!(res.confidence, 1.0);
        assert!(!res.manual_review_required);
    }

    #[test]
    fn field_level_unspecified_keys_lower_confidence() {
        let resolver = FieldLevelResolver::default();
        let local = map(&[("dst_text", text("l"))]);
        let remote = map(&[("dst_text", text("r"))]);
        let res = resolver.resolve(&ConflictItem::new("entry", local, remote)).unwrap();
        assert_eq!(res.confidence, 0.5);
        assert!(res.manual_review_required);
    }

    #[test]
    fn interactive_choices() {
        let item = ConflictItem::new("dst_text", text("l"), text("r"));
        let pick = InteractiveResolver::new(|_| InteractiveChoice::UseValue(FieldValue::Text("x".into())));
        assert_eq!(pick.resolve(&item).unwrap().resolved_value, text("x"));
        let defer = InteractiveResolver::new(|_| InteractiveChoice::Manual);
        assert!(defer.resolve(&item).unwrap().manual_review_required);
    }

    #[test]
    fn chain_falls_through_to_timestamp() {
        let now = Utc::now();
        let item = ConflictItem::new("dst_text", text("Schwert"), text("Klinge"))
            .with_base(text("Sword"))
            .with_timestamps(now, now + Duration::seconds(1));
        let res = ConflictResolverChain::default().resolve(&item);
        assert_eq!(res.resolved_value, text("Klinge"));
        assert_eq!(res.strategy_used, ResolutionStrategy::Newest);
    }

    #[test]
    fn chain_failure_keeps_local() {
        let item = ConflictItem::new("dst_text", text("Schwert"), text("Klinge")).with_base(text("Sword"));
        let res = ConflictResolverChain::default().resolve(&item);
        assert_eq!(res.strategy_used, ResolutionStrategy::ChainFailed);
        assert_eq!(res.resolved_value, text("Schwert"));
        assert_eq!(res.confidence, 0.0);
        assert!(res.manual_review_required);
    }

    #[test]
    fn chain_uses_interactive_as_last_resort() {
        let chain = ConflictResolverChain::default().with(InteractiveResolver::new(|_| InteractiveChoice::UseRemote));
        assert_eq!(chain.names(), vec!["three_way", "timestamp", "interactive"]);
        let item = ConflictItem::new("dst_text", text("Schwert"), text("Klinge")).with_base(text("Sword"));
        assert_eq!(chain.resolve(&item).resolved_value, text("Klinge"));
    }
}
