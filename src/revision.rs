// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision model.
//!
//! A [`Revision`] is `"<generation>-<fingerprint>"`: the generation counts edits
//! within one document, the fingerprint is a content/history hash that tells
//! concurrent edits at the same generation apart.
//!
//! Ancestry cannot be derived from two revision strings alone, so every stored
//! or transmitted revision travels with a [`RevisionHistory`]: the bounded list
//! of revisions it descends from. [`compare`] answers ancestry questions from
//! the two histories.
//!
//! # Example
//!
//! ```
//! use docsync::revision::{compare, new_revision, Ancestry, RevisionHistory};
//! use serde_json::json;
//!
//! let base = new_revision(None, "replica-a", Some(&json!({"x": 1})));
//! assert_eq!(base.generation(), 1);
//!
//! let history = RevisionHistory::successor_of(&base, &RevisionHistory::new(), 16);
//! let next = new_revision(Some(&base), "replica-a", Some(&json!({"x": 2})));
//!
//! assert_eq!(
//!     compare(&base, &RevisionHistory::new(), &next, &history),
//!     Ancestry::AncestorOf
//! );
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hex characters kept from the SHA-256 digest.
const FINGERPRINT_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RevisionError {
    #[error("malformed revision '{0}': expected '<generation>-<fingerprint>'")]
    Malformed(String),
    #[error("revision '{0}' has a non-positive generation")]
    NonPositiveGeneration(String),
}

/// A position in one document's edit history.
///
/// Ordering is by generation, then fingerprint. That ordering is the
/// tie-break that picks the surfaced revision among concurrent heads, so
/// every replica must use it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    generation: u64,
    fingerprint: String,
}

impl Revision {
    /// Build a revision from parts, validating them the same way as parsing.
    pub fn new(generation: u64, fingerprint: impl Into<String>) -> Result<Self, RevisionError> {
        let fingerprint = fingerprint.into();
        if generation == 0 {
            return Err(RevisionError::NonPositiveGeneration(format!("{}-{}", generation, fingerprint)));
        }
        if !valid_fingerprint(&fingerprint) {
            return Err(RevisionError::Malformed(format!("{}-{}", generation, fingerprint)));
        }
        Ok(Self { generation, fingerprint })
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn valid_fingerprint(fingerprint: &str) -> bool {
    !fingerprint.is_empty()
        && fingerprint
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.fingerprint)
    }
}

impl FromStr for Revision {
    type Err = RevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, fingerprint) = s
            .split_once('-')
            .ok_or_else(|| RevisionError::Malformed(s.to_string()))?;

        // Signed parse so "-3-abc" style input reports the generation problem
        let generation: i64 = generation
            .parse()
            .map_err(|_| RevisionError::Malformed(s.to_string()))?;
        if generation <= 0 {
            return Err(RevisionError::NonPositiveGeneration(s.to_string()));
        }
        if !valid_fingerprint(fingerprint) {
            return Err(RevisionError::Malformed(s.to_string()));
        }

        Ok(Self {
            generation: generation as u64,
            fingerprint: fingerprint.to_string(),
        })
    }
}

impl TryFrom<String> for Revision {
    type Error = RevisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.fingerprint.cmp(&other.fingerprint))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ancestors of a revision, newest first, without duplicates.
///
/// Bounded: once `max` entries are reached the oldest ancestors are dropped.
/// A dropped ancestor is no longer recognised and compares as concurrent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionHistory(Vec<Revision>);

impl RevisionHistory {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build from arbitrary revisions, normalising order and duplicates.
    #[must_use]
    pub fn from_revisions(revisions: impl IntoIterator<Item = Revision>, max: usize) -> Self {
        let mut history = Self(revisions.into_iter().collect());
        history.normalize(max);
        history
    }

    /// History of a revision that directly succeeds `parent`.
    #[must_use]
    pub fn successor_of(parent: &Revision, parent_history: &RevisionHistory, max: usize) -> Self {
        Self::merge_of([(parent, parent_history)], max)
    }

    /// History of a merge point that descends from every given head.
    #[must_use]
    pub fn merge_of<'a>(
        heads: impl IntoIterator<Item = (&'a Revision, &'a RevisionHistory)>,
        max: usize,
    ) -> Self {
        let mut all = Vec::new();
        for (rev, history) in heads {
            all.push(rev.clone());
            all.extend(history.0.iter().cloned());
        }
        Self::from_revisions(all, max)
    }

    #[must_use]
    pub fn contains(&self, rev: &Revision) -> bool {
        // Sorted descending, so binary search with reversed ordering
        self.0.binary_search_by(|probe| rev.cmp(probe)).is_ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.0.iter()
    }

    /// Re-establish ordering and bounds, e.g. after deserializing a peer's history.
    pub fn normalize(&mut self, max: usize) {
        self.0.sort_unstable_by(|a, b| b.cmp(a));
        self.0.dedup();
        self.0.truncate(max);
    }
}

/// Relationship of revision `a` to revision `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ancestry {
    Equal,
    /// `a` is an ancestor of `b`
    AncestorOf,
    /// `b` is an ancestor of `a`
    DescendantOf,
    /// Neither descends from the other: the conflict trigger
    Concurrent,
}

/// Compare two revisions using their recorded histories.
#[must_use]
pub fn compare(
    a: &Revision,
    a_history: &RevisionHistory,
    b: &Revision,
    b_history: &RevisionHistory,
) -> Ancestry {
    if a == b {
        Ancestry::Equal
    } else if b_history.contains(a) {
        Ancestry::AncestorOf
    } else if a_history.contains(b) {
        Ancestry::DescendantOf
    } else {
        Ancestry::Concurrent
    }
}

/// Revision for an edit on top of `old` (or a first write when `None`).
///
/// The fingerprint hashes the content, the previous revision and the replica
/// uid, so two replicas editing the same base always diverge in fingerprint.
#[must_use]
pub fn new_revision(old: Option<&Revision>, replica_uid: &str, content: Option<&Value>) -> Revision {
    let generation = old.map_or(1, |r| r.generation + 1);
    let mut hasher = Sha256::new();
    hash_content(&mut hasher, content);
    hasher.update(b"\x1fparent\x1f");
    if let Some(old) = old {
        hasher.update(old.to_string().as_bytes());
    }
    hasher.update(b"\x1freplica\x1f");
    hasher.update(replica_uid.as_bytes());
    finish(generation, hasher)
}

/// Revision for a conflict resolution descending from all `resolved` revisions.
///
/// Returns `None` when nothing is being resolved.
#[must_use]
pub fn merge_revision(resolved: &[Revision], replica_uid: &str, content: Option<&Value>) -> Option<Revision> {
    let top = resolved.iter().map(Revision::generation).max()?;
    let mut sorted: Vec<&Revision> = resolved.iter().collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hash_content(&mut hasher, content);
    hasher.update(b"\x1fmerge\x1f");
    for rev in sorted {
        hasher.update(rev.to_string().as_bytes());
        hasher.update(b"|");
    }
    hasher.update(b"\x1freplica\x1f");
    hasher.update(replica_uid.as_bytes());
    Some(finish(top + 1, hasher))
}

fn hash_content(hasher: &mut Sha256, content: Option<&Value>) {
    match content {
        // serde_json's default map is ordered, so this text is canonical
        Some(value) => hasher.update(value.to_string().as_bytes()),
        None => hasher.update(b"\x00tombstone"),
    }
}

fn finish(generation: u64, hasher: Sha256) -> Revision {
    let mut fingerprint = hex::encode(hasher.finalize());
    fingerprint.truncate(FINGERPRINT_LEN);
    Revision { generation, fingerprint }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rev(s: &str) -> Revision {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display_roundtrip() {
        let r = rev("12-abc123");
        assert_eq!(r.generation(), 12);
        assert_eq!(r.fingerprint(), "abc123");
        assert_eq!(r.to_string(), "12-abc123");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "abc", "-", "1-", "x-abc", "1-ab c", "1-ab-c", "1.5-abc"] {
            assert!(
                matches!(bad.parse::<Revision>(), Err(RevisionError::Malformed(_))),
                "expected malformed for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_parse_rejects_non_positive_generation() {
        assert_eq!(
            "0-abc".parse::<Revision>(),
            Err(RevisionError::NonPositiveGeneration("0-abc".to_string()))
        );
        assert!(matches!(
            "-4-abc".parse::<Revision>(),
            Err(RevisionError::Malformed(_) | RevisionError::NonPositiveGeneration(_))
        ));
    }

    #[test]
    fn test_new_validates_parts() {
        assert!(Revision::new(0, "abc").is_err());
        assert!(Revision::new(1, "").is_err());
        assert_eq!(Revision::new(3, "ff").unwrap().to_string(), "3-ff");
    }

    #[test]
    fn test_ordering_generation_then_fingerprint() {
        assert!(rev("2-aaa") > rev("1-zzz"));
        assert!(rev("2-ccc") > rev("2-bbb"));
        let mut revs = vec![rev("2-bbb"), rev("3-aaa"), rev("2-ccc")];
        revs.sort();
        assert_eq!(revs, vec![rev("2-bbb"), rev("2-ccc"), rev("3-aaa")]);
    }

    #[test]
    fn test_serde_as_string() {
        let r = rev("4-deadbeef");
        let s = serde_json::to_string(&r).unwrap();
        assert_eq!(s, "\"4-deadbeef\"");
        let back: Revision = serde_json::from_str(&s).unwrap();
        assert_eq!(back, r);
        assert!(serde_json::from_str::<Revision>("\"nope\"").is_err());
    }

    #[test]
    fn test_new_revision_increments_generation() {
        let first = new_revision(None, "a", Some(&json!({"x": 1})));
        assert_eq!(first.generation(), 1);
        let second = new_revision(Some(&first), "a", Some(&json!({"x": 2})));
        assert_eq!(second.generation(), 2);
        assert_eq!(second.fingerprint().len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_new_revision_is_deterministic() {
        let base = rev("1-aaa");
        let a = new_revision(Some(&base), "replica", Some(&json!({"k": "v"})));
        let b = new_revision(Some(&base), "replica", Some(&json!({"k": "v"})));
        assert_eq!(a, b);
    }

    #[test]
    fn test_concurrent_edits_differ_by_replica() {
        let base = rev("1-aaa");
        let content = json!({"same": true});
        let a = new_revision(Some(&base), "replica-a", Some(&content));
        let b = new_revision(Some(&base), "replica-b", Some(&content));
        assert_eq!(a.generation(), b.generation());
        assert_ne!(a, b);
    }

    #[test]
    fn test_tombstone_fingerprint_differs_from_null() {
        let base = rev("1-aaa");
        let deleted = new_revision(Some(&base), "r", None);
        let null = new_revision(Some(&base), "r", Some(&Value::Null));
        assert_ne!(deleted, null);
    }

    #[test]
    fn test_merge_revision_dominates_inputs() {
        let inputs = vec![rev("2-bbb"), rev("5-ccc"), rev("3-aaa")];
        let merged = merge_revision(&inputs, "r", Some(&json!({}))).unwrap();
        assert_eq!(merged.generation(), 6);
        assert!(merge_revision(&[], "r", None).is_none());

        // Input order does not matter
        let reordered = vec![rev("3-aaa"), rev("2-bbb"), rev("5-ccc")];
        assert_eq!(merge_revision(&reordered, "r", Some(&json!({}))).unwrap(), merged);
    }

    #[test]
    fn test_history_sorted_deduped_bounded() {
        let history = RevisionHistory::from_revisions(
            vec![rev("1-a"), rev("3-c"), rev("2-b"), rev("3-c")],
            2,
        );
        let kept: Vec<String> = history.iter().map(ToString::to_string).collect();
        assert_eq!(kept, vec!["3-c", "2-b"]);
        assert!(history.contains(&rev("2-b")));
        assert!(!history.contains(&rev("1-a")));
    }

    #[test]
    fn test_compare_cases() {
        let r1 = rev("1-aaa");
        let h1 = RevisionHistory::new();
        let r2 = rev("2-bbb");
        let h2 = RevisionHistory::successor_of(&r1, &h1, 10);
        let r2c = rev("2-ccc");
        let h2c = RevisionHistory::successor_of(&r1, &h1, 10);

        assert_eq!(compare(&r1, &h1, &r1, &h1), Ancestry::Equal);
        assert_eq!(compare(&r1, &h1, &r2, &h2), Ancestry::AncestorOf);
        assert_eq!(compare(&r2, &h2, &r1, &h1), Ancestry::DescendantOf);
        assert_eq!(compare(&r2, &h2, &r2c, &h2c), Ancestry::Concurrent);
    }

    #[test]
    fn test_transitive_ancestry_through_history() {
        let r1 = rev("1-a");
        let h1 = RevisionHistory::new();
        let r2 = rev("2-b");
        let h2 = RevisionHistory::successor_of(&r1, &h1, 10);
        let r3 = rev("3-c");
        let h3 = RevisionHistory::successor_of(&r2, &h2, 10);
        assert_eq!(compare(&r1, &h1, &r3, &h3), Ancestry::AncestorOf);
    }

    #[test]
    fn test_merge_history_covers_all_heads() {
        let a = rev("2-a");
        let ha = RevisionHistory::from_revisions(vec![rev("1-x")], 10);
        let b = rev("2-b");
        let hb = RevisionHistory::from_revisions(vec![rev("1-x")], 10);
        let merged = RevisionHistory::merge_of([(&a, &ha), (&b, &hb)], 10);
        assert_eq!(merged.len(), 3);
        assert!(merged.contains(&a));
        assert!(merged.contains(&b));
        assert!(merged.contains(&rev("1-x")));
    }
}
