// satchel-core/src/index/entry.rs
//! A single index entry: the ordered members of one value key.
//!
//! The entry keeps two things: the best known durable state (`members`, as
//! of the last read or write, identified by `etag`) and the local deltas
//! that have not been persisted yet (`pending_adds`/`pending_removes`).
//! Replaying the deltas over a freshly read snapshot is what makes
//! merge-on-conflict work: whatever another writer did to the stored entry,
//! our unpersisted changes survive the merge.

use crate::document::DocumentId;
use crate::query::{matches_comparison, Comparison};
use crate::value_utils::compare_values;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Iteration direction over the entry's member order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Reverse,
}

/// A pushed-down scan: tail-field conditions, direction, optional `_id`
/// ordering, and a limit to short-circuit at.
#[derive(Debug, Clone, Default)]
pub struct EntryScan {
    pub conditions: Vec<Comparison>,
    pub direction: Option<ScanDirection>,
    /// When set, members are ordered by `_id` (1 or -1) instead of by the
    /// entry's sort value.
    pub order_by_id: Option<i32>,
    pub limit: Option<usize>,
}

/// Ordered collection of `(document id, sort value)` pairs for one value key
#[derive(Debug)]
pub struct IndexEntry {
    key: String,
    /// Last index field sorts descending
    descending: bool,
    members: Vec<(DocumentId, Value)>,
    pending_adds: HashMap<DocumentId, Value>,
    pending_removes: HashSet<DocumentId>,
    etag: Option<String>,
    dirty: bool,
    generation: u64,
    loaded_at: Option<Instant>,
}

impl IndexEntry {
    pub fn new(key: impl Into<String>, descending: bool) -> Self {
        IndexEntry {
            key: key.into(),
            descending,
            members: Vec::new(),
            pending_adds: HashMap::new(),
            pending_removes: HashSet::new(),
            etag: None,
            dirty: false,
            generation: 0,
            loaded_at: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Mutation counter; lets a persist attempt detect concurrent local
    /// changes between snapshot and completion.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> Option<Instant> {
        self.loaded_at
    }

    pub fn mark_validated(&mut self) {
        self.loaded_at = Some(Instant::now());
    }

    /// Member order: by sort value in the last field's direction, with
    /// null (missing) values last regardless of direction.
    fn member_cmp(&self, a: &Value, b: &Value) -> Ordering {
        member_order_cmp(a, b, self.descending)
    }

    fn insert_sorted(&mut self, id: DocumentId, sort_value: Value) {
        let pos = self
            .members
            .partition_point(|(_, existing)| self.member_cmp(existing, &sort_value) != Ordering::Greater);
        self.members.insert(pos, (id, sort_value));
    }

    /// Add or update a member. Returns whether membership (or the member's
    /// sort value) changed; sets `dirty` if it did.
    pub fn add(&mut self, id: DocumentId, sort_value: Value) -> bool {
        if let Some(pos) = self.members.iter().position(|(m, _)| m == &id) {
            if self.members[pos].1 == sort_value {
                return false;
            }
            self.members.remove(pos);
        }
        self.insert_sorted(id.clone(), sort_value.clone());
        self.pending_removes.remove(&id);
        self.pending_adds.insert(id, sort_value);
        self.dirty = true;
        self.generation += 1;
        true
    }

    /// Remove a member. Returns whether membership changed; sets `dirty` if
    /// it did.
    pub fn remove(&mut self, id: &DocumentId) -> bool {
        let Some(pos) = self.members.iter().position(|(m, _)| m == id) else {
            return false;
        };
        self.members.remove(pos);
        self.pending_adds.remove(id);
        self.pending_removes.insert(id.clone());
        self.dirty = true;
        self.generation += 1;
        true
    }

    /// Merge a freshly read snapshot with the local unpersisted deltas.
    /// Pending removes win over snapshot members; pending adds win over
    /// snapshot sort values (last writer wins for the same id).
    pub fn update_from_storage(
        &mut self,
        snapshot: Vec<(DocumentId, Value)>,
        etag: Option<String>,
    ) {
        let mut merged: Vec<(DocumentId, Value)> = snapshot
            .into_iter()
            .filter(|(id, _)| !self.pending_removes.contains(id) && !self.pending_adds.contains_key(id))
            .collect();
        for (id, sort_value) in &self.pending_adds {
            merged.push((id.clone(), sort_value.clone()));
        }

        self.members = Vec::with_capacity(merged.len());
        for (id, sort_value) in merged {
            self.insert_sorted(id, sort_value);
        }

        self.etag = etag;
        self.dirty = !self.pending_adds.is_empty() || !self.pending_removes.is_empty();
        self.loaded_at = Some(Instant::now());
    }

    /// Deterministic byte representation: `[[id, sort_value], …]` in member
    /// order.
    pub fn serialize(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.members)
    }

    /// Parse a stored entry body
    pub fn parse_body(bytes: &[u8]) -> serde_json::Result<Vec<(DocumentId, Value)>> {
        serde_json::from_slice(bytes)
    }

    /// Snapshot everything a persist attempt needs, under one lock hold.
    pub fn persist_snapshot(&self) -> serde_json::Result<PersistSnapshot> {
        Ok(PersistSnapshot {
            body: self.serialize()?,
            etag: self.etag.clone(),
            generation: self.generation,
        })
    }

    /// Record a successful write. Deltas are cleared only when no mutation
    /// happened since the snapshot was taken; later mutations keep the entry
    /// dirty so the scheduler persists again.
    pub fn commit_persist(&mut self, snapshot_generation: u64, etag: String) {
        self.etag = Some(etag);
        self.loaded_at = Some(Instant::now());
        if self.generation == snapshot_generation {
            self.pending_adds.clear();
            self.pending_removes.clear();
            self.dirty = false;
        }
    }

    /// All member ids in entry order
    pub fn ids(&self) -> Vec<DocumentId> {
        self.members.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Evaluate a tail-field condition against a member's sort value.
    /// `$exists` cannot be decided here (null doubles as "missing") and is
    /// left to the in-process residual, so entry filtering only ever
    /// over-approximates.
    fn condition_matches(sort_value: &Value, condition: &Comparison) -> bool {
        match condition {
            Comparison::Exists(_) => true,
            other => matches_comparison(Some(sort_value), other),
        }
    }

    /// Members satisfying a pushed-down scan, in the requested order,
    /// short-circuiting once `limit` members are accepted.
    pub fn scan(&self, scan: &EntryScan) -> Vec<(DocumentId, Value)> {
        if let Some(direction) = scan.order_by_id {
            let mut matched: Vec<(DocumentId, Value)> = self
                .members
                .iter()
                .filter(|(_, sv)| scan.conditions.iter().all(|c| Self::condition_matches(sv, c)))
                .cloned()
                .collect();
            matched.sort_by(|(a, _), (b, _)| {
                let ord = compare_values(&a.to_value(), &b.to_value());
                if direction == -1 {
                    ord.reverse()
                } else {
                    ord
                }
            });
            if let Some(limit) = scan.limit {
                matched.truncate(limit);
            }
            return matched;
        }

        let mut result = Vec::new();
        let reverse = scan.direction == Some(ScanDirection::Reverse);
        let mut walk = |member: &(DocumentId, Value)| -> bool {
            let (_, sort_value) = member;
            if scan
                .conditions
                .iter()
                .all(|c| Self::condition_matches(sort_value, c))
            {
                result.push(member.clone());
                if let Some(limit) = scan.limit {
                    if result.len() >= limit {
                        return false;
                    }
                }
            }
            true
        };

        if reverse {
            for member in self.members.iter().rev() {
                if !walk(member) {
                    break;
                }
            }
        } else {
            for member in self.members.iter() {
                if !walk(member) {
                    break;
                }
            }
        }
        result
    }

    /// Ids satisfying a pushed-down scan
    pub fn filter_and_limit(&self, scan: &EntryScan) -> Vec<DocumentId> {
        self.scan(scan).into_iter().map(|(id, _)| id).collect()
    }
}

/// What a persist attempt writes, with the state needed to commit it
#[derive(Debug, Clone)]
pub struct PersistSnapshot {
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub generation: u64,
}

/// The sort-value order entries are kept in: the last field's direction,
/// null (missing) values last regardless of direction. Shared with the
/// executor so merging members from several entries preserves entry order.
pub fn member_order_cmp(a: &Value, b: &Value, descending: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ord = compare_values(a, b);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> DocumentId {
        DocumentId::String(s.to_string())
    }

    #[test]
    fn test_add_keeps_members_sorted() {
        let mut entry = IndexEntry::new("work", false);
        assert!(entry.add(id("c"), json!(30)));
        assert!(entry.add(id("a"), json!(10)));
        assert!(entry.add(id("b"), json!(20)));

        assert_eq!(entry.ids(), vec![id("a"), id("b"), id("c")]);
        assert!(entry.is_dirty());
    }

    #[test]
    fn test_descending_order() {
        let mut entry = IndexEntry::new("alice", true);
        entry.add(id("a"), json!(1000));
        entry.add(id("c"), json!(3000));
        entry.add(id("b"), json!(2000));

        assert_eq!(entry.ids(), vec![id("c"), id("b"), id("a")]);
    }

    #[test]
    fn test_null_sort_values_last_regardless_of_direction() {
        for descending in [false, true] {
            let mut entry = IndexEntry::new("k", descending);
            entry.add(id("missing"), json!(null));
            entry.add(id("x"), json!(5));
            assert_eq!(
                entry.ids().last().unwrap(),
                &id("missing"),
                "descending={}",
                descending
            );
        }
    }

    #[test]
    fn test_add_same_member_is_noop() {
        let mut entry = IndexEntry::new("k", false);
        assert!(entry.add(id("a"), json!(1)));
        assert!(!entry.add(id("a"), json!(1)));
    }

    #[test]
    fn test_add_updates_sort_value_in_place() {
        let mut entry = IndexEntry::new("k", false);
        entry.add(id("a"), json!(1));
        entry.add(id("b"), json!(2));
        assert!(entry.add(id("a"), json!(3)));

        assert_eq!(entry.ids(), vec![id("b"), id("a")]);
        assert_eq!(entry.len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut entry = IndexEntry::new("k", false);
        entry.add(id("a"), json!(1));
        assert!(entry.remove(&id("a")));
        assert!(!entry.remove(&id("a")));
        assert!(entry.is_empty());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut entry = IndexEntry::new("k", false);
        entry.add(id("a"), json!(10));
        entry.add(DocumentId::Int(2), json!(20));

        let bytes = entry.serialize().unwrap();
        let parsed = IndexEntry::parse_body(&bytes).unwrap();
        assert_eq!(
            parsed,
            vec![(id("a"), json!(10)), (DocumentId::Int(2), json!(20))]
        );
    }

    #[test]
    fn test_update_from_storage_preserves_pending_adds() {
        let mut entry = IndexEntry::new("k", false);
        entry.add(id("local"), json!(5));

        // Another writer persisted a different member in the meantime
        entry.update_from_storage(vec![(id("remote"), json!(1))], Some("\"v2\"".to_string()));

        assert_eq!(entry.ids(), vec![id("remote"), id("local")]);
        assert_eq!(entry.etag(), Some("\"v2\""));
        // Local delta not yet durable
        assert!(entry.is_dirty());
    }

    #[test]
    fn test_update_from_storage_preserves_pending_removes() {
        let mut entry = IndexEntry::new("k", false);
        entry.update_from_storage(
            vec![(id("a"), json!(1)), (id("b"), json!(2))],
            Some("\"v1\"".to_string()),
        );
        assert!(!entry.is_dirty());

        entry.remove(&id("a"));

        // Revalidation still shows "a" remotely; the local remove must win
        entry.update_from_storage(
            vec![(id("a"), json!(1)), (id("b"), json!(2))],
            Some("\"v2\"".to_string()),
        );
        assert_eq!(entry.ids(), vec![id("b")]);
        assert!(entry.is_dirty());
    }

    #[test]
    fn test_update_from_storage_local_sort_value_wins_for_same_id() {
        let mut entry = IndexEntry::new("k", false);
        entry.add(id("a"), json!(9));
        entry.update_from_storage(vec![(id("a"), json!(1))], Some("\"v2\"".to_string()));
        assert_eq!(entry.scan(&EntryScan::default()), vec![(id("a"), json!(9))]);
    }

    #[test]
    fn test_commit_persist_clears_deltas() {
        let mut entry = IndexEntry::new("k", false);
        entry.add(id("a"), json!(1));

        let snapshot = entry.persist_snapshot().unwrap();
        entry.commit_persist(snapshot.generation, "\"v1\"".to_string());

        assert!(!entry.is_dirty());
        assert_eq!(entry.etag(), Some("\"v1\""));
    }

    #[test]
    fn test_commit_persist_keeps_later_mutations_dirty() {
        let mut entry = IndexEntry::new("k", false);
        entry.add(id("a"), json!(1));
        let snapshot = entry.persist_snapshot().unwrap();

        // Mutated while the write was in flight
        entry.add(id("b"), json!(2));
        entry.commit_persist(snapshot.generation, "\"v1\"".to_string());

        assert!(entry.is_dirty());
        assert_eq!(entry.etag(), Some("\"v1\""));
    }

    #[test]
    fn test_scan_forward_with_conditions_and_limit() {
        let mut entry = IndexEntry::new("work", false);
        for (doc, priority) in [("p10", 10), ("p20", 20), ("p30", 30), ("p40", 40), ("p50", 50)] {
            entry.add(id(doc), json!(priority));
        }

        let scan = EntryScan {
            conditions: vec![Comparison::Gt(json!(20))],
            direction: Some(ScanDirection::Forward),
            order_by_id: None,
            limit: Some(2),
        };
        assert_eq!(entry.filter_and_limit(&scan), vec![id("p30"), id("p40")]);
    }

    #[test]
    fn test_scan_reverse() {
        let mut entry = IndexEntry::new("alice", true);
        for ts in [1000, 2000, 3000] {
            entry.add(id(&format!("t{}", ts)), json!(ts));
        }

        // Entry is descending; reverse iteration yields ascending timestamps
        let scan = EntryScan {
            conditions: vec![],
            direction: Some(ScanDirection::Reverse),
            order_by_id: None,
            limit: Some(2),
        };
        assert_eq!(entry.filter_and_limit(&scan), vec![id("t1000"), id("t2000")]);
    }

    #[test]
    fn test_scan_order_by_id() {
        let mut entry = IndexEntry::new("k", false);
        entry.add(id("b"), json!(1));
        entry.add(id("a"), json!(2));
        entry.add(id("c"), json!(3));

        let scan = EntryScan {
            conditions: vec![],
            direction: None,
            order_by_id: Some(-1),
            limit: Some(2),
        };
        assert_eq!(entry.filter_and_limit(&scan), vec![id("c"), id("b")]);
    }

    #[test]
    fn test_generation_counts_effective_mutations() {
        let mut entry = IndexEntry::new("k", false);
        let start = entry.generation();

        entry.add(id("a"), json!(1));
        assert_eq!(entry.generation(), start + 1);

        // No-op add does not bump the generation
        entry.add(id("a"), json!(1));
        assert_eq!(entry.generation(), start + 1);

        entry.remove(&id("a"));
        assert_eq!(entry.generation(), start + 2);
        entry.remove(&id("a"));
        assert_eq!(entry.generation(), start + 2);
    }

    #[test]
    fn test_serialize_is_deterministic_for_descending_entries() {
        let mut entry = IndexEntry::new("alice", true);
        entry.add(id("t1"), json!(1000));
        entry.add(id("t3"), json!(3000));
        entry.add(id("t2"), json!(2000));

        let body = String::from_utf8(entry.serialize().unwrap()).unwrap();
        assert_eq!(body, r#"[["t3",3000],["t2",2000],["t1",1000]]"#);
    }

    #[test]
    fn test_scan_limit_larger_than_members() {
        let mut entry = IndexEntry::new("k", false);
        entry.add(id("a"), json!(1));

        let scan = EntryScan {
            limit: Some(10),
            ..EntryScan::default()
        };
        assert_eq!(entry.filter_and_limit(&scan), vec![id("a")]);
    }

    #[test]
    fn test_scan_with_in_and_nin_conditions() {
        let mut entry = IndexEntry::new("k", false);
        for (doc, status) in [("a", "open"), ("b", "done"), ("c", "stale")] {
            entry.add(id(doc), json!(status));
        }

        let scan = EntryScan {
            conditions: vec![Comparison::In(vec![json!("open"), json!("done")])],
            ..EntryScan::default()
        };
        assert_eq!(entry.filter_and_limit(&scan), vec![id("b"), id("a")]);

        let scan = EntryScan {
            conditions: vec![Comparison::Nin(vec![json!("stale")])],
            ..EntryScan::default()
        };
        assert_eq!(entry.filter_and_limit(&scan), vec![id("b"), id("a")]);
    }

    #[test]
    fn test_update_from_storage_resets_when_object_vanished() {
        let mut entry = IndexEntry::new("k", false);
        entry.update_from_storage(vec![(id("a"), json!(1))], Some("\"v1\"".to_string()));
        assert_eq!(entry.len(), 1);

        // Entry object deleted remotely, no local deltas pending
        entry.update_from_storage(Vec::new(), None);
        assert!(entry.is_empty());
        assert_eq!(entry.etag(), None);
        assert!(!entry.is_dirty());
    }

    #[test]
    fn test_scan_exists_is_deferred() {
        let mut entry = IndexEntry::new("k", false);
        entry.add(id("a"), json!(null));
        entry.add(id("b"), json!(7));

        // $exists cannot be decided from the stored sort value; both stay in
        let scan = EntryScan {
            conditions: vec![Comparison::Exists(true)],
            ..EntryScan::default()
        };
        assert_eq!(entry.filter_and_limit(&scan).len(), 2);
    }
}
