//! Change coalescing.
//!
//! [`merge_changes`] collapses a rev-ordered stream of changes into at most
//! one pending change per row, so only the net effect of a burst of edits is
//! sent. Only created, updated and deleted changes coalesce; every other
//! type is kept verbatim, keyed by rev.
//!
//! | old \ new | Created   | Updated            | Deleted   |
//! |-----------|-----------|--------------------|-----------|
//! | Created   | new       | old + new.mods     | (dropped) |
//! | Updated   | new       | mods folded        | new       |
//! | Deleted   | new       | old                | old       |
//!
//! A kept result takes the rev of the incoming change.

use crate::change::{Change, ChangeKind, ChangeType};
use crate::error::{ProtocolError, ProtocolResult};
use crate::mods::{apply_mods, fold_mods};
use std::collections::BTreeMap;

/// Accumulated merge result, carried across successive calls.
#[derive(Debug, Clone, Default)]
pub struct MergedChanges {
    tables: BTreeMap<String, BTreeMap<String, Change>>,
    unmergeable: BTreeMap<i64, Change>,
    folded: BTreeMap<i64, Vec<i64>>,
    discarded: Vec<i64>,
    last_rev: Option<i64>,
}

impl MergedChanges {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending mergeable changes by table, then by the key's JSON text.
    #[must_use]
    pub fn tables(&self) -> &BTreeMap<String, BTreeMap<String, Change>> {
        &self.tables
    }

    /// Changes that never coalesce, by rev.
    #[must_use]
    pub fn unmergeable(&self) -> &BTreeMap<i64, Change> {
        &self.unmergeable
    }

    /// Every source rev represented by the output change with rev `rev`.
    #[must_use]
    pub fn folded_revs(&self, rev: i64) -> &[i64] {
        self.folded.get(&rev).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Revs of changes that cancelled out and will never be sent.
    #[must_use]
    pub fn discarded_revs(&self) -> &[i64] {
        &self.discarded
    }

    /// Number of output changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum::<usize>() + self.unmergeable.len()
    }

    /// True if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat output: mergeable changes by rev, then unmergeable ones by rev.
    #[must_use]
    pub fn flatten(&self) -> Vec<Change> {
        let mut merged: Vec<Change> = self
            .tables
            .values()
            .flat_map(BTreeMap::values)
            .cloned()
            .collect();
        merged.sort_by_key(|c| c.rev);
        merged.extend(self.unmergeable.values().cloned());
        merged
    }

    fn absorb(&mut self, change: Change) {
        let Some(rev) = change.rev else {
            return;
        };
        if !change.change_type().is_mergeable() {
            self.folded.insert(rev, vec![rev]);
            self.unmergeable.insert(rev, change);
            return;
        }

        let (table, key) = change.row_id();
        let rows = self.tables.entry(table).or_default();
        let Some(previous) = rows.remove(&key) else {
            self.folded.insert(rev, vec![rev]);
            rows.insert(key, change);
            return;
        };

        let mut sources = previous
            .rev
            .and_then(|r| self.folded.remove(&r))
            .unwrap_or_default();
        sources.push(rev);

        match combine(previous, change) {
            Some(mut merged) => {
                merged.rev = Some(rev);
                self.folded.insert(rev, sources);
                rows.insert(key, merged);
            }
            None => self.discarded.extend(sources),
        }
    }
}

/// Merges `changes` into `merged`.
///
/// Changes flagged as disallowed or errored are skipped.
///
/// # Errors
///
/// [`ProtocolError::MissingRev`] if a change has no rev and
/// [`ProtocolError::OutOfOrder`] if revs do not strictly ascend, including
/// across calls on the same accumulator.
pub fn merge_changes<I>(changes: I, merged: &mut MergedChanges) -> ProtocolResult<()>
where
    I: IntoIterator<Item = Change>,
{
    for change in changes {
        let rev = change.rev.ok_or(ProtocolError::MissingRev)?;
        if let Some(previous) = merged.last_rev {
            if rev <= previous {
                return Err(ProtocolError::OutOfOrder { previous, rev });
            }
        }
        merged.last_rev = Some(rev);

        if change.is_rejected() {
            continue;
        }
        merged.absorb(change);
    }
    Ok(())
}

/// Merges a single batch and returns the flat result.
pub fn merge_flat<I>(changes: I) -> ProtocolResult<Vec<Change>>
where
    I: IntoIterator<Item = Change>,
{
    let mut merged = MergedChanges::new();
    merge_changes(changes, &mut merged)?;
    Ok(merged.flatten())
}

fn combine(mut old: Change, new: Change) -> Option<Change> {
    match (old.change_type(), new.change_type()) {
        (ChangeType::Created, ChangeType::Updated) => {
            if let (ChangeKind::Created { obj }, ChangeKind::Updated { mods, .. }) =
                (&mut old.kind, &new.kind)
            {
                apply_mods(obj, mods);
            }
            Some(old)
        }
        (ChangeType::Created, ChangeType::Deleted) => None,
        (ChangeType::Updated, ChangeType::Updated) => {
            if let (
                ChangeKind::Updated { mods, obj, .. },
                ChangeKind::Updated {
                    mods: next_mods,
                    obj: next_obj,
                    ..
                },
            ) = (&mut old.kind, new.kind)
            {
                fold_mods(mods, &next_mods);
                *obj = next_obj;
            }
            Some(old)
        }
        (ChangeType::Deleted, ChangeType::Updated | ChangeType::Deleted) => Some(old),
        // Created+Created, Updated+Created, Updated+Deleted, Deleted+Created
        _ => Some(new),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeBuilder;
    use crate::mods::Mods;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    const TABLES: [&str; 2] = ["contentnode", "channel"];

    fn builder() -> ChangeBuilder<'static> {
        ChangeBuilder::new(&TABLES).with_channel("ch1")
    }

    fn at(rev: i64, mut change: Change) -> Change {
        change.rev = Some(rev);
        change
    }

    fn created(rev: i64, key: &str, obj: Value) -> Change {
        at(rev, builder().created("contentnode", json!(key), obj).unwrap())
    }

    fn updated(rev: i64, key: &str, mods: Value) -> Change {
        let mut change = builder()
            .updated("contentnode", json!(key), json!({}), json!({"x": 1}))
            .unwrap();
        if let ChangeKind::Updated { mods: m, .. } = &mut change.kind {
            *m = mods.as_object().cloned().unwrap();
        }
        at(rev, change)
    }

    fn deleted(rev: i64, key: &str) -> Change {
        at(rev, builder().deleted("contentnode", json!(key), None).unwrap())
    }

    fn mods_of(change: &Change) -> &Mods {
        match &change.kind {
            ChangeKind::Updated { mods, .. } => mods,
            other => panic!("not an update: {other:?}"),
        }
    }

    #[test]
    fn created_then_deleted_merges_to_nothing() {
        let out = merge_flat(vec![created(1, "a", json!({"id": "a"})), deleted(2, "a")]).unwrap();
        assert!(out.is_empty());

        let mut merged = MergedChanges::new();
        merge_changes(vec![created(1, "a", json!({})), deleted(2, "a")], &mut merged).unwrap();
        assert_eq!(merged.discarded_revs(), &[1, 2]);
    }

    #[test]
    fn created_absorbs_updates() {
        let out = merge_flat(vec![
            created(1, "a", json!({"id": "a", "title": "x"})),
            updated(2, "a", json!({"title": "y", "extra.m": 1})),
        ])
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rev, Some(2));
        assert_eq!(
            out[0].obj(),
            Some(&json!({"id": "a", "title": "y", "extra": {"m": 1}}))
        );
    }

    #[test]
    fn nested_update_rewrites_parent_mod() {
        let out = merge_flat(vec![
            updated(1, "a", json!({"extra": {"m": 1, "n": 2}})),
            updated(2, "a", json!({"extra.m": 5})),
        ])
        .unwrap();
        assert_eq!(mods_of(&out[0]), json!({"extra": {"m": 5, "n": 2}}).as_object().unwrap());
    }

    #[test]
    fn parent_update_replaces_sub_paths() {
        let out = merge_flat(vec![
            updated(1, "a", json!({"extra.randomize": true, "extra.m": 1})),
            updated(2, "a", json!({"extra": {"m": 3, "n": 5}})),
        ])
        .unwrap();
        assert_eq!(mods_of(&out[0]), json!({"extra": {"m": 3, "n": 5}}).as_object().unwrap());
    }

    #[test]
    fn pair_rules() {
        let out = merge_flat(vec![updated(1, "a", json!({"t": 1})), deleted(2, "a")]).unwrap();
        assert_eq!(out[0].change_type(), ChangeType::Deleted);

        let out = merge_flat(vec![deleted(1, "a"), updated(2, "a", json!({"t": 1}))]).unwrap();
        assert_eq!(out[0].change_type(), ChangeType::Deleted);
        assert_eq!(out[0].rev, Some(2));

        let out = merge_flat(vec![deleted(1, "a"), created(2, "a", json!({"v": 2}))]).unwrap();
        assert_eq!(out[0].change_type(), ChangeType::Created);

        let out = merge_flat(vec![updated(1, "a", json!({"t": 1})), created(2, "a", json!({"v": 2}))]).unwrap();
        assert_eq!(out[0].obj(), Some(&json!({"v": 2})));
    }

    #[test]
    fn unmergeable_changes_pass_through() {
        let b = builder();
        let out = merge_flat(vec![
            at(1, b.deployed("channel", json!("c1")).unwrap()),
            updated(2, "a", json!({"t": 1})),
            at(3, b.deployed("channel", json!("c1")).unwrap()),
            updated(4, "a", json!({"t": 2})),
        ])
        .unwrap();
        let types: Vec<(ChangeType, Option<i64>)> =
            out.iter().map(|c| (c.change_type(), c.rev)).collect();
        assert_eq!(
            types,
            vec![
                (ChangeType::Updated, Some(4)),
                (ChangeType::Deployed, Some(1)),
                (ChangeType::Deployed, Some(3)),
            ]
        );
    }

    #[test]
    fn order_is_enforced() {
        let err = merge_flat(vec![deleted(2, "a"), deleted(1, "b")]).unwrap_err();
        assert!(matches!(err, ProtocolError::OutOfOrder { previous: 2, rev: 1 }));

        let mut missing = deleted(1, "a");
        missing.rev = None;
        assert!(matches!(merge_flat(vec![missing]), Err(ProtocolError::MissingRev)));

        let mut merged = MergedChanges::new();
        merge_changes(vec![deleted(5, "a")], &mut merged).unwrap();
        assert!(merge_changes(vec![deleted(5, "b")], &mut merged).is_err());
    }

    #[test]
    fn rejected_changes_are_skipped() {
        let mut bad = updated(1, "a", json!({"t": 1}));
        bad.disallowed = true;
        let mut errored = updated(2, "b", json!({"t": 1}));
        errored.errors = vec![json!("nope")];
        let out = merge_flat(vec![bad, errored, deleted(3, "c")]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, json!("c"));
    }

    #[test]
    fn folded_revs_accumulate_across_calls() {
        let mut merged = MergedChanges::new();
        merge_changes(vec![updated(1, "a", json!({"t": 1})), updated(2, "b", json!({"t": 1}))], &mut merged)
            .unwrap();
        merge_changes(vec![updated(3, "a", json!({"t": 2}))], &mut merged).unwrap();
        assert_eq!(merged.folded_revs(3), &[1, 3]);
        assert_eq!(merged.folded_revs(2), &[2]);
        assert!(merged.folded_revs(1).is_empty());
        assert_eq!(merged.len(), 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create(Value),
        Update(String, Value),
        Delete,
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            (0i64..3).prop_map(Value::from),
            Just(json!({"x": 3})),
        ]
    }

    fn path() -> impl Strategy<Value = String> {
        prop_oneof![Just("a"), Just("b"), Just("a.x"), Just("a.y"), Just("a.x.z")].prop_map(String::from)
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            leaf().prop_map(|v| Op::Create(json!({"id": "k", "a": v}))),
            (path(), leaf()).prop_map(|(p, v)| Op::Update(p, v)),
            Just(Op::Delete),
        ]
    }

    fn to_change(rev: i64, op: &Op) -> Change {
        match op {
            Op::Create(obj) => created(rev, "k", obj.clone()),
            Op::Update(path, value) => {
                let mut mods = Mods::new();
                mods.insert(path.clone(), value.clone());
                updated(rev, "k", Value::Object(mods))
            }
            Op::Delete => deleted(rev, "k"),
        }
    }

    fn apply(state: Option<Value>, change: &Change) -> Option<Value> {
        match &change.kind {
            ChangeKind::Created { obj } => Some(obj.clone()),
            ChangeKind::Updated { mods, .. } => state.map(|mut row| {
                apply_mods(&mut row, mods);
                row
            }),
            ChangeKind::Deleted { .. } => None,
            _ => state,
        }
    }

    proptest! {
        #[test]
        fn merged_equals_sequential_from_empty(ops in prop::collection::vec(op(), 0..12)) {
            let changes: Vec<Change> = ops.iter().enumerate().map(|(i, op)| to_change(i as i64 + 1, op)).collect();
            let sequential = changes.iter().fold(None, apply);
            let merged = merge_flat(changes).unwrap();
            prop_assert!(merged.len() <= 1);
            let replayed = merged.iter().fold(None, apply);
            prop_assert_eq!(replayed, sequential);
        }

        #[test]
        fn folded_updates_equal_sequential(
            base in leaf(),
            updates in prop::collection::vec((path(), leaf()), 1..10),
        ) {
            let start = Some(json!({"id": "k", "a": base}));
            let changes: Vec<Change> = updates
                .iter()
                .enumerate()
                .map(|(i, (p, v))| to_change(i as i64 + 1, &Op::Update(p.clone(), v.clone())))
                .collect();
            let sequential = changes.iter().fold(start.clone(), apply);
            let merged = merge_flat(changes).unwrap();
            prop_assert_eq!(merged.len(), 1);
            let replayed = merged.iter().fold(start, apply);
            prop_assert_eq!(replayed, sequential);
        }
    }
}
