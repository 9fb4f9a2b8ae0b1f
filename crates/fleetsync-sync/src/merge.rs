//! Key-based reconciliation of an incoming batch against the sheet snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};

use fleetsync_core::{fields, Record};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    /// Key already present in the snapshot; incoming fields overlay it.
    Update,
    /// New key; unset fields start as the unknown sentinel.
    Insert,
    /// Snapshot record the batch did not touch.
    Retained,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    pub key: String,
    pub kind: MergeKind,
    pub record: Record,
}

/// Keys the snapshot by natural key. Records without a usable key are
/// skipped; the first record wins when a key repeats.
pub fn index_by_key(records: impl IntoIterator<Item = Record>) -> BTreeMap<String, Record> {
    let mut index = BTreeMap::new();
    for record in records {
        let Some(key) = record.natural_key() else {
            debug!("snapshot record without identifier skipped");
            continue;
        };
        if index.contains_key(&key) {
            warn!(key = %key, "duplicate identifier in snapshot; keeping first");
            continue;
        }
        index.insert(key, record);
    }
    index
}

/// Merges `incoming` into `existing`. Every key of either side appears exactly
/// once in the output: incoming keys first in order of first appearance, then
/// untouched snapshot keys in key order. A key repeated within `incoming` is
/// folded field by field with the later record winning.
pub fn merge(incoming: &[Record], existing: &BTreeMap<String, Record>) -> Vec<Merged> {
    let mut order = Vec::new();
    let mut batch: HashMap<String, Record> = HashMap::new();
    for record in incoming {
        let Some(key) = record.natural_key() else {
            warn!(
                identifier = record.get(fields::IMEI).unwrap_or_default(),
                "incoming record without identifier skipped"
            );
            continue;
        };
        match batch.get_mut(&key) {
            Some(folded) => folded.overlay(record),
            None => {
                order.push(key.clone());
                batch.insert(key, record.clone());
            }
        }
    }

    let mut merged = Vec::with_capacity(order.len() + existing.len());
    for key in order {
        let Some(incoming) = batch.remove(&key) else {
            continue;
        };
        let (kind, mut record) = match existing.get(&key) {
            Some(current) => (MergeKind::Update, current.clone()),
            None => (MergeKind::Insert, Record::unknown()),
        };
        record.overlay(&incoming);
        record.set(fields::IMEI, key.clone());
        merged.push(Merged { key, kind, record });
    }

    let seen = merged
        .iter()
        .map(|m| m.key.clone())
        .collect::<HashSet<_>>();
    for (key, record) in existing {
        if !seen.contains(key) {
            merged.push(Merged {
                key: key.clone(),
                kind: MergeKind::Retained,
                record: record.clone(),
            });
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_core::UNKNOWN;
    use std::collections::BTreeSet;

    fn rec(pairs: &[(&str, &str)]) -> Record {
        Record::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn new_key_is_inserted_with_unknown_defaults() {
        let merged = merge(
            &[rec(&[(fields::IMEI, "'123"), (fields::BRAND, "Apple")])],
            &BTreeMap::new(),
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, MergeKind::Insert);
        assert_eq!(merged[0].record.get(fields::IMEI), Some("123"));
        assert_eq!(merged[0].record.get(fields::BRAND), Some("Apple"));
        assert_eq!(merged[0].record.get(fields::MODEL), Some(UNKNOWN));
    }

    #[test]
    fn known_key_is_updated_field_by_field() {
        let existing = index_by_key([rec(&[
            (fields::IMEI, "123.0"),
            (fields::STATUS, "Active"),
            (fields::MODEL, "iPhone 13"),
        ])]);
        let merged = merge(
            &[rec(&[(fields::IMEI, "123"), (fields::STATUS, "Retired")])],
            &existing,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, MergeKind::Update);
        assert_eq!(merged[0].record.get(fields::STATUS), Some("Retired"));
        assert_eq!(merged[0].record.get(fields::MODEL), Some("iPhone 13"));
        assert_eq!(merged[0].record.get(fields::IMEI), Some("123"));
    }

    #[test]
    fn repeated_key_in_batch_folds_with_last_write_winning() {
        let merged = merge(
            &[
                rec(&[(fields::IMEI, "1"), (fields::BRAND, "Apple"), (fields::NOTES, "a")]),
                rec(&[(fields::IMEI, "2")]),
                rec(&[(fields::IMEI, "'1"), (fields::BRAND, "Samsung")]),
            ],
            &BTreeMap::new(),
        );
        let keys = merged.iter().map(|m| m.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["1", "2"]);
        assert_eq!(merged[0].record.get(fields::BRAND), Some("Samsung"));
        assert_eq!(merged[0].record.get(fields::NOTES), Some("a"));
    }

    #[test]
    fn output_covers_the_union_of_keys_and_incoming_dominates() {
        let existing = index_by_key([
            rec(&[(fields::IMEI, "10"), (fields::STATUS, "Active"), (fields::NOTES, "old")]),
            rec(&[(fields::IMEI, "20"), (fields::STATUS, "Active")]),
            rec(&[(fields::IMEI, "30"), (fields::STATUS, "Active")]),
        ]);
        let incoming = vec![
            rec(&[(fields::IMEI, "20"), (fields::STATUS, "Retired")]),
            rec(&[(fields::IMEI, "40"), (fields::NOTES, "new")]),
            rec(&[(fields::IMEI, "10"), (fields::NOTES, "")]),
            rec(&[(fields::BRAND, "no key")]),
        ];
        let merged = merge(&incoming, &existing);

        let out_keys = merged.iter().map(|m| m.key.clone()).collect::<BTreeSet<_>>();
        let expected = ["10", "20", "30", "40"]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>();
        assert_eq!(out_keys, expected);
        assert_eq!(merged.len(), 4);

        for record in &incoming {
            let Some(key) = record.natural_key() else {
                continue;
            };
            let out = merged.iter().find(|m| m.key == key).expect("merged key");
            for (field, value) in record.iter().filter(|(f, _)| *f != fields::IMEI) {
                assert_eq!(out.record.get(field), Some(value), "{key}/{field}");
            }
        }
        let kinds = merged.iter().map(|m| (m.key.as_str(), m.kind)).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                ("20", MergeKind::Update),
                ("40", MergeKind::Insert),
                ("10", MergeKind::Update),
                ("30", MergeKind::Retained),
            ]
        );
    }

    #[test]
    fn snapshot_index_keeps_first_of_duplicate_keys() {
        let index = index_by_key([
            rec(&[(fields::IMEI, "5"), (fields::NOTES, "first")]),
            rec(&[(fields::IMEI, "'5"), (fields::NOTES, "second")]),
            rec(&[(fields::IMEI, UNKNOWN)]),
        ]);
        assert_eq!(index.len(), 1);
        assert_eq!(index["5"].get(fields::NOTES), Some("first"));
    }
}
