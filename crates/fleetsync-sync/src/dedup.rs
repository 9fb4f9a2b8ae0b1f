//! Content fingerprints for comment idempotence and export row suppression.
//!
//! Equal fingerprints are treated as equal content; there is no secondary
//! byte comparison.

use std::collections::HashSet;

use fleetsync_core::{normalize_whitespace, Record};
use fleetsync_storage::ArtifactStore;

/// SHA-256 of the text with whitespace runs and line breaks collapsed.
pub fn fingerprint(text: &str) -> String {
    ArtifactStore::sha256_hex(normalize_whitespace(text).as_bytes())
}

pub fn seen(hash: &str, existing: &HashSet<String>) -> bool {
    existing.contains(hash)
}

/// Fingerprints of each existing body.
pub fn fingerprints<'a>(bodies: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    bodies.into_iter().map(fingerprint).collect()
}

/// Admits a row only the first time its tuple of output values is seen.
#[derive(Debug, Default)]
pub struct RowDeduplicator {
    seen: HashSet<String>,
}

impl RowDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, header: &[impl AsRef<str>], record: &Record) -> bool {
        let tuple = header
            .iter()
            .zip(record.render(header))
            .map(|(field, value)| format!("{}:{}", field.as_ref(), value))
            .collect::<Vec<_>>()
            .join("\u{1f}");
        self.seen.insert(fingerprint(&tuple))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_core::fields;

    #[test]
    fn cosmetic_whitespace_does_not_change_the_fingerprint() {
        let posted = "Form Data:\nIMEI #: 123\nBrand: Apple";
        let again = "Form Data:\r\nIMEI #: 123\nBrand:   Apple  \n";
        assert_eq!(fingerprint(posted), fingerprint(again));
        assert_eq!(fingerprint(again), fingerprint(&normalize_whitespace(again)));
        assert_ne!(fingerprint(posted), fingerprint("Form Data:\nIMEI #: 124"));
    }

    #[test]
    fn second_equivalent_comment_is_suppressed() {
        let existing = fingerprints(["Form Data:\nIMEI #: 123 \n"]);
        assert!(seen(&fingerprint("Form Data:\nIMEI #: 123"), &existing));
        assert!(!seen(&fingerprint("Form Data:\nIMEI #: 999"), &existing));
    }

    #[test]
    fn duplicate_rows_are_admitted_once() {
        let header = [fields::IMEI, fields::TICKET];
        let mut dedup = RowDeduplicator::new();
        let row = Record::from_pairs([(fields::IMEI, "1"), (fields::TICKET, "9")]);
        assert!(dedup.admit(&header, &row));
        assert!(!dedup.admit(&header, &row.clone()));
        assert!(dedup.admit(
            &header,
            &Record::from_pairs([(fields::IMEI, "1"), (fields::TICKET, "10")])
        ));
        assert_eq!(dedup.len(), 2);
    }
}
