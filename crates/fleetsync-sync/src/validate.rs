//! Picklist validation and per-field canonicalization of incoming records.

use std::fmt;

use fleetsync_core::{
    clean_facility_name, field_spec, format_date, is_unknown_marker, normalize, normalize_key,
    FieldKind, FieldSpec, Record, Schema, RECOGNIZED_FIELDS, UNKNOWN, UNPARSEABLE_DATE,
};
use serde::Serialize;
use tracing::warn;

/// How a raw value fared against its field's allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Matched an allowed value; carries its original spelling.
    Canonical(String),
    /// Not in a non-empty allowed set.
    Invalid { original: String },
    /// The field has no allowed set; trimmed input passes through.
    FreeText(String),
    /// Blank or `N/A`-style input on a picklist field.
    Missing,
}

impl Validation {
    /// Value to persist: invalid and missing input become [`UNKNOWN`].
    pub fn value(&self) -> &str {
        match self {
            Self::Canonical(value) | Self::FreeText(value) => value,
            Self::Invalid { .. } | Self::Missing => UNKNOWN,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }
}

pub fn validate(raw: &str, field: &str, schema: &Schema) -> Validation {
    let trimmed = raw.trim();
    let allowed = match schema.allowed(field) {
        Some(allowed) if !allowed.is_empty() => allowed,
        _ => return Validation::FreeText(trimmed.to_string()),
    };
    if is_unknown_marker(trimmed) {
        return Validation::Missing;
    }
    match allowed.resolve(trimmed) {
        Some(canonical) => Validation::Canonical(canonical.to_string()),
        None => Validation::Invalid {
            original: trimmed.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyReason {
    NotInPicklist,
    UnparseableDate,
}

impl fmt::Display for AnomalyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInPicklist => f.write_str("not in picklist"),
            Self::UnparseableDate => f.write_str("unparseable date"),
        }
    }
}

/// A data-quality problem that was replaced by a sentinel instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub key: Option<String>,
    pub field: String,
    pub value: String,
    pub reason: AnomalyReason,
}

fn text_or_unknown(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Rewrites every recognized field present on `record` into its stored form.
/// Fields the record lacks stay absent so a later merge keeps existing values.
pub fn canonicalize_record(
    record: &Record,
    schema: &Schema,
    date_format: &str,
) -> (Record, Vec<Anomaly>) {
    let key = record.natural_key();
    let mut out = Record::new();
    let mut anomalies = Vec::new();
    let mut flag = |spec: &FieldSpec, value: &str, reason: AnomalyReason| {
        warn!(
            key = key.as_deref().unwrap_or(UNKNOWN),
            field = spec.name,
            value,
            %reason,
            "data quality anomaly"
        );
        anomalies.push(Anomaly {
            key: key.clone(),
            field: spec.name.to_string(),
            value: value.to_string(),
            reason,
        });
    };

    for spec in &RECOGNIZED_FIELDS {
        let Some(raw) = record.get(spec.name) else {
            continue;
        };
        let value = match spec.kind {
            FieldKind::Key => normalize_key(raw),
            FieldKind::Text => text_or_unknown(raw),
            FieldKind::Date => {
                if is_unknown_marker(raw) {
                    UNKNOWN.to_string()
                } else {
                    let formatted = format_date(raw, date_format);
                    if formatted == UNPARSEABLE_DATE {
                        flag(spec, raw, AnomalyReason::UnparseableDate);
                    }
                    formatted
                }
            }
            FieldKind::Picklist { title_case } => {
                picklist_value(spec, raw, title_case, schema, &mut flag)
            }
            FieldKind::Facility => {
                picklist_value(spec, &clean_facility_name(raw), false, schema, &mut flag)
            }
        };
        out.set(spec.name, value);
    }
    (out, anomalies)
}

fn picklist_value(
    spec: &FieldSpec,
    raw: &str,
    title_case: bool,
    schema: &Schema,
    flag: &mut impl FnMut(&FieldSpec, &str, AnomalyReason),
) -> String {
    match validate(raw, spec.name, schema) {
        Validation::FreeText(text) if is_unknown_marker(&text) => UNKNOWN.to_string(),
        Validation::FreeText(text) if title_case => normalize(&text, true),
        Validation::Invalid { original } => {
            flag(spec, &original, AnomalyReason::NotInPicklist);
            UNKNOWN.to_string()
        }
        other => other.value().to_string(),
    }
}

/// Cell text written to the sheet. Blank-as-unknown fields turn `N/A`-style
/// markers into empty cells.
pub fn storage_value(field: &str, value: &str) -> String {
    match field_spec(field) {
        Some(spec) if spec.blank_as_unknown && is_unknown_marker(value) => String::new(),
        _ => value.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_core::{fields, AllowedValues, FieldSchema, DEFAULT_DATE_FORMAT};

    fn schema() -> Schema {
        Schema::new(
            "sheet",
            [
                FieldSchema::new(fields::IMEI, "1"),
                FieldSchema::new(fields::BRAND, "2")
                    .with_allowed(AllowedValues::new(["Apple", "Samsung"])),
                FieldSchema::new(fields::STATUS, "3")
                    .with_allowed(AllowedValues::new(["Active", "Retired"])),
                FieldSchema::new(fields::RECIPIENT, "4"),
                FieldSchema::new(fields::FACILITY, "5")
                    .with_allowed(AllowedValues::new(["100 - North Clinic"])),
                FieldSchema::new(fields::NOTES, "6"),
            ],
        )
    }

    #[test]
    fn matches_return_the_original_spelling() {
        assert_eq!(
            validate("apple ", fields::BRAND, &schema()),
            Validation::Canonical("Apple".into())
        );
        assert_eq!(
            validate("RETIRED", fields::STATUS, &schema()),
            Validation::Canonical("Retired".into())
        );
    }

    #[test]
    fn misses_on_picklists_are_flagged_and_become_unknown() {
        let outcome = validate("Nokia", fields::BRAND, &schema());
        assert!(outcome.is_invalid());
        assert_eq!(outcome.value(), UNKNOWN);
        assert_eq!(validate(" n/a ", fields::BRAND, &schema()), Validation::Missing);
    }

    #[test]
    fn fields_without_allowed_values_pass_trimmed_text_through() {
        for raw in ["  anything at all ", "", "N/A", "x\t"] {
            assert_eq!(
                validate(raw, fields::NOTES, &schema()),
                Validation::FreeText(raw.trim().to_string())
            );
            assert_eq!(
                validate(raw, "Not A Column", &schema()).value(),
                raw.trim()
            );
        }
    }

    #[test]
    fn incoming_record_is_canonicalized_field_by_field() {
        let raw = Record::from_pairs([
            (fields::IMEI, "'123"),
            (fields::BRAND, "apple "),
            (fields::STATUS, "Lost"),
            (fields::DEPLOY_DATE, "2024-13-40"),
            (fields::RECIPIENT, "jane   o'neil"),
            (fields::FACILITY, "\"100 - north clinic\""),
            (fields::SERIAL, "  "),
        ]);
        let (record, anomalies) = canonicalize_record(&raw, &schema(), DEFAULT_DATE_FORMAT);

        assert_eq!(record.get(fields::IMEI), Some("123"));
        assert_eq!(record.get(fields::BRAND), Some("Apple"));
        assert_eq!(record.get(fields::STATUS), Some(UNKNOWN));
        assert_eq!(record.get(fields::DEPLOY_DATE), Some(UNPARSEABLE_DATE));
        assert_eq!(record.get(fields::RECIPIENT), Some("Jane Oneil"));
        assert_eq!(record.get(fields::FACILITY), Some("100 - North Clinic"));
        assert_eq!(record.get(fields::SERIAL), Some(UNKNOWN));
        assert!(!record.contains(fields::MODEL));

        let reasons = anomalies
            .iter()
            .map(|a| (a.field.as_str(), a.reason))
            .collect::<Vec<_>>();
        assert_eq!(
            reasons,
            vec![
                (fields::STATUS, AnomalyReason::NotInPicklist),
                (fields::DEPLOY_DATE, AnomalyReason::UnparseableDate),
            ]
        );
        assert_eq!(anomalies[0].key.as_deref(), Some("123"));
        assert_eq!(anomalies[0].value, "Lost");
    }

    #[test]
    fn storage_blanks_unknown_markers_except_on_the_key() {
        assert_eq!(storage_value(fields::NOTES, UNKNOWN), "");
        assert_eq!(storage_value(fields::NOTES, "NA"), "");
        assert_eq!(storage_value(fields::NOTES, "Spare"), "Spare");
        assert_eq!(storage_value(fields::IMEI, UNKNOWN), UNKNOWN);
    }
}
