//! Core record model, field policy, and text normalization for fleetsync.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fleetsync-core";

/// Placeholder rendered for absent, blank, or invalid values.
pub const UNKNOWN: &str = "N/A";
/// Returned by [`format_date`] when the input does not match the pattern.
pub const UNPARSEABLE_DATE: &str = "UNPARSEABLE";
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";
/// Upstream exports prefix numeric-looking values with this to force text.
pub const QUOTE_MARKER: char = '\'';

pub mod fields {
    pub const IMEI: &str = "IMEI #";
    pub const SERIAL: &str = "Serial # Apple only";
    pub const BRAND: &str = "Brand";
    pub const MODEL: &str = "Model";
    pub const STATUS: &str = "Status";
    pub const DEPLOY_DATE: &str = "Deploy Date";
    pub const FULFILLED_BY: &str = "Fulfilled By";
    pub const TICKET: &str = "Ticket #";
    pub const FACILITY: &str = "GL Code - Facility Name";
    pub const RECIPIENT: &str = "Recipient";
    pub const NOTES: &str = "Notes";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Natural key of a record.
    Key,
    Text,
    Date,
    Picklist { title_case: bool },
    /// Picklist whose raw values may arrive wrapped in quote characters.
    Facility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// `N/A`-style markers are stored as empty cells.
    pub blank_as_unknown: bool,
}

const fn spec(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        blank_as_unknown: !matches!(kind, FieldKind::Key),
    }
}

/// Recognized fields in artifact column order.
pub const RECOGNIZED_FIELDS: [FieldSpec; 11] = [
    spec(fields::IMEI, FieldKind::Key),
    spec(fields::SERIAL, FieldKind::Text),
    spec(fields::BRAND, FieldKind::Picklist { title_case: false }),
    spec(fields::MODEL, FieldKind::Picklist { title_case: false }),
    spec(fields::STATUS, FieldKind::Picklist { title_case: false }),
    spec(fields::DEPLOY_DATE, FieldKind::Date),
    spec(fields::FULFILLED_BY, FieldKind::Picklist { title_case: false }),
    spec(fields::TICKET, FieldKind::Text),
    spec(fields::FACILITY, FieldKind::Facility),
    spec(fields::RECIPIENT, FieldKind::Picklist { title_case: true }),
    spec(fields::NOTES, FieldKind::Picklist { title_case: false }),
];

pub fn field_spec(name: &str) -> Option<&'static FieldSpec> {
    RECOGNIZED_FIELDS.iter().find(|spec| spec.name == name)
}

pub fn recognized_field_names() -> Vec<&'static str> {
    RECOGNIZED_FIELDS.iter().map(|spec| spec.name).collect()
}

/// Field name -> text value. A field missing from the map is absent, which is
/// distinct from present-but-blank.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    values: BTreeMap<String, String>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Every recognized field set to [`UNKNOWN`].
    pub fn unknown() -> Self {
        Self::from_pairs(RECOGNIZED_FIELDS.iter().map(|spec| (spec.name, UNKNOWN)))
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<String> {
        self.values.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Writes every field of `incoming` over this record.
    pub fn overlay(&mut self, incoming: &Record) {
        for (field, value) in &incoming.values {
            self.values.insert(field.clone(), value.clone());
        }
    }

    pub fn natural_key(&self) -> Option<String> {
        self.get(fields::IMEI)
            .map(normalize_key)
            .filter(|key| !key.is_empty() && *key != normalize(UNKNOWN, false))
    }

    /// Values in `header` order; absent fields render as [`UNKNOWN`].
    pub fn render(&self, header: &[impl AsRef<str>]) -> Vec<String> {
        header
            .iter()
            .map(|field| {
                self.get(field.as_ref())
                    .map(str::to_string)
                    .unwrap_or_else(|| UNKNOWN.to_string())
            })
            .collect()
    }
}

pub fn strip_quote_marker(text: &str) -> &str {
    text.strip_prefix(QUOTE_MARKER).unwrap_or(text)
}

/// True for blank text and `N/A`-style "not applicable" markers.
pub fn is_unknown_marker(text: &str) -> bool {
    let normalized = normalize(text, false);
    normalized.is_empty() || normalized == "NA"
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical comparison form: quote marker removed, upper-cased, characters
/// outside letters/digits/whitespace/hyphen dropped, whitespace collapsed.
/// With `capitalize` the result is title-cased instead.
pub fn normalize(text: &str, capitalize: bool) -> String {
    let text = strip_quote_marker(text.trim_start());
    let collapsed = normalize_whitespace(&comparable_chars(&text.to_uppercase()));
    if capitalize {
        // Case mapping can emit combining marks (`İ` lowers to `i` + U+0307).
        normalize_whitespace(&comparable_chars(&title_case(&collapsed)))
    } else {
        collapsed
    }
}

fn comparable_chars(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect()
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = !ch.is_numeric();
        }
    }
    out
}

/// Natural key form of an identifier. Spreadsheets that coerce identifiers to
/// numbers hand them back with a `.0` suffix, which is dropped here.
pub fn normalize_key(text: &str) -> String {
    normalize(&clean_identifier(text), false)
}

/// Identifier as it should be stored: no quote marker, no `.0` suffix, case
/// left untouched.
pub fn clean_identifier(text: &str) -> String {
    let text = strip_quote_marker(text.trim());
    text.strip_suffix(".0").unwrap_or(text).trim().to_string()
}

pub fn clean_facility_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches(QUOTE_MARKER)
        .trim()
        .to_string()
}

pub fn parse_date(text: &str, pattern: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), pattern).ok()
}

/// Re-renders `text` in `pattern`, or [`UNPARSEABLE_DATE`] when it does not parse.
pub fn format_date(text: &str, pattern: &str) -> String {
    match parse_date(text, pattern) {
        Some(date) => date.format(pattern).to_string(),
        None => UNPARSEABLE_DATE.to_string(),
    }
}

/// Allowed values of a picklist field with a normalized lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedValues {
    canonical: Vec<String>,
    lookup: HashMap<String, String>,
    tags: HashMap<String, String>,
}

impl AllowedValues {
    pub fn new<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        let mut allowed = Self::default();
        for value in values {
            allowed.push(value.into());
        }
        allowed
    }

    /// Options that are stored upstream as a machine tag but displayed by name.
    pub fn with_tags<T, N>(options: impl IntoIterator<Item = (T, N)>) -> Self
    where
        T: Into<String>,
        N: Into<String>,
    {
        let mut allowed = Self::default();
        for (tag, name) in options {
            let name = name.into();
            allowed.tags.insert(tag.into(), name.clone());
            allowed.push(name);
        }
        allowed
    }

    fn push(&mut self, value: String) {
        let value = value.trim().to_string();
        if value.is_empty() {
            return;
        }
        let normalized = normalize(&value, false);
        if self.lookup.contains_key(&normalized) {
            return;
        }
        self.lookup.insert(normalized, value.clone());
        self.canonical.push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    /// Canonical spelling of `raw`, matched case- and punctuation-insensitively.
    pub fn resolve(&self, raw: &str) -> Option<&str> {
        self.lookup.get(&normalize(raw, false)).map(String::as_str)
    }

    pub fn resolve_tag(&self, tag: &str) -> Option<&str> {
        self.tags.get(tag).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: String,
    pub identifier: String,
    pub allowed: AllowedValues,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.into(),
            allowed: AllowedValues::default(),
        }
    }

    pub fn with_allowed(mut self, allowed: AllowedValues) -> Self {
        self.allowed = allowed;
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{system} schema is missing required fields: {}", fields.join(", "))]
    MissingFields { system: String, fields: Vec<String> },
}

/// Field layout of one external system as discovered at the start of a run.
/// Built once and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    system: String,
    fields: BTreeMap<String, FieldSchema>,
}

impl Schema {
    /// Later duplicates of a field name replace earlier ones.
    pub fn new(system: impl Into<String>, fields: impl IntoIterator<Item = FieldSchema>) -> Self {
        Self {
            system: system.into(),
            fields: fields
                .into_iter()
                .map(|field| (field.name.clone(), field))
                .collect(),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    pub fn identifier(&self, name: &str) -> Option<&str> {
        self.field(name).map(|field| field.identifier.as_str())
    }

    pub fn allowed(&self, name: &str) -> Option<&AllowedValues> {
        self.field(name).map(|field| &field.allowed)
    }

    pub fn field_for_identifier(&self, identifier: &str) -> Option<&FieldSchema> {
        self.fields
            .values()
            .find(|field| field.identifier == identifier)
    }

    pub fn require<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<(), SchemaError> {
        let missing = names
            .into_iter()
            .filter(|name| !self.fields.contains_key(*name))
            .map(str::to_string)
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::MissingFields {
                system: self.system.clone(),
                fields: missing,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_cleans_case_punctuation_and_spacing() {
        assert_eq!(normalize("  apple  iphone 13!! ", false), "APPLE IPHONE 13");
        assert_eq!(normalize("T-Mobile / Sprint", false), "T-MOBILE SPRINT");
        assert_eq!(normalize("'351234", false), "351234");
        assert_eq!(normalize("   ", false), "");
        assert_eq!(normalize("", true), "");
    }

    #[test]
    fn normalize_title_cases_names() {
        assert_eq!(normalize("jean-luc  PICARD", true), "Jean-Luc Picard");
        assert_eq!(normalize("o'brien", true), "Obrien");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in [
            "  apple  ",
            "'12345.0",
            "Straße  Müller",
            "a\tb\nc",
            "--x--",
            "École  élève",
            "N/A",
            "xİ",
            "İSTANBUL ıi",
        ] {
            let once = normalize(input, false);
            assert_eq!(normalize(&once, false), once, "input {input:?}");
            let titled = normalize(input, true);
            assert_eq!(normalize(&titled, true), titled, "input {input:?}");
        }
        assert_eq!(normalize("xİ", true), "Xi");
    }

    #[test]
    fn only_a_single_quote_marker_is_removed_from_keys() {
        assert_eq!(strip_quote_marker("'123"), "123");
        assert_eq!(strip_quote_marker("''123"), "'123");
        assert_eq!(normalize_key(" '356938035643809.0 "), "356938035643809");
        assert_eq!(normalize_key("abc-12"), "ABC-12");
        assert_eq!(clean_identifier("'abc-12.0"), "abc-12");
        assert_eq!(clean_identifier("12.05"), "12.05");
    }

    #[test]
    fn format_date_round_trips_or_flags() {
        assert_eq!(format_date(" 2024-03-05 ", DEFAULT_DATE_FORMAT), "2024-03-05");
        assert_eq!(format_date("2024-3-5", DEFAULT_DATE_FORMAT), "2024-03-05");
        assert_eq!(format_date("03/05/2024", DEFAULT_DATE_FORMAT), UNPARSEABLE_DATE);
        assert_eq!(format_date("", DEFAULT_DATE_FORMAT), UNPARSEABLE_DATE);
        assert_eq!(format_date("03/05/2024", "%m/%d/%Y"), "03/05/2024");
    }

    #[test]
    fn facility_names_lose_wrapping_quotes() {
        assert_eq!(clean_facility_name("\"4100 - Main Campus\""), "4100 - Main Campus");
        assert_eq!(clean_facility_name("'North'"), "North");
    }

    #[test]
    fn allowed_values_resolve_to_original_spelling() {
        let allowed = AllowedValues::new(["Apple", "Samsung", " apple "]);
        assert_eq!(allowed.len(), 2);
        assert_eq!(allowed.resolve("apple "), Some("Apple"));
        assert_eq!(allowed.resolve("SAMSUNG!"), Some("Samsung"));
        assert_eq!(allowed.resolve("Nokia"), None);

        let tagged = AllowedValues::with_tags([("brand_apple", "Apple")]);
        assert_eq!(tagged.resolve_tag("brand_apple"), Some("Apple"));
        assert_eq!(tagged.resolve("APPLE"), Some("Apple"));
        assert_eq!(tagged.resolve_tag("brand_nokia"), None);
    }

    #[test]
    fn schema_require_lists_every_missing_field() {
        let schema = Schema::new(
            "sheet",
            [
                FieldSchema::new(fields::IMEI, "1"),
                FieldSchema::new(fields::BRAND, "2"),
            ],
        );
        assert!(schema.require([fields::IMEI, fields::BRAND]).is_ok());
        let err = schema
            .require([fields::IMEI, fields::STATUS, fields::NOTES])
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingFields {
                system: "sheet".into(),
                fields: vec![fields::STATUS.into(), fields::NOTES.into()],
            }
        );
        assert_eq!(schema.field_for_identifier("2").map(|f| f.name.as_str()), Some(fields::BRAND));
    }

    #[test]
    fn record_renders_absent_fields_as_unknown() {
        let record = Record::from_pairs([(fields::IMEI, "123"), (fields::BRAND, "")]);
        let header = [fields::IMEI, fields::BRAND, fields::MODEL];
        assert_eq!(record.render(&header), vec!["123", "", UNKNOWN]);
        assert_eq!(record.natural_key().as_deref(), Some("123"));
        assert_eq!(Record::unknown().len(), RECOGNIZED_FIELDS.len());
    }

    #[test]
    fn record_serializes_as_plain_map() {
        let record = Record::from_pairs([(fields::IMEI, "123")]);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"IMEI #":"123"}"#);
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn only_the_key_field_keeps_unknown_markers() {
        assert!(!field_spec(fields::IMEI).unwrap().blank_as_unknown);
        assert!(field_spec(fields::NOTES).unwrap().blank_as_unknown);
        assert_eq!(recognized_field_names().first(), Some(&fields::IMEI));
    }

    #[test]
    fn unknown_markers_cover_blank_and_not_applicable() {
        for marker in ["", "  ", UNKNOWN, "n/a", "NA"] {
            assert!(is_unknown_marker(marker), "{marker:?}");
        }
        assert!(!is_unknown_marker("NAS"));
    }
}
