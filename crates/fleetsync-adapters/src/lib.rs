//! External system contracts: the ticketing system and the deployment sheet.
//!
//! Both systems are reached through async traits so the sync pipeline can run
//! against the HTTP clients in [`zendesk`] and [`smartsheet`] or against the
//! in-memory stores in [`fixture`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleetsync_core::{AllowedValues, FieldSchema};
use fleetsync_storage::FetchError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod fixture;
pub mod smartsheet;
pub mod zendesk;

pub use fixture::{
    FixtureSheetStore, FixtureTicketStore, PostedComment, SheetFixture, TicketFixture,
};
pub use smartsheet::{SmartsheetClient, SmartsheetConfig};
pub use zendesk::{ZendeskClient, ZendeskConfig};

pub const CRATE_NAME: &str = "fleetsync-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredOption {
    /// Machine value stored on records, when it differs from the display name.
    #[serde(default)]
    pub tag: Option<String>,
    pub name: String,
}

/// One field or column as reported by a discovery endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredField {
    pub name: String,
    pub identifier: String,
    #[serde(default)]
    pub options: Vec<DiscoveredOption>,
}

impl DiscoveredField {
    pub fn into_field_schema(self) -> FieldSchema {
        let allowed = if self.options.iter().any(|o| o.tag.is_some()) {
            AllowedValues::with_tags(
                self.options
                    .into_iter()
                    .map(|o| (o.tag.unwrap_or_else(|| o.name.clone()), o.name)),
            )
        } else {
            AllowedValues::new(self.options.into_iter().map(|o| o.name))
        };
        FieldSchema::new(self.name, self.identifier).with_allowed(allowed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub group_id: Option<String>,
    /// Custom field id -> value as text. Fields without a value are omitted.
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow {
    pub row_id: String,
    /// Column id -> cell value as text.
    #[serde(default)]
    pub cells: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub column_id: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpdate {
    pub row_id: String,
    pub cells: Vec<CellUpdate>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{system} client is not configured: {missing} is missing")]
    Configuration {
        system: &'static str,
        missing: &'static str,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_transient())
    }
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    fn system(&self) -> &'static str {
        "ticketing"
    }

    /// Ticket fields with their dropdown options, in one round trip.
    async fn ticket_fields(&self) -> Result<Vec<DiscoveredField>, AdapterError>;

    async fn search_tickets(
        &self,
        form_id: &str,
        group_id: &str,
    ) -> Result<Vec<Ticket>, AdapterError>;

    async fn ticket_status(&self, ticket_id: &str) -> Result<String, AdapterError>;

    async fn ticket_comments(&self, ticket_id: &str) -> Result<Vec<String>, AdapterError>;

    /// Appends a non-public comment and moves the ticket to `group_id`.
    async fn post_private_comment(
        &self,
        ticket_id: &str,
        body: &str,
        group_id: &str,
    ) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait SheetStore: Send + Sync {
    fn system(&self) -> &'static str {
        "sheet"
    }

    async fn columns(&self) -> Result<Vec<DiscoveredField>, AdapterError>;

    async fn rows(&self) -> Result<Vec<SheetRow>, AdapterError>;

    async fn update_rows(&self, rows: &[RowUpdate]) -> Result<usize, AdapterError>;

    async fn add_rows(&self, rows: &[Vec<CellUpdate>]) -> Result<usize, AdapterError>;
}

/// Text form of a JSON scalar as the external systems report it. Arrays are
/// comma-joined; null yields `None`.
pub fn json_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(items) => {
            let parts = items.iter().filter_map(json_to_text).collect::<Vec<_>>();
            Some(parts.join(","))
        }
        JsonValue::Object(_) => Some(value.to_string()),
    }
}

/// Numeric ids go over the wire as JSON numbers, anything else as strings.
pub fn id_to_json(id: &str) -> JsonValue {
    id.parse::<u64>()
        .map(JsonValue::from)
        .unwrap_or_else(|_| JsonValue::String(id.to_string()))
}

pub(crate) fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
