//! Deployment sheet client (Smartsheet REST API 2.0).

use async_trait::async_trait;
use fleetsync_storage::{url_with_query, Auth, HttpClient, HttpClientConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{
    id_to_json, json_to_text, AdapterError, CellUpdate, DiscoveredField, DiscoveredOption,
    RowUpdate, SheetRow, SheetStore,
};

pub const DEFAULT_API_BASE_URL: &str = "https://api.smartsheet.com/2.0";

#[derive(Debug, Clone)]
pub struct SmartsheetConfig {
    pub base_url: String,
    pub token: String,
    pub sheet_id: String,
}

#[derive(Debug)]
pub struct SmartsheetClient {
    http: HttpClient,
    base_url: String,
    sheet_id: String,
    auth: Auth,
}

#[derive(Debug, Deserialize)]
struct ColumnsPage {
    #[serde(default)]
    data: Vec<RawColumn>,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    id: u64,
    title: String,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSheet {
    #[serde(default)]
    rows: Vec<RawRow>,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    id: u64,
    #[serde(default)]
    cells: Vec<RawCell>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCell {
    column_id: u64,
    #[serde(default)]
    value: JsonValue,
    #[serde(default)]
    display_value: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to_bottom: Option<bool>,
    cells: Vec<OutgoingCell>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingCell {
    column_id: JsonValue,
    value: String,
}

#[derive(Debug, Deserialize)]
struct RowsResult {
    #[serde(default)]
    result: Vec<JsonValue>,
}

fn outgoing_cells(cells: &[CellUpdate]) -> Vec<OutgoingCell> {
    cells
        .iter()
        .map(|cell| OutgoingCell {
            column_id: id_to_json(&cell.column_id),
            value: cell.value.clone(),
        })
        .collect()
}

impl SmartsheetClient {
    pub fn new(config: SmartsheetConfig, http: HttpClientConfig) -> Result<Self, AdapterError> {
        if config.token.is_empty() {
            return Err(AdapterError::Configuration {
                system: "smartsheet",
                missing: "SMARTSHEET_TOKEN",
            });
        }
        if config.sheet_id.is_empty() {
            return Err(AdapterError::Configuration {
                system: "smartsheet",
                missing: "SMARTSHEET_SHEET_ID",
            });
        }
        let base_url = if config.base_url.is_empty() {
            DEFAULT_API_BASE_URL.to_string()
        } else {
            config.base_url.trim_end_matches('/').to_string()
        };
        Ok(Self {
            http: HttpClient::new(http)?,
            base_url,
            sheet_id: config.sheet_id,
            auth: Auth::Bearer(config.token),
        })
    }

    fn sheet_url(&self, suffix: &str) -> String {
        format!("{}/sheets/{}{}", self.base_url, self.sheet_id, suffix)
    }
}

#[async_trait]
impl SheetStore for SmartsheetClient {
    fn system(&self) -> &'static str {
        "smartsheet"
    }

    async fn columns(&self) -> Result<Vec<DiscoveredField>, AdapterError> {
        let url = url_with_query(&self.sheet_url("/columns"), &[("includeAll", "true")])?;
        let page: ColumnsPage = self.http.get_json(&url, &self.auth).await?;
        debug!(count = page.data.len(), "fetched sheet columns");
        Ok(page
            .data
            .into_iter()
            .map(|column| DiscoveredField {
                name: column.title,
                identifier: column.id.to_string(),
                options: column
                    .options
                    .into_iter()
                    .map(|name| DiscoveredOption { tag: None, name })
                    .collect(),
            })
            .collect())
    }

    async fn rows(&self) -> Result<Vec<SheetRow>, AdapterError> {
        let sheet: RawSheet = self.http.get_json(&self.sheet_url(""), &self.auth).await?;
        Ok(sheet
            .rows
            .into_iter()
            .map(|row| SheetRow {
                row_id: row.id.to_string(),
                cells: row
                    .cells
                    .into_iter()
                    .filter_map(|cell| {
                        json_to_text(&cell.value)
                            .or(cell.display_value)
                            .map(|v| (cell.column_id.to_string(), v))
                    })
                    .collect(),
            })
            .collect())
    }

    async fn update_rows(&self, rows: &[RowUpdate]) -> Result<usize, AdapterError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let body = rows
            .iter()
            .map(|row| OutgoingRow {
                id: Some(id_to_json(&row.row_id)),
                to_bottom: None,
                cells: outgoing_cells(&row.cells),
            })
            .collect::<Vec<_>>();
        let result: RowsResult = self
            .http
            .put_json(&self.sheet_url("/rows"), &self.auth, &body)
            .await?;
        info!(requested = rows.len(), updated = result.result.len(), "updated sheet rows");
        Ok(result.result.len())
    }

    async fn add_rows(&self, rows: &[Vec<CellUpdate>]) -> Result<usize, AdapterError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let body = rows
            .iter()
            .map(|cells| OutgoingRow {
                id: None,
                to_bottom: Some(true),
                cells: outgoing_cells(cells),
            })
            .collect::<Vec<_>>();
        let result: RowsResult = self
            .http
            .post_json(&self.sheet_url("/rows"), &self.auth, &body)
            .await?;
        info!(requested = rows.len(), added = result.result.len(), "added sheet rows");
        Ok(result.result.len())
    }
}
