//! Ticketing system client (Zendesk REST API v2).

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleetsync_storage::{url_with_query, Auth, HttpClient, HttpClientConfig};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::{
    id_to_json, json_to_text, AdapterError, DiscoveredField, DiscoveredOption, Ticket, TicketStore,
};

#[derive(Debug, Clone)]
pub struct ZendeskConfig {
    /// API root, e.g. `https://acme.zendesk.com/api/v2`.
    pub base_url: String,
    pub email: String,
    pub api_token: String,
}

impl ZendeskConfig {
    pub fn for_subdomain(
        subdomain: &str,
        email: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            base_url: format!("https://{subdomain}.zendesk.com/api/v2"),
            email: email.into(),
            api_token: api_token.into(),
        }
    }
}

#[derive(Debug)]
pub struct ZendeskClient {
    http: HttpClient,
    base_url: String,
    auth: Auth,
}

#[derive(Debug, Deserialize)]
struct TicketFieldsPage {
    #[serde(default)]
    ticket_fields: Vec<RawTicketField>,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTicketField {
    id: u64,
    title: String,
    #[serde(default)]
    custom_field_options: Vec<RawFieldOption>,
}

#[derive(Debug, Deserialize)]
struct RawFieldOption {
    name: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    results: Vec<RawTicket>,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTicket {
    id: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    group_id: Option<u64>,
    #[serde(default)]
    custom_fields: Vec<RawCustomField>,
}

#[derive(Debug, Deserialize)]
struct RawCustomField {
    id: u64,
    #[serde(default)]
    value: JsonValue,
}

#[derive(Debug, Deserialize)]
struct TicketEnvelope {
    ticket: RawTicket,
}

#[derive(Debug, Deserialize)]
struct CommentsPage {
    #[serde(default)]
    comments: Vec<RawComment>,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    #[serde(default)]
    body: String,
}

impl From<RawTicket> for Ticket {
    fn from(raw: RawTicket) -> Self {
        let custom_fields = raw
            .custom_fields
            .into_iter()
            .filter_map(|field| json_to_text(&field.value).map(|v| (field.id.to_string(), v)))
            .collect::<BTreeMap<_, _>>();
        Ticket {
            id: raw.id.to_string(),
            status: raw.status,
            group_id: raw.group_id.map(|g| g.to_string()),
            custom_fields,
        }
    }
}

impl ZendeskClient {
    pub fn new(config: ZendeskConfig, http: HttpClientConfig) -> Result<Self, AdapterError> {
        if config.email.is_empty() {
            return Err(AdapterError::Configuration {
                system: "zendesk",
                missing: "ZENDESK_EMAIL",
            });
        }
        if config.api_token.is_empty() {
            return Err(AdapterError::Configuration {
                system: "zendesk",
                missing: "ZENDESK_API_TOKEN",
            });
        }
        Ok(Self {
            http: HttpClient::new(http)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth: Auth::Basic {
                username: format!("{}/token", config.email),
                password: config.api_token,
            },
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl TicketStore for ZendeskClient {
    fn system(&self) -> &'static str {
        "zendesk"
    }

    async fn ticket_fields(&self) -> Result<Vec<DiscoveredField>, AdapterError> {
        let mut fields = Vec::new();
        let mut next = Some(self.url("ticket_fields.json"));
        while let Some(url) = next {
            let page: TicketFieldsPage = self.http.get_json(&url, &self.auth).await?;
            fields.extend(page.ticket_fields.into_iter().map(|raw| DiscoveredField {
                name: raw.title,
                identifier: raw.id.to_string(),
                options: raw
                    .custom_field_options
                    .into_iter()
                    .map(|o| DiscoveredOption {
                        tag: o.value,
                        name: o.name,
                    })
                    .collect(),
            }));
            next = page.next_page;
        }
        debug!(count = fields.len(), "fetched ticket fields");
        Ok(fields)
    }

    async fn search_tickets(
        &self,
        form_id: &str,
        group_id: &str,
    ) -> Result<Vec<Ticket>, AdapterError> {
        let query = format!("type:ticket form:{form_id} group:{group_id}");
        let mut next = Some(url_with_query(&self.url("search.json"), &[("query", &query)])?);
        let mut tickets = Vec::new();
        while let Some(url) = next {
            let page: SearchPage = self.http.get_json(&url, &self.auth).await?;
            info!(group_id, count = page.results.len(), "fetched ticket search page");
            tickets.extend(page.results.into_iter().map(Ticket::from));
            next = page.next_page;
        }
        Ok(tickets)
    }

    async fn ticket_status(&self, ticket_id: &str) -> Result<String, AdapterError> {
        let envelope: TicketEnvelope = self
            .http
            .get_json(&self.url(&format!("tickets/{ticket_id}.json")), &self.auth)
            .await?;
        Ok(envelope.ticket.status)
    }

    async fn ticket_comments(&self, ticket_id: &str) -> Result<Vec<String>, AdapterError> {
        let mut next = Some(self.url(&format!("tickets/{ticket_id}/comments.json")));
        let mut bodies = Vec::new();
        while let Some(url) = next {
            let page: CommentsPage = self.http.get_json(&url, &self.auth).await?;
            bodies.extend(page.comments.into_iter().map(|c| c.body));
            next = page.next_page;
        }
        Ok(bodies)
    }

    async fn post_private_comment(
        &self,
        ticket_id: &str,
        body: &str,
        group_id: &str,
    ) -> Result<(), AdapterError> {
        let payload = json!({
            "ticket": {
                "comment": { "body": body, "public": false },
                "group_id": id_to_json(group_id),
            }
        });
        let _: JsonValue = self
            .http
            .put_json(&self.url(&format!("tickets/{ticket_id}.json")), &self.auth, &payload)
            .await?;
        info!(ticket_id, group_id, "posted private comment");
        Ok(())
    }
}
