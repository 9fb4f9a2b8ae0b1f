use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleetsync_adapters::Ticket;
use fleetsync_core::{fields, is_unknown_marker, strip_quote_marker, Record, Schema, UNKNOWN};
use tracing::{debug, info};

use super::{
    ticket_export_header, Stage, StageContext, StageReport, StageSettings, EXPORT_TICKETS,
    FORM_ID_COLUMN, NOTIFY_TICKETS, QUEUE_ID_COLUMN, SHEET_ARTIFACT, TICKETS_ARTIFACT,
    WAITING_QUEUE_ID_COLUMN,
};
use crate::dedup::{fingerprint, fingerprints, seen, RowDeduplicator};
use crate::schema::load_ticket_schema;

/// Pulls open deployment tickets from the work and waiting queues into
/// `zendesk_tickets.csv`, one row per device identifier.
pub struct ExportTickets;

#[async_trait]
impl Stage for ExportTickets {
    fn id(&self) -> &str {
        EXPORT_TICKETS
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport> {
        let store = ctx.tickets()?;
        let settings = &ctx.settings;
        settings.require("ZENDESK_FORM_ID", &settings.form_id)?;
        settings.require("ZENDESK_QUEUE_ID", &settings.queue_id)?;
        settings.require("ZENDESK_WAITING_QUEUE_ID", &settings.waiting_queue_id)?;

        let schema = load_ticket_schema(store, &[fields::IMEI])
            .await
            .context("loading ticket fields")?;

        let mut tickets = Vec::new();
        for group_id in [&settings.queue_id, &settings.waiting_queue_id] {
            let found = store
                .search_tickets(&settings.form_id, group_id)
                .await
                .with_context(|| format!("searching tickets in queue {group_id}"))?;
            info!(group_id = %group_id, tickets = found.len(), "fetched queue");
            tickets.extend(found);
        }

        let rows = export_rows(&tickets, &schema, settings);
        let stored = ctx
            .artifacts
            .write_records(TICKETS_ARTIFACT, &ticket_export_header(), &rows)
            .await?;
        info!(
            tickets = tickets.len(),
            rows = stored.rows,
            content_hash = %stored.content_hash,
            "wrote ticket export"
        );

        let mut report = StageReport::new(self.id());
        report.rows = stored.rows;
        report.artifacts.push(stored.name);
        Ok(report)
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|item| strip_quote_marker(item.trim()).trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Dropdown values arrive as option tags; unknown tags on a dropdown become
/// the unknown sentinel, plain fields pass through.
fn resolve_dropdown(schema: &Schema, field: &str, tag: &str) -> String {
    match schema.allowed(field) {
        Some(allowed) if !allowed.is_empty() => allowed
            .resolve_tag(tag)
            .or_else(|| allowed.resolve(tag))
            .unwrap_or(UNKNOWN)
            .to_string(),
        _ => tag.to_string(),
    }
}

/// Export rows for `tickets`. A ticket listing several identifiers yields one
/// row each, with recipients assigned round-robin. Rows whose full tuple of
/// values was already produced are dropped.
pub fn export_rows(tickets: &[Ticket], schema: &Schema, settings: &StageSettings) -> Vec<Record> {
    let header = ticket_export_header();
    let mut dedup = RowDeduplicator::new();
    let mut rows = Vec::new();

    for ticket in tickets {
        let raw = |field: &str| {
            schema
                .identifier(field)
                .and_then(|id| ticket.custom_fields.get(id))
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };
        let identifiers = split_list(raw(fields::IMEI));
        if identifiers.is_empty() {
            debug!(ticket_id = %ticket.id, "ticket lists no device identifiers");
            continue;
        }
        let recipients = split_list(raw(fields::RECIPIENT));
        let text = |field: &str| raw(field).unwrap_or(UNKNOWN).to_string();
        let dropdown = |field: &str| {
            raw(field)
                .map(|tag| resolve_dropdown(schema, field, tag))
                .unwrap_or_else(|| UNKNOWN.to_string())
        };
        let queue_column = |queue_id: &str| {
            if ticket.group_id.as_deref() == Some(queue_id) {
                queue_id.to_string()
            } else {
                UNKNOWN.to_string()
            }
        };

        for (index, identifier) in identifiers.iter().enumerate() {
            let recipient = if recipients.is_empty() {
                UNKNOWN.to_string()
            } else {
                recipients[index % recipients.len()].clone()
            };
            let record = Record::from_pairs([
                (fields::IMEI, identifier.clone()),
                (fields::SERIAL, text(fields::SERIAL)),
                (fields::BRAND, dropdown(fields::BRAND)),
                (fields::MODEL, dropdown(fields::MODEL)),
                (fields::STATUS, dropdown(fields::STATUS)),
                (fields::DEPLOY_DATE, text(fields::DEPLOY_DATE)),
                (fields::FULFILLED_BY, dropdown(fields::FULFILLED_BY)),
                (fields::TICKET, ticket.id.clone()),
                (fields::FACILITY, dropdown(fields::FACILITY)),
                (fields::RECIPIENT, recipient),
                (fields::NOTES, dropdown(fields::NOTES)),
                (QUEUE_ID_COLUMN, queue_column(&settings.queue_id)),
                (WAITING_QUEUE_ID_COLUMN, queue_column(&settings.waiting_queue_id)),
                (FORM_ID_COLUMN, settings.form_id.clone()),
            ]);
            if dedup.admit(&header, &record) {
                rows.push(record);
            } else {
                debug!(
                    ticket_id = %ticket.id,
                    identifier = %identifier,
                    "duplicate export row dropped"
                );
            }
        }
    }
    rows
}

/// Records grouped by ticket id in order of first appearance. Records without
/// a ticket id are left out.
pub fn group_by_ticket(records: &[Record]) -> Vec<(String, Vec<&Record>)> {
    let mut groups: Vec<(String, Vec<&Record>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for record in records {
        let ticket_id = record.get(fields::TICKET).unwrap_or_default().trim();
        if is_unknown_marker(ticket_id) {
            continue;
        }
        match index.get(ticket_id) {
            Some(&position) => groups[position].1.push(record),
            None => {
                index.insert(ticket_id.to_string(), groups.len());
                groups.push((ticket_id.to_string(), vec![record]));
            }
        }
    }
    groups
}

const COMMENT_LINES: [(&str, &str); 10] = [
    ("IMEI #", fields::IMEI),
    ("Serial # Apple Only", fields::SERIAL),
    ("Brand", fields::BRAND),
    ("Model", fields::MODEL),
    ("Status", fields::STATUS),
    ("Deploy Date", fields::DEPLOY_DATE),
    ("Fulfilled By", fields::FULFILLED_BY),
    ("GL Code - Facility Name", fields::FACILITY),
    ("Recipient", fields::RECIPIENT),
    ("Notes", fields::NOTES),
];

/// Private note summarizing every device on a ticket.
pub fn comment_body(records: &[&Record]) -> String {
    let blocks = records
        .iter()
        .map(|record| {
            COMMENT_LINES
                .iter()
                .map(|(label, field)| {
                    format!("{label}: {}", record.get(field).unwrap_or(UNKNOWN).trim())
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect::<Vec<_>>();
    format!("Form Data:\n{}", blocks.join("\n\n")).trim().to_string()
}

/// Posts the device summary back to each open ticket and moves it to the
/// waiting queue, unless an equivalent comment is already there.
pub struct NotifyTickets;

#[async_trait]
impl Stage for NotifyTickets {
    fn id(&self) -> &str {
        NOTIFY_TICKETS
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport> {
        let store = ctx.tickets()?;
        let waiting_queue_id = &ctx.settings.waiting_queue_id;
        ctx.settings
            .require("ZENDESK_WAITING_QUEUE_ID", waiting_queue_id)?;

        let records = ctx.artifacts.read_records(SHEET_ARTIFACT).await?;
        let mut report = StageReport::new(self.id());
        for (ticket_id, rows) in group_by_ticket(&records) {
            let status = store
                .ticket_status(&ticket_id)
                .await
                .with_context(|| format!("fetching status of ticket {ticket_id}"))?;
            if status.eq_ignore_ascii_case("closed") {
                info!(ticket_id = %ticket_id, "ticket closed; not updating");
                report.skipped += 1;
                continue;
            }

            let body = comment_body(&rows);
            let existing = store
                .ticket_comments(&ticket_id)
                .await
                .with_context(|| format!("fetching comments of ticket {ticket_id}"))?;
            let existing = fingerprints(existing.iter().map(String::as_str));
            if seen(&fingerprint(&body), &existing) {
                info!(ticket_id = %ticket_id, "equivalent comment already present");
                report.skipped += 1;
                continue;
            }

            store
                .post_private_comment(&ticket_id, &body, waiting_queue_id)
                .await
                .with_context(|| format!("updating ticket {ticket_id}"))?;
            report.posted += 1;
        }
        info!(posted = report.posted, skipped = report.skipped, "ticket notifications done");
        Ok(report)
    }
}
