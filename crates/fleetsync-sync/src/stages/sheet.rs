use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleetsync_adapters::{CellUpdate, RowUpdate, SheetRow};
use fleetsync_core::{
    clean_identifier, fields, normalize_key, recognized_field_names, Record, Schema,
    RECOGNIZED_FIELDS,
};
use tracing::{debug, info, warn};

use super::{
    Stage, StageContext, StageReport, APPLY_UPSERTS, RECONCILE_SHEET, REPAIR_KEYS,
    SHEET_ARTIFACT, TICKETS_ARTIFACT,
};
use crate::merge::{index_by_key, merge, MergeKind};
use crate::validate::{canonicalize_record, storage_value};

/// Sheet row as a record keyed by field name. Cells in columns the schema
/// does not know are ignored.
pub fn row_record(row: &SheetRow, schema: &Schema) -> Record {
    let mut record = Record::new();
    for (column_id, value) in &row.cells {
        if let Some(field) = schema.field_for_identifier(column_id) {
            record.set(field.name.clone(), value.clone());
        }
    }
    record
}

/// Canonicalizes the ticket export and merges it against the current sheet
/// into `smartsheet_data.csv`.
pub struct ReconcileSheet;

#[async_trait]
impl Stage for ReconcileSheet {
    fn id(&self) -> &str {
        RECONCILE_SHEET
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport> {
        let sheet = ctx.sheet()?;
        let field_names = recognized_field_names();
        let schema = ctx.sheet_schema().await?;
        schema.require(field_names.iter().copied())?;

        let raw = ctx.artifacts.read_records(TICKETS_ARTIFACT).await?;
        let mut anomalies = Vec::new();
        let incoming = raw
            .iter()
            .map(|record| {
                let (canonical, found) =
                    canonicalize_record(record, &schema, &ctx.settings.date_format);
                anomalies.extend(found);
                canonical
            })
            .collect::<Vec<_>>();

        let rows = sheet.rows().await.context("reading sheet rows")?;
        let existing = index_by_key(rows.iter().map(|row| row_record(row, &schema)));

        let mut report = StageReport::new(self.id());
        let mut out = Vec::new();
        for merged in merge(&incoming, &existing) {
            match merged.kind {
                MergeKind::Update => report.updated += 1,
                MergeKind::Insert => report.inserted += 1,
                MergeKind::Retained => continue,
            }
            out.push(merged.record);
        }

        let stored = ctx
            .artifacts
            .write_records(SHEET_ARTIFACT, &field_names, &out)
            .await?;
        if !anomalies.is_empty() {
            warn!(count = anomalies.len(), "values replaced by sentinels during reconcile");
        }
        info!(
            incoming = incoming.len(),
            snapshot = existing.len(),
            updates = report.updated,
            inserts = report.inserted,
            "reconciled sheet"
        );

        report.rows = stored.rows;
        report.artifacts.push(stored.name);
        report.anomalies = anomalies;
        Ok(report)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertPlan {
    pub updates: Vec<RowUpdate>,
    pub inserts: Vec<Vec<CellUpdate>>,
    /// Records whose row already holds every prepared value.
    pub unchanged: usize,
}

fn prepare_cells(record: &Record, schema: &Schema) -> Vec<CellUpdate> {
    RECOGNIZED_FIELDS
        .iter()
        .filter_map(|spec| {
            let value = record.get(spec.name)?;
            let column_id = schema.identifier(spec.name)?;
            Some(CellUpdate {
                column_id: column_id.to_string(),
                value: storage_value(spec.name, value),
            })
        })
        .collect()
}

/// Splits reconciled records into row updates and inserts. Only cells whose
/// text differs from the sheet are sent, so re-applying the same artifact
/// is a no-op.
pub fn plan_upserts(records: &[Record], rows: &[SheetRow], schema: &Schema) -> UpsertPlan {
    let mut rows_by_key: HashMap<String, &SheetRow> = HashMap::new();
    if let Some(column) = schema.identifier(fields::IMEI) {
        for row in rows {
            let Some(key) = row.cells.get(column).map(|v| normalize_key(v)) else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            rows_by_key.entry(key).or_insert(row);
        }
    }

    let mut plan = UpsertPlan::default();
    let mut planned = HashSet::new();
    for record in records {
        let Some(key) = record.natural_key() else {
            debug!("record without identifier not applied");
            continue;
        };
        if !planned.insert(key.clone()) {
            warn!(key = %key, "identifier repeated in artifact; applying first only");
            continue;
        }

        let cells = prepare_cells(record, schema);
        match rows_by_key.get(&key) {
            Some(row) => {
                let changed = cells
                    .into_iter()
                    .filter(|cell| {
                        row.cells
                            .get(&cell.column_id)
                            .map(String::as_str)
                            .unwrap_or_default()
                            != cell.value
                    })
                    .collect::<Vec<_>>();
                if changed.is_empty() {
                    plan.unchanged += 1;
                } else {
                    plan.updates.push(RowUpdate {
                        row_id: row.row_id.clone(),
                        cells: changed,
                    });
                }
            }
            None => plan.inserts.push(cells),
        }
    }
    plan
}

/// Writes `smartsheet_data.csv` back to the sheet: updates by row id for
/// known identifiers, new rows at the bottom otherwise.
pub struct ApplyUpserts;

#[async_trait]
impl Stage for ApplyUpserts {
    fn id(&self) -> &str {
        APPLY_UPSERTS
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport> {
        let sheet = ctx.sheet()?;
        let schema = ctx.sheet_schema().await?;
        schema.require(recognized_field_names())?;
        let records = ctx.artifacts.read_records(SHEET_ARTIFACT).await?;
        let rows = sheet.rows().await.context("reading sheet rows")?;
        let plan = plan_upserts(&records, &rows, &schema);

        let mut report = StageReport::new(self.id());
        report.skipped = plan.unchanged;
        if !plan.updates.is_empty() {
            report.updated = sheet
                .update_rows(&plan.updates)
                .await
                .context("updating sheet rows")?;
        }
        if !plan.inserts.is_empty() {
            report.inserted = sheet
                .add_rows(&plan.inserts)
                .await
                .context("adding sheet rows")?;
        }
        info!(
            updated = report.updated,
            inserted = report.inserted,
            unchanged = report.skipped,
            "applied upserts"
        );
        Ok(report)
    }
}

/// Row updates that rewrite identifier cells carrying a quote marker or a
/// `.0` suffix.
pub fn repair_updates(rows: &[SheetRow], column_id: &str) -> Vec<RowUpdate> {
    rows.iter()
        .filter_map(|row| {
            let current = row.cells.get(column_id)?;
            let clean = clean_identifier(current);
            if clean.is_empty() || clean == *current {
                return None;
            }
            Some(RowUpdate {
                row_id: row.row_id.clone(),
                cells: vec![CellUpdate {
                    column_id: column_id.to_string(),
                    value: clean,
                }],
            })
        })
        .collect()
}

pub struct RepairKeys;

#[async_trait]
impl Stage for RepairKeys {
    fn id(&self) -> &str {
        REPAIR_KEYS
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport> {
        let sheet = ctx.sheet()?;
        let schema = ctx.sheet_schema().await?;
        let column_id = schema
            .identifier(fields::IMEI)
            .context("identifier column missing from sheet schema")?;
        let rows = sheet.rows().await.context("reading sheet rows")?;
        let updates = repair_updates(&rows, column_id);

        let mut report = StageReport::new(self.id());
        if !updates.is_empty() {
            report.updated = sheet
                .update_rows(&updates)
                .await
                .context("repairing identifier cells")?;
        }
        report.skipped = rows.len() - updates.len();
        info!(repaired = report.updated, "repaired identifier cells");
        Ok(report)
    }
}
