//! In-memory stores for offline runs and tests, loadable from JSON fixtures.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    read_json_file, AdapterError, CellUpdate, DiscoveredField, RowUpdate, SheetRow, SheetStore,
    Ticket, TicketStore,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SheetFixture {
    pub columns: Vec<DiscoveredField>,
    #[serde(default)]
    pub rows: Vec<SheetRow>,
}

#[derive(Debug, Default)]
struct SheetState {
    fixture: SheetFixture,
    next_row_id: u64,
    column_calls: usize,
    update_calls: usize,
    add_calls: usize,
}

#[derive(Debug, Default)]
pub struct FixtureSheetStore {
    state: Mutex<SheetState>,
}

impl FixtureSheetStore {
    pub fn new(columns: Vec<DiscoveredField>, rows: Vec<SheetRow>) -> Self {
        let next_row_id = rows
            .iter()
            .filter_map(|row| row.row_id.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        Self {
            state: Mutex::new(SheetState {
                fixture: SheetFixture { columns, rows },
                next_row_id,
                column_calls: 0,
                update_calls: 0,
                add_calls: 0,
            }),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let fixture: SheetFixture = read_json_file(path)?;
        Ok(Self::new(fixture.columns, fixture.rows))
    }

    pub fn snapshot(&self) -> Vec<SheetRow> {
        lock(&self.state).fixture.rows.clone()
    }

    /// Column discovery round trips served so far.
    pub fn column_calls(&self) -> usize {
        lock(&self.state).column_calls
    }

    pub fn update_calls(&self) -> usize {
        lock(&self.state).update_calls
    }

    pub fn add_calls(&self) -> usize {
        lock(&self.state).add_calls
    }
}

#[async_trait]
impl SheetStore for FixtureSheetStore {
    async fn columns(&self) -> Result<Vec<DiscoveredField>, AdapterError> {
        let mut state = lock(&self.state);
        state.column_calls += 1;
        Ok(state.fixture.columns.clone())
    }

    async fn rows(&self) -> Result<Vec<SheetRow>, AdapterError> {
        Ok(self.snapshot())
    }

    async fn update_rows(&self, rows: &[RowUpdate]) -> Result<usize, AdapterError> {
        let mut state = lock(&self.state);
        state.update_calls += 1;
        for update in rows {
            let row = state
                .fixture
                .rows
                .iter_mut()
                .find(|row| row.row_id == update.row_id)
                .ok_or_else(|| AdapterError::Message(format!("no sheet row {}", update.row_id)))?;
            for cell in &update.cells {
                row.cells.insert(cell.column_id.clone(), cell.value.clone());
            }
        }
        Ok(rows.len())
    }

    async fn add_rows(&self, rows: &[Vec<CellUpdate>]) -> Result<usize, AdapterError> {
        let mut state = lock(&self.state);
        state.add_calls += 1;
        for cells in rows {
            let row_id = state.next_row_id.to_string();
            state.next_row_id += 1;
            state.fixture.rows.push(SheetRow {
                row_id,
                cells: cells
                    .iter()
                    .map(|cell| (cell.column_id.clone(), cell.value.clone()))
                    .collect(),
            });
        }
        Ok(rows.len())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketFixture {
    pub fields: Vec<DiscoveredField>,
    #[serde(default)]
    pub tickets: Vec<Ticket>,
    /// Ticket id -> existing comment bodies.
    #[serde(default)]
    pub comments: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub ticket_id: String,
    pub body: String,
    pub group_id: String,
}

#[derive(Debug, Default)]
struct TicketState {
    fixture: TicketFixture,
    posted: Vec<PostedComment>,
}

#[derive(Debug, Default)]
pub struct FixtureTicketStore {
    state: Mutex<TicketState>,
}

impl FixtureTicketStore {
    pub fn new(fixture: TicketFixture) -> Self {
        Self {
            state: Mutex::new(TicketState {
                fixture,
                posted: Vec::new(),
            }),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(read_json_file(path)?))
    }

    pub fn posted(&self) -> Vec<PostedComment> {
        lock(&self.state).posted.clone()
    }
}

#[async_trait]
impl TicketStore for FixtureTicketStore {
    async fn ticket_fields(&self) -> Result<Vec<DiscoveredField>, AdapterError> {
        Ok(lock(&self.state).fixture.fields.clone())
    }

    async fn search_tickets(
        &self,
        _form_id: &str,
        group_id: &str,
    ) -> Result<Vec<Ticket>, AdapterError> {
        Ok(lock(&self.state)
            .fixture
            .tickets
            .iter()
            .filter(|ticket| ticket.group_id.as_deref() == Some(group_id))
            .cloned()
            .collect())
    }

    async fn ticket_status(&self, ticket_id: &str) -> Result<String, AdapterError> {
        lock(&self.state)
            .fixture
            .tickets
            .iter()
            .find(|ticket| ticket.id == ticket_id)
            .map(|ticket| ticket.status.clone())
            .ok_or_else(|| AdapterError::Message(format!("no ticket {ticket_id}")))
    }

    async fn ticket_comments(&self, ticket_id: &str) -> Result<Vec<String>, AdapterError> {
        Ok(lock(&self.state)
            .fixture
            .comments
            .get(ticket_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn post_private_comment(
        &self,
        ticket_id: &str,
        body: &str,
        group_id: &str,
    ) -> Result<(), AdapterError> {
        let mut state = lock(&self.state);
        state
            .fixture
            .comments
            .entry(ticket_id.to_string())
            .or_default()
            .push(body.to_string());
        if let Some(ticket) = state.fixture.tickets.iter_mut().find(|t| t.id == ticket_id) {
            ticket.group_id = Some(group_id.to_string());
        }
        state.posted.push(PostedComment {
            ticket_id: ticket_id.to_string(),
            body: body.to_string(),
            group_id: group_id.to_string(),
        });
        Ok(())
    }
}
