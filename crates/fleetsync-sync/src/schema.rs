//! Per-run schema discovery against the two external systems.

use fleetsync_adapters::{AdapterError, DiscoveredField, SheetStore, TicketStore};
use fleetsync_core::{Schema, SchemaError};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum SchemaLoadError {
    #[error("schema discovery against {system} failed")]
    Discovery {
        system: &'static str,
        #[source]
        source: AdapterError,
    },
    #[error(transparent)]
    Incomplete(#[from] SchemaError),
}

fn build(
    system: &'static str,
    discovered: Result<Vec<DiscoveredField>, AdapterError>,
    required: &[&str],
) -> Result<Schema, SchemaLoadError> {
    let discovered = discovered.map_err(|source| {
        error!(system, error = %source, "schema discovery failed");
        SchemaLoadError::Discovery { system, source }
    })?;
    let schema = Schema::new(
        system,
        discovered.into_iter().map(DiscoveredField::into_field_schema),
    );
    schema.require(required.iter().copied())?;
    info!(system, fields = schema.len(), "loaded schema");
    Ok(schema)
}

/// One column discovery call; every name in `required` must resolve.
pub async fn load_sheet_schema(
    store: &dyn SheetStore,
    required: &[&str],
) -> Result<Schema, SchemaLoadError> {
    build(store.system(), store.columns().await, required)
}

/// One ticket-field discovery call (options arrive inline).
pub async fn load_ticket_schema(
    store: &dyn TicketStore,
    required: &[&str],
) -> Result<Schema, SchemaLoadError> {
    build(store.system(), store.ticket_fields().await, required)
}
