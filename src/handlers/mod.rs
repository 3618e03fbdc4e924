//! HTTP handlers and the shared state they all receive.

pub mod health_handlers;
pub mod meter_handlers;

use crate::services::ledger_service::LedgerService;
use crate::services::meter_service::{FileCatalog, MeterService, S3UsageSource};
use crate::services::run_service::RunService;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub ledger: LedgerService,
    pub runs: RunService,
    pub meter: MeterService<S3UsageSource>,
    pub catalog: FileCatalog,
}
