//! Service layer: the usage ledger, the run audit trail, and the sweep
//! driver that ties them to a usage source.

pub mod ledger_service;
pub mod meter_service;
pub mod run_service;
