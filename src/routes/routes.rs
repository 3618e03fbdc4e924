//! Defines routes for the metering query surface and sweep trigger.
//!
//! ## Structure
//! - **Ledger endpoints**
//!   - `GET  /records` — usage records (supports uids, run_ids, from_period, to_period)
//!   - `GET  /records/{uid}` — usage records for one bucket
//!
//! - **Run endpoints**
//!   - `GET  /runs` — sweep audit trail (supports ids, trigger, from_time, to_time)
//!   - `GET  /runs/{id}` — a single run
//!
//! - **Sweep endpoint**
//!   - `POST /sweeps` — run one metering sweep now (trigger defaults to "manual")
//!
//! Time parameters are RFC3339; comma-separated lists decompose into set filters.

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    meter_handlers::{get_bucket_records, get_records, get_run, get_runs, post_sweep},
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all metering routes.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // ledger query surface
        .route("/records", get(get_records))
        .route("/records/{uid}", get(get_bucket_records))
        // run audit trail
        .route("/runs", get(get_runs))
        .route("/runs/{id}", get(get_run))
        // manual sweep trigger
        .route("/sweeps", post(post_sweep))
}
