//! spore-api — REST API for a Spore pool.
//!
//! Exposes a [`Cluster`] over HTTP. Every response uses the envelope
//! `{ "success": bool, "data"?: ..., "error"?: string }`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/pool` | Population of each collection |
//! | POST | `/api/v1/pool/refresh` | Run a reconciliation pass now |
//! | GET | `/api/v1/instances` | List known instances |
//! | GET | `/api/v1/instances/{id}` | Get one instance |
//! | POST | `/api/v1/instances/acquire` | Reserve an instance by image |
//! | POST | `/api/v1/instances/{id}/stop` | Release and stop a reserved instance |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use spore_pool::Cluster;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub cluster: Arc<Cluster>,
}

/// Build the API router.
pub fn build_router(cluster: Arc<Cluster>) -> Router {
    let api_state = ApiState { cluster };

    let api_routes = Router::new()
        .route("/pool", get(handlers::pool_stats))
        .route("/pool/refresh", post(handlers::refresh_pool))
        .route("/instances", get(handlers::list_instances))
        .route("/instances/acquire", post(handlers::acquire_instance))
        .route("/instances/{id}", get(handlers::get_instance))
        .route("/instances/{id}/stop", post(handlers::stop_instance))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
