use axum::{
    routing::{get, post},
    Router,
};

use crate::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/status", get(api::status))
        .route("/execute", post(api::execute))
        .route("/execute/:schedule_id", post(api::execute_schedule))
        .route("/remediate", post(api::remediate_batch))
        .route("/remediate/:solution_id", post(api::remediate_solution))
        .route("/oe/discover", post(api::oe_discover))
        .route("/oe/remediate", post(api::oe_remediate_batch))
        .route("/oe/remediate/:service_id", post(api::remediate_oe_service))
        .route("/scheduler/start", post(api::scheduler_start))
        .route("/scheduler/stop", post(api::scheduler_stop))
}
