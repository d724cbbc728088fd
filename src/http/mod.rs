//! REST surface over the exchange service
pub mod error;
pub mod extract;
pub mod handlers;

use crate::auth::IdentityProvider;
use crate::service::ExchangeService;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ExchangeService>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(service: Arc<ExchangeService>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { service, identity }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/exchanges",
            get(handlers::list_exchanges).post(handlers::create_exchange),
        )
        .route("/exchanges/history", get(handlers::exchange_history))
        .route(
            "/exchanges/:id",
            get(handlers::get_exchange)
                .put(handlers::submit_review)
                .delete(handlers::cancel_exchange),
        )
        .route(
            "/exchanges/:id/candidates",
            get(handlers::candidate_records),
        )
        .route(
            "/exchanges/:id/switch-reviewer",
            post(handlers::switch_reviewer),
        )
        .route("/exchanges/:id/finalize", post(handlers::finalize_exchange))
        .with_state(state)
}
