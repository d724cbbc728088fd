//! Route handlers
//!
//! The service talks to sled synchronously, so every call runs on tokio's
//! blocking pool through [`blocking`] instead of on a runtime worker.
use super::{AppState, error::AppError, extract::CurrentUser};
use crate::catalog::Record;
use crate::exchange::{Exchange, ExchangeId, RecordId, UserId};
use crate::machine::ReviewSubmission;
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header::ETAG},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreateExchangeRequest {
    pub requested_record: RecordId,
    pub offered_records: Vec<RecordId>,
}

/// Wire representation of an exchange.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExchangeView {
    pub id: ExchangeId,
    pub initiator_user: UserId,
    pub receiver_user: UserId,
    pub requested_record: RecordId,
    pub offered_records: Vec<RecordId>,
    pub records_requested_by_receiver: Vec<RecordId>,
    pub state: String,
    pub next_user_to_review: Option<UserId>,
    pub completed: bool,
    pub version: u64,
    pub creation_datetime: DateTime<Utc>,
    pub last_modification_datetime: DateTime<Utc>,
    pub completed_datetime: Option<DateTime<Utc>>,
}

impl From<&Exchange> for ExchangeView {
    fn from(exchange: &Exchange) -> Self {
        Self {
            id: exchange.id().clone(),
            initiator_user: exchange.initiator_user().clone(),
            receiver_user: exchange.receiver_user().clone(),
            requested_record: exchange.requested_record().clone(),
            offered_records: exchange.offered_records().to_vec(),
            records_requested_by_receiver: exchange.records_requested_by_receiver().to_vec(),
            state: exchange.state().label().to_owned(),
            next_user_to_review: exchange.next_user_to_review().cloned(),
            completed: exchange.is_completed(),
            version: exchange.version(),
            creation_datetime: exchange.creation_datetime().to_datetime_utc(),
            last_modification_datetime: exchange.last_modification_datetime().to_datetime_utc(),
            completed_datetime: exchange.completed_datetime().map(|t| t.to_datetime_utc()),
        }
    }
}

fn views(exchanges: &[Exchange]) -> Vec<ExchangeView> {
    exchanges.iter().map(ExchangeView::from).collect()
}

/// Run a service call on the blocking pool. A panicking call becomes a 500.
pub async fn blocking<T, F>(call: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(call)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(outcome?)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn list_exchanges(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<ExchangeView>>, AppError> {
    let exchanges = blocking(move || state.service.list_exchanges(&user.id)).await?;
    Ok(Json(views(&exchanges)))
}

pub async fn exchange_history(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<ExchangeView>>, AppError> {
    let exchanges = blocking(move || state.service.exchange_history(&user.id)).await?;
    Ok(Json(views(&exchanges)))
}

/// Single exchange, tagged with the hash of its stored form.
pub async fn get_exchange(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<ExchangeId>,
) -> Result<(HeaderMap, Json<ExchangeView>), AppError> {
    let exchange = blocking(move || state.service.get_exchange(&id, &user.id)).await?;

    let (hash, _) = exchange.serialize_with_hash()?;
    let mut headers = HeaderMap::new();
    headers.insert(
        ETAG,
        HeaderValue::from_str(&format!("\"{hash}\"")).map_err(anyhow::Error::from)?,
    );

    Ok((headers, Json(ExchangeView::from(&exchange))))
}

pub async fn create_exchange(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<CreateExchangeRequest>,
) -> Result<(StatusCode, Json<ExchangeView>), AppError> {
    let exchange = blocking(move || {
        state.service.create_exchange(
            &user.id,
            &request.requested_record,
            &request.offered_records,
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(ExchangeView::from(&exchange))))
}

pub async fn submit_review(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<ExchangeId>,
    Json(review): Json<ReviewSubmission>,
) -> Result<Json<ExchangeView>, AppError> {
    let exchange = blocking(move || state.service.submit_review(&id, &user.id, &review)).await?;
    Ok(Json(ExchangeView::from(&exchange)))
}

pub async fn switch_reviewer(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<ExchangeId>,
) -> Result<Json<ExchangeView>, AppError> {
    let exchange = blocking(move || state.service.switch_reviewer(&id, &user.id)).await?;
    Ok(Json(ExchangeView::from(&exchange)))
}

pub async fn finalize_exchange(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<ExchangeId>,
) -> Result<Json<ExchangeView>, AppError> {
    let exchange = blocking(move || state.service.finalize_exchange(&id, &user.id)).await?;
    Ok(Json(ExchangeView::from(&exchange)))
}

pub async fn cancel_exchange(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<ExchangeId>,
) -> Result<Json<ExchangeView>, AppError> {
    let exchange = blocking(move || state.service.cancel_exchange(&id, &user.id)).await?;
    Ok(Json(ExchangeView::from(&exchange)))
}

pub async fn candidate_records(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<ExchangeId>,
) -> Result<Json<Vec<Record>>, AppError> {
    let records = blocking(move || state.service.candidate_records(&id, &user.id)).await?;
    Ok(Json(records))
}
