//! Per-chain pipeline progress: sync worker leases and the processing
//! checkpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

use kyomei_store::{ProcessWorkerStore, SyncWorkerStore};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(status))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncWorkerView {
    worker_id: i32,
    range_start: String,
    range_end: Option<String>,
    current_block: String,
    status: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainStatus {
    chain_id: u64,
    sync_workers: Vec<SyncWorkerView>,
    processed_block: Option<String>,
    events_processed: Option<String>,
    process_status: Option<String>,
}

async fn status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let chain_ids: Vec<(i64,)> = sqlx::query_as(&format!(
        "SELECT DISTINCT chain_id FROM {}.sync_workers ORDER BY chain_id",
        state.schemas.sync
    ))
    .fetch_all(&state.pool)
    .await
    .map_err(internal)?;

    let sync_workers = SyncWorkerStore::new(state.pool.clone(), &state.schemas.sync);
    let process_workers = ProcessWorkerStore::new(state.pool.clone(), &state.schemas.app);

    let mut chains = Vec::with_capacity(chain_ids.len());
    for (chain_id,) in chain_ids {
        let chain_id = chain_id as u64;
        let workers = sync_workers.list(chain_id).await.map_err(internal)?;
        let processor = process_workers.get(chain_id).await.map_err(internal)?;

        chains.push(ChainStatus {
            chain_id,
            sync_workers: workers
                .into_iter()
                .map(|w| SyncWorkerView {
                    worker_id: w.worker_id,
                    range_start: w.range_start.to_string(),
                    range_end: w.range_end.map(|b| b.to_string()),
                    current_block: w.current_block.to_string(),
                    status: w.status.to_string(),
                })
                .collect(),
            processed_block: processor.as_ref().map(|p| p.current_block.to_string()),
            events_processed: processor.as_ref().map(|p| p.events_processed.to_string()),
            process_status: processor.as_ref().map(|p| p.status.to_string()),
        });
    }

    Ok(Json(json!({ "chains": chains })))
}

fn internal(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
