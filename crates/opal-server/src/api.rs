//! Admin HTTP API.
//!
//! Served on the API listener when `http_api_enable` or zone mode is on:
//!
//! - `GET /getNewZone` — provision a zone keypair, return id + public key
//! - `GET /resetKeyStorage` — drop the keystore cache
//! - `GET /healthz` — liveness

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::json;
use tower_http::trace::TraceLayer;

use opal_keystore::{FsKeyStore, KeyKind};

#[derive(Clone)]
pub struct ApiState {
    pub keystore: Arc<FsKeyStore>,
    pub zone_mode: bool,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/getNewZone", get(get_new_zone))
        .route("/resetKeyStorage", get(reset_key_storage))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "service": "opal-server" }))
}

async fn get_new_zone(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !state.zone_mode {
        return Err(StatusCode::NOT_FOUND);
    }
    let zone_id = opal_crypto::zone::generate_zone_id();
    state
        .keystore
        .generate_key_pair(KeyKind::Zone, &zone_id, false)
        .map_err(|e| {
            tracing::error!(error = %e, "failed to generate zone keypair");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    let public = state
        .keystore
        .get_public_key(KeyKind::Zone, &zone_id)
        .map_err(|e| {
            tracing::error!(error = %e, "zone public key missing after generation");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(json!({
        "id": String::from_utf8_lossy(&zone_id),
        "public_key": STANDARD.encode(public),
    })))
}

async fn reset_key_storage(State(state): State<ApiState>) -> Json<serde_json::Value> {
    state.keystore.reset_cache();
    tracing::info!("keystore cache reset via API");
    Json(json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn state(zone_mode: bool) -> (tempfile::TempDir, ApiState) {
        let dir = tempfile::tempdir().unwrap();
        let keystore =
            Arc::new(FsKeyStore::new(dir.path(), Zeroizing::new([5u8; 32]), 0).unwrap());
        (dir, ApiState { keystore, zone_mode })
    }

    #[tokio::test]
    async fn new_zone_is_persisted() {
        let (_dir, state) = state(true);
        let response = get_new_zone(State(state.clone())).await.unwrap();
        let id = response.0["id"].as_str().unwrap().as_bytes().to_vec();
        assert!(opal_crypto::zone::is_valid_zone_id(&id));
        assert!(state.keystore.get_private_key(KeyKind::Zone, &id).is_ok());

        let public = STANDARD
            .decode(response.0["public_key"].as_str().unwrap())
            .unwrap();
        assert_eq!(public.len(), 32);
    }

    #[tokio::test]
    async fn new_zone_requires_zone_mode() {
        let (_dir, state) = state(false);
        assert_eq!(
            get_new_zone(State(state)).await.unwrap_err(),
            StatusCode::NOT_FOUND
        );
    }
}
