//! Emergency shutdown HTTP surface.
//!
//! `POST /emergency/shutdown` operates outside normal authentication: the
//! Ed25519 signature is the auth. Checks run in order — command type,
//! timestamp window, signature, key authorization — and failures map to
//! 400/403 as documented. A sibling `GET /emergency/test` reports
//! reachability.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use fabric_authority::crypto::verify_signature;
use fabric_contracts::{
    EmergencyCommandType, EmergencyShutdownStatus, RuntimeControl, WASignedCommand,
};
use fabric_lifecycle::ShutdownService;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::service::RuntimeControlService;

const TIMESTAMP_WINDOW_MINUTES: i64 = 5;
const FUTURE_TOLERANCE_MINUTES: i64 = 1;

/// Dependencies of the emergency routes.
#[derive(Clone, Default)]
pub struct EmergencyState {
    pub control: Option<Arc<RuntimeControlService>>,
    pub shutdown: Option<Arc<ShutdownService>>,
    /// Base64 raw Ed25519 public keys allowed to trigger emergency stop.
    pub authorized_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub detail: String,
}

type Rejection = (StatusCode, Json<ErrorDetail>);

fn reject(status: StatusCode, detail: impl Into<String>) -> Rejection {
    let detail = detail.into();
    error!("Emergency shutdown rejected: {}", detail);
    (status, Json(ErrorDetail { detail }))
}

/// Build the emergency router.
pub fn emergency_routes(state: EmergencyState) -> Router {
    Router::new()
        .route("/emergency/shutdown", post(emergency_shutdown))
        .route("/emergency/test", get(emergency_test))
        .with_state(Arc::new(state))
}

fn verify_timestamp(command: &WASignedCommand) -> bool {
    let now = Utc::now();
    if now - command.issued_at > Duration::minutes(TIMESTAMP_WINDOW_MINUTES) {
        warn!("Command too old: issued at {}, now {}", command.issued_at, now);
        return false;
    }
    if command.issued_at > now + Duration::minutes(FUTURE_TOLERANCE_MINUTES) {
        warn!("Command from the future: issued at {}, now {}", command.issued_at, now);
        return false;
    }
    if let Some(expires_at) = command.expires_at {
        if now > expires_at {
            warn!("Command expired at {}", expires_at);
            return false;
        }
    }
    true
}

fn verify_command_signature(command: &WASignedCommand) -> bool {
    let Ok(public_key) = STANDARD.decode(&command.wa_public_key) else {
        return false;
    };
    if public_key.len() != 32 {
        return false;
    }
    verify_signature(&public_key, command.canonical_string().as_bytes(), &command.signature)
}

async fn emergency_shutdown(
    State(state): State<Arc<EmergencyState>>,
    Json(command): Json<WASignedCommand>,
) -> Result<Json<EmergencyShutdownStatus>, Rejection> {
    error!("Emergency shutdown requested by WA {}", command.wa_id);

    if command.command_type != EmergencyCommandType::ShutdownNow {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            format!("Invalid command type: {}", command.command_type.as_str()),
        ));
    }

    if !verify_timestamp(&command) {
        return Err(reject(
            StatusCode::FORBIDDEN,
            "Command timestamp outside acceptable window",
        ));
    }

    if !verify_command_signature(&command) {
        return Err(reject(StatusCode::FORBIDDEN, "Invalid signature"));
    }

    if !state.authorized_keys.contains(&command.wa_public_key) {
        return Err(reject(StatusCode::FORBIDDEN, "Unauthorized public key"));
    }

    info!("Emergency shutdown command verified successfully");

    // Prefer the runtime control service; it re-verifies against its own
    // kill-switch map and records the audit event.
    if let Some(control) = &state.control {
        let status = control.handle_emergency_shutdown(command).await;
        return Ok(Json(status));
    }

    let Some(shutdown) = &state.shutdown else {
        return Err(reject(StatusCode::SERVICE_UNAVAILABLE, "Shutdown service not available"));
    };

    let mut status = EmergencyShutdownStatus::received_at(Utc::now());
    status.command_verified = true;
    status.shutdown_initiated = Some(Utc::now());

    let reason = format!("EMERGENCY: {} (WA: {})", command.reason, command.wa_id);
    shutdown.request_shutdown(&reason);

    status.data_persisted = true;
    status.final_message_sent = true;
    status.shutdown_completed = Some(Utc::now());
    status.exit_code = Some(0);
    error!("Emergency shutdown initiated successfully");
    Ok(Json(status))
}

async fn emergency_test() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": "Emergency endpoint accessible",
        "crypto_available": true,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
