//! HTTP-level behavior of the emergency shutdown endpoint.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use fabric_authority::crypto::{generate_keypair, sign_data};
use fabric_contracts::{EmergencyCommandType, WASignedCommand};
use fabric_control::{emergency_routes, EmergencyState};
use fabric_lifecycle::ShutdownService;
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

struct Harness {
    shutdown: Arc<ShutdownService>,
    state: EmergencyState,
    pkcs8: Vec<u8>,
    public_b64: String,
}

fn harness() -> Harness {
    let shutdown = Arc::new(ShutdownService::new());
    let (pkcs8, public) = generate_keypair().unwrap();
    let public_b64 = STANDARD.encode(&public);
    let state = EmergencyState {
        control: None,
        shutdown: Some(Arc::clone(&shutdown)),
        authorized_keys: vec![public_b64.clone()],
    };
    Harness { shutdown, state, pkcs8, public_b64 }
}

fn command(h: &Harness) -> WASignedCommand {
    let mut command = WASignedCommand {
        command_id: "cmd-9".to_string(),
        command_type: EmergencyCommandType::ShutdownNow,
        wa_id: "wa-2026-02-02-C0FFEE".to_string(),
        wa_public_key: h.public_b64.clone(),
        issued_at: Utc::now(),
        expires_at: None,
        reason: "containment".to_string(),
        target_agent_id: None,
        target_tree_path: None,
        signature: String::new(),
    };
    command.signature = sign_data(&h.pkcs8, command.canonical_string().as_bytes()).unwrap();
    command
}

async fn post_command(
    state: EmergencyState,
    command: &WASignedCommand,
) -> (StatusCode, serde_json::Value) {
    let app = emergency_routes(state);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/emergency/shutdown")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(command).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::json!({}));
    (status, json)
}

#[tokio::test]
async fn valid_command_initiates_shutdown() {
    let h = harness();
    let cmd = command(&h);

    let (status, body) = post_command(h.state.clone(), &cmd).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["command_verified"], true);
    assert_eq!(body["exit_code"], 0);
    assert!(h.shutdown.is_shutdown_requested());
}

#[tokio::test]
async fn corrupted_signature_is_403_and_no_shutdown() {
    let h = harness();
    let mut cmd = command(&h);
    // Flip the last character of the base64 signature.
    let mut sig = cmd.signature.clone();
    let last = sig.pop().unwrap();
    sig.push(if last == 'A' { 'B' } else { 'A' });
    cmd.signature = sig;

    let (status, body) = post_command(h.state.clone(), &cmd).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["detail"].as_str().unwrap().contains("Invalid signature"));
    assert!(!h.shutdown.is_shutdown_requested());
}

#[tokio::test]
async fn wrong_command_type_is_400() {
    let h = harness();
    let mut cmd = command(&h);
    cmd.command_type = EmergencyCommandType::FreezeAll;
    cmd.signature = sign_data(&h.pkcs8, cmd.canonical_string().as_bytes()).unwrap();

    let (status, body) = post_command(h.state.clone(), &cmd).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("Invalid command type"));
    assert!(!h.shutdown.is_shutdown_requested());
}

#[tokio::test]
async fn stale_timestamp_is_403() {
    let h = harness();
    let mut cmd = command(&h);
    cmd.issued_at = Utc::now() - Duration::minutes(10);
    cmd.signature = sign_data(&h.pkcs8, cmd.canonical_string().as_bytes()).unwrap();

    let (status, body) = post_command(h.state.clone(), &cmd).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["detail"].as_str().unwrap().contains("timestamp"));
}

#[tokio::test]
async fn future_timestamp_beyond_tolerance_is_403() {
    let h = harness();
    let mut cmd = command(&h);
    cmd.issued_at = Utc::now() + Duration::minutes(5);
    cmd.signature = sign_data(&h.pkcs8, cmd.canonical_string().as_bytes()).unwrap();

    let (status, _) = post_command(h.state.clone(), &cmd).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unauthorized_key_is_403() {
    let h = harness();
    // A correctly signed command from a key outside the authorized set.
    let (other_pkcs8, other_public) = generate_keypair().unwrap();
    let mut cmd = command(&h);
    cmd.wa_public_key = STANDARD.encode(&other_public);
    cmd.signature = sign_data(&other_pkcs8, cmd.canonical_string().as_bytes()).unwrap();

    let (status, body) = post_command(h.state.clone(), &cmd).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["detail"].as_str().unwrap().contains("Unauthorized"));
    assert!(!h.shutdown.is_shutdown_requested());
}

#[tokio::test]
async fn missing_shutdown_service_is_503() {
    let h = harness();
    let cmd = command(&h);
    let state = EmergencyState {
        control: None,
        shutdown: None,
        authorized_keys: h.state.authorized_keys.clone(),
    };

    let (status, body) = post_command(state, &cmd).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["detail"].as_str().unwrap().contains("Shutdown service"));
}

#[tokio::test]
async fn test_endpoint_reports_reachability() {
    let h = harness();
    let app = emergency_routes(h.state.clone());
    let response = app
        .oneshot(Request::builder().uri("/emergency/test").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["crypto_available"], true);
}
