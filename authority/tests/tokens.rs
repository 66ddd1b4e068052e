//! Token mint/verify and task-signing behavior of the authentication
//! service.

use chrono::Utc;
use fabric_authority::{AuthenticationService, TaskStore, SYSTEM_WA_NAME};
use fabric_contracts::{JwtSubType, Task, WACertificate, WARole};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

async fn test_pool(dir: &tempfile::TempDir) -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("fabric.db"))
        .create_if_missing(true);
    SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap()
}

async fn test_service() -> (AuthenticationService, SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    let service = AuthenticationService::new(pool.clone(), dir.path().join("keys")).await.unwrap();
    (service, pool, dir)
}

fn sample_task(task_id: &str) -> Task {
    Task {
        task_id: task_id.to_string(),
        channel_id: Some("chan-1".to_string()),
        description: "summarize the incident".to_string(),
        status: "pending".to_string(),
        priority: 3,
        context: Some(serde_json::json!({ "origin": "wakeup" })),
        signed_by: None,
        signature: None,
        signed_at: None,
        parent_task_id: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn wa_ids_follow_the_dated_hex_pattern() {
    let (service, _pool, _dir) = test_service().await;
    let now = Utc::now();
    let wa_id = service.generate_wa_id(now).unwrap();

    let expected_prefix = format!("wa-{}-", now.format("%Y-%m-%d"));
    assert!(wa_id.starts_with(&expected_prefix));
    let suffix = &wa_id[expected_prefix.len()..];
    assert_eq!(suffix.len(), 6);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
}

#[tokio::test]
async fn authority_token_round_trips_via_eddsa() {
    let (service, _pool, _dir) = test_service().await;
    let (wa, pkcs8) = service
        .mint_wa("Dr. Reviewer", WARole::Authority, &["approve_deferrals"])
        .await
        .unwrap();

    let token = service.create_authority_token(&wa, &pkcs8).unwrap();
    let context = service.verify_token(&token).await.unwrap();

    assert_eq!(context.wa_id, wa.wa_id);
    assert_eq!(context.role, WARole::Authority);
    assert_eq!(context.sub_type, JwtSubType::Authority);
    assert_eq!(context.scopes, vec!["approve_deferrals".to_string()]);
}

#[tokio::test]
async fn observer_channel_tokens_do_not_expire() {
    let (service, _pool, _dir) = test_service().await;
    let observer = service
        .get_or_create_adapter_observer("discord_default", "discord_observer")
        .await
        .unwrap();
    assert_eq!(observer.role, WARole::Observer);
    assert!(observer.auto_minted);

    let token = service
        .create_channel_token(&observer.wa_id, "discord_default", 0)
        .await
        .unwrap();
    let context = service.verify_token(&token).await.unwrap();
    assert_eq!(context.sub_type, JwtSubType::Anon);
    assert!(context.expires_at.is_none());

    // A second lookup reuses the same certificate.
    let again = service
        .get_or_create_adapter_observer("discord_default", "discord_observer")
        .await
        .unwrap();
    assert_eq!(again.wa_id, observer.wa_id);
}

#[tokio::test]
async fn non_observer_channel_tokens_carry_channel_and_expiry() {
    let (service, _pool, _dir) = test_service().await;
    let (wa, _) = service.mint_wa("Operator", WARole::Authority, &["read"]).await.unwrap();

    let token = service.create_channel_token(&wa.wa_id, "api_main", 3600).await.unwrap();
    let context = service.verify_token(&token).await.unwrap();
    assert_eq!(context.channel_id.as_deref(), Some("api_main"));
    assert!(context.expires_at.is_some());
}

fn seed_root() -> WACertificate {
    let (_key, public) = fabric_authority::crypto::generate_keypair().unwrap();
    WACertificate {
        wa_id: "wa-2026-01-01-AB12CD".to_string(),
        name: "Root Holder".to_string(),
        role: WARole::Root,
        pubkey: fabric_authority::crypto::encode_public_key(&public),
        jwt_kid: "wa-jwt-ab12cd".to_string(),
        password_hash: None,
        api_key_hash: None,
        oauth_provider: None,
        oauth_external_id: None,
        auto_minted: false,
        parent_wa_id: None,
        parent_signature: None,
        scopes: vec!["*".to_string()],
        adapter_id: None,
        adapter_name: None,
        created_at: Utc::now(),
        last_auth: None,
        active: true,
    }
}

#[tokio::test]
async fn bootstrap_mints_the_system_authority_under_root() {
    let (service, _pool, dir) = test_service().await;

    // Seed the root certificate on disk the way deployment does; the empty
    // store forces the loader path.
    let key_dir = dir.path().join("keys");
    let root = seed_root();
    std::fs::write(key_dir.join("root_pub.json"), serde_json::to_string(&root).unwrap())
        .unwrap();

    service.bootstrap_if_needed().await.unwrap();

    let loaded_root = service.get_wa(&root.wa_id).await.unwrap().unwrap();
    assert_eq!(loaded_root.role, WARole::Root);

    let system_id = service.get_system_wa_id().await.unwrap().unwrap();
    let system = service.get_wa(&system_id).await.unwrap().unwrap();
    assert_eq!(system.name, SYSTEM_WA_NAME);
    assert_eq!(system.role, WARole::Authority);
    assert_eq!(system.parent_wa_id.as_deref(), Some(root.wa_id.as_str()));
    assert!(system.parent_signature.is_some());
    assert!(system.has_scope("system.shutdown"));
    assert!(key_dir.join("system_wa.key").exists());

    // Bootstrap is idempotent.
    service.bootstrap_if_needed().await.unwrap();
    let authorities: Vec<WACertificate> = service
        .list_was(true)
        .await
        .unwrap()
        .into_iter()
        .filter(|wa| wa.name == SYSTEM_WA_NAME)
        .collect();
    assert_eq!(authorities.len(), 1);
}

#[tokio::test]
async fn task_signatures_verify_only_for_identical_tasks() {
    let (service, pool, _dir) = test_service().await;
    let tasks = TaskStore::new(pool).await.unwrap();

    let (_root, _) = service.mint_wa("Root Holder", WARole::Root, &["*"]).await.unwrap();
    service.bootstrap_if_needed().await.unwrap();
    let system_id = service.get_system_wa_id().await.unwrap().unwrap();

    let mut task = sample_task("task-sign-1");
    tasks.insert(&task).await.unwrap();

    let (signature, signed_at) = service.sign_task(&task, &system_id).await.unwrap();
    task.signed_by = Some(system_id.clone());
    task.signature = Some(signature);
    task.signed_at = Some(signed_at);

    assert!(service.verify_task_signature(&task).await);

    // Any field drift breaks the canonical form.
    let mut altered = task.clone();
    altered.description = "summarize the incident quietly".to_string();
    assert!(!service.verify_task_signature(&altered).await);

    let mut altered = task.clone();
    altered.priority = 9;
    assert!(!service.verify_task_signature(&altered).await);

    // Missing signature fields short-circuit to false.
    let mut unsigned = task.clone();
    unsigned.signature = None;
    assert!(!service.verify_task_signature(&unsigned).await);
}

#[tokio::test]
async fn signing_requires_a_locally_held_key() {
    let (service, _pool, _dir) = test_service().await;
    let (wa, _) = service.mint_wa("External WA", WARole::Authority, &["read"]).await.unwrap();

    let task = sample_task("task-sign-2");
    let err = service.sign_task(&task, &wa.wa_id).await.unwrap_err();
    assert!(err.to_string().contains("not implemented"));
}

#[tokio::test]
async fn oauth_lookup_finds_linked_observers() {
    let (service, _pool, _dir) = test_service().await;
    let (mut wa, _) = service.mint_wa("OAuth User", WARole::Observer, &["read"]).await.unwrap();

    // Simulate the OAuth linkage deployment performs.
    sqlx::query("UPDATE wa_cert SET oauth_provider = ?, oauth_external_id = ? WHERE wa_id = ?")
        .bind("google")
        .bind("uid-123")
        .bind(&wa.wa_id)
        .execute(service.store().pool())
        .await
        .unwrap();
    wa.oauth_provider = Some("google".to_string());

    let found = service.get_wa_by_oauth("google", "uid-123").await.unwrap().unwrap();
    assert_eq!(found.wa_id, wa.wa_id);
    assert!(service.get_wa_by_oauth("google", "uid-999").await.unwrap().is_none());

    let token = service.create_gateway_token(&wa, 8).unwrap();
    let context = service.verify_token(&token).await.unwrap();
    assert_eq!(context.sub_type, JwtSubType::Oauth);
}
