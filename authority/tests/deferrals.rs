//! Deferral lifecycle and authorization checks for the wise authority
//! service.

use chrono::{Duration, Utc};
use fabric_authority::{AuthenticationService, TaskStore, WiseAuthorityService};
use fabric_contracts::{
    DeferralApprovalContext, DeferralRequest, DeferralResponse, GuidanceContext, Task,
    WARole, WiseAuthority,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::HashMap;
use std::sync::Arc;

struct Fixture {
    auth: Arc<AuthenticationService>,
    wise: WiseAuthorityService,
    tasks: TaskStore,
    _dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("fabric.db"))
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();

    let auth =
        Arc::new(AuthenticationService::new(pool.clone(), dir.path().join("keys")).await.unwrap());
    let tasks = TaskStore::new(pool.clone()).await.unwrap();
    let wise = WiseAuthorityService::new(pool, Arc::clone(&auth));
    Fixture { auth, wise, tasks, _dir: dir }
}

fn task(task_id: &str, priority: i64) -> Task {
    Task {
        task_id: task_id.to_string(),
        channel_id: Some("chan-9".to_string()),
        description: "decide on the escalation".to_string(),
        status: "pending".to_string(),
        priority,
        context: Some(serde_json::json!({ "origin": "observer" })),
        signed_by: None,
        signature: None,
        signed_at: None,
        parent_task_id: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn deferral(task_id: &str) -> DeferralRequest {
    DeferralRequest {
        task_id: task_id.to_string(),
        thought_id: "thought-1".to_string(),
        reason: "needs human judgment".to_string(),
        defer_until: Utc::now() + Duration::hours(1),
        context: HashMap::new(),
    }
}

#[tokio::test]
async fn send_deferral_embeds_a_record_and_flips_status() {
    let f = fixture().await;
    f.tasks.insert(&task("task-a", 3)).await.unwrap();

    let deferral_id = f.wise.send_deferral(deferral("task-a")).await.unwrap();
    assert!(deferral_id.starts_with("defer_task-a_"));

    let row = f.tasks.get("task-a").await.unwrap().unwrap();
    assert_eq!(row.status, "deferred");
    let context = row.context.unwrap();
    assert_eq!(context["deferral"]["deferral_id"], deferral_id);
    assert_eq!(context["deferral"]["reason"], "needs human judgment");
    assert_eq!(context["deferral"]["requires_wa_approval"], true);
    // The original context survives the embed.
    assert_eq!(context["origin"], "observer");
}

#[tokio::test]
async fn send_deferral_for_a_missing_task_fails() {
    let f = fixture().await;
    assert!(f.wise.send_deferral(deferral("no-such-task")).await.is_err());
}

#[tokio::test]
async fn pending_deferrals_report_mapped_priorities() {
    let f = fixture().await;
    f.tasks.insert(&task("task-low", 0)).await.unwrap();
    f.tasks.insert(&task("task-mid", 3)).await.unwrap();
    f.tasks.insert(&task("task-high", 7)).await.unwrap();
    for id in ["task-low", "task-mid", "task-high"] {
        f.wise.send_deferral(deferral(id)).await.unwrap();
    }

    let pending = f.wise.get_pending_deferrals(None).await.unwrap();
    assert_eq!(pending.len(), 3);
    let by_task: HashMap<_, _> =
        pending.iter().map(|p| (p.task_id.clone(), p.priority.clone())).collect();
    assert_eq!(by_task["task-low"], "low");
    assert_eq!(by_task["task-mid"], "medium");
    assert_eq!(by_task["task-high"], "high");
}

#[tokio::test]
async fn resolve_updates_exactly_one_row_and_attaches_guidance() {
    let f = fixture().await;
    f.tasks.insert(&task("task-a", 3)).await.unwrap();
    f.tasks.insert(&task("task-b", 3)).await.unwrap();
    let deferral_id = f.wise.send_deferral(deferral("task-a")).await.unwrap();
    f.wise.send_deferral(deferral("task-b")).await.unwrap();

    let resolved = f
        .wise
        .resolve_deferral(
            &deferral_id,
            DeferralResponse {
                approved: true,
                reason: Some("proceed, but log everything".to_string()),
                wa_id: "wa-2026-01-01-AB12CD".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(resolved);

    let row = f.tasks.get("task-a").await.unwrap().unwrap();
    assert_eq!(row.status, "pending");
    let context = row.context.unwrap();
    assert_eq!(context["deferral"]["resolution"]["approved"], true);
    assert_eq!(context["wa_guidance"], "proceed, but log everything");

    // The sibling deferral is untouched.
    let sibling = f.tasks.get("task-b").await.unwrap().unwrap();
    assert_eq!(sibling.status, "deferred");

    // Guidance is now visible through fetch_guidance.
    let guidance = f
        .wise
        .fetch_guidance(GuidanceContext {
            thought_id: "thought-1".to_string(),
            task_id: "task-a".to_string(),
            question: "what now?".to_string(),
            domain_context: HashMap::new(),
        })
        .await
        .unwrap();
    assert_eq!(guidance.as_deref(), Some("proceed, but log everything"));

    // A second resolve finds nothing deferred: zero rows updated.
    let again = f
        .wise
        .resolve_deferral(
            &deferral_id,
            DeferralResponse { approved: false, reason: None, wa_id: "wa-x".to_string() },
        )
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test]
async fn rejection_does_not_attach_guidance() {
    let f = fixture().await;
    f.tasks.insert(&task("task-a", 3)).await.unwrap();
    let deferral_id = f.wise.send_deferral(deferral("task-a")).await.unwrap();

    let resolved = f
        .wise
        .resolve_deferral(
            &deferral_id,
            DeferralResponse {
                approved: false,
                reason: Some("too risky".to_string()),
                wa_id: "wa-x".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(resolved);

    let row = f.tasks.get("task-a").await.unwrap().unwrap();
    assert_eq!(row.status, "pending");
    let context = row.context.unwrap();
    assert_eq!(context["deferral"]["resolution"]["approved"], false);
    assert!(context.get("wa_guidance").is_none());
}

#[tokio::test]
async fn deferral_ids_with_underscored_task_ids_still_resolve() {
    let f = fixture().await;
    f.tasks.insert(&task("task_with_underscores", 1)).await.unwrap();
    let deferral_id = f.wise.send_deferral(deferral("task_with_underscores")).await.unwrap();

    let resolved = f
        .wise
        .resolve_deferral(
            &deferral_id,
            DeferralResponse { approved: true, reason: None, wa_id: "wa-x".to_string() },
        )
        .await
        .unwrap();
    assert!(resolved);
    assert_eq!(f.tasks.get("task_with_underscores").await.unwrap().unwrap().status, "pending");
}

#[tokio::test]
async fn unknown_deferral_resolves_to_false() {
    let f = fixture().await;
    let resolved = f
        .wise
        .resolve_deferral(
            "defer_ghost_123",
            DeferralResponse { approved: true, reason: None, wa_id: "wa-x".to_string() },
        )
        .await
        .unwrap();
    assert!(!resolved);
}

#[tokio::test]
async fn authorization_follows_role_boundaries() {
    let f = fixture().await;
    let (root, _) = f.auth.mint_wa("Root", WARole::Root, &["*"]).await.unwrap();
    let (authority, _) =
        f.auth.mint_wa("Authority", WARole::Authority, &["approve_deferrals"]).await.unwrap();
    let (observer, _) = f.auth.mint_wa("Observer", WARole::Observer, &["read"]).await.unwrap();

    assert!(f.wise.check_authorization(&root.wa_id, "mint_wa", None).await);
    assert!(f.wise.check_authorization(&authority.wa_id, "approve_deferrals", None).await);
    assert!(!f.wise.check_authorization(&authority.wa_id, "mint_wa", None).await);
    assert!(f.wise.check_authorization(&observer.wa_id, "read", None).await);
    assert!(!f.wise.check_authorization(&observer.wa_id, "approve_deferrals", None).await);
    assert!(!f.wise.check_authorization("wa-unknown", "read", None).await);

    // Inactive WAs are rejected outright.
    f.auth.revoke_wa(&root.wa_id, "rotated").await.unwrap();
    assert!(!f.wise.check_authorization(&root.wa_id, "read", None).await);
}

#[tokio::test]
async fn request_approval_auto_approves_or_defers() {
    let f = fixture().await;
    let (root, _) = f.auth.mint_wa("Root", WARole::Root, &["*"]).await.unwrap();
    let (observer, _) = f.auth.mint_wa("Observer", WARole::Observer, &["read"]).await.unwrap();
    f.tasks.insert(&task("task-approval", 2)).await.unwrap();

    let approved = f
        .wise
        .request_approval(
            "shutdown",
            DeferralApprovalContext {
                task_id: "task-approval".to_string(),
                thought_id: "thought-9".to_string(),
                requester_id: root.wa_id.clone(),
                action_params: HashMap::new(),
                metadata: HashMap::new(),
            },
        )
        .await
        .unwrap();
    assert!(approved);

    let approved = f
        .wise
        .request_approval(
            "shutdown",
            DeferralApprovalContext {
                task_id: "task-approval".to_string(),
                thought_id: "thought-9".to_string(),
                requester_id: observer.wa_id.clone(),
                action_params: HashMap::from([("scope".to_string(), "full".to_string())]),
                metadata: HashMap::new(),
            },
        )
        .await
        .unwrap();
    assert!(!approved);

    let row = f.tasks.get("task-approval").await.unwrap().unwrap();
    assert_eq!(row.status, "deferred");
    let context = row.context.unwrap();
    assert_eq!(context["deferral"]["context"]["action"], "shutdown");
    assert_eq!(context["deferral"]["context"]["param_scope"], "full");
}
