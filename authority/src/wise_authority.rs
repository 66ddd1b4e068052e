//! Wise Authority service: authorization checks, the deferral queue, and
//! guidance pass-through.
//!
//! Deferrals are persisted on task rows: the row's status flips to
//! `deferred` and a `deferral` record is embedded in its context JSON.
//! Resolution rewrites the status to `pending` and attaches any WA guidance.

use crate::auth_service::AuthenticationService;
use crate::store::db_err;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fabric_contracts::{
    AuthorityError, DeferralApprovalContext, DeferralRequest, DeferralResponse, GuidanceContext,
    PendingDeferral, Service, WARole, WiseAuthority,
};
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Actions an AUTHORITY role may not perform.
const AUTHORITY_DENIED: [&str; 3] = ["mint_wa", "create_wa", "bootstrap_root"];
/// Actions an OBSERVER role may perform.
const OBSERVER_ALLOWED: [&str; 4] = ["read", "send_message", "observe", "get_status"];

/// Authorization, deferrals, and guidance on top of the authentication
/// service. Registered as a `WISE_AUTHORITY` provider.
pub struct WiseAuthorityService {
    pool: SqlitePool,
    auth: Arc<AuthenticationService>,
    started: AtomicBool,
}

impl WiseAuthorityService {
    pub fn new(pool: SqlitePool, auth: Arc<AuthenticationService>) -> Self {
        Self { pool, auth, started: AtomicBool::new(false) }
    }

    /// Role-based authorization: ROOT may do anything, AUTHORITY anything
    /// except minting, OBSERVER only read/send/observe/status. Inactive WAs
    /// are rejected by the store lookup.
    pub async fn check_authorization(
        &self,
        wa_id: &str,
        action: &str,
        _resource: Option<&str>,
    ) -> bool {
        let Ok(Some(wa)) = self.auth.get_wa(wa_id).await else {
            return false;
        };
        match wa.role {
            WARole::Root => true,
            WARole::Authority => !AUTHORITY_DENIED.contains(&action),
            WARole::Observer => OBSERVER_ALLOWED.contains(&action),
        }
    }

    /// Request approval for an action. Auto-approves when the requester is
    /// already authorized; otherwise creates a 24-hour deferral and returns
    /// false.
    pub async fn request_approval(
        &self,
        action: &str,
        context: DeferralApprovalContext,
    ) -> Result<bool, AuthorityError> {
        let resource = context.metadata.get("resource").map(String::as_str);
        if self.check_authorization(&context.requester_id, action, resource).await {
            info!("Action {} auto-approved for {}", action, context.requester_id);
            return Ok(true);
        }

        let mut deferral_context = std::collections::HashMap::new();
        deferral_context.insert("action".to_string(), action.to_string());
        deferral_context.insert("requester".to_string(), context.requester_id.clone());
        for (key, value) in &context.action_params {
            deferral_context.insert(format!("param_{}", key), value.clone());
        }

        let deferral_id = self
            .send_deferral(DeferralRequest {
                task_id: context.task_id,
                thought_id: context.thought_id,
                reason: format!("Action '{}' requires human approval", action),
                defer_until: Utc::now() + Duration::hours(24),
                context: deferral_context,
            })
            .await?;
        info!("Created deferral {} for action {}", deferral_id, action);
        Ok(false)
    }

    /// Deferred tasks awaiting WA resolution, most recently updated first.
    pub async fn get_pending_deferrals(
        &self,
        _wa_id: Option<&str>,
    ) -> Result<Vec<PendingDeferral>, AuthorityError> {
        let rows = sqlx::query(
            "SELECT task_id, channel_id, description, priority, created_at, updated_at, \
             context_json FROM tasks WHERE status = 'deferred' ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id: String = row.try_get("task_id").map_err(db_err)?;
            let channel_id: Option<String> = row.try_get("channel_id").map_err(db_err)?;
            let description: String = row.try_get("description").map_err(db_err)?;
            let priority: i64 = row.try_get("priority").map_err(db_err)?;
            let updated_at: String = row.try_get("updated_at").map_err(db_err)?;
            let context_json: Option<String> = row.try_get("context_json").map_err(db_err)?;

            let context: serde_json::Value = context_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();
            let deferral = &context["deferral"];

            let reason: String = deferral["reason"]
                .as_str()
                .unwrap_or(&description)
                .chars()
                .take(200)
                .collect();

            result.push(PendingDeferral {
                deferral_id: deferral["deferral_id"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| format!("defer_{}", task_id)),
                created_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                deferred_by: "fabric_agent".to_string(),
                task_id,
                thought_id: deferral["thought_id"].as_str().unwrap_or_default().to_string(),
                reason,
                channel_id,
                user_id: deferral["context"]["user_id"].as_str().map(String::from),
                priority: priority_label(priority).to_string(),
                assigned_wa_id: None,
                status: "pending".to_string(),
            });
        }
        Ok(result)
    }

    /// Resolve a deferral: embed the resolution, attach guidance when the
    /// approval carries a reason, and flip the task back to `pending`.
    /// Returns true iff exactly one row was updated.
    pub async fn resolve_deferral(
        &self,
        deferral_id: &str,
        response: DeferralResponse,
    ) -> Result<bool, AuthorityError> {
        let Some(task_id) = self.locate_deferred_task(deferral_id).await? else {
            error!("Deferral {} not found", deferral_id);
            return Ok(false);
        };

        let row = sqlx::query(
            "SELECT context_json FROM tasks WHERE task_id = ? AND status = 'deferred'",
        )
        .bind(&task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            error!("Task {} not found or not deferred", task_id);
            return Ok(false);
        };

        let context_json: Option<String> = row.try_get("context_json").map_err(db_err)?;
        let mut context: serde_json::Value = context_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        if context.get("deferral").is_some() {
            context["deferral"]["resolution"] = serde_json::json!({
                "approved": response.approved,
                "reason": response.reason,
                "resolved_by": response.wa_id,
                "resolved_at": Utc::now().to_rfc3339(),
            });
        }
        if response.approved {
            if let Some(reason) = &response.reason {
                context["wa_guidance"] = serde_json::Value::String(reason.clone());
            }
        }

        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', context_json = ?, updated_at = ? \
             WHERE task_id = ? AND status = 'deferred'",
        )
        .bind(context.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let updated = result.rows_affected() == 1;
        if updated {
            info!(
                "Deferral {} {} by {}, task {} now pending",
                deferral_id,
                if response.approved { "approved" } else { "rejected" },
                response.wa_id,
                task_id
            );
        }
        Ok(updated)
    }

    /// Recover the task id from `defer_<task_id>_<epoch_ms>`. Task ids may
    /// themselves contain underscores, so a LIKE-scan of the context JSON is
    /// kept as the fallback.
    async fn locate_deferred_task(
        &self,
        deferral_id: &str,
    ) -> Result<Option<String>, AuthorityError> {
        if let Some(stripped) = deferral_id.strip_prefix("defer_") {
            if let Some((task_id, _epoch)) = stripped.rsplit_once('_') {
                let exists: Option<String> = sqlx::query_scalar(
                    "SELECT task_id FROM tasks WHERE task_id = ? AND status = 'deferred'",
                )
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
                if exists.is_some() {
                    return Ok(Some(task_id.to_string()));
                }
            }

            let pattern = format!("%\"deferral_id\":\"{}\"%", deferral_id);
            let found: Option<String> = sqlx::query_scalar(
                "SELECT task_id FROM tasks WHERE status = 'deferred' AND context_json LIKE ?",
            )
            .bind(pattern)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
            return Ok(found);
        }

        // Bare ids are treated as task ids directly.
        Ok(Some(deferral_id.to_string()))
    }

    /// Pending/resolved deferral counts, for status surfaces.
    pub async fn deferral_counts(&self) -> Result<(u64, u64), AuthorityError> {
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = 'deferred'")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        let resolved: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE context_json LIKE '%\"resolution\":%'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok((pending.max(0) as u64, resolved.max(0) as u64))
    }
}

fn priority_label(priority: i64) -> &'static str {
    if priority > 5 {
        "high"
    } else if priority > 0 {
        "medium"
    } else {
        "low"
    }
}

#[async_trait]
impl WiseAuthority for WiseAuthorityService {
    /// Mark the task deferred and embed the deferral record in its context.
    /// Fails when the task does not exist.
    async fn send_deferral(&self, deferral: DeferralRequest) -> Result<String, AuthorityError> {
        let deferral_id =
            format!("defer_{}_{}", deferral.task_id, Utc::now().timestamp_millis());

        let row = sqlx::query("SELECT context_json FROM tasks WHERE task_id = ?")
            .bind(&deferral.task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            error!("Task {} not found for deferral", deferral.task_id);
            return Err(AuthorityError::not_found("task", &deferral.task_id));
        };

        let context_json: Option<String> = row.try_get("context_json").map_err(db_err)?;
        let mut context: serde_json::Value = context_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        context["deferral"] = serde_json::json!({
            "deferral_id": deferral_id,
            "thought_id": deferral.thought_id,
            "reason": deferral.reason,
            "defer_until": deferral.defer_until.to_rfc3339(),
            "requires_wa_approval": true,
            "context": deferral.context,
            "created_at": Utc::now().to_rfc3339(),
        });

        sqlx::query(
            "UPDATE tasks SET status = 'deferred', context_json = ?, updated_at = ? \
             WHERE task_id = ?",
        )
        .bind(context.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&deferral.task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        info!("Task {} marked as deferred", deferral.task_id);
        Ok(deferral_id)
    }

    /// Guidance comes only from Wise Authorities, attached out of band
    /// through resolution; this service never generates it.
    async fn fetch_guidance(
        &self,
        context: GuidanceContext,
    ) -> Result<Option<String>, AuthorityError> {
        info!(
            "Guidance requested for thought {}: {}",
            context.thought_id, context.question
        );
        let guidance: Option<String> = sqlx::query_scalar(
            "SELECT json_extract(context_json, '$.wa_guidance') FROM tasks WHERE task_id = ?",
        )
        .bind(&context.task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .flatten();

        if guidance.is_none() {
            debug!("No WA guidance available yet for thought {}", context.thought_id);
        }
        Ok(guidance)
    }
}

#[async_trait]
impl Service for WiseAuthorityService {
    fn name(&self) -> &str {
        "WiseAuthorityService"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.auth.bootstrap_if_needed().await?;
        info!("WiseAuthorityService started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.started.store(false, Ordering::SeqCst);
        info!("WiseAuthorityService stopped");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
