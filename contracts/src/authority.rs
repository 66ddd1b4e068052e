//! Wise Authority identity, deferral, and guidance schemas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a Wise Authority certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WARole {
    Root,
    Authority,
    Observer,
}

impl WARole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WARole::Root => "root",
            WARole::Authority => "authority",
            WARole::Observer => "observer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "root" => Some(WARole::Root),
            "authority" => Some(WARole::Authority),
            "observer" => Some(WARole::Observer),
            _ => None,
        }
    }
}

/// Identity record of a Wise Authority.
///
/// `wa_id` follows `wa-YYYY-MM-DD-XXXXXX` (six uppercase hex); `pubkey` is a
/// base64url-encoded 32-byte Ed25519 public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WACertificate {
    pub wa_id: String,
    pub name: String,
    pub role: WARole,
    pub pubkey: String,
    pub jwt_kid: String,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub api_key_hash: Option<String>,
    #[serde(default)]
    pub oauth_provider: Option<String>,
    #[serde(default)]
    pub oauth_external_id: Option<String>,
    #[serde(default)]
    pub auto_minted: bool,
    #[serde(default)]
    pub parent_wa_id: Option<String>,
    #[serde(default)]
    pub parent_signature: Option<String>,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub adapter_id: Option<String>,
    #[serde(default)]
    pub adapter_name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_auth: Option<DateTime<Utc>>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl WACertificate {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }
}

/// JWT `sub_type` claim. Determines which verification path must succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JwtSubType {
    /// Channel/adapter tokens signed with the gateway secret.
    Anon,
    /// OAuth-linked tokens signed with the gateway secret.
    Oauth,
    /// Password-authenticated tokens signed with the gateway secret.
    User,
    /// WA-signed tokens verified against the WA's Ed25519 key.
    Authority,
}

/// Result of verifying a token: who it names and what it grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationContext {
    pub wa_id: String,
    pub role: WARole,
    pub sub_type: JwtSubType,
    pub scopes: Vec<String>,
    pub channel_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Deferral context as submitted to the Wise Authority bus.
///
/// `defer_until` is an optional ISO-8601 string (a `Z` suffix is accepted);
/// the bus parses it at the boundary and defaults to one hour out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeferralContext {
    pub task_id: String,
    pub thought_id: String,
    pub reason: String,
    #[serde(default)]
    pub defer_until: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Deferral request as delivered to a Wise Authority provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralRequest {
    pub task_id: String,
    pub thought_id: String,
    pub reason: String,
    pub defer_until: DateTime<Utc>,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

/// A WA's resolution of a pending deferral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralResponse {
    pub approved: bool,
    pub reason: Option<String>,
    pub wa_id: String,
}

/// A deferred task awaiting WA resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDeferral {
    pub deferral_id: String,
    pub created_at: DateTime<Utc>,
    pub deferred_by: String,
    pub task_id: String,
    pub thought_id: String,
    pub reason: String,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub priority: String,
    pub assigned_wa_id: Option<String>,
    pub status: String,
}

/// Context for a guidance request routed through the WA bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceContext {
    pub thought_id: String,
    pub task_id: String,
    pub question: String,
    #[serde(default)]
    pub domain_context: HashMap<String, String>,
}

/// Context for an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralApprovalContext {
    pub task_id: String,
    pub thought_id: String,
    pub requester_id: String,
    #[serde(default)]
    pub action_params: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A row in the task store. Deferral records are embedded in `context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub channel_id: Option<String>,
    pub description: String,
    pub status: String,
    pub priority: i64,
    pub context: Option<serde_json::Value>,
    pub signed_by: Option<String>,
    pub signature: Option<String>,
    pub signed_at: Option<String>,
    pub parent_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
