//! Authentication service: WA certificates, keypairs, JWTs, task signing.
//!
//! Token verification runs both the gateway (HS256) and WA-key (EdDSA)
//! paths and requires the claimed `sub_type` to match the path that
//! actually verified. This blocks algorithm-confusion attacks where an
//! EdDSA payload arrives under an HS256 header.

use crate::crypto::{
    self, decode_public_key, encode_public_key, restrict_permissions, SecretStore,
};
use crate::store::WaCertStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use fabric_contracts::{
    AuthorityError, AuthorizationContext, JwtSubType, Service, Task, WACertificate, WARole,
};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Name of the system authority certificate minted at bootstrap.
pub const SYSTEM_WA_NAME: &str = "Fabric System Authority";

const SYSTEM_WA_SCOPES: [&str; 7] = [
    "system.task.create",
    "system.task.sign",
    "system.wakeup",
    "system.dream",
    "system.shutdown",
    "memory.read",
    "memory.write",
];

/// JWT claims carried by fabric tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub sub_type: JwtSubType,
    pub name: String,
    pub scope: Vec<String>,
    pub iat: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_provider: Option<String>,
}

/// Owns the WA certificate store, the gateway secret, and all key material.
pub struct AuthenticationService {
    store: WaCertStore,
    key_dir: PathBuf,
    gateway_secret: Vec<u8>,
    channel_token_cache: DashMap<String, String>,
    running: AtomicBool,
}

impl AuthenticationService {
    pub async fn new(
        pool: SqlitePool,
        key_dir: impl Into<PathBuf>,
    ) -> Result<Self, AuthorityError> {
        let key_dir = key_dir.into();
        let gateway_secret = SecretStore::new(&key_dir).load_or_create_gateway_secret()?;
        let store = WaCertStore::new(pool).await?;
        Ok(Self {
            store,
            key_dir,
            gateway_secret,
            channel_token_cache: DashMap::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &WaCertStore {
        &self.store
    }

    // ---- WA store facade ----

    pub async fn get_wa(&self, wa_id: &str) -> Result<Option<WACertificate>, AuthorityError> {
        self.store.get(wa_id).await
    }

    pub async fn list_was(&self, active_only: bool) -> Result<Vec<WACertificate>, AuthorityError> {
        self.store.list_all(active_only).await
    }

    pub async fn get_wa_by_oauth(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<WACertificate>, AuthorityError> {
        self.store.get_by_oauth(provider, external_id).await
    }

    pub async fn revoke_wa(&self, wa_id: &str, reason: &str) -> Result<bool, AuthorityError> {
        warn!("Revoking WA {}: {}", wa_id, reason);
        self.store.revoke(wa_id).await
    }

    pub async fn update_last_login(&self, wa_id: &str) -> Result<(), AuthorityError> {
        self.store.touch_last_login(wa_id, Utc::now()).await
    }

    // ---- Identity minting ----

    /// `wa-YYYY-MM-DD-XXXXXX`, six uppercase hex from a random 3-byte draw.
    pub fn generate_wa_id(&self, timestamp: DateTime<Utc>) -> Result<String, AuthorityError> {
        Ok(format!(
            "wa-{}-{}",
            timestamp.format("%Y-%m-%d"),
            crypto::wa_id_suffix()?
        ))
    }

    fn kid_for(wa_id: &str) -> String {
        let suffix: String = wa_id.chars().rev().take(6).collect::<Vec<_>>().into_iter().rev().collect();
        format!("wa-jwt-{}", suffix.to_lowercase())
    }

    /// Mint and store a new WA certificate. Returns the certificate and the
    /// pkcs8-encoded private key; the caller owns key custody.
    pub async fn mint_wa(
        &self,
        name: &str,
        role: WARole,
        scopes: &[&str],
    ) -> Result<(WACertificate, Vec<u8>), AuthorityError> {
        let (pkcs8, public) = crypto::generate_keypair()?;
        let now = Utc::now();
        let wa_id = self.generate_wa_id(now)?;
        let cert = WACertificate {
            wa_id: wa_id.clone(),
            name: name.to_string(),
            role,
            pubkey: encode_public_key(&public),
            jwt_kid: Self::kid_for(&wa_id),
            password_hash: None,
            api_key_hash: None,
            oauth_provider: None,
            oauth_external_id: None,
            auto_minted: false,
            parent_wa_id: None,
            parent_signature: None,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            adapter_id: None,
            adapter_name: None,
            created_at: now,
            last_auth: None,
            active: true,
        };
        self.store.insert(&cert).await?;
        Ok((cert, pkcs8))
    }

    /// Find or materialise the observer certificate bound to an adapter.
    pub async fn get_or_create_adapter_observer(
        &self,
        adapter_id: &str,
        name: &str,
    ) -> Result<WACertificate, AuthorityError> {
        if let Some(existing) = self.store.get_by_adapter(adapter_id).await? {
            return Ok(existing);
        }

        let (_pkcs8, public) = crypto::generate_keypair()?;
        let now = Utc::now();
        let wa_id = self.generate_wa_id(now)?;
        let cert = WACertificate {
            wa_id: wa_id.clone(),
            name: name.to_string(),
            role: WARole::Observer,
            pubkey: encode_public_key(&public),
            jwt_kid: Self::kid_for(&wa_id),
            password_hash: None,
            api_key_hash: None,
            oauth_provider: None,
            oauth_external_id: None,
            auto_minted: true,
            parent_wa_id: None,
            parent_signature: None,
            scopes: vec!["read".to_string(), "send_message".to_string()],
            adapter_id: Some(adapter_id.to_string()),
            adapter_name: Some(name.to_string()),
            created_at: now,
            last_auth: None,
            active: true,
        };
        self.store.insert(&cert).await?;
        info!("Created adapter observer {} for {}", wa_id, adapter_id);
        Ok(cert)
    }

    // ---- Tokens ----

    /// Channel token for an observer or user. Observer tokens bound to an
    /// adapter are non-expiring when `ttl = 0`.
    pub async fn create_channel_token(
        &self,
        wa_id: &str,
        channel_id: &str,
        ttl: u64,
    ) -> Result<String, AuthorityError> {
        let wa = self
            .get_wa(wa_id)
            .await?
            .ok_or_else(|| AuthorityError::not_found("WA", wa_id))?;

        let now = Utc::now().timestamp() as u64;
        let mut claims = TokenClaims {
            sub: wa.wa_id.clone(),
            sub_type: JwtSubType::Anon,
            name: wa.name.clone(),
            scope: wa.scopes.clone(),
            iat: now,
            exp: None,
            channel: None,
            adapter: None,
            oauth_provider: None,
        };

        if wa.role == WARole::Observer && wa.adapter_id.is_some() {
            claims.adapter = wa.adapter_id.clone();
            if ttl > 0 {
                claims.exp = Some(now + ttl);
            }
        } else {
            claims.channel = Some(channel_id.to_string());
            claims.exp = Some(now + ttl);
        }

        self.encode_gateway(&claims, &wa.jwt_kid)
    }

    /// Gateway-signed token (OAuth/password auth), HS256.
    pub fn create_gateway_token(
        &self,
        wa: &WACertificate,
        expires_hours: u64,
    ) -> Result<String, AuthorityError> {
        let now = Utc::now().timestamp() as u64;
        let claims = TokenClaims {
            sub: wa.wa_id.clone(),
            sub_type: if wa.oauth_provider.is_some() { JwtSubType::Oauth } else { JwtSubType::User },
            name: wa.name.clone(),
            scope: wa.scopes.clone(),
            iat: now,
            exp: Some(now + expires_hours * 3600),
            channel: None,
            adapter: None,
            oauth_provider: wa.oauth_provider.clone(),
        };
        self.encode_gateway(&claims, &wa.jwt_kid)
    }

    /// WA-signed authority token, EdDSA over the WA's Ed25519 key. Valid for
    /// 24 hours.
    pub fn create_authority_token(
        &self,
        wa: &WACertificate,
        private_key_pkcs8: &[u8],
    ) -> Result<String, AuthorityError> {
        let now = Utc::now().timestamp() as u64;
        let claims = TokenClaims {
            sub: wa.wa_id.clone(),
            sub_type: JwtSubType::Authority,
            name: wa.name.clone(),
            scope: wa.scopes.clone(),
            iat: now,
            exp: Some(now + 24 * 3600),
            channel: None,
            adapter: None,
            oauth_provider: None,
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(wa.jwt_kid.clone());
        let key = EncodingKey::from_ed_der(private_key_pkcs8);
        encode(&header, &claims, &key)
            .map_err(|e| AuthorityError::Crypto(format!("token encoding failed: {}", e)))
    }

    fn encode_gateway(&self, claims: &TokenClaims, kid: &str) -> Result<String, AuthorityError> {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        encode(&header, claims, &EncodingKey::from_secret(&self.gateway_secret))
            .map_err(|e| AuthorityError::Crypto(format!("token encoding failed: {}", e)))
    }

    /// Verify any fabric JWT. Returns the authorization context, or `None`
    /// for anything invalid.
    ///
    /// The signature is checked against both the gateway secret and the
    /// WA's public key; the claimed `sub_type` must match the verification
    /// path that succeeded (`authority` needs EdDSA, everything else HS256).
    pub async fn verify_token(&self, token: &str) -> Option<AuthorizationContext> {
        let header = decode_header(token).ok()?;
        let kid = header.kid?;
        let wa = self.store.get_by_kid(&kid).await.ok().flatten()?;

        let gateway_claims = self.decode_hs256(token);
        let wa_key_claims = self.decode_eddsa(token, &wa);

        let (claims, verified_with_wa_key) = match (&gateway_claims, &wa_key_claims) {
            (Some(claims), _) => (claims.clone(), false),
            (None, Some(claims)) => (claims.clone(), true),
            (None, None) => return None,
        };

        match claims.sub_type {
            JwtSubType::Authority if !verified_with_wa_key => {
                warn!("Rejected authority token for {} verified via gateway path", claims.sub);
                return None;
            }
            JwtSubType::Anon | JwtSubType::Oauth | JwtSubType::User if verified_with_wa_key => {
                warn!("Rejected gateway token for {} verified via WA-key path", claims.sub);
                return None;
            }
            _ => {}
        }

        if let Err(e) = self.update_last_login(&wa.wa_id).await {
            debug!("last_login update failed: {}", e);
        }

        Some(AuthorizationContext {
            wa_id: claims.sub,
            role: wa.role,
            sub_type: claims.sub_type,
            scopes: claims.scope,
            channel_id: claims.channel,
            expires_at: claims.exp.and_then(|exp| Utc.timestamp_opt(exp as i64, 0).single()),
        })
    }

    fn decode_hs256(&self, token: &str) -> Option<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        decode::<TokenClaims>(token, &DecodingKey::from_secret(&self.gateway_secret), &validation)
            .ok()
            .map(|data| data.claims)
    }

    fn decode_eddsa(&self, token: &str, wa: &WACertificate) -> Option<TokenClaims> {
        let public = decode_public_key(&wa.pubkey).ok()?;
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.required_spec_claims = HashSet::new();
        decode::<TokenClaims>(token, &DecodingKey::from_ed_der(&public), &validation)
            .ok()
            .map(|data| data.claims)
    }

    // ---- Data and task signing ----

    pub fn sign_data(&self, pkcs8: &[u8], data: &[u8]) -> Result<String, AuthorityError> {
        crypto::sign_data(pkcs8, data)
    }

    pub fn verify_data_signature(&self, wa: &WACertificate, data: &[u8], signature: &str) -> bool {
        match decode_public_key(&wa.pubkey) {
            Ok(public) => crypto::verify_signature(&public, data, signature),
            Err(_) => false,
        }
    }

    /// Canonical sorted-key compact JSON over the signed task fields.
    fn canonical_task_json(task: &Task) -> String {
        serde_json::json!({
            "task_id": task.task_id,
            "description": task.description,
            "status": task.status,
            "priority": task.priority,
            "created_at": task.created_at.to_rfc3339(),
            "parent_task_id": task.parent_task_id,
            "context": task.context,
        })
        .to_string()
    }

    /// Sign a task with a WA's private key. Returns `(signature, signed_at)`.
    ///
    /// Only the system WA's key is held locally; other WAs keep custody of
    /// their own keys.
    pub async fn sign_task(
        &self,
        task: &Task,
        wa_id: &str,
    ) -> Result<(String, String), AuthorityError> {
        let wa = self
            .get_wa(wa_id)
            .await?
            .ok_or_else(|| AuthorityError::not_found("WA", wa_id))?;

        if wa.name != SYSTEM_WA_NAME {
            return Err(AuthorityError::Validation(format!(
                "private key management not implemented for WA {}",
                wa_id
            )));
        }
        let key_path = self.key_dir.join("system_wa.key");
        let private_key = std::fs::read(&key_path)
            .map_err(|_| AuthorityError::not_found("system WA private key", key_path.display().to_string()))?;

        let canonical = Self::canonical_task_json(task);
        let signature = crypto::sign_data(&private_key, canonical.as_bytes())?;
        Ok((signature, Utc::now().to_rfc3339()))
    }

    /// Verify a task's embedded signature against its signer's public key.
    pub async fn verify_task_signature(&self, task: &Task) -> bool {
        let (Some(signed_by), Some(signature), Some(_)) =
            (&task.signed_by, &task.signature, &task.signed_at)
        else {
            return false;
        };
        let Ok(Some(wa)) = self.get_wa(signed_by).await else {
            return false;
        };
        let canonical = Self::canonical_task_json(task);
        self.verify_data_signature(&wa, canonical.as_bytes(), signature)
    }

    pub fn hash_password(&self, password: &str) -> Result<String, AuthorityError> {
        crypto::hash_password(password)
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        crypto::verify_password(password, hash)
    }

    pub fn generate_api_key(&self, wa_id: &str) -> Result<String, AuthorityError> {
        let entropy = crypto::random_bytes(32)?;
        let entropy_hex: String = entropy.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(crypto::sha256_hex(format!("{}:{}", wa_id, entropy_hex).as_bytes()))
    }

    // ---- Bootstrap ----

    /// Bootstrap identity state: load the seeded root certificate when the
    /// store is empty, then ensure a system authority certificate exists.
    pub async fn bootstrap_if_needed(&self) -> Result<(), AuthorityError> {
        if self.list_was(true).await?.is_empty() {
            let seed_path = self.key_dir.join("root_pub.json");
            if seed_path.exists() {
                let raw = std::fs::read_to_string(&seed_path)
                    .map_err(|e| AuthorityError::Storage(format!("root seed: {}", e)))?;
                let root: WACertificate = serde_json::from_str(&raw)
                    .map_err(|e| AuthorityError::Validation(format!("root seed did not parse: {}", e)))?;
                self.store.insert(&root).await?;
                info!("Loaded root WA certificate: {}", root.wa_id);
            }
        }

        let has_system = self
            .list_was(true)
            .await?
            .iter()
            .any(|wa| wa.role == WARole::Authority && wa.name == SYSTEM_WA_NAME);
        if !has_system {
            let root = self
                .list_was(true)
                .await?
                .into_iter()
                .find(|wa| wa.role == WARole::Root);
            match root {
                Some(root) => {
                    self.create_system_wa_certificate(&root.wa_id).await?;
                }
                None => warn!("No root WA certificate found - cannot create system WA"),
            }
        }
        Ok(())
    }

    /// The system WA signs system-generated tasks (wakeup, dream, shutdown)
    /// under the authority of the root certificate holder.
    async fn create_system_wa_certificate(
        &self,
        parent_wa_id: &str,
    ) -> Result<WACertificate, AuthorityError> {
        let (pkcs8, public) = crypto::generate_keypair()?;

        let key_path = self.key_dir.join("system_wa.key");
        std::fs::write(&key_path, &pkcs8)
            .map_err(|e| AuthorityError::Storage(format!("system key: {}", e)))?;
        restrict_permissions(&key_path)?;

        let now = Utc::now();
        let wa_id = self.generate_wa_id(now)?;
        let pubkey = encode_public_key(&public);

        let cert_data = serde_json::json!({
            "wa_id": wa_id,
            "name": SYSTEM_WA_NAME,
            "role": WARole::Authority.as_str(),
            "pubkey": pubkey,
            "parent_wa_id": parent_wa_id,
            "created_at": now.to_rfc3339(),
        })
        .to_string();
        let parent_signature = crypto::sign_data(&pkcs8, cert_data.as_bytes())?;

        let cert = WACertificate {
            wa_id: wa_id.clone(),
            name: SYSTEM_WA_NAME.to_string(),
            role: WARole::Authority,
            pubkey,
            jwt_kid: Self::kid_for(&wa_id),
            password_hash: None,
            api_key_hash: None,
            oauth_provider: None,
            oauth_external_id: None,
            auto_minted: false,
            parent_wa_id: Some(parent_wa_id.to_string()),
            parent_signature: Some(parent_signature),
            scopes: SYSTEM_WA_SCOPES.iter().map(|s| s.to_string()).collect(),
            adapter_id: None,
            adapter_name: None,
            created_at: now,
            last_auth: None,
            active: true,
        };
        self.store.insert(&cert).await?;
        info!("Created system WA certificate: {} (child of {})", wa_id, parent_wa_id);
        Ok(cert)
    }

    pub async fn get_system_wa_id(&self) -> Result<Option<String>, AuthorityError> {
        Ok(self
            .list_was(true)
            .await?
            .into_iter()
            .find(|wa| wa.role == WARole::Authority && wa.name == SYSTEM_WA_NAME)
            .map(|wa| wa.wa_id))
    }

    /// Long-lived channel token for an adapter, cached per adapter id.
    pub async fn create_channel_token_for_adapter(
        &self,
        adapter_type: &str,
        instance_id: &str,
    ) -> Result<String, AuthorityError> {
        let adapter_id = format!("{}_{}", adapter_type, instance_id);
        if let Some(cached) = self.channel_token_cache.get(&adapter_id) {
            return Ok(cached.clone());
        }

        let observer = self
            .get_or_create_adapter_observer(&adapter_id, &format!("{}_observer", adapter_type))
            .await?;
        let token = self.create_channel_token(&observer.wa_id, &adapter_id, 0).await?;
        self.channel_token_cache.insert(adapter_id, token.clone());
        Ok(token)
    }
}

#[async_trait]
impl Service for AuthenticationService {
    fn name(&self) -> &str {
        "AuthenticationService"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("AuthenticationService started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.channel_token_cache.clear();
        info!("AuthenticationService stopped");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
