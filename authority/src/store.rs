//! SQLite store for WA certificates.

use chrono::{DateTime, Utc};
use fabric_contracts::{AuthorityError, WACertificate, WARole};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS wa_cert (
    wa_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    role TEXT NOT NULL,
    pubkey TEXT NOT NULL,
    jwt_kid TEXT NOT NULL,
    password_hash TEXT,
    api_key_hash TEXT,
    oauth_provider TEXT,
    oauth_external_id TEXT,
    auto_minted INTEGER NOT NULL DEFAULT 0,
    parent_wa_id TEXT,
    parent_signature TEXT,
    scopes_json TEXT NOT NULL,
    adapter_id TEXT,
    adapter_name TEXT,
    created TEXT NOT NULL,
    last_login TEXT,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_wa_cert_active_kid
    ON wa_cert(jwt_kid) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_wa_cert_oauth
    ON wa_cert(oauth_provider, oauth_external_id);
CREATE INDEX IF NOT EXISTS idx_wa_cert_adapter
    ON wa_cert(adapter_id);
"#;

pub(crate) fn db_err(e: sqlx::Error) -> AuthorityError {
    AuthorityError::Storage(e.to_string())
}

/// WA certificate table access. Rows with `active = 0` are revoked.
#[derive(Clone)]
pub struct WaCertStore {
    pool: SqlitePool,
}

impl WaCertStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, AuthorityError> {
        sqlx::query(SCHEMA).execute(&pool).await.map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert(&self, wa: &WACertificate) -> Result<(), AuthorityError> {
        sqlx::query(
            "INSERT INTO wa_cert (wa_id, name, role, pubkey, jwt_kid, password_hash, \
             api_key_hash, oauth_provider, oauth_external_id, auto_minted, parent_wa_id, \
             parent_signature, scopes_json, adapter_id, adapter_name, created, last_login, active) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&wa.wa_id)
        .bind(&wa.name)
        .bind(wa.role.as_str())
        .bind(&wa.pubkey)
        .bind(&wa.jwt_kid)
        .bind(&wa.password_hash)
        .bind(&wa.api_key_hash)
        .bind(&wa.oauth_provider)
        .bind(&wa.oauth_external_id)
        .bind(wa.auto_minted as i64)
        .bind(&wa.parent_wa_id)
        .bind(&wa.parent_signature)
        .bind(serde_json::to_string(&wa.scopes).unwrap_or_else(|_| "[]".to_string()))
        .bind(&wa.adapter_id)
        .bind(&wa.adapter_name)
        .bind(wa.created_at.to_rfc3339())
        .bind(wa.last_auth.map(|t| t.to_rfc3339()))
        .bind(wa.active as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        info!("Stored WA certificate {} ({})", wa.wa_id, wa.role.as_str());
        Ok(())
    }

    pub async fn get(&self, wa_id: &str) -> Result<Option<WACertificate>, AuthorityError> {
        let row = sqlx::query("SELECT * FROM wa_cert WHERE wa_id = ? AND active = 1")
            .bind(wa_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_row(&r)).transpose()
    }

    pub async fn get_by_kid(&self, jwt_kid: &str) -> Result<Option<WACertificate>, AuthorityError> {
        let row = sqlx::query("SELECT * FROM wa_cert WHERE jwt_kid = ? AND active = 1")
            .bind(jwt_kid)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_row(&r)).transpose()
    }

    pub async fn get_by_oauth(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<WACertificate>, AuthorityError> {
        let row = sqlx::query(
            "SELECT * FROM wa_cert WHERE oauth_provider = ? AND oauth_external_id = ? AND active = 1",
        )
        .bind(provider)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| from_row(&r)).transpose()
    }

    pub async fn get_by_adapter(
        &self,
        adapter_id: &str,
    ) -> Result<Option<WACertificate>, AuthorityError> {
        let row = sqlx::query("SELECT * FROM wa_cert WHERE adapter_id = ? AND active = 1")
            .bind(adapter_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_row(&r)).transpose()
    }

    pub async fn list_all(&self, active_only: bool) -> Result<Vec<WACertificate>, AuthorityError> {
        let sql = if active_only {
            "SELECT * FROM wa_cert WHERE active = 1 ORDER BY created"
        } else {
            "SELECT * FROM wa_cert ORDER BY created"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(from_row).collect()
    }

    pub async fn touch_last_login(
        &self,
        wa_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AuthorityError> {
        sqlx::query("UPDATE wa_cert SET last_login = ? WHERE wa_id = ?")
            .bind(at.to_rfc3339())
            .bind(wa_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn update_scopes(
        &self,
        wa_id: &str,
        scopes: &[String],
    ) -> Result<bool, AuthorityError> {
        let result = sqlx::query("UPDATE wa_cert SET scopes_json = ? WHERE wa_id = ? AND active = 1")
            .bind(serde_json::to_string(scopes).unwrap_or_else(|_| "[]".to_string()))
            .bind(wa_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    /// Deactivate a certificate. Tokens keyed by its kid stop verifying.
    pub async fn revoke(&self, wa_id: &str) -> Result<bool, AuthorityError> {
        let result = sqlx::query("UPDATE wa_cert SET active = 0 WHERE wa_id = ?")
            .bind(wa_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() >= 1)
    }
}

fn from_row(row: &SqliteRow) -> Result<WACertificate, AuthorityError> {
    let role_raw: String = row.try_get("role").map_err(db_err)?;
    let role = WARole::parse(&role_raw)
        .ok_or_else(|| AuthorityError::Storage(format!("unknown WA role '{}'", role_raw)))?;

    let scopes_json: String = row.try_get("scopes_json").map_err(db_err)?;
    let scopes: Vec<String> = serde_json::from_str(&scopes_json)
        .map_err(|e| AuthorityError::Storage(format!("scopes_json did not parse: {}", e)))?;

    let created_raw: String = row.try_get("created").map_err(db_err)?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map_err(|e| AuthorityError::Storage(format!("bad created timestamp: {}", e)))?
        .with_timezone(&Utc);

    let last_login: Option<String> = row.try_get("last_login").map_err(db_err)?;
    let last_auth = last_login
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc));

    Ok(WACertificate {
        wa_id: row.try_get("wa_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        role,
        pubkey: row.try_get("pubkey").map_err(db_err)?,
        jwt_kid: row.try_get("jwt_kid").map_err(db_err)?,
        password_hash: row.try_get("password_hash").map_err(db_err)?,
        api_key_hash: row.try_get("api_key_hash").map_err(db_err)?,
        oauth_provider: row.try_get("oauth_provider").map_err(db_err)?,
        oauth_external_id: row.try_get("oauth_external_id").map_err(db_err)?,
        auto_minted: row.try_get::<i64, _>("auto_minted").map_err(db_err)? != 0,
        parent_wa_id: row.try_get("parent_wa_id").map_err(db_err)?,
        parent_signature: row.try_get("parent_signature").map_err(db_err)?,
        scopes,
        adapter_id: row.try_get("adapter_id").map_err(db_err)?,
        adapter_name: row.try_get("adapter_name").map_err(db_err)?,
        created_at,
        last_auth,
        active: row.try_get::<i64, _>("active").map_err(db_err)? != 0,
    })
}
