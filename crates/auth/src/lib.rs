use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use quadlink_config::AuthConfig;
use quadlink_realtime::repositories::{DirectoryService, StoreError, StoreResult};
use quadlink_realtime::types::UserId;
use rand::RngCore;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Authenticator {
    pool: SqlitePool,
    session_ttl: Duration,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user already exists")]
    UserExists,
    #[error("user not found")]
    UserNotFound,
    #[error("invalid username")]
    InvalidUsername,
    #[error("an identity cannot be its own contact")]
    SelfContact,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("session expired")]
    SessionExpired,
    #[error("invalid session token")]
    InvalidSession,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

/// Longer lifetimes are clamped so expiry timestamps stay representable.
const MAX_SESSION_TTL_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

impl Authenticator {
    pub fn new(pool: SqlitePool, config: AuthConfig) -> Self {
        let session_ttl = session_ttl(config.session_ttl_seconds);
        Self { pool, session_ttl }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub async fn create_user(
        &self,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<User, AuthError> {
        let username = username.trim();
        if username.is_empty() || username.len() > 64 {
            return Err(AuthError::InvalidUsername);
        }

        let now = Utc::now();
        let result =
            sqlx::query("INSERT INTO users (username, display_name, created_at) VALUES (?, ?, ?)")
                .bind(username)
                .bind(display_name)
                .bind(now)
                .execute(&self.pool)
                .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(AuthError::UserExists)
            }
            Err(err) => return Err(err.into()),
        };

        info!(user_id = id, username, "created user");
        Ok(User {
            id,
            username: username.to_owned(),
            display_name: display_name.map(str::to_owned),
            created_at: now,
        })
    }

    pub async fn user_profile(&self, user_id: UserId) -> Result<User, AuthError> {
        let row =
            sqlx::query("SELECT id, username, display_name, created_at FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref()
            .map(user_from_row)
            .transpose()?
            .ok_or(AuthError::UserNotFound)
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        let row = sqlx::query(
            "SELECT id, username, display_name, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    pub async fn list_users(&self) -> Result<Vec<User>, AuthError> {
        let rows =
            sqlx::query("SELECT id, username, display_name, created_at FROM users ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(user_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn issue_session(&self, user_id: UserId) -> Result<AuthSession, AuthError> {
        self.user_profile(user_id).await?;

        let token = generate_session_token();
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(self.session_ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        sqlx::query(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&token)
        .bind(user_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        debug!(user_id, "issued session");
        Ok(AuthSession {
            token,
            user_id,
            expires_at,
        })
    }

    /// Resolves a bearer token. Expired sessions are deleted on sight.
    pub async fn authenticate_token(&self, token: &str) -> Result<AuthSession, AuthError> {
        let row = sqlx::query("SELECT user_id, expires_at FROM sessions WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(AuthError::InvalidSession);
        };

        let user_id: UserId = row.try_get("user_id")?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        if expires_at <= Utc::now() {
            self.revoke_session(token).await?;
            return Err(AuthError::SessionExpired);
        }

        Ok(AuthSession {
            token: token.to_owned(),
            user_id,
            expires_at,
        })
    }

    pub async fn revoke_session(&self, token: &str) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn purge_expired_sessions(&self) -> Result<u64, AuthError> {
        let purged = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if purged > 0 {
            info!(purged, "purged expired sessions");
        }
        Ok(purged)
    }

    /// Contacts are mutual; adding an existing pair is a no-op.
    pub async fn add_contact(&self, a: UserId, b: UserId) -> Result<(), AuthError> {
        if a == b {
            return Err(AuthError::SelfContact);
        }
        self.user_profile(a).await?;
        self.user_profile(b).await?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for (user, contact) in [(a, b), (b, a)] {
            sqlx::query(
                "INSERT OR IGNORE INTO contacts (user_id, contact_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(user)
            .bind(contact)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_contact(&self, a: UserId, b: UserId) -> Result<(), AuthError> {
        sqlx::query(
            "DELETE FROM contacts WHERE (user_id = ? AND contact_id = ?) OR (user_id = ? AND contact_id = ?)",
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn contacts_of(&self, user_id: UserId) -> Result<Vec<UserId>, AuthError> {
        let contacts = sqlx::query_scalar::<_, i64>(
            "SELECT contact_id FROM contacts WHERE user_id = ? ORDER BY contact_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(contacts)
    }
}

#[async_trait]
impl DirectoryService for Authenticator {
    async fn verify_credential(&self, token: &str) -> StoreResult<Option<UserId>> {
        match self.authenticate_token(token).await {
            Ok(session) => Ok(Some(session.user_id)),
            Err(AuthError::InvalidSession | AuthError::SessionExpired) => Ok(None),
            Err(err) => {
                warn!(error = %err, "credential check failed");
                Err(StoreError::Unavailable(err.to_string()))
            }
        }
    }

    async fn contacts_of(&self, user_id: UserId) -> StoreResult<Vec<UserId>> {
        Authenticator::contacts_of(self, user_id)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_ttl(seconds: u64) -> Duration {
    let seconds = i64::try_from(seconds)
        .unwrap_or(i64::MAX)
        .min(MAX_SESSION_TTL_SECONDS);
    Duration::seconds(seconds)
}

fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
