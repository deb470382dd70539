//! Identity provider: account creation and credential exchange for tokens.
//!
//! DESIGN
//! ======
//! Accounts live in `users` with a bcrypt password hash. Hashing and
//! verification are CPU-bound, so both run on the blocking pool. Emails are
//! trimmed and lowercased before they touch the database; the unique index on
//! `users.email` is the source of truth for duplicates.
//!
//! Login failures never say whether the email or the password was wrong.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::env_parse;
use crate::services::session;

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("{0}")]
    Invalid(&'static str),
    #[error("email already registered")]
    EmailTaken,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Credentials exchanged for a session.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

pub(crate) fn validate_registration(username: &str, email: &str, password: &str) -> Result<(), AccountError> {
    if username.trim().is_empty() {
        return Err(AccountError::Invalid("username is required"));
    }
    let email = email.trim();
    let valid_email = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty() && !email.contains(char::is_whitespace));
    if !valid_email {
        return Err(AccountError::Invalid("email is invalid"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AccountError::Invalid("password must be at least 6 characters"));
    }
    Ok(())
}

fn bcrypt_cost() -> u32 {
    env_parse("BCRYPT_COST", bcrypt::DEFAULT_COST)
}

pub(crate) async fn hash_password(password: &str) -> Result<String, AccountError> {
    let password = password.to_owned();
    let cost = bcrypt_cost();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| AccountError::Hash(e.to_string()))?
        .map_err(|e| AccountError::Hash(e.to_string()))
}

pub(crate) async fn verify_password(password: &str, hash: &str) -> Result<bool, AccountError> {
    let password = password.to_owned();
    let hash = hash.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| AccountError::Hash(e.to_string()))?
        .map_err(|e| AccountError::Hash(e.to_string()))
}

/// Create an account and return its id.
///
/// # Errors
///
/// Returns [`AccountError::Invalid`] for bad input and
/// [`AccountError::EmailTaken`] when the email is already registered.
pub async fn create_account(pool: &PgPool, username: &str, email: &str, password: &str) -> Result<Uuid, AccountError> {
    validate_registration(username, email, password)?;
    let password_hash = hash_password(password).await?;

    let id = Uuid::new_v4();
    let inserted = sqlx::query("INSERT INTO users (id, username, email, password_hash) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(username.trim())
        .bind(normalize_email(email))
        .bind(password_hash)
        .execute(pool)
        .await;

    match inserted {
        Ok(_) => Ok(id),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(AccountError::EmailTaken),
        Err(e) => Err(e.into()),
    }
}

/// Check credentials and open a session.
///
/// # Errors
///
/// Returns [`AccountError::InvalidCredentials`] when the email is unknown or
/// the password does not match.
pub async fn issue_token(pool: &PgPool, email: &str, password: &str) -> Result<IssuedToken, AccountError> {
    let row = sqlx::query("SELECT id, username, password_hash FROM users WHERE email = $1")
        .bind(normalize_email(email))
        .fetch_optional(pool)
        .await?
        .ok_or(AccountError::InvalidCredentials)?;

    let hash: String = row.get("password_hash");
    if !verify_password(password, &hash).await? {
        return Err(AccountError::InvalidCredentials);
    }

    let user_id: Uuid = row.get("id");
    let token = session::create_session(pool, user_id).await?;
    Ok(IssuedToken { user_id, username: row.get("username"), token })
}

#[cfg(test)]
#[path = "account_test.rs"]
mod tests;
