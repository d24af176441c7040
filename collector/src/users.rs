//! Owner accounts.
//!
//! Sign-up and login live in front of this service; the collector only
//! resolves the username the upstream layer vouches for.

use crate::errors::{Error, Result};
use crate::model::User;
use sqlx::PgPool;

pub async fn find_by_username(pool: &PgPool, username: &str) -> Result<User> {
    sqlx::query_as::<_, User>("SELECT id, username FROM users WHERE username = $1")
        .bind(username)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::Authentication("Unknown user".to_string()))
}

/// Inserts the account if missing. Used by provisioning scripts and tests.
pub async fn get_or_create(pool: &PgPool, username: &str) -> Result<User> {
    let username = username.trim();
    if username.is_empty() {
        return Err(Error::field("username", "Username can't be empty"));
    }

    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (username) VALUES ($1)
        ON CONFLICT (username) DO UPDATE SET username = EXCLUDED.username
        RETURNING id, username
        "#,
    )
    .bind(username)
    .fetch_one(pool)
    .await?;

    Ok(user)
}
