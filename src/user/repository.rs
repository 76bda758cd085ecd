//! Handle database requests.

use sqlx::SqlitePool;

use crate::error::Result;
use crate::oauth::IdentityProvider;
use crate::user::User;

/// Fields of a user about to be inserted.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: Option<String>,
    pub locale: String,
    pub is_admin: bool,
    pub email_verified: bool,
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Create a new [`UserRepository`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert [`User`] into database.
    pub async fn insert(&self, user: &NewUser) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"INSERT INTO users (username, email, password, locale, is_admin, email_verified, avatar_url)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                RETURNING *"#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password)
        .bind(&user.locale)
        .bind(user.is_admin)
        .bind(user.email_verified)
        .bind(&user.avatar_url)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(id = user.id, "user created");

        Ok(user)
    }

    /// Find a user using `id` field.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Find a user using `email` field.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE email = ? COLLATE NOCASE",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Find a user using `username` field.
    pub async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE username = ? ORDER BY id LIMIT 1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Find the user linked to an identity provider account.
    pub async fn find_by_provider(
        &self,
        provider: IdentityProvider,
        provider_id: &str,
    ) -> Result<Option<User>> {
        let query = format!(
            "SELECT * FROM users WHERE {} = ?",
            provider.id_column()
        );

        Ok(sqlx::query_as::<_, User>(&query)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Update mutable profile fields of a user.
    pub async fn update(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"UPDATE users
                SET username = ?, email = ?, bio = ?, locale = ?, avatar_url = ?,
                    is_admin = ?, email_verified = ?, current_library = ?,
                    discord_id = ?, discord_token = ?, google_id = ?, google_token = ?,
                    updated_at = CURRENT_TIMESTAMP
                WHERE id = ?"#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.bio)
        .bind(&user.locale)
        .bind(&user.avatar_url)
        .bind(user.is_admin)
        .bind(user.email_verified)
        .bind(&user.current_library)
        .bind(&user.discord_id)
        .bind(&user.discord_token)
        .bind(&user.google_id)
        .bind(&user.google_token)
        .bind(user.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replace the password hash of a user.
    pub async fn set_password(&self, id: i64, phc: &str) -> Result<()> {
        sqlx::query(
            "UPDATE users SET password = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(phc)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark an email as verified. Returns whether an account matched.
    pub async fn verify_email(&self, email: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET email_verified = TRUE, updated_at = CURRENT_TIMESTAMP WHERE email = ? COLLATE NOCASE",
        )
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Select the library a user studies.
    pub async fn set_current_library(
        &self,
        id: i64,
        library: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET current_library = ? WHERE id = ?")
            .bind(library)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Point every user studying `old` to `new`.
    pub async fn rename_current_library(
        &self,
        old: &str,
        new: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET current_library = ? WHERE current_library = ?",
        )
        .bind(new)
        .bind(old)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a user. Favorites cascade, authored libraries lose their author.
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        tracing::debug!(id, "user deleted");

        Ok(())
    }

    /// Number of accounts.
    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?)
    }
}
