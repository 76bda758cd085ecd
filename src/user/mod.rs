mod builder;
mod repository;

pub use builder::*;
pub use repository::*;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::oauth::IdentityProvider;

/// User as saved on database.
#[derive(
    Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow,
)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    /// Argon2id PHC string; `None` for OAuth-only accounts.
    #[serde(skip)]
    pub password: Option<String>,
    pub is_admin: bool,
    pub unlimited_access: bool,
    pub email_verified: bool,
    pub bio: Option<String>,
    pub locale: String,
    pub avatar_url: Option<String>,
    pub current_library: Option<String>,
    #[serde(skip)]
    pub discord_id: Option<String>,
    #[serde(skip)]
    pub discord_token: Option<String>,
    #[serde(skip)]
    pub google_id: Option<String>,
    #[serde(skip)]
    pub google_token: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl User {
    /// Admins and flagged users skip library quotas.
    pub fn has_unlimited_access(&self) -> bool {
        self.is_admin || self.unlimited_access
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Account ID on an identity provider, if linked.
    pub fn provider_id(&self, provider: IdentityProvider) -> Option<&str> {
        match provider {
            IdentityProvider::Discord => self.discord_id.as_deref(),
            IdentityProvider::Google => self.google_id.as_deref(),
        }
    }

    /// Record a link to an identity provider.
    pub fn link(
        &mut self,
        provider: IdentityProvider,
        id: String,
        token: String,
    ) {
        match provider {
            IdentityProvider::Discord => {
                self.discord_id = Some(id);
                self.discord_token = Some(token);
            },
            IdentityProvider::Google => {
                self.google_id = Some(id);
                self.google_token = Some(token);
            },
        }
    }

    /// Forget the link to an identity provider.
    pub fn unlink(&mut self, provider: IdentityProvider) {
        match provider {
            IdentityProvider::Discord => {
                self.discord_id = None;
                self.discord_token = None;
            },
            IdentityProvider::Google => {
                self.google_id = None;
                self.google_token = None;
            },
        }
    }
}
