//! Typed builder for User.

use crate::crypto::PasswordManager;
use crate::error::Result;
use crate::user::{NewUser, User, UserRepository};

pub const DEFAULT_LOCALE: &str = "en";
/// Longest stored username.
pub const USERNAME_LENGTH: usize = 32;

/// [`User`] builder.
#[derive(Debug, Clone)]
pub struct UserBuilder<Email> {
    username: String,
    email: Email,
    password: Option<String>,
    locale: String,
    is_admin: bool,
    email_verified: bool,
    avatar_url: Option<String>,
}

/// Value is missing on [`UserBuilder`].
#[derive(Debug, Clone)]
pub struct Missing;

/// Value is present on [`UserBuilder`].
#[derive(Debug, Clone)]
pub struct Present<T>(pub T);

impl UserBuilder<Missing> {
    /// Create a new [`UserBuilder`].
    pub fn new() -> Self {
        Self {
            username: String::default(),
            email: Missing,
            password: None,
            locale: DEFAULT_LOCALE.to_string(),
            is_admin: false,
            email_verified: false,
            avatar_url: None,
        }
    }

    /// Update `email` field on [`UserBuilder`].
    pub fn email(self, email: impl Into<String>) -> UserBuilder<Present<String>> {
        UserBuilder {
            username: self.username,
            email: Present(email.into()),
            password: self.password,
            locale: self.locale,
            is_admin: self.is_admin,
            email_verified: self.email_verified,
            avatar_url: self.avatar_url,
        }
    }
}

impl Default for UserBuilder<Missing> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Email> UserBuilder<Email> {
    /// Update `password` field on [`UserBuilder`]. Plain text, hashed on
    /// creation.
    pub fn password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Update `username` field on [`UserBuilder`], truncated to fit.
    pub fn username(mut self, username: impl AsRef<str>) -> Self {
        self.username = username
            .as_ref()
            .trim()
            .chars()
            .take(USERNAME_LENGTH)
            .collect();
        self
    }

    /// Update `locale` field on [`UserBuilder`].
    pub fn locale(mut self, locale: Option<String>) -> Self {
        self.locale = locale
            .filter(|locale| !locale.is_empty())
            .unwrap_or(DEFAULT_LOCALE.to_string());
        self
    }

    /// Update `is_admin` field on [`UserBuilder`].
    pub fn admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    /// Update `email_verified` field on [`UserBuilder`].
    pub fn verified(mut self, email_verified: bool) -> Self {
        self.email_verified = email_verified;
        self
    }

    /// Update `avatar_url` field on [`UserBuilder`].
    pub fn avatar_url(mut self, avatar_url: Option<String>) -> Self {
        self.avatar_url = avatar_url;
        self
    }
}

impl UserBuilder<Present<String>> {
    /// Hash the password, then insert the [`User`].
    pub async fn create(
        self,
        pwd: &PasswordManager,
        repo: &UserRepository,
    ) -> Result<User> {
        let password = self
            .password
            .map(|password| pwd.hash_password(password))
            .transpose()?;

        let user = NewUser {
            username: self.username,
            email: self.email.0,
            password,
            locale: self.locale,
            is_admin: self.is_admin,
            email_verified: self.email_verified,
            avatar_url: self.avatar_url,
        };

        repo.insert(&user).await
    }
}
