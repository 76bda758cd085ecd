//! HTTP API handlers and the extractors they share.
pub mod account;
pub mod api;
pub mod library;
pub mod mail;
pub mod oauth;
pub mod status;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::header;
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::token::Purpose;
use crate::user::{User, UserRepository};

const BEARER: &str = "Bearer ";

/// JSON body checked with [`validator`] before reaching the handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<T, S> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;

        Ok(Valid(value))
    }
}

/// Authenticated caller. Rejects with `401` without a valid bearer token.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

/// Caller, if authenticated.
#[derive(Debug, Clone, Default)]
pub struct Viewer(pub Option<User>);

/// Authenticated administrator. Rejects with `403` otherwise.
#[derive(Debug, Clone)]
pub struct Admin(pub User);

fn bearer(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .map(|token| token.replace(BEARER, "").trim().to_owned())
        .filter(|token| !token.is_empty())
}

/// Resolve the user behind an access token.
async fn authenticate(state: &AppState, token: &str) -> Result<User> {
    let claims = state
        .token
        .decode(token, Purpose::Access)
        .map_err(|_| ServerError::Unauthorized)?;
    let id = claims
        .sub
        .parse::<i64>()
        .map_err(|_| ServerError::Unauthorized)?;

    UserRepository::new(state.db.pool.clone())
        .find_by_id(id)
        .await?
        .ok_or(ServerError::Unauthorized)
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self> {
        let token = bearer(parts).ok_or(ServerError::Unauthorized)?;

        Ok(CurrentUser(authenticate(state, &token).await?))
    }
}

impl FromRequestParts<AppState> for Viewer {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self> {
        match bearer(parts) {
            Some(token) => Ok(Viewer(Some(authenticate(state, &token).await?))),
            None => Ok(Viewer(None)),
        }
    }
}

impl FromRequestParts<AppState> for Admin {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self> {
        let CurrentUser(user) =
            CurrentUser::from_request_parts(parts, state).await?;

        if !user.is_admin {
            return Err(ServerError::Forbidden("Permission denied.".into()));
        }

        Ok(Admin(user))
    }
}

/// Plain acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
}

pub fn message(message: impl Into<String>) -> Json<Message> {
    Json(Message {
        message: message.into(),
    })
}

/// State wired to a test database, with fast hashing and no mail queue.
#[cfg(test)]
pub(crate) fn state(pool: sqlx::SqlitePool) -> AppState {
    state_with(pool, crate::config::Configuration::default())
}

#[cfg(test)]
pub(crate) fn state_with(
    pool: sqlx::SqlitePool,
    config: crate::config::Configuration,
) -> AppState {
    use std::sync::Arc;

    use crate::crypto::{Crypto, light_argon2};

    let config = Arc::new(config);

    AppState {
        db: crate::database::Database::from(pool),
        crypto: Arc::new(
            Crypto::new(Some(light_argon2()), "test-secret", Some(light_argon2()))
                .unwrap(),
        ),
        token: crate::token::TokenManager::new(&config.url, "test-secret"),
        mail: crate::mail::MailManager::default(),
        limiter: Arc::new(crate::limiter(
            &config.rate_limiting,
            config.rate_limiting.requests,
        )),
        mail_limiter: Arc::new(crate::limiter(
            &config.rate_limiting,
            config.rate_limiting.mail,
        )),
        oauth: Arc::new(crate::oauth::OAuthClient::new(&config).unwrap()),
        metrics: None,
        config,
    }
}

/// Create an account directly, returning it with an access token.
#[cfg(test)]
pub(crate) async fn signed_up(
    state: &AppState,
    username: &str,
    verified: bool,
    admin: bool,
) -> (User, String) {
    let user = crate::user::UserBuilder::new()
        .email(format!("{username}@example.com"))
        .username(username)
        .password(Some("password".into()))
        .verified(verified)
        .admin(admin)
        .create(&state.crypto.pwd, &UserRepository::new(state.db.pool.clone()))
        .await
        .unwrap();
    let token = state.token.access(user.id).unwrap();

    (user, token)
}
