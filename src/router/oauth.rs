//! Discord and Google sign in, plus account linking.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::oauth::{IdentityProvider, OAuthError, sign_in};
use crate::router::account::TokenResponse;
use crate::router::{CurrentUser, Message, Viewer, message};
use crate::user::UserRepository;

/// Lifetime of the `state` parameter of a flow.
const STATE_LIFETIME: Duration = Duration::from_secs(10 * 60);
const NONCE_LENGTH: usize = 16;

pub fn router() -> Router<AppState> {
    Router::new()
        // `GET /oauth/{provider}` starts a flow, `DELETE` unlinks.
        .route("/oauth/{provider}", get(authorize).delete(unlink))
        // `GET /oauth/{provider}/callback` is where providers send users back.
        .route("/oauth/{provider}/callback", get(callback))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Authorization {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

/// Content sealed into the `state` parameter.
#[derive(Debug, PartialEq, Eq)]
struct FlowState {
    provider: IdentityProvider,
    /// Account being linked, if the flow started signed in.
    user_id: Option<i64>,
}

impl FlowState {
    fn encode(&self) -> String {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();

        format!("{}:{}:{nonce}", self.provider, self.user_id.unwrap_or_default())
    }

    fn decode(message: &str) -> Option<Self> {
        let mut parts = message.splitn(3, ':');
        let provider = parts.next()?.parse().ok()?;
        let user_id = parts.next()?.parse::<i64>().ok()?;
        parts.next()?;

        Some(Self {
            provider,
            user_id: (user_id != 0).then_some(user_id),
        })
    }
}

/// Handler of `GET /oauth/{provider}`.
async fn authorize(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(provider): Path<String>,
) -> Result<Json<Authorization>> {
    let provider: IdentityProvider = provider.parse()?;

    if let Some(user) = &viewer {
        if user.provider_id(provider).is_some() {
            return Err(OAuthError::AlreadyLinked(provider).into());
        }
        if !user.has_password() {
            return Err(OAuthError::PasswordRequired.into());
        }
    }

    let flow = FlowState {
        provider,
        user_id: viewer.map(|user| user.id),
    };
    let sealed = state.crypto.vault.issue(&flow.encode(), Some(STATE_LIFETIME))?;

    Ok(Json(Authorization {
        url: state.oauth.authorization_url(provider, &sealed)?,
    }))
}

/// Handler of `GET /oauth/{provider}/callback`.
async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<TokenResponse>> {
    let provider: IdentityProvider = provider.parse()?;

    let flow = state
        .crypto
        .vault
        .consume(&query.state)
        .as_deref()
        .and_then(FlowState::decode)
        .filter(|flow| flow.provider == provider)
        .ok_or(OAuthError::InvalidState)?;

    let repo = UserRepository::new(state.db.pool.clone());
    let linking = match flow.user_id {
        Some(id) => Some(
            repo.find_by_id(id)
                .await?
                .ok_or(ServerError::NotFound("User"))?,
        ),
        None => None,
    };

    let (profile, token) = state.oauth.exchange(provider, &query.code).await?;
    let user = sign_in(&repo, provider, profile, token, linking, &state.config.admins).await?;

    tracing::info!(user_id = user.id, %provider, "signed in through oauth");

    Ok(Json(TokenResponse::access(&state, &user)?))
}

/// Handler of `DELETE /oauth/{provider}`.
async fn unlink(
    State(state): State<AppState>,
    CurrentUser(mut user): CurrentUser,
    Path(provider): Path<String>,
) -> Result<Json<Message>> {
    let provider: IdentityProvider = provider.parse()?;

    if !user.has_password() {
        return Err(OAuthError::PasswordRequired.into());
    }
    if user.provider_id(provider).is_none() {
        return Err(OAuthError::NotLinked(provider).into());
    }

    user.unlink(provider);
    UserRepository::new(state.db.pool.clone())
        .update(&user)
        .await?;

    tracing::info!(user_id = user.id, %provider, "oauth account unlinked");

    Ok(message(format!("{provider} account unlinked.")))
}
