//! Sign in with Discord or Google.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::config::{self, Configuration};
use crate::error::Result;
use crate::user::{NewUser, User, UserRepository};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// External identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityProvider {
    Discord,
    Google,
}

impl IdentityProvider {
    /// Column holding the provider account ID.
    pub fn id_column(self) -> &'static str {
        match self {
            IdentityProvider::Discord => "discord_id",
            IdentityProvider::Google => "google_id",
        }
    }

    /// Public endpoints of the provider.
    pub fn endpoints(self) -> Endpoints {
        match self {
            IdentityProvider::Discord => Endpoints {
                authorize: "https://discord.com/oauth2/authorize".into(),
                token: "https://discord.com/api/oauth2/token".into(),
                profile: "https://discord.com/api/users/@me".into(),
            },
            IdentityProvider::Google => Endpoints {
                authorize: "https://accounts.google.com/o/oauth2/v2/auth".into(),
                token: "https://oauth2.googleapis.com/token".into(),
                profile: "https://openidconnect.googleapis.com/v1/userinfo".into(),
            },
        }
    }

    fn scope(self) -> &'static str {
        match self {
            IdentityProvider::Discord => "identify email",
            IdentityProvider::Google => "openid email profile",
        }
    }
}

impl fmt::Display for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdentityProvider::Discord => "discord",
            IdentityProvider::Google => "google",
        })
    }
}

impl FromStr for IdentityProvider {
    type Err = OAuthError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discord" => Ok(IdentityProvider::Discord),
            "google" => Ok(IdentityProvider::Google),
            _ => Err(OAuthError::UnknownProvider(s.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("unknown identity provider '{0}'")]
    UnknownProvider(String),
    #[error("{0} sign-in is not configured")]
    NotConfigured(IdentityProvider),
    #[error("OAuth state is invalid or expired")]
    InvalidState,
    #[error("{0} account already linked")]
    AlreadyLinked(IdentityProvider),
    #[error("no {0} account linked")]
    NotLinked(IdentityProvider),
    #[error("set a password before managing linked accounts")]
    PasswordRequired,
    #[error("identity provider did not share an email address")]
    MissingEmail,
    #[error("identity provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identity provider answered {0}")]
    Rejected(reqwest::StatusCode),
}

impl OAuthError {
    /// HTTP status matching the error.
    pub fn status(&self) -> StatusCode {
        match self {
            OAuthError::UnknownProvider(_) | OAuthError::NotConfigured(_) => {
                StatusCode::NOT_FOUND
            },
            OAuthError::InvalidState
            | OAuthError::AlreadyLinked(_)
            | OAuthError::NotLinked(_)
            | OAuthError::PasswordRequired
            | OAuthError::MissingEmail => StatusCode::BAD_REQUEST,
            OAuthError::Http(_) | OAuthError::Rejected(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// URLs used through the authorization code flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub authorize: String,
    pub token: String,
    pub profile: String,
}

#[derive(Debug, Clone)]
struct Client {
    credentials: config::OAuthClient,
    endpoints: Endpoints,
}

/// Account details shared by a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub email_verified: bool,
    pub avatar_url: Option<String>,
    pub locale: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
    email: Option<String>,
    #[serde(default)]
    verified: bool,
    avatar: Option<String>,
    locale: Option<String>,
}

impl From<DiscordUser> for Profile {
    fn from(user: DiscordUser) -> Self {
        Profile {
            avatar_url: user.avatar.map(|hash| {
                format!("https://cdn.discordapp.com/avatars/{}/{hash}.png", user.id)
            }),
            id: user.id,
            username: Some(user.username),
            email: user.email,
            email_verified: user.verified,
            locale: user.locale,
        }
    }
}

#[derive(Deserialize)]
struct GoogleUser {
    sub: String,
    name: Option<String>,
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    picture: Option<String>,
    locale: Option<String>,
}

impl From<GoogleUser> for Profile {
    fn from(user: GoogleUser) -> Self {
        Profile {
            id: user.sub,
            username: user.name,
            email: user.email,
            email_verified: user.email_verified,
            avatar_url: user.picture,
            locale: user.locale,
        }
    }
}

/// Authorization code flow against the configured providers.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    redirect_uri: String,
    discord: Option<Client>,
    google: Option<Client>,
}

impl OAuthClient {
    /// Create a new [`OAuthClient`] from configuration.
    pub fn new(config: &Configuration) -> std::result::Result<Self, OAuthError> {
        let client = |provider: IdentityProvider, credentials: &Option<config::OAuthClient>| {
            credentials.clone().map(|credentials| Client {
                credentials,
                endpoints: provider.endpoints(),
            })
        };

        Ok(Self {
            http: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            redirect_uri: config.redirect_uri(),
            discord: client(IdentityProvider::Discord, &config.oauth.discord),
            google: client(IdentityProvider::Google, &config.oauth.google),
        })
    }

    /// Point a configured provider at other endpoints.
    pub fn endpoints(mut self, provider: IdentityProvider, endpoints: Endpoints) -> Self {
        let client = match provider {
            IdentityProvider::Discord => &mut self.discord,
            IdentityProvider::Google => &mut self.google,
        };

        if let Some(client) = client {
            client.endpoints = endpoints;
        }

        self
    }

    fn client(&self, provider: IdentityProvider) -> std::result::Result<&Client, OAuthError> {
        match provider {
            IdentityProvider::Discord => self.discord.as_ref(),
            IdentityProvider::Google => self.google.as_ref(),
        }
        .ok_or(OAuthError::NotConfigured(provider))
    }

    /// Where the provider sends users back.
    pub fn callback_url(&self, provider: IdentityProvider) -> String {
        format!("{}/{provider}/callback", self.redirect_uri.trim_end_matches('/'))
    }

    /// URL starting the flow on the provider side.
    pub fn authorization_url(
        &self,
        provider: IdentityProvider,
        state: &str,
    ) -> Result<String> {
        let client = self.client(provider)?;
        let mut url = Url::parse(&client.endpoints.authorize)?;

        url.query_pairs_mut()
            .append_pair("client_id", &client.credentials.client_id)
            .append_pair("redirect_uri", &self.callback_url(provider))
            .append_pair("response_type", "code")
            .append_pair("scope", provider.scope())
            .append_pair("state", state);

        if provider == IdentityProvider::Google {
            url.query_pairs_mut()
                .append_pair("access_type", "offline")
                .append_pair("include_granted_scopes", "true");
        }

        Ok(url.into())
    }

    /// Trade an authorization code for an access token and the account
    /// profile.
    pub async fn exchange(
        &self,
        provider: IdentityProvider,
        code: &str,
    ) -> std::result::Result<(Profile, String), OAuthError> {
        let client = self.client(provider)?;
        let callback = self.callback_url(provider);

        let response = self
            .http
            .post(&client.endpoints.token)
            .form(&[
                ("client_id", client.credentials.client_id.as_str()),
                ("client_secret", client.credentials.client_secret.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", callback.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OAuthError::Rejected(response.status()));
        }
        let token = response.json::<TokenResponse>().await?.access_token;

        let response = self
            .http
            .get(&client.endpoints.profile)
            .bearer_auth(&token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OAuthError::Rejected(response.status()));
        }

        let profile = match provider {
            IdentityProvider::Discord => response.json::<DiscordUser>().await?.into(),
            IdentityProvider::Google => response.json::<GoogleUser>().await?.into(),
        };

        Ok((profile, token))
    }
}

/// Find or create the account behind a provider profile, then link it.
///
/// Lookup order is the provider ID, the email, then the user linking the
/// account. Empty fields are filled from the profile.
pub async fn sign_in(
    repo: &UserRepository,
    provider: IdentityProvider,
    profile: Profile,
    token: String,
    linking: Option<User>,
    admins: &[String],
) -> Result<User> {
    let mut user = match repo.find_by_provider(provider, &profile.id).await? {
        Some(user) => user,
        None => match profile.email.as_deref() {
            Some(email) => repo.find_by_email(email).await?,
            None => None,
        }
        .or(linking)
        .unwrap_or_default(),
    };

    if user.id == 0 {
        let email = profile.email.clone().ok_or(OAuthError::MissingEmail)?;
        let username = profile
            .username
            .clone()
            .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_owned());

        user = repo
            .insert(&NewUser {
                username,
                email,
                locale: profile
                    .locale
                    .clone()
                    .unwrap_or_else(|| crate::user::DEFAULT_LOCALE.into()),
                ..Default::default()
            })
            .await?;

        tracing::info!(user_id = user.id, %provider, "user created through oauth");
    }

    if user.username.is_empty() {
        user.username = profile.username.unwrap_or_default();
    }
    if user.avatar_url.is_none() {
        user.avatar_url = profile.avatar_url;
    }
    if user.locale.is_empty() {
        user.locale = profile.locale.unwrap_or_default();
    }
    if provider == IdentityProvider::Google {
        user.email_verified |= profile.email_verified;
    }
    user.is_admin |= admins.iter().any(|admin| admin.eq_ignore_ascii_case(&user.email));
    user.link(provider, profile.id, token);

    repo.update(&user).await?;

    Ok(user)
}
