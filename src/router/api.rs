//! JSON API of the signed in user: settings, favorites and current library.

use std::net::SocketAddr;
use std::time::SystemTime;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use lexica_limits::axum::client_ip;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::AppState;
use crate::avatar::save_avatar;
use crate::error::{Result, ServerError};
use crate::library::LibraryRepository;
use crate::router::{Admin, CurrentUser, Message, Valid, Viewer, message};
use crate::sentence::SentenceRepository;
use crate::user::{User, UserRepository};

/// Name of the cookie holding the library of anonymous visitors.
pub const LIBRARY_COOKIE: &str = "current_library";
const LIBRARY_COOKIE_AGE: u64 = 60 * 60 * 24 * 30;

pub fn router(state: AppState) -> Router<AppState> {
    let avatar_limit = state.config.defaults.max_avatar_size + 1024;

    Router::new()
        // `GET|PATCH|DELETE /api/user`. Authorization required.
        .route("/user", get(user).patch(update_user).delete(delete_user))
        // `PUT /api/user/avatar` takes raw image bytes.
        .route(
            "/user/avatar",
            put(update_avatar).layer(DefaultBodyLimit::max(avatar_limit)),
        )
        .route("/change_user_library/{name}", put(change_library))
        .route("/library/{name}", delete(delete_library))
        .route("/favorites", get(favorites))
        .route("/favorites/{name}", put(toggle_favorite))
        .route("/statistics", get(statistics))
        .route("/admin/rate_limit_stats", get(rate_limit_stats))
}

/// Account as seen by its owner.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub email_verified: bool,
    pub is_admin: bool,
    pub bio: Option<String>,
    pub library: Option<String>,
    pub avatar_url: Option<String>,
    pub locale: String,
    pub link_discord: bool,
    pub link_google: bool,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            link_discord: user.discord_id.is_some(),
            link_google: user.google_id.is_some(),
            id: user.id,
            username: user.username,
            email: user.email,
            email_verified: user.email_verified,
            is_admin: user.is_admin,
            bio: user.bio,
            library: user.current_library,
            avatar_url: user.avatar_url,
            locale: user.locale,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct UpdateBody {
    #[validate(length(
        min = 3,
        max = 30,
        message = "Username must be 3 to 30 characters long."
    ))]
    pub username: Option<String>,
    #[validate(length(max = 75, message = "Bio must be at most 75 characters long."))]
    pub bio: Option<String>,
    pub current_password: Option<String>,
    #[validate(length(
        min = 6,
        max = 20,
        message = "Password must be 6 to 20 characters long."
    ))]
    pub new_password: Option<String>,
    pub confirm_password: Option<String>,
}

async fn user(CurrentUser(user): CurrentUser) -> Json<UserInfo> {
    Json(user.into())
}

async fn update_user(
    State(state): State<AppState>,
    CurrentUser(mut user): CurrentUser,
    Valid(body): Valid<UpdateBody>,
) -> Result<Json<UserInfo>> {
    let mut errors = ValidationErrors::new();
    let repo = UserRepository::new(state.db.pool.clone());

    if let Some(username) = body.username {
        user.username = username.trim().to_owned();
    }

    if let Some(bio) = body.bio {
        user.bio = Some(bio.trim().to_owned());
    }

    let mut password = None;
    if let Some(new_password) = body.new_password {
        if let Some(phc) = user.password.as_deref() {
            match body.current_password.as_deref() {
                Some(current)
                    if state.crypto.pwd.verify_password(current.trim(), phc) => {},
                Some(_) => errors.add(
                    "current_password",
                    ValidationError::new("password")
                        .with_message("Current password is incorrect.".into()),
                ),
                None => errors.add(
                    "current_password",
                    ValidationError::new("required")
                        .with_message("Please enter your current password.".into()),
                ),
            }
        }

        if body.confirm_password.as_deref().map(str::trim) != Some(new_password.trim()) {
            errors.add(
                "confirm_password",
                ValidationError::new("must_match").with_message(
                    "New password and confirmation do not match.".into(),
                ),
            );
        }

        password = Some(new_password.trim().to_owned());
    }

    if !errors.is_empty() {
        return Err(ServerError::Validation(errors));
    }

    if let Some(password) = password {
        let phc = state.crypto.pwd.hash_password(password)?;
        repo.set_password(user.id, &phc).await?;
        user.password = Some(phc);
    }
    repo.update(&user).await?;

    tracing::debug!(user_id = user.id, "user settings updated");

    Ok(Json(user.into()))
}

async fn delete_user(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Message>> {
    UserRepository::new(state.db.pool.clone())
        .delete(user.id)
        .await?;

    Ok(message("Account deleted successfully."))
}

async fn update_avatar(
    State(state): State<AppState>,
    CurrentUser(mut user): CurrentUser,
    body: Bytes,
) -> Result<Json<UserInfo>> {
    let filename = save_avatar(
        &state.config.defaults.avatar_dir,
        &user.email,
        &body,
        state.config.defaults.max_avatar_size,
    )
    .await?;

    user.avatar_url = Some(format!("{}static/avatars/{filename}", state.config.url));
    UserRepository::new(state.db.pool.clone())
        .update(&user)
        .await?;

    Ok(Json(user.into()))
}

/// Select the studied library. Anonymous visitors get a cookie instead.
async fn change_library(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(name): Path<String>,
) -> Result<Response> {
    let library = LibraryRepository::new(state.db.pool.clone())
        .find_by_name(&name)
        .await?
        .filter(|library| library.is_visible_to(viewer.as_ref()))
        .ok_or(ServerError::NotFound("Library"))?;

    match viewer {
        Some(user) => {
            UserRepository::new(state.db.pool.clone())
                .set_current_library(user.id, Some(library.name.as_str()))
                .await?;

            Ok(message("Library changed successfully.").into_response())
        },
        None => {
            let value: String =
                url::form_urlencoded::byte_serialize(library.name.as_bytes()).collect();
            let cookie = format!(
                "{LIBRARY_COOKIE}={value}; Max-Age={LIBRARY_COOKIE_AGE}; Path=/; SameSite=Lax"
            );

            Ok((
                [(header::SET_COOKIE, cookie)],
                message("Library changed successfully."),
            )
                .into_response())
        },
    }
}

async fn delete_library(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
) -> Result<Json<Message>> {
    let libraries = LibraryRepository::new(state.db.pool.clone());
    let library = libraries
        .find_by_name(&name)
        .await?
        .ok_or(ServerError::NotFound("Library"))?;

    if !library.is_managed_by(&user) {
        tracing::warn!(user_id = user.id, library = %library.name, "library deletion refused");
        return Err(ServerError::Forbidden("Permission denied.".into()));
    }

    libraries.delete(library.id).await?;
    UserRepository::new(state.db.pool.clone())
        .rename_current_library(&library.name, None)
        .await?;

    tracing::info!(user_id = user.id, library = %library.name, "library deleted");

    Ok(message("Library deleted successfully."))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Favorites {
    pub favorite_ids: Vec<i64>,
}

async fn favorites(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Favorites>> {
    let favorite_ids = LibraryRepository::new(state.db.pool.clone())
        .favorite_ids(user.id)
        .await?;

    Ok(Json(Favorites { favorite_ids }))
}

async fn toggle_favorite(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
) -> Result<Json<Message>> {
    let libraries = LibraryRepository::new(state.db.pool.clone());
    let library = libraries
        .find_by_name(&name)
        .await?
        .filter(|library| library.is_visible_to(Some(&user)))
        .ok_or(ServerError::NotFound("Library"))?;

    if libraries.toggle_favorite(user.id, library.id).await? {
        Ok(message("Added to favorites."))
    } else {
        Ok(message("Removed from favorites."))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Statistics {
    pub users: i64,
    pub words: i64,
    pub libraries: i64,
    pub sentences: i64,
}

async fn statistics(State(state): State<AppState>) -> Result<Json<Statistics>> {
    let libraries = LibraryRepository::new(state.db.pool.clone());

    Ok(Json(Statistics {
        users: UserRepository::new(state.db.pool.clone()).count().await?,
        words: libraries.count_words().await?,
        libraries: libraries.count().await?,
        sentences: SentenceRepository::new(state.db.pool.clone())
            .count()
            .await?,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IpStats {
    pub ip: String,
    pub requests_minute: usize,
    pub requests_hour: usize,
    pub requests_day: usize,
    pub banned: bool,
    pub ban_until: Option<String>,
    pub whitelisted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BannedIp {
    pub ip: String,
    pub ban_until: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub current_ip_stats: IpStats,
    pub banned_ips: Vec<BannedIp>,
    pub total_banned_ips: usize,
    pub rate_limiting_enabled: bool,
}

fn timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}

async fn rate_limit_stats(
    State(state): State<AppState>,
    Admin(_): Admin,
    req: Request,
) -> Json<RateLimitStats> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let stats = state.limiter.stats(&client_ip(req.headers(), peer));

    let banned_ips: Vec<BannedIp> = state
        .limiter
        .banned()
        .into_iter()
        .map(|(ip, until)| BannedIp {
            ip,
            ban_until: timestamp(until),
        })
        .collect();

    Json(RateLimitStats {
        current_ip_stats: IpStats {
            ip: stats.ip,
            requests_minute: stats.requests_minute,
            requests_hour: stats.requests_hour,
            requests_day: stats.requests_day,
            banned: stats.banned_until.is_some(),
            ban_until: stats.banned_until.map(timestamp),
            whitelisted: stats.whitelisted,
        },
        total_banned_ips: banned_ips.len(),
        banned_ips,
        rate_limiting_enabled: state.limiter.is_enabled(),
    })
}
