//! Local accounts: registration, login and emailed links.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::library::{LibraryRepository, LibrarySummary};
use crate::mail::{Link, Template};
use crate::router::{Message, Valid, message};
use crate::token::{ACCESS_LIFETIME, Purpose};
use crate::user::{User, UserBuilder, UserRepository};

pub const TOKEN_TYPE: &str = "Bearer";
const VERIFY_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24);
const RESET_LIFETIME: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RegisterBody {
    #[validate(length(
        min = 1,
        max = 30,
        message = "Username must be 1 to 30 characters long."
    ))]
    pub username: String,
    #[validate(
        email(message = "Invalid email format."),
        length(max = 60, message = "Email must be at most 60 characters long.")
    )]
    pub email: String,
    #[validate(length(
        min = 6,
        max = 20,
        message = "Password must be 6 to 20 characters long."
    ))]
    pub password: String,
    #[validate(must_match(other = "password", message = "Passwords do not match."))]
    pub confirm: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct LoginBody {
    #[validate(email(message = "Invalid email format."))]
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ForgotBody {
    #[validate(email(message = "Invalid email format."))]
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ResetBody {
    #[validate(length(
        min = 6,
        max = 20,
        message = "Password must be 6 to 20 characters long."
    ))]
    pub new_password: String,
    #[validate(must_match(
        other = "new_password",
        message = "Passwords do not match."
    ))]
    pub confirm_password: String,
}

/// Access token handed out after a sign in.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token_type: String,
    pub token: String,
    pub expires_in: u64,
}

impl TokenResponse {
    pub fn access(state: &AppState, user: &User) -> Result<Self> {
        Ok(Self {
            token_type: TOKEN_TYPE.to_owned(),
            token: state.token.access(user.id)?,
            expires_in: ACCESS_LIFETIME.as_secs(),
        })
    }
}

/// Public part of an account.
#[derive(Debug, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub created_at: NaiveDateTime,
    pub libraries: Vec<LibrarySummary>,
}

/// Mail a signed link to `user`. The link subject is the email address.
pub(crate) async fn send_link(
    state: &AppState,
    template: Template,
    user: &User,
    lifetime: Duration,
) -> Result<()> {
    let (purpose, route) = match template {
        Template::ResetPassword => (Purpose::ResetPassword, "reset_password"),
        Template::VerifyEmail => (Purpose::VerifyEmail, "verify_email"),
        Template::Welcome => {
            return Ok(state.mail.publish_event(template, user, None).await?);
        },
    };

    let token = state.token.create(&user.email, purpose, lifetime)?;
    let url = format!("{}{route}/{token}", state.config.url);

    state
        .mail
        .publish_event(template, user, Some(Link { url: &url, lifetime }))
        .await?;

    Ok(())
}

/// Handler of `POST /register`.
pub async fn register(
    State(state): State<AppState>,
    Valid(body): Valid<RegisterBody>,
) -> Result<(StatusCode, Json<TokenResponse>)> {
    let repo = UserRepository::new(state.db.pool.clone());
    let email = body.email.trim();

    if repo.find_by_email(email).await?.is_some() {
        tracing::warn!(%email, "email already registered");
        return Err(ServerError::Conflict("Email already registered.".into()));
    }

    let is_admin = state
        .config
        .admins
        .iter()
        .any(|admin| admin.eq_ignore_ascii_case(email));

    let user = UserBuilder::new()
        .email(email)
        .username(body.username.trim())
        .password(Some(body.password))
        .admin(is_admin)
        .create(&state.crypto.pwd, &repo)
        .await?;

    // The account is committed; mail failures are only logged.
    if let Err(err) =
        send_link(&state, Template::VerifyEmail, &user, VERIFY_LIFETIME).await
    {
        tracing::error!(user_id = user.id, error = %err, "verification mail not sent");
    }

    tracing::debug!(user_id = user.id, "user registered");

    Ok((
        StatusCode::CREATED,
        Json(TokenResponse::access(&state, &user)?),
    ))
}

/// Handler of `POST /login`.
pub async fn login(
    State(state): State<AppState>,
    Valid(body): Valid<LoginBody>,
) -> Result<Json<TokenResponse>> {
    let repo = UserRepository::new(state.db.pool.clone());

    let Some(user) = repo.find_by_email(&body.email).await? else {
        tracing::warn!(email = %body.email, "login attempt with unregistered email");
        return Err(ServerError::InvalidCredentials);
    };

    let Some(phc) = user.password.as_deref() else {
        return Err(ServerError::BadRequest(
            "This account uses OAuth for login. Please use the OAuth login method."
                .into(),
        ));
    };

    if !state.crypto.pwd.verify_password(&body.password, phc) {
        tracing::warn!(user_id = user.id, "failed login attempt");
        return Err(ServerError::InvalidCredentials);
    }

    Ok(Json(TokenResponse::access(&state, &user)?))
}

/// Handler of `POST /forgot_password`.
pub async fn forgot_password(
    State(state): State<AppState>,
    Valid(body): Valid<ForgotBody>,
) -> Result<Json<Message>> {
    let user = UserRepository::new(state.db.pool.clone())
        .find_by_email(&body.email)
        .await?
        .ok_or_else(|| {
            ServerError::BadRequest("No account associated with this email.".into())
        })?;

    send_link(&state, Template::ResetPassword, &user, RESET_LIFETIME).await?;

    Ok(message("Password reset link sent. Please check your email."))
}

/// Handler of `POST /reset_password/{token}`.
pub async fn reset_password(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Valid(body): Valid<ResetBody>,
) -> Result<Json<Message>> {
    let claims = state
        .token
        .decode(token.trim(), Purpose::ResetPassword)
        .map_err(|_| ServerError::InvalidToken)?;

    let repo = UserRepository::new(state.db.pool.clone());
    let user = repo
        .find_by_email(&claims.sub)
        .await?
        .ok_or_else(|| ServerError::BadRequest("User not found.".into()))?;

    let phc = state.crypto.pwd.hash_password(&body.new_password)?;
    repo.set_password(user.id, &phc).await?;

    tracing::debug!(user_id = user.id, "password reset");

    Ok(message("Password updated."))
}

/// Handler of `GET /verify_email/{token}`.
pub async fn verify_email(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Message>> {
    let claims = state
        .token
        .decode(token.trim(), Purpose::VerifyEmail)
        .map_err(|_| ServerError::InvalidToken)?;

    let repo = UserRepository::new(state.db.pool.clone());
    let user = repo
        .find_by_email(&claims.sub)
        .await?
        .ok_or_else(|| ServerError::BadRequest("User not found.".into()))?;

    if user.email_verified {
        return Ok(message("Email already verified."));
    }

    repo.verify_email(&user.email).await?;

    if let Err(err) = state.mail.publish_event(Template::Welcome, &user, None).await {
        tracing::warn!(user_id = user.id, error = %err, "welcome mail not sent");
    }

    Ok(message("Email verified successfully."))
}

/// Handler of `GET /profile/{id}`.
pub async fn profile(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Profile>> {
    let user = UserRepository::new(state.db.pool.clone())
        .find_by_id(id)
        .await?
        .ok_or(ServerError::NotFound("User"))?;
    let libraries = LibraryRepository::new(state.db.pool.clone())
        .list_public_by_author(user.id)
        .await?;

    Ok(Json(Profile {
        username: user.username,
        avatar_url: user.avatar_url,
        bio: user.bio,
        created_at: user.created_at,
        libraries,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use http_body_util::BodyExt;
    use serde_json::json;
    use sqlx::SqlitePool;

    use super::*;
    use crate::mail::MailManager;
    use crate::router::{signed_up, state};
    use crate::{app, make_request};

    fn registration(email: &str) -> String {
        json!({
            "username": "learner",
            "email": email,
            "password": "secret1",
            "confirm": "secret1",
        })
        .to_string()
    }

    #[sqlx::test]
    async fn test_register(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());

        let response = make_request(
            app.clone(),
            Method::POST,
            "/register",
            registration("learner@example.com"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: TokenResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.token_type, TOKEN_TYPE);
        assert_eq!(body.expires_in, ACCESS_LIFETIME.as_secs());

        let claims = state.token.decode(&body.token, Purpose::Access).unwrap();
        let user = UserRepository::new(state.db.pool.clone())
            .find_by_email("learner@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claims.sub, user.id.to_string());
        assert!(!user.email_verified);

        let response = make_request(
            app,
            Method::POST,
            "/register",
            registration("LEARNER@example.com"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[sqlx::test]
    async fn test_register_without_mail_queue(pool: SqlitePool) {
        let mut state = state(pool);
        state.mail = MailManager::unreachable();
        let app = app(state.clone());

        let response = make_request(
            app,
            Method::POST,
            "/register",
            registration("learner@example.com"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        assert!(
            UserRepository::new(state.db.pool.clone())
                .find_by_email("learner@example.com")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[sqlx::test]
    async fn test_register_validation(pool: SqlitePool) {
        let app = app(state(pool));

        let body = json!({
            "username": "learner",
            "email": "learner@example.com",
            "password": "secret1",
            "confirm": "secret2",
        });
        let response =
            make_request(app.clone(), Method::POST, "/register", body.to_string(), None)
                .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = make_request(
            app,
            Method::POST,
            "/register",
            registration("not-an-email"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    async fn test_login(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());
        signed_up(&state, "reader", true, false).await;
        UserBuilder::new()
            .email("oauth@example.com")
            .username("oauth")
            .create(&state.crypto.pwd, &UserRepository::new(state.db.pool.clone()))
            .await
            .unwrap();

        let login = |email: &str, password: &str| {
            json!({ "email": email, "password": password }).to_string()
        };

        let response = make_request(
            app.clone(),
            Method::POST,
            "/login",
            login("reader@example.com", "password"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = make_request(
            app.clone(),
            Method::POST,
            "/login",
            login("reader@example.com", "wrong"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = make_request(
            app.clone(),
            Method::POST,
            "/login",
            login("nobody@example.com", "password"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = make_request(
            app,
            Method::POST,
            "/login",
            login("oauth@example.com", "password"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    async fn test_reset_password(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());
        let (user, _) = signed_up(&state, "reader", true, false).await;

        let response = make_request(
            app.clone(),
            Method::POST,
            "/forgot_password",
            json!({ "email": "nobody@example.com" }).to_string(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = make_request(
            app.clone(),
            Method::POST,
            "/forgot_password",
            json!({ "email": user.email }).to_string(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json!({ "new_password": "changed", "confirm_password": "changed" })
            .to_string();
        let verify = state
            .token
            .create(&user.email, Purpose::VerifyEmail, RESET_LIFETIME)
            .unwrap();
        let response = make_request(
            app.clone(),
            Method::POST,
            &format!("/reset_password/{verify}"),
            body.clone(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let reset = state
            .token
            .create(&user.email, Purpose::ResetPassword, RESET_LIFETIME)
            .unwrap();
        let response = make_request(
            app.clone(),
            Method::POST,
            &format!("/reset_password/{reset}"),
            body,
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = make_request(
            app,
            Method::POST,
            "/login",
            json!({ "email": user.email, "password": "changed" }).to_string(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[sqlx::test]
    async fn test_verify_email(pool: SqlitePool) {
        let mut state = state(pool);
        let (mail, outbox) = MailManager::memory();
        state.mail = mail;
        let app = app(state.clone());
        let (user, _) = signed_up(&state, "reader", false, false).await;

        let response = make_request(
            app.clone(),
            Method::GET,
            "/verify_email/garbage",
            String::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let token = state
            .token
            .create(&user.email, Purpose::VerifyEmail, VERIFY_LIFETIME)
            .unwrap();
        for _ in 0..2 {
            let response = make_request(
                app.clone(),
                Method::GET,
                &format!("/verify_email/{token}"),
                String::new(),
                None,
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let stored = UserRepository::new(state.db.pool.clone())
            .find_by_id(user.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.email_verified);

        // Welcomed once, on the first confirmation only.
        assert_eq!(
            *outbox.lock().unwrap(),
            vec![(Template::Welcome, user.email.clone())]
        );
    }

    #[sqlx::test]
    async fn test_profile(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());
        let (user, _) = signed_up(&state, "reader", true, false).await;

        let response = make_request(
            app.clone(),
            Method::GET,
            &format!("/profile/{}", user.id),
            String::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["username"], "reader");
        assert_eq!(body["libraries"], json!([]));
        assert!(body.get("email").is_none());

        let response = make_request(
            app,
            Method::GET,
            &format!("/profile/{}", user.id + 1),
            String::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
