//! Resend emailed links, behind their own rate limiter.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router, middleware};

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::mail::Template;
use crate::router::account::send_link;
use crate::router::{Message, message};
use crate::user::UserRepository;

const RESET_LIFETIME: Duration = Duration::from_secs(30 * 60);
const VERIFY_LIFETIME: Duration = Duration::from_secs(60 * 60);

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `POST /mail/reset_password/{email}` goes to `reset_password`.
        .route("/reset_password/{email}", post(reset_password))
        // `POST /mail/verify_email/{email}` goes to `verify_email`.
        .route("/verify_email/{email}", post(verify_email))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.mail_limiter),
            lexica_limits::axum::rate_limiter,
        ))
}

/// Send a password reset link.
async fn reset_password(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<Message>> {
    let user = UserRepository::new(state.db.pool.clone())
        .find_by_email(&email)
        .await?
        .ok_or(ServerError::NotFound("Email"))?;

    send_link(&state, Template::ResetPassword, &user, RESET_LIFETIME).await?;

    tracing::debug!(user_id = user.id, "password reset mail sent");

    Ok(message("Password reset email sent."))
}

/// Send an email verification link.
async fn verify_email(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<Message>> {
    let user = UserRepository::new(state.db.pool.clone())
        .find_by_email(&email)
        .await?
        .ok_or(ServerError::NotFound("Email"))?;

    if user.email_verified {
        return Err(ServerError::BadRequest("Email already verified.".into()));
    }

    send_link(&state, Template::VerifyEmail, &user, VERIFY_LIFETIME).await?;

    tracing::debug!(user_id = user.id, "verification mail sent");

    Ok(message("Email verification sent."))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode, header};
    use sqlx::SqlitePool;

    use crate::router::{signed_up, state};
    use crate::{app, make_request};

    #[sqlx::test]
    async fn test_unknown_email(pool: SqlitePool) {
        let app = app(state(pool));

        let response = make_request(
            app,
            Method::POST,
            "/mail/reset_password/nobody@example.com",
            String::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[sqlx::test]
    async fn test_mail_limiter(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());
        signed_up(&state, "reader", true, false).await;

        let response = make_request(
            app.clone(),
            Method::POST,
            "/mail/reset_password/reader@example.com",
            String::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = make_request(
            app.clone(),
            Method::POST,
            "/mail/reset_password/reader@example.com",
            String::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        // Other routes only see the global limiter.
        let response =
            make_request(app, Method::GET, "/status.json", String::new(), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[sqlx::test]
    async fn test_already_verified(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());
        signed_up(&state, "reader", true, false).await;

        let response = make_request(
            app,
            Method::POST,
            "/mail/verify_email/reader@example.com",
            String::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
