//! Lexica serves vocabulary libraries and fill-in-the-blank quizzes whose
//! sentences are written in the background by language models.
#![forbid(unsafe_code)]

pub mod avatar;
pub mod bootstrap;
pub mod config;
mod crypto;
pub mod database;
pub mod error;
pub mod generator;
pub mod library;
mod mail;
pub mod oauth;
mod router;
pub mod sentence;
pub mod telemetry;
mod token;
pub mod user;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post};
use axum::{Router, middleware};
use lexica_limits::RateLimiter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use crate::config::ConfigError;
use crate::router::account;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    body: String,
    token: Option<&str>,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub db: database::Database,
    pub crypto: Arc<crypto::Crypto>,
    pub token: token::TokenManager,
    pub mail: mail::MailManager,
    /// Limiter applied to every route.
    pub limiter: Arc<RateLimiter>,
    /// Stricter limiter of the mail resend routes.
    pub mail_limiter: Arc<RateLimiter>,
    pub oauth: Arc<oauth::OAuthClient>,
    pub metrics: Option<PrometheusHandle>,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE, Method::OPTIONS])
                .allow_headers(Any),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        .route("/metrics", get(router::status::metrics))
        .route("/register", post(account::register))
        .route("/login", post(account::login))
        .route("/forgot_password", post(account::forgot_password))
        .route("/reset_password/{token}", post(account::reset_password))
        .route("/verify_email/{token}", get(account::verify_email))
        .route("/profile/{id}", get(account::profile))
        .merge(router::library::router())
        .merge(router::oauth::router())
        .nest("/api", router::api::router(state.clone()))
        .nest("/mail", router::mail::router(state.clone()))
        .nest_service(
            "/static/avatars",
            ServeDir::new(&state.config.defaults.avatar_dir),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiter),
            lexica_limits::axum::rate_limiter,
        ))
        .route_layer(middleware::from_fn(telemetry::track))
        .with_state(state)
        .layer(middleware)
}

fn limiter(
    config: &config::RateLimiting,
    ceilings: config::Ceilings,
) -> RateLimiter {
    RateLimiter::new(
        ceilings.into(),
        Duration::from_secs(config.ban_duration_minutes * 60),
    )
    .enabled(config.enabled)
    .whitelist(config.whitelist_ips.iter().cloned())
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>>
{
    // read configuration file. let it in memory.
    let config = config::Configuration::default()
        .path(std::env::var("CONFIG_PATH").unwrap_or_default().into())
        .read()?;

    let db = database::Database::new(
        &config.database.url,
        config.database.pool_size,
    )
    .await?;

    // seal OAuth states and sign JWTs with the same secret.
    let secret = std::env::var("SECRET_KEY")
        .map_err(|_| ConfigError::MissingEnv("SECRET_KEY"))?;
    let crypto =
        Arc::new(crypto::Crypto::new(config.argon2.clone(), &secret, None)?);
    let token = token::TokenManager::new(&config.url, &secret);

    // handle mail sender.
    let mail = if let Some(cfg) = &config.mail {
        mail::MailManager::new(cfg).await?
    } else {
        tracing::warn!("missing `mail` entry on `config.yaml` file, mails are disabled");
        mail::MailManager::default()
    };

    let metrics = match telemetry::setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "metrics recorder not installed");
            None
        },
    };

    Ok(AppState {
        limiter: Arc::new(limiter(&config.rate_limiting, config.rate_limiting.requests)),
        mail_limiter: Arc::new(limiter(&config.rate_limiting, config.rate_limiting.mail)),
        oauth: Arc::new(oauth::OAuthClient::new(&config)?),
        config,
        db,
        crypto,
        token,
        mail,
        metrics,
    })
}

/// Create the system user and load bundled libraries.
pub async fn seed(state: &AppState) -> error::Result<()> {
    let users = user::UserRepository::new(state.db.pool.clone());

    bootstrap::init_system_user(
        &users,
        &state.crypto.pwd,
        &state.config.system,
        std::env::var("SYSTEM_PASSWORD").ok(),
    )
    .await?;
    bootstrap::load_libraries(
        &state.config.defaults.library_dir,
        &library::LibraryRepository::new(state.db.pool.clone()),
        &users,
    )
    .await?;

    Ok(())
}

/// Start the sentence generator when enabled. `APIKEYS` holds the
/// comma-separated provider keys.
pub fn spawn_generator(state: &AppState) -> Option<JoinHandle<()>> {
    let config = &state.config.generator;
    if !config.enabled {
        tracing::info!("sentence generator disabled");
        return None;
    }

    let keys = std::env::var("APIKEYS").unwrap_or_default();
    match generator::Generator::from_config(state.db.pool.clone(), config, &keys) {
        Ok(generator) => Some(generator.spawn()),
        Err(err) => {
            tracing::error!(error = %err, "sentence generator not started");
            None
        },
    }
}

/// Periodically forget idle addresses and expired bans.
pub fn spawn_limiter_sweeper(state: &AppState) -> JoinHandle<()> {
    let limiters = [Arc::clone(&state.limiter), Arc::clone(&state.mail_limiter)];

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            ticker.tick().await;
            for limiter in &limiters {
                limiter.sweep();
            }
        }
    })
}
