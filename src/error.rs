//! Error handler for lexica.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Image(#[from] crate::avatar::ImageError),

    #[error(transparent)]
    OAuth(#[from] crate::oauth::OAuthError),

    #[error(transparent)]
    Mail(#[from] crate::mail::MailError),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid email or password.")]
    InvalidCredentials,

    #[error("The link is invalid or has expired.")]
    InvalidToken,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found.")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    LimitReached(String),

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid 'Authorization' header")]
    Unauthorized,
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/problem+json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue
                    .message
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| issue.code.to_string()),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },

            ServerError::Sql(SQLxError::RowNotFound) => response
                .title("Resource not found.")
                .details("Resource not found.")
                .status(StatusCode::NOT_FOUND),

            ServerError::Sql(err)
                if err
                    .as_database_error()
                    .is_some_and(|e| e.is_unique_violation()) =>
            {
                response
                    .title("Resource already exists.")
                    .details("Resource already exists.")
                    .status(StatusCode::CONFLICT)
            },

            ServerError::InvalidCredentials | ServerError::Unauthorized => {
                response
                    .title("Authentication failed.")
                    .status(StatusCode::UNAUTHORIZED)
            },

            ServerError::Forbidden(_) => response
                .title("Action not allowed.")
                .status(StatusCode::FORBIDDEN),

            ServerError::NotFound(_) => response
                .title("Resource not found.")
                .status(StatusCode::NOT_FOUND),

            ServerError::Conflict(_) => response
                .title("Resource already exists.")
                .status(StatusCode::CONFLICT),

            ServerError::LimitReached(_) => response
                .title("Quota reached.")
                .status(StatusCode::FORBIDDEN),

            ServerError::Axum(rejection) => response
                .title("Invalid request body.")
                .status(rejection.status()),

            ServerError::InvalidToken | ServerError::BadRequest(_) => response,

            ServerError::Image(crate::avatar::ImageError::UnsupportedFormat(_))
            | ServerError::Image(crate::avatar::ImageError::TooLarge { .. })
            | ServerError::Image(crate::avatar::ImageError::Decode(_)) => {
                response.title("Invalid image.")
            },

            ServerError::OAuth(err) => {
                tracing::warn!(error = %err, "oauth flow failed");
                response
                    .title("OAuth authentication failed.")
                    .status(err.status())
            },

            ServerError::Internal { details, source } => {
                tracing::error!(error = ?source, %details, "server returned 500 status");

                ResponseError::default()
            },

            err => {
                tracing::error!(error = %err, "server returned 500 status");

                ResponseError::default()
            },
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/problem+json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}
