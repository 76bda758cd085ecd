use crate::{Decision, RateLimiter};
use ::axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

/// Header set by proxies with the chain of client addresses.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header set by proxies with the original client address.
pub const X_REAL_IP: &str = "x-real-ip";

/// Resolve the client address of a request.
///
/// Prefers the first entry of `X-Forwarded-For`, then `X-Real-IP`, then the
/// peer address and finally the loopback address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let real = headers
        .get(X_REAL_IP)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    forwarded
        .or(real)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| {
            peer.map(|addr| addr.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
                .to_string()
        })
}

/// Middleware to limit requests per client address.
///
/// Use it with `axum::middleware::from_fn_with_state(limiter, rate_limiter)`.
pub async fn rate_limiter(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(req.headers(), peer);

    match limiter.check(&ip) {
        Decision::Allowed(_) => next.run(req).await,
        Decision::Denied(denial) => {
            tracing::warn!(%ip, path = %req.uri().path(), reason = %denial, "rate limit violation");

            (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    (header::RETRY_AFTER, limiter.ban_duration().as_secs().to_string()),
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_owned()),
                ],
                format!("Rate limit exceeded. Please try again later.\n{denial}"),
            )
                .into_response()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Limits;
    use ::axum::{Router, body::Body, http::HeaderValue, middleware, routing::get};
    use std::time::Duration;
    use tower::ServiceExt;

    #[test]
    fn test_client_ip() {
        let peer = Some(SocketAddr::from(([10, 0, 0, 9], 4242)));
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, None), "127.0.0.1");
        assert_eq!(client_ip(&headers, peer), "10.0.0.9");

        headers.insert(X_REAL_IP, HeaderValue::from_static("192.168.1.2"));
        assert_eq!(client_ip(&headers, peer), "192.168.1.2");

        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, peer), "203.0.113.7");
    }

    #[tokio::test]
    async fn test_middleware() {
        let limits = Limits {
            per_minute: 1,
            per_hour: 5,
            per_day: 10,
        };
        let limiter = Arc::new(RateLimiter::new(limits, Duration::from_secs(300)));
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(limiter, rate_limiter));

        let request = || {
            ::axum::http::Request::builder()
                .uri("/")
                .header(X_REAL_IP, "172.16.0.3")
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "300");
    }
}
