use std::sync::Arc;

use axum::{extract::Request, middleware::Next, response::Response};

use super::error::ApiError;
use super::token::{Identity, TokenError, TokenVerifier};

/// Why a connection could not be authenticated.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthFailure {
    /// No token was presented.
    Missing,
    /// A token was presented and rejected.
    Rejected(TokenError),
}

impl AuthFailure {
    /// Close reason sent to WebSocket clients alongside code 4001.
    pub fn close_reason(&self) -> &'static str {
        match self {
            AuthFailure::Missing => "Authentication required",
            AuthFailure::Rejected(_) => "Authentication failed",
        }
    }
}

impl From<AuthFailure> for ApiError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::Missing => ApiError::AuthRequired,
            AuthFailure::Rejected(_) => ApiError::AuthInvalid,
        }
    }
}

/// Resolve a presented token to an identity. Empty tokens count as missing.
pub fn authenticate(verifier: &dyn TokenVerifier, token: Option<&str>) -> Result<Identity, AuthFailure> {
    let token = token.filter(|t| !t.is_empty()).ok_or(AuthFailure::Missing)?;
    verifier.verify(token).map_err(AuthFailure::Rejected)
}

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Bearer-token middleware for the HTTP endpoints.
///
/// On success the caller's [`Identity`] is stored in the request
/// extensions. WebSocket upgrades do not pass through here; they carry
/// their token in the query string and are checked after the upgrade so
/// rejections can be reported with a close code.
pub async fn require_auth(
    verifier: Arc<dyn TokenVerifier>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer(&req);
    let identity = authenticate(verifier.as_ref(), token.as_deref()).map_err(|failure| {
        if let AuthFailure::Rejected(ref e) = failure {
            tracing::debug!(error = %e, "rejected bearer token");
        }
        ApiError::from(failure)
    })?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::token::{encode_unsigned, ClaimsVerifier};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Extension, Router,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn whoami(Extension(identity): Extension<Identity>) -> String {
        identity.user_id
    }

    fn test_app() -> Router {
        let verifier: Arc<dyn TokenVerifier> = Arc::new(ClaimsVerifier::new());
        Router::new()
            .route("/test", get(whoami))
            .layer(axum::middleware::from_fn(move |req, next| {
                let v = verifier.clone();
                async move { require_auth(v, req, next).await }
            }))
    }

    fn valid_token() -> String {
        encode_unsigned(&serde_json::json!({"email": "u1@example.com"}))
    }

    #[test]
    fn extract_bearer_with_header() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer my-secret-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), Some("my-secret-token".to_string()));
    }

    #[test]
    fn extract_bearer_ignores_other_schemes() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), None);
    }

    #[test]
    fn authenticate_distinguishes_missing_from_rejected() {
        let verifier = ClaimsVerifier::new();
        assert_eq!(authenticate(&verifier, None), Err(AuthFailure::Missing));
        assert_eq!(authenticate(&verifier, Some("")), Err(AuthFailure::Missing));
        assert_eq!(
            authenticate(&verifier, Some("garbage")),
            Err(AuthFailure::Rejected(TokenError::Malformed))
        );
        let identity = authenticate(&verifier, Some(&valid_token())).unwrap();
        assert_eq!(identity.user_id, "u1@example.com");
    }

    #[test]
    fn close_reasons() {
        assert_eq!(AuthFailure::Missing.close_reason(), "Authentication required");
        assert_eq!(
            AuthFailure::Rejected(TokenError::Expired).close_reason(),
            "Authentication failed"
        );
    }

    #[tokio::test]
    async fn valid_token_passes_identity_through() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .header("authorization", format!("Bearer {}", valid_token()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"u1@example.com");
    }

    #[tokio::test]
    async fn missing_token_returns_401() {
        let response = test_app()
            .oneshot(Request::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bad_token_returns_403() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .header("authorization", "Bearer not.a-valid.token!")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn query_token_is_not_accepted_for_http() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri(format!("/test?token={}", valid_token()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
