pub mod auth;
pub mod error;
mod handlers;
pub mod token;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::sync::Arc;

use crate::authz::Authorizer;
use crate::pty::SpawnOptions;
use crate::session::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub shutdown: ShutdownCoordinator,
    pub verifier: Arc<dyn token::TokenVerifier>,
    pub authorizer: Arc<dyn Authorizer>,
    /// How every terminal process is launched.
    pub spawn: Arc<SpawnOptions>,
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a setup without CORS.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let verifier = state.verifier.clone();
    let protected = Router::new()
        .route("/terminal/health", get(terminal_health))
        .layer(axum::middleware::from_fn(move |req, next| {
            let v = verifier.clone();
            async move { auth::require_auth(v, req, next).await }
        }));

    let router = Router::new()
        .route("/health", get(health))
        .route("/ws/terminal", get(ws_terminal))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ));

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::token::{encode_unsigned, ClaimsVerifier};
    use crate::authz::{AllowAll, PermissionPolicy};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for oneshot()

    fn test_state(authorizer: Arc<dyn Authorizer>) -> AppState {
        AppState {
            sessions: SessionRegistry::new(),
            shutdown: ShutdownCoordinator::new(),
            verifier: Arc::new(ClaimsVerifier::new()),
            authorizer,
            spawn: Arc::new(SpawnOptions::shell(Some("/bin/sh".into()))),
        }
    }

    fn bearer() -> String {
        format!(
            "Bearer {}",
            encode_unsigned(&serde_json::json!({"email": "u1@example.com"}))
        )
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let app = router(test_state(Arc::new(AllowAll)), RouterConfig::default());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(body_json(response).await, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn terminal_health_reports_active_sessions() {
        let app = router(test_state(Arc::new(AllowAll)), RouterConfig::default());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/terminal/health")
                    .header("authorization", bearer())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"status": "ok", "activeSessions": 0})
        );
    }

    #[tokio::test]
    async fn terminal_health_requires_a_token() {
        let app = router(test_state(Arc::new(AllowAll)), RouterConfig::default());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/terminal/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn terminal_health_requires_the_terminal_feature() {
        let app = router(
            test_state(Arc::new(PermissionPolicy::default())),
            RouterConfig::default(),
        );
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/terminal/health")
                    .header("authorization", bearer())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"]["code"], "feature_denied");
    }

    #[tokio::test]
    async fn cors_origin_is_echoed_when_configured() {
        let config = RouterConfig {
            cors_origins: vec!["https://app.example.com".into()],
        };
        let app = router(test_state(Arc::new(AllowAll)), config);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "https://app.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://app.example.com"
        );
    }
}
