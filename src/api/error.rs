use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for the HTTP handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. WebSocket handshake failures are reported
/// with close codes instead, once the upgrade has happened.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No bearer token provided.
    AuthRequired,
    /// 403 - A token was provided but did not verify.
    AuthInvalid,
    /// 403 - The user may not use the requested feature.
    FeatureDenied(&'static str),
    /// 404 - Generic not-found.
    NotFound,
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::FeatureDenied(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::FeatureDenied(_) => "feature_denied",
            ApiError::NotFound => "not_found",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via the Authorization header.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::FeatureDenied(feature) => format!("Access to '{}' is denied.", feature),
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn response_parts(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = Body::new(response.into_body())
            .collect()
            .await
            .unwrap()
            .to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn auth_required_is_401() {
        let (status, json) = response_parts(ApiError::AuthRequired).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["code"], "auth_required");
    }

    #[tokio::test]
    async fn auth_invalid_is_403() {
        let (status, json) = response_parts(ApiError::AuthInvalid).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "auth_invalid");
    }

    #[tokio::test]
    async fn feature_denied_names_the_feature() {
        let (status, json) = response_parts(ApiError::FeatureDenied("terminal")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "feature_denied");
        assert_eq!(json["error"]["message"], "Access to 'terminal' is denied.");
    }

    #[tokio::test]
    async fn internal_error_includes_detail() {
        let (status, json) = response_parts(ApiError::InternalError("pty exhausted".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"]["message"], "Internal error: pty exhausted.");
    }

    #[tokio::test]
    async fn not_found_body_shape() {
        let (status, json) = response_parts(ApiError::NotFound).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            json,
            serde_json::json!({"error": {"code": "not_found", "message": "Not found."}})
        );
    }
}
