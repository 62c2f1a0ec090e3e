// API 错误响应

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use tracing::{error, warn};

use crate::downloader::DownloadError;

pub type ApiResult<T> = Result<T, ApiError>;

/// API 错误，响应体为 `{"detail": "..."}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.detail)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = match &err {
            DownloadError::Validation(_) | DownloadError::NotReady(_) => StatusCode::BAD_REQUEST,
            DownloadError::NotFound(_) => StatusCode::NOT_FOUND,
            DownloadError::Extraction(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("请求处理失败: {}", err);
        } else {
            warn!("请求被拒绝: {}", err);
        }
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("请求体无效: {}", rejection.body_text()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::TimeoutPhase;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DownloadError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (DownloadError::NotReady("queued".into()), StatusCode::BAD_REQUEST),
            (DownloadError::NotFound("id".into()), StatusCode::NOT_FOUND),
            (DownloadError::Extraction("x".into()), StatusCode::BAD_GATEWAY),
            (
                DownloadError::Timeout {
                    phase: TimeoutPhase::Extract,
                    secs: 1,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[tokio::test]
    async fn test_body_has_detail() {
        let response = ApiError::not_found("Download not found").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["detail"], "Download not found");
    }
}
