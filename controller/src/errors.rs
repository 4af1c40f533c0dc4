// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid role ARN: {0}")]
    InvalidArn(String),
    #[error("invalid external ID: {0}")]
    InvalidExternalId(String),
    #[error("assume role failed for {role_arn}: {message}")]
    AssumeRoleFailed { role_arn: String, message: String },
    #[error("instance metadata unavailable: {0}")]
    MetadataUnavailable(String),
    #[error("secret store error: {0}")]
    SecretStoreFailed(String),
    #[error("watch error: {0}")]
    WatchFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0} stopped unexpectedly")]
    ComponentStopped(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::InvalidConfig(_)
            | Self::InvalidArn(_)
            | Self::InvalidExternalId(_)
            | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::AssumeRoleFailed { .. }
            | Self::MetadataUnavailable(_)
            | Self::SecretStoreFailed(_)
            | Self::WatchFailed(_) => StatusCode::BAD_GATEWAY,
            Self::ComponentStopped(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({"code": status.as_u16(), "message": self.to_string()}));

        (status, body).into_response()
    }
}

impl From<kube::Error> for AppError {
    fn from(source: kube::Error) -> Self {
        tracing::debug!("{:?}", source);
        AppError::SecretStoreFailed(source.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(source: serde_json::Error) -> Self {
        tracing::error!("{:?}", source);
        AppError::SecretStoreFailed(source.to_string())
    }
}

impl From<kube::runtime::watcher::Error> for AppError {
    fn from(source: kube::runtime::watcher::Error) -> Self {
        AppError::WatchFailed(source.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let response = AppError::InvalidArn("role".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AppError::SecretStoreFailed("boom".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
