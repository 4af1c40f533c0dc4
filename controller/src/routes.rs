// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! HTTP route handlers for the status API.
//!
//! | Method | Path | Handler | Description |
//! |--------|------|---------|-------------|
//! | GET | `/health` | [`health`] | Liveness check |
//! | GET | `/ready` | [`ready`] | Ready once a full pod listing was applied |
//! | GET | `/credentials` | [`get_credentials`] | Tracked credentials, without secret material |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use crate::application::AppState;
use crate::constants::MAX_NAMESPACE_LENGTH;
use crate::errors::AppError;
use crate::models::CredentialStatus;

/// Health check endpoint.
///
/// # Response
///
/// ```json
/// {"status": "ok"}
/// ```
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Readiness check.
///
/// Answers `503` with `{"status": "syncing"}` until the secrets controller has
/// applied the first complete pod listing.
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.registry.is_synced() {
        (StatusCode::OK, Json(json!({"status": "ok"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "syncing"})))
    }
}

#[derive(Debug, Deserialize)]
pub struct CredentialsQuery {
    pub namespace: Option<String>,
}

/// Lists tracked credentials sorted by Secret, optionally for one namespace.
///
/// # Errors
///
/// - [`AppError::InvalidRequest`] - `namespace` is not a valid namespace name
#[tracing::instrument(skip(state))]
pub async fn get_credentials(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CredentialsQuery>,
) -> Result<Json<Vec<CredentialStatus>>, AppError> {
    if let Some(namespace) = query.namespace.as_deref() {
        validate_namespace(namespace)?;
    }

    let mut statuses = state.registry.statuses().await;
    if let Some(namespace) = query.namespace.as_deref() {
        statuses.retain(|status| status.secret.namespace == namespace);
    }
    Ok(Json(statuses))
}

fn validate_namespace(namespace: &str) -> Result<(), AppError> {
    let valid = !namespace.is_empty()
        && namespace.len() <= MAX_NAMESPACE_LENGTH
        && namespace
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !namespace.starts_with('-')
        && !namespace.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidRequest(format!(
            "{namespace:?} is not a valid namespace"
        )))
    }
}
