// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Temporary credentials from STS AssumeRole.
//!
//! [`StsCredentialsGetter`] is shared by the secrets controller and the
//! refresh scheduler. It holds no per-call state, so concurrent calls for
//! different roles need no locking here; keeping two callers from refreshing
//! the *same* secret at once is the job of [`crate::registry`].

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::sts::AssumeRoleProvider;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_sts::error::DisplayErrorContext;
use chrono::DateTime;

use crate::configuration::resolve_role_arn;
use crate::constants::BOOTSTRAP_SESSION_NAME;
use crate::errors::AppError;
use crate::models::Credentials;
use crate::session_name;

/// Issues credentials for a role.
#[async_trait]
pub trait CredentialsGetter: Send + Sync {
    /// Assumes `role` (a bare name or a full ARN) for `session_duration`.
    ///
    /// An empty `external_id` leaves the `ExternalId` parameter out of the
    /// request.
    async fn get(
        &self,
        role: &str,
        session_duration: Duration,
        external_id: &str,
    ) -> Result<Credentials, AppError>;
}

/// Parameters of a single AssumeRole call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub role_session_name: String,
    pub duration_seconds: i32,
    pub external_id: Option<String>,
}

/// The STS operation the getter depends on.
#[async_trait]
pub trait AssumeRole: Send + Sync {
    async fn assume(&self, request: AssumeRoleRequest) -> Result<Credentials, AppError>;
}

#[async_trait]
impl AssumeRole for aws_sdk_sts::Client {
    #[tracing::instrument(skip(self), fields(role_arn = %request.role_arn))]
    async fn assume(&self, request: AssumeRoleRequest) -> Result<Credentials, AppError> {
        let failed = |message: String| AppError::AssumeRoleFailed {
            role_arn: request.role_arn.clone(),
            message,
        };

        let output = self
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.role_session_name)
            .duration_seconds(request.duration_seconds)
            .set_external_id(request.external_id.clone())
            .send()
            .await
            .map_err(|err| failed(DisplayErrorContext(&err).to_string()))?;

        let creds = output
            .credentials()
            .ok_or_else(|| failed("STS AssumeRole returned empty credentials".into()))?;

        let expiration = creds.expiration();
        let expiration = DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
            .ok_or_else(|| failed(format!("invalid expiration timestamp {expiration}")))?;

        Ok(Credentials {
            role_arn: request.role_arn.clone(),
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().to_string(),
            expiration,
        })
    }
}

/// Credentials getter backed by STS.
pub struct StsCredentialsGetter<A = aws_sdk_sts::Client> {
    api: A,
    base_role_arn: String,
}

impl<A: AssumeRole> StsCredentialsGetter<A> {
    pub fn new(api: A, base_role_arn: impl Into<String>) -> Self {
        Self {
            api,
            base_role_arn: base_role_arn.into(),
        }
    }

    /// Resolves the role and derives the session name without calling STS.
    pub fn build_request(
        &self,
        role: &str,
        session_duration: Duration,
        external_id: &str,
    ) -> Result<AssumeRoleRequest, AppError> {
        let role_arn = resolve_role_arn(&self.base_role_arn, role);
        let role_session_name = session_name::normalize(&role_arn)?;
        let duration_seconds = i32::try_from(session_duration.as_secs()).map_err(|_| {
            AppError::InvalidConfig(format!("session duration {session_duration:?} is too long"))
        })?;

        Ok(AssumeRoleRequest {
            role_arn,
            role_session_name,
            duration_seconds,
            // Trust that this ID meets the syntactic constraints.
            external_id: Some(external_id.to_string()).filter(|id| !id.is_empty()),
        })
    }
}

#[async_trait]
impl<A: AssumeRole> CredentialsGetter for StsCredentialsGetter<A> {
    #[tracing::instrument(skip(self, external_id))]
    async fn get(
        &self,
        role: &str,
        session_duration: Duration,
        external_id: &str,
    ) -> Result<Credentials, AppError> {
        let request = self.build_request(role, session_duration, external_id)?;

        tracing::debug!(
            role_arn = %request.role_arn,
            session_name = %request.role_session_name,
            with_external_id = request.external_id.is_some(),
            "[sts] assuming role"
        );

        let credentials = self.api.assume(request).await?;

        tracing::debug!(
            role_arn = %credentials.role_arn,
            expiration = %credentials.expiration,
            "[sts] assumed role"
        );

        Ok(credentials)
    }
}

/// Builds the STS client the controller uses for every AssumeRole call.
///
/// With `assume_role` set, the client itself runs as that role, assumed from
/// the ambient credentials of the process.
pub async fn sts_client(assume_role: Option<&str>) -> aws_sdk_sts::Client {
    let base = aws_config::load_defaults(BehaviorVersion::latest()).await;

    let Some(role_arn) = assume_role else {
        return aws_sdk_sts::Client::new(&base);
    };

    tracing::info!("[sts] using custom assume role: {}", role_arn);

    let provider = AssumeRoleProvider::builder(role_arn)
        .session_name(BOOTSTRAP_SESSION_NAME)
        .configure(&base)
        .build()
        .await;

    let config = base
        .to_builder()
        .credentials_provider(SharedCredentialsProvider::new(provider))
        .build();

    aws_sdk_sts::Client::new(&config)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;

    const BASE: &str = "arn:aws:iam::123456789012:role/";

    #[derive(Default)]
    struct RecordingApi {
        requests: Mutex<Vec<AssumeRoleRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl AssumeRole for RecordingApi {
        async fn assume(&self, request: AssumeRoleRequest) -> Result<Credentials, AppError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(AppError::AssumeRoleFailed {
                    role_arn: request.role_arn,
                    message: "AccessDenied".into(),
                });
            }
            Ok(Credentials {
                role_arn: request.role_arn,
                access_key_id: "AKIA".into(),
                secret_access_key: "secret".into(),
                session_token: "token".into(),
                expiration: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    #[tokio::test]
    async fn test_bare_role_resolved_against_base() {
        let getter = StsCredentialsGetter::new(RecordingApi::default(), BASE);
        let creds = getter.get("team-a", Duration::from_secs(3600), "").await.unwrap();
        assert_eq!(creds.role_arn, format!("{BASE}team-a"));

        let requests = getter.api.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].role_arn, format!("{BASE}team-a"));
        assert_eq!(requests[0].role_session_name, "123456789012.team-a");
        assert_eq!(requests[0].duration_seconds, 3600);
    }

    #[tokio::test]
    async fn test_empty_external_id_is_omitted() {
        let getter = StsCredentialsGetter::new(RecordingApi::default(), BASE);
        getter.get("team-a", Duration::from_secs(900), "").await.unwrap();
        getter.get("team-a", Duration::from_secs(900), "cluster/team-a").await.unwrap();

        let requests = getter.api.requests.lock().unwrap();
        assert_eq!(requests[0].external_id, None);
        assert_eq!(requests[1].external_id.as_deref(), Some("cluster/team-a"));
    }

    #[tokio::test]
    async fn test_full_arn_used_as_is() {
        let getter = StsCredentialsGetter::new(RecordingApi::default(), BASE);
        let arn = "arn:aws:iam::999999999999:role/path/other";
        let creds = getter.get(arn, Duration::from_secs(900), "").await.unwrap();
        assert_eq!(creds.role_arn, arn);
    }

    #[tokio::test]
    async fn test_invalid_arn_not_sent() {
        let getter = StsCredentialsGetter::new(RecordingApi::default(), "");
        let err = getter.get("no-slash", Duration::from_secs(900), "").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArn(_)));
        assert!(getter.api.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_not_retried() {
        let api = RecordingApi {
            fail: true,
            ..Default::default()
        };
        let getter = StsCredentialsGetter::new(api, BASE);
        let err = getter.get("team-a", Duration::from_secs(900), "").await.unwrap_err();
        assert!(matches!(err, AppError::AssumeRoleFailed { .. }));
        assert_eq!(getter.api.requests.lock().unwrap().len(), 1);
    }
}
