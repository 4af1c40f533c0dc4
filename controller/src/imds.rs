// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use aws_config::imds::client::{Client, ImdsResponseRetryClassifier};
use aws_smithy_runtime_api::client::retries::classifiers::SharedRetryClassifier;
use serde::Deserialize;

use crate::constants;
use crate::errors::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IamInfo {
    instance_profile_arn: String,
}

/// Discovers the base role ARN from the instance profile attached to this node.
///
/// `arn:aws:iam::123456789012:instance-profile/path/node` becomes
/// `arn:aws:iam::123456789012:role/`.
#[tracing::instrument]
pub async fn get_base_role_arn() -> Result<String, AppError> {
    let client = Client::builder()
        .endpoint(constants::IMDS_ENDPOINT)
        .map_err(|e| AppError::MetadataUnavailable(e.to_string()))?
        .token_ttl(constants::IMDS_TOKEN_TTL)
        .retry_classifier(SharedRetryClassifier::new(
            ImdsResponseRetryClassifier::default().with_retry_connect_timeouts(true),
        ))
        .build();

    let response = client
        .get(constants::IMDS_IAM_INFO_PATH)
        .await
        .map_err(|e| AppError::MetadataUnavailable(e.to_string()))?;

    let info: IamInfo = serde_json::from_str(response.as_ref())
        .map_err(|e| AppError::MetadataUnavailable(format!("malformed IAM info: {e}")))?;

    base_role_arn_from_instance_profile(&info.instance_profile_arn)
}

pub fn base_role_arn_from_instance_profile(instance_profile_arn: &str) -> Result<String, AppError> {
    let arn = instance_profile_arn.replacen("instance-profile", "role", 1);
    match arn.split_once('/') {
        Some((prefix, _)) => Ok(format!("{prefix}/")),
        None => Err(AppError::MetadataUnavailable(format!(
            "failed to determine base role ARN from {instance_profile_arn}"
        ))),
    }
}
