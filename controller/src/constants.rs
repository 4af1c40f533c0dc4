// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::time::Duration;

pub const CONTROLLER_NAME: &str = "kube-aws-iam-controller";

pub const ARN_PREFIX: &str = "arn:aws:iam::";
pub const ROLE_ARN_SUFFIX: &str = ":role";
/// https://docs.aws.amazon.com/STS/latest/APIReference/API_AssumeRole.html
pub const ROLE_SESSION_NAME_MAX_SIZE: usize = 64;

/// Maximum tolerated length of an IAM external ID.
pub const EXTERNAL_ID_MAX_SIZE: usize = 1224;
/// Longest Kubernetes namespace name.
pub const MAX_NAMESPACE_LENGTH: usize = 63;
/// Longest Kubernetes object name.
pub const MAX_OBJECT_NAME_LENGTH: usize = 253;
/// Delimiters appended to the prefix when composing an external ID.
pub const EXTERNAL_ID_DELIMITERS: usize = 3;
pub const EXTERNAL_ID_PREFIX_MAX_SIZE: usize =
    EXTERNAL_ID_MAX_SIZE - MAX_NAMESPACE_LENGTH - MAX_OBJECT_NAME_LENGTH - EXTERNAL_ID_DELIMITERS;
pub const EXTERNAL_ID_DELIMITER: char = '/';

// STS accepts session durations between 15 minutes and 12 hours.
pub const MIN_SESSION_DURATION: Duration = Duration::from_secs(15 * 60);
pub const MAX_SESSION_DURATION: Duration = Duration::from_secs(12 * 60 * 60);

pub const DEFAULT_INTERVAL: &str = "10s";
pub const DEFAULT_REFRESH_LIMIT: &str = "15m";
pub const DEFAULT_SESSION_DURATION: &str = "1h";
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 10;
pub const DEFAULT_MAX_CONCURRENT_REFRESHES: usize = 4;

pub const IMDS_ENDPOINT: &str = "http://169.254.169.254:80";
pub const IMDS_TOKEN_TTL: Duration = Duration::from_secs(300); // 5 minutes
pub const IMDS_IAM_INFO_PATH: &str = "/latest/meta-data/iam/info";
pub const BOOTSTRAP_SESSION_NAME: &str = "kube-aws-iam-controller";

/// Pod annotation naming the role a pod wants credentials for.
pub const POD_ROLE_ANNOTATION: &str = "iam.amazonaws.com/role";

pub const SECRET_NAME_PREFIX: &str = "aws-iam-";
pub const HERITAGE_LABEL_KEY: &str = "heritage";
pub const HERITAGE_LABEL_VALUE: &str = CONTROLLER_NAME;
pub const SECRET_TYPE_LABEL_KEY: &str = "type";
pub const SECRET_TYPE_LABEL_VALUE: &str = "aws-iam-credentials";
pub const ROLE_ARN_ANNOTATION: &str = "aws-iam-controller/role-arn";
pub const EXTERNAL_ID_ANNOTATION: &str = "aws-iam-controller/external-id";
pub const EXPIRATION_ANNOTATION: &str = "aws-iam-controller/expiration";

/// Secret key holding an AWS shared credentials file.
pub const CREDENTIALS_FILE_KEY: &str = "credentials";
/// Secret key holding the JSON document for `credential_process`.
pub const CREDENTIALS_PROCESS_KEY: &str = "credentials.process";

