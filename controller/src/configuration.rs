// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::fmt;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use crate::constants::{
    self, ARN_PREFIX, DEFAULT_EVENT_QUEUE_SIZE, DEFAULT_INTERVAL, DEFAULT_MAX_CONCURRENT_REFRESHES,
    DEFAULT_REFRESH_LIMIT, DEFAULT_SESSION_DURATION,
};
use crate::errors::AppError;
use crate::external_id;

/// Which Kubernetes object the external ID is scoped to, after the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExternalIdScope {
    /// `<prefix>/<namespace>`
    #[default]
    Namespace,
    /// `<prefix>/<namespace>/<service account>`
    ServiceAccount,
}

impl fmt::Display for ExternalIdScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalIdScope::Namespace => write!(f, "namespace"),
            ExternalIdScope::ServiceAccount => write!(f, "service-account"),
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct ControllerOptions {
    /// Enable debug logging.
    #[arg(long, default_value = "false", env("IAM_CONTROLLER_DEBUG"), action = ArgAction::SetTrue)]
    pub debug: bool,
    /// Interval between syncing secrets.
    #[arg(long, default_value = DEFAULT_INTERVAL, env("IAM_CONTROLLER_INTERVAL"))]
    pub interval: humantime::Duration,
    /// Maximum duration to allow until AWS IAM credentials will expire before refreshing them.
    #[arg(long, default_value = DEFAULT_REFRESH_LIMIT, env("IAM_CONTROLLER_REFRESH_LIMIT"))]
    pub refresh_limit: humantime::Duration,
    /// Duration requested for every assumed role session.
    #[arg(long, default_value = DEFAULT_SESSION_DURATION, env("IAM_CONTROLLER_SESSION_DURATION"))]
    pub session_duration: humantime::Duration,
    /// Size of the pod event queue.
    #[arg(long, default_value_t = DEFAULT_EVENT_QUEUE_SIZE, env("IAM_CONTROLLER_EVENT_QUEUE_SIZE"))]
    pub event_queue_size: usize,
    /// Upper bound on refreshes running at once within one scheduler tick.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_REFRESHES, env("IAM_CONTROLLER_MAX_CONCURRENT_REFRESHES"))]
    pub max_concurrent_refreshes: usize,
    /// Base Role ARN. If not defined it will be autodiscovered from EC2 Metadata.
    #[arg(long, env("IAM_CONTROLLER_BASE_ROLE_ARN"))]
    pub base_role_arn: Option<String>,
    /// Role assumed at start-up and used for assuming the roles managed by the controller.
    #[arg(long, env("IAM_CONTROLLER_ASSUME_ROLE"))]
    pub assume_role: Option<String>,
    /// Prefix for the external ID supplied when assuming an IAM role.
    #[arg(long, default_value = "", env("IAM_CONTROLLER_EXTERNAL_ID_PREFIX"))]
    pub external_id_prefix: String,
    /// Object the external ID suffix is derived from.
    #[arg(long, value_enum, default_value_t = ExternalIdScope::Namespace, env("IAM_CONTROLLER_EXTERNAL_ID_SCOPE"))]
    pub external_id_scope: ExternalIdScope,
    /// API server URL.
    #[arg(long, env("IAM_CONTROLLER_APISERVER"))]
    pub apiserver: Option<String>,
    /// Limit the controller to a certain namespace.
    #[arg(long, default_value = "", env("IAM_CONTROLLER_NAMESPACE"))]
    pub namespace: String,
    #[arg(long, default_value = "0.0.0.0", env("IAM_CONTROLLER_HTTP_HOST"))]
    pub host: String,
    #[arg(long, default_value = "8080", env("IAM_CONTROLLER_HTTP_PORT"))]
    pub port: u16,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        ControllerOptions {
            debug: false,
            interval: Duration::from_secs(10).into(),
            refresh_limit: Duration::from_secs(15 * 60).into(),
            session_duration: Duration::from_secs(60 * 60).into(),
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            max_concurrent_refreshes: DEFAULT_MAX_CONCURRENT_REFRESHES,
            base_role_arn: None,
            assume_role: None,
            external_id_prefix: String::new(),
            external_id_scope: ExternalIdScope::Namespace,
            apiserver: None,
            namespace: String::new(),
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Validated, immutable configuration shared by every component.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub interval: Duration,
    pub refresh_limit: Duration,
    pub session_duration: Duration,
    pub event_queue_size: usize,
    pub max_concurrent_refreshes: usize,
    /// Always ends with `/` once resolved.
    pub base_role_arn: String,
    pub assume_role: Option<String>,
    pub external_id_prefix: String,
    pub external_id_scope: ExternalIdScope,
    /// `None` watches all namespaces.
    pub namespace: Option<String>,
}

impl ControllerConfig {
    /// Checks every startup constraint and freezes the options.
    ///
    /// The base role ARN is passed separately because it may come from
    /// instance metadata rather than from the command line.
    pub fn from_options(options: &ControllerOptions, base_role_arn: String) -> Result<Self, AppError> {
        external_id::validate_prefix(&options.external_id_prefix)?;

        let interval: Duration = options.interval.into();
        let refresh_limit: Duration = options.refresh_limit.into();
        let session_duration: Duration = options.session_duration.into();

        if interval.is_zero() {
            return Err(AppError::InvalidConfig("interval must be greater than zero".into()));
        }
        if !(constants::MIN_SESSION_DURATION..=constants::MAX_SESSION_DURATION)
            .contains(&session_duration)
        {
            return Err(AppError::InvalidConfig(format!(
                "session duration {} must be between {} and {}",
                humantime::format_duration(session_duration),
                humantime::format_duration(constants::MIN_SESSION_DURATION),
                humantime::format_duration(constants::MAX_SESSION_DURATION),
            )));
        }
        if refresh_limit >= session_duration {
            return Err(AppError::InvalidConfig(format!(
                "refresh limit {} must be shorter than the session duration {}",
                humantime::format_duration(refresh_limit),
                humantime::format_duration(session_duration),
            )));
        }
        if options.event_queue_size == 0 {
            return Err(AppError::InvalidConfig("event queue size must be at least 1".into()));
        }
        if options.max_concurrent_refreshes == 0 {
            return Err(AppError::InvalidConfig(
                "max concurrent refreshes must be at least 1".into(),
            ));
        }

        let base_role_arn = normalize_base_role_arn(&base_role_arn)?;
        let assume_role = options
            .assume_role
            .as_deref()
            .filter(|role| !role.is_empty())
            .map(|role| resolve_role_arn(&base_role_arn, role));

        let namespace = Some(options.namespace.trim().to_string()).filter(|ns| !ns.is_empty());

        Ok(Self {
            interval,
            refresh_limit,
            session_duration,
            event_queue_size: options.event_queue_size,
            max_concurrent_refreshes: options.max_concurrent_refreshes,
            base_role_arn,
            assume_role,
            external_id_prefix: options.external_id_prefix.clone(),
            external_id_scope: options.external_id_scope,
            namespace,
        })
    }
}

/// Turns a bare role name into a full ARN under `base_role_arn`.
pub fn resolve_role_arn(base_role_arn: &str, role: &str) -> String {
    if role.starts_with(ARN_PREFIX) {
        role.to_string()
    } else {
        format!("{base_role_arn}{role}")
    }
}

fn normalize_base_role_arn(base_role_arn: &str) -> Result<String, AppError> {
    let base_role_arn = base_role_arn.trim();
    if !base_role_arn.starts_with(ARN_PREFIX) {
        return Err(AppError::InvalidConfig(format!(
            "base role ARN {base_role_arn:?} must start with {ARN_PREFIX}"
        )));
    }
    if base_role_arn.ends_with('/') {
        Ok(base_role_arn.to_string())
    } else {
        Ok(format!("{base_role_arn}/"))
    }
}
