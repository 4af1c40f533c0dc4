// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! # kube-aws-iam-controller
//!
//! Provisions AWS IAM credentials to Kubernetes pods.
//!
//! Pods ask for a role with the `iam.amazonaws.com/role` annotation. The
//! controller assumes that role through STS and writes the temporary
//! credentials into a Secret in the pod's namespace, then keeps refreshing the
//! Secret before the credentials expire.
//!
//! ## Architecture
//!
//! ```text
//! Pod watch -> PodWatcher -> bounded queue -> SecretsController -> STS -> Secret
//!                                                   |
//!                                                Registry <- RefreshScheduler -> STS -> Secret
//! ```
//!
//! - **Pod watcher**: turns the pod watch into added/updated/deleted events and
//!   blocks while the queue is full
//! - **Secrets controller**: binds pods to credential Secrets, one event at a time
//! - **Refresh scheduler**: re-assumes roles that are close to expiring and
//!   cleans up Secrets no pod uses
//! - **HTTP API**: health, readiness and a credential status listing
//!
//! ## Modules
//!
//! - [`application`]: HTTP server setup with Axum
//! - [`configuration`]: CLI argument parsing with clap and startup validation
//! - [`constants`]: Defaults, limits and Kubernetes label/annotation names
//! - [`controller`]: Consumer of pod events
//! - [`credentials`]: STS AssumeRole behind the [`credentials::CredentialsGetter`] trait
//! - [`errors`]: Application error types with HTTP response mapping
//! - [`external_id`]: External ID prefix validation and composition
//! - [`imds`]: Base role ARN discovery from EC2 Instance Metadata Service
//! - [`models`]: Credentials, pod events and status types
//! - [`registry`]: Tracked credentials with per-Secret locking
//! - [`routes`]: HTTP route handlers
//! - [`scheduler`]: Periodic credential refresh
//! - [`secrets`]: Kubernetes Secret persistence
//! - [`session_name`]: Role ARN to STS session name normalization
//! - [`supervisor`]: Runs the components until shutdown or the first failure
//! - [`watcher`]: Producer of pod events
//!
//! ## Usage
//!
//! ```bash
//! kube-aws-iam-controller --base-role-arn arn:aws:iam::123456789012:role/ --external-id-prefix cluster-a
//! ```

pub mod application;
pub mod configuration;
pub mod constants;
pub mod controller;
pub mod credentials;
pub mod errors;
pub mod external_id;
pub mod imds;
pub mod models;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod secrets;
pub mod session_name;
pub mod supervisor;
pub mod watcher;
