//! # Fleet Providers
//!
//! Deployment backend adapters for the Agent Fleet platform.
//!
//! This crate provides adapters for the supported execution backends:
//! - Kubernetes (container orchestration)
//! - AWS Lambda (serverless functions)
//! - Google Cloud Run (managed container platform)
//!
//! plus the [`DeploymentFactory`], the registry/dispatcher every caller
//! goes through.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cloud_run;
pub mod factory;
pub mod kubernetes;
pub mod lambda;

// Re-export main types
pub use cloud_run::{CloudRunConfig, CloudRunProvider};
pub use factory::{DeploymentFactory, DeploymentFactoryBuilder};
pub use kubernetes::{KubernetesConfig, KubernetesProvider};
pub use lambda::{LambdaConfig, LambdaProvider};
