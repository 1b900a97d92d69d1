//! Kubernetes integration module
//!
//! Provides kubeconfig parsing, EKS token minting, exec-credential
//! interception, per-request token authentication and a retrying
//! connection establisher.

pub mod auth;
pub mod client;
pub mod config;
pub mod intercept;
pub mod token;

pub use auth::{TokenAuth, TokenAuthLayer};
pub use client::{ClusterApi, ConnectError, ConnectResult, ConnectionEstablisher, ConnectionResult, KubeApi};
pub use config::{ExecCredentialSpec, KubeConfig, KubeConfigError, KubeContext, KubeUser};
pub use intercept::{EksExecParams, ExecInterceptor, InterceptError, TokenOverride};
pub use token::{
    BearerToken, CredentialSource, DefaultCredentialChain, ResolvedCredentials, StaticCredentials,
    TokenError, TokenProvider, TokenResult,
};
