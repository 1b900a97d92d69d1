//! Kubernetes API client
//!
//! Establishes a verified client for a kubeconfig context. Each attempt
//! resolves the profile, swaps AWS exec plugins for an in-process token
//! provider, applies timeouts, builds the client and asks the server for its
//! version. Failed attempts are retried up to a fixed bound.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::client::ClientBuilder;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use thiserror::Error;
use tokio::task::JoinHandle;

use super::auth::TokenAuthLayer;
use super::intercept::ExecInterceptor;
use super::token::{TokenError, TokenProvider};
use crate::config::ConnectSettings;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to resolve connection profile: {0}")]
    ProfileResolution(String),

    #[error("Failed to mint cluster token: {0}")]
    Token(#[from] TokenError),

    #[error("Failed to create client: {0}")]
    Client(String),

    #[error("Cluster unreachable: {0}")]
    Unreachable(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to connect after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        source: Box<ConnectError>,
    },
}

/// Result type for connection operations
pub type ConnectResult<T> = Result<T, ConnectError>;

/// The cluster client library, as seen by the establisher
#[async_trait]
pub trait ClusterApi: Send + Sync {
    type Handle: Send + 'static;

    /// Build a base profile for a context, or the default context when `None`
    async fn auto_configure(&self, context: Option<&str>) -> ConnectResult<Config>;

    /// Construct a client from a finished profile.
    ///
    /// With `auth`, every request the client sends carries a token minted by
    /// that provider.
    async fn build_client(&self, config: Config, auth: Option<TokenProvider>) -> ConnectResult<Self::Handle>;

    /// Lightweight round-trip proving the client works
    async fn server_version(&self, handle: &Self::Handle) -> ConnectResult<String>;
}

/// `ClusterApi` backed by the kube crate
#[derive(Debug, Clone, Default)]
pub struct KubeApi {
    kubeconfig: Option<PathBuf>,
}

impl KubeApi {
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self { kubeconfig }
    }
}

#[async_trait]
impl ClusterApi for KubeApi {
    type Handle = Client;

    async fn auto_configure(&self, context: Option<&str>) -> ConnectResult<Config> {
        let start = Instant::now();
        let options = KubeConfigOptions {
            context: context.map(String::from),
            ..Default::default()
        };

        let config = match (&self.kubeconfig, context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ConnectError::ProfileResolution(e.to_string()))?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ConnectError::ProfileResolution(e.to_string()))?
            }
            (None, Some(_)) => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ConnectError::ProfileResolution(e.to_string()))?,
            (None, None) => Config::infer()
                .await
                .map_err(|e| ConnectError::ProfileResolution(e.to_string()))?,
        };

        tracing::debug!("Config loaded in {:?}", start.elapsed());
        Ok(config)
    }

    async fn build_client(&self, config: Config, auth: Option<TokenProvider>) -> ConnectResult<Client> {
        match auth {
            Some(provider) => {
                let builder =
                    ClientBuilder::try_from(config).map_err(|e| ConnectError::Client(e.to_string()))?;
                Ok(builder.with_layer(&TokenAuthLayer::new(provider)).build())
            }
            None => Client::try_from(config).map_err(|e| ConnectError::Client(e.to_string())),
        }
    }

    async fn server_version(&self, client: &Client) -> ConnectResult<String> {
        let info = client
            .apiserver_version()
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        Ok(info.git_version)
    }
}

/// A verified client plus what the server reported
#[derive(Debug)]
pub struct ConnectionResult<H> {
    pub client: H,
    pub server_version: String,
    pub context: Option<String>,
    pub attempts: u32,
}

/// Retry state; `Success` and `ExhaustedFailure` are terminal
#[derive(Debug)]
enum AttemptState<H> {
    Attempting(u32),
    Success(ConnectionResult<H>),
    ExhaustedFailure { attempts: u32, last_error: ConnectError },
}

impl<H> AttemptState<H> {
    fn advance(attempt: u32, max_attempts: u32, outcome: ConnectResult<ConnectionResult<H>>) -> Self {
        match outcome {
            Ok(result) => AttemptState::Success(result),
            Err(e) if attempt >= max_attempts => AttemptState::ExhaustedFailure {
                attempts: attempt,
                last_error: e,
            },
            Err(e) => {
                tracing::warn!("Connection attempt {}/{} failed: {}", attempt, max_attempts, e);
                AttemptState::Attempting(attempt + 1)
            }
        }
    }
}

/// Connects to clusters with bounded retries
pub struct ConnectionEstablisher<A: ClusterApi> {
    api: A,
    interceptor: ExecInterceptor,
    settings: ConnectSettings,
}

impl<A: ClusterApi> ConnectionEstablisher<A> {
    pub fn new(api: A, interceptor: ExecInterceptor, settings: ConnectSettings) -> Self {
        Self {
            api,
            interceptor,
            settings,
        }
    }

    /// Connect to a context (or the default one), retrying on failure
    pub async fn connect(&self, context: Option<&str>) -> ConnectResult<ConnectionResult<A::Handle>> {
        let max_attempts = self.settings.max_attempts.max(1);
        let start = Instant::now();
        let mut state = AttemptState::Attempting(1);

        loop {
            state = match state {
                AttemptState::Attempting(attempt) => {
                    let outcome = self.attempt_with_deadline(context, attempt).await;
                    AttemptState::advance(attempt, max_attempts, outcome)
                }
                AttemptState::Success(result) => {
                    tracing::info!(
                        "Connected to {} (server {}) in {:?}",
                        context.unwrap_or("default context"),
                        result.server_version,
                        start.elapsed()
                    );
                    return Ok(result);
                }
                AttemptState::ExhaustedFailure {
                    attempts,
                    last_error,
                } => {
                    tracing::error!(
                        "Giving up on {} after {} attempts: {}",
                        context.unwrap_or("default context"),
                        attempts,
                        last_error
                    );
                    return Err(ConnectError::Exhausted {
                        attempts,
                        source: Box::new(last_error),
                    });
                }
            };
        }
    }

    async fn attempt_with_deadline(
        &self,
        context: Option<&str>,
        attempt: u32,
    ) -> ConnectResult<ConnectionResult<A::Handle>> {
        let deadline = self.settings.attempt_timeout();
        tokio::time::timeout(deadline, self.attempt(context, attempt))
            .await
            .map_err(|_| ConnectError::Timeout(deadline))?
    }

    async fn attempt(
        &self,
        context: Option<&str>,
        attempt: u32,
    ) -> ConnectResult<ConnectionResult<A::Handle>> {
        tracing::debug!("Connection attempt {} for {:?}", attempt, context);
        let mut config = self.api.auto_configure(context).await?;

        // kubeconfig parsing is file I/O; keep it off the async workers
        let interceptor = self.interceptor.clone();
        let owned_context = context.map(String::from);
        let token_override =
            tokio::task::spawn_blocking(move || interceptor.intercept_or_skip(owned_context.as_deref()))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("Exec interception task failed: {}", e);
                    None
                });

        let auth = match token_override {
            Some(token_override) => {
                let provider = token_override.apply(&mut config);
                // Surface credential problems as a token error before any request goes out
                provider.get_token().await?;
                Some(provider)
            }
            None => None,
        };

        config.connect_timeout = Some(self.settings.connect_timeout());
        config.read_timeout = Some(self.settings.read_timeout());
        config.write_timeout = Some(self.settings.read_timeout());

        let client = self.api.build_client(config, auth).await?;
        let server_version = self.api.server_version(&client).await?;

        Ok(ConnectionResult {
            client,
            server_version,
            context: context.map(String::from),
            attempts: attempt,
        })
    }
}

impl<A: ClusterApi + 'static> ConnectionEstablisher<A> {
    /// Run [`connect`](Self::connect) on the runtime so the caller's loop is not blocked
    pub fn spawn_connect(
        self: Arc<Self>,
        context: Option<String>,
    ) -> JoinHandle<ConnectResult<ConnectionResult<A::Handle>>> {
        tokio::spawn(async move { self.connect(context.as_deref()).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_success_is_terminal() {
        let outcome = Ok(ConnectionResult {
            client: (),
            server_version: "v1.29.0".into(),
            context: None,
            attempts: 1,
        });
        assert!(matches!(
            AttemptState::advance(1, 3, outcome),
            AttemptState::Success(_)
        ));
    }

    #[test]
    fn test_advance_retries_until_bound() {
        let fail = || Err::<ConnectionResult<()>, _>(ConnectError::Unreachable("refused".into()));

        assert!(matches!(
            AttemptState::advance(1, 3, fail()),
            AttemptState::Attempting(2)
        ));
        assert!(matches!(
            AttemptState::advance(2, 3, fail()),
            AttemptState::Attempting(3)
        ));
        assert!(matches!(
            AttemptState::advance(3, 3, fail()),
            AttemptState::ExhaustedFailure { attempts: 3, .. }
        ));
    }

    #[test]
    fn test_exhausted_keeps_last_error() {
        let err = ConnectError::Exhausted {
            attempts: 3,
            source: Box::new(ConnectError::ProfileResolution("context 'x' not found".into())),
        };
        let message = err.to_string();
        assert!(message.contains("3 attempts"));
        assert!(message.contains("context 'x' not found"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
