//! EKS-style bearer token minting
//!
//! A token is a presigned STS `GetCallerIdentity` URL, base64url encoded and
//! prefixed with `k8s-aws-v1.`. The cluster-side verifier replays the URL
//! (plus the `x-k8s-aws-id` header) against STS to learn the caller identity.
//! Tokens are minted on every call and never cached.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SignatureLocation, SigningParams, SigningSettings,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;

/// Literal marker every token starts with
pub const TOKEN_PREFIX: &str = "k8s-aws-v1.";

/// Signed header carrying the cluster name
pub const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";

/// Lifetime of the embedded presigned URL
pub const PRESIGN_EXPIRY: Duration = Duration::from_secs(60);

const SIGNING_SERVICE: &str = "sts";
const STS_QUERY: &str = "Action=GetCallerIdentity&Version=2011-06-15";
const CREDENTIALS_PROVIDER_NAME: &str = "kubelink";

/// Errors that can occur while minting a token
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Failed to resolve AWS credentials: {0}")]
    Credentials(String),

    #[error("Failed to sign token request: {0}")]
    Signing(String),

    #[error("Invalid token request: {0}")]
    InvalidRequest(String),
}

/// Result type for token operations
pub type TokenResult<T> = Result<T, TokenError>;

/// Identity material used as the signing identity
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl ResolvedCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }
}

impl fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &self.session_token.as_ref().map(|_| "** redacted **"))
            .finish()
    }
}

impl From<&Credentials> for ResolvedCredentials {
    fn from(creds: &Credentials) -> Self {
        Self {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().map(String::from),
        }
    }
}

/// Source of identity credentials for signing
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Resolve credentials, using the named profile when given
    async fn resolve(&self, profile: Option<&str>, region: &str) -> TokenResult<ResolvedCredentials>;
}

/// The standard AWS chain: named profile, environment, shared files, IMDS, ...
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCredentialChain;

#[async_trait]
impl CredentialSource for DefaultCredentialChain {
    async fn resolve(&self, profile: Option<&str>, region: &str) -> TokenResult<ResolvedCredentials> {
        let mut config_loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));

        if let Some(profile) = profile {
            config_loader = config_loader.profile_name(profile);
        }

        let aws_config = config_loader.load().await;
        let provider = aws_config
            .credentials_provider()
            .ok_or_else(|| TokenError::Credentials("no credentials provider configured".into()))?;

        let credentials = provider
            .provide_credentials()
            .await
            .map_err(|e| TokenError::Credentials(e.to_string()))?;

        tracing::debug!(
            "Resolved AWS credentials (profile: {})",
            profile.unwrap_or("default")
        );
        Ok(ResolvedCredentials::from(&credentials))
    }
}

/// Fixed credentials, e.g. from an explicit key pair
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub ResolvedCredentials);

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn resolve(&self, _profile: Option<&str>, _region: &str) -> TokenResult<ResolvedCredentials> {
        Ok(self.0.clone())
    }
}

/// A bearer token for the `Authorization` header
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BearerToken({}** redacted **)", TOKEN_PREFIX)
    }
}

/// The STS request that gets presigned
#[derive(Debug, Clone)]
pub struct SignedTokenRequest {
    pub host: String,
    pub cluster_id: String,
    pub region: String,
    pub signing_time: SystemTime,
}

impl SignedTokenRequest {
    pub const METHOD: &'static str = "GET";

    pub fn new(cluster_id: &str, region: &str, signing_time: SystemTime) -> TokenResult<Self> {
        if cluster_id.trim().is_empty() {
            return Err(TokenError::InvalidRequest("cluster name is empty".into()));
        }
        if region.is_empty()
            || !region
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(TokenError::InvalidRequest(format!("invalid region '{}'", region)));
        }

        Ok(Self {
            host: sts_host(region),
            cluster_id: cluster_id.to_string(),
            region: region.to_string(),
            signing_time,
        })
    }

    /// Unsigned request URL
    pub fn url(&self) -> String {
        format!("https://{}/?{}", self.host, STS_QUERY)
    }

    /// Timestamp in `yyyyMMdd'T'HHmmss'Z'` form, as placed in `X-Amz-Date`
    pub fn amz_date(&self) -> String {
        DateTime::<Utc>::from(self.signing_time)
            .format("%Y%m%dT%H%M%SZ")
            .to_string()
    }

    fn headers(&self) -> [(&str, &str); 2] {
        [("host", self.host.as_str()), (CLUSTER_ID_HEADER, self.cluster_id.as_str())]
    }

    /// Presign with SigV4, returning the full URL
    pub fn presign(&self, credentials: &ResolvedCredentials) -> TokenResult<String> {
        let identity: Identity = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            credentials.session_token.clone(),
            None,
            CREDENTIALS_PROVIDER_NAME,
        )
        .into();

        let mut settings = SigningSettings::default();
        settings.signature_location = SignatureLocation::QueryParams;
        settings.expires_in = Some(PRESIGN_EXPIRY);

        let signing_params: SigningParams<'_> = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(SIGNING_SERVICE)
            .time(self.signing_time)
            .settings(settings)
            .build()
            .map_err(|e| TokenError::Signing(e.to_string()))?
            .into();

        let url = self.url();
        let headers = self.headers();
        let signable = SignableRequest::new(
            Self::METHOD,
            url.as_str(),
            headers.iter().copied(),
            SignableBody::Bytes(&[]),
        )
        .map_err(|e| TokenError::Signing(e.to_string()))?;

        let (instructions, _signature) = sign(signable, &signing_params)
            .map_err(|e| TokenError::Signing(e.to_string()))?
            .into_parts();

        let mut presigned = Url::parse(&url).map_err(|e| TokenError::InvalidRequest(e.to_string()))?;
        {
            let mut query = presigned.query_pairs_mut();
            for (name, value) in instructions.params() {
                query.append_pair(name, value);
            }
        }

        Ok(presigned.to_string())
    }
}

/// STS endpoint host for a region
pub fn sts_host(region: &str) -> String {
    if region.starts_with("cn-") {
        format!("sts.{}.amazonaws.com.cn", region)
    } else {
        format!("sts.{}.amazonaws.com", region)
    }
}

/// Mint a token from already-resolved credentials
pub fn generate_token(
    cluster_id: &str,
    region: &str,
    credentials: &ResolvedCredentials,
    now: SystemTime,
) -> TokenResult<BearerToken> {
    let request = SignedTokenRequest::new(cluster_id, region, now)?;
    let presigned = request.presign(credentials)?;
    Ok(BearerToken(format!(
        "{}{}",
        TOKEN_PREFIX,
        URL_SAFE_NO_PAD.encode(presigned.as_bytes())
    )))
}

/// Mints tokens for one cluster, resolving credentials on every call
#[derive(Clone)]
pub struct TokenProvider {
    cluster_id: String,
    region: String,
    profile: Option<String>,
    credentials: Arc<dyn CredentialSource>,
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("cluster_id", &self.cluster_id)
            .field("region", &self.region)
            .field("profile", &self.profile)
            .finish()
    }
}

impl TokenProvider {
    pub fn new(
        cluster_id: impl Into<String>,
        region: impl Into<String>,
        profile: Option<String>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            region: region.into(),
            profile,
            credentials,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Mint a fresh token
    pub async fn get_token(&self) -> TokenResult<BearerToken> {
        self.get_token_at(SystemTime::now()).await
    }

    /// Mint a token signed at the given time
    pub async fn get_token_at(&self, now: SystemTime) -> TokenResult<BearerToken> {
        let credentials = self
            .credentials
            .resolve(self.profile.as_deref(), &self.region)
            .await?;

        let token = generate_token(&self.cluster_id, &self.region, &credentials, now)?;
        tracing::debug!(
            "Minted token for cluster {} in {}",
            self.cluster_id,
            self.region
        );
        Ok(token)
    }
}
