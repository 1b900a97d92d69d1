//! Exec-credential interception
//!
//! kubeconfig users on EKS usually delegate to `aws eks get-token`. Rather than
//! spawning the CLI, the connection layer detects that plugin, pulls its
//! parameters out and mints the token in-process. Anything else (other
//! plugins, plain certificates, tokens) is left for kube to handle.

use std::path::PathBuf;
use std::sync::Arc;

use kube::config::AuthInfo;
use thiserror::Error;

use super::config::{ExecCredentialSpec, KubeConfig, KubeConfigError};
use super::token::{CredentialSource, TokenProvider};

/// Executable name of the AWS CLI
pub const BROKER_COMMAND: &str = "aws";

pub const CLUSTER_NAME_FLAG: &str = "--cluster-name";
pub const REGION_FLAG: &str = "--region";
pub const PROFILE_FLAG: &str = "--profile";

pub const CLUSTER_NAME_ENV: &str = "AWS_CLUSTER_NAME";
pub const REGION_ENV: &str = "AWS_REGION";
pub const PROFILE_ENV: &str = "AWS_PROFILE";

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("Failed to load kubeconfig: {0}")]
    Config(#[from] KubeConfigError),

    #[error("Exec plugin '{command}' is missing required parameter {parameter}")]
    MissingParameter {
        command: String,
        parameter: &'static str,
    },
}

/// Parameters pulled out of an `aws eks get-token` plugin declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EksExecParams {
    pub cluster_name: String,
    pub region: String,
    pub profile: Option<String>,
}

/// Replacement authentication for a resolved profile
#[derive(Debug, Clone)]
pub struct TokenOverride {
    provider: TokenProvider,
}

impl TokenOverride {
    pub fn new(provider: TokenProvider) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &TokenProvider {
        &self.provider
    }

    /// Strip every credential from the profile and return the provider that
    /// authenticates requests in their place
    pub fn apply(self, config: &mut kube::Config) -> TokenProvider {
        neutralize_credentials(&mut config.auth_info);
        tracing::debug!(
            "Applied token override for cluster {}",
            self.provider.cluster_id()
        );
        self.provider
    }
}

/// Clear every credential field so a single mechanism remains active
pub fn neutralize_credentials(auth: &mut AuthInfo) {
    auth.username = None;
    auth.password = None;
    auth.token = None;
    auth.token_file = None;
    auth.auth_provider = None;
    auth.exec = None;
    auth.client_certificate = None;
    auth.client_certificate_data = None;
    auth.client_key = None;
    auth.client_key_data = None;
}

/// Whether a plugin command is the AWS CLI, bare or by path
pub fn is_broker_command(command: &str) -> bool {
    let file_name = command
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(command);
    let file_name = file_name
        .strip_suffix(".exe")
        .or_else(|| file_name.strip_suffix(".EXE"))
        .unwrap_or(file_name);
    file_name == BROKER_COMMAND
}

/// Pull cluster/region/profile from a recognised plugin.
///
/// Arguments take precedence over environment overrides. Returns `Ok(None)`
/// when the plugin is not the AWS CLI.
pub fn extract_params(spec: &ExecCredentialSpec) -> Result<Option<EksExecParams>, InterceptError> {
    if !is_broker_command(&spec.command) {
        return Ok(None);
    }

    let lookup = |flag: &str, env: &str| {
        spec.arg_value(flag)
            .filter(|v| !v.is_empty())
            .or_else(|| spec.env_var(env).filter(|v| !v.is_empty()))
            .map(String::from)
    };

    let missing = |parameter| InterceptError::MissingParameter {
        command: spec.command.clone(),
        parameter,
    };

    let cluster_name =
        lookup(CLUSTER_NAME_FLAG, CLUSTER_NAME_ENV).ok_or_else(|| missing("cluster name"))?;
    let region = lookup(REGION_FLAG, REGION_ENV).ok_or_else(|| missing("region"))?;
    let profile = lookup(PROFILE_FLAG, PROFILE_ENV);

    Ok(Some(EksExecParams {
        cluster_name,
        region,
        profile,
    }))
}

/// Find the exec plugin of the user bound to a context
pub fn find_exec_spec<'a>(config: &'a KubeConfig, context: Option<&str>) -> Option<&'a ExecCredentialSpec> {
    let context_name = context.or(config.current_context.as_deref())?;
    let context = config.get_context(context_name)?;
    let user_name = context.user.as_deref()?;
    config.get_user(user_name)?.exec.as_ref()
}

/// Detects EKS exec plugins in kubeconfig and produces token overrides
#[derive(Clone)]
pub struct ExecInterceptor {
    kubeconfig: Option<PathBuf>,
    credentials: Arc<dyn CredentialSource>,
}

impl ExecInterceptor {
    pub fn new(kubeconfig: Option<PathBuf>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            kubeconfig,
            credentials,
        }
    }

    /// Inspect the context's user and build an override if it uses the AWS CLI
    pub fn intercept(&self, context: Option<&str>) -> Result<Option<TokenOverride>, InterceptError> {
        let paths = match KubeConfig::locate(self.kubeconfig.as_deref()) {
            Ok(paths) => paths,
            Err(KubeConfigError::NotFound) => {
                tracing::debug!("No kubeconfig found, skipping exec interception");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let config = KubeConfig::load_merged(&paths)?;
        let Some(spec) = find_exec_spec(&config, context) else {
            return Ok(None);
        };

        let Some(params) = extract_params(spec)? else {
            tracing::debug!(
                "Exec plugin '{}' not recognised, leaving it to kube",
                spec.command
            );
            return Ok(None);
        };

        tracing::info!(
            "Intercepted AWS exec plugin for cluster {} in {} (profile: {})",
            params.cluster_name,
            params.region,
            params.profile.as_deref().unwrap_or("default")
        );

        let provider = TokenProvider::new(
            params.cluster_name,
            params.region,
            params.profile,
            self.credentials.clone(),
        );
        Ok(Some(TokenOverride::new(provider)))
    }

    /// Like [`intercept`](Self::intercept), but errors are logged and treated as no override
    pub fn intercept_or_skip(&self, context: Option<&str>) -> Option<TokenOverride> {
        match self.intercept(context) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Exec interception skipped: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str, args: &[&str], env: &[(&str, &str)]) -> ExecCredentialSpec {
        ExecCredentialSpec {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_broker_command_recognition() {
        assert!(is_broker_command("aws"));
        assert!(is_broker_command("/usr/local/bin/aws"));
        assert!(is_broker_command("C:\\Program Files\\Amazon\\AWSCLIV2\\aws.exe"));
        assert!(!is_broker_command("aws-iam-authenticator"));
        assert!(!is_broker_command("gke-gcloud-auth-plugin"));
        assert!(!is_broker_command("/opt/saws"));
    }

    #[test]
    fn test_extract_from_args() {
        let spec = spec(
            "aws",
            &["eks", "get-token", "--cluster-name", "demo", "--region", "us-east-1"],
            &[],
        );
        let params = extract_params(&spec).unwrap().unwrap();
        assert_eq!(params.cluster_name, "demo");
        assert_eq!(params.region, "us-east-1");
        assert_eq!(params.profile, None);
    }

    #[test]
    fn test_extract_falls_back_to_env() {
        let spec = spec(
            "/usr/bin/aws",
            &["eks", "get-token"],
            &[
                ("AWS_CLUSTER_NAME", "env-cluster"),
                ("AWS_REGION", "eu-central-1"),
                ("AWS_PROFILE", "ops"),
            ],
        );
        let params = extract_params(&spec).unwrap().unwrap();
        assert_eq!(params.cluster_name, "env-cluster");
        assert_eq!(params.region, "eu-central-1");
        assert_eq!(params.profile.as_deref(), Some("ops"));
    }

    #[test]
    fn test_args_win_over_env() {
        let spec = spec(
            "aws",
            &["--cluster-name", "from-args", "--region", "us-east-1", "--profile", "staging"],
            &[
                ("AWS_CLUSTER_NAME", "from-env"),
                ("AWS_REGION", "eu-west-1"),
                ("AWS_PROFILE", "env-profile"),
            ],
        );
        let params = extract_params(&spec).unwrap().unwrap();
        assert_eq!(params.cluster_name, "from-args");
        assert_eq!(params.region, "us-east-1");
        assert_eq!(params.profile.as_deref(), Some("staging"));
    }

    #[test]
    fn test_empty_arg_falls_back_to_env() {
        let empty_region = spec(
            "aws",
            &["eks", "get-token", "--cluster-name", "demo", "--region", ""],
            &[("AWS_REGION", "eu-north-1")],
        );
        let params = extract_params(&empty_region).unwrap().unwrap();
        assert_eq!(params.cluster_name, "demo");
        assert_eq!(params.region, "eu-north-1");

        let empty_cluster = spec("aws", &["--cluster-name=", "--region", "us-east-1"], &[]);
        assert!(matches!(
            extract_params(&empty_cluster),
            Err(InterceptError::MissingParameter { parameter: "cluster name", .. })
        ));
    }

    #[test]
    fn test_missing_region_is_error() {
        let spec = spec("aws", &["eks", "get-token", "--cluster-name", "demo"], &[]);
        let err = extract_params(&spec).unwrap_err();
        assert!(matches!(
            err,
            InterceptError::MissingParameter { parameter: "region", .. }
        ));
    }

    #[test]
    fn test_unrecognised_plugin_is_noop() {
        let spec = spec("gke-gcloud-auth-plugin", &[], &[]);
        assert!(extract_params(&spec).unwrap().is_none());
    }

    #[test]
    fn test_neutralize_credentials() {
        let yaml = r#"
username: admin
password: hunter2
token: static-token
tokenFile: /var/run/token
client-certificate: /tmp/client.crt
client-certificate-data: Y2VydA==
client-key: /tmp/client.key
client-key-data: a2V5
as: someone
exec:
  apiVersion: client.authentication.k8s.io/v1beta1
  command: aws
  args: ["eks", "get-token"]
"#;
        let mut auth: AuthInfo = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(auth.exec.is_some());

        neutralize_credentials(&mut auth);

        assert!(auth.username.is_none());
        assert!(auth.password.is_none());
        assert!(auth.token.is_none());
        assert!(auth.token_file.is_none());
        assert!(auth.client_certificate.is_none());
        assert!(auth.client_certificate_data.is_none());
        assert!(auth.client_key.is_none());
        assert!(auth.client_key_data.is_none());
        assert!(auth.auth_provider.is_none());
        assert!(auth.exec.is_none());
        // Impersonation is not a credential
        assert_eq!(auth.impersonate.as_deref(), Some("someone"));
    }
}
