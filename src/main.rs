use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kubelink::config::AppConfig;
use kubelink::kubernetes::{
    ConnectError, ConnectionEstablisher, DefaultCredentialChain, ExecInterceptor, KubeApi,
    TokenError, TokenProvider,
};
use kubelink::tunnel::{ForwardRequest, KubeForwarder, TunnelError, TunnelManager};

/// Lifetime advertised to kubectl; the server accepts tokens for 15 minutes
const EXEC_CREDENTIAL_TTL_MINUTES: i64 = 14;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Failed to encode credential: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid port mapping '{0}', expected [LOCAL:]REMOTE")]
    InvalidPorts(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser)]
#[command(name = "kubelink", version, about = "Cluster connections and pod port-forwards")]
struct Cli {
    /// kubeconfig to use instead of KUBECONFIG / ~/.kube/config
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print an ExecCredential carrying a fresh EKS token
    Token {
        #[arg(long)]
        cluster_name: String,
        #[arg(long, env = "AWS_REGION")]
        region: String,
        #[arg(long, env = "AWS_PROFILE")]
        profile: Option<String>,
    },
    /// Connect to a context and print the server version
    Connect {
        #[arg(long)]
        context: Option<String>,
    },
    /// Forward a local port to a pod or service until interrupted
    Forward {
        #[arg(long)]
        context: Option<String>,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// pod/<name>, svc/<name> or a pod name
        target: String,
        /// [LOCAL:]REMOTE; LOCAL defaults to a free port
        ports: String,
        /// Local bind address
        #[arg(long)]
        address: Option<String>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredential {
    kind: &'static str,
    api_version: &'static str,
    spec: serde_json::Value,
    status: ExecCredentialStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    expiration_timestamp: String,
    token: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout is reserved for command output (the token command is read by kubectl)
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // kube and the AWS SDK may both pull in rustls; pin one process-wide provider
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    if cli.kubeconfig.is_some() {
        config.kubeconfig = cli.kubeconfig;
    }

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: AppConfig) -> Result<(), CliError> {
    match command {
        Command::Token {
            cluster_name,
            region,
            profile,
        } => print_exec_credential(cluster_name, region, profile).await,
        Command::Connect { context } => {
            let establisher = establisher(&config);
            let result = establisher.connect(context.as_deref()).await?;
            println!("{}", result.server_version);
            Ok(())
        }
        Command::Forward {
            context,
            namespace,
            target,
            ports,
            address,
        } => {
            let (local_port, remote_port) = parse_ports(&ports)?;
            let establisher = Arc::new(establisher(&config));
            let connection = establisher.spawn_connect(context).await??;

            let manager = TunnelManager::new(config.tunnel.clone());
            let mut request = ForwardRequest::new(namespace, target, remote_port).local_port(local_port);
            if let Some(address) = address {
                request = request.bind_address(address);
            }

            let session = manager
                .start(Arc::new(KubeForwarder::new(connection.client)), request)
                .await?;

            let urls = session.urls();
            println!("Forwarding {} -> {}:{}", urls.primary(), session.pod, session.remote_port);
            println!("  {}", urls.ipv4);
            println!("  {}", urls.ipv6);

            tokio::signal::ctrl_c().await?;
            manager.stop_all();
            Ok(())
        }
    }
}

fn establisher(config: &AppConfig) -> ConnectionEstablisher<KubeApi> {
    let interceptor = ExecInterceptor::new(config.kubeconfig.clone(), Arc::new(DefaultCredentialChain));
    ConnectionEstablisher::new(
        KubeApi::new(config.kubeconfig.clone()),
        interceptor,
        config.connect.clone(),
    )
}

async fn print_exec_credential(
    cluster_name: String,
    region: String,
    profile: Option<String>,
) -> Result<(), CliError> {
    let provider = TokenProvider::new(cluster_name, region, profile, Arc::new(DefaultCredentialChain));
    let token = provider.get_token().await?;

    let expires = Utc::now() + ChronoDuration::minutes(EXEC_CREDENTIAL_TTL_MINUTES);
    let credential = ExecCredential {
        kind: "ExecCredential",
        api_version: "client.authentication.k8s.io/v1beta1",
        spec: serde_json::json!({}),
        status: ExecCredentialStatus {
            expiration_timestamp: expires.to_rfc3339_opts(SecondsFormat::Secs, true),
            token: token.into_string(),
        },
    };

    println!("{}", serde_json::to_string(&credential)?);
    Ok(())
}

fn parse_ports(spec: &str) -> Result<(u16, u16), CliError> {
    let invalid = || CliError::InvalidPorts(spec.to_string());
    let parse = |s: &str| s.parse::<u16>().map_err(|_| invalid());

    match spec.split_once(':') {
        Some((local, remote)) => {
            let local = if local.is_empty() { 0 } else { parse(local)? };
            let remote = parse(remote)?;
            if remote == 0 {
                return Err(invalid());
            }
            Ok((local, remote))
        }
        None => match parse(spec)? {
            0 => Err(invalid()),
            remote => Ok((0, remote)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_failure_has_its_own_error() {
        let join_error = tokio::spawn(async { panic!("connect task panicked") })
            .await
            .unwrap_err();

        let err = CliError::from(join_error);
        assert!(matches!(err, CliError::Join(_)));
        assert!(err.to_string().starts_with("Background task failed"));
    }

    #[test]
    fn test_parse_ports() {
        assert_eq!(parse_ports("80").unwrap(), (0, 80));
        assert_eq!(parse_ports("8080:80").unwrap(), (8080, 80));
        assert_eq!(parse_ports(":5432").unwrap(), (0, 5432));
        assert!(parse_ports("0").is_err());
        assert!(parse_ports("http").is_err());
        assert!(parse_ports("8080:").is_err());
        assert!(parse_ports("70000").is_err());
    }
}
