//! Forward channels into the cluster
//!
//! Each accepted local connection gets its own pod port-forward stream over
//! the API server websocket.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite};

use super::models::{TunnelError, TunnelResult};

pub trait ForwardStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ForwardStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type ForwardStream = Box<dyn ForwardStreamIo>;

/// What a forward points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardTarget {
    Pod(String),
    Service(String),
}

impl ForwardTarget {
    /// Parse `pod/<name>`, `svc/<name>`, `service/<name>` or a bare pod name
    pub fn parse(target: &str) -> TunnelResult<Self> {
        let (kind, name) = match target.split_once('/') {
            Some((kind, name)) => (kind, name),
            None => ("pod", target),
        };

        if name.is_empty() || name.contains('/') {
            return Err(TunnelError::InvalidTarget(target.to_string()));
        }

        match kind {
            "pod" | "pods" | "po" => Ok(ForwardTarget::Pod(name.to_string())),
            "svc" | "service" | "services" => Ok(ForwardTarget::Service(name.to_string())),
            _ => Err(TunnelError::InvalidTarget(target.to_string())),
        }
    }
}

/// A target resolved down to a pod and a pod port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub pod: String,
    pub port: u16,
}

/// Opens forwarding channels through an established connection
#[async_trait]
pub trait PortForwarder: Send + Sync + 'static {
    /// Resolve a target and remote port to the pod and pod port that carry traffic
    async fn resolve(&self, namespace: &str, target: &str, remote_port: u16) -> TunnelResult<ResolvedTarget>;

    /// Open one channel to a pod port
    async fn open(&self, namespace: &str, pod: &str, port: u16) -> TunnelResult<ForwardStream>;
}

/// `PortForwarder` over a kube client
#[derive(Clone)]
pub struct KubeForwarder {
    client: Client,
}

impl KubeForwarder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn running_pod(&self, namespace: &str, name: &str) -> TunnelResult<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods
            .get(name)
            .await
            .map_err(|e| TunnelError::Target(format!("pod {}/{}: {}", namespace, name, e)))?;

        let phase = pod_phase(&pod);
        if phase != "Running" {
            return Err(TunnelError::Target(format!(
                "pod {}/{} is {}",
                namespace, name, phase
            )));
        }
        Ok(pod)
    }

    async fn resolve_service(&self, namespace: &str, name: &str, remote_port: u16) -> TunnelResult<ResolvedTarget> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = services
            .get(name)
            .await
            .map_err(|e| TunnelError::Target(format!("service {}/{}: {}", namespace, name, e)))?;

        let spec = service.spec.unwrap_or_default();
        let selector = spec
            .selector
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TunnelError::Target(format!("service {}/{} has no selector", namespace, name)))?;

        let label_selector = selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&label_selector))
            .await
            .map_err(|e| TunnelError::Target(e.to_string()))?;

        let pod = list
            .items
            .into_iter()
            .find(|p| pod_phase(p) == "Running")
            .ok_or_else(|| {
                TunnelError::Target(format!("service {}/{} has no running pods", namespace, name))
            })?;

        let target_port = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .find(|p| p.port == i32::from(remote_port))
            .and_then(|p| p.target_port);

        let port = match target_port {
            Some(IntOrString::Int(port)) => u16::try_from(port)
                .map_err(|_| TunnelError::Target(format!("invalid target port {}", port)))?,
            Some(IntOrString::String(port_name)) => named_container_port(&pod, &port_name)
                .ok_or_else(|| {
                    TunnelError::Target(format!("pod has no container port named {}", port_name))
                })?,
            None => remote_port,
        };

        Ok(ResolvedTarget {
            pod: pod.metadata.name.unwrap_or_default(),
            port,
        })
    }
}

#[async_trait]
impl PortForwarder for KubeForwarder {
    async fn resolve(&self, namespace: &str, target: &str, remote_port: u16) -> TunnelResult<ResolvedTarget> {
        match ForwardTarget::parse(target)? {
            ForwardTarget::Pod(name) => {
                self.running_pod(namespace, &name).await?;
                Ok(ResolvedTarget {
                    pod: name,
                    port: remote_port,
                })
            }
            ForwardTarget::Service(name) => self.resolve_service(namespace, &name, remote_port).await,
        }
    }

    async fn open(&self, namespace: &str, pod: &str, port: u16) -> TunnelResult<ForwardStream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut forwarder = pods
            .portforward(pod, &[port])
            .await
            .map_err(|e| TunnelError::Forward(e.to_string()))?;

        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| TunnelError::Forward(format!("no stream for port {}", port)))?;

        // The forwarder task must outlive this call; it ends when the stream closes
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                tracing::debug!("Port-forward channel ended with error: {}", e);
            }
        });

        Ok(Box::new(stream))
    }
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

fn named_container_port(pod: &Pod, name: &str) -> Option<u16> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(name))
        .and_then(|p| u16::try_from(p.container_port).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            ForwardTarget::parse("web-7d9f").unwrap(),
            ForwardTarget::Pod("web-7d9f".into())
        );
        assert_eq!(
            ForwardTarget::parse("pod/web-7d9f").unwrap(),
            ForwardTarget::Pod("web-7d9f".into())
        );
        assert_eq!(
            ForwardTarget::parse("svc/web").unwrap(),
            ForwardTarget::Service("web".into())
        );
        assert_eq!(
            ForwardTarget::parse("service/web").unwrap(),
            ForwardTarget::Service("web".into())
        );
    }

    #[test]
    fn test_parse_rejects_bad_targets() {
        assert!(matches!(ForwardTarget::parse("deploy/web"), Err(TunnelError::InvalidTarget(_))));
        assert!(matches!(ForwardTarget::parse("svc/"), Err(TunnelError::InvalidTarget(_))));
        assert!(matches!(ForwardTarget::parse("pod/a/b"), Err(TunnelError::InvalidTarget(_))));
        assert!(matches!(ForwardTarget::parse(""), Err(TunnelError::InvalidTarget(_))));
    }
}
