use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use super::forwarder::PortForwarder;
use super::models::{ForwardRequest, PortForwardSession, TunnelError, TunnelResult};
use super::port::allocate_local_port;
use crate::config::TunnelSettings;

/// Something that keeps a tunnel alive until closed
pub trait TunnelHandle: Send {
    fn close(self: Box<Self>) -> TunnelResult<()>;
}

/// Accept loop task for one tunnel; aborting it drops every open connection
struct ListenerHandle {
    task: JoinHandle<()>,
}

impl TunnelHandle for ListenerHandle {
    fn close(self: Box<Self>) -> TunnelResult<()> {
        let already_stopped = self.task.is_finished();
        self.task.abort();
        if already_stopped {
            Err(TunnelError::Close("listener had already stopped".into()))
        } else {
            Ok(())
        }
    }
}

struct ActiveTunnel {
    session: PortForwardSession,
    handle: Box<dyn TunnelHandle>,
}

/// Registry of running port-forward tunnels
///
/// Start/stop may be called concurrently with `list`; the registry lock is
/// never held while a tunnel is being closed.
pub struct TunnelManager {
    sessions: Mutex<HashMap<String, ActiveTunnel>>,
    settings: TunnelSettings,
}

impl TunnelManager {
    pub fn new(settings: TunnelSettings) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Bind a local port and forward its connections to the target
    pub async fn start(
        &self,
        forwarder: Arc<dyn PortForwarder>,
        request: ForwardRequest,
    ) -> TunnelResult<PortForwardSession> {
        let deadline = self.settings.start_timeout();
        tokio::time::timeout(deadline, self.start_inner(forwarder, request))
            .await
            .map_err(|_| TunnelError::Timeout(deadline))?
    }

    async fn start_inner(
        &self,
        forwarder: Arc<dyn PortForwarder>,
        request: ForwardRequest,
    ) -> TunnelResult<PortForwardSession> {
        let bind_address = request
            .bind_address
            .clone()
            .unwrap_or_else(|| self.settings.bind_address.clone());

        let resolved = forwarder
            .resolve(&request.namespace, &request.target, request.remote_port)
            .await?;

        let requested_port = if request.local_port == 0 {
            allocate_local_port(&bind_address, &self.settings)?
        } else {
            request.local_port
        };

        let listener = TcpListener::bind((bind_address.as_str(), requested_port))
            .await
            .map_err(|source| TunnelError::Bind {
                address: bind_address.clone(),
                port: requested_port,
                source,
            })?;
        let local_port = listener.local_addr()?.port();

        let session = PortForwardSession::new(
            request.namespace.clone(),
            request.target.clone(),
            resolved.pod.clone(),
            local_port,
            request.remote_port,
            bind_address,
        );

        let task = tokio::spawn(run_listener(
            listener,
            forwarder,
            request.namespace,
            resolved.pod,
            resolved.port,
        ));

        self.insert(session.clone(), Box::new(ListenerHandle { task }));
        tracing::info!(
            "Forwarding {} -> {}/{}:{} ({})",
            session.url(),
            session.namespace,
            session.target,
            session.remote_port,
            session.id
        );

        Ok(session)
    }

    pub(crate) fn insert(&self, session: PortForwardSession, handle: Box<dyn TunnelHandle>) {
        self.sessions
            .lock()
            .insert(session.id.clone(), ActiveTunnel { session, handle });
    }

    /// Stop one tunnel; false if no such session
    pub fn stop(&self, id: &str) -> bool {
        let removed = self.sessions.lock().remove(id);
        match removed {
            Some(active) => {
                close_tunnel(active);
                true
            }
            None => false,
        }
    }

    /// Stop every tunnel
    pub fn stop_all(&self) {
        let drained: Vec<ActiveTunnel> = self.sessions.lock().drain().map(|(_, a)| a).collect();
        if !drained.is_empty() {
            tracing::info!("Stopping {} port-forward(s)", drained.len());
        }
        for active in drained {
            close_tunnel(active);
        }
    }

    /// Snapshot of running tunnels, oldest first
    pub fn list(&self) -> Vec<PortForwardSession> {
        let mut sessions: Vec<PortForwardSession> = self
            .sessions
            .lock()
            .values()
            .map(|a| a.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn get(&self, id: &str) -> Option<PortForwardSession> {
        self.sessions.lock().get(id).map(|a| a.session.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new(TunnelSettings::default())
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn close_tunnel(active: ActiveTunnel) {
    let ActiveTunnel { session, handle } = active;
    match handle.close() {
        Ok(()) => tracing::info!(
            "Stopped port-forward {} after {}",
            session.id,
            session.duration_display()
        ),
        Err(e) => tracing::warn!("Error closing port-forward {}: {}", session.id, e),
    }
}

async fn run_listener(
    listener: TcpListener,
    forwarder: Arc<dyn PortForwarder>,
    namespace: String,
    pod: String,
    port: u16,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, origin)) => {
                    tracing::debug!("Accepted {} for {}/{}:{}", origin, namespace, pod, port);
                    connections.spawn(forward_connection(
                        stream,
                        forwarder.clone(),
                        namespace.clone(),
                        pod.clone(),
                        port,
                    ));
                }
                Err(e) => {
                    tracing::warn!("Port-forward listener accept error: {}", e);
                    break;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Ok(Err(e)) = joined {
                    tracing::warn!("Port-forward connection to {}/{} failed: {}", namespace, pod, e);
                }
            }
        }
    }
}

async fn forward_connection(
    mut local: TcpStream,
    forwarder: Arc<dyn PortForwarder>,
    namespace: String,
    pod: String,
    port: u16,
) -> TunnelResult<()> {
    local.set_nodelay(true).ok();
    let mut remote = forwarder.open(&namespace, &pod, port).await?;

    let copied = copy_bidirectional(&mut local, &mut remote).await;
    let _ = remote.shutdown().await;

    match copied {
        Ok((sent, received)) => {
            tracing::debug!("Connection closed ({} bytes out, {} bytes in)", sent, received);
            Ok(())
        }
        // Half-close races are normal teardown
        Err(e)
            if e.kind() == std::io::ErrorKind::BrokenPipe
                || e.kind() == std::io::ErrorKind::NotConnected
                || e.kind() == std::io::ErrorKind::ConnectionReset =>
        {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
