use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while running port-forward tunnels
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to bind {address}:{port}: {source}")]
    Bind {
        address: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("Invalid forward target: {0}")]
    InvalidTarget(String),

    #[error("Target not available: {0}")]
    Target(String),

    #[error("Failed to open forward channel: {0}")]
    Forward(String),

    #[error("Tunnel start timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to close tunnel: {0}")]
    Close(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// A request to forward a local port to a port inside the cluster
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub namespace: String,
    /// `pod/<name>`, `svc/<name>` or a bare pod name
    pub target: String,
    pub remote_port: u16,
    /// 0 picks a free port
    pub local_port: u16,
    /// `None` uses the configured default
    pub bind_address: Option<String>,
}

impl ForwardRequest {
    pub fn new(namespace: impl Into<String>, target: impl Into<String>, remote_port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            target: target.into(),
            remote_port,
            local_port: 0,
            bind_address: None,
        }
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = Some(address.into());
        self
    }
}

/// The addresses a tunnel can be reached on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUrls {
    pub localhost: String,
    pub ipv4: String,
    pub ipv6: String,
}

impl SessionUrls {
    pub fn new(bind_address: &str, port: u16) -> Self {
        let (ipv4, ipv6) = match bind_address.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) if !ip.is_unspecified() && !ip.is_loopback() => {
                (ip.to_string(), "::1".to_string())
            }
            Ok(IpAddr::V6(ip)) if !ip.is_unspecified() && !ip.is_loopback() => {
                ("127.0.0.1".to_string(), ip.to_string())
            }
            _ => ("127.0.0.1".to_string(), "::1".to_string()),
        };

        Self {
            localhost: format!("http://localhost:{}", port),
            ipv4: format!("http://{}:{}", ipv4, port),
            ipv6: format!("http://[{}]:{}", ipv6, port),
        }
    }

    /// The URL shown to users
    pub fn primary(&self) -> &str {
        &self.localhost
    }
}

/// A running local-port to pod-port tunnel
#[derive(Debug, Clone)]
pub struct PortForwardSession {
    pub id: String,
    pub namespace: String,
    pub target: String,
    /// Pod actually carrying the traffic
    pub pod: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub bind_address: String,
    pub created_at: DateTime<Utc>,
    started: Instant,
}

impl PortForwardSession {
    pub fn new(
        namespace: impl Into<String>,
        target: impl Into<String>,
        pod: impl Into<String>,
        local_port: u16,
        remote_port: u16,
        bind_address: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        let target = target.into();
        let created_at = Utc::now();
        let id = Self::session_id(&namespace, &target, local_port, remote_port, created_at);

        Self {
            id,
            namespace,
            target,
            pod: pod.into(),
            local_port,
            remote_port,
            bind_address: bind_address.into(),
            created_at,
            started: Instant::now(),
        }
    }

    /// Identifier derived from the forward's coordinates and creation time
    pub fn session_id(
        namespace: &str,
        target: &str,
        local_port: u16,
        remote_port: u16,
        created_at: DateTime<Utc>,
    ) -> String {
        let stamp = created_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| created_at.timestamp_micros().saturating_mul(1000));
        format!(
            "{}-{}-{}-{}-{}",
            namespace,
            target.replace('/', "."),
            local_port,
            remote_port,
            stamp
        )
    }

    pub fn urls(&self) -> SessionUrls {
        SessionUrls::new(&self.bind_address, self.local_port)
    }

    /// Canonical display URL
    pub fn url(&self) -> String {
        self.urls().localhost
    }

    /// Time since the tunnel started
    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    /// Duration as `1h 02m 03s` / `2m 03s` / `3s`
    pub fn duration_display(&self) -> String {
        format_duration(self.duration())
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_for_wildcard_bind() {
        let urls = SessionUrls::new("0.0.0.0", 12345);
        assert_eq!(urls.localhost, "http://localhost:12345");
        assert_eq!(urls.ipv4, "http://127.0.0.1:12345");
        assert_eq!(urls.ipv6, "http://[::1]:12345");
        assert_eq!(urls.primary(), "http://localhost:12345");
    }

    #[test]
    fn test_urls_for_specific_bind() {
        let urls = SessionUrls::new("192.168.1.20", 8080);
        assert_eq!(urls.ipv4, "http://192.168.1.20:8080");
        assert_eq!(urls.primary(), "http://localhost:8080");

        let urls = SessionUrls::new("fd00::5", 8080);
        assert_eq!(urls.ipv6, "http://[fd00::5]:8080");
        assert_eq!(urls.ipv4, "http://127.0.0.1:8080");
    }

    #[test]
    fn test_session_id_includes_coordinates() {
        let at = DateTime::from_timestamp(1_700_000_000, 42).unwrap();
        let id = PortForwardSession::session_id("default", "svc/web", 10080, 80, at);
        assert_eq!(id, "default-svc.web-10080-80-1700000000000000042");

        let later = DateTime::from_timestamp(1_700_000_000, 43).unwrap();
        assert_ne!(id, PortForwardSession::session_id("default", "svc/web", 10080, 80, later));
    }

    #[test]
    fn test_duration_grows() {
        let session = PortForwardSession::new("default", "web", "web", 10080, 80, "127.0.0.1");
        let first = session.duration();
        std::thread::sleep(Duration::from_millis(15));
        let second = session.duration();

        assert!(second > first);
        assert!(second >= Duration::from_millis(15));
        assert_eq!(session.url(), "http://localhost:10080");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3)), "3s");
        assert_eq!(format_duration(Duration::from_secs(123)), "2m 03s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }
}
