//! Local port-forward tunnels into cluster pods

pub mod forwarder;
pub mod manager;
pub mod models;
pub mod port;

pub use forwarder::{ForwardTarget, KubeForwarder, PortForwarder, ResolvedTarget};
pub use manager::{TunnelHandle, TunnelManager};
pub use models::{ForwardRequest, PortForwardSession, SessionUrls, TunnelError, TunnelResult};
