pub mod config;
pub mod kubernetes;
pub mod tunnel;

pub use config::AppConfig;
pub use kubernetes::{ConnectionEstablisher, ExecInterceptor, TokenProvider};
pub use tunnel::TunnelManager;
