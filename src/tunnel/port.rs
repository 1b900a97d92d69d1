//! Local port selection
//!
//! Random ports in a friendly range first, then whatever the OS hands out.

use std::net::TcpListener;

use rand::Rng;

use super::models::{TunnelError, TunnelResult};
use crate::config::TunnelSettings;

/// Whether `port` can currently be bound on `bind_address`
pub fn is_port_free(bind_address: &str, port: u16) -> bool {
    TcpListener::bind((bind_address, port)).is_ok()
}

/// Pick a local port for a new tunnel
pub fn allocate_local_port(bind_address: &str, settings: &TunnelSettings) -> TunnelResult<u16> {
    let (low, high) = if settings.port_range_start <= settings.port_range_end {
        (settings.port_range_start, settings.port_range_end)
    } else {
        (settings.port_range_end, settings.port_range_start)
    };

    let mut rng = rand::thread_rng();
    for _ in 0..settings.probe_attempts {
        let port = rng.gen_range(low..=high);
        if port != 0 && is_port_free(bind_address, port) {
            return Ok(port);
        }
        tracing::debug!("Port {} on {} is taken", port, bind_address);
    }

    let listener = TcpListener::bind((bind_address, 0)).map_err(|source| TunnelError::Bind {
        address: bind_address.to_string(),
        port: 0,
        source,
    })?;
    let port = listener.local_addr()?.port();
    tracing::debug!("Falling back to OS-assigned port {}", port);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_port_in_range() {
        let settings = TunnelSettings::default();
        let port = allocate_local_port("127.0.0.1", &settings).unwrap();
        assert!((10000..=65000).contains(&port));
    }

    #[test]
    fn test_falls_back_when_range_exhausted() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = taken.local_addr().unwrap().port();

        let settings = TunnelSettings {
            port_range_start: busy,
            port_range_end: busy,
            probe_attempts: 3,
            ..TunnelSettings::default()
        };

        let port = allocate_local_port("127.0.0.1", &settings).unwrap();
        assert_ne!(port, busy);
        assert!(port > 0);
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let settings = TunnelSettings {
            probe_attempts: 0,
            ..TunnelSettings::default()
        };
        // TEST-NET-1 is never a local address
        let err = allocate_local_port("192.0.2.1", &settings).unwrap_err();
        assert!(matches!(err, TunnelError::Bind { port: 0, .. }));
    }

    #[test]
    fn test_is_port_free() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        assert!(!is_port_free("127.0.0.1", port));
        drop(taken);
    }
}
