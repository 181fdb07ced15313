//! Port Binder: finds a free loopback port within a reserved range.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;

use crate::config::FabricConfig;
use crate::error::FabricError;

/// Try `preferred` first (falling back to the configured range base if the
/// host has no preference), then walk forward through the reserved range on
/// "address in use", binding loopback only. Exhaustion of the range is a
/// fatal startup error.
pub async fn bind(config: &FabricConfig, preferred: Option<u16>) -> Result<(TcpListener, u16), FabricError> {
    if let Some(port) = preferred {
        match TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {}
            Err(e) => log::warn!("[port-binder] preferred port {port} failed: {e}, falling through to range scan"),
        }
    }

    for offset in 0..config.port_range_size {
        let port = config.port_range_base.saturating_add(offset);
        if Some(port) == preferred {
            continue; // already tried above
        }
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => {
                log::warn!("[port-binder] unexpected bind error on {addr}: {e}, trying next port");
                continue;
            }
        }
    }

    Err(FabricError::PortExhausted {
        base: config.port_range_base,
        size: config.port_range_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_to_loopback_only() {
        let mut config = FabricConfig::default();
        config.port_range_base = 0; // let the OS pick an ephemeral port
        config.port_range_size = 1;
        let (listener, port) = bind(&config, None).await.unwrap();
        let local = listener.local_addr().unwrap();
        assert!(local.ip().is_loopback());
        assert_eq!(local.port(), port);
    }

    #[tokio::test]
    async fn falls_through_to_next_port_when_preferred_is_taken() {
        let mut config = FabricConfig::default();
        config.port_range_base = 0;
        config.port_range_size = 1;
        let (_held, taken_port) = bind(&config, None).await.unwrap();

        config.port_range_base = taken_port;
        config.port_range_size = 2;
        let (listener, port) = bind(&config, None).await.unwrap();
        assert_ne!(port, taken_port);
        drop(listener);
    }

    #[tokio::test]
    async fn exhausted_range_is_fatal() {
        let mut config = FabricConfig::default();
        config.port_range_base = 0;
        config.port_range_size = 1;
        let (_held, taken_port) = bind(&config, None).await.unwrap();

        config.port_range_base = taken_port;
        config.port_range_size = 1;
        let err = bind(&config, None).await.unwrap_err();
        assert!(matches!(err, FabricError::PortExhausted { .. }));
    }
}
