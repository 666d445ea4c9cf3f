//! Advertised address detection

use conduit_core::{CoreError, Result};
use std::net::{IpAddr, UdpSocket};

/// Outbound IPv4 address of this host.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub fn local_ip() -> Result<IpAddr> {
    let detect = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };

    match detect() {
        Ok(ip) if !ip.is_unspecified() => Ok(ip),
        Ok(_) => Err(CoreError::RegistrationFailed(
            "get local ip empty".to_string(),
        )),
        Err(e) => Err(CoreError::RegistrationFailed(format!(
            "get local ip failed: {}",
            e
        ))),
    }
}

/// `configured` when set, the detected outbound address otherwise
pub fn advertised_address(configured: Option<&str>) -> Result<String> {
    match configured.map(str::trim).filter(|addr| !addr.is_empty()) {
        Some(addr) => Ok(addr.to_string()),
        None => local_ip().map(|ip| ip.to_string()),
    }
}
