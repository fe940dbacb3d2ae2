use crate::prelude::*;
use crate::register::Model;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Probe the Wi-Fi dongles answer with their address triple.
const PROBE_MESSAGE: &str = "WIFIKIT-214028-READ";

/// Where a discovered (or pinned) inverter lives on the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InverterEndpoint {
    pub addr: IpAddr,
    pub device_id: u8,
    pub model: Option<Model>,
}

impl std::fmt::Display for InverterEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (device {})", self.addr, self.device_id)
    }
}

/// Stateless UDP client for locating an inverter and telling it where to
/// dial in. Every call stands alone; retries are the caller's choice.
pub struct DiscoveryClient {
    discovery_port: u16,
    device_id: u8,
    model: Option<Model>,
}

impl DiscoveryClient {
    pub fn new(discovery_port: u16, device_id: u8, model: Option<Model>) -> Self {
        Self {
            discovery_port,
            device_id,
            model,
        }
    }

    /// Broadcasts a probe and waits for the first valid reply. The reply
    /// is ASCII `ip,mac[,module]`; the device id is not on the wire and
    /// comes from configuration.
    pub async fn discover(&self, timeout: Duration) -> Result<InverterEndpoint, DiscoveryError> {
        let target = SocketAddr::from(([255, 255, 255, 255], self.discovery_port));
        self.discover_at(target, timeout).await
    }

    /// Directed probe, for networks where broadcast doesn't reach the
    /// inverter's segment (or for tests).
    pub async fn discover_at(
        &self,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<InverterEndpoint, DiscoveryError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;

        debug!("sending discovery probe to {}", target);
        socket.send_to(PROBE_MESSAGE.as_bytes(), target).await?;

        let mut buf = [0u8; 1024];
        let (len, from) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| DiscoveryError::NoResponse(timeout))??;

        let reply = String::from_utf8_lossy(&buf[..len]);
        let addr = Self::parse_reply(&reply, from.ip())?;

        info!("discovered inverter at {} ({})", addr, reply.trim());

        Ok(InverterEndpoint {
            addr,
            device_id: self.device_id,
            model: self.model,
        })
    }

    /// Tells the inverter where our command listener is. The device only
    /// dials in after receiving this, so it precedes every accept. The
    /// dongle acks the datagram; no ack within the timeout means the
    /// nudge was lost.
    pub async fn announce(
        &self,
        inverter: IpAddr,
        local: SocketAddr,
        timeout: Duration,
    ) -> Result<(), DiscoveryError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let target = SocketAddr::new(inverter, self.discovery_port);
        let message = format!("set>server={}:{};", local.ip(), local.port());

        debug!("announcing {} to {}", message, target);
        socket.send_to(message.as_bytes(), target).await?;

        let mut buf = [0u8; 1024];
        tokio::time::timeout(timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| DiscoveryError::NoResponse(timeout))??;

        Ok(())
    }

    /// Replies look like `192.168.1.130,ACCF23A1B2C3,HF-A11`. Some
    /// firmware omits the module field; the ip must parse and should
    /// agree with the datagram's source.
    fn parse_reply(reply: &str, from: IpAddr) -> Result<IpAddr, DiscoveryError> {
        let mut fields = reply.trim().split(',');

        let ip_field = fields
            .next()
            .ok_or_else(|| DiscoveryError::InvalidReply(reply.to_string()))?;

        let addr: IpAddr = ip_field
            .parse()
            .map_err(|_| DiscoveryError::InvalidReply(reply.to_string()))?;

        if addr != from {
            warn!("discovery reply claims {} but came from {}", addr, from);
        }

        Ok(addr)
    }
}
