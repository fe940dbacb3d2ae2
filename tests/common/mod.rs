#![allow(dead_code)]

use isolar_bridge::channels::Channels;
use isolar_bridge::config::{Config, ConfigWrapper};
use isolar_bridge::coordinator::Coordinator;
use isolar_bridge::isolar::packet::{Packet, Parser, ReadResponse, TcpFrameFactory};
use isolar_bridge::isolar::session::SessionManager;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// A scripted inverter. Like the real hardware it dials *in* to the
/// engine's listener, then answers register reads from a value function.
/// Behavior knobs simulate the interesting failure modes.
pub struct MockInverter {
    /// Value returned for each register.
    values: Arc<dyn Fn(u16) -> u16 + Send + Sync>,
    /// When set, requests addressed to other device ids are ignored.
    respond_to_ids: Option<Vec<u8>>,
    /// Requests whose start register falls in one of these inclusive
    /// ranges are silently dropped.
    silent_ranges: Vec<(u16, u16)>,
    /// Replies to these start registers get a flipped trailer bit.
    corrupt_checksum_at: Vec<u16>,
    /// Reply with this device id instead of echoing the request's.
    reply_device_id: Option<u8>,
    /// Hang up after this many replies.
    close_after: Option<usize>,
}

impl Default for MockInverter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInverter {
    pub fn new() -> Self {
        Self {
            values: Arc::new(|register| register),
            respond_to_ids: None,
            silent_ranges: Vec::new(),
            corrupt_checksum_at: Vec::new(),
            reply_device_id: None,
            close_after: None,
        }
    }

    pub fn with_values<F>(mut self, f: F) -> Self
    where
        F: Fn(u16) -> u16 + Send + Sync + 'static,
    {
        self.values = Arc::new(f);
        self
    }

    pub fn respond_to_ids(mut self, ids: Vec<u8>) -> Self {
        self.respond_to_ids = Some(ids);
        self
    }

    pub fn silent_range(mut self, start: u16, end: u16) -> Self {
        self.silent_ranges.push((start, end));
        self
    }

    pub fn corrupt_checksum_at(mut self, register: u16) -> Self {
        self.corrupt_checksum_at.push(register);
        self
    }

    pub fn reply_device_id(mut self, id: u8) -> Self {
        self.reply_device_id = Some(id);
        self
    }

    pub fn close_after(mut self, replies: usize) -> Self {
        self.close_after = Some(replies);
        self
    }

    /// Dial the engine's listener and serve until EOF or `close_after`.
    pub fn spawn(self, engine: SocketAddr) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = match TcpStream::connect(engine).await {
                Ok(s) => s,
                Err(_) => return,
            };

            let mut served = 0usize;

            loop {
                let mut header = [0u8; 6];
                if stream.read_exact(&mut header).await.is_err() {
                    return;
                }
                let declared = u16::from_be_bytes([header[4], header[5]]) as usize;
                let mut rest = vec![0u8; declared];
                if stream.read_exact(&mut rest).await.is_err() {
                    return;
                }

                let mut frame = header.to_vec();
                frame.extend_from_slice(&rest);

                let request = match Parser::parse_request(&frame) {
                    Ok(r) => r,
                    Err(_) => continue,
                };

                if let Some(ids) = &self.respond_to_ids {
                    if !ids.contains(&request.device_id) {
                        continue;
                    }
                }

                if self
                    .silent_ranges
                    .iter()
                    .any(|(s, e)| request.register >= *s && request.register <= *e)
                {
                    continue;
                }

                let values: Vec<u8> = (0..request.count)
                    .map(|pos| request.register.wrapping_add(pos))
                    .flat_map(|register| (self.values)(register).to_be_bytes())
                    .collect();

                let response = ReadResponse {
                    transaction_id: request.transaction_id,
                    device_id: self.reply_device_id.unwrap_or(request.device_id),
                    function: request.function,
                    values,
                };

                let mut bytes = TcpFrameFactory::build(&Packet::ReadResponse(response));
                if self.corrupt_checksum_at.contains(&request.register) {
                    let last = bytes.len() - 1;
                    bytes[last] ^= 0x01;
                }

                if stream.write_all(&bytes).await.is_err() {
                    return;
                }

                served += 1;
                if Some(served) == self.close_after {
                    return;
                }
            }
        })
    }
}

/// Minimal config with 1s timeouts so failure-path tests stay quick.
pub fn test_config() -> ConfigWrapper {
    let config: Config = serde_yaml::from_str(
        r#"
inverter:
  device_id: 1
  read_timeout: 1
  connect_timeout: 1
"#,
    )
    .unwrap();
    ConfigWrapper::from_config(config)
}

pub fn test_config_for_model(model: &str) -> ConfigWrapper {
    let config: Config = serde_yaml::from_str(&format!(
        r#"
inverter:
  device_id: 1
  model: {}
  read_timeout: 1
  connect_timeout: 1
"#,
        model
    ))
    .unwrap();
    ConfigWrapper::from_config(config)
}

/// Engine listening, mock dialed in, session Connected.
pub async fn connected_coordinator(
    config: ConfigWrapper,
    mock: MockInverter,
) -> (Arc<Coordinator>, Channels, JoinHandle<()>) {
    let channels = Channels::new();
    let coordinator = Coordinator::new(config, channels.clone()).unwrap();

    let session = coordinator.session();
    let bound = session
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mock_handle = mock.spawn(bound);
    session.accept(ACCEPT_TIMEOUT).await.unwrap();

    (Arc::new(coordinator), channels, mock_handle)
}

/// Listening session with the mock dialed in, no coordinator on top.
pub async fn connected_session(mock: MockInverter) -> (Arc<SessionManager>, JoinHandle<()>) {
    let session = Arc::new(SessionManager::new(true));
    let bound = session
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mock_handle = mock.spawn(bound);
    session.accept(ACCEPT_TIMEOUT).await.unwrap();

    (session, mock_handle)
}
