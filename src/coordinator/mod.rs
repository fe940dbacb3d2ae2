use crate::prelude::*;

pub mod commands;

use crate::channels::ChannelData;
use crate::discovery::{DiscoveryClient, InverterEndpoint};
use crate::isolar::session::{SessionManager, SessionState};
use crate::register::{plan_reads, RegisterMap, RegisterSpec, SensorValue};
use crate::sensor::{SensorGroup, SensorSnapshot};
use commands::{DeviceScan, ReadRegisters, RegisterScan};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

// {{{ PacketStats
#[derive(Default)]
pub struct PacketStats {
    pub exchanges_sent: u64,
    pub responses_received: u64,
    pub exchange_timeouts: u64,
    pub checksum_errors: u64,
    pub device_id_mismatches: u64,
    pub session_faults: u64,
    pub polls_completed: u64,
    pub polls_degraded: u64,
    pub polls_failed: u64,
}

impl PacketStats {
    pub fn print_summary(&self) {
        info!("Session statistics:");
        info!("  Exchanges sent: {}", self.exchanges_sent);
        info!("  Responses received: {}", self.responses_received);
        info!("  Exchange timeouts: {}", self.exchange_timeouts);
        info!("  Checksum errors: {}", self.checksum_errors);
        info!("  Device id mismatches: {}", self.device_id_mismatches);
        info!("  Session faults: {}", self.session_faults);
        info!("  Polls completed: {}", self.polls_completed);
        info!("  Polls degraded: {}", self.polls_degraded);
        info!("  Polls failed: {}", self.polls_failed);
    }
}
// }}}

/// Dispatches register reads over the one session: resolves the
/// endpoint, drives the announce/accept handshake, batches poll reads,
/// and hands the same session to the diagnostic sweeps.
#[derive(Clone)]
pub struct Coordinator {
    config: ConfigWrapper,
    channels: Channels,
    session: Arc<SessionManager>,
    discovery: Arc<DiscoveryClient>,
    register_map: RegisterMap,
    endpoint: Arc<Mutex<Option<InverterEndpoint>>>,
    pub shared_stats: Arc<Mutex<PacketStats>>,
}

impl Coordinator {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Result<Self> {
        let inverter = config.inverter();

        let register_map = match &inverter.register_map_file {
            Some(path) => RegisterMap::with_override_file(inverter.model, path)?,
            None => RegisterMap::new(inverter.model),
        };

        let discovery = DiscoveryClient::new(
            inverter.discovery_port,
            inverter.device_id,
            inverter.model,
        );

        Ok(Self {
            config: config.clone(),
            channels,
            session: Arc::new(SessionManager::new(inverter.use_tcp_nodelay())),
            discovery: Arc::new(discovery),
            register_map,
            endpoint: Arc::new(Mutex::new(None)),
            shared_stats: Arc::new(Mutex::new(PacketStats::default())),
        })
    }

    pub fn session(&self) -> Arc<SessionManager> {
        self.session.clone()
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.register_map
    }

    pub fn endpoint(&self) -> Option<InverterEndpoint> {
        self.endpoint.lock().unwrap().clone()
    }

    /// Brings the session up: endpoint from config or discovery, bind,
    /// announce, then wait for the inverter to dial in.
    pub async fn connect(&self) -> Result<InverterEndpoint> {
        if self.session.state() == SessionState::Connected {
            if let Some(endpoint) = self.endpoint() {
                return Ok(endpoint);
            }
        }

        let inverter = self.config.inverter();

        // a manually pinned host survives session loss; a discovered one
        // is re-resolved each time
        let endpoint = match inverter.host {
            Some(addr) => InverterEndpoint {
                addr,
                device_id: self.config.device_id(),
                model: inverter.model,
            },
            None => {
                self.endpoint.lock().unwrap().take();
                self.discovery.discover(inverter.connect_timeout).await?
            }
        };

        let bind = SocketAddr::new(inverter.listen_address, inverter.command_port);
        let bound = self.session.start(bind).await?;

        let advertised_ip = match inverter.local_ip {
            Some(ip) => ip,
            None => Utils::local_ip()?,
        };
        let advertised = SocketAddr::new(advertised_ip, bound.port());

        self.discovery
            .announce(endpoint.addr, advertised, inverter.connect_timeout)
            .await?;

        let peer = self.session.accept(inverter.connect_timeout).await?;
        if peer.ip() != endpoint.addr {
            warn!("connection came from {}, expected {}", peer.ip(), endpoint.addr);
        }

        info!("session established with {}", endpoint);
        *self.endpoint.lock().unwrap() = Some(endpoint.clone());

        Ok(endpoint)
    }

    /// After a fault: discard the dead endpoint (unless pinned) and run
    /// the full discovery + handshake again. Never resurrects the old
    /// session.
    pub async fn reconnect(&self) -> Result<InverterEndpoint> {
        if let Ok(mut stats) = self.shared_stats.lock() {
            stats.session_faults += 1;
        }
        self.connect().await
    }

    fn request_device_id(&self) -> u8 {
        self.endpoint()
            .map(|e| e.device_id)
            .unwrap_or_else(|| self.config.device_id())
    }

    /// Reads one sensor group. Partial failures return everything that
    /// did decode alongside the sensors that didn't.
    pub async fn poll(
        &self,
        group: SensorGroup,
    ) -> Result<HashMap<String, SensorValue>, PollError> {
        if self.session.state() != SessionState::Connected {
            return Err(PollError::NotConnected);
        }

        let inverter = self.config.inverter();

        let mut sensors: Vec<(&str, RegisterSpec)> = Vec::new();
        for name in group.sensors() {
            match self.register_map.resolve(name) {
                Ok(spec) => sensors.push((*name, spec)),
                Err(e) => debug!("skipping {}: {}", name, e),
            }
        }

        let specs: Vec<RegisterSpec> = sensors.iter().map(|(_, s)| *s).collect();
        let blocks = plan_reads(&specs, inverter.register_block_size());

        let mut words_by_register: HashMap<u16, u16> = HashMap::new();
        let mut block_errors: Vec<(u16, u16, String)> = Vec::new();

        let mut blocks = blocks.into_iter();
        for block in blocks.by_ref() {
            let read = ReadRegisters::new(
                self.session.clone(),
                self.request_device_id(),
                block.start,
                block.count,
                inverter.read_timeout,
            );

            let result = match read {
                Ok(cmd) => {
                    if let Ok(mut stats) = self.shared_stats.lock() {
                        stats.exchanges_sent += 1;
                    }
                    cmd.run().await
                }
                Err(e) => Err(SessionError::Reset(e.to_string())),
            };

            match result {
                Ok(words) => {
                    if let Ok(mut stats) = self.shared_stats.lock() {
                        stats.responses_received += 1;
                    }
                    for (pos, word) in words.into_iter().enumerate() {
                        words_by_register.insert(block.start + pos as u16, word);
                    }
                }
                Err(e) => {
                    self.record_exchange_error(&e);
                    let fatal = e.is_fatal();
                    block_errors.push((block.start, block.count, e.to_string()));
                    if fatal {
                        break;
                    }
                }
            }
        }

        // a fatal error faulted the session; remaining blocks would only
        // pile up NotConnected errors
        for block in blocks {
            block_errors.push((block.start, block.count, "session faulted mid-poll".to_string()));
        }

        let mut values = HashMap::new();
        let mut failed = Vec::new();

        for (name, spec) in sensors {
            let mut words = Vec::with_capacity(spec.words as usize);
            for register in spec.address..=spec.last_register() {
                if let Some(word) = words_by_register.get(&register) {
                    words.push(*word);
                }
            }

            if words.len() != spec.words as usize {
                let reason = block_errors
                    .iter()
                    .find(|(start, count, _)| {
                        spec.address >= *start
                            && (spec.address as u32) < *start as u32 + *count as u32
                    })
                    .map(|(_, _, e)| e.clone())
                    .unwrap_or_else(|| "register not read".to_string());
                failed.push(FailedSensor {
                    name: name.to_string(),
                    reason,
                });
                continue;
            }

            match RegisterMap::decode_value(&spec, &words) {
                Ok(value) => {
                    values.insert(name.to_string(), value);
                }
                Err(e) => failed.push(FailedSensor {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
            }
        }

        if failed.is_empty() {
            Ok(values)
        } else {
            Err(PollError::Partial {
                partial: values,
                failed,
            })
        }
    }

    /// Polls every group and assembles a snapshot. A degraded cycle
    /// still publishes what decoded; only a cycle with nothing at all
    /// (or no session) fails outright.
    pub async fn poll_all(&self) -> Result<SensorSnapshot, PollError> {
        let mut values = HashMap::new();
        let mut failed = Vec::new();

        for group in SensorGroup::all() {
            match self.poll(*group).await {
                Ok(group_values) => values.extend(group_values),
                Err(PollError::NotConnected) => {
                    if let Ok(mut stats) = self.shared_stats.lock() {
                        stats.polls_failed += 1;
                    }
                    return Err(PollError::NotConnected);
                }
                Err(PollError::Partial {
                    partial,
                    failed: group_failed,
                }) => {
                    values.extend(partial);
                    failed.extend(group_failed);
                }
            }
        }

        if values.is_empty() {
            if let Ok(mut stats) = self.shared_stats.lock() {
                stats.polls_failed += 1;
            }
            return Err(PollError::Partial {
                partial: values,
                failed,
            });
        }

        let snapshot = SensorSnapshot::from_values(values.clone());
        let _ = self
            .channels
            .to_reporting
            .send(ChannelData::Snapshot(snapshot.clone()));

        if failed.is_empty() {
            if let Ok(mut stats) = self.shared_stats.lock() {
                stats.polls_completed += 1;
            }
            Ok(snapshot)
        } else {
            if let Ok(mut stats) = self.shared_stats.lock() {
                stats.polls_degraded += 1;
            }
            for f in &failed {
                warn!("sensor {} failed: {}", f.name, f.reason);
            }
            Err(PollError::Partial {
                partial: values,
                failed,
            })
        }
    }

    fn record_exchange_error(&self, error: &SessionError) {
        if let Ok(mut stats) = self.shared_stats.lock() {
            match error {
                SessionError::Timeout(_) => stats.exchange_timeouts += 1,
                SessionError::Decode(DecodeError::ChecksumMismatch { .. }) => {
                    stats.checksum_errors += 1
                }
                SessionError::Decode(DecodeError::DeviceIdMismatch { .. }) => {
                    stats.device_id_mismatches += 1
                }
                _ => {}
            }
        }

        // the device told us who it actually is; adopt that for the next
        // cycle unless the config says otherwise
        if let SessionError::Decode(DecodeError::DeviceIdMismatch { expected, actual }) = error {
            if self.config.strict_device_check() {
                warn!(
                    "device id mismatch (configured {}, device says {}); strict_device_check is on, not adopting",
                    expected, actual
                );
            } else {
                warn!(
                    "device id mismatch (configured {}, device says {}); adopting {}",
                    expected, actual, actual
                );
                self.config.update_device_id(*actual);
                if let Some(endpoint) = self.endpoint.lock().unwrap().as_mut() {
                    endpoint.device_id = *actual;
                }
            }
        }
    }

    /// Diagnostic sweep over a register range, sharing this
    /// coordinator's session and map.
    pub fn register_scan(&self, start_register: u16, register_count: u16) -> Result<RegisterScan> {
        let inverter = self.config.inverter();
        RegisterScan::new(
            self.session.clone(),
            self.register_map.clone(),
            self.request_device_id(),
            start_register,
            register_count,
            inverter.register_block_size(),
            inverter.read_timeout,
        )
    }

    /// Diagnostic sweep over candidate device ids.
    pub fn device_scan(&self, start_id: u8, end_id: u8) -> Result<DeviceScan> {
        let inverter = self.config.inverter();
        DeviceScan::new(self.session.clone(), start_id, end_id, inverter.read_timeout)
    }

    pub async fn stop(&self) {
        self.session.close().await;
        let _ = self.channels.to_reporting.send(ChannelData::Shutdown);
    }
}
