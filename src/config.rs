use crate::prelude::*;
use crate::register::Model;

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The surrounding integration must not poll faster than this; the
/// protocol is single-session and the inverter is easily overwhelmed.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub inverter: Inverter,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Inverter {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    /// Pinned inverter address. Absent, discovery finds one - and
    /// re-resolves it on session loss.
    pub host: Option<IpAddr>,

    #[serde(default = "Config::default_device_id")]
    pub device_id: u8,

    pub model: Option<Model>,

    /// Address our announce datagram advertises. Detected when absent.
    pub local_ip: Option<IpAddr>,

    #[serde(default = "Config::default_listen_address")]
    pub listen_address: IpAddr,

    #[serde(default = "Config::default_command_port")]
    pub command_port: u16,

    #[serde(default = "Config::default_discovery_port")]
    pub discovery_port: u16,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_poll_interval")]
    pub poll_interval: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_read_timeout")]
    pub read_timeout: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_connect_timeout")]
    pub connect_timeout: Duration,

    pub register_block_size: Option<u16>,
    pub use_tcp_nodelay: Option<bool>,

    /// When true, a responding device id that differs from `device_id`
    /// is reported but never adopted.
    #[serde(default)]
    pub strict_device_check: bool,

    /// Optional JSON file overriding individual register specs.
    pub register_map_file: Option<String>,
}

impl Inverter {
    pub fn register_block_size(&self) -> u16 {
        self.register_block_size.unwrap_or(40)
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.use_tcp_nodelay.unwrap_or(true)
    }
}
// }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|err| anyhow!("error parsing {}: {}", file, err))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.inverter.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                "poll_interval {:?} below the {:?} floor; the floor applies",
                self.inverter.poll_interval, MIN_POLL_INTERVAL
            );
        }
        Ok(())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_device_id() -> u8 {
        1
    }

    fn default_listen_address() -> IpAddr {
        IpAddr::from([0, 0, 0, 0])
    }

    fn default_command_port() -> u16 {
        8899
    }

    fn default_discovery_port() -> u16 {
        58899
    }

    fn default_poll_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_read_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_connect_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

/// Shared, cheaply cloneable config handle. Interior mutability exists
/// for exactly one runtime update: adopting the device id an inverter
/// actually answers with.
#[derive(Clone)]
pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    pub fn inverter(&self) -> Inverter {
        self.config.lock().unwrap().inverter.clone()
    }

    pub fn loglevel(&self) -> String {
        self.config.lock().unwrap().loglevel.clone()
    }

    pub fn device_id(&self) -> u8 {
        self.config.lock().unwrap().inverter.device_id
    }

    pub fn strict_device_check(&self) -> bool {
        self.config.lock().unwrap().inverter.strict_device_check
    }

    /// Effective poll interval, floor applied.
    pub fn poll_interval(&self) -> Duration {
        self.inverter().poll_interval.max(MIN_POLL_INTERVAL)
    }

    pub fn update_device_id(&self, device_id: u8) {
        self.config.lock().unwrap().inverter.device_id = device_id;
    }
}
