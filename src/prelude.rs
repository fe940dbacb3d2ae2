pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};

pub use tokio::sync::{broadcast, oneshot};

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::error::{
    DecodeError, DiscoveryError, FailedSensor, PollError, SessionError, UnsupportedSensor,
};
pub use crate::options::Options;
pub use crate::utils::Utils;
