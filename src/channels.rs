use crate::prelude::*;
use crate::sensor::SensorSnapshot;

/// Traffic on the reporting boundary. The home-automation/display layer
/// subscribes here; it never touches the transport.
#[derive(Debug, Clone)]
pub enum ChannelData {
    Snapshot(SensorSnapshot),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct Channels {
    pub to_reporting: broadcast::Sender<ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            to_reporting: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
