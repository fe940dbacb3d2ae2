use crate::prelude::*;

use crate::channels::ChannelData;
use crate::coordinator::Coordinator;

use std::sync::Arc;

/// Drives the poll cycle on an interval. Thin by design: decoded values
/// come out of the coordinator, and the reporting layer downstream keeps
/// prior readings across failed cycles.
pub struct Scheduler {
    config: ConfigWrapper,
    coordinator: Arc<Coordinator>,
    channels: Channels,
}

impl Scheduler {
    pub fn new(config: ConfigWrapper, coordinator: Arc<Coordinator>, channels: Channels) -> Self {
        Self {
            config,
            coordinator,
            channels,
        }
    }

    pub async fn start(&self) -> Result<()> {
        // poll_interval() applies the 15s floor; the inverter's
        // single-session protocol does not tolerate being hammered
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut reporting_rx = self.channels.to_reporting.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_cycle().await,
                msg = reporting_rx.recv() => {
                    if matches!(msg, Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        info!("scheduler stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn run_cycle(&self) {
        match self.coordinator.poll_all().await {
            Ok(snapshot) => {
                debug!("poll cycle complete: {} sensors", snapshot.values.len());
            }
            Err(PollError::Partial { partial, failed }) => {
                warn!(
                    "poll cycle degraded: {} decoded, {} failed",
                    partial.len(),
                    failed.len()
                );
                self.recover_if_faulted().await;
            }
            Err(PollError::NotConnected) => {
                info!("no session; running discovery + handshake");
                self.recover_if_faulted().await;
            }
        }
    }

    async fn recover_if_faulted(&self) {
        use crate::isolar::session::SessionState;

        if self.coordinator.session().state() == SessionState::Connected {
            return;
        }

        if let Err(e) = self.coordinator.reconnect().await {
            warn!("reconnect failed, will retry next cycle: {}", e);
        }
    }
}
