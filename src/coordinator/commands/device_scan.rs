use crate::prelude::*;

use crate::coordinator::commands::ReadRegisters;
use crate::isolar::session::SessionManager;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Register probed on each candidate id. The operating-mode register
/// answers on every firmware seen so far, which makes it a cheap
/// liveness check.
const PROBE_REGISTER: u16 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceProbe {
    pub id: u8,
    pub responded: bool,
}

/// Sweeps candidate device ids with a one-register probe each. Records
/// who answered; never adopts an id itself - that stays the caller's
/// decision.
pub struct DeviceScan {
    session: Arc<SessionManager>,
    timeout: Duration,
    next_id: u16, // u16 so the counter can step past 255
    end_id: u16,  // inclusive
}

impl DeviceScan {
    pub fn new(
        session: Arc<SessionManager>,
        start_id: u8,
        end_id: u8,
        timeout: Duration,
    ) -> Result<Self> {
        if start_id > end_id {
            bail!("start id {} greater than end id {}", start_id, end_id);
        }

        Ok(Self {
            session,
            timeout,
            next_id: start_id as u16,
            end_id: end_id as u16,
        })
    }

    pub async fn next(&mut self) -> Option<DeviceProbe> {
        if self.next_id > self.end_id {
            return None;
        }

        let id = self.next_id as u8;
        self.next_id += 1;

        let result = match ReadRegisters::probe(
            self.session.clone(),
            id,
            PROBE_REGISTER,
            1,
            self.timeout,
        ) {
            Ok(cmd) => cmd.run().await,
            Err(e) => Err(SessionError::Reset(e.to_string())),
        };

        let responded = match result {
            Ok(_) => true,
            Err(e) => {
                debug!("device id {} did not answer: {}", id, e);
                false
            }
        };

        Some(DeviceProbe { id, responded })
    }
}
