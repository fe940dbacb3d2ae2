use crate::prelude::*;

use crate::isolar::packet::{self, DeviceFunction, ReadRequest, MAX_READ_COUNT};
use crate::isolar::session::SessionManager;

use std::sync::Arc;
use std::time::Duration;

/// The one exchange primitive everything read-shaped is built on: the
/// poller, the register sweep and the device-id sweep all funnel through
/// here, so they all inherit the same session discipline.
pub struct ReadRegisters {
    session: Arc<SessionManager>,
    device_id: u8,
    register: u16,
    count: u16,
    timeout: Duration,
    probe: bool,
}

impl ReadRegisters {
    pub fn new<U>(
        session: Arc<SessionManager>,
        device_id: u8,
        register: U,
        count: u16,
        timeout: Duration,
    ) -> Result<Self>
    where
        U: Into<u16>,
    {
        if count == 0 || count > MAX_READ_COUNT {
            bail!("register count {} outside 1..={}", count, MAX_READ_COUNT);
        }

        Ok(Self {
            session,
            device_id,
            register: register.into(),
            count,
            timeout,
            probe: false,
        })
    }

    /// Sweep variant: a timeout is recorded, not treated as a session
    /// fault.
    pub fn probe<U>(
        session: Arc<SessionManager>,
        device_id: u8,
        register: U,
        count: u16,
        timeout: Duration,
    ) -> Result<Self>
    where
        U: Into<u16>,
    {
        let mut cmd = Self::new(session, device_id, register, count, timeout)?;
        cmd.probe = true;
        Ok(cmd)
    }

    pub async fn run(&self) -> Result<Vec<u16>, SessionError> {
        let request = ReadRequest {
            transaction_id: packet::next_transaction_id(),
            device_id: self.device_id,
            function: DeviceFunction::ReadHold,
            register: self.register,
            count: self.count,
        };

        debug!(
            "reading registers {}..={} from device {}",
            self.register,
            self.register as u32 + self.count as u32 - 1,
            self.device_id
        );

        let response = if self.probe {
            self.session.probe(&request, self.timeout).await?
        } else {
            self.session.exchange(&request, self.timeout).await?
        };

        if response.function != request.function {
            return Err(DecodeError::Malformed(format!(
                "response function {:?} does not answer {:?}",
                response.function, request.function
            ))
            .into());
        }

        let words = response.words();
        if words.len() != self.count as usize {
            return Err(DecodeError::Malformed(format!(
                "expected {} register words, got {}",
                self.count,
                words.len()
            ))
            .into());
        }

        Ok(words)
    }
}
