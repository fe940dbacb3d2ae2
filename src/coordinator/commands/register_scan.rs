use crate::prelude::*;

use crate::coordinator::commands::ReadRegisters;
use crate::isolar::packet::MAX_READ_COUNT;
use crate::isolar::session::SessionManager;
use crate::register::{RegisterMap, SensorValue};

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One swept register. `raw` is present whenever the device answered,
/// mapped or not; `sensor`/`decoded` only when the register map knows
/// the address. A failed sub-range yields results with `error` set and
/// the sweep moves on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResult {
    pub register: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<[u8; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<SensorValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A lazy, finite, non-restartable sweep over a register range. Each
/// call to `next` yields one register, fetching the underlying blocks as
/// it goes; a fresh sweep means a fresh `RegisterScan`.
pub struct RegisterScan {
    session: Arc<SessionManager>,
    map: RegisterMap,
    device_id: u8,
    timeout: Duration,
    block_size: u16,
    next_register: u32,
    end: u32, // exclusive, clamped to the top of register space
    pending: VecDeque<ScanResult>,
}

impl RegisterScan {
    pub fn new(
        session: Arc<SessionManager>,
        map: RegisterMap,
        device_id: u8,
        start_register: u16,
        register_count: u16,
        block_size: u16,
        timeout: Duration,
    ) -> Result<Self> {
        if register_count == 0 || register_count > MAX_READ_COUNT {
            bail!(
                "register count {} outside 1..={}",
                register_count,
                MAX_READ_COUNT
            );
        }

        let start = start_register as u32;
        let end = (start + register_count as u32).min(1 << 16);

        Ok(Self {
            session,
            map,
            device_id,
            timeout,
            block_size: block_size.clamp(1, MAX_READ_COUNT),
            next_register: start,
            end,
            pending: VecDeque::new(),
        })
    }

    pub async fn next(&mut self) -> Option<ScanResult> {
        loop {
            if let Some(result) = self.pending.pop_front() {
                return Some(result);
            }

            if self.next_register >= self.end {
                return None;
            }

            let start = self.next_register as u16;
            let count = (self.end - self.next_register).min(self.block_size as u32) as u16;
            self.next_register += count as u32;

            self.fetch_block(start, count).await;
        }
    }

    async fn fetch_block(&mut self, start: u16, count: u16) {
        let read = match ReadRegisters::probe(
            self.session.clone(),
            self.device_id,
            start,
            count,
            self.timeout,
        ) {
            Ok(cmd) => cmd.run().await,
            Err(e) => Err(SessionError::Reset(e.to_string())),
        };

        match read {
            Ok(words) => {
                for (pos, word) in words.into_iter().enumerate() {
                    let register = start + pos as u16;
                    let (sensor, decoded) = self.decode_attempt(register, word);
                    self.pending.push_back(ScanResult {
                        register,
                        raw: Some(word.to_be_bytes()),
                        sensor,
                        decoded,
                        error: None,
                    });
                }
            }
            Err(e) => {
                warn!(
                    "scan block {}..={} failed: {}",
                    start,
                    start as u32 + count as u32 - 1,
                    e
                );
                for pos in 0..count {
                    self.pending.push_back(ScanResult {
                        register: start + pos,
                        raw: None,
                        sensor: None,
                        decoded: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
    }

    fn decode_attempt(&self, register: u16, word: u16) -> (Option<String>, Option<SensorValue>) {
        match self.map.sensor_at(register) {
            Some((name, spec)) => {
                let decoded = RegisterMap::decode_value(&spec, &[word]).ok();
                (Some(name.to_string()), decoded)
            }
            None => (None, None),
        }
    }
}
