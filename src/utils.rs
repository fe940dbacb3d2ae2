use crate::prelude::*;

use std::net::IpAddr;

pub struct Utils;

impl Utils {
    /// Big-endian u16 at `offset`. The vendor protocol is big-endian
    /// throughout, register words included.
    pub fn u16ify(data: &[u8], offset: usize) -> u16 {
        u16::from_be_bytes([data[offset], data[offset + 1]])
    }

    /// Split a response payload into big-endian register words.
    pub fn words(payload: &[u8]) -> Vec<u16> {
        payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }

    pub fn round(value: f64, decimals: u32) -> f64 {
        let factor = 10_f64.powi(decimals as i32);
        (value * factor).round() / factor
    }

    /// Registers holding text pack two ASCII bytes per word, high byte
    /// first. NULs and padding are stripped.
    pub fn ascii_from_words(words: &[u16]) -> String {
        words
            .iter()
            .flat_map(|w| [(w >> 8) as u8, (w & 0xff) as u8])
            .filter(|b| *b != 0)
            .map(char::from)
            .collect::<String>()
            .trim()
            .to_string()
    }

    /// Best-effort local address detection: connect a UDP socket outward
    /// and read back the chosen source address. No packet is sent.
    pub fn local_ip() -> Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:53")?;
        Ok(socket.local_addr()?.ip())
    }
}
