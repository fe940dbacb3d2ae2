use crate::prelude::*;
use crate::isolar::packet::{self, Packet, Parser, ReadRequest, ReadResponse, TcpFrameFactory};

use {
    bytes::BytesMut,
    net2::TcpStreamExt,
    std::net::SocketAddr,
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::{TcpListener, TcpStream},
    tokio_util::codec::Decoder,
};

const MAX_BUFFER_SIZE: usize = 65536;
const TCP_KEEPALIVE_SECS: u64 = 60;

/// Largest frame the device can legitimately send: header, prefix, RTU
/// head, a full 1000-register payload and the trailer.
const MAX_FRAME_SIZE: usize = packet::HEADER_LEN + 2 + 3 + 2 * packet::MAX_READ_COUNT as usize + 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Listening,
    Connected,
    Closed,
    Faulted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::Faulted => "faulted",
        };
        write!(f, "{}", s)
    }
}

/// Splits the inbound byte stream into complete frames using the length
/// field of the 6-byte header. Validation beyond framing lives in
/// `Parser`, where failures carry typed reasons.
pub struct PacketDecoder;

impl Decoder for PacketDecoder {
    type Item = Vec<u8>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>, Self::Error> {
        if src.len() < packet::HEADER_LEN {
            return Ok(None);
        }

        let declared = Utils::u16ify(src, 4) as usize;
        let total = packet::HEADER_LEN + declared;
        if total > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("declared frame length {} exceeds protocol maximum", total),
            ));
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total).to_vec()))
    }
}

/// How a receive timeout is treated. Production exchanges fault the
/// session; the sweep tools probe ids that are expected to stay silent
/// and must not tear the session down on every miss.
#[derive(Clone, Copy, PartialEq)]
enum TimeoutPolicy {
    Fault,
    RecordOnly,
}

struct Link {
    stream: TcpStream,
    peer: SocketAddr,
    buf: BytesMut,
    decoder: PacketDecoder,
}

/// Owns the command-port listener and the one active inverter
/// connection. The vendor handshake is device-initiated: we listen, the
/// inverter dials in after a UDP announce. All command traffic funnels
/// through `exchange`/`probe`, serialized by the single-slot link lock -
/// the protocol has no request pipelining.
pub struct SessionManager {
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    link: tokio::sync::Mutex<Option<Link>>,
    state: std::sync::Mutex<SessionState>,
    shutdown: broadcast::Sender<()>,
    use_tcp_nodelay: bool,
}

impl SessionManager {
    pub fn new(use_tcp_nodelay: bool) -> Self {
        Self {
            listener: tokio::sync::Mutex::new(None),
            link: tokio::sync::Mutex::new(None),
            state: std::sync::Mutex::new(SessionState::Idle),
            shutdown: broadcast::channel(8).0,
            use_tcp_nodelay,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Connected -> Faulted. A faulted session is never resurrected;
    /// callers re-run discovery and accept a fresh connection.
    fn fault(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == SessionState::Connected || *state == SessionState::Listening {
            *state = SessionState::Faulted;
        }
    }

    /// Binds the command-port listener and moves to Listening.
    pub async fn start(&self, bind: SocketAddr) -> Result<SocketAddr, SessionError> {
        let mut listener = self.listener.lock().await;
        if listener.is_none() {
            let l = TcpListener::bind(bind).await.map_err(SessionError::Bind)?;
            info!("listening for inverter on {}", l.local_addr().map_err(SessionError::Bind)?);
            *listener = Some(l);
        }
        self.set_state(SessionState::Listening);
        listener
            .as_ref()
            .unwrap()
            .local_addr()
            .map_err(SessionError::Bind)
    }

    /// The bound command endpoint, once `start` has run.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Waits for the inverter to dial in. Only valid while Listening (or
    /// after a fault, to pick up a fresh connection on the same bind).
    pub async fn accept(&self, timeout: Duration) -> Result<SocketAddr, SessionError> {
        let listener = self.listener.lock().await;
        let listener = listener.as_ref().ok_or(SessionError::NotConnected)?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let accepted = tokio::select! {
            r = tokio::time::timeout(timeout, listener.accept()) => match r {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(SessionError::Reset(e.to_string())),
                Err(_) => return Err(SessionError::Timeout(timeout)),
            },
            _ = shutdown_rx.recv() => return Err(SessionError::Reset("session closed".to_string())),
        };

        let (stream, peer) = accepted;

        // keepalive keeps NAT/Wi-Fi paths from silently dropping the
        // inverter's long-lived connection
        let std_stream = stream.into_std().map_err(|e| SessionError::Reset(e.to_string()))?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
            warn!("failed to set TCP keepalive: {}", e);
        }
        let stream = TcpStream::from_std(std_stream).map_err(|e| SessionError::Reset(e.to_string()))?;

        if self.use_tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("failed to set TCP_NODELAY: {}", e);
            }
        }

        info!("inverter connected from {}", peer);

        let mut link = self.link.lock().await;
        *link = Some(Link {
            stream,
            peer,
            buf: BytesMut::with_capacity(4096),
            decoder: PacketDecoder,
        });
        self.set_state(SessionState::Connected);

        Ok(peer)
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.lock().await.as_ref().map(|l| l.peer)
    }

    /// Transmits one request and waits for its correlated response.
    /// Strictly sequential: a second caller blocks on the link lock
    /// until the first exchange resolves. Timeout, reset and EOF fault
    /// the session.
    pub async fn exchange(
        &self,
        request: &ReadRequest,
        timeout: Duration,
    ) -> Result<ReadResponse, SessionError> {
        self.exchange_inner(request, timeout, TimeoutPolicy::Fault).await
    }

    /// Same primitive with a record-only timeout, for the diagnostic
    /// sweeps. An unanswered probe is an answer in itself; resets and
    /// EOF still fault.
    pub async fn probe(
        &self,
        request: &ReadRequest,
        timeout: Duration,
    ) -> Result<ReadResponse, SessionError> {
        self.exchange_inner(request, timeout, TimeoutPolicy::RecordOnly)
            .await
    }

    async fn exchange_inner(
        &self,
        request: &ReadRequest,
        timeout: Duration,
        policy: TimeoutPolicy,
    ) -> Result<ReadResponse, SessionError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(SessionError::NotConnected)?;

        // drop anything a previous record-only timeout left behind, so a
        // late straggler can't be misread as this request's reply
        if let Err(e) = Self::drain_stale(link) {
            *guard = None;
            self.fault();
            return Err(e);
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let result = tokio::select! {
            r = tokio::time::timeout(timeout, Self::send_and_receive(link, request)) => match r {
                Ok(inner) => inner,
                Err(_) => Err(SessionError::Timeout(timeout)),
            },
            _ = shutdown_rx.recv() => Err(SessionError::Reset("session closed".to_string())),
        };

        match &result {
            Err(SessionError::Reset(_)) => {
                *guard = None;
                self.fault();
            }
            Err(SessionError::Timeout(_)) if policy == TimeoutPolicy::Fault => {
                *guard = None;
                self.fault();
            }
            _ => {}
        }

        result
    }

    fn drain_stale(link: &mut Link) -> Result<(), SessionError> {
        link.buf.clear();

        let mut scratch = [0u8; 1024];
        loop {
            match link.stream.try_read(&mut scratch) {
                Ok(0) => return Err(SessionError::Reset("connection closed by inverter".to_string())),
                Ok(n) => trace!("drained {} stale bytes", n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(SessionError::Reset(e.to_string())),
            }
        }
    }

    async fn send_and_receive(
        link: &mut Link,
        request: &ReadRequest,
    ) -> Result<ReadResponse, SessionError> {
        let frame = TcpFrameFactory::build(&Packet::ReadRequest(request.clone()));
        trace!(
            "TX {} bytes: device={} register={} count={}",
            frame.len(),
            request.device_id,
            request.register,
            request.count
        );

        link.stream
            .write_all(&frame)
            .await
            .map_err(|e| SessionError::Reset(e.to_string()))?;
        link.stream
            .flush()
            .await
            .map_err(|e| SessionError::Reset(e.to_string()))?;

        loop {
            while let Some(raw) = link
                .decoder
                .decode(&mut link.buf)
                .map_err(|e| SessionError::Reset(e.to_string()))?
            {
                let response = Parser::parse_response(&raw)?;

                if response.transaction_id != request.transaction_id {
                    debug!(
                        "discarding stale frame: transaction {} != {}",
                        response.transaction_id, request.transaction_id
                    );
                    continue;
                }

                if response.device_id != request.device_id {
                    return Err(DecodeError::DeviceIdMismatch {
                        expected: request.device_id,
                        actual: response.device_id,
                    }
                    .into());
                }

                return Ok(response);
            }

            if link.buf.len() >= MAX_BUFFER_SIZE {
                return Err(SessionError::Reset(format!(
                    "receive buffer exceeded {} bytes without a complete frame",
                    MAX_BUFFER_SIZE
                )));
            }

            let n = link
                .stream
                .read_buf(&mut link.buf)
                .await
                .map_err(|e| SessionError::Reset(e.to_string()))?;
            if n == 0 {
                return Err(SessionError::Reset("connection closed by inverter".to_string()));
            }
        }
    }

    /// Releases the transport and the listening endpoint. Safe to call
    /// from any state, any number of times; outstanding waits are
    /// cancelled via the shutdown channel.
    pub async fn close(&self) {
        let _ = self.shutdown.send(());
        *self.link.lock().await = None;
        *self.listener.lock().await = None;
        self.set_state(SessionState::Closed);
    }
}
