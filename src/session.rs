//! Per-connection session.
//!
//! A session walks one connection through
//! `Handshaking -> Streaming -> (ControlInjection) -> Closed`:
//!
//! - **Handshaking**: the first read must carry one complete packet, which is
//!   acknowledged.
//! - **Streaming**: read, reassemble, acknowledge every packet in order.
//!   Ends on EOF, I/O error, timeout, framing error, send failure or quota.
//! - **ControlInjection**: optionally send the codec's control packet once.
//! - **Closed**: flush statistics, drop the connection, report the result.
//!
//! I/O errors never escape a session; they only decide which state comes next.

use crate::codec::{Codec, Packet, ParseResult, ResultCode};
use crate::framer::{Framer, DEFAULT_MAX_BUFFERED};
use crate::stats::{StatWindow, StatsSender};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Bytes requested from the socket per read.
const READ_BUFFER_SIZE: usize = 1024;

/// Settings shared by every session of a server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a read may wait for bytes.
    pub read_timeout: Duration,
    /// How long a reply may take to write.
    pub write_timeout: Duration,
    /// Close after this many data packets.
    pub quota: Option<u64>,
    /// Send the control packet once streaming ends.
    pub send_control: bool,
    /// How often counters are flushed to the aggregator.
    pub collect_interval: Duration,
    pub max_buffered: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(180),
            write_timeout: Duration::from_secs(10),
            quota: None,
            send_control: false,
            collect_interval: Duration::from_secs(30),
            max_buffered: DEFAULT_MAX_BUFFERED,
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// No valid first packet, or no first packet at all.
    HandshakeFailed,
    /// An acknowledgment could not be written.
    SendFailed,
    /// The peer closed its side.
    ReadClosed,
    ReadTimeout,
    ReadFailed,
    /// The stream stopped making sense.
    FramingFailed,
    QuotaReached,
}

/// Final summary of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    pub conn_id: u64,
    /// Data packets received, not counting the handshake.
    pub received: u64,
    /// Acknowledgments sent for data packets.
    pub acks_sent: u64,
    pub control_sent: u64,
    pub end: SessionEnd,
    /// Control injection was attempted and failed.
    pub control_failed: bool,
}

#[derive(Debug, thiserror::Error)]
enum ReadError {
    #[error("connection closed by peer")]
    Closed,
    #[error("no data within {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<ReadError> for SessionEnd {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Closed => SessionEnd::ReadClosed,
            ReadError::TimedOut(_) => SessionEnd::ReadTimeout,
            ReadError::Io(_) => SessionEnd::ReadFailed,
        }
    }
}

/// One connection and everything it has counted so far.
pub struct Session<S, C: Codec> {
    conn_id: u64,
    stream: S,
    codec: Arc<C>,
    framer: Framer<C>,
    config: SessionConfig,
    stats: Option<StatsSender>,
    window: StatWindow,
    received: u64,
    acks_sent: u64,
    control_sent: u64,
    control_failed: bool,
}

impl<S, C> Session<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Codec,
{
    pub fn new(
        conn_id: u64,
        stream: S,
        codec: Arc<C>,
        config: SessionConfig,
        stats: Option<StatsSender>,
    ) -> Self {
        Self {
            conn_id,
            stream,
            framer: Framer::with_limit(Arc::clone(&codec), config.max_buffered),
            codec,
            config,
            stats,
            window: StatWindow::default(),
            received: 0,
            acks_sent: 0,
            control_sent: 0,
            control_failed: false,
        }
    }

    /// Drive the connection to completion.
    ///
    /// The stream is dropped, and so closed, when this returns.
    pub async fn run(mut self) -> SessionResult {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut ticker = time::interval_at(
            Instant::now() + self.config.collect_interval,
            self.config.collect_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = match self.handshake(&mut buf, &mut ticker).await {
            Ok(()) => {
                let end = self.stream_packets(&mut buf, &mut ticker).await;
                if self.config.send_control {
                    self.inject_control().await;
                }
                end
            }
            Err(end) => end,
        };

        self.close(end)
    }

    async fn handshake(
        &mut self,
        buf: &mut [u8],
        ticker: &mut Interval,
    ) -> Result<(), SessionEnd> {
        let n = self.read(buf, ticker).await.map_err(|e| {
            warn!(error = %e, "Cannot get first message from client");
            SessionEnd::HandshakeFailed
        })?;
        debug!(bytes = n, "Got first message");

        let packet = self.framer.first_packet(&buf[..n]).map_err(|e| {
            warn!(error = %e, "Cannot parse first message");
            SessionEnd::HandshakeFailed
        })?;
        debug!(%packet, "Parsed first message");

        let reply = packet.acknowledgment(ResultCode::Ok);
        send(&mut self.stream, &reply, self.config.write_timeout)
            .await
            .map_err(|e| {
                warn!(error = %e, "Cannot send reply for first message");
                SessionEnd::SendFailed
            })?;

        info!("Handshake complete");
        Ok(())
    }

    async fn stream_packets(&mut self, buf: &mut [u8], ticker: &mut Interval) -> SessionEnd {
        // The first pass drains whatever arrived together with the handshake.
        let mut n = 0;
        loop {
            for item in self.framer.reassemble(&buf[..n]) {
                let packet = match item {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(error = %e, "Framing failed, closing connection");
                        return SessionEnd::FramingFailed;
                    }
                };
                debug!(%packet, "Received packet");
                self.received += 1;
                self.window.record(packet.kind());

                let reply = packet.acknowledgment(ResultCode::Ok);
                if let Err(e) = send(&mut self.stream, &reply, self.config.write_timeout).await {
                    warn!(error = %e, "Cannot send reply");
                    return SessionEnd::SendFailed;
                }
                self.acks_sent += 1;
                self.window.record_ack();

                if self.config.quota.is_some_and(|quota| self.received >= quota) {
                    info!(quota = self.received, "Packet quota reached");
                    return SessionEnd::QuotaReached;
                }
            }

            n = match self.read(buf, ticker).await {
                Ok(n) => n,
                Err(ReadError::Closed) => {
                    info!("Client closed the connection");
                    return SessionEnd::ReadClosed;
                }
                Err(e) => {
                    warn!(error = %e, "Cannot get data from connection");
                    return e.into();
                }
            };
            debug!(bytes = n, "Read data");
        }
    }

    async fn inject_control(&mut self) {
        let codec = Arc::clone(&self.codec);
        let payload = codec.control_payload();
        match codec.parse_one(payload) {
            ParseResult::Complete(packet, _) => info!(%packet, "Sending control packet"),
            _ => warn!("Control payload does not decode, sending anyway"),
        }

        match send(&mut self.stream, payload, self.config.write_timeout).await {
            Ok(()) => self.control_sent += 1,
            Err(e) => {
                warn!(error = %e, "Cannot send control packet");
                self.control_failed = true;
            }
        }
    }

    /// Wait for the next chunk of bytes.
    ///
    /// The deadline is fixed when the wait starts; collection ticks that fire
    /// in the meantime flush statistics without extending it.
    async fn read(&mut self, buf: &mut [u8], ticker: &mut Interval) -> Result<usize, ReadError> {
        let deadline = Instant::now() + self.config.read_timeout;
        loop {
            tokio::select! {
                res = time::timeout_at(deadline, self.stream.read(buf)) => {
                    return match res {
                        Ok(Ok(0)) => Err(ReadError::Closed),
                        Ok(Ok(n)) => Ok(n),
                        Ok(Err(e)) => Err(ReadError::Io(e)),
                        Err(_) => Err(ReadError::TimedOut(self.config.read_timeout)),
                    };
                }
                _ = ticker.tick(), if self.stats.is_some() => {
                    if let Some(stats) = &self.stats {
                        stats.flush(&mut self.window);
                    }
                }
            }
        }
    }

    fn close(mut self, end: SessionEnd) -> SessionResult {
        if let Some(stats) = &self.stats {
            stats.flush(&mut self.window);
        }

        let leftover = self.framer.buffered().len();
        if leftover > 0 {
            debug!(bytes = leftover, "Dropping unparsed bytes");
        }

        info!(
            received = self.received,
            acks = self.acks_sent,
            control = self.control_sent,
            ?end,
            "Session closed"
        );

        SessionResult {
            conn_id: self.conn_id,
            received: self.received,
            acks_sent: self.acks_sent,
            control_sent: self.control_sent,
            end,
            control_failed: self.control_failed,
        }
    }
}

/// Write a whole payload within `limit`.
async fn send<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8], limit: Duration) -> io::Result<()> {
    let write = async {
        stream.write_all(data).await?;
        stream.flush().await
    };
    match time::timeout(limit, write).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}
