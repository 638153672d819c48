//! Codec seam between the connection engine and a wire format.
//!
//! The session and framer only need four things from a protocol:
//! parse one packet off the front of a buffer, classify it for statistics,
//! build its acknowledgment, and hand out a fixed control payload.

use bytes::Bytes;
use std::fmt;

/// Statistics bucket a packet falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Real-time data.
    Live,
    /// Data replayed from the device's history buffer.
    Historical,
}

/// Result code carried in an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
}

/// Outcome of parsing the front of a buffer.
#[derive(Debug)]
pub enum ParseResult<P> {
    /// A packet and the number of bytes it occupied.
    Complete(P, usize),
    /// The buffer holds a prefix of a packet; read more.
    Incomplete,
    /// The buffer does not start with a valid packet.
    Malformed(String),
}

/// A decoded packet.
pub trait Packet: fmt::Display {
    fn kind(&self) -> PacketKind;

    /// Build the reply bytes acknowledging this packet.
    fn acknowledgment(&self, code: ResultCode) -> Bytes;
}

/// A wire format the server can speak.
pub trait Codec: Send + Sync + 'static {
    type Packet: Packet + Send;

    /// Parse exactly one packet from the start of `input`.
    fn parse_one(&self, input: &[u8]) -> ParseResult<Self::Packet>;

    /// Pre-encoded out-of-band control packet.
    fn control_payload(&self) -> &[u8];
}
