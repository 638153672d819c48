//! NDTP (navigation data transfer protocol) codec.
//!
//! Every packet is an NPL header followed by an NPH header and a payload:
//!
//! ```text
//! NPL (15 bytes)
//!   0x7E 0x7E | data_size u16le | flags u16le | crc u16be | type u8 | peer u32le | request u16le
//! NPH (10 bytes)
//!   service u16le | packet_type u16le | flags u16le | request_id u32le
//! payload (data_size - 10 bytes)
//! ```
//!
//! The CRC is CRC-16/MODBUS over everything after the NPL header.
//!
//! The server only needs framing, a result reply for every packet and one
//! fixed control packet; payloads are never interpreted.

pub mod parser;

pub use parser::{NdtpPacket, RESULT_OK};

use crate::codec::{Codec, PacketKind, ParseResult, ResultCode};
use bytes::Bytes;

/// Generic-controls command (packet type 110) with reply requested.
pub const CONTROL_PACKET: [u8; 27] = [
    126, 126, 12, 0, 2, 0, 37, 196, 2, 0, 0, 0, 0, 0, 0, 0, 0, 110, 0, 1, 0, 0, 0, 0, 0, 6, 0,
];

/// NDTP implementation of the codec seam.
#[derive(Debug, Clone, Copy, Default)]
pub struct NdtpCodec;

impl Codec for NdtpCodec {
    type Packet = NdtpPacket;

    fn parse_one(&self, input: &[u8]) -> ParseResult<NdtpPacket> {
        parser::parse(input)
    }

    fn control_payload(&self) -> &[u8] {
        &CONTROL_PACKET
    }
}

impl crate::codec::Packet for NdtpPacket {
    fn kind(&self) -> PacketKind {
        if self.is_history() {
            PacketKind::Historical
        } else {
            PacketKind::Live
        }
    }

    fn acknowledgment(&self, code: ResultCode) -> Bytes {
        match code {
            ResultCode::Ok => self.reply(RESULT_OK),
        }
    }
}
