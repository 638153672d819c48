//! NDTP packet parser and encoder.

use crate::codec::ParseResult;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Leading bytes of every NPL header.
pub const SIGNATURE: [u8; 2] = [0x7E, 0x7E];
/// Size of the NPL (network level) header.
pub const NPL_HEADER_LEN: usize = 15;
/// Size of the NPH (protocol level) header.
pub const NPH_HEADER_LEN: usize = 10;
/// NPL type announcing an NPH header follows.
pub const NPL_TYPE_NPH: u8 = 2;

#[cfg(test)]
pub const SERVICE_GENERIC_CONTROLS: u16 = 0;
pub const SERVICE_NAVDATA: u16 = 1;

pub const PACKET_RESULT: u16 = 0;
#[cfg(test)]
pub const PACKET_CONN_REQUEST: u16 = 100;
pub const PACKET_NAVDATA_HISTORY: u16 = 100;
#[cfg(test)]
pub const PACKET_NAVDATA_REALTIME: u16 = 101;

/// NPH flag bit: the sender expects a result packet.
#[cfg(test)]
pub const NPH_FLAG_REPLY_REQUESTED: u16 = 0x0001;

pub const RESULT_OK: u32 = 0;

/// Reasons a buffer cannot start with an NDTP packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    #[error("bad signature {0:02x?}")]
    BadSignature(Vec<u8>),
    #[error("data size {0} is smaller than the NPH header")]
    DataTooShort(usize),
    #[error("unsupported NPL type {0}")]
    UnsupportedType(u8),
    #[error("crc mismatch: header says {expected:#06x}, data gives {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },
}

/// Combined NPL and NPH header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub npl_flags: u16,
    pub peer_address: u32,
    pub npl_request_id: u16,
    pub service: u16,
    pub packet_type: u16,
    pub nph_flags: u16,
    pub request_id: u32,
}

impl Header {
    /// Header for a packet that asks the peer for a result.
    #[cfg(test)]
    pub fn request(service: u16, packet_type: u16, request_id: u32) -> Self {
        Self {
            npl_flags: 0,
            peer_address: 0,
            npl_request_id: 0,
            service,
            packet_type,
            nph_flags: NPH_FLAG_REPLY_REQUESTED,
            request_id,
        }
    }
}

/// A fully parsed NDTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdtpPacket {
    pub header: Header,
    pub payload: Bytes,
}

impl NdtpPacket {
    /// True for navigation data replayed from the device's history.
    pub fn is_history(&self) -> bool {
        self.header.service == SERVICE_NAVDATA
            && self.header.packet_type == PACKET_NAVDATA_HISTORY
    }

    /// Build the result packet answering this one.
    pub fn reply(&self, result: u32) -> Bytes {
        let header = Header {
            npl_flags: 0,
            peer_address: self.header.peer_address,
            npl_request_id: self.header.npl_request_id,
            service: self.header.service,
            packet_type: PACKET_RESULT,
            nph_flags: 0,
            request_id: self.header.request_id,
        };
        encode(&header, &result.to_le_bytes())
    }
}

impl fmt::Display for NdtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service={} type={} request_id={} peer={} payload={}B",
            self.header.service,
            self.header.packet_type,
            self.header.request_id,
            self.header.peer_address,
            self.payload.len()
        )
    }
}

/// Parse one NDTP packet from the front of `input`.
pub fn parse(input: &[u8]) -> ParseResult<NdtpPacket> {
    let sig_len = input.len().min(SIGNATURE.len());
    if input[..sig_len] != SIGNATURE[..sig_len] {
        return malformed(MalformedPacket::BadSignature(input[..sig_len].to_vec()));
    }

    if input.len() < NPL_HEADER_LEN {
        return ParseResult::Incomplete;
    }

    let data_size = u16::from_le_bytes([input[2], input[3]]) as usize;
    if data_size < NPH_HEADER_LEN {
        return malformed(MalformedPacket::DataTooShort(data_size));
    }

    let npl_type = input[8];
    if npl_type != NPL_TYPE_NPH {
        return malformed(MalformedPacket::UnsupportedType(npl_type));
    }

    let total = NPL_HEADER_LEN + data_size;
    if input.len() < total {
        return ParseResult::Incomplete;
    }

    let data = &input[NPL_HEADER_LEN..total];
    let expected = u16::from_be_bytes([input[6], input[7]]);
    let actual = crc16(data);
    if expected != actual {
        return malformed(MalformedPacket::CrcMismatch { expected, actual });
    }

    let header = Header {
        npl_flags: u16::from_le_bytes([input[4], input[5]]),
        peer_address: u32::from_le_bytes([input[9], input[10], input[11], input[12]]),
        npl_request_id: u16::from_le_bytes([input[13], input[14]]),
        service: u16::from_le_bytes([data[0], data[1]]),
        packet_type: u16::from_le_bytes([data[2], data[3]]),
        nph_flags: u16::from_le_bytes([data[4], data[5]]),
        request_id: u32::from_le_bytes([data[6], data[7], data[8], data[9]]),
    };

    let packet = NdtpPacket {
        header,
        payload: Bytes::copy_from_slice(&data[NPH_HEADER_LEN..]),
    };
    ParseResult::Complete(packet, total)
}

fn malformed(reason: MalformedPacket) -> ParseResult<NdtpPacket> {
    ParseResult::Malformed(reason.to_string())
}

/// Encode a packet. The payload must fit the 16-bit NPL data size.
pub fn encode(header: &Header, payload: &[u8]) -> Bytes {
    let data_size = NPH_HEADER_LEN + payload.len();
    debug_assert!(data_size <= u16::MAX as usize, "NDTP payload too large");

    let mut buf = BytesMut::with_capacity(NPL_HEADER_LEN + data_size);
    buf.put_slice(&SIGNATURE);
    buf.put_u16_le(data_size as u16);
    buf.put_u16_le(header.npl_flags);
    buf.put_u16(0); // crc, patched below
    buf.put_u8(NPL_TYPE_NPH);
    buf.put_u32_le(header.peer_address);
    buf.put_u16_le(header.npl_request_id);

    buf.put_u16_le(header.service);
    buf.put_u16_le(header.packet_type);
    buf.put_u16_le(header.nph_flags);
    buf.put_u32_le(header.request_id);
    buf.put_slice(payload);

    let crc = crc16(&buf[NPL_HEADER_LEN..]);
    buf[6..8].copy_from_slice(&crc.to_be_bytes());
    buf.freeze()
}

/// CRC-16/MODBUS (reflected polynomial 0xA001, initial value 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
