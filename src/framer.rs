//! Stream reassembly.
//!
//! TCP reads do not line up with packet boundaries: one read may carry
//! several packets, half a packet, or the tail of one packet and the head of
//! the next. The framer keeps the unconsumed bytes of a connection and hands
//! out complete packets as the codec recognizes them.
//!
//! After every pass the buffer holds either nothing or the prefix of one
//! incomplete packet.

use crate::codec::{Codec, ParseResult};
use bytes::{Buf, BytesMut};
use std::sync::Arc;

/// Default upper bound on bytes buffered while waiting for a packet to
/// complete.
pub const DEFAULT_MAX_BUFFERED: usize = 128 * 1024;

/// Allocation kept for a connection between passes.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Allocations above this are released once the buffer drains.
const SHRINK_THRESHOLD: usize = 4 * INITIAL_CAPACITY;

/// Unrecoverable framing failures. The stream cannot be resynchronized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("first read did not contain a complete packet")]
    Incomplete,
    #[error("{buffered} bytes buffered without a complete packet (limit {limit})")]
    Overflow { buffered: usize, limit: usize },
}

/// Per-connection reassembly buffer bound to a codec.
pub struct Framer<C: Codec> {
    codec: Arc<C>,
    buffer: BytesMut,
    max_buffered: usize,
    oversized: bool,
}

impl<C: Codec> Framer<C> {
    pub fn with_limit(codec: Arc<C>, max_buffered: usize) -> Self {
        Self {
            codec,
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_buffered,
            oversized: false,
        }
    }

    /// Append freshly read bytes and iterate over the packets now complete.
    ///
    /// Packets are parsed lazily as the iterator is pulled. A caller that
    /// stops early leaves the unparsed bytes buffered. The iterator ends after
    /// yielding the first error.
    pub fn reassemble(&mut self, newly_read: &[u8]) -> Frames<'_, C> {
        self.buffer.extend_from_slice(newly_read);
        if self.buffer.capacity() > SHRINK_THRESHOLD {
            self.oversized = true;
        }
        Frames {
            framer: self,
            done: false,
        }
    }

    /// Frame exactly one packet out of a single read.
    ///
    /// Used for the handshake, where a partial packet counts as failure.
    /// Bytes following the first packet stay buffered.
    pub fn first_packet(&mut self, newly_read: &[u8]) -> Result<C::Packet, FrameError> {
        self.reassemble(newly_read)
            .next()
            .unwrap_or(Err(FrameError::Incomplete))
    }

    /// Bytes waiting for the rest of their packet.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    fn next_packet(&mut self) -> Result<Option<C::Packet>, FrameError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.codec.parse_one(&self.buffer) {
            ParseResult::Complete(_, 0) => Err(FrameError::Malformed(
                "codec consumed no bytes".to_string(),
            )),
            ParseResult::Complete(packet, consumed) => {
                self.buffer.advance(consumed);
                Ok(Some(packet))
            }
            ParseResult::Incomplete if self.buffer.len() > self.max_buffered => {
                Err(FrameError::Overflow {
                    buffered: self.buffer.len(),
                    limit: self.max_buffered,
                })
            }
            ParseResult::Incomplete => Ok(None),
            ParseResult::Malformed(reason) => Err(FrameError::Malformed(reason)),
        }
    }

    /// Release oversized allocations so a connection only keeps one
    /// incomplete packet worth of memory between reads.
    fn compact(&mut self) {
        if !self.oversized || self.buffer.len() > INITIAL_CAPACITY {
            return;
        }
        let mut retained = BytesMut::with_capacity(INITIAL_CAPACITY);
        retained.extend_from_slice(&self.buffer);
        self.buffer = retained;
        self.oversized = false;
    }
}

/// Lazy sequence of packets produced by one reassembly pass.
pub struct Frames<'a, C: Codec> {
    framer: &'a mut Framer<C>,
    done: bool,
}

impl<C: Codec> Iterator for Frames<'_, C> {
    type Item = Result<C::Packet, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.framer.next_packet() {
            Ok(Some(packet)) => Some(Ok(packet)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<C: Codec> Drop for Frames<'_, C> {
    fn drop(&mut self) {
        self.framer.compact();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ndtp::parser::{
        PACKET_NAVDATA_HISTORY, PACKET_NAVDATA_REALTIME, SERVICE_NAVDATA,
    };
    use crate::protocols::ndtp::parser::{encode, Header};
    use crate::protocols::ndtp::{NdtpCodec, NdtpPacket};
    use bytes::Bytes;

    fn framer() -> Framer<NdtpCodec> {
        Framer::with_limit(Arc::new(NdtpCodec), DEFAULT_MAX_BUFFERED)
    }

    fn packet(request_id: u32) -> Bytes {
        encode(
            &Header::request(SERVICE_NAVDATA, PACKET_NAVDATA_REALTIME, request_id),
            b"lat=55.75;lon=37.61",
        )
    }

    fn collect(framer: &mut Framer<NdtpCodec>, data: &[u8]) -> Vec<NdtpPacket> {
        framer
            .reassemble(data)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_single_read_single_packet() {
        let mut f = framer();
        let packets = collect(&mut f, &packet(1));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header.request_id, 1);
        assert!(f.buffered().is_empty());
    }

    #[test]
    fn test_split_at_every_pair_of_boundaries() {
        let bytes = packet(5);
        let whole = collect(&mut framer(), &bytes);

        for a in 0..=bytes.len() {
            for b in a..=bytes.len() {
                let mut f = framer();
                let mut got = collect(&mut f, &bytes[..a]);
                got.extend(collect(&mut f, &bytes[a..b]));
                got.extend(collect(&mut f, &bytes[b..]));
                assert_eq!(got, whole, "split at {a}/{b}");
                assert!(f.buffered().is_empty());
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = packet(9);
        let mut f = framer();
        let mut got = Vec::new();
        for byte in bytes.iter() {
            got.extend(collect(&mut f, std::slice::from_ref(byte)));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].header.request_id, 9);
    }

    #[test]
    fn test_remainder_is_retained() {
        let first = packet(1);
        let second = packet(2);
        let mut data = first.to_vec();
        data.extend_from_slice(&second[..10]);

        let mut f = framer();
        let got = collect(&mut f, &data);
        assert_eq!(got.len(), 1);
        assert_eq!(f.buffered(), &second[..10]);

        let got = collect(&mut f, &second[10..]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].header.request_id, 2);
        assert!(f.buffered().is_empty());
    }

    #[test]
    fn test_many_packets_in_one_read() {
        let mut data = Vec::new();
        for id in 0..10 {
            data.extend_from_slice(&packet(id));
        }
        data.extend_from_slice(&encode(
            &Header::request(SERVICE_NAVDATA, PACKET_NAVDATA_HISTORY, 10),
            b"",
        ));

        let got = collect(&mut framer(), &data);
        let ids: Vec<u32> = got.iter().map(|p| p.header.request_id).collect();
        assert_eq!(ids, (0..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_malformed_after_valid_packets() {
        let mut data = packet(1).to_vec();
        data.extend_from_slice(&packet(2));
        data.extend_from_slice(b"\x00\x01garbage");
        data.extend_from_slice(&packet(3));

        let mut f = framer();
        let results: Vec<_> = f.reassemble(&data).collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_lazy_iteration_stops_early() {
        let mut data = packet(1).to_vec();
        data.extend_from_slice(&packet(2));

        let mut f = framer();
        let first = f.reassemble(&data).next().unwrap().unwrap();
        assert_eq!(first.header.request_id, 1);
        assert_eq!(f.buffered(), &packet(2)[..]);
    }

    #[test]
    fn test_first_packet_incomplete() {
        let bytes = packet(1);
        let mut f = framer();
        assert_eq!(
            f.first_packet(&bytes[..bytes.len() - 1]).unwrap_err(),
            FrameError::Incomplete
        );
    }

    #[test]
    fn test_first_packet_keeps_following_bytes() {
        let mut data = packet(1).to_vec();
        data.extend_from_slice(&packet(2));
        let mut f = framer();
        let first = f.first_packet(&data).unwrap();
        assert_eq!(first.header.request_id, 1);

        let rest = collect(&mut f, &[]);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].header.request_id, 2);
    }

    #[test]
    fn test_overflow() {
        let bytes = packet(1);
        let mut f = Framer::with_limit(Arc::new(NdtpCodec), 16);
        let result: Vec<_> = f.reassemble(&bytes[..20]).collect();
        assert!(matches!(
            result.as_slice(),
            [Err(FrameError::Overflow { buffered: 20, limit: 16 })]
        ));
    }

    #[test]
    fn test_compaction_after_large_read() {
        let mut data = Vec::new();
        for id in 0..2000 {
            data.extend_from_slice(&packet(id));
        }
        let mut f = framer();
        assert_eq!(collect(&mut f, &data).len(), 2000);
        assert!(f.buffered().is_empty());
        assert!(!f.oversized);
        assert!(f.buffer.capacity() <= SHRINK_THRESHOLD);
    }
}
