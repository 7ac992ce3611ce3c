//! The 12-byte RTP header used to disguise tunnel packets as media traffic.
//!
//! Only the fields this tunnel actually cares about are exposed: the header
//! is stamped with plausible-looking constant fields (version 2, no padding,
//! no extension, no CSRC) and the per-packet flow fields (SSRC, sequence,
//! timestamp, payload type) that do real demultiplexing work. RTCP, jitter
//! buffers and everything else RFC 3550 defines are out of scope.

use bytes::{Buf, BufMut};
use std::fmt;

/// Size of the fixed RTP header in bytes (no CSRC list, no extension).
pub const HEADER_LEN: usize = 12;

/// The only version this codec will emit or accept.
pub const VERSION: u8 = 2;

/// Default payload type stamped by the client. Dynamic range per RFC 3551.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 97;

/// Amount the timestamp advances per emitted packet, modelling 30fps video
/// sampled at a 90kHz clock. Nothing on either side of the tunnel reads this
/// value; it exists only to make the wire traffic look like real RTP.
pub const TIMESTAMP_STEP: u32 = 3000;

/// The flow fields of one RTP packet, decoded from or destined for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// Why a received buffer could not be read as an RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Fewer than [`HEADER_LEN`] bytes remained in the buffer.
    Truncated,
    /// The version nibble was not [`VERSION`]; almost certainly corruption
    /// or a wrong-key XOR deobfuscation rather than a real RTP stream.
    VersionMismatch(u8),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "buffer shorter than {HEADER_LEN}-byte RTP header"),
            Self::VersionMismatch(v) => write!(f, "unexpected RTP version {v} (want {VERSION})"),
        }
    }
}

impl RtpHeader {
    pub fn new(payload_type: u8, ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            payload_type,
            marker: false,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Writes the 12-byte header to `buf`, in network byte order, with
    /// padding/extension/CSRC-count fixed at zero. The caller's payload
    /// bytes are expected to follow immediately in the same buffer so no
    /// copy is needed to assemble the final packet.
    pub fn encode(&self, buf: &mut impl BufMut) {
        let b0 = (VERSION << 6) & 0b1100_0000;
        let b1 = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);

        buf.put_u8(b0);
        buf.put_u8(b1);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Reads a header off the front of `buf`, advancing it past the 12
    /// consumed bytes so the remainder is the envelope/payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, HeaderError> {
        if buf.remaining() < HEADER_LEN {
            return Err(HeaderError::Truncated);
        }

        let b0 = buf.get_u8();
        let version = b0 >> 6;
        if version != VERSION {
            return Err(HeaderError::VersionMismatch(version));
        }

        let b1 = buf.get_u8();
        let marker = (b1 & 0b1000_0000) != 0;
        let payload_type = b1 & 0x7f;
        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        Ok(Self {
            payload_type,
            marker,
            sequence,
            timestamp,
            ssrc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn round_trip() {
        let header = RtpHeader::new(97, 0xdead_beef, 1234, 0x1000_2000);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let mut cursor = &buf[..];
        let decoded = RtpHeader::decode(&mut cursor).unwrap();
        assert_eq!(decoded, header);
        assert!(cursor.is_empty());
    }

    #[test]
    fn round_trip_dynamic_payload_types() {
        for pt in [96u8, 97, 98] {
            for (seq, ts, ssrc) in [(0u16, 0u32, 0u32), (u16::MAX, u32::MAX, 0x1234_5678)] {
                let header = RtpHeader::new(pt, ssrc, seq, ts);
                let mut buf = BytesMut::new();
                header.encode(&mut buf);
                let mut cursor = &buf[..];
                assert_eq!(RtpHeader::decode(&mut cursor).unwrap(), header);
            }
        }
    }

    #[test]
    fn payload_follows_header_without_copy() {
        let header = RtpHeader::new(97, 1, 0, 0);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(b"hello");

        let mut cursor = &buf[..];
        RtpHeader::decode(&mut cursor).unwrap();
        assert_eq!(cursor, b"hello" as &[u8]);
    }

    #[test]
    fn rejects_short_buffer() {
        let buf = [0u8; HEADER_LEN - 1];
        let mut cursor = &buf[..];
        assert_eq!(RtpHeader::decode(&mut cursor), Err(HeaderError::Truncated));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut buf = BytesMut::new();
        RtpHeader::new(97, 1, 0, 0).encode(&mut buf);
        buf[0] = 0b0100_0000; // version 1
        let mut cursor = &buf[..];
        assert_eq!(
            RtpHeader::decode(&mut cursor),
            Err(HeaderError::VersionMismatch(1))
        );
    }
}
