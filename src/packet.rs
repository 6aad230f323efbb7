//! SPE packet framing
//!
//! Scans a byte buffer and yields raw packets one at a time: each header byte
//! (or two-byte extended header) declares its own payload width, so the
//! reader can frame a packet without interpreting its payload. The reader is
//! restartable from any packet-aligned offset, which is what makes
//! terminator-aligned buffer partitioning possible.
//!
//! Header encodings follow the Arm Architecture Reference Manual SPE chapter
//! (DDI 0487).

use crate::errors::{DecodeError, Result};

pub const HDR_PAD: u8 = 0x00;
pub const HDR_END: u8 = 0x01;
pub const HDR_TIMESTAMP: u8 = 0x71;

/// Events and data-source share a mask keeping bits 7:6 and 3:0.
pub const HDR_MASK_EVENTS: u8 = 0b1100_1111;
pub const HDR_EVENTS: u8 = 0x42;
pub const HDR_SOURCE: u8 = 0x43;

/// Context and operation-type keep bits 7:2; bits 1:0 are the index.
pub const HDR_MASK_INDEXED: u8 = 0b1111_1100;
pub const HDR_CONTEXT: u8 = 0x64;
pub const HDR_OP_TYPE: u8 = 0x48;
pub const HDR_EXTENDED: u8 = 0x20;

/// Address and counter keep bits 7:3; bits 2:0 are the index.
pub const HDR_MASK_ADDR: u8 = 0b1111_1000;
pub const HDR_ADDRESS: u8 = 0xb0;
pub const HDR_COUNTER: u8 = 0x98;

/// Extended header second byte 0x00 is the alignment packet, removed in
/// Armv8.5. It is consumed and skipped.
pub const HDR_EXT_ALIGNMENT: u8 = 0x00;

/// Broad classification of a header byte, enough to frame the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderClass {
    Pad,
    End,
    Timestamp,
    Events,
    DataSource,
    Context,
    OpType,
    /// Two-byte header prefix; the second byte carries index and size bits.
    Extended,
    Address,
    Counter,
    /// Reserved encoding in the 0x40..=0x7f block: size bits are still
    /// valid, payload is preserved opaquely for forward compatibility.
    Reserved,
    /// Matches nothing; cannot even be framed.
    Bad,
}

/// Classify one header byte. Order matters for the overlapping masks, same
/// as the architected decode.
pub fn classify_header(h: u8) -> HeaderClass {
    match h {
        HDR_PAD => return HeaderClass::Pad,
        HDR_END => return HeaderClass::End,
        HDR_TIMESTAMP => return HeaderClass::Timestamp,
        _ => {}
    }
    if h & HDR_MASK_EVENTS == HDR_EVENTS {
        HeaderClass::Events
    } else if h & HDR_MASK_EVENTS == HDR_SOURCE {
        HeaderClass::DataSource
    } else if h & HDR_MASK_INDEXED == HDR_CONTEXT {
        HeaderClass::Context
    } else if h & HDR_MASK_INDEXED == HDR_OP_TYPE {
        HeaderClass::OpType
    } else if h & HDR_MASK_INDEXED == HDR_EXTENDED {
        HeaderClass::Extended
    } else if h & HDR_MASK_ADDR == HDR_ADDRESS {
        HeaderClass::Address
    } else if h & HDR_MASK_ADDR == HDR_COUNTER {
        HeaderClass::Counter
    } else if (0x40..=0x7f).contains(&h) {
        HeaderClass::Reserved
    } else {
        HeaderClass::Bad
    }
}

/// True for headers that close a record run. End packets terminate a record
/// when timestamps are disabled; timestamp packets otherwise.
pub fn is_terminator(h: u8) -> bool {
    h == HDR_END || h == HDR_TIMESTAMP
}

/// Payload width in bytes declared by a header's size bits (5:4).
#[inline]
pub fn payload_len(size_byte: u8) -> usize {
    1 << ((size_byte & 0x30) >> 4)
}

/// One framed packet, borrowed from the source buffer. Transient: exists
/// only while the packet is being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPacket<'a> {
    /// The short header byte, or the second byte of an extended header.
    pub header: u8,
    /// The extended prefix byte (0b001000xx) when the header was two bytes.
    pub ext_header: Option<u8>,
    pub payload: &'a [u8],
    /// Byte offset of the packet's first header byte.
    pub offset: usize,
}

impl<'a> RawPacket<'a> {
    /// Total encoded width: header byte(s) plus payload.
    pub fn total_width(&self) -> usize {
        let hdr = if self.ext_header.is_some() { 2 } else { 1 };
        hdr + self.payload.len()
    }

    /// Payload interpreted as a little-endian, zero-extended integer.
    pub fn payload_u64(&self) -> u64 {
        let mut v: u64 = 0;
        for (i, b) in self.payload.iter().enumerate().take(8) {
            v |= (*b as u64) << (8 * i);
        }
        v
    }
}

/// Lazy packet sequence over a byte buffer.
///
/// Yields `(offset, packet)` pairs until the buffer is exhausted or a packet
/// cannot be framed. After an error the reader is fused; callers that want
/// to resynchronize construct a fresh reader at a later offset.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    offset: usize,
    fused: bool,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8], start: usize) -> Self {
        Self {
            buf,
            offset: start,
            fused: false,
        }
    }

    /// Offset of the next unread byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn frame(&mut self) -> Result<RawPacket<'a>> {
        let start = self.offset;
        let header = self.buf[start];
        let class = classify_header(header);

        let (header, ext_header, hdr_len) = match class {
            HeaderClass::Bad => {
                return Err(DecodeError::MalformedStream {
                    offset: start,
                    header,
                })
            }
            HeaderClass::Extended => {
                let second = *self.buf.get(start + 1).ok_or(DecodeError::TruncatedPacket {
                    offset: start,
                    needed: 1,
                    available: 0,
                })?;
                (second, Some(header), 2)
            }
            _ => (header, None, 1),
        };

        let plen = match class {
            HeaderClass::Pad | HeaderClass::End => 0,
            // Alignment packet: two header bytes, no payload.
            HeaderClass::Extended if header == HDR_EXT_ALIGNMENT => 0,
            _ => payload_len(header),
        };

        let body = start + hdr_len;
        let available = self.buf.len().saturating_sub(body);
        if available < plen {
            return Err(DecodeError::TruncatedPacket {
                offset: start,
                needed: plen,
                available,
            });
        }

        self.offset = body + plen;
        Ok(RawPacket {
            header,
            ext_header,
            payload: &self.buf[body..body + plen],
            offset: start,
        })
    }
}

impl<'a> Iterator for PacketReader<'a> {
    type Item = Result<RawPacket<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused || self.offset >= self.buf.len() {
            return None;
        }
        let res = self.frame();
        if res.is_err() {
            self.fused = true;
        }
        Some(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(hex: &str) -> Vec<u8> {
        hex.split_whitespace()
            .map(|b| u8::from_str_radix(b, 16).unwrap())
            .collect()
    }

    #[test]
    fn test_classify_known_headers() {
        assert_eq!(classify_header(0x00), HeaderClass::Pad);
        assert_eq!(classify_header(0x01), HeaderClass::End);
        assert_eq!(classify_header(0x71), HeaderClass::Timestamp);
        assert_eq!(classify_header(0x52), HeaderClass::Events);
        assert_eq!(classify_header(0x43), HeaderClass::DataSource);
        assert_eq!(classify_header(0x65), HeaderClass::Context);
        assert_eq!(classify_header(0x49), HeaderClass::OpType);
        assert_eq!(classify_header(0x20), HeaderClass::Extended);
        assert_eq!(classify_header(0xb3), HeaderClass::Address);
        assert_eq!(classify_header(0x9a), HeaderClass::Counter);
    }

    #[test]
    fn test_classify_reserved_and_bad() {
        // Reserved block keeps valid size bits, so it can still be framed.
        assert_eq!(classify_header(0x44), HeaderClass::Reserved);
        assert_eq!(classify_header(0x7f), HeaderClass::Reserved);
        assert_eq!(classify_header(0x02), HeaderClass::Bad);
        assert_eq!(classify_header(0x80), HeaderClass::Bad);
        assert_eq!(classify_header(0xff), HeaderClass::Bad);
    }

    #[test]
    fn test_payload_len_from_size_bits() {
        assert_eq!(payload_len(0x42), 1);
        assert_eq!(payload_len(0x52), 2);
        assert_eq!(payload_len(0x64), 4);
        assert_eq!(payload_len(0x71), 8);
        assert_eq!(payload_len(0xb0), 8);
        assert_eq!(payload_len(0x98), 2);
    }

    #[test]
    fn test_frame_single_address_packet() {
        let buf = bytes("b0 5c 8b 8c 86 c2 c0 ff c0");
        let mut rd = PacketReader::new(&buf, 0);
        let pkt = rd.next().unwrap().unwrap();
        assert_eq!(pkt.header, 0xb0);
        assert_eq!(pkt.ext_header, None);
        assert_eq!(pkt.payload.len(), 8);
        assert_eq!(pkt.total_width(), 9);
        assert_eq!(pkt.payload_u64(), 0xc0ff_c0c2_868c_8b5c);
        assert!(rd.next().is_none());
    }

    #[test]
    fn test_frame_sequence_round_trip() {
        // TS, PC, op, events, two counters, END: framing yields exactly the
        // written headers in order.
        let buf = bytes(
            "71 6c f8 a5 83 00 0c 00 00 \
             b0 00 b6 a9 e4 aa aa 00 80 \
             49 00 \
             52 16 00 \
             99 04 00 \
             98 08 00 \
             01",
        );
        let headers: Vec<u8> = PacketReader::new(&buf, 0)
            .map(|p| p.unwrap().header)
            .collect();
        assert_eq!(headers, vec![0x71, 0xb0, 0x49, 0x52, 0x99, 0x98, 0x01]);
    }

    #[test]
    fn test_extended_header_framing() {
        // 0x20 prefix + counter header: width 2 + 2 payload bytes.
        let buf = bytes("20 98 0b 00 01");
        let mut rd = PacketReader::new(&buf, 0);
        let pkt = rd.next().unwrap().unwrap();
        assert_eq!(pkt.ext_header, Some(0x20));
        assert_eq!(pkt.header, 0x98);
        assert_eq!(pkt.payload, &[0x0b, 0x00]);
        assert_eq!(pkt.total_width(), 4);
        let end = rd.next().unwrap().unwrap();
        assert_eq!(end.header, HDR_END);
    }

    #[test]
    fn test_alignment_packet_has_no_payload() {
        let buf = bytes("20 00 01");
        let mut rd = PacketReader::new(&buf, 0);
        let pkt = rd.next().unwrap().unwrap();
        assert_eq!(pkt.header, HDR_EXT_ALIGNMENT);
        assert_eq!(pkt.ext_header, Some(0x20));
        assert!(pkt.payload.is_empty());
        assert_eq!(rd.next().unwrap().unwrap().header, HDR_END);
    }

    #[test]
    fn test_truncated_packet_reports_remaining() {
        let buf = bytes("b0 01 02 03");
        let mut rd = PacketReader::new(&buf, 0);
        match rd.next().unwrap() {
            Err(DecodeError::TruncatedPacket {
                offset,
                needed,
                available,
            }) => {
                assert_eq!(offset, 0);
                assert_eq!(needed, 8);
                assert_eq!(available, 3);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
        // Fused after the error.
        assert!(rd.next().is_none());
    }

    #[test]
    fn test_malformed_header_fuses_reader() {
        let buf = bytes("ff 01");
        let mut rd = PacketReader::new(&buf, 0);
        assert!(matches!(
            rd.next().unwrap(),
            Err(DecodeError::MalformedStream { offset: 0, header: 0xff })
        ));
        assert!(rd.next().is_none());
    }

    #[test]
    fn test_restart_from_packet_aligned_offset() {
        let buf = bytes("49 00 01 4a 01 01");
        let mut rd = PacketReader::new(&buf, 3);
        let pkt = rd.next().unwrap().unwrap();
        assert_eq!(pkt.offset, 3);
        assert_eq!(pkt.header, 0x4a);
    }
}
