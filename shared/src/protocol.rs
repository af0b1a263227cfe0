//! PV Access wire format, limited to the UDP search exchange.
//!
//! Frames are always encoded big-endian. Decoding honours the byte-order
//! flag of each message header.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use bytes::{Buf, BufMut, BytesMut};

/// Default UDP port for search broadcasts
pub const DEFAULT_BROADCAST_PORT: u16 = 5076;

/// Largest datagram a search frame is allowed to occupy
pub const MAX_UDP_PACKET: usize = 1440;

pub const PVA_MAGIC: u8 = 0xCA;
pub const PVA_VERSION: u8 = 2;
pub const HEADER_SIZE: usize = 8;

/// Header flag bits
pub const FLAG_CONTROL: u8 = 0x01;
pub const FLAG_SERVER: u8 = 0x40;
pub const FLAG_BIG_ENDIAN: u8 = 0x80;

pub const CMD_SEARCH: u8 = 0x03;
pub const CMD_SEARCH_RESPONSE: u8 = 0x04;

/// Search payload flag bits
pub const SEARCH_REPLY_REQUIRED: u8 = 0x01;
pub const SEARCH_UNICAST: u8 = 0x80;

/// Transport advertised in searches and search responses
pub const PROTOCOL_TCP: &str = "tcp";

/// Length of a server GUID in a search response
pub const GUID_SIZE: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("bad magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("invalid size encoding")]
    InvalidSize,
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("too many channels for one search: {0}")]
    TooManyChannels(usize),
}

/// A search message decoded from a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSearch {
    pub seq: u32,
    pub unicast: bool,
    pub reply_required: bool,
    pub response: SocketAddr,
    pub protocols: Vec<String>,
    /// (cid, name) pairs in wire order
    pub channels: Vec<(u32, String)>,
}

/// A search response decoded from a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSearchResponse {
    pub guid: [u8; GUID_SIZE],
    pub seq: u32,
    pub server: SocketAddr,
    pub protocol: String,
    pub found: bool,
    pub cids: Vec<u32>,
}

/// Appends a search request frame to `buf`.
///
/// `response` is the address servers should send their search response to,
/// which need not be the sender of the datagram.
pub fn encode_search_request(
    buf: &mut BytesMut,
    unicast: bool,
    seq: u32,
    channels: &[(u32, &str)],
    response: SocketAddr,
) -> Result<(), CodecError> {
    let count = u16::try_from(channels.len())
        .map_err(|_| CodecError::TooManyChannels(channels.len()))?;

    let payload_start = encode_header(buf, FLAG_BIG_ENDIAN, CMD_SEARCH);

    buf.put_u32(seq);
    let mut flags = if channels.is_empty() { 0 } else { SEARCH_REPLY_REQUIRED };
    if unicast {
        flags |= SEARCH_UNICAST;
    }
    buf.put_u8(flags);
    // reserved
    buf.put_bytes(0, 3);
    encode_address(buf, response.ip());
    buf.put_u16(response.port());

    encode_size(buf, 1);
    encode_string(buf, PROTOCOL_TCP);

    buf.put_u16(count);
    for (cid, name) in channels {
        buf.put_u32(*cid);
        encode_string(buf, name);
    }

    patch_payload_size(buf, payload_start);
    Ok(())
}

/// Appends a positive search response frame to `buf`.
pub fn encode_search_response(
    buf: &mut BytesMut,
    guid: &[u8; GUID_SIZE],
    seq: u32,
    server: SocketAddr,
    cids: &[u32],
) -> Result<(), CodecError> {
    let count = u16::try_from(cids.len())
        .map_err(|_| CodecError::TooManyChannels(cids.len()))?;

    let payload_start = encode_header(buf, FLAG_BIG_ENDIAN | FLAG_SERVER, CMD_SEARCH_RESPONSE);

    buf.put_slice(guid);
    buf.put_u32(seq);
    encode_address(buf, server.ip());
    buf.put_u16(server.port());
    encode_string(buf, PROTOCOL_TCP);
    // found
    buf.put_u8(1);
    buf.put_u16(count);
    for cid in cids {
        buf.put_u32(*cid);
    }

    patch_payload_size(buf, payload_start);
    Ok(())
}

/// Decodes every client search message in a datagram.
///
/// Control messages, server messages and other commands are skipped.
pub fn decode_search_requests(datagram: &[u8]) -> Result<Vec<DecodedSearch>, CodecError> {
    let mut searches = Vec::new();
    for_each_message(datagram, |header, payload| {
        if header.command == CMD_SEARCH && header.flags & FLAG_SERVER == 0 {
            let mut reader = Reader::new(payload, header.big_endian());
            searches.push(decode_search_payload(&mut reader)?);
        }
        Ok(())
    })?;
    Ok(searches)
}

/// Decodes the first search response found in a datagram.
pub fn decode_search_response(datagram: &[u8]) -> Result<Option<DecodedSearchResponse>, CodecError> {
    let mut response = None;
    for_each_message(datagram, |header, payload| {
        if response.is_none() && header.command == CMD_SEARCH_RESPONSE {
            let mut reader = Reader::new(payload, header.big_endian());
            response = Some(decode_search_response_payload(&mut reader)?);
        }
        Ok(())
    })?;
    Ok(response)
}

struct Header {
    flags: u8,
    command: u8,
}

impl Header {
    fn big_endian(&self) -> bool {
        self.flags & FLAG_BIG_ENDIAN != 0
    }
}

fn for_each_message<F>(datagram: &[u8], mut f: F) -> Result<(), CodecError>
where
    F: FnMut(&Header, &[u8]) -> Result<(), CodecError>,
{
    let mut rest = datagram;
    while !rest.is_empty() {
        if rest.len() < HEADER_SIZE {
            return Err(CodecError::Truncated { needed: HEADER_SIZE, available: rest.len() });
        }
        if rest[0] != PVA_MAGIC {
            return Err(CodecError::BadMagic(rest[0]));
        }
        let header = Header { flags: rest[2], command: rest[3] };
        let mut size_field = &rest[4..HEADER_SIZE];
        let size = if header.big_endian() {
            size_field.get_u32() as usize
        } else {
            size_field.get_u32_le() as usize
        };
        rest = &rest[HEADER_SIZE..];

        // A control message carries a value in the size field, not a payload
        if header.flags & FLAG_CONTROL != 0 {
            continue;
        }
        if size > rest.len() {
            return Err(CodecError::Truncated { needed: size, available: rest.len() });
        }
        let (payload, tail) = rest.split_at(size);
        f(&header, payload)?;
        rest = tail;
    }
    Ok(())
}

fn decode_search_payload(reader: &mut Reader<'_>) -> Result<DecodedSearch, CodecError> {
    let seq = reader.u32()?;
    let flags = reader.u8()?;
    reader.skip(3)?;
    let ip = reader.address()?;
    let port = reader.u16()?;

    let protocol_count = reader.size()?.unwrap_or(0);
    let mut protocols = Vec::with_capacity(protocol_count.min(4));
    for _ in 0..protocol_count {
        protocols.push(reader.string()?);
    }

    let channel_count = reader.u16()? as usize;
    let mut channels = Vec::with_capacity(channel_count.min(64));
    for _ in 0..channel_count {
        let cid = reader.u32()?;
        let name = reader.string()?;
        channels.push((cid, name));
    }

    Ok(DecodedSearch {
        seq,
        unicast: flags & SEARCH_UNICAST != 0,
        reply_required: flags & SEARCH_REPLY_REQUIRED != 0,
        response: SocketAddr::new(ip, port),
        protocols,
        channels,
    })
}

fn decode_search_response_payload(reader: &mut Reader<'_>) -> Result<DecodedSearchResponse, CodecError> {
    let mut guid = [0u8; GUID_SIZE];
    reader.copy_to(&mut guid)?;
    let seq = reader.u32()?;
    let ip = reader.address()?;
    let port = reader.u16()?;
    let protocol = reader.string()?;
    let found = reader.u8()? != 0;
    let count = reader.u16()? as usize;
    let mut cids = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        cids.push(reader.u32()?);
    }

    Ok(DecodedSearchResponse {
        guid,
        seq,
        server: SocketAddr::new(ip, port),
        protocol,
        found,
        cids,
    })
}

/// Writes a header with a zero payload size and returns the payload offset.
fn encode_header(buf: &mut BytesMut, flags: u8, command: u8) -> usize {
    buf.put_u8(PVA_MAGIC);
    buf.put_u8(PVA_VERSION);
    buf.put_u8(flags);
    buf.put_u8(command);
    buf.put_u32(0);
    buf.len()
}

fn patch_payload_size(buf: &mut BytesMut, payload_start: usize) {
    let size = (buf.len() - payload_start) as u32;
    buf[payload_start - 4..payload_start].copy_from_slice(&size.to_be_bytes());
}

fn encode_size(buf: &mut BytesMut, size: usize) {
    if size < 254 {
        buf.put_u8(size as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_i32(size as i32);
    }
}

fn encode_string(buf: &mut BytesMut, value: &str) {
    encode_size(buf, value.len());
    buf.put_slice(value.as_bytes());
}

/// IPv4 goes on the wire as an IPv4-mapped IPv6 address.
fn encode_address(buf: &mut BytesMut, ip: IpAddr) {
    let v6 = match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    buf.put_slice(&v6.octets());
}

struct Reader<'a> {
    buf: &'a [u8],
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], big_endian: bool) -> Self {
        Self { buf, big_endian }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated { needed: n, available: self.buf.remaining() });
        }
        Ok(())
    }

    fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn copy_to(&mut self, dst: &mut [u8]) -> Result<(), CodecError> {
        self.need(dst.len())?;
        self.buf.copy_to_slice(dst);
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(if self.big_endian { self.buf.get_u16() } else { self.buf.get_u16_le() })
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(if self.big_endian { self.buf.get_u32() } else { self.buf.get_u32_le() })
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(if self.big_endian { self.buf.get_i32() } else { self.buf.get_i32_le() })
    }

    /// `None` is the encoded null size.
    fn size(&mut self) -> Result<Option<usize>, CodecError> {
        match self.u8()? {
            0xFF => Ok(None),
            0xFE => {
                let size = self.i32()?;
                usize::try_from(size).map(Some).map_err(|_| CodecError::InvalidSize)
            }
            small => Ok(Some(small as usize)),
        }
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.size()?.unwrap_or(0);
        self.need(len)?;
        let value = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| CodecError::InvalidUtf8)?
            .to_string();
        self.buf.advance(len);
        Ok(value)
    }

    fn address(&mut self) -> Result<IpAddr, CodecError> {
        let mut octets = [0u8; 16];
        self.copy_to(&mut octets)?;
        let v6 = Ipv6Addr::from(octets);
        Ok(match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None if v6.is_unspecified() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            None => IpAddr::V6(v6),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "192.168.1.20:40123".parse().unwrap()
    }

    #[test]
    fn test_search_request_layout() {
        let mut buf = BytesMut::new();
        encode_search_request(&mut buf, false, 7, &[(42, "XYZ:PV1")], client()).unwrap();

        assert_eq!(&buf[..4], &[PVA_MAGIC, PVA_VERSION, FLAG_BIG_ENDIAN, CMD_SEARCH]);
        let size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        assert_eq!(size, buf.len() - HEADER_SIZE);

        // seq, then flags with only reply-required set
        assert_eq!(&buf[8..12], &7u32.to_be_bytes());
        assert_eq!(buf[12], SEARCH_REPLY_REQUIRED);
        // IPv4-mapped response address and port
        assert_eq!(&buf[16..28], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);
        assert_eq!(&buf[28..32], &[192, 168, 1, 20]);
        assert_eq!(&buf[32..34], &40123u16.to_be_bytes());
        // one protocol, "tcp"
        assert_eq!(&buf[34..39], &[1, 3, b't', b'c', b'p']);
        // one channel
        assert_eq!(&buf[39..41], &[0, 1]);
        assert_eq!(&buf[41..45], &42u32.to_be_bytes());
        assert_eq!(buf[45] as usize, "XYZ:PV1".len());
        assert_eq!(&buf[46..], b"XYZ:PV1");
    }

    #[test]
    fn test_search_request_decodes_back() {
        let mut buf = BytesMut::new();
        encode_search_request(&mut buf, true, 99, &[(1, "A:B"), (2, "C:D")], client()).unwrap();

        let searches = decode_search_requests(&buf).unwrap();
        assert_eq!(searches.len(), 1);
        let search = &searches[0];
        assert_eq!(search.seq, 99);
        assert!(search.unicast);
        assert!(search.reply_required);
        assert_eq!(search.response, client());
        assert_eq!(search.protocols, vec!["tcp".to_string()]);
        assert_eq!(search.channels, vec![(1, "A:B".to_string()), (2, "C:D".to_string())]);
    }

    #[test]
    fn test_ipv6_response_address() {
        let addr: SocketAddr = "[fd00::20]:40123".parse().unwrap();
        let mut buf = BytesMut::new();
        encode_search_request(&mut buf, false, 1, &[(1, "PV")], addr).unwrap();

        let searches = decode_search_requests(&buf).unwrap();
        assert_eq!(searches[0].response, addr);
    }

    #[test]
    fn test_long_name_uses_extended_size() {
        let name = "X".repeat(300);
        let mut buf = BytesMut::new();
        encode_search_request(&mut buf, false, 1, &[(5, &name)], client()).unwrap();

        let searches = decode_search_requests(&buf).unwrap();
        assert_eq!(searches[0].channels[0].1, name);
    }

    #[test]
    fn test_little_endian_search() {
        // Hand-built little-endian search for cid 3, name "PV"
        let mut payload = Vec::new();
        payload.extend_from_slice(&5u32.to_le_bytes());
        payload.push(SEARCH_REPLY_REQUIRED);
        payload.extend_from_slice(&[0, 0, 0]);
        payload.extend_from_slice(&Ipv4Addr::new(10, 0, 0, 9).to_ipv6_mapped().octets());
        payload.extend_from_slice(&6000u16.to_le_bytes());
        payload.extend_from_slice(&[1, 3, b't', b'c', b'p']);
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(&[2, b'P', b'V']);

        let mut datagram = vec![PVA_MAGIC, PVA_VERSION, 0, CMD_SEARCH];
        datagram.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        datagram.extend_from_slice(&payload);

        let searches = decode_search_requests(&datagram).unwrap();
        assert_eq!(searches[0].seq, 5);
        assert_eq!(searches[0].response, "10.0.0.9:6000".parse().unwrap());
        assert_eq!(searches[0].channels, vec![(3, "PV".to_string())]);
    }

    #[test]
    fn test_skips_control_and_other_messages() {
        let mut buf = BytesMut::new();
        // control message: header only
        buf.put_slice(&[PVA_MAGIC, PVA_VERSION, FLAG_BIG_ENDIAN | FLAG_CONTROL, 0x02]);
        buf.put_u32(1234);
        // unrelated application message with a 2-byte payload
        buf.put_slice(&[PVA_MAGIC, PVA_VERSION, FLAG_BIG_ENDIAN, 0x16]);
        buf.put_u32(2);
        buf.put_slice(&[0xAB, 0xCD]);
        encode_search_request(&mut buf, false, 3, &[(8, "PV")], client()).unwrap();

        let searches = decode_search_requests(&buf).unwrap();
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].channels[0].0, 8);
    }

    #[test]
    fn test_search_response_is_not_a_request() {
        let mut buf = BytesMut::new();
        let server: SocketAddr = "10.0.0.5:5075".parse().unwrap();
        encode_search_response(&mut buf, &[7; GUID_SIZE], 11, server, &[42]).unwrap();

        assert!(decode_search_requests(&buf).unwrap().is_empty());

        let response = decode_search_response(&buf).unwrap().unwrap();
        assert_eq!(response.guid, [7; GUID_SIZE]);
        assert_eq!(response.seq, 11);
        assert_eq!(response.server, server);
        assert_eq!(response.protocol, "tcp");
        assert!(response.found);
        assert_eq!(response.cids, vec![42]);
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert_eq!(decode_search_requests(&[0x00; 8]), Err(CodecError::BadMagic(0)));
        assert!(matches!(
            decode_search_requests(&[PVA_MAGIC, 2, 0x80]),
            Err(CodecError::Truncated { .. })
        ));

        let mut buf = BytesMut::new();
        encode_search_request(&mut buf, false, 1, &[(1, "PV:NAME")], client()).unwrap();
        let cut = &buf[..buf.len() - 3];
        assert!(matches!(decode_search_requests(cut), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_empty_search_has_no_reply_flag() {
        let mut buf = BytesMut::new();
        encode_search_request(&mut buf, false, 1, &[], client()).unwrap();
        let searches = decode_search_requests(&buf).unwrap();
        assert!(!searches[0].reply_required);
        assert!(searches[0].channels.is_empty());
    }
}
