//! Wire framing.
//!
//! Every message starts with a fixed 4-byte header: `type:u8 | special:u8 |
//! size:u16be`. `size` counts route entries for route frames and payload
//! bytes for data frames; echo frames carry their nonce in `special` and have
//! no payload. All multi-byte integers are big-endian.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use failure::Fail;

use crate::routes::{HwAddr, HWADDR_SIZE};
use crate::squeue::SQueue;

pub const HEADER_SIZE: usize = 4;
/// 6-byte hardware address followed by a u32be ping estimate.
pub const ROUTE_ENTRY_SIZE: usize = HWADDR_SIZE + 4;

pub const PT_ROUTE_SET: u8 = 1;
pub const PT_ROUTE_DIFF: u8 = 2;
pub const PT_ETH_FRAME: u8 = 3;
pub const PT_BROADCAST: u8 = 4;
pub const PT_ECHO_REQUEST: u8 = 5;
pub const PT_ECHO_REPLY: u8 = 6;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub ty: u8,
    pub special: u8,
    pub size: u16,
}

impl Header {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.ty);
        buf.put_u8(self.special);
        buf.put_u16(self.size);
    }

    /// Commits only once all four header bytes are buffered.
    pub fn parse(q: &mut SQueue) -> Option<Header> {
        if q.len() < HEADER_SIZE {
            return None;
        }
        Some(Header {
            ty: q.pop_u8()?,
            special: q.pop_u8()?,
            size: q.pop_u16()?,
        })
    }
}

/// A fully decoded inbound frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    /// Full table announcement; replaces everything previously learned from
    /// this peer.
    RouteSet(Vec<(HwAddr, u32)>),
    /// Incremental update. `add` distinguishes announce from withdraw.
    RouteDiff { add: bool, entries: Vec<(HwAddr, u32)> },
    Eth(BytesMut),
    Broadcast { id: u32, data: BytesMut },
    EchoRequest(u8),
    EchoReply(u8),
}

/// Protocol violation; the peer sent a frame type we do not speak.
#[derive(Debug, Fail, Eq, PartialEq)]
#[fail(display = "invalid frame type {}", _0)]
pub struct InvalidType(pub u8);

/// Attempts to complete the cached header and then its payload out of
/// `q`. Returns `Ok(None)` until enough bytes are buffered; the header
/// survives in `cached` across calls, so the stream is resumable at any byte
/// boundary.
pub fn decode(q: &mut SQueue, cached: &mut Option<Header>) -> Result<Option<Frame>, InvalidType> {
    if cached.is_none() {
        *cached = Header::parse(q);
    }
    let hdr = match *cached {
        Some(h) => h,
        None => return Ok(None),
    };
    let frame = match hdr.ty {
        PT_ROUTE_SET | PT_ROUTE_DIFF => {
            let need = hdr.size as usize * ROUTE_ENTRY_SIZE;
            let data = match q.pop_bytes(need) {
                Some(d) => d,
                None => return Ok(None),
            };
            let entries = parse_route_entries(&data);
            if hdr.ty == PT_ROUTE_SET {
                Frame::RouteSet(entries)
            } else {
                Frame::RouteDiff {
                    add: hdr.special != 0,
                    entries,
                }
            }
        }
        PT_ETH_FRAME => {
            let data = match q.pop_bytes(hdr.size as usize) {
                Some(d) => d,
                None => return Ok(None),
            };
            Frame::Eth(data)
        }
        PT_BROADCAST => {
            // id and payload commit together
            if q.len() < hdr.size as usize + 4 {
                return Ok(None);
            }
            let id = q.pop_u32().expect("length checked");
            let data = q.pop_bytes(hdr.size as usize).expect("length checked");
            Frame::Broadcast { id, data }
        }
        PT_ECHO_REQUEST => Frame::EchoRequest(hdr.special),
        PT_ECHO_REPLY => Frame::EchoReply(hdr.special),
        ty => return Err(InvalidType(ty)),
    };
    *cached = None;
    Ok(Some(frame))
}

fn parse_route_entries(data: &[u8]) -> Vec<(HwAddr, u32)> {
    data.chunks_exact(ROUTE_ENTRY_SIZE)
        .map(|e| {
            (
                HwAddr::from_slice(&e[..HWADDR_SIZE]),
                BigEndian::read_u32(&e[HWADDR_SIZE..]),
            )
        })
        .collect()
}

fn with_header(ty: u8, special: u8, size: u16, payload: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload);
    Header { ty, special, size }.encode(&mut buf);
    buf
}

pub fn eth_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = with_header(PT_ETH_FRAME, 0, payload.len() as u16, payload.len());
    buf.put_slice(payload);
    buf
}

pub fn broadcast_frame(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = with_header(PT_BROADCAST, 0, payload.len() as u16, payload.len() + 4);
    buf.put_u32(id);
    buf.put_slice(payload);
    buf
}

pub fn route_set_frame(entries: &[(HwAddr, u32)]) -> Vec<u8> {
    debug_assert!(entries.len() <= u16::max_value() as usize);
    let mut buf = with_header(
        PT_ROUTE_SET,
        0,
        entries.len() as u16,
        entries.len() * ROUTE_ENTRY_SIZE,
    );
    put_route_entries(&mut buf, entries);
    buf
}

pub fn route_diff_frame(add: bool, entries: &[(HwAddr, u32)]) -> Vec<u8> {
    debug_assert!(entries.len() <= u16::max_value() as usize);
    let mut buf = with_header(
        PT_ROUTE_DIFF,
        add as u8,
        entries.len() as u16,
        entries.len() * ROUTE_ENTRY_SIZE,
    );
    put_route_entries(&mut buf, entries);
    buf
}

fn put_route_entries(buf: &mut Vec<u8>, entries: &[(HwAddr, u32)]) {
    for &(addr, ping) in entries {
        buf.put_slice(addr.as_bytes());
        buf.put_u32(ping);
    }
}

pub fn echo_request(nonce: u8) -> Vec<u8> {
    with_header(PT_ECHO_REQUEST, nonce, 0, 0)
}

pub fn echo_reply(nonce: u8) -> Vec<u8> {
    with_header(PT_ECHO_REPLY, nonce, 0, 0)
}
