//! Contract between the peering core and the surrounding route layer.
//!
//! The core does not own a routing table. Decoded user frames and route
//! announcements are handed to a [`Routes`] implementation, and the route
//! layer calls back into the connection to dump its table when a peer comes
//! up.

use std::fmt;

use crate::connection::Connection;
use crate::poll::PollSet;

pub const HWADDR_SIZE: usize = 6;

/// Opaque 6-byte station identifier, the key of the routing map.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct HwAddr(pub [u8; HWADDR_SIZE]);

impl HwAddr {
    /// Panics if `b` is shorter than [`HWADDR_SIZE`]; wire decoders size
    /// their slices before calling.
    pub fn from_slice(b: &[u8]) -> Self {
        let mut addr = [0; HWADDR_SIZE];
        addr.copy_from_slice(&b[..HWADDR_SIZE]);
        HwAddr(addr)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// The route layer as seen from the peering core.
pub trait Routes {
    /// Inbound unicast frame, to be forwarded or delivered locally.
    fn packet(&mut self, buf: &[u8], from: crate::connection::ConnectionHandle);

    /// Inbound broadcast frame with the 32-bit id its origin stamped on it;
    /// the id is used for per-source deduplication outside this core.
    fn broadcast_packet(
        &mut self,
        id: u32,
        buf: &[u8],
        from: crate::connection::ConnectionHandle,
    );

    /// Reachability changed somewhere; best paths need recomputing.
    fn set_dirty(&mut self);

    /// A peer link just came up. The route layer is expected to answer by
    /// calling `conn.write_route_set` with its current table.
    fn report_to(&mut self, conn: &mut Connection, poll: &mut dyn PollSet);
}
