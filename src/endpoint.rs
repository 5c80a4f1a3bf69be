//! Connection registry, listener set and periodic driver.
//!
//! The `Endpoint` owns every connection and listening socket of the node.
//! The surrounding event loop feeds it readiness events keyed by file
//! descriptor; it maps them to connections, advances the per-connection
//! state machines, drives timer work once per tick, and sweeps connections
//! that have settled to `inactive` outside the dispatch path.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use failure::Fail;
use fnv::FnvHashMap;
use mio::net::TcpListener;
use slog::Logger;

use crate::connection::{Connection, ConnectionHandle};
use crate::crypto::{TlsContext, TlsError};
use crate::poll::{PollEvent, PollSet};
use crate::routes::{HwAddr, Routes};
use crate::sock;

/// Parameters governing the peering core. Field names match the daemon's
/// configuration keys.
pub struct Config {
    /// PEM path of the private key. Required.
    pub key: String,
    /// PEM path of the certificate chain. Required.
    pub cert: String,
    /// PEM path of the CA bundle peers are verified against. Required.
    pub ca_cert: String,
    /// Passphrase of the private key, if it is encrypted.
    pub key_pass: Option<String>,
    /// `"tls"` pins the TLS protocol family; anything else runs the
    /// version-flexible method with SSLv2 disabled.
    pub ssl_method: String,
    /// PEM path of the Diffie-Hellman parameters. Required.
    pub dh: String,
    /// Addresses to listen on.
    pub listen: Vec<String>,
    /// Peer addresses to dial and keep dialing.
    pub connect: Vec<String>,
    /// Registry cap; ids are allocated in `[0, max_connections)`.
    pub max_connections: usize,
    /// listen(2) backlog.
    pub listen_backlog: i32,
    /// Per-frame cap for tunnelled traffic. Bounded above by the u16 size
    /// field of the frame header.
    pub mtu: usize,
    /// Dial retry interval (µs).
    pub retry: u64,
    /// Deadline shared by handshakes, graceful shutdown and peer liveness
    /// (µs).
    pub timeout: u64,
    /// Echo probe interval while a link is idle (µs).
    pub keepalive: u64,
    /// How long daemon shutdown waits for graceful TLS teardown (µs).
    pub close_timeout: u64,
    /// Egress bound for user data frames; enqueues past it are dropped.
    pub max_waiting_data_frames: usize,
    /// Egress bound for control frames.
    pub max_waiting_proto_frames: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key: String::new(),
            cert: String::new(),
            ca_cert: String::new(),
            key_pass: None,
            ssl_method: String::new(),
            dh: String::new(),
            listen: Vec::new(),
            connect: Vec::new(),
            max_connections: 1024,
            listen_backlog: 32,
            mtu: 8192,
            retry: 10 * 1000 * 1000,
            timeout: 60 * 1000 * 1000,
            keepalive: 5 * 1000 * 1000,
            close_timeout: 1000 * 1000,
            max_waiting_data_frames: 512,
            max_waiting_proto_frames: 64,
        }
    }
}

#[derive(Debug, Fail)]
pub enum EndpointError {
    #[fail(display = "failed to configure TLS: {}", _0)]
    Tls(TlsError),
    #[fail(display = "listening on `{}` failed: {}", addr, err)]
    Listen { addr: String, err: io::Error },
    #[fail(display = "connection limit {} reached while dialing `{}`", limit, addr)]
    ConnectionLimit { limit: usize, addr: String },
}

impl From<TlsError> for EndpointError {
    fn from(x: TlsError) -> Self {
        EndpointError::Tls(x)
    }
}

pub struct Endpoint {
    log: Logger,
    config: Arc<Config>,
    tls: Arc<TlsContext>,
    connections: BTreeMap<usize, Connection>,
    /// fd of every connection that currently owns a socket, mapped back to
    /// its id. Never an owning reference; flushed before a connection goes.
    conn_index: FnvHashMap<RawFd, usize>,
    listeners: FnvHashMap<RawFd, TcpListener>,
}

impl Endpoint {
    /// Builds the TLS context, binds the configured listeners and creates
    /// the outbound connections; their first dial fires on the first tick.
    pub fn new(
        log: Logger,
        mut config: Config,
        poll: &mut dyn PollSet,
    ) -> Result<Self, EndpointError> {
        if config.mtu > u16::max_value() as usize {
            warn!(log, "mtu capped by the u16 frame size field"; "mtu" => config.mtu);
            config.mtu = u16::max_value() as usize;
        }
        let tls = Arc::new(TlsContext::new(&log, &config)?);
        info!(
            log, "peering core starting";
            "max_connections" => config.max_connections,
            "mtu" => config.mtu,
        );
        let mut this = Self {
            log,
            config: Arc::new(config),
            tls,
            connections: BTreeMap::new(),
            conn_index: FnvHashMap::default(),
            listeners: FnvHashMap::default(),
        };
        this.init_listeners(poll)?;
        this.init_dials()?;
        Ok(this)
    }

    fn init_listeners(&mut self, poll: &mut dyn PollSet) -> Result<(), EndpointError> {
        let listen = self.config.listen.clone();
        if listen.is_empty() {
            info!(self.log, "no listeners configured");
            return Ok(());
        }
        for addr in listen {
            let listener = sock::listen_stream(&addr, self.config.listen_backlog)
                .map_err(|err| EndpointError::Listen {
                    addr: addr.clone(),
                    err,
                })?;
            let fd = listener.as_raw_fd();
            info!(self.log, "listening"; "addr" => &addr, "fd" => fd);
            poll.add_read(fd);
            self.listeners.insert(fd, listener);
        }
        info!(self.log, "listeners ready");
        Ok(())
    }

    fn init_dials(&mut self) -> Result<(), EndpointError> {
        let connect = self.config.connect.clone();
        if connect.is_empty() {
            info!(self.log, "no peers configured");
            return Ok(());
        }
        for addr in connect {
            let id = self
                .allocate()
                .ok_or_else(|| EndpointError::ConnectionLimit {
                    limit: self.config.max_connections,
                    addr: addr.clone(),
                })?;
            info!(self.log, "created connection"; "connection" => id, "peer" => &addr);
            let conn = self.make_connection(id, Some(addr));
            self.connections.insert(id, conn);
        }
        info!(self.log, "connections ready for dialing");
        Ok(())
    }

    fn make_connection(&self, id: usize, address: Option<String>) -> Connection {
        Connection::new(
            self.log.new(o!("connection" => id)),
            self.config.clone(),
            self.tls.clone(),
            ConnectionHandle(id),
            address,
        )
    }

    /// Smallest id in `[0, max_connections)` not currently in use, in time
    /// linear in the registry size.
    fn allocate(&self) -> Option<usize> {
        let mut i = 0;
        for &id in self.connections.keys() {
            if id == i {
                i += 1;
            } else if i < id {
                break;
            }
        }
        if i >= self.config.max_connections {
            None
        } else {
            Some(i)
        }
    }

    /// Re-syncs the fd index after a dispatch that may have opened or closed
    /// the connection's socket.
    fn reindex(&mut self, id: usize, before: Option<RawFd>) {
        let after = self.connections.get(&id).and_then(Connection::fd);
        if before == after {
            return;
        }
        if let Some(fd) = before {
            self.conn_index.remove(&fd);
        }
        if let Some(fd) = after {
            self.conn_index.insert(fd, id);
        }
    }

    pub fn connection(&self, id: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(&id.0)
    }

    #[cfg(test)]
    pub(crate) fn connection_mut(&mut self, id: ConnectionHandle) -> Option<&mut Connection> {
        self.connections.get_mut(&id.0)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Removes a connection outright, flushing the fd index first.
    pub fn delete(&mut self, id: ConnectionHandle, routes: &mut dyn Routes) {
        routes.set_dirty();
        if let Some(conn) = self.connections.remove(&id.0) {
            if let Some(fd) = conn.fd() {
                self.conn_index.remove(&fd);
            }
        }
    }

    /// Accept dispatch for a listening socket that reported read readiness.
    pub fn listener_poll(
        &mut self,
        now: u64,
        fd: RawFd,
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        let sock = {
            let listener = match self.listeners.get(&fd) {
                Some(l) => l,
                None => return,
            };
            match listener.accept() {
                Ok((sock, from)) => {
                    info!(self.log, "inbound connection"; "from" => %from);
                    sock
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!(self.log, "accept failed"; "error" => %e);
                    return;
                }
            }
        };
        let id = match self.allocate() {
            Some(id) => id,
            None => {
                // dropping the socket closes it; no registry slot is consumed
                info!(
                    self.log, "connection limit reached, dropping inbound";
                    "limit" => self.config.max_connections,
                );
                return;
            }
        };
        let conn = self.make_connection(id, None);
        self.connections.insert(id, conn);
        if let Some(c) = self.connections.get_mut(&id) {
            c.start_accept(now, sock, poll, routes);
        }
        self.reindex(id, None);
    }

    /// Maps one readiness event to the listener set or a connection.
    pub fn handle_event(
        &mut self,
        now: u64,
        ev: &PollEvent,
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        if self.listeners.contains_key(&ev.fd) {
            if ev.readable {
                self.listener_poll(now, ev.fd, poll, routes);
            }
            return;
        }
        let id = match self.conn_index.get(&ev.fd) {
            Some(&id) => id,
            None => return,
        };
        let before = self.connections.get(&id).and_then(Connection::fd);
        if ev.readable {
            if let Some(c) = self.connections.get_mut(&id) {
                c.poll_read(now, poll, routes);
            }
        }
        if ev.writable {
            // the read path may already have torn this socket down
            if let Some(c) = self.connections.get_mut(&id) {
                if c.fd() == before {
                    c.poll_write(now, poll, routes);
                }
            }
        }
        self.reindex(id, before);
    }

    /// Once-per-tick driver: timer work on every connection, then the sweep
    /// of connections that settled to `inactive`. Runs outside the poll
    /// dispatch so nothing holds an iterator over the registry.
    pub fn periodic_update(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        let ids: Vec<usize> = self.connections.keys().cloned().collect();
        for id in ids {
            let before = self.connections.get(&id).and_then(Connection::fd);
            if let Some(c) = self.connections.get_mut(&id) {
                c.periodic_update(now, poll, routes);
            }
            self.reindex(id, before);
        }
        self.sweep();
    }

    fn sweep(&mut self) {
        self.connections.retain(|_, c| !c.is_inactive());
    }

    /// Sends a route diff to every active peer.
    pub fn broadcast_route_update(
        &mut self,
        add: bool,
        entries: &[(HwAddr, u32)],
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        let ids: Vec<usize> = self.connections.keys().cloned().collect();
        for id in ids {
            let before = self.connections.get(&id).and_then(Connection::fd);
            if let Some(c) = self.connections.get_mut(&id) {
                if c.is_active() {
                    c.write_route_diff(add, entries, poll, routes);
                }
            }
            self.reindex(id, before);
        }
    }

    /// Queues an L2 frame on one peer link.
    pub fn write_packet(
        &mut self,
        id: ConnectionHandle,
        buf: &[u8],
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        let before = self.connections.get(&id.0).and_then(Connection::fd);
        if let Some(c) = self.connections.get_mut(&id.0) {
            c.write_packet(buf, poll, routes);
        }
        self.reindex(id.0, before);
    }

    pub fn write_broadcast_packet(
        &mut self,
        id: ConnectionHandle,
        broadcast_id: u32,
        buf: &[u8],
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        let before = self.connections.get(&id.0).and_then(Connection::fd);
        if let Some(c) = self.connections.get_mut(&id.0) {
            c.write_broadcast_packet(broadcast_id, buf, poll, routes);
        }
        self.reindex(id.0, before);
    }

    /// Closes the listeners, then drives every connection to `closing` and
    /// pumps the poller until all of them settle or the configured grace
    /// expires; whatever is left is reset hard.
    pub fn shutdown(&mut self, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        self.close_listeners(poll);
        self.close_connections(poll, routes);
    }

    fn close_listeners(&mut self, poll: &mut dyn PollSet) {
        for (fd, _listener) in self.listeners.drain() {
            info!(self.log, "closing listener"; "fd" => fd);
            poll.remove_read(fd);
        }
    }

    fn close_connections(&mut self, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        let grace = self.config.close_timeout;
        info!(
            self.log, "waiting for connections to close";
            "grace_sec" => grace as f64 * 1e-6,
        );
        let now = crate::timestamp();
        let deadline = now + grace;

        let ids: Vec<usize> = self.connections.keys().cloned().collect();
        for id in ids {
            let before = self.connections.get(&id).and_then(Connection::fd);
            if let Some(c) = self.connections.get_mut(&id) {
                // never re-dial a peer we are shutting down away from
                c.clear_address();
                c.disconnect(now, poll, routes);
            }
            self.reindex(id, before);
        }

        let mut events = Vec::new();
        while crate::timestamp() < deadline && !self.connections.is_empty() {
            if let Err(e) = poll.wait(1000, &mut events) {
                warn!(self.log, "poll failed during shutdown"; "error" => %e);
            }
            let now = crate::timestamp();
            for ev in events.drain(..) {
                self.handle_event(now, &ev, poll, routes);
            }
            self.periodic_update(now, poll, routes);
        }

        if self.connections.is_empty() {
            info!(self.log, "all connections closed gracefully");
        } else {
            info!(
                self.log, "resetting remaining connections";
                "count" => self.connections.len(),
            );
            let ids: Vec<usize> = self.connections.keys().cloned().collect();
            for id in ids {
                let before = self.connections.get(&id).and_then(Connection::fd);
                if let Some(c) = self.connections.get_mut(&id) {
                    c.reset(poll, routes);
                }
                self.reindex(id, before);
            }
            self.sweep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet;
    use crate::poll::MioPoll;
    use crate::routes::HwAddr;
    use crate::testutil::{self, FakePoll, FakeRoutes};
    use hex_literal::hex;

    fn endpoint_with(listen: Vec<String>, connect: Vec<String>, max: usize) -> (Endpoint, MioPoll) {
        let log = testutil::logger();
        let mut config = testutil::config_with_creds(testutil::credentials());
        config.listen = listen;
        config.connect = connect;
        config.max_connections = max;
        let mut poll = MioPoll::new(log.clone()).unwrap();
        let endpoint = Endpoint::new(log, config, &mut poll).unwrap();
        (endpoint, poll)
    }

    struct Node {
        endpoint: Endpoint,
        poll: MioPoll,
        routes: FakeRoutes,
    }

    impl Node {
        fn new(listen: Vec<String>, connect: Vec<String>, max: usize) -> Self {
            let (endpoint, poll) = endpoint_with(listen, connect, max);
            Node {
                endpoint,
                poll,
                routes: FakeRoutes::default(),
            }
        }

        fn pump(&mut self) {
            let mut events = Vec::new();
            self.poll.wait(5000, &mut events).unwrap();
            let now = crate::timestamp();
            for ev in events {
                self.endpoint
                    .handle_event(now, &ev, &mut self.poll, &mut self.routes);
            }
            self.endpoint
                .periodic_update(crate::timestamp(), &mut self.poll, &mut self.routes);
        }

        fn active(&self) -> Option<&Connection> {
            self.endpoint.connections().find(|c| c.is_active())
        }
    }

    fn drive<F>(a: &mut Node, b: &mut Node, what: &str, cond: F)
    where
        F: Fn(&Node, &Node) -> bool,
    {
        for _ in 0..1000 {
            if cond(a, b) {
                return;
            }
            a.pump();
            b.pump();
        }
        panic!("never reached: {}", what);
    }

    fn meshed_pair() -> (Node, Node) {
        let mut a = Node::new(vec!["127.0.0.1:0".to_owned()], vec![], 16);
        let addr = a.endpoint.listen_addrs()[0];
        let mut b = Node::new(vec![], vec![addr.to_string()], 16);
        a.routes.local_routes = vec![(HwAddr([0xaa; 6]), 7)];
        b.routes.local_routes = vec![(HwAddr([0xbb; 6]), 9)];
        drive(&mut a, &mut b, "both links active", |a, b| {
            a.active().is_some() && b.active().is_some()
        });
        (a, b)
    }

    #[test]
    fn allocate_returns_smallest_free_id() {
        let (mut ep, _poll) = endpoint_with(vec![], vec![], 16);
        assert_eq!(ep.allocate(), Some(0));
        for id in &[0usize, 1, 3] {
            let conn = ep.make_connection(*id, None);
            ep.connections.insert(*id, conn);
        }
        assert_eq!(ep.allocate(), Some(2));
        let conn = ep.make_connection(2, None);
        ep.connections.insert(2, conn);
        assert_eq!(ep.allocate(), Some(4));
    }

    #[test]
    fn allocate_respects_the_cap() {
        let (mut ep, _poll) = endpoint_with(vec![], vec![], 2);
        for id in &[0usize, 1] {
            let conn = ep.make_connection(*id, None);
            ep.connections.insert(*id, conn);
        }
        assert_eq!(ep.allocate(), None);
    }

    #[test]
    fn dialing_past_the_cap_is_a_startup_error() {
        let log = testutil::logger();
        let mut config = testutil::config_with_creds(testutil::credentials());
        config.connect = vec!["127.0.0.1:9".to_owned(), "127.0.0.1:10".to_owned()];
        config.max_connections = 1;
        let mut poll = MioPoll::new(log.clone()).unwrap();
        match Endpoint::new(log, config, &mut poll) {
            Err(EndpointError::ConnectionLimit { limit: 1, .. }) => {}
            _ => panic!("expected a connection-limit error"),
        }
    }

    #[test]
    fn delete_flushes_the_fd_index() {
        let (mut ep, _poll) = endpoint_with(vec![], vec![], 16);
        let conn = ep.make_connection(0, Some("127.0.0.1:9".to_owned()));
        ep.connections.insert(0, conn);
        let mut routes = FakeRoutes::default();
        ep.delete(ConnectionHandle(0), &mut routes);
        assert_eq!(ep.connection_count(), 0);
        assert!(ep.conn_index.is_empty());
        assert_eq!(routes.dirty, 1);
    }

    #[test]
    fn sweep_reclaims_inactive_connections() {
        let (mut ep, _poll) = endpoint_with(vec![], vec![], 16);
        let conn = ep.make_connection(0, None); // inbound-style, starts inactive
        ep.connections.insert(0, conn);
        let mut poll = FakePoll::default();
        let mut routes = FakeRoutes::default();
        ep.periodic_update(crate::timestamp(), &mut poll, &mut routes);
        assert_eq!(ep.connection_count(), 0);
    }

    //
    // Loopback scenarios
    //

    #[test]
    fn handshake_ping_and_route_exchange() {
        let (mut a, mut b) = meshed_pair();
        drive(&mut a, &mut b, "pings measured and routes learned", |a, b| {
            let a_ok = a
                .active()
                .map(|c| c.ping() >= 2 && !c.remote_routes().is_empty())
                .unwrap_or(false);
            let b_ok = b
                .active()
                .map(|c| c.ping() >= 2 && !c.remote_routes().is_empty())
                .unwrap_or(false);
            a_ok && b_ok
        });
        // each side learned exactly what the other announced
        let learned_by_b = b.active().unwrap().remote_routes();
        assert_eq!(learned_by_b.get(&HwAddr([0xaa; 6])), Some(&7));
        let learned_by_a = a.active().unwrap().remote_routes();
        assert_eq!(learned_by_a.get(&HwAddr([0xbb; 6])), Some(&9));
        // fd index still mirrors the registry
        for c in a.endpoint.connections() {
            let fd = c.fd().unwrap();
            assert_eq!(a.endpoint.conn_index[&fd], c.id().0);
        }
    }

    #[test]
    fn tunnelled_frames_reach_the_route_layer() {
        let (mut a, mut b) = meshed_pair();
        let payload = vec![0x42u8; 600];
        let id = b.active().unwrap().id();
        b.endpoint
            .write_packet(id, &payload, &mut b.poll, &mut b.routes);
        b.endpoint
            .write_broadcast_packet(id, 77, b"flood", &mut b.poll, &mut b.routes);
        drive(&mut a, &mut b, "frames delivered", |a, _| {
            !a.routes.packets.is_empty() && !a.routes.broadcasts.is_empty()
        });
        assert_eq!(a.routes.packets[0].0, payload);
        let (bid, ref data, _) = a.routes.broadcasts[0];
        assert_eq!(bid, 77);
        assert_eq!(&data[..], b"flood");
    }

    #[test]
    fn graceful_shutdown_sends_the_peer_back_to_retry() {
        let (mut a, mut b) = meshed_pair();
        a.endpoint.shutdown(&mut a.poll, &mut a.routes);
        assert_eq!(a.endpoint.connection_count(), 0);
        assert!(a.endpoint.listen_addrs().is_empty());
        // B had a configured address, so its side falls back to re-dialing
        for _ in 0..1000 {
            let settled = b.endpoint.connections().any(|c| {
                c.state().name() == "retry_timeout" || c.state().name() == "connecting"
            });
            if settled {
                return;
            }
            b.pump();
        }
        panic!("peer never fell back to retrying");
    }

    #[test]
    fn unknown_frame_type_disconnects_gracefully() {
        let (mut a, mut b) = meshed_pair();
        let id = b.active().unwrap().id();
        let now = crate::timestamp();
        {
            let b = &mut b;
            let conn = b.endpoint.connection_mut(id).unwrap();
            conn.inject(&hex!("63 00 0000"), now, &mut b.poll, &mut b.routes);
            assert_ne!(conn.state().name(), "active");
        }
        // B re-dials because it has an address; A's inbound side is swept
        drive(&mut a, &mut b, "violation torn down on both sides", |a, b| {
            let b_settled = b.endpoint.connections().any(|c| {
                c.state().name() == "retry_timeout" || c.state().name() == "connecting"
            });
            b_settled && a.endpoint.connections().all(|c| !c.is_active())
        });
    }

    #[test]
    fn over_mtu_frames_are_dropped_silently() {
        let (mut a, mut b) = meshed_pair();
        let id = b.active().unwrap().id();
        let huge = vec![0u8; 9000]; // mtu is 8192
        b.endpoint.write_packet(id, &huge, &mut b.poll, &mut b.routes);
        {
            let conn = b.endpoint.connection(id).unwrap();
            assert!(conn.is_active());
            assert_eq!(conn.queue_depths(), (0, 0));
        }
        // nothing arrives on the other side either
        for _ in 0..20 {
            a.pump();
            b.pump();
        }
        assert!(a.routes.packets.is_empty());
    }

    #[test]
    fn stale_echo_reply_refreshes_liveness_only() {
        let (_a, mut b) = meshed_pair();
        let id = b.active().unwrap().id();
        let (nonce, _) = b.endpoint.connection(id).unwrap().sent_ping();
        let ping_before = b.endpoint.connection(id).unwrap().ping();
        let dirty_before = b.routes.dirty;
        let now = crate::timestamp();
        let b = &mut b;
        let conn = b.endpoint.connection_mut(id).unwrap();
        conn.inject(
            &packet::echo_reply(nonce.wrapping_sub(1)),
            now,
            &mut b.poll,
            &mut b.routes,
        );
        assert_eq!(conn.ping(), ping_before);
        assert_eq!(conn.last_ping_stamp(), now);
        assert_eq!(b.routes.dirty, dirty_before);
    }

    #[test]
    fn inbound_past_the_cap_is_closed_without_a_slot() {
        let mut a = Node::new(vec!["127.0.0.1:0".to_owned()], vec![], 1);
        let addr = a.endpoint.listen_addrs()[0];
        let mut b = Node::new(vec![], vec![addr.to_string()], 16);
        drive(&mut a, &mut b, "first link active", |a, b| {
            a.active().is_some() && b.active().is_some()
        });
        assert_eq!(a.endpoint.connection_count(), 1);
        // a second inbound is accepted at the socket layer and closed at once
        let extra = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..50 {
            a.pump();
        }
        assert_eq!(a.endpoint.connection_count(), 1);
        assert!(a.active().is_some());
        drop(extra);
    }
}
