//! Per-peer connection state machine.
//!
//! A connection walks from a configured address through non-blocking TCP
//! connect, TLS handshake, framed steady-state exchange, graceful shutdown
//! and retry-with-backoff; inbound peers enter the same machine at the
//! accept stage. All I/O is non-blocking and re-entered on poller readiness;
//! the TLS layer dictates re-entry points through WANT_READ / WANT_WRITE.

use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use fnv::FnvHashMap;
use mio::net::TcpStream;
use openssl::error::ErrorStack;
use openssl::ssl::{self, ErrorCode, ShutdownResult, SslStream};
use slog::Logger;

use crate::crypto::TlsContext;
use crate::endpoint::Config;
use crate::packet::{self, Frame, Header};
use crate::poll::PollSet;
use crate::routes::{HwAddr, Routes};
use crate::sock;
use crate::squeue::SQueue;

/// Stable registry id of a connection, assigned at creation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Steady-state framed session: the TLS stream plus the receive queue, the
/// partially parsed header, and the two egress queues.
pub struct Channel {
    tls: SslStream<TcpStream>,
    recv_q: SQueue,
    cached_header: Option<Header>,
    proto_q: VecDeque<Vec<u8>>,
    data_q: VecDeque<Vec<u8>>,
    /// True while a data frame is mid-transmit; a retried TLS write must
    /// finish that frame before control traffic may preempt again.
    sending_from_data_q: bool,
}

/// Each arm carries exactly the resources that state owns; dropping an arm
/// releases the TLS session (and with it the socket).
pub enum State {
    Inactive,
    RetryTimeout,
    Connecting(TcpStream),
    SslConnecting(SslStream<TcpStream>),
    Accepting(SslStream<TcpStream>),
    Active(Channel),
    Closing(SslStream<TcpStream>),
}

impl State {
    pub fn name(&self) -> &'static str {
        match *self {
            State::Inactive => "inactive",
            State::RetryTimeout => "retry_timeout",
            State::Connecting(_) => "connecting",
            State::SslConnecting(_) => "ssl_connecting",
            State::Accepting(_) => "accepting",
            State::Active(_) => "active",
            State::Closing(_) => "closing",
        }
    }

    fn fd(&self) -> Option<RawFd> {
        match *self {
            State::Inactive | State::RetryTimeout => None,
            State::Connecting(ref sock) => Some(sock.as_raw_fd()),
            State::SslConnecting(ref tls)
            | State::Accepting(ref tls)
            | State::Closing(ref tls) => Some(tls.get_ref().as_raw_fd()),
            State::Active(ref ch) => Some(ch.tls.get_ref().as_raw_fd()),
        }
    }
}

enum SslDisposition {
    /// Poll subscriptions were adjusted; retry on the next readiness event.
    Transient,
    /// The session is beyond saving; the caller resets the connection.
    Fatal,
}

pub struct Connection {
    log: Logger,
    config: Arc<Config>,
    tls_ctx: Arc<TlsContext>,
    id: ConnectionHandle,
    state: Option<State>,
    /// Address to re-dial on drop; `None` for inbound peers, which are never
    /// retried.
    address: Option<String>,
    last_retry: u64,
    /// Doubles as the handshake/shutdown deadline origin outside `active`.
    last_ping: u64,
    sent_ping_id: u8,
    sent_ping_time: u64,
    /// One-way delay estimate in microseconds. Starts at 1 so the peer is
    /// reachable but at unknown distance; a measured value is always >= 2.
    ping: u32,
    /// Every MAC the peer claims to reach, and at what cost. Non-empty only
    /// while `active`.
    remote_routes: FnvHashMap<HwAddr, u32>,
}

impl Connection {
    pub(crate) fn new(
        log: Logger,
        config: Arc<Config>,
        tls_ctx: Arc<TlsContext>,
        id: ConnectionHandle,
        address: Option<String>,
    ) -> Self {
        let state = if address.is_some() {
            // last_retry of 0 makes the first dial fire on the next tick
            State::RetryTimeout
        } else {
            State::Inactive
        };
        Self {
            log,
            config,
            tls_ctx,
            id,
            state: Some(state),
            address,
            last_retry: 0,
            last_ping: 0,
            sent_ping_id: 0,
            sent_ping_time: 0,
            ping: 1,
            remote_routes: FnvHashMap::default(),
        }
    }

    pub fn id(&self) -> ConnectionHandle {
        self.id
    }

    pub fn state(&self) -> &State {
        self.state.as_ref().expect("state is only vacant mid-call")
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.state.as_ref().and_then(State::fd)
    }

    pub fn is_active(&self) -> bool {
        if let Some(State::Active(_)) = self.state {
            true
        } else {
            false
        }
    }

    pub fn is_inactive(&self) -> bool {
        if let Some(State::Inactive) = self.state {
            true
        } else {
            false
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_ref().map(|s| s.as_str())
    }

    /// Forgets the re-dial address, so the next drop settles in `inactive`
    /// and the sweep reclaims the slot. Used on daemon shutdown.
    pub fn clear_address(&mut self) {
        self.address = None;
    }

    pub fn ping(&self) -> u32 {
        self.ping
    }

    pub fn remote_routes(&self) -> &FnvHashMap<HwAddr, u32> {
        &self.remote_routes
    }

    //
    // Senders
    //

    /// Queues an opaque L2 frame for the peer. Frames over the configured
    /// MTU are dropped before they touch the queue.
    pub fn write_packet(&mut self, buf: &[u8], poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        if buf.len() > self.config.mtu {
            trace!(self.log, "frame exceeds mtu, dropped"; "len" => buf.len());
            return;
        }
        let frame = packet::eth_frame(buf);
        self.enqueue_data(frame, poll, routes);
    }

    pub fn write_broadcast_packet(
        &mut self,
        id: u32,
        buf: &[u8],
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        if buf.len() > self.config.mtu {
            trace!(self.log, "broadcast exceeds mtu, dropped"; "len" => buf.len());
            return;
        }
        let frame = packet::broadcast_frame(id, buf);
        self.enqueue_data(frame, poll, routes);
    }

    /// Announces the full local route table to this peer.
    pub fn write_route_set(
        &mut self,
        entries: &[(HwAddr, u32)],
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        let frame = packet::route_set_frame(entries);
        self.enqueue_proto(frame, poll, routes);
    }

    /// Incremental route update; `add` announces, `!add` withdraws.
    pub fn write_route_diff(
        &mut self,
        add: bool,
        entries: &[(HwAddr, u32)],
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        let frame = packet::route_diff_frame(add, entries);
        self.enqueue_proto(frame, poll, routes);
    }

    fn write_pong(&mut self, nonce: u8, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        let frame = packet::echo_reply(nonce);
        self.enqueue_proto(frame, poll, routes);
    }

    fn enqueue_proto(&mut self, frame: Vec<u8>, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        match self.state {
            Some(State::Active(ref mut ch)) => {
                if ch.proto_q.len() >= self.config.max_waiting_proto_frames {
                    trace!(self.log, "proto queue full, dropping frame");
                    return;
                }
                ch.proto_q.push_back(frame);
            }
            _ => return,
        }
        self.try_write(poll, routes);
    }

    fn enqueue_data(&mut self, frame: Vec<u8>, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        match self.state {
            Some(State::Active(ref mut ch)) => {
                if ch.data_q.len() >= self.config.max_waiting_data_frames {
                    trace!(self.log, "data queue full, dropping frame");
                    return;
                }
                ch.data_q.push_back(frame);
            }
            _ => return,
        }
        self.try_write(poll, routes);
    }

    //
    // Handlers
    //

    fn handle_frame(
        &mut self,
        frame: Frame,
        now: u64,
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        match frame {
            Frame::RouteSet(entries) => {
                self.remote_routes.clear();
                for (addr, ping) in entries {
                    self.remote_routes.insert(addr, ping);
                }
                routes.set_dirty();
            }
            Frame::RouteDiff { add, entries } => {
                if entries.is_empty() {
                    return;
                }
                for (addr, ping) in entries {
                    if add {
                        self.remote_routes.insert(addr, ping);
                    } else {
                        self.remote_routes.remove(&addr);
                    }
                }
                routes.set_dirty();
            }
            Frame::Eth(data) => routes.packet(&data, self.id),
            Frame::Broadcast { id, data } => routes.broadcast_packet(id, &data, self.id),
            Frame::EchoRequest(nonce) => self.write_pong(nonce, poll, routes),
            Frame::EchoReply(nonce) => self.handle_pong(nonce, now, routes),
        }
    }

    fn handle_pong(&mut self, nonce: u8, now: u64, routes: &mut dyn Routes) {
        // any reply proves the peer is alive, matching nonce or not
        self.last_ping = now;
        if nonce != self.sent_ping_id {
            info!(self.log, "received a stale echo reply"; "nonce" => nonce);
            return;
        }
        let rtt = now.saturating_sub(self.sent_ping_time);
        self.ping = rtt.saturating_add(2).min(u64::from(u32::max_value())) as u32;
        routes.set_dirty();
    }

    //
    // Actions
    //

    fn try_parse_input(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        loop {
            let step = match self.state {
                Some(State::Active(ref mut ch)) => {
                    packet::decode(&mut ch.recv_q, &mut ch.cached_header)
                }
                _ => return,
            };
            match step {
                Ok(None) => return,
                Ok(Some(frame)) => self.handle_frame(frame, now, poll, routes),
                Err(e) => {
                    error!(self.log, "protocol violation, disconnecting"; "error" => %e);
                    self.disconnect(now, poll, routes);
                    return;
                }
            }
        }
    }

    /// Drains the socket into the receive queue, decoding after every read.
    /// Returns false once the connection was torn down on a hard error.
    fn try_read(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) -> bool {
        let mut buf = [0; 4096];
        loop {
            let r = match self.state {
                Some(State::Active(ref mut ch)) => ch.tls.ssl_read(&mut buf),
                _ => return true,
            };
            match r {
                Ok(n) => {
                    if let Some(State::Active(ref mut ch)) = self.state {
                        ch.recv_q.push(&buf[..n]);
                    }
                    self.try_parse_input(now, poll, routes);
                    // a decoded frame may have started a disconnect
                    if !self.is_active() {
                        return true;
                    }
                }
                Err(ref e) if e.code() == ErrorCode::ZERO_RETURN => {
                    info!(self.log, "closed by peer");
                    self.disconnect(now, poll, routes);
                    return false;
                }
                Err(e) => match self.handle_ssl_error(&e, poll) {
                    SslDisposition::Transient => return true,
                    SslDisposition::Fatal => {
                        info!(self.log, "read error, resetting");
                        self.reset(poll, routes);
                        return false;
                    }
                },
            }
        }
    }

    /// Drains the egress queues: control traffic first, user data when
    /// control is quiet. A data frame that is already mid-transmit is always
    /// finished before control preempts again, so a single TLS record is
    /// never fragmented. Returns false once the connection was reset.
    fn try_write(&mut self, poll: &mut dyn PollSet, routes: &mut dyn Routes) -> bool {
        enum Step {
            Drained,
            Wrote,
            Closed,
            Error(ssl::Error),
        }
        loop {
            let step = match self.state {
                Some(State::Active(ref mut ch)) => {
                    if ch.sending_from_data_q && ch.data_q.is_empty() {
                        ch.sending_from_data_q = false;
                    }
                    if !ch.sending_from_data_q && ch.proto_q.is_empty() && !ch.data_q.is_empty() {
                        ch.sending_from_data_q = true;
                    }
                    let from_data = ch.sending_from_data_q;
                    let front = if from_data {
                        ch.data_q.front()
                    } else {
                        ch.proto_q.front()
                    };
                    match front {
                        None => Step::Drained,
                        Some(frame) => match ch.tls.ssl_write(frame) {
                            Ok(_) => {
                                // no partial-write mode: success is the whole frame
                                if from_data {
                                    ch.data_q.pop_front();
                                    ch.sending_from_data_q = false;
                                } else {
                                    ch.proto_q.pop_front();
                                }
                                Step::Wrote
                            }
                            Err(ref e) if e.code() == ErrorCode::ZERO_RETURN => Step::Closed,
                            Err(e) => Step::Error(e),
                        },
                    }
                }
                _ => return true,
            };
            match step {
                Step::Wrote => continue,
                Step::Drained => {
                    if let Some(fd) = self.fd() {
                        poll.remove_write(fd);
                    }
                    return true;
                }
                Step::Closed => {
                    info!(self.log, "closed by peer");
                    self.reset(poll, routes);
                    return false;
                }
                Step::Error(e) => match self.handle_ssl_error(&e, poll) {
                    SslDisposition::Transient => return true,
                    SslDisposition::Fatal => {
                        error!(self.log, "write error, resetting");
                        self.reset(poll, routes);
                        return false;
                    }
                },
            }
        }
    }

    fn try_data(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        // Write first: draining the queues drops the want-write bit, and the
        // read below may legitimately re-add it. The converse order would
        // leak the bit. No more I/O if the write path reset the connection.
        if self.try_write(poll, routes) {
            self.try_read(now, poll, routes);
        }
    }

    fn try_connect(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        let so_error = match self.state {
            Some(State::Connecting(ref sock)) => sock.take_error(),
            _ => return,
        };
        match so_error {
            Err(e) => {
                error!(self.log, "reading SO_ERROR failed"; "error" => %e);
                self.reset(poll, routes);
            }
            Ok(Some(e)) => {
                error!(self.log, "connect failed"; "error" => %e);
                self.reset(poll, routes);
            }
            Ok(None) => {
                let done = match self.state {
                    Some(State::Connecting(ref sock)) => sock::finished_connecting(sock),
                    _ => return,
                };
                if !done {
                    if now.saturating_sub(self.last_ping) > self.config.timeout {
                        error!(self.log, "connect timed out");
                        self.reset(poll, routes);
                    }
                    return;
                }
                let fd = self.fd().expect("connecting state has a socket");
                // subscriptions change while the socket is still open; a
                // session failure below drops it
                poll.remove_write(fd);
                let sock = match self.state.take() {
                    Some(State::Connecting(sock)) => sock,
                    _ => unreachable!("checked above"),
                };
                match self.make_session(sock, false) {
                    Ok(tls) => {
                        self.state = Some(State::SslConnecting(tls));
                        poll.add_read(fd); // stays armed for the rest of the life
                        self.try_ssl_connect(now, poll, routes);
                    }
                    Err(e) => {
                        error!(self.log, "allocating TLS session failed"; "error" => %e);
                        self.settle();
                    }
                }
            }
        }
    }

    fn try_ssl_connect(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        let r = match self.state {
            Some(State::SslConnecting(ref mut tls)) => tls.do_handshake(),
            _ => return,
        };
        match r {
            Ok(()) => {
                info!(self.log, "TLS session established");
                let tls = match self.state.take() {
                    Some(State::SslConnecting(tls)) => tls,
                    _ => unreachable!("checked above"),
                };
                self.activate(tls, now, poll, routes);
            }
            Err(e) => {
                if let SslDisposition::Fatal = self.handle_ssl_error(&e, poll) {
                    error!(self.log, "TLS connect failed");
                    self.reset(poll, routes);
                }
            }
        }
    }

    fn try_accept(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        let r = match self.state {
            Some(State::Accepting(ref mut tls)) => tls.do_handshake(),
            _ => return,
        };
        match r {
            Ok(()) => {
                info!(self.log, "TLS session accepted");
                let tls = match self.state.take() {
                    Some(State::Accepting(tls)) => tls,
                    _ => unreachable!("checked above"),
                };
                self.activate(tls, now, poll, routes);
            }
            Err(e) => {
                if let SslDisposition::Fatal = self.handle_ssl_error(&e, poll) {
                    error!(self.log, "TLS accept failed");
                    self.reset(poll, routes);
                }
            }
        }
    }

    fn try_close(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        let r = match self.state {
            Some(State::Closing(ref mut tls)) => tls.shutdown(),
            _ => return,
        };
        match r {
            Ok(ShutdownResult::Received) => {
                info!(self.log, "TLS shutdown complete");
                self.reset(poll, routes);
            }
            Ok(ShutdownResult::Sent) => {
                // our close_notify is out; wait for the peer's, but not forever
                if now.saturating_sub(self.last_ping) > self.config.timeout {
                    warn!(self.log, "timed out waiting for TLS shutdown");
                    self.reset(poll, routes);
                }
            }
            Err(e) => match self.handle_ssl_error(&e, poll) {
                SslDisposition::Transient => {
                    if now.saturating_sub(self.last_ping) > self.config.timeout {
                        warn!(self.log, "timed out waiting for TLS shutdown");
                        self.reset(poll, routes);
                    }
                }
                SslDisposition::Fatal => {
                    warn!(self.log, "TLS session not terminated cleanly");
                    self.reset(poll, routes);
                }
            },
        }
    }

    //
    // Forced state changes
    //

    fn start_connect(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        self.last_retry = now;
        let addr = match self.address {
            Some(ref a) => a.clone(),
            None => return,
        };
        let sock = match sock::connect_stream(&addr) {
            Ok(sock) => sock,
            Err(e) => {
                // stay in retry_timeout; the next attempt fires a full
                // retry interval from now
                error!(self.log, "failed to start connecting"; "peer" => addr, "error" => %e);
                return;
            }
        };
        info!(self.log, "connecting"; "peer" => addr);
        self.last_ping = now; // arms the handshake deadline
        let fd = sock.as_raw_fd();
        self.state = Some(State::Connecting(sock));
        poll.add_write(fd); // wait for connect() to finish
        self.try_connect(now, poll, routes);
    }

    pub(crate) fn start_accept(
        &mut self,
        now: u64,
        sock: TcpStream,
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        self.last_ping = now; // arms the handshake deadline
        let fd = sock.as_raw_fd();
        match self.make_session(sock, true) {
            Ok(tls) => {
                self.state = Some(State::Accepting(tls));
                poll.add_read(fd); // stays armed for the rest of the life
                self.try_accept(now, poll, routes);
            }
            Err(e) => {
                error!(self.log, "allocating TLS session failed"; "error" => %e);
                self.settle();
            }
        }
    }

    fn make_session(
        &self,
        sock: TcpStream,
        accepting: bool,
    ) -> Result<SslStream<TcpStream>, ErrorStack> {
        let mut session = self.tls_ctx.new_session()?;
        if accepting {
            session.set_accept_state();
        } else {
            session.set_connect_state();
        }
        SslStream::new(session, sock)
    }

    fn send_ping(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        self.sent_ping_time = now;
        self.sent_ping_id = self.sent_ping_id.wrapping_add(1);
        let frame = packet::echo_request(self.sent_ping_id);
        self.enqueue_proto(frame, poll, routes);
    }

    fn activate(
        &mut self,
        tls: SslStream<TcpStream>,
        now: u64,
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        info!(self.log, "link active");
        self.state = Some(State::Active(Channel {
            tls,
            recv_q: SQueue::new(),
            cached_header: None,
            proto_q: VecDeque::new(),
            data_q: VecDeque::new(),
            sending_from_data_q: false,
        }));
        self.last_ping = now;
        self.send_ping(now, poll, routes);
        routes.report_to(self, poll);
    }

    /// Starts a graceful teardown: routes are withdrawn immediately, then
    /// the TLS shutdown runs under the usual deadline. Peers without a
    /// configured address settle straight into `inactive`.
    pub fn disconnect(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        if let Some(fd) = self.fd() {
            poll.remove_write(fd);
        }
        match self.state {
            Some(State::RetryTimeout) if self.address.is_none() => {
                self.state = Some(State::Inactive);
                return;
            }
            Some(State::Inactive) | Some(State::RetryTimeout) | Some(State::Closing(_)) => return,
            // no TLS session worth closing yet
            Some(State::Connecting(_))
            | Some(State::SslConnecting(_))
            | Some(State::Accepting(_)) => {
                self.reset(poll, routes);
                return;
            }
            Some(State::Active(_)) => {}
            None => return,
        }
        let ch = match self.state.take() {
            Some(State::Active(ch)) => ch,
            _ => unreachable!("checked above"),
        };
        info!(self.log, "disconnecting");
        self.state = Some(State::Closing(ch.tls));
        self.last_ping = now; // bounds the graceful shutdown
        self.remote_routes.clear();
        routes.set_dirty();
        self.try_close(now, poll, routes);
    }

    /// Hard teardown: poll subscriptions dropped, routes and queues cleared,
    /// TLS session and socket released, and the next state chosen by whether
    /// an address is configured. Safe to call repeatedly.
    pub fn reset(&mut self, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        if let Some(fd) = self.fd() {
            poll.remove_write(fd);
            poll.remove_read(fd);
        }
        self.remote_routes.clear();
        routes.set_dirty();
        // dropping the state arm frees the TLS session and closes the socket
        self.settle();
    }

    fn settle(&mut self) {
        self.state = Some(if self.address.is_some() {
            State::RetryTimeout
        } else {
            State::Inactive
        });
    }

    fn handle_ssl_error(&mut self, e: &ssl::Error, poll: &mut dyn PollSet) -> SslDisposition {
        match e.code() {
            ErrorCode::WANT_READ => {
                // read interest is always armed; outside active make sure a
                // handshake retry does not leave a stale write bit behind
                if !self.is_active() {
                    if let Some(fd) = self.fd() {
                        poll.remove_write(fd);
                    }
                }
                SslDisposition::Transient
            }
            ErrorCode::WANT_WRITE => {
                if let Some(fd) = self.fd() {
                    poll.add_write(fd);
                }
                SslDisposition::Transient
            }
            _ => {
                let mut fatal = false;
                match e.ssl_error() {
                    Some(stack) => {
                        for err in stack.errors() {
                            // a bad write retry only means the read and write
                            // paths interleaved under a reallocated buffer;
                            // the session survives it
                            if err.reason() == Some("bad write retry") {
                                continue;
                            }
                            fatal = true;
                            error!(
                                self.log, "TLS error";
                                "library" => err.library().unwrap_or("unknown"),
                                "function" => err.function().unwrap_or("unknown"),
                                "reason" => err.reason().unwrap_or("unknown"),
                            );
                        }
                    }
                    None => {
                        fatal = true;
                        error!(self.log, "TLS I/O error"; "error" => %e);
                    }
                }
                if fatal {
                    SslDisposition::Fatal
                } else {
                    SslDisposition::Transient
                }
            }
        }
    }

    //
    // Polls
    //

    pub fn poll_read(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        self.poll_io(now, poll, routes);
    }

    pub fn poll_write(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        self.poll_io(now, poll, routes);
    }

    fn poll_io(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        match self.state {
            Some(State::Accepting(_)) => self.try_accept(now, poll, routes),
            Some(State::Connecting(_)) => self.try_connect(now, poll, routes),
            Some(State::SslConnecting(_)) => self.try_ssl_connect(now, poll, routes),
            Some(State::Closing(_)) => self.try_close(now, poll, routes),
            Some(State::Active(_)) => self.try_data(now, poll, routes),
            Some(State::Inactive) | Some(State::RetryTimeout) => {
                warn!(self.log, "unexpected poll event"; "state" => self.state().name())
            }
            None => {}
        }
    }

    /// Per-tick timer work: drives retries, handshake and shutdown
    /// deadlines, and steady-state keepalive.
    pub fn periodic_update(&mut self, now: u64, poll: &mut dyn PollSet, routes: &mut dyn Routes) {
        match self.state {
            Some(State::RetryTimeout) => {
                if self.address.is_some()
                    && now.saturating_sub(self.last_retry) >= self.config.retry
                {
                    self.start_connect(now, poll, routes);
                }
            }
            Some(State::Connecting(_)) => self.try_connect(now, poll, routes),
            Some(State::SslConnecting(_)) | Some(State::Accepting(_)) => {
                if now.saturating_sub(self.last_ping) > self.config.timeout {
                    error!(self.log, "TLS handshake timed out");
                    self.reset(poll, routes);
                }
            }
            Some(State::Closing(_)) => self.try_close(now, poll, routes),
            Some(State::Active(_)) => {
                if now.saturating_sub(self.last_ping) > self.config.timeout {
                    info!(self.log, "peer timed out");
                    self.disconnect(now, poll, routes);
                } else if now.saturating_sub(self.sent_ping_time) > self.config.keepalive {
                    self.send_ping(now, poll, routes);
                }
            }
            Some(State::Inactive) | None => {}
        }
    }

    //
    // Test hooks
    //

    #[cfg(test)]
    pub(crate) fn inject(
        &mut self,
        bytes: &[u8],
        now: u64,
        poll: &mut dyn PollSet,
        routes: &mut dyn Routes,
    ) {
        if let Some(State::Active(ref mut ch)) = self.state {
            ch.recv_q.push(bytes);
        }
        self.try_parse_input(now, poll, routes);
    }

    #[cfg(test)]
    pub(crate) fn queue_depths(&self) -> (usize, usize) {
        match self.state {
            Some(State::Active(ref ch)) => (ch.proto_q.len(), ch.data_q.len()),
            _ => (0, 0),
        }
    }

    #[cfg(test)]
    pub(crate) fn sent_ping(&self) -> (u8, u64) {
        (self.sent_ping_id, self.sent_ping_time)
    }

    #[cfg(test)]
    pub(crate) fn last_ping_stamp(&self) -> u64 {
        self.last_ping
    }

    #[cfg(test)]
    pub(crate) fn force_last_retry(&mut self, stamp: u64) {
        self.last_retry = stamp;
    }
}
