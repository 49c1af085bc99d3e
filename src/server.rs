//! Server core (C6): per-transport accept logic, composed from a [`Node`].
//!
//! Each [`crate::scheme::Scheme`] is paired with exactly one OS-level
//! listening resource here: a `TcpListener` for TCP/TLS/SCTP, or a
//! `UdpSocket` for UDP/DTLS. TCP-family listeners go through a normal
//! `accept()` loop; UDP gets one virtual broker per scheme; DTLS
//! additionally gates that promotion behind a verified cookie.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, UdpSocket};
use mio::Token;
use rustls::ServerConfig;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerState};
use crate::error::{Error, ErrorKind, Result};
use crate::node::Node;
use crate::reactor::Interests;
use crate::scheme::Scheme;
use crate::socket::dtls::DtlsEngine;
use crate::socket::dtls_cookie::{CookieSecret, COOKIE_LEN};
use crate::socket::tls::TlsEngine;
use crate::socket::{create_sctp_socket, SocketEngine, TcpEngine, Transport, UdpEngine};

/// Retry cadence for a DTLS accept awaiting a verified cookie.
pub const DTLS_ACCEPT_POLL: Duration = Duration::from_millis(100);
/// Retry cadence for a DTLS handshake step once promoted to a broker.
pub const DTLS_HANDSHAKE_POLL: Duration = Duration::from_millis(10);

const DTLS_CLIENT_HELLO: u8 = 0;
const DTLS_COOKIE_ECHO: u8 = 1;
const DTLS_HELLO_VERIFY: u8 = 2;

enum Listener {
    Stream {
        listener: TcpListener,
        scheme_id: u64,
        tls: Option<Arc<ServerConfig>>,
    },
    Dtls {
        socket: UdpSocket,
        scheme_id: u64,
        secret: CookieSecret,
    },
}

/// Composes a [`Node`] with per-scheme listening sockets and implements
/// the accept half of the transport stack, across plain/TLS/UDP/DTLS/SCTP.
pub struct ServerCore {
    pub node: Node,
    listeners: HashMap<Token, Listener>,
    on_accept: Option<Box<dyn FnMut(SocketAddr, u64) -> bool + Send>>,
    on_connect: Option<Arc<dyn Fn(u64, u64) + Send + Sync>>,
    on_read: Option<Arc<dyn Fn(&[u8], u64, u64) + Send + Sync>>,
    on_write: Option<Arc<dyn Fn(&[u8], u64, u64) + Send + Sync>>,
    on_close: Option<Arc<dyn Fn(u64, u64) + Send + Sync>>,
}

impl ServerCore {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            node: Node::new()?,
            listeners: HashMap::new(),
            on_accept: None,
            on_connect: None,
            on_read: None,
            on_write: None,
            on_close: None,
        })
    }

    pub fn on_accept(&mut self, f: impl FnMut(SocketAddr, u64) -> bool + Send + 'static) {
        self.on_accept = Some(Box::new(f));
    }

    pub fn on_connect(&mut self, f: impl Fn(u64, u64) + Send + Sync + 'static) {
        self.on_connect = Some(Arc::new(f));
    }

    pub fn on_read(&mut self, f: impl Fn(&[u8], u64, u64) + Send + Sync + 'static) {
        self.on_read = Some(Arc::new(f));
    }

    pub fn on_write(&mut self, f: impl Fn(&[u8], u64, u64) + Send + Sync + 'static) {
        self.on_write = Some(Arc::new(f));
    }

    pub fn on_close(&mut self, f: impl Fn(u64, u64) + Send + Sync + 'static) {
        self.on_close = Some(Arc::new(f));
    }

    /// Forwards this core's shared, per-scheme default handlers into a
    /// freshly constructed broker. Each handler is an `Arc<dyn Fn>` shared
    /// across every broker; a small owned closure adapts it to the
    /// per-broker `FnMut` slot the hot read/write/close path expects.
    fn wire_broker(&self, broker: &mut Broker) {
        if let Some(cb) = &self.on_connect {
            let cb = cb.clone();
            broker.on_connect = Some(Box::new(move |bid, sid| cb(bid, sid)));
        }
        if let Some(cb) = &self.on_read {
            let cb = cb.clone();
            broker.on_read = Some(Box::new(move |data, bid, sid| cb(data, bid, sid)));
        }
        if let Some(cb) = &self.on_write {
            let cb = cb.clone();
            broker.on_write = Some(Box::new(move |data, bid, sid| cb(data, bid, sid)));
        }
        if let Some(cb) = &self.on_close {
            let cb = cb.clone();
            broker.on_close = Some(Box::new(move |bid, sid| cb(bid, sid)));
        }
    }

    fn bind_addr(scheme: &Scheme) -> Result<SocketAddr> {
        let raw = format!("{}:{}", scheme.host, scheme.port);
        raw.parse().map_err(|e: std::net::AddrParseError| Error::Bind {
            kind: ErrorKind::Start,
            address: raw,
            reason: e.to_string(),
        })
    }

    /// Starts listening for `scheme`'s transport. `tls` is required for
    /// `Transport::Tls`/`Transport::Dtls` schemes and ignored otherwise.
    pub fn listen(&mut self, scheme: Scheme, tls: Option<Arc<ServerConfig>>) -> Result<u64> {
        match scheme.transport {
            Transport::Tcp => self.listen_stream(scheme, None),
            Transport::Tls => {
                let cfg = tls.ok_or_else(|| missing_tls(&scheme))?;
                self.listen_stream(scheme, Some(cfg))
            }
            Transport::Sctp => self.listen_sctp(scheme),
            Transport::Udp => self.listen_udp(scheme),
            Transport::Dtls => {
                let cfg = tls.ok_or_else(|| missing_tls(&scheme))?;
                self.listen_dtls(scheme, cfg)
            }
        }
    }

    fn listen_stream(&mut self, mut scheme: Scheme, tls: Option<Arc<ServerConfig>>) -> Result<u64> {
        let addr = Self::bind_addr(&scheme)?;
        let mut listener = TcpListener::bind(addr).map_err(|e| bind_err(addr, e))?;
        let token = self.node.next_token();
        self.node
            .reactor
            .register_source(&mut listener, token, Interests::READ)
            .map_err(|e| bind_err(addr, e))?;
        scheme.listening = true;
        let scheme_id = self.node.add_scheme(scheme);
        self.listeners.insert(token, Listener::Stream { listener, scheme_id, tls });
        info!(scheme_id, %addr, "listening");
        Ok(scheme_id)
    }

    fn listen_sctp(&mut self, mut scheme: Scheme) -> Result<u64> {
        let addr = Self::bind_addr(&scheme)?;
        let domain = if addr.is_ipv6() {
            socket2::Domain::IPV6
        } else {
            socket2::Domain::IPV4
        };
        let sock = create_sctp_socket(domain).map_err(|e| bind_err(addr, e))?;
        sock.set_nonblocking(true).map_err(|e| bind_err(addr, e))?;
        sock.set_reuse_address(true).ok();
        sock.bind(&addr.into()).map_err(|e| bind_err(addr, e))?;
        sock.listen(1024).map_err(|e| bind_err(addr, e))?;

        let std_listener: std::net::TcpListener = sock.into();
        let mut listener = TcpListener::from_std(std_listener);
        let token = self.node.next_token();
        self.node
            .reactor
            .register_source(&mut listener, token, Interests::READ)
            .map_err(|e| bind_err(addr, e))?;
        scheme.listening = true;
        let scheme_id = self.node.add_scheme(scheme);
        self.listeners.insert(token, Listener::Stream { listener, scheme_id, tls: None });
        info!(scheme_id, %addr, "listening (sctp)");
        Ok(scheme_id)
    }

    fn listen_udp(&mut self, mut scheme: Scheme) -> Result<u64> {
        let addr = Self::bind_addr(&scheme)?;
        let socket = UdpSocket::bind(addr).map_err(|e| bind_err(addr, e))?;
        scheme.listening = true;
        let scheme_id = self.node.add_scheme(scheme);

        let token = self.node.next_token();
        let engine: Box<dyn SocketEngine> = Box::new(UdpEngine::new(socket));
        let mut broker = Broker::new(scheme_id, token, engine);
        self.wire_broker(&mut broker);
        let bid = self.node.register_broker(broker)?;
        if let Some(broker) = self.node.broker_mut(bid) {
            broker.transition(BrokerState::Connected);
            if let Some(cb) = broker.on_connect.as_mut() {
                cb(bid, scheme_id);
            }
        }
        self.node.arm_receive_idle(bid);
        info!(scheme_id, bid, %addr, "listening (udp virtual broker)");
        Ok(scheme_id)
    }

    fn listen_dtls(&mut self, mut scheme: Scheme, _tls: Arc<ServerConfig>) -> Result<u64> {
        let addr = Self::bind_addr(&scheme)?;
        let mut socket = UdpSocket::bind(addr).map_err(|e| bind_err(addr, e))?;
        let token = self.node.next_token();
        self.node
            .reactor
            .register_source(&mut socket, token, Interests::READ)
            .map_err(|e| bind_err(addr, e))?;
        scheme.listening = true;
        let secret = CookieSecret::generate();
        let scheme_id = self.node.add_scheme(scheme);
        self.listeners.insert(token, Listener::Dtls { socket, scheme_id, secret });
        info!(scheme_id, %addr, "listening (dtls)");
        Ok(scheme_id)
    }

    /// Runs the reactor until the next readiness/timer batch, dispatching
    /// accepted listener events.
    pub fn run_once(&mut self) -> io::Result<()> {
        let (readable, _writable) = self.node.poll_ready()?;
        for token in readable {
            self.accept_one(token);
        }
        Ok(())
    }

    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.run_once()?;
        }
    }

    fn accept_one(&mut self, token: Token) {
        match self.listeners.get(&token) {
            Some(Listener::Stream { .. }) => self.accept_stream(token),
            Some(Listener::Dtls { .. }) => self.accept_dtls(token),
            None => {}
        }
    }

    fn accept_stream(&mut self, token: Token) {
        loop {
            let (stream, peer, scheme_id, tls) = {
                let Some(Listener::Stream { listener, scheme_id, tls }) = self.listeners.get_mut(&token) else {
                    return;
                };
                match listener.accept() {
                    Ok((stream, peer)) => (stream, peer, *scheme_id, tls.clone()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) => {
                        warn!(scheme_id = *scheme_id, "accept failed: {e}");
                        return;
                    }
                }
            };

            if let Some(cb) = self.on_accept.as_mut() {
                if !cb(peer, scheme_id) {
                    debug!(%peer, scheme_id, "accept rejected by application");
                    continue;
                }
            }

            let is_tls = tls.is_some();
            let engine: Box<dyn SocketEngine> = match tls {
                Some(cfg) => match TlsEngine::new(stream, cfg) {
                    Ok(e) => Box::new(e),
                    Err(e) => {
                        warn!(%peer, scheme_id, "tls wrap failed: {e}");
                        continue;
                    }
                },
                None => Box::new(TcpEngine::new(stream)),
            };

            let btoken = self.node.next_token();
            let mut broker = Broker::new(scheme_id, btoken, engine);
            self.wire_broker(&mut broker);
            match self.node.register_broker(broker) {
                Ok(bid) => {
                    if let Some(b) = self.node.broker_mut(bid) {
                        if is_tls {
                            b.transition(BrokerState::WaitHandshake);
                        } else {
                            b.transition(BrokerState::Connected);
                            if let Some(cb) = b.on_connect.as_mut() {
                                cb(bid, scheme_id);
                            }
                        }
                    }
                    if !is_tls {
                        self.node.arm_receive_idle(bid);
                    }
                    debug!(%peer, scheme_id, bid, "accepted");
                }
                Err(e) => warn!(%peer, scheme_id, "accept rejected: {e}"),
            }
        }
    }

    fn accept_dtls(&mut self, token: Token) {
        let scheme_id = match self.listeners.get(&token) {
            Some(Listener::Dtls { scheme_id, .. }) => *scheme_id,
            _ => return,
        };

        let mut buf = [0u8; 2048];
        loop {
            let (n, peer) = {
                let Some(Listener::Dtls { socket, .. }) = self.listeners.get_mut(&token) else {
                    return;
                };
                match socket.recv_from(&mut buf) {
                    Ok(v) => v,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(_) => return,
                }
            };
            if n == 0 {
                continue;
            }
            let msg_type = buf[0];
            let payload = buf[1..n].to_vec();

            match msg_type {
                DTLS_CLIENT_HELLO => self.reply_hello_verify(token, peer),
                DTLS_COOKIE_ECHO => self.try_promote_dtls_peer(token, scheme_id, peer, &payload),
                _ => {}
            }
        }
    }

    fn reply_hello_verify(&mut self, token: Token, peer: SocketAddr) {
        let Some(Listener::Dtls { socket, secret, scheme_id }) = self.listeners.get_mut(&token) else {
            return;
        };
        let cookie = secret.cookie_for(&peer);
        let mut reply = Vec::with_capacity(1 + COOKIE_LEN);
        reply.push(DTLS_HELLO_VERIFY);
        reply.extend_from_slice(&cookie);
        if socket.send_to(&reply, peer).is_ok() {
            debug!(%peer, scheme_id = *scheme_id, "dtls cookie challenge sent");
        }
    }

    fn try_promote_dtls_peer(&mut self, token: Token, scheme_id: u64, peer: SocketAddr, cookie: &[u8]) {
        let verified = match self.listeners.get(&token) {
            Some(Listener::Dtls { secret, .. }) => secret.verify(&peer, cookie),
            _ => false,
        };
        if !verified {
            warn!(%peer, scheme_id, "dtls cookie verification failed");
            return;
        }

        if let Some(cb) = self.on_accept.as_mut() {
            if !cb(peer, scheme_id) {
                debug!(%peer, scheme_id, "dtls accept rejected by application");
                return;
            }
        }

        let listening = match self.listeners.get(&token) {
            Some(Listener::Dtls { socket, .. }) => socket,
            _ => return,
        };
        let peer_socket = match promote_dtls_socket(listening, peer) {
            Ok(s) => s,
            Err(e) => {
                warn!(%peer, scheme_id, "dtls peer socket setup failed: {e}");
                return;
            }
        };

        let engine: Box<dyn SocketEngine> = Box::new(DtlsEngine::new(peer_socket, peer));
        let btoken = self.node.next_token();
        let mut broker = Broker::new(scheme_id, btoken, engine);
        self.wire_broker(&mut broker);
        match self.node.register_broker(broker) {
            Ok(bid) => {
                if let Some(b) = self.node.broker_mut(bid) {
                    b.transition(BrokerState::WaitHandshake);
                    b.transition(BrokerState::Connected);
                    if let Some(cb) = b.on_connect.as_mut() {
                        cb(bid, scheme_id);
                    }
                }
                self.node.arm_receive_idle(bid);
                debug!(%peer, scheme_id, bid, "dtls peer promoted");
            }
            Err(e) => warn!(%peer, scheme_id, "dtls promote rejected: {e}"),
        }
    }

    /// Stop order: the caller stops any cluster supervisor first, then
    /// this closes every broker, deregisters every listener, and finally
    /// requests the reactor to stop.
    pub fn shutdown(&mut self) {
        let scheme_ids: Vec<u64> = self.node.schemes.keys().copied().collect();
        for sid in scheme_ids {
            self.node.remove_scheme(sid);
        }
        for (token, listener) in self.listeners.drain() {
            match listener {
                Listener::Stream { mut listener, .. } => {
                    let _ = self.node.reactor.deregister_source(&mut listener, token);
                }
                Listener::Dtls { mut socket, .. } => {
                    let _ = self.node.reactor.deregister_source(&mut socket, token);
                }
            }
        }
        self.node.reactor.stop_handle().request_stop();
    }
}

fn missing_tls(scheme: &Scheme) -> Error {
    Error::Bind {
        kind: ErrorKind::Start,
        address: format!("{}:{}", scheme.host, scheme.port),
        reason: "scheme requires a TLS ServerConfig".into(),
    }
}

fn bind_err(addr: SocketAddr, e: io::Error) -> Error {
    Error::Bind {
        kind: ErrorKind::Start,
        address: addr.to_string(),
        reason: e.to_string(),
    }
}

/// Duplicates `listening`'s fd and `connect()`s the duplicate to `peer`.
/// A connected UDP socket takes priority over the unconnected listening
/// socket for datagrams matching that 4-tuple, which is how this crate
/// demultiplexes DTLS peers without rebinding per association.
fn promote_dtls_socket(listening: &UdpSocket, peer: SocketAddr) -> io::Result<UdpSocket> {
    let cloned = crate::socket::with_socket2_udp(listening, |sock| sock.try_clone())?;
    cloned.connect(&peer.into())?;
    let std_socket: std::net::UdpSocket = cloned.into();
    std_socket.set_nonblocking(true)?;
    UdpSocket::from_std(std_socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{Family, Scheme};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn tcp_accept_creates_broker_and_fires_on_connect() {
        let mut core = ServerCore::new().unwrap();
        let scheme = Scheme::new(Family::Ipv4, Transport::Tcp, "127.0.0.1", 0);
        core.listen(scheme, None).unwrap();

        let addr = match core.listeners.values().next().unwrap() {
            Listener::Stream { listener, .. } => listener.local_addr().unwrap(),
            _ => unreachable!(),
        };

        let connected = Arc::new(AtomicUsize::new(0));
        let c = connected.clone();
        core.on_connect(move |_bid, _sid| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let client = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            std::net::TcpStream::connect(addr).unwrap()
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while connected.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            core.run_once().unwrap();
        }
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        client.join().unwrap();
    }

    #[test]
    fn on_accept_returning_false_rejects_connection() {
        let mut core = ServerCore::new().unwrap();
        let scheme = Scheme::new(Family::Ipv4, Transport::Tcp, "127.0.0.1", 0);
        core.listen(scheme, None).unwrap();
        let addr = match core.listeners.values().next().unwrap() {
            Listener::Stream { listener, .. } => listener.local_addr().unwrap(),
            _ => unreachable!(),
        };
        core.on_accept(|_peer, _sid| false);

        let connected = Arc::new(AtomicUsize::new(0));
        let c = connected.clone();
        core.on_connect(move |_bid, _sid| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let client = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let _ = std::net::TcpStream::connect(addr);
        });

        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            core.run_once().unwrap();
        }
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        client.join().unwrap();
    }

    #[test]
    fn idle_broker_disconnects_after_wait_message_timeout() {
        let mut core = ServerCore::new().unwrap();
        let mut scheme = Scheme::new(Family::Ipv4, Transport::Tcp, "127.0.0.1", 0);
        scheme.defaults.wait_message_secs = 1;
        core.listen(scheme, None).unwrap();
        let addr = match core.listeners.values().next().unwrap() {
            Listener::Stream { listener, .. } => listener.local_addr().unwrap(),
            _ => unreachable!(),
        };

        let disconnected = Arc::new(AtomicUsize::new(0));
        let d = disconnected.clone();
        core.on_close(move |_bid, _sid| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        // Client connects and then sends nothing.
        let client = thread::spawn(move || {
            let stream = std::net::TcpStream::connect(addr).unwrap();
            thread::sleep(Duration::from_secs(3));
            drop(stream);
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while disconnected.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            core.run_once().unwrap();
        }
        assert_eq!(disconnected.load(Ordering::SeqCst), 1, "broker should close after idle timeout alone");
        client.join().unwrap();
    }

    #[test]
    fn udp_listen_registers_one_virtual_broker_immediately() {
        let mut core = ServerCore::new().unwrap();
        let scheme = Scheme::new(Family::Ipv4, Transport::Udp, "127.0.0.1", 0);
        let scheme_id = core.listen(scheme, None).unwrap();
        assert_eq!(core.node.schemes.get(&scheme_id).unwrap().broker_count(), 1);
    }
}
