//! TLS engine: wraps a `mio::net::TcpStream` with a synchronous
//! `rustls::ServerConnection`, since the reactor core is mio-driven and
//! synchronous (see [`crate::reactor`]'s module doc).

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::event::Source;
use mio::net::TcpStream;
use rustls::ServerConnection;

use super::{EngineError, EngineResult, SocketEngine, Transport};

pub struct TlsEngine {
    stream: TcpStream,
    conn: ServerConnection,
}

impl TlsEngine {
    pub fn new(stream: TcpStream, config: Arc<rustls::ServerConfig>) -> io::Result<Self> {
        let conn = ServerConnection::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(Self { stream, conn })
    }

    /// Pumps one round of TLS record I/O: reads ciphertext off the
    /// socket, feeds it to rustls, and flushes any pending plaintext the
    /// handshake state machine produced in response.
    fn pump(&mut self) -> EngineResult<()> {
        if self.conn.wants_write() {
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut self.stream) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if self.conn.wants_read() {
            match self.conn.read_tls(&mut self.stream) {
                Ok(0) => return Err(EngineError::Eof),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| EngineError::Fatal(crate::error::Error::protocol(0, e.to_string())))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Source for TlsEngine {
    fn register(&mut self, registry: &mio::Registry, token: mio::Token, interests: mio::Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }
    fn reregister(&mut self, registry: &mio::Registry, token: mio::Token, interests: mio::Interest) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }
    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

impl SocketEngine for TlsEngine {
    fn transport(&self) -> Transport {
        Transport::Tls
    }

    fn wait_handshake(&mut self) -> EngineResult<bool> {
        self.pump()?;
        Ok(!self.conn.is_handshaking())
    }

    fn read(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        if self.conn.is_handshaking() {
            let done = self.wait_handshake()?;
            if !done {
                return Err(EngineError::HandshakePending);
            }
        }
        self.pump()?;
        match self.conn.reader().read(buf) {
            Ok(0) => Err(EngineError::Again),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(EngineError::Again),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> EngineResult<usize> {
        if self.conn.is_handshaking() {
            let done = self.wait_handshake()?;
            if !done {
                return Err(EngineError::HandshakePending);
            }
        }
        let n = self
            .conn
            .writer()
            .write(buf)
            .map_err(|e: io::Error| EngineError::from(e))?;
        self.pump()?;
        Ok(n)
    }

    fn set_blocking(&mut self, on: bool) -> io::Result<()> {
        super::with_socket2(&self.stream, |sock| sock.set_nonblocking(!on))
    }

    fn set_buffers(&mut self, rx: usize, tx: usize) -> io::Result<()> {
        super::with_socket2(&self.stream, |sock| {
            sock.set_recv_buffer_size(rx)?;
            sock.set_send_buffer_size(tx)
        })
    }

    fn set_nodelay(&mut self, on: bool) -> io::Result<()> {
        self.stream.set_nodelay(on)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}
