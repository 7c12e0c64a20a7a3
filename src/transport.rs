//! Byte transport under a connection: a plain socket or a TLS session over it.

use std::io::{self, IoSlice, Read, Write};
use std::sync::Arc;

use mio::net::TcpStream;
use tracing::debug;

use crate::error::{PgError, PgResult};
use crate::tls::{self, BufferSet, TlsStream};

/// Upper bound on slices handed to one vectored write.
const MAX_IO_SLICES: usize = 64;

pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient state while the socket moves into a TLS session.
    Detached,
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// The underlying socket, for readiness registration.
    pub fn socket_mut(&mut self) -> Option<&mut TcpStream> {
        match self {
            Transport::Plain(sock) => Some(sock),
            Transport::Tls(tls) => Some(tls.get_mut()),
            Transport::Detached => None,
        }
    }

    pub fn socket(&self) -> Option<&TcpStream> {
        match self {
            Transport::Plain(sock) => Some(sock),
            Transport::Tls(tls) => Some(tls.get_ref()),
            Transport::Detached => None,
        }
    }

    /// Move the plain socket into a TLS client session.
    pub fn upgrade(&mut self, config: Arc<rustls::ClientConfig>, host: &str) -> PgResult<()> {
        if !matches!(self, Transport::Plain(_)) {
            return Err(PgError::Tls("transport is not a plain socket".to_string()));
        }
        // Fallible setup happens before the socket leaves `self`
        let session = tls::client_session(config, host)?;
        if let Transport::Plain(sock) = std::mem::replace(self, Transport::Detached) {
            *self = Transport::Tls(Box::new(TlsStream::from_parts(session, sock)));
            debug!(host, "transport upgraded to TLS");
        }
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.read(buf),
            Transport::Tls(tls) => tls.read(buf),
            Transport::Detached => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Drain `bufs` until it is empty or the socket would block. Returns the
    /// number of bytes taken from `bufs`.
    pub fn write_from(&mut self, bufs: &mut BufferSet) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => {
                let mut total = 0;
                while !bufs.is_empty() {
                    let mut slices = [IoSlice::new(&[]); MAX_IO_SLICES];
                    let count = bufs.io_slices(&mut slices);
                    match sock.write_vectored(&slices[..count]) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => {
                            bufs.advance(n);
                            total += n;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(total)
            }
            Transport::Tls(tls) => tls.write_from(bufs),
            Transport::Detached => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Push out bytes buffered below the caller (TLS records).
    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tls(tls) => tls.flush(),
            _ => Ok(()),
        }
    }

    /// Bytes are waiting below the caller's buffers.
    pub fn wants_write(&self) -> bool {
        match self {
            Transport::Tls(tls) => tls.wants_write(),
            _ => false,
        }
    }

    pub fn channel_binding(&self) -> Option<Vec<u8>> {
        match self {
            Transport::Tls(tls) => tls.channel_binding(),
            _ => None,
        }
    }

    /// Queue a TLS close_notify; plain sockets need nothing.
    pub fn begin_shutdown(&mut self) {
        if let Transport::Tls(tls) = self {
            tls.send_close_notify();
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain"),
            Transport::Tls(_) => f.write_str("Transport::Tls"),
            Transport::Detached => f.write_str("Transport::Detached"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::TcpListener;
    use std::time::Duration;

    fn connected_pair() -> (Transport, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Transport::Plain(TcpStream::from_std(client)), server)
    }

    #[test]
    fn test_plain_write_drains_buffer_set() {
        let (mut transport, mut server) = connected_pair();
        let mut bufs = BufferSet::new();
        bufs.push_bytes(Bytes::from_static(b"hello "));
        bufs.push_bytes(Bytes::from_static(b"world"));

        assert_eq!(transport.write_from(&mut bufs).unwrap(), 11);
        assert!(bufs.is_empty());

        let mut received = [0u8; 11];
        server.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"hello world");
    }

    #[test]
    fn test_plain_read_would_block_then_data() {
        let (mut transport, mut server) = connected_pair();
        let mut buf = [0u8; 16];
        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        server.write_all(b"abc").unwrap();
        let mut n = 0;
        for _ in 0..100 {
            match transport.read(&mut buf) {
                Ok(read) => {
                    n = read;
                    break;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn test_upgrade_only_from_plain() {
        let (mut transport, _server) = connected_pair();
        let config = tls::default_client_config().unwrap();

        assert!(transport.upgrade(Arc::clone(&config), "bad host!").is_err());
        assert!(!transport.is_tls());

        transport.upgrade(Arc::clone(&config), "localhost").unwrap();
        assert!(transport.is_tls());
        assert!(transport.socket_mut().is_some());
        assert!(transport.upgrade(config, "localhost").is_err());
    }
}
