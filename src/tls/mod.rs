//! TLS session over a non-blocking socket.
//!
//! [`TlsStream`] drives a rustls client session by hand: ciphertext is pulled
//! from the socket only when the session has no plaintext to hand out, and
//! pending ciphertext is pushed out whenever the socket is writable. Both
//! directions surface `WouldBlock` to the caller like a plain socket would.

pub mod buffers;

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, RootCertStore};
use rustls_pki_types::ServerName;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::{debug, trace};

pub use buffers::BufferSet;

use crate::error::{PgError, PgResult};

/// Client configuration trusting the webpki root set.
pub fn default_client_config() -> PgResult<Arc<ClientConfig>> {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Start a client session for `host` without touching any socket.
pub fn client_session(config: Arc<ClientConfig>, host: &str) -> PgResult<ClientConnection> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| PgError::Tls(format!("invalid hostname for TLS: {}", host)))?;
    Ok(ClientConnection::new(config, server_name)?)
}

/// A rustls client session wrapped around a socket.
pub struct TlsStream<S> {
    session: ClientConnection,
    sock: S,
}

impl<S: Read + Write> TlsStream<S> {
    pub fn new(sock: S, config: Arc<ClientConfig>, host: &str) -> PgResult<Self> {
        Ok(Self::from_parts(client_session(config, host)?, sock))
    }

    /// Wrap a socket in an already created session.
    pub fn from_parts(session: ClientConnection, sock: S) -> Self {
        Self { session, sock }
    }

    /// Read decrypted bytes. `Ok(0)` means the peer closed the session.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            // No plaintext buffered, pull more records off the socket
            match self.session.read_tls(&mut self.sock) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    trace!(bytes = n, "tls records received");
                    self.session
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    // Handshake replies and alerts go out as soon as possible
                    self.flush()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Encrypt `bufs` and push the ciphertext to the socket until either the
    /// buffers are drained or the socket would block. Returns the plaintext
    /// bytes taken from `bufs`.
    ///
    /// The session only buffers a bounded amount of ciphertext, so a large
    /// batch takes several encrypt and send rounds. Stopping early while the
    /// socket is still writable would leave data queued with no writable edge
    /// left to resume it.
    pub fn write_from(&mut self, bufs: &mut BufferSet) -> io::Result<usize> {
        let mut taken = 0;
        loop {
            let mut accepted = 0;
            loop {
                let Some(chunk) = bufs.chunks().next() else {
                    break;
                };
                let n = self.session.writer().write(chunk)?;
                if n == 0 {
                    break;
                }
                bufs.advance(n);
                accepted += n;
            }
            taken += accepted;

            let drained = self.send_tls()?;
            if bufs.is_empty() || !drained || accepted == 0 {
                break;
            }
        }
        Ok(taken)
    }

    /// Write pending ciphertext until the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        self.send_tls().map(|_| ())
    }

    /// Push ciphertext to the socket. `false` when it stopped on `WouldBlock`.
    fn send_tls(&mut self) -> io::Result<bool> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.sock) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket closed while writing TLS records",
                    ))
                }
                Ok(n) => trace!(bytes = n, "tls records sent"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Ciphertext is waiting for the socket.
    pub fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    /// `tls-server-end-point` channel binding data, once the server
    /// certificate is known.
    pub fn channel_binding(&self) -> Option<Vec<u8>> {
        let cert = self.session.peer_certificates()?.first()?;
        let binding = server_end_point_hash(cert.as_ref());
        debug!(len = binding.len(), "channel binding computed");
        Some(binding)
    }

    /// Queue a close_notify alert.
    pub fn send_close_notify(&mut self) {
        self.session.send_close_notify();
    }

    pub fn get_ref(&self) -> &S {
        &self.sock
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sock
    }
}

// ============================================================================
// Channel binding
// ============================================================================

// DER-encoded signature algorithm OIDs whose hash is stronger than SHA-256.
const SHA384_SIG_OIDS: &[&[u8]] = &[
    // sha384WithRSAEncryption 1.2.840.113549.1.1.12
    &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0C],
    // ecdsa-with-SHA384 1.2.840.10045.4.3.3
    &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x03],
];
const SHA512_SIG_OIDS: &[&[u8]] = &[
    // sha512WithRSAEncryption 1.2.840.113549.1.1.13
    &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0D],
    // ecdsa-with-SHA512 1.2.840.10045.4.3.4
    &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x04],
];

/// RFC 5929 `tls-server-end-point`: hash the certificate with the hash of its
/// signature algorithm, SHA-256 when that is weaker or unknown.
pub fn server_end_point_hash(cert_der: &[u8]) -> Vec<u8> {
    match signature_algorithm_oid(cert_der) {
        Some(oid) if SHA384_SIG_OIDS.iter().any(|o| *o == oid) => Sha384::digest(cert_der).to_vec(),
        Some(oid) if SHA512_SIG_OIDS.iter().any(|o| *o == oid) => Sha512::digest(cert_der).to_vec(),
        _ => Sha256::digest(cert_der).to_vec(),
    }
}

/// Read one DER TLV, returning (tag, contents, rest).
fn der_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = if first & 0x80 == 0 {
        (first as usize, rest)
    } else {
        let count = (first & 0x7F) as usize;
        if count == 0 || count > 4 || rest.len() < count {
            return None;
        }
        let len = rest[..count]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (len, &rest[count..])
    };
    if rest.len() < len {
        return None;
    }
    Some((tag, &rest[..len], &rest[len..]))
}

/// Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, signature }
fn signature_algorithm_oid(cert_der: &[u8]) -> Option<&[u8]> {
    const SEQUENCE: u8 = 0x30;
    const OID: u8 = 0x06;

    let (tag, cert, _) = der_tlv(cert_der)?;
    if tag != SEQUENCE {
        return None;
    }
    let (_, _tbs, rest) = der_tlv(cert)?;
    let (tag, algorithm, _) = der_tlv(rest)?;
    if tag != SEQUENCE {
        return None;
    }
    let (tag, oid, _) = der_tlv(algorithm)?;
    (tag == OID).then_some(oid)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal certificate-shaped DER with the given signature OID.
    fn fake_cert(oid: &[u8]) -> Vec<u8> {
        let tbs = [0x30, 0x03, 0x02, 0x01, 0x01];
        let mut alg = vec![0x06, oid.len() as u8];
        alg.extend_from_slice(oid);
        alg.extend_from_slice(&[0x05, 0x00]);
        let mut alg_seq = vec![0x30, alg.len() as u8];
        alg_seq.extend_from_slice(&alg);
        let sig = [0x03, 0x02, 0x00, 0xFF];

        let mut body = Vec::new();
        body.extend_from_slice(&tbs);
        body.extend_from_slice(&alg_seq);
        body.extend_from_slice(&sig);
        let mut cert = vec![0x30, body.len() as u8];
        cert.extend_from_slice(&body);
        cert
    }

    #[test]
    fn test_sha256_family_uses_sha256() {
        // sha256WithRSAEncryption
        let cert = fake_cert(&[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0B]);
        assert_eq!(
            signature_algorithm_oid(&cert),
            Some(&[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0B][..])
        );
        assert_eq!(server_end_point_hash(&cert), Sha256::digest(&cert).to_vec());
    }

    #[test]
    fn test_stronger_hashes_follow_signature() {
        let cert = fake_cert(SHA384_SIG_OIDS[1]);
        assert_eq!(server_end_point_hash(&cert).len(), 48);

        let cert = fake_cert(SHA512_SIG_OIDS[0]);
        assert_eq!(server_end_point_hash(&cert).len(), 64);
    }

    #[test]
    fn test_garbage_falls_back_to_sha256() {
        assert_eq!(server_end_point_hash(b"not a cert").len(), 32);
        assert!(der_tlv(&[0x30, 0x85, 0, 0, 0, 0, 1]).is_none());
    }

    #[test]
    fn test_default_config_builds() {
        assert!(default_client_config().is_ok());
    }

    const TEST_CERT: &[u8] = include_bytes!("testdata/localhost.cert.der");
    const TEST_KEY: &[u8] = include_bytes!("testdata/localhost.key.der");

    fn test_server_config() -> Arc<rustls::ServerConfig> {
        let cert = rustls_pki_types::CertificateDer::from(TEST_CERT);
        let key = rustls_pki_types::PrivateKeyDer::Pkcs8(
            rustls_pki_types::PrivatePkcs8KeyDer::from(TEST_KEY),
        );
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
        Arc::new(config)
    }

    fn test_client_config() -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots
            .add(rustls_pki_types::CertificateDer::from(TEST_CERT))
            .unwrap();
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        Arc::new(config)
    }

    #[test]
    fn test_write_from_drains_batches_larger_than_session_buffer() {
        use bytes::{Bytes, BytesMut};

        use crate::protocol::{BindMessage, Format, FrontendMessage};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let conn = rustls::ServerConnection::new(test_server_config()).unwrap();
            let mut tls = rustls::StreamOwned::new(conn, sock);
            tls.write_all(b"R").unwrap();
            tls.flush().unwrap();

            let mut header = [0u8; 5];
            tls.read_exact(&mut header).unwrap();
            let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
            let mut body = vec![0u8; len - 4];
            tls.read_exact(&mut body).unwrap();

            tls.write_all(b"D").unwrap();
            tls.flush().unwrap();
            (header[0], len)
        });

        let sock = std::net::TcpStream::connect(addr).unwrap();
        let mut stream = TlsStream::new(sock, test_client_config(), "localhost").unwrap();
        stream.flush().unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(stream.read(&mut byte).unwrap(), 1);
        assert_eq!(&byte, b"R");

        // Well past the 64 KiB rustls keeps buffered per session.
        let value = Bytes::from(vec![0x5Au8; 200 * 1024]);
        let mut encoded = BytesMut::new();
        BindMessage {
            portal: "",
            statement: "__pm_1",
            param_formats: &[Format::Binary],
            values: &[Some(value)],
            result_formats: &[Format::Binary],
        }
        .encode_to(&mut encoded);
        let total = encoded.len();

        let mut bufs = BufferSet::new();
        bufs.push_bytes(encoded.freeze());
        assert_eq!(stream.write_from(&mut bufs).unwrap(), total);
        assert!(bufs.is_empty());
        assert!(!stream.wants_write());

        assert_eq!(stream.read(&mut byte).unwrap(), 1);
        assert_eq!(&byte, b"D");
        assert_eq!(server.join().unwrap(), (b'B', total - 1));
    }

    #[test]
    fn test_invalid_server_name() {
        let config = default_client_config().unwrap();
        let result = TlsStream::new(std::io::Cursor::new(Vec::new()), config, "bad host name!");
        assert!(matches!(result, Err(PgError::Tls(_))));
    }
}
