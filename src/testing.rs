//! In-process PostgreSQL stand-in for tests.
//!
//! Speaks enough of the v3 protocol to drive the engine end to end: SSL
//! refusal, trust or SCRAM-SHA-256 authentication, and the extended-query
//! subset (Parse, Bind, Describe, Execute, Close, Sync). Each client is served
//! by a blocking std thread.
//!
//! Query semantics are deliberately tiny. A query starting with `SELECT`
//! returns one row with one column `n` echoing the first parameter (or int4
//! `1` without parameters). Anything else reports `INSERT 0 1` per
//! execution. A query containing `syntax error` fails to parse.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use crate::auth::scram::{hi, hmac_sha256, sha256, xor_bytes};
use crate::config::{ConnectConfig, SslMode};
use crate::protocol::SSL_REQUEST_CODE;

/// Route engine logs to the test harness. Filter with `RUST_LOG`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const SALT: &[u8] = b"mock-server-salt";
const ITERATIONS: u32 = 4096;

#[derive(Clone)]
pub enum MockAuth {
    Trust,
    Scram { password: String },
}

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    parses: AtomicUsize,
    executes: AtomicUsize,
    /// Bumped to make every session forget its prepared statements.
    forget_generation: AtomicUsize,
    /// Replies are held back until this many Syncs arrived, then written at once.
    hold_syncs: AtomicUsize,
    /// First parameter of every executed non-SELECT statement, in run order.
    executed: Mutex<Vec<Option<Vec<u8>>>>,
}

pub struct MockServer {
    addr: SocketAddr,
    counters: Arc<Counters>,
}

impl MockServer {
    pub fn start(auth: MockAuth) -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let counters = Arc::new(Counters::default());

        let shared = Arc::clone(&counters);
        thread::Builder::new()
            .name("mock-postgres".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    shared.connections.fetch_add(1, Ordering::SeqCst);
                    let auth = auth.clone();
                    let counters = Arc::clone(&shared);
                    thread::spawn(move || {
                        let _ = MockSession::new(stream, auth, counters).run();
                    });
                }
            })
            .unwrap();

        Self { addr, counters }
    }

    /// Client configuration pointing at this server.
    pub fn config(&self) -> ConnectConfig {
        ConnectConfig::new("127.0.0.1", self.addr.port())
            .user("tester")
            .database("mock")
            .ssl_mode(SslMode::Prefer)
    }

    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    pub fn parses(&self) -> usize {
        self.counters.parses.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.counters.executes.load(Ordering::SeqCst)
    }

    /// Drop every prepared statement on every session, as a server restart
    /// behind a proxy would.
    pub fn forget_statements(&self) {
        self.counters.forget_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Answer the next `syncs` pipelined submissions with one write, so the
    /// client sees all their replies in a single read.
    pub fn hold_replies(&self, syncs: usize) {
        self.counters.hold_syncs.store(syncs, Ordering::SeqCst);
    }

    /// Int4 first parameters of the non-SELECT statements executed so far.
    pub fn executed_int4(&self) -> Vec<i32> {
        self.counters
            .executed
            .lock()
            .iter()
            .filter_map(|v| v.as_deref()?.try_into().ok())
            .map(i32::from_be_bytes)
            .collect()
    }
}

struct Statement {
    query: String,
    param_types: Vec<i32>,
}

struct MockSession {
    stream: TcpStream,
    auth: MockAuth,
    counters: Arc<Counters>,
    statements: HashMap<String, Statement>,
    seen_generation: usize,
    bound: Option<(String, Vec<Option<Vec<u8>>>)>,
    skipping: bool,
}

impl MockSession {
    fn new(stream: TcpStream, auth: MockAuth, counters: Arc<Counters>) -> Self {
        let seen_generation = counters.forget_generation.load(Ordering::SeqCst);
        Self {
            stream,
            auth,
            counters,
            statements: HashMap::new(),
            seen_generation,
            bound: None,
            skipping: false,
        }
    }

    fn run(mut self) -> io::Result<()> {
        let user = self.startup()?;
        if !self.authenticate(&user)? {
            return Ok(());
        }

        let mut out = BytesMut::new();
        parameter_status(&mut out, "server_version", "16.0-mock");
        parameter_status(&mut out, "client_encoding", "UTF8");
        frame(&mut out, b'K', |b| {
            b.put_i32(4242);
            b.put_i32(7);
        });
        ready_for_query(&mut out);
        self.stream.write_all(&out)?;

        let mut out = BytesMut::new();
        let mut syncs_held = 0;
        loop {
            let (tag, body) = self.read_message()?;
            if tag == b'X' {
                return Ok(());
            }
            self.handle(tag, &body, &mut out);

            let hold = self.counters.hold_syncs.load(Ordering::SeqCst);
            if hold > 0 {
                if tag != b'S' {
                    continue;
                }
                syncs_held += 1;
                if syncs_held < hold {
                    continue;
                }
                syncs_held = 0;
                self.counters.hold_syncs.store(0, Ordering::SeqCst);
            }
            if !out.is_empty() {
                self.stream.write_all(&out)?;
                out.clear();
            }
        }
    }

    fn startup(&mut self) -> io::Result<String> {
        loop {
            let len = read_i32(&mut self.stream)? as usize;
            let mut body = vec![0u8; len - 4];
            self.stream.read_exact(&mut body)?;
            let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            if code == SSL_REQUEST_CODE {
                self.stream.write_all(b"N")?;
                continue;
            }

            let params: Vec<String> = body[4..]
                .split(|b| *b == 0)
                .map(|s| String::from_utf8_lossy(s).to_string())
                .collect();
            let user = params
                .chunks(2)
                .find(|kv| kv[0] == "user")
                .and_then(|kv| kv.get(1).cloned())
                .unwrap_or_default();
            return Ok(user);
        }
    }

    fn authenticate(&mut self, user: &str) -> io::Result<bool> {
        let password = match &self.auth {
            MockAuth::Trust => {
                let mut out = BytesMut::new();
                auth_code(&mut out, 0, &[]);
                self.stream.write_all(&out)?;
                return Ok(true);
            }
            MockAuth::Scram { password } => password.clone(),
        };

        let mut out = BytesMut::new();
        auth_code(&mut out, 10, b"SCRAM-SHA-256\0\0");
        self.stream.write_all(&out)?;

        // SASLInitialResponse: mechanism, length, client-first
        let (_, body) = self.read_message()?;
        let mech_end = body.iter().position(|b| *b == 0).unwrap();
        let client_first = String::from_utf8_lossy(&body[mech_end + 5..]).to_string();
        let (gs2, bare) = client_first.split_at(client_first.find("n=").unwrap());
        assert!(gs2 == "n,," || gs2 == "y,,", "unexpected GS2 header {}", gs2);
        assert!(bare.starts_with(&format!("n={},", user)) || bare.starts_with("n=,"));
        let client_nonce = bare.split("r=").nth(1).unwrap().to_string();

        let server_first = format!(
            "r={}mockserver,s={},i={}",
            client_nonce,
            BASE64.encode(SALT),
            ITERATIONS
        );
        let mut out = BytesMut::new();
        auth_code(&mut out, 11, server_first.as_bytes());
        self.stream.write_all(&out)?;

        let (_, body) = self.read_message()?;
        let client_final = String::from_utf8_lossy(&body).to_string();
        let proof_at = client_final.find(",p=").unwrap();
        let without_proof = &client_final[..proof_at];
        let proof = BASE64.decode(&client_final[proof_at + 3..]).unwrap();

        let salted = hi(&password, SALT, ITERATIONS).unwrap();
        let client_key = hmac_sha256(&salted, b"Client Key").unwrap();
        let stored_key = sha256(&client_key);
        let auth_message = format!("{},{},{}", bare, server_first, without_proof);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes()).unwrap();

        let proof: [u8; 32] = proof.try_into().unwrap_or([0u8; 32]);
        let recovered = xor_bytes(&proof, &client_signature);
        if sha256(&recovered) != stored_key {
            let mut out = BytesMut::new();
            error_response(
                &mut out,
                "FATAL",
                "28P01",
                &format!("password authentication failed for user \"{}\"", user),
            );
            self.stream.write_all(&out)?;
            return Ok(false);
        }

        let server_key = hmac_sha256(&salted, b"Server Key").unwrap();
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes()).unwrap();
        let mut out = BytesMut::new();
        auth_code(
            &mut out,
            12,
            format!("v={}", BASE64.encode(server_signature)).as_bytes(),
        );
        auth_code(&mut out, 0, &[]);
        self.stream.write_all(&out)?;
        Ok(true)
    }

    fn read_message(&mut self) -> io::Result<(u8, Vec<u8>)> {
        let mut tag = [0u8; 1];
        self.stream.read_exact(&mut tag)?;
        let len = read_i32(&mut self.stream)? as usize;
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body)?;
        Ok((tag[0], body))
    }

    fn handle(&mut self, tag: u8, body: &[u8], out: &mut BytesMut) {
        let generation = self.counters.forget_generation.load(Ordering::SeqCst);
        if generation != self.seen_generation {
            self.seen_generation = generation;
            self.statements.clear();
        }

        if tag == b'S' {
            self.skipping = false;
            self.bound = None;
            ready_for_query(out);
            return;
        }
        if self.skipping {
            return;
        }

        let mut cur = Cursor { data: body, pos: 0 };
        match tag {
            b'P' => {
                self.counters.parses.fetch_add(1, Ordering::SeqCst);
                let name = cur.cstr();
                let query = cur.cstr();
                let count = cur.i16();
                let param_types = (0..count).map(|_| cur.i32()).collect();
                if query.contains("syntax error") {
                    self.fail(out, "ERROR", "42601", "syntax error at or near \"syntax\"");
                    return;
                }
                self.statements.insert(name, Statement { query, param_types });
                frame(out, b'1', |_| {});
            }
            b'D' => {
                let _kind = cur.u8();
                let name = cur.cstr();
                let Some(stmt) = self.statements.get(&name) else {
                    return self.unknown_statement(out, &name);
                };
                let types = stmt.param_types.clone();
                frame(out, b't', |b| {
                    b.put_i16(types.len() as i16);
                    for t in &types {
                        b.put_i32(*t);
                    }
                });
                if is_select(&stmt.query) {
                    let type_oid = types.first().copied().filter(|t| *t != 0).unwrap_or(23);
                    row_description(out, type_oid);
                } else {
                    frame(out, b'n', |_| {});
                }
            }
            b'B' => {
                let _portal = cur.cstr();
                let name = cur.cstr();
                if !self.statements.contains_key(&name) {
                    return self.unknown_statement(out, &name);
                }
                let nformats = cur.i16();
                for _ in 0..nformats {
                    cur.i16();
                }
                let nvalues = cur.i16();
                let values = (0..nvalues)
                    .map(|_| {
                        let len = cur.i32();
                        (len >= 0).then(|| cur.bytes(len as usize).to_vec())
                    })
                    .collect();
                self.bound = Some((name, values));
                frame(out, b'2', |_| {});
            }
            b'E' => {
                self.counters.executes.fetch_add(1, Ordering::SeqCst);
                let Some((name, values)) = self.bound.clone() else {
                    self.fail(out, "ERROR", "34000", "portal \"\" does not exist");
                    return;
                };
                let select = self
                    .statements
                    .get(&name)
                    .is_some_and(|s| is_select(&s.query));
                if select {
                    let value = values
                        .first()
                        .cloned()
                        .unwrap_or_else(|| Some(1i32.to_be_bytes().to_vec()));
                    frame(out, b'D', |b| {
                        b.put_i16(1);
                        match &value {
                            Some(v) => {
                                b.put_i32(v.len() as i32);
                                b.put_slice(v);
                            }
                            None => b.put_i32(-1),
                        }
                    });
                    command_complete(out, "SELECT 1");
                } else {
                    self.counters
                        .executed
                        .lock()
                        .push(values.first().cloned().flatten());
                    command_complete(out, "INSERT 0 1");
                }
            }
            b'C' => {
                let _kind = cur.u8();
                let name = cur.cstr();
                self.statements.remove(&name);
                frame(out, b'3', |_| {});
            }
            other => {
                self.fail(
                    out,
                    "ERROR",
                    "08P01",
                    &format!("unsupported message '{}'", other as char),
                );
            }
        }
    }

    fn unknown_statement(&mut self, out: &mut BytesMut, name: &str) {
        self.fail(
            out,
            "ERROR",
            "26000",
            &format!("prepared statement \"{}\" does not exist", name),
        );
    }

    fn fail(&mut self, out: &mut BytesMut, severity: &str, code: &str, message: &str) {
        error_response(out, severity, code, message);
        self.skipping = true;
    }
}

fn is_select(query: &str) -> bool {
    query.trim_start().to_ascii_uppercase().starts_with("SELECT")
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> u8 {
        let v = self.data[self.pos];
        self.pos += 1;
        v
    }

    fn i16(&mut self) -> i16 {
        let v = i16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        v
    }

    fn i32(&mut self) -> i32 {
        let b = &self.data[self.pos..self.pos + 4];
        self.pos += 4;
        i32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let b = &self.data[self.pos..self.pos + n];
        self.pos += n;
        b
    }

    fn cstr(&mut self) -> String {
        let end = self.data[self.pos..].iter().position(|b| *b == 0).unwrap();
        let s = String::from_utf8_lossy(&self.data[self.pos..self.pos + end]).to_string();
        self.pos += end + 1;
        s
    }
}

fn read_i32(stream: &mut TcpStream) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn frame(out: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    out.put_u8(tag);
    let start = out.len();
    out.put_i32(0);
    body(out);
    let len = (out.len() - start) as i32;
    out[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn cstring(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn auth_code(out: &mut BytesMut, code: i32, payload: &[u8]) {
    frame(out, b'R', |b| {
        b.put_i32(code);
        b.put_slice(payload);
    });
}

fn parameter_status(out: &mut BytesMut, name: &str, value: &str) {
    frame(out, b'S', |b| {
        cstring(b, name);
        cstring(b, value);
    });
}

fn ready_for_query(out: &mut BytesMut) {
    frame(out, b'Z', |b| b.put_u8(b'I'));
}

fn command_complete(out: &mut BytesMut, tag: &str) {
    frame(out, b'C', |b| cstring(b, tag));
}

fn row_description(out: &mut BytesMut, type_oid: i32) {
    frame(out, b'T', |b| {
        b.put_i16(1);
        cstring(b, "n");
        b.put_i32(0);
        b.put_i16(0);
        b.put_i32(type_oid);
        b.put_i16(4);
        b.put_i32(-1);
        b.put_i16(0);
    });
}

fn error_response(out: &mut BytesMut, severity: &str, code: &str, message: &str) {
    frame(out, b'E', |b| {
        b.put_u8(b'S');
        cstring(b, severity);
        b.put_u8(b'V');
        cstring(b, severity);
        b.put_u8(b'C');
        cstring(b, code);
        b.put_u8(b'M');
        cstring(b, message);
        b.put_u8(0);
    });
}
