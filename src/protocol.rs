//! PostgreSQL wire protocol message encoding and decoding.
//!
//! Frontend messages append themselves to an outbound `BytesMut`; backend
//! messages are cut out of the inbound stream by [`FrameDecoder`], which keeps
//! partial frames until the rest arrives.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{PgError, PgResult};
use crate::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// SSLRequest code: 1234 in the high 16 bits, 5679 in the low 16 bits.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Largest frame accepted from the server, length field included.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    /// Append the encoded message to `buf`.
    fn encode_to(&self, buf: &mut BytesMut);

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        buf
    }
}

/// Write a tagged frame, patching the length once the body is known.
fn framed(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// Same as [`framed`] for the untagged startup-phase messages.
fn untagged(buf: &mut BytesMut, body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        untagged(buf, |buf| {
            buf.put_i32(PROTOCOL_VERSION);

            put_cstring(buf, "user");
            put_cstring(buf, &self.user);

            if let Some(ref db) = self.database {
                put_cstring(buf, "database");
                put_cstring(buf, db);
            }

            for (key, value) in &self.options {
                put_cstring(buf, key);
                put_cstring(buf, value);
            }

            // Terminator
            buf.put_u8(0);
        });
    }
}

/// SSLRequest, answered by the server with a single `S` or `N` byte.
#[derive(Debug, Clone, Copy)]
pub struct SslRequest;

impl FrontendMessage for SslRequest {
    fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'p', |buf| put_cstring(buf, &self.password));
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'P', |buf| {
            put_cstring(buf, self.name);
            put_cstring(buf, self.query);
            buf.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                buf.put_i32(oid.as_i32());
            }
        });
    }
}

/// Bind message ('B') - Binds already encoded parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub param_formats: &'a [Format],
    pub values: &'a [Option<Bytes>],
    pub result_formats: &'a [Format],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'B', |buf| {
            put_cstring(buf, self.portal);
            put_cstring(buf, self.statement);

            buf.put_i16(self.param_formats.len() as i16);
            for fmt in self.param_formats {
                buf.put_i16(*fmt as i16);
            }

            buf.put_i16(self.values.len() as i16);
            for value in self.values {
                match value {
                    None => buf.put_i32(-1),
                    Some(data) => {
                        buf.put_i32(data.len() as i32);
                        buf.put_slice(data);
                    }
                }
            }

            buf.put_i16(self.result_formats.len() as i16);
            for fmt in self.result_formats {
                buf.put_i16(*fmt as i16);
            }
        });
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'E', |buf| {
            put_cstring(buf, self.portal);
            // 0 = no limit
            buf.put_i32(self.max_rows);
        });
    }
}

/// Statement or portal target for Describe and Close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'D', |buf| {
            buf.put_u8(self.target.code());
            put_cstring(buf, self.name);
        });
    }
}

/// Close message ('C') - Release a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'C', |buf| {
            buf.put_u8(self.target.code());
            put_cstring(buf, self.name);
        });
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'S', |_| {});
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'X', |_| {});
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage<'a> {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: &'a str,
    /// Initial client response data
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponseMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'p', |buf| {
            put_cstring(buf, self.mechanism);
            buf.put_i32(self.data.len() as i32);
            buf.put_slice(self.data);
        });
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponseMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, b'p', |buf| buf.put_slice(self.data));
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },
}

impl BackendMessage {
    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte. Truncated or
    /// malformed input is reported as a protocol error, never a panic.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        let body_len = usize::try_from(len)
            .ok()
            .and_then(|l| l.checked_sub(4))
            .ok_or_else(|| PgError::Protocol(format!("Invalid message length: {}", len)))?;

        if buf.remaining() < body_len {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        Self::decode_body(msg_type, buf.split_to(body_len))
    }

    /// Decode a message whose tag and length have already been stripped.
    pub fn decode_body(msg_type: u8, body: Bytes) -> PgResult<Self> {
        let mut body = Body(body);
        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: body.cstring()?,
            }),
            b'Z' => Ok(BackendMessage::ReadyForQuery {
                status: TransactionStatus::from(body.u8()?),
            }),
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => Ok(BackendMessage::ParameterStatus {
                name: body.cstring()?,
                value: body.cstring()?,
            }),
            b'K' => Ok(BackendMessage::BackendKeyData {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            }),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Ok(BackendMessage::NotificationResponse {
                process_id: body.i32()?,
                channel: body.cstring()?,
                payload: body.cstring()?,
            }),
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(mut body: Body) -> PgResult<Self> {
        let auth_type = body.i32()?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body.take(4)?);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.0.has_remaining() {
                    let mech = body.cstring()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body.0 }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body.0 }),
            _ => Err(PgError::Auth(format!(
                "Unsupported authentication method: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(mut body: Body) -> PgResult<Self> {
        let num_fields = body.count()?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = body.cstring()?;
            let table_oid = body.i32()?;
            let column_attr = body.i16()?;
            let type_oid = Oid::from_i32(body.i32()?);
            let type_size = body.i16()?;
            let type_modifier = body.i32()?;
            let format = if body.i16()? == 0 {
                Format::Text
            } else {
                Format::Binary
            };

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Body) -> PgResult<Self> {
        let num_cols = body.count()?;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = body.i32()?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.take(len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(mut body: Body) -> PgResult<Self> {
        let num_params = body.count()?;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(body.i32()?));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::AuthenticationCleartextPassword => "AuthenticationCleartextPassword",
            BackendMessage::AuthenticationMD5Password { .. } => "AuthenticationMD5Password",
            BackendMessage::AuthenticationSASL { .. } => "AuthenticationSASL",
            BackendMessage::AuthenticationSASLContinue { .. } => "AuthenticationSASLContinue",
            BackendMessage::AuthenticationSASLFinal { .. } => "AuthenticationSASLFinal",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
            BackendMessage::NoticeResponse { .. } => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
        }
    }
}

// ============================================================================
// Frame Decoder
// ============================================================================

/// Restartable decoder for the inbound byte stream.
///
/// Bytes are appended with [`feed`](Self::feed) as they come off the socket;
/// [`next_message`](Self::next_message) yields complete frames and returns
/// `Ok(None)` while a frame is still partial.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the largest accepted frame.
    pub fn with_max_frame_len(max: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len: Some(max),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed as complete frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take raw bytes off the front of the stream (the SSL answer byte).
    pub fn take_raw(&mut self, n: usize) -> Option<Bytes> {
        (self.buf.len() >= n).then(|| self.buf.split_to(n).freeze())
    }

    pub fn next_message(&mut self) -> PgResult<Option<BackendMessage>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }

        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        let max = self.max_frame_len.unwrap_or(MAX_FRAME_LEN);
        let len = match usize::try_from(len) {
            Ok(l) if (4..=max).contains(&l) => l,
            _ => {
                return Err(PgError::Protocol(format!(
                    "Invalid frame length {} for message '{}'",
                    len, self.buf[0] as char
                )))
            }
        };

        if self.buf.len() < len + 1 {
            self.buf.reserve(len + 1 - self.buf.len());
            return Ok(None);
        }

        let mut frame = self.buf.split_to(len + 1).freeze();
        let tag = frame.get_u8();
        frame.advance(4);
        BackendMessage::decode_body(tag, frame).map(Some)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Bounds-checked cursor over a message body.
struct Body(Bytes);

impl Body {
    fn need(&self, n: usize) -> PgResult<()> {
        if self.0.remaining() < n {
            return Err(PgError::Protocol("Truncated message body".to_string()));
        }
        Ok(())
    }

    fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.0.get_i16())
    }

    fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.0.get_i32())
    }

    fn count(&mut self) -> PgResult<usize> {
        let n = self.i16()?;
        usize::try_from(n).map_err(|_| PgError::Protocol(format!("Negative count: {}", n)))
    }

    fn take(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n)?;
        Ok(self.0.split_to(n))
    }

    fn cstring(&mut self) -> PgResult<String> {
        read_cstring(&mut self.0)
    }
}

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Body) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.0.has_remaining() {
        let field_type = body.u8()?;
        if field_type == 0 {
            break;
        }
        let value = body.cstring()?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}
