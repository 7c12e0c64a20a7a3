//! Per-connection protocol state machine.
//!
//! A [`Connection`] is a [`Service`] owned by one event loop. It performs the
//! SSL negotiation, startup and authentication, then encodes submissions into
//! extended-query batches and matches the responses to them in send order.
//! Submissions arrive from other threads through the shared [`Inbox`].

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Interest;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::auth::{self, mechanism, ScramClient};
use crate::buffer::BufferArena;
use crate::config::{ConnectConfig, SslMode};
use crate::encoder::{encode_params, StatementKey};
use crate::error::{PgError, PgResult};
use crate::event_loop::{LoopContext, LoopEvent, Service};
use crate::protocol::{
    BackendMessage, BindMessage, CloseMessage, DescribeMessage, ExecuteMessage, FieldDescription,
    Format, FrameDecoder, FrontendMessage, ParseMessage, PasswordMessage,
    SaslInitialResponseMessage, SaslResponseMessage, SslRequest, StartupMessage, SyncMessage,
    Target, TerminateMessage, TransactionStatus,
};
use crate::statement::{PreparedStatement, SharedColumns, StatementCache};
use crate::submission::{
    rows_from_tag, CommandSummary, CompletionSequencer, Row, Submission, SubmissionState,
};
use crate::tls::{self, BufferSet};
use crate::transport::Transport;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
    Closed,
}

/// What the server told us during startup.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// ParameterStatus values (server_version, client_encoding, ...)
    pub parameters: HashMap<String, String>,
    pub process_id: i32,
    pub secret_key: i32,
    pub tls: bool,
    /// SASL mechanism used, if any
    pub mechanism: Option<String>,
}

impl ServerInfo {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

pub(crate) type ReadyWaiter = oneshot::Sender<PgResult<ServerInfo>>;

pub(crate) enum Readiness {
    Pending(Vec<ReadyWaiter>),
    Ready(ServerInfo),
    Failed(PgError),
}

/// Hand-off point between caller threads and the loop thread.
pub(crate) struct Inbox {
    pub next_seq: u64,
    pub queue: VecDeque<Submission>,
    pub close_requested: bool,
    /// Set once the connection is gone; later submissions fail immediately.
    pub closed: Option<PgError>,
    pub readiness: Readiness,
    pub state: ConnectionState,
}

impl Inbox {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            queue: VecDeque::new(),
            close_requested: false,
            closed: None,
            readiness: Readiness::Pending(Vec::new()),
            state: ConnectionState::Disconnected,
        }
    }
}

pub(crate) type SharedInbox = Arc<Mutex<Inbox>>;

/// Authentication sub-state.
enum AuthPhase {
    Started,
    /// SASLInitialResponse sent, waiting for the server-first message.
    SaslInitial(ScramClient),
    /// Client-final sent, waiting for the server signature.
    SaslFinal(ScramClient),
    Verified,
}

/// A submission whose messages were queued for the server.
struct InFlight {
    submission: Submission,
    statement: Arc<PreparedStatement>,
    key: StatementKey,
    /// This submission carried the statement's Parse.
    parsed_here: bool,
    parse_completed: bool,
    columns: Option<SharedColumns>,
    tag: String,
    rows_affected: u64,
    error: Option<PgError>,
}

pub struct Connection {
    config: ConnectConfig,
    state: ConnectionState,
    transport: Transport,
    connected: bool,
    awaiting_ssl: bool,
    decoder: FrameDecoder,
    outbound: BufferSet,
    scratch: BytesMut,
    cache: StatementCache,
    inbox: SharedInbox,
    pending: VecDeque<Submission>,
    in_flight: VecDeque<InFlight>,
    sequencer: CompletionSequencer,
    auth: AuthPhase,
    info: ServerInfo,
    transaction_status: TransactionStatus,
    arena: Arc<BufferArena>,
}

impl Connection {
    pub(crate) fn new(
        config: ConnectConfig,
        sock: TcpStream,
        inbox: SharedInbox,
        arena: Arc<BufferArena>,
    ) -> Self {
        Self {
            cache: StatementCache::new(config.statement_cache_capacity),
            config,
            state: ConnectionState::Disconnected,
            transport: Transport::Plain(sock),
            connected: false,
            awaiting_ssl: false,
            decoder: FrameDecoder::new(),
            outbound: BufferSet::new(),
            scratch: BytesMut::with_capacity(1024),
            inbox,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            sequencer: CompletionSequencer::new(0),
            auth: AuthPhase::Started,
            info: ServerInfo::default(),
            transaction_status: TransactionStatus::Idle,
            arena,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "connection state");
            self.state = state;
            self.inbox.lock().state = state;
        }
    }

    fn queue<M: FrontendMessage>(&mut self, msg: &M) {
        msg.encode_to(&mut self.scratch);
        self.outbound.push_bytes(self.scratch.split().freeze());
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    fn on_connected(&mut self) -> PgResult<()> {
        self.connected = true;
        if let Some(sock) = self.transport.socket() {
            sock.set_nodelay(true)?;
        }
        debug!(host = %self.config.host, port = self.config.port, "socket connected");

        if self.config.ssl_mode == SslMode::Disable {
            self.send_startup();
        } else {
            self.awaiting_ssl = true;
            self.queue(&SslRequest);
        }
        Ok(())
    }

    fn on_ssl_answer(&mut self, answer: u8) -> PgResult<()> {
        self.awaiting_ssl = false;
        match answer {
            b'S' => {
                if self.decoder.buffered() > 0 {
                    return Err(PgError::Protocol(
                        "server sent unencrypted data after accepting SSL".to_string(),
                    ));
                }
                let config = match &self.config.tls {
                    Some(config) => Arc::clone(config),
                    None => tls::default_client_config()?,
                };
                self.transport.upgrade(config, &self.config.host)?;
                self.info.tls = true;
            }
            b'N' if self.config.ssl_mode == SslMode::Require => {
                return Err(PgError::Tls(
                    "server does not support SSL but sslmode=require".to_string(),
                ));
            }
            b'N' => debug!("server declined SSL, continuing in plaintext"),
            other => {
                return Err(PgError::Protocol(format!(
                    "unexpected SSL response byte 0x{:02x}",
                    other
                )))
            }
        }
        self.send_startup();
        Ok(())
    }

    fn send_startup(&mut self) {
        let mut options: Vec<(String, String)> = Vec::new();
        if let Some(name) = &self.config.application_name {
            options.push(("application_name".to_string(), name.clone()));
        }
        options.extend(
            self.config
                .startup_options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let startup = StartupMessage {
            user: self.config.user.clone(),
            database: Some(self.config.database.clone()),
            options,
        };
        self.queue(&startup);
        self.set_state(ConnectionState::Authenticating);
    }

    fn password(&self) -> PgResult<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("password required".to_string()))
    }

    fn on_auth_message(&mut self, msg: BackendMessage) -> PgResult<()> {
        match msg {
            BackendMessage::AuthenticationOk => {
                if matches!(self.auth, AuthPhase::SaslInitial(_) | AuthPhase::SaslFinal(_)) {
                    return Err(PgError::Auth(
                        "server finished authentication before SCRAM verification".to_string(),
                    ));
                }
                self.auth = AuthPhase::Verified;
                debug!(user = %self.config.user, "authenticated");
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let password = self.password()?.to_string();
                self.queue(&PasswordMessage { password });
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                let password = auth::md5_password(&self.config.user, self.password()?, &salt);
                self.queue(&PasswordMessage { password });
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                let binding = self.transport.channel_binding();
                let (chosen, mode) = mechanism::select(
                    &mechanisms,
                    &self.config.sasl_mechanisms,
                    self.config.channel_binding,
                    binding.as_deref(),
                )?;
                debug!(mechanism = chosen.name, offered = ?mechanisms, "starting SASL");

                let scram = ScramClient::new(&self.config.user, self.password()?, mode);
                let first = scram.client_first_message();
                self.queue(&SaslInitialResponseMessage {
                    mechanism: chosen.name,
                    data: &first,
                });
                self.info.mechanism = Some(chosen.name.to_string());
                self.auth = AuthPhase::SaslInitial(scram);
            }
            BackendMessage::AuthenticationSASLContinue { data } => {
                let AuthPhase::SaslInitial(mut scram) =
                    std::mem::replace(&mut self.auth, AuthPhase::Started)
                else {
                    return Err(PgError::Auth("unexpected SASL continue".to_string()));
                };
                let client_final = scram.process_server_first(&data)?;
                self.queue(&SaslResponseMessage { data: &client_final });
                self.auth = AuthPhase::SaslFinal(scram);
            }
            BackendMessage::AuthenticationSASLFinal { data } => {
                let AuthPhase::SaslFinal(scram) =
                    std::mem::replace(&mut self.auth, AuthPhase::Started)
                else {
                    return Err(PgError::Auth("unexpected SASL final".to_string()));
                };
                scram.verify_server_final(&data)?;
                self.auth = AuthPhase::Verified;
            }
            BackendMessage::ErrorResponse { fields } => {
                let err = PgError::from_fields(&fields);
                return Err(PgError::Auth(err.to_string()));
            }
            BackendMessage::ReadyForQuery { status } => {
                if !matches!(self.auth, AuthPhase::Verified) {
                    return Err(PgError::Protocol(
                        "ReadyForQuery before authentication completed".to_string(),
                    ));
                }
                self.transaction_status = status;
                self.become_ready();
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "unexpected {} during authentication",
                    other.name()
                )))
            }
        }
        Ok(())
    }

    fn become_ready(&mut self) {
        self.set_state(ConnectionState::Ready);
        info!(
            host = %self.config.host,
            tls = self.info.tls,
            server_version = self.info.parameter("server_version").unwrap_or("unknown"),
            "connection ready"
        );

        let waiters = {
            let mut inbox = self.inbox.lock();
            match std::mem::replace(&mut inbox.readiness, Readiness::Ready(self.info.clone())) {
                Readiness::Pending(waiters) => waiters,
                _ => Vec::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(self.info.clone()));
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Read until the socket would block, processing frames as they complete.
    fn read_available(&mut self) -> PgResult<()> {
        let lease = self.arena.lease();
        loop {
            let transport = &mut self.transport;
            let decoder = &mut self.decoder;
            let read = lease.with(|buf| {
                let n = transport.read(buf)?;
                decoder.feed(&buf[..n]);
                Ok::<usize, io::Error>(n)
            })?;

            match read {
                Ok(0) => {
                    if self.state == ConnectionState::Closing {
                        self.set_state(ConnectionState::Closed);
                        return Ok(());
                    }
                    return Err(PgError::ConnectionClosed);
                }
                Ok(n) => {
                    trace!(bytes = n, "read");
                    self.process_frames()?;
                    if self.state == ConnectionState::Closed {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn process_frames(&mut self) -> PgResult<()> {
        loop {
            if self.awaiting_ssl {
                match self.decoder.take_raw(1) {
                    Some(answer) => {
                        self.on_ssl_answer(answer[0])?;
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            let Some(msg) = self.decoder.next_message()? else {
                return Ok(());
            };
            self.on_message(msg)?;
            if self.state == ConnectionState::Closed {
                return Ok(());
            }
        }
    }

    fn on_message(&mut self, msg: BackendMessage) -> PgResult<()> {
        match msg {
            BackendMessage::ParameterStatus { name, value } => {
                trace!(%name, %value, "parameter status");
                self.info.parameters.insert(name, value);
                return Ok(());
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.info.process_id = process_id;
                self.info.secret_key = secret_key;
                return Ok(());
            }
            BackendMessage::NoticeResponse { fields } => {
                let notice = PgError::from_fields(&fields);
                debug!(notice = %notice, "server notice");
                return Ok(());
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                debug!(process_id, %channel, %payload, "notification dropped");
                return Ok(());
            }
            _ => {}
        }

        match self.state {
            ConnectionState::Authenticating => self.on_auth_message(msg),
            ConnectionState::Ready | ConnectionState::Closing => self.on_query_message(msg),
            state => Err(PgError::Protocol(format!(
                "unexpected {} in state {:?}",
                msg.name(),
                state
            ))),
        }
    }

    fn head(&mut self, message: &str) -> PgResult<&mut InFlight> {
        self.in_flight.front_mut().ok_or_else(|| {
            PgError::Protocol(format!("{} with no submission in flight", message))
        })
    }

    fn on_query_message(&mut self, msg: BackendMessage) -> PgResult<()> {
        let name = msg.name();
        match msg {
            BackendMessage::ErrorResponse { fields } => {
                let err = PgError::from_fields(&fields);
                if let PgError::Server { severity, .. } = &err {
                    if severity == "FATAL" || severity == "PANIC" {
                        return Err(err);
                    }
                }
                let flight = self.head(name)?;
                debug!(error = %err, seq = flight.submission.seq, "submission error");
                if flight.error.is_none() {
                    flight.error = Some(err);
                }
            }
            BackendMessage::ParseComplete => {
                let flight = self.head(name)?;
                flight.parse_completed = true;
            }
            BackendMessage::RowDescription { fields } => {
                let flight = self.head(name)?;
                // Statement-level describe reports text formats; results are
                // always bound as binary.
                let columns: Vec<FieldDescription> = fields
                    .into_iter()
                    .map(|f| FieldDescription {
                        format: Format::Binary,
                        ..f
                    })
                    .collect();
                flight.statement.set_columns(columns);
                flight.columns = flight.statement.columns().cloned();
            }
            BackendMessage::NoData => {
                let flight = self.head(name)?;
                if flight.parsed_here {
                    flight.statement.set_columns(Vec::new());
                }
            }
            BackendMessage::DataRow { values } => {
                let flight = self.head(name)?;
                let columns = match &flight.columns {
                    Some(columns) => Arc::clone(columns),
                    None => {
                        let columns = flight
                            .statement
                            .columns()
                            .cloned()
                            .unwrap_or_else(|| Arc::new(Vec::new()));
                        flight.columns = Some(Arc::clone(&columns));
                        columns
                    }
                };
                flight.submission.deliver_row(Row::new(columns, values));
            }
            BackendMessage::CommandComplete { tag } => {
                let flight = self.head(name)?;
                flight.rows_affected += rows_from_tag(&tag);
                flight.tag = tag;
            }
            BackendMessage::EmptyQueryResponse
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::ParameterDescription { .. }
            | BackendMessage::PortalSuspended => {
                self.head(name)?;
            }
            BackendMessage::ReadyForQuery { status } => {
                self.transaction_status = status;
                let flight = self.in_flight.pop_front().ok_or_else(|| {
                    PgError::Protocol("ReadyForQuery with no submission in flight".to_string())
                })?;
                self.finish(flight);
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "unexpected {} while processing queries",
                    other.name()
                )))
            }
        }
        Ok(())
    }

    /// Resolve (or requeue) a submission whose Sync was answered.
    fn finish(&mut self, mut flight: InFlight) {
        let seq = flight.submission.seq;
        let Some(err) = flight.error.take() else {
            let summary = CommandSummary {
                tag: flight.tag,
                rows_affected: flight.rows_affected,
                columns: flight
                    .columns
                    .unwrap_or_else(|| Arc::new(Vec::new())),
            };
            let resolution = flight.submission.complete(summary);
            self.sequencer.resolve(seq, resolution);
            return;
        };

        if err.is_statement_not_found() {
            self.cache.invalidate(&flight.key, &flight.statement.name);
            let submission = &mut flight.submission;
            if submission.retries_left > 0 && !submission.is_cancelled() {
                submission.retries_left -= 1;
                submission.state = SubmissionState::Queued;
                debug!(
                    seq,
                    statement = %flight.statement.name,
                    "statement unknown to server, re-preparing"
                );
                // Several retries can come out of one read; keep them in
                // submission order ahead of newer work.
                let at = self.pending.partition_point(|queued| queued.seq < seq);
                self.pending.insert(at, flight.submission);
                return;
            }
            let err = PgError::StatementNotFound(flight.statement.name.clone());
            self.sequencer.resolve(seq, flight.submission.fail(err));
            return;
        }

        if flight.parsed_here && !flight.parse_completed {
            self.cache.invalidate(&flight.key, &flight.statement.name);
        }
        self.sequencer.resolve(seq, flight.submission.fail(err));
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Move new submissions from the inbox, drop cancelled ones, and encode
    /// the rest once the connection is ready.
    fn pump(&mut self) {
        let close_requested = {
            let mut inbox = self.inbox.lock();
            self.pending.extend(inbox.queue.drain(..));
            inbox.close_requested
        };

        if close_requested
            && !matches!(self.state, ConnectionState::Closing | ConnectionState::Closed)
        {
            self.begin_close();
            return;
        }

        let queued = std::mem::take(&mut self.pending);
        for submission in queued {
            if submission.is_cancelled() {
                trace!(seq = submission.seq, "dropping cancelled submission");
                let seq = submission.seq;
                self.sequencer.resolve(seq, submission.fail(PgError::Cancelled));
            } else {
                self.pending.push_back(submission);
            }
        }

        if self.state != ConnectionState::Ready {
            return;
        }

        while let Some(mut submission) = self.pending.pop_front() {
            match self.encode(&submission) {
                Ok((statement, key, parsed_here)) => {
                    submission.state = SubmissionState::Sent;
                    self.in_flight.push_back(InFlight {
                        submission,
                        statement,
                        key,
                        parsed_here,
                        parse_completed: false,
                        columns: None,
                        tag: String::new(),
                        rows_affected: 0,
                        error: None,
                    });
                }
                Err(err) => {
                    debug!(seq = submission.seq, error = %err, "submission rejected");
                    let seq = submission.seq;
                    self.sequencer.resolve(seq, submission.fail(err));
                }
            }
        }
    }

    /// Queue the extended-query messages for one submission.
    fn encode(
        &mut self,
        submission: &Submission,
    ) -> PgResult<(Arc<PreparedStatement>, StatementKey, bool)> {
        let params = encode_params(&submission.params)?;
        let lookup = self.cache.get_entry(&submission.query, &params.type_oids)?;
        let statement = lookup.statement;
        let buf = &mut self.scratch;

        if let Some(evicted) = &lookup.evicted {
            trace!(statement = %evicted, "closing evicted statement");
            CloseMessage {
                target: Target::Statement,
                name: evicted,
            }
            .encode_to(buf);
        }

        let parsed_here = statement.mark_prepared();
        if parsed_here {
            ParseMessage {
                name: &statement.name,
                query: &statement.query,
                param_types: &statement.param_types,
            }
            .encode_to(buf);
            DescribeMessage {
                target: Target::Statement,
                name: &statement.name,
            }
            .encode_to(buf);
        }

        for values in &params.rows {
            BindMessage {
                portal: "",
                statement: &statement.name,
                param_formats: &params.formats,
                values,
                result_formats: &[Format::Binary],
            }
            .encode_to(buf);
            ExecuteMessage {
                portal: "",
                max_rows: 0,
            }
            .encode_to(buf);
        }
        SyncMessage.encode_to(buf);

        trace!(
            seq = submission.seq,
            statement = %statement.name,
            repetitions = params.repetitions(),
            parse = parsed_here,
            "submission encoded"
        );
        self.outbound.push_bytes(buf.split().freeze());
        Ok((statement, lookup.key, parsed_here))
    }

    fn flush_outbound(&mut self) -> PgResult<()> {
        if !self.connected || self.state == ConnectionState::Closed {
            return Ok(());
        }
        if !self.outbound.is_empty() {
            let written = self.transport.write_from(&mut self.outbound)?;
            if written > 0 {
                trace!(bytes = written, "written");
            }
        }
        self.transport.flush()?;

        if self.outbound.is_empty() {
            for flight in self.in_flight.iter_mut() {
                if flight.submission.state == SubmissionState::Sent {
                    flight.submission.state = SubmissionState::AwaitingResponse;
                }
            }
            if self.state == ConnectionState::Closing && !self.transport.wants_write() {
                self.set_state(ConnectionState::Closed);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    fn begin_close(&mut self) {
        if self.state != ConnectionState::Ready {
            self.abort(PgError::ConnectionClosed);
            return;
        }
        debug!(host = %self.config.host, "closing connection");
        self.fail_all(PgError::ConnectionClosed);
        self.queue(&TerminateMessage);
        self.transport.begin_shutdown();
        self.set_state(ConnectionState::Closing);
    }

    /// Close immediately, failing everything outstanding with `cause`.
    fn abort(&mut self, cause: PgError) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closed);
        self.fail_all(cause);
        self.outbound.clear();
    }

    /// Fail in-flight, queued and inbox submissions in submission order.
    fn fail_all(&mut self, cause: PgError) {
        let (waiters, inboxed) = {
            let mut inbox = self.inbox.lock();
            inbox.closed = Some(cause.clone());
            let waiters = match &mut inbox.readiness {
                Readiness::Pending(waiters) => std::mem::take(waiters),
                _ => Vec::new(),
            };
            if matches!(inbox.readiness, Readiness::Pending(_)) {
                inbox.readiness = Readiness::Failed(cause.clone());
            }
            (waiters, std::mem::take(&mut inbox.queue))
        };

        for waiter in waiters {
            let _ = waiter.send(Err(cause.clone()));
        }

        let outstanding = self
            .in_flight
            .drain(..)
            .map(|f| f.submission)
            .chain(self.pending.drain(..))
            .chain(inboxed)
            .collect::<Vec<_>>();
        if !outstanding.is_empty() {
            debug!(count = outstanding.len(), cause = %cause, "failing outstanding submissions");
        }
        for submission in outstanding {
            let seq = submission.seq;
            self.sequencer.resolve(seq, submission.fail(cause.clone()));
        }
        self.sequencer.flush();
    }

    fn on_timer(&mut self) -> PgResult<()> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Authenticating
        ) {
            let ms = self.config.connect_timeout_ms.unwrap_or_default();
            return Err(PgError::Connect(format!(
                "timed out after {}ms connecting to {}:{}",
                ms, self.config.host, self.config.port
            )));
        }
        Ok(())
    }
}

impl Service for Connection {
    fn source(&mut self) -> Option<&mut TcpStream> {
        self.transport.socket_mut()
    }

    fn interest(&self) -> Interest {
        let wants_write = !self.connected
            || !self.outbound.is_empty()
            || self.transport.wants_write();
        if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    fn is_connecting(&self) -> bool {
        !self.connected && self.state != ConnectionState::Closed
    }

    fn dispatch(&mut self, event: LoopEvent, cx: &mut LoopContext<'_>) -> PgResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        if self.state == ConnectionState::Disconnected {
            self.set_state(ConnectionState::Connecting);
            if let Some(timeout) = self.config.connect_timeout() {
                cx.schedule(timeout);
            }
        }

        match event {
            LoopEvent::Connected => self.on_connected()?,
            LoopEvent::Readable => self.read_available()?,
            LoopEvent::Writable | LoopEvent::Notified => {}
            LoopEvent::Timer => self.on_timer()?,
            LoopEvent::Failed(err) => return Err(err),
        }

        if self.state != ConnectionState::Closed {
            self.pump();
            self.flush_outbound()?;
        }
        Ok(())
    }

    fn on_error(&mut self, err: PgError, _cx: &mut LoopContext<'_>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        warn!(host = %self.config.host, state = ?self.state, error = %err, "connection failed");
        self.abort(err);
    }

    fn is_finished(&self) -> bool {
        self.state == ConnectionState::Closed
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("state", &self.state)
            .field("transport", &self.transport)
            .field("in_flight", &self.in_flight.len())
            .field("pending", &self.pending.len())
            .field("cached_statements", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Param;
    use crate::submission::{CompletionHandle, RowCount};
    use crate::types::Oid;

    const INSERT: &str = "INSERT INTO t VALUES ($1)";

    /// A connection over a connected but idle socket, for driving the state
    /// machine by hand.
    fn idle_connection() -> (Connection, std::net::TcpListener) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let sock = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        sock.set_nonblocking(true).unwrap();
        let inbox = Arc::new(Mutex::new(Inbox::new()));
        let conn = Connection::new(
            ConnectConfig::new("127.0.0.1", 5432),
            TcpStream::from_std(sock),
            inbox,
            Arc::new(BufferArena::default()),
        );
        (conn, listener)
    }

    fn unknown_statement(name: &str) -> PgError {
        PgError::Server {
            severity: "ERROR".to_string(),
            code: "26000".to_string(),
            message: format!("prepared statement \"{}\" does not exist", name),
            detail: None,
            hint: None,
        }
    }

    fn failed_flights(
        conn: &mut Connection,
        seqs: std::ops::Range<u64>,
    ) -> (Vec<InFlight>, Vec<CompletionHandle<u64>>) {
        let lookup = conn.cache.get_entry(INSERT, &[Oid::INT4]).unwrap();
        let mut handles = Vec::new();
        let flights = seqs
            .map(|seq| {
                let (submission, handle) =
                    Submission::new(seq, INSERT, vec![Param::value(seq as i32)], RowCount, None);
                handles.push(handle);
                InFlight {
                    submission,
                    statement: Arc::clone(&lookup.statement),
                    key: lookup.key.clone(),
                    parsed_here: false,
                    parse_completed: false,
                    columns: None,
                    tag: String::new(),
                    rows_affected: 0,
                    error: Some(unknown_statement(&lookup.statement.name)),
                }
            })
            .collect();
        (flights, handles)
    }

    #[test]
    fn test_statement_retries_requeue_in_submission_order() {
        let (mut conn, _listener) = idle_connection();
        let (flights, mut handles) = failed_flights(&mut conn, 0..3);

        let (later, _later_handle) =
            Submission::new(3, INSERT, vec![Param::value(3i32)], RowCount, None);
        conn.pending.push_back(later);

        for flight in flights {
            conn.finish(flight);
        }

        let order: Vec<u64> = conn.pending.iter().map(|s| s.seq).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(conn.pending.iter().take(3).all(|s| s.retries_left == 0));
        assert!(conn.cache.is_empty());
        for handle in &mut handles {
            assert!(handle.try_take().is_none());
        }
    }

    #[test]
    fn test_statement_retry_exhausted_surfaces_not_found() {
        let (mut conn, _listener) = idle_connection();
        let (mut flights, mut handles) = failed_flights(&mut conn, 0..1);
        let mut flight = flights.remove(0);
        flight.submission.retries_left = 0;
        let name = flight.statement.name.clone();

        conn.finish(flight);

        assert!(conn.pending.is_empty());
        match handles[0].try_take() {
            Some(Err(PgError::StatementNotFound(missing))) => assert_eq!(missing, name),
            other => panic!("expected StatementNotFound, got {:?}", other.map(|r| r.is_ok())),
        }
    }
}
