//! Public entry point: one connection driven by an event loop.
//!
//! A [`Session`] never touches the socket itself. Every call builds a
//! [`Submission`], pushes it into the connection's inbox and wakes the loop;
//! the caller gets a [`CompletionHandle`] to block on or await.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use mio::net::TcpStream;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::buffer::BufferArena;
use crate::config::ConnectConfig;
use crate::connection::{Connection, ConnectionState, Inbox, Readiness, ServerInfo, SharedInbox};
use crate::encoder::Param;
use crate::error::{PgError, PgResult};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::submission::{
    CompletionHandle, QueryResult, ResultConsumer, RowCollector, RowCount, Submission,
};
use crate::types::PgValue;

/// Handle to one PostgreSQL connection.
///
/// Dropping the session closes the connection; submissions still
/// outstanding resolve with [`PgError::ConnectionClosed`].
pub struct Session {
    inbox: SharedInbox,
    handle: LoopHandle,
    event_loop: EventLoop,
    config: Arc<ConnectConfig>,
}

impl Session {
    /// Connect to `url` on a shared loop.
    pub fn connect(url: &str, event_loop: &EventLoop) -> PgResult<Self> {
        Self::open(ConnectConfig::from_url(url)?, event_loop)
    }

    /// Open a connection with its own buffer arena.
    pub fn open(config: ConnectConfig, event_loop: &EventLoop) -> PgResult<Self> {
        Self::open_with_arena(config, event_loop, Arc::new(BufferArena::default()))
    }

    /// Open a connection that reads through a shared buffer arena.
    pub fn open_with_arena(
        config: ConnectConfig,
        event_loop: &EventLoop,
        arena: Arc<BufferArena>,
    ) -> PgResult<Self> {
        config.validate()?;
        let addr = resolve(&config.host, config.port)?;
        let sock = TcpStream::connect(addr)
            .map_err(|e| PgError::Connect(format!("{}: {}", addr, e)))?;

        let inbox: SharedInbox = Arc::new(Mutex::new(Inbox::new()));
        let config = Arc::new(config);
        let handle = {
            let inbox = Arc::clone(&inbox);
            let config = ConnectConfig::clone(&config);
            event_loop.register(sock, move |sock| Connection::new(config, sock, inbox, arena))?
        };

        info!(
            host = %config.host,
            port = config.port,
            loop_name = event_loop.name(),
            "session opened"
        );

        Ok(Self {
            inbox,
            handle,
            event_loop: event_loop.clone(),
            config,
        })
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn state(&self) -> ConnectionState {
        self.inbox.lock().state
    }

    /// Resolves once startup and authentication finished.
    pub fn ready(&self) -> CompletionHandle<ServerInfo> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inbox = self.inbox.lock();
            match &mut inbox.readiness {
                Readiness::Pending(waiters) => waiters.push(tx),
                Readiness::Ready(info) => {
                    let _ = tx.send(Ok(info.clone()));
                }
                Readiness::Failed(err) => {
                    let _ = tx.send(Err(err.clone()));
                }
            }
        }
        CompletionHandle::detached(rx)
    }

    /// Submit a query whose rows go to `consumer`.
    pub fn submit<C: ResultConsumer>(
        &self,
        query: &str,
        params: Vec<Param>,
        consumer: C,
    ) -> CompletionHandle<C::Output> {
        let mut inbox = self.inbox.lock();
        let seq = inbox.next_seq;
        inbox.next_seq += 1;

        let (submission, handle) =
            Submission::new(seq, query, params, consumer, Some(self.handle.clone()));

        if let Some(cause) = inbox.closed.clone() {
            drop(inbox);
            (submission.fail(cause))();
            return handle;
        }

        inbox.queue.push_back(submission);
        drop(inbox);

        self.handle.request_write();
        handle
    }

    /// Run a query and collect every row.
    pub fn query(&self, query: &str, params: &[PgValue]) -> CompletionHandle<QueryResult> {
        self.submit(query, to_params(params), RowCollector::default())
    }

    /// Run a statement and report the rows it affected.
    pub fn execute(&self, query: &str, params: &[PgValue]) -> CompletionHandle<u64> {
        self.submit(query, to_params(params), RowCount)
    }

    /// Execute one statement per parameter row, in a single round trip.
    ///
    /// Every row must have the same number of values. Resolves with the total
    /// rows affected.
    pub fn execute_batch(&self, query: &str, rows: &[Vec<PgValue>]) -> CompletionHandle<u64> {
        match batch_params(rows) {
            Ok(params) => self.submit(query, params, RowCount),
            Err(err) => failed(err),
        }
    }

    /// Close the connection. Outstanding submissions fail.
    pub fn close(&self) {
        let mut inbox = self.inbox.lock();
        if inbox.close_requested {
            return;
        }
        inbox.close_requested = true;
        drop(inbox);
        debug!(host = %self.config.host, "session close requested");
        self.handle.request_write();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state())
            .field("loop", &self.event_loop.name())
            .finish()
    }
}

fn resolve(host: &str, port: u16) -> PgResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| PgError::Connect(format!("failed to resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| PgError::Connect(format!("no addresses for {}:{}", host, port)))
}

fn to_params(values: &[PgValue]) -> Vec<Param> {
    values.iter().cloned().map(Param::Value).collect()
}

/// Turn parameter rows into one repeated parameter per column.
fn batch_params(rows: &[Vec<PgValue>]) -> PgResult<Vec<Param>> {
    let Some(first) = rows.first() else {
        return Err(PgError::Validation("batch has no parameter rows".to_string()));
    };
    let width = first.len();
    if let Some((index, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(PgError::Validation(format!(
            "batch row {} has {} values, expected {}",
            index,
            row.len(),
            width
        )));
    }
    if width == 0 {
        return Err(PgError::Validation(
            "batch rows must carry at least one parameter".to_string(),
        ));
    }

    Ok((0..width)
        .map(|col| Param::Repeated(rows.iter().map(|row| row[col].clone()).collect()))
        .collect())
}

fn failed<T>(err: PgError) -> CompletionHandle<T> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(Err(err));
    CompletionHandle::detached(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_params_transposes_rows() {
        let rows = vec![
            vec![PgValue::Int4(1), PgValue::Text("a".into())],
            vec![PgValue::Int4(2), PgValue::Text("b".into())],
        ];
        let params = batch_params(&rows).unwrap();
        assert_eq!(
            params,
            vec![
                Param::Repeated(vec![PgValue::Int4(1), PgValue::Int4(2)]),
                Param::Repeated(vec![PgValue::Text("a".into()), PgValue::Text("b".into())]),
            ]
        );
    }

    #[test]
    fn test_batch_params_rejects_ragged_rows() {
        let rows = vec![vec![PgValue::Int4(1)], vec![]];
        assert!(matches!(batch_params(&rows), Err(PgError::Validation(_))));
        assert!(matches!(batch_params(&[]), Err(PgError::Validation(_))));
    }

    #[test]
    fn test_resolve_rejects_unknown_host() {
        assert!(matches!(
            resolve("host.invalid", 5432),
            Err(PgError::Connect(_))
        ));
        assert!(resolve("127.0.0.1", 5432).is_ok());
    }

    #[test]
    fn test_failed_handle_resolves_immediately() {
        let mut handle: CompletionHandle<u64> = failed(PgError::Cancelled);
        assert!(matches!(handle.try_take(), Some(Err(PgError::Cancelled))));
    }
}
