//! Units of work submitted to a connection and the handles that await them.
//!
//! A [`Submission`] carries query text, parameters and a type-erased result
//! sink. The caller keeps a [`CompletionHandle`] that resolves exactly once.
//! Per connection, resolutions are released in submission order by the
//! [`CompletionSequencer`], even when a retried submission finishes after
//! later ones.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::encoder::Param;
use crate::error::{PgError, PgResult};
use crate::event_loop::LoopHandle;
use crate::protocol::Format;
use crate::statement::SharedColumns;
use crate::types::PgValue;

// ============================================================================
// Rows and results
// ============================================================================

/// One result row as received, decoded on demand.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: Vec<Option<Bytes>>,
}

impl Row {
    pub fn new(columns: SharedColumns, values: Vec<Option<Bytes>>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    /// Raw wire bytes of column `index`, `None` for NULL.
    pub fn raw(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    /// Decode column `index`.
    pub fn get(&self, index: usize) -> PgResult<PgValue> {
        let value = self.values.get(index).ok_or_else(|| {
            PgError::InvalidArgument(format!(
                "column index {} out of range ({} columns)",
                index,
                self.values.len()
            ))
        })?;
        let Some(data) = value else {
            return Ok(PgValue::Null);
        };
        match self.columns.get(index) {
            Some(col) if col.format == Format::Binary => PgValue::decode_binary(col.type_oid, data),
            Some(col) => PgValue::decode_text(col.type_oid, data),
            None => Ok(PgValue::Raw {
                oid: crate::types::Oid::UNSPECIFIED,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode the column called `name`.
    pub fn get_by_name(&self, name: &str) -> PgResult<PgValue> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| PgError::InvalidArgument(format!("no column named {}", name)))?;
        self.get(index)
    }

    /// Decode every column.
    pub fn decode(&self) -> PgResult<Vec<PgValue>> {
        (0..self.values.len()).map(|i| self.get(i)).collect()
    }
}

/// Outcome of a finished submission, handed to the consumer.
#[derive(Debug, Clone)]
pub struct CommandSummary {
    /// Tag of the last CommandComplete (e.g. "INSERT 0 1")
    pub tag: String,
    /// Rows affected, summed over every repetition.
    pub rows_affected: u64,
    pub columns: SharedColumns,
}

/// Rows reported by a command tag such as `UPDATE 3` or `INSERT 0 1`.
pub fn rows_from_tag(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Receives the rows of one submission on the loop thread.
pub trait ResultConsumer: Send + 'static {
    type Output: Send + 'static;

    fn on_row(&mut self, row: Row) -> PgResult<()>;

    fn on_complete(&mut self, summary: &CommandSummary) -> PgResult<Self::Output>;
}

/// Result of a query execution.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: SharedColumns,
    /// Decoded row data
    pub rows: Vec<Vec<PgValue>>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
    pub rows_affected: u64,
}

/// Collects every row into a [`QueryResult`].
#[derive(Debug, Default)]
pub struct RowCollector {
    rows: Vec<Vec<PgValue>>,
}

impl ResultConsumer for RowCollector {
    type Output = QueryResult;

    fn on_row(&mut self, row: Row) -> PgResult<()> {
        self.rows.push(row.decode()?);
        Ok(())
    }

    fn on_complete(&mut self, summary: &CommandSummary) -> PgResult<QueryResult> {
        Ok(QueryResult {
            columns: Arc::clone(&summary.columns),
            rows: std::mem::take(&mut self.rows),
            command_tag: summary.tag.clone(),
            rows_affected: summary.rows_affected,
        })
    }
}

/// Ignores rows and reports the affected row count.
#[derive(Debug, Default)]
pub struct RowCount;

impl ResultConsumer for RowCount {
    type Output = u64;

    fn on_row(&mut self, _row: Row) -> PgResult<()> {
        Ok(())
    }

    fn on_complete(&mut self, summary: &CommandSummary) -> PgResult<u64> {
        Ok(summary.rows_affected)
    }
}

// ============================================================================
// Submission
// ============================================================================

/// Deferred delivery of a result to its completion handle.
pub type Resolution = Box<dyn FnOnce() + Send>;

/// Type-erased consumer plus the sender of its completion handle.
pub(crate) trait ResponseSink: Send {
    fn row(&mut self, row: Row) -> PgResult<()>;
    fn complete(self: Box<Self>, summary: CommandSummary) -> Resolution;
    fn fail(self: Box<Self>, err: PgError) -> Resolution;
}

struct Sink<C: ResultConsumer> {
    consumer: C,
    tx: oneshot::Sender<PgResult<C::Output>>,
}

impl<C: ResultConsumer> ResponseSink for Sink<C> {
    fn row(&mut self, row: Row) -> PgResult<()> {
        self.consumer.on_row(row)
    }

    fn complete(mut self: Box<Self>, summary: CommandSummary) -> Resolution {
        let result = self.consumer.on_complete(&summary);
        let tx = self.tx;
        Box::new(move || {
            let _ = tx.send(result);
        })
    }

    fn fail(self: Box<Self>, err: PgError) -> Resolution {
        let tx = self.tx;
        Box::new(move || {
            let _ = tx.send(Err(err));
        })
    }
}

/// Lifecycle of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Queued,
    Sent,
    AwaitingResponse,
    Completed,
    Failed,
}

/// One query (or batched execution) waiting for a connection.
pub struct Submission {
    pub seq: u64,
    pub query: String,
    pub params: Vec<Param>,
    pub state: SubmissionState,
    /// Transparent re-sends left after the server forgot a statement.
    pub retries_left: u8,
    /// Set once a row error occurred; later rows are skipped.
    pub(crate) consumer_error: Option<PgError>,
    sink: Box<dyn ResponseSink>,
    cancelled: Arc<AtomicBool>,
}

impl Submission {
    /// Create a submission and the handle that awaits it.
    pub fn new<C: ResultConsumer>(
        seq: u64,
        query: impl Into<String>,
        params: Vec<Param>,
        consumer: C,
        waker: Option<LoopHandle>,
    ) -> (Self, CompletionHandle<C::Output>) {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let submission = Self {
            seq,
            query: query.into(),
            params,
            state: SubmissionState::Queued,
            retries_left: 1,
            consumer_error: None,
            sink: Box::new(Sink { consumer, tx }),
            cancelled: Arc::clone(&cancelled),
        };
        let handle = CompletionHandle {
            rx,
            cancelled,
            waker,
        };
        (submission, handle)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Pass a row to the consumer unless the submission was cancelled or the
    /// consumer already failed.
    pub(crate) fn deliver_row(&mut self, row: Row) {
        if self.is_cancelled() || self.consumer_error.is_some() {
            return;
        }
        if let Err(e) = self.sink.row(row) {
            self.consumer_error = Some(e);
        }
    }

    pub(crate) fn complete(mut self, summary: CommandSummary) -> Resolution {
        if self.is_cancelled() {
            return self.fail(PgError::Cancelled);
        }
        if let Some(err) = self.consumer_error.take() {
            return self.fail(err);
        }
        self.state = SubmissionState::Completed;
        self.sink.complete(summary)
    }

    pub(crate) fn fail(mut self, err: PgError) -> Resolution {
        self.state = SubmissionState::Failed;
        self.sink.fail(err)
    }
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("seq", &self.seq)
            .field("query", &self.query)
            .field("params", &self.params.len())
            .field("state", &self.state)
            .field("retries_left", &self.retries_left)
            .finish()
    }
}

// ============================================================================
// Completion handle
// ============================================================================

/// Awaitable result of a submission.
///
/// Await it from async code or call [`wait`](Self::wait) from a plain thread.
pub struct CompletionHandle<T> {
    rx: oneshot::Receiver<PgResult<T>>,
    cancelled: Arc<AtomicBool>,
    waker: Option<LoopHandle>,
}

impl<T> CompletionHandle<T> {
    /// Handle resolved by a raw sender rather than a submission.
    pub(crate) fn detached(rx: oneshot::Receiver<PgResult<T>>) -> Self {
        Self {
            rx,
            cancelled: Arc::new(AtomicBool::new(false)),
            waker: None,
        }
    }

    /// Request cancellation. Unsent work is dropped; sent work finishes on
    /// the server and its rows are discarded. Either way the handle resolves
    /// with [`PgError::Cancelled`].
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(waker) = &self.waker {
                waker.request_write();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Block the current thread until the result arrives.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> PgResult<T> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(PgError::ConnectionClosed))
    }

    /// Take the result if it already arrived.
    pub fn try_take(&mut self) -> Option<PgResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PgError::ConnectionClosed)),
        }
    }
}

impl<T> Future for CompletionHandle<T> {
    type Output = PgResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(PgError::ConnectionClosed)))
    }
}

// ============================================================================
// Completion ordering
// ============================================================================

/// Releases resolutions strictly in sequence order.
#[derive(Default)]
pub struct CompletionSequencer {
    next: u64,
    held: BTreeMap<u64, Resolution>,
}

impl CompletionSequencer {
    pub fn new(first: u64) -> Self {
        Self {
            next: first,
            held: BTreeMap::new(),
        }
    }

    /// Record the resolution for `seq` and run every resolution that is now
    /// in order.
    pub fn resolve(&mut self, seq: u64, resolution: Resolution) {
        if seq < self.next {
            // Already past this point; deliver immediately
            resolution();
            return;
        }
        self.held.insert(seq, resolution);
        while let Some(ready) = self.held.remove(&self.next) {
            ready();
            self.next += 1;
        }
    }

    /// Resolutions waiting on an earlier sequence number.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Deliver everything still held, in order.
    pub fn flush(&mut self) {
        for (_, resolution) in std::mem::take(&mut self.held) {
            resolution();
        }
    }
}
