//! Range queries over stores
//!
//! Every store answers [`Querier::query`] by pushing decoded entries into a
//! caller supplied sink. The sink may stop the query early by returning an
//! error, which the store propagates unchanged.
//!
//! Two helpers sit on top:
//! - [`for_all_query`] runs a query synchronously and honours a
//!   [`CancellationToken`] between entries.
//! - [`QueryStream`] runs a query on the blocking pool and hands entries to
//!   an async consumer through a bounded channel. Errors travel in the same
//!   channel as the entries, so a consumer draining the stream always sees
//!   the terminal error and the producer never waits on a second channel.

use crate::{AionError, Entry, Result, SeriesId, TimeRange};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Read side of a store
pub trait Querier: Send + Sync {
    /// Push every entry of `series` within `range` into `sink`. An empty
    /// `attributes` list selects all attributes.
    fn query(
        &self,
        series: SeriesId,
        range: TimeRange,
        attributes: &[String],
        sink: &mut dyn FnMut(Entry) -> Result<()>,
    ) -> Result<()>;
}

/// A tier's storage: queryable and insertable
pub trait Store: Querier {
    /// Persist one entry of `series`
    fn insert(&self, series: SeriesId, entry: &Entry) -> Result<()>;

    /// Make everything held for `series` durable. Stores without a durable
    /// tier have nothing to do.
    fn persist(&self, _series: SeriesId) -> Result<()> {
        Ok(())
    }

    /// [`Store::persist`] for every series
    fn persist_all(&self) -> Result<()> {
        Ok(())
    }
}

/// Run a query, calling `handler` per entry until the query ends or `token`
/// is cancelled. Cancellation surfaces as [`AionError::Cancelled`].
pub fn for_all_query<F>(
    querier: &dyn Querier,
    series: SeriesId,
    range: TimeRange,
    attributes: &[String],
    token: &CancellationToken,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(Entry) -> Result<()>,
{
    if token.is_cancelled() {
        return Err(AionError::Cancelled);
    }
    querier.query(series, range, attributes, &mut |entry| {
        if token.is_cancelled() {
            return Err(AionError::Cancelled);
        }
        handler(entry)
    })
}

/// Collect a whole query into memory
pub fn collect_query(
    querier: &dyn Querier,
    series: SeriesId,
    range: TimeRange,
    attributes: &[String],
) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    querier.query(series, range, attributes, &mut |entry| {
        entries.push(entry);
        Ok(())
    })?;
    Ok(entries)
}

/// Async pull stream over a query running on the blocking pool.
///
/// Dropping the stream cancels the producer.
pub struct QueryStream {
    rx: mpsc::Receiver<Result<Entry>>,
    token: CancellationToken,
    producer: Option<JoinHandle<()>>,
}

impl QueryStream {
    /// Start `query` on the blocking pool; must be called within a tokio runtime
    pub fn spawn(
        querier: Arc<dyn Querier>,
        series: SeriesId,
        range: TimeRange,
        attributes: Vec<String>,
        capacity: usize,
    ) -> Self {
        Self::spawn_with_token(querier, series, range, attributes, capacity, CancellationToken::new())
    }

    /// Like [`QueryStream::spawn`], cancelled together with `token`
    pub fn spawn_with_token(
        querier: Arc<dyn Querier>,
        series: SeriesId,
        range: TimeRange,
        attributes: Vec<String>,
        capacity: usize,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let producer_token = token.clone();

        let producer = tokio::task::spawn_blocking(move || {
            let result = querier.query(series, range, &attributes, &mut |entry| {
                if producer_token.is_cancelled() {
                    return Err(AionError::Cancelled);
                }
                // A closed channel means the consumer is gone
                tx.blocking_send(Ok(entry)).map_err(|_| AionError::Cancelled)
            });
            match result {
                Ok(()) => {}
                Err(AionError::Cancelled) => debug!("Query for series {} cancelled", series),
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        Self {
            rx,
            token,
            producer: Some(producer),
        }
    }

    /// Next entry, the terminal error, or `None` once the query is finished
    /// or cancelled
    pub async fn next(&mut self) -> Option<Result<Entry>> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Stop the producer; buffered entries are discarded
    pub fn cancel(&mut self) {
        self.token.cancel();
        self.rx.close();
    }

    /// Token cancelling this stream
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Drain the stream into a vector, stopping at the first error
    pub async fn collect(mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while let Some(item) = self.next().await {
            entries.push(item?);
        }
        if self.token.is_cancelled() {
            return Err(AionError::Cancelled);
        }
        Ok(entries)
    }

    /// Wait for the producer task to exit
    pub async fn join(mut self) -> Result<()> {
        self.cancel();
        if let Some(producer) = self.producer.take() {
            producer
                .await
                .map_err(|e| AionError::Internal(format!("query producer failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
