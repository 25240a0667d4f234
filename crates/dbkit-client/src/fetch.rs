//! Fetch buffering for open cursors.
//!
//! A [`FetchWindow`] holds the rows of one query that have arrived from the
//! server but have not been handed to the caller yet. Rows arrive either
//! piggybacked on the execute acknowledgment (prefetch) or through explicit
//! fetch calls of up to `array_size` rows. [`Cursor`] drives the window
//! against the session that executed the query.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_core::Stream;
use futures_util::stream;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::row::{Column, Row};
use crate::statement_cache::StatementHandle;
use crate::transport::{CursorId, RowBatch, WireSession};

/// Buffered state of one active query.
#[derive(Debug)]
pub struct FetchWindow {
    columns: Arc<[Column]>,
    cursor: Option<CursorId>,
    array_size: u32,
    prefetch_size: u32,
    buffer: VecDeque<Row>,
    exhausted: bool,
    closed: bool,
    round_trips: u32,
    rows_delivered: u64,
}

impl FetchWindow {
    /// Open an empty window.
    ///
    /// `prefetch_size == 0` means no rows are buffered until the first
    /// explicit fetch.
    #[must_use]
    pub fn open(array_size: u32, prefetch_size: u32, columns: Arc<[Column]>) -> Self {
        let capacity = array_size.max(prefetch_size) as usize;
        Self {
            columns,
            cursor: None,
            array_size: array_size.max(1),
            prefetch_size,
            buffer: VecDeque::with_capacity(capacity.min(1024)),
            exhausted: false,
            closed: false,
            round_trips: 0,
            rows_delivered: 0,
        }
    }

    /// Attach the server cursor and any rows delivered with the execute
    /// acknowledgment.
    pub fn attach(&mut self, cursor: Option<CursorId>, prefetched: RowBatch) {
        debug_assert!(prefetched.rows.len() <= self.prefetch_size as usize);
        self.cursor = cursor;
        if self.prefetch_size > 0 {
            self.accept(prefetched, self.prefetch_size);
        }
        if self.cursor.is_none() {
            self.exhausted = true;
        }
    }

    /// Append rows from an explicit fetch.
    pub fn push_batch(&mut self, batch: RowBatch) {
        debug_assert!(batch.rows.len() <= self.array_size as usize);
        self.accept(batch, self.array_size);
    }

    /// Buffer one batch. A batch shorter than `requested` ends the result
    /// even when the transport did not flag it.
    fn accept(&mut self, batch: RowBatch, requested: u32) {
        self.round_trips += 1;
        if batch.exhausted {
            self.exhausted = true;
            // the server releases an exhausted cursor
            self.cursor = None;
        } else if batch.rows.len() < requested as usize {
            // still open server-side; close() or drop releases it
            self.exhausted = true;
        }
        let columns = &self.columns;
        self.buffer.extend(
            batch
                .rows
                .into_iter()
                .map(|values| Row::new(Arc::clone(columns), values)),
        );
    }

    /// Pop the next buffered row.
    pub fn pop(&mut self) -> Option<Row> {
        let row = self.buffer.pop_front()?;
        self.rows_delivered += 1;
        Some(row)
    }

    /// Whether the buffer is empty and the server has more rows.
    #[must_use]
    pub fn needs_fetch(&self) -> bool {
        self.buffer.is_empty() && !self.exhausted && !self.closed
    }

    /// Discard buffered rows. Returns the server cursor if it is still open.
    pub fn close(&mut self) -> Option<CursorId> {
        self.closed = true;
        self.buffer.clear();
        self.cursor.take()
    }

    /// Open server cursor, if any.
    #[must_use]
    pub fn cursor(&self) -> Option<CursorId> {
        self.cursor
    }

    /// Rows requested per fetch.
    #[must_use]
    pub fn array_size(&self) -> u32 {
        self.array_size
    }

    /// Rows requested with the execute acknowledgment.
    #[must_use]
    pub fn prefetch_size(&self) -> u32 {
        self.prefetch_size
    }

    /// Rows currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Rows handed to the caller so far.
    #[must_use]
    pub fn rows_delivered(&self) -> u64 {
        self.rows_delivered
    }

    /// Batches received. With prefetch enabled the execute acknowledgment
    /// counts as the first batch.
    #[must_use]
    pub fn round_trips(&self) -> u32 {
        self.round_trips
    }

    /// Whether the server has no more rows.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Result column descriptors.
    #[must_use]
    pub fn columns(&self) -> &Arc<[Column]> {
        &self.columns
    }
}

/// An open query on a connection.
///
/// The cursor mutably borrows its connection, so a session runs one query
/// at a time and one window is never read concurrently.
pub struct Cursor<'c, S: WireSession> {
    conn: &'c mut Connection<S>,
    window: FetchWindow,
    handle: Option<StatementHandle>,
}

impl<'c, S: WireSession> Cursor<'c, S> {
    pub(crate) fn new(
        conn: &'c mut Connection<S>,
        window: FetchWindow,
        handle: StatementHandle,
    ) -> Self {
        let mut cursor = Self {
            conn,
            window,
            handle: Some(handle),
        };
        if cursor.window.is_exhausted() {
            cursor.release_statement();
        }
        cursor
    }

    /// Next row, or `None` once the result is exhausted.
    ///
    /// Calling `next` again after the end keeps returning `None`.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        if self.window.is_closed() {
            return Err(Error::CursorClosed);
        }

        loop {
            if let Some(row) = self.window.pop() {
                return Ok(Some(row));
            }
            if !self.window.needs_fetch() {
                self.release_statement();
                return Ok(None);
            }

            let Some(cursor) = self.window.cursor() else {
                self.release_statement();
                return Ok(None);
            };
            let batch = self.conn.fetch_batch(cursor, self.window.array_size()).await?;
            self.window.push_batch(batch);
        }
    }

    /// Discard buffered rows and release the server cursor.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.window.is_closed() {
            return Ok(());
        }
        let open = self.window.close();
        self.release_statement();
        if let Some(cursor) = open {
            self.conn.close_cursor(cursor).await?;
        }
        Ok(())
    }

    /// Read every remaining row.
    pub async fn fetch_all(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(self.window.buffered());
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Turn the cursor into a stream of rows.
    pub fn rows(self) -> impl Stream<Item = Result<Row>> + 'c {
        stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.next().await?.map(|row| (row, cursor)))
        })
    }

    /// Result column descriptors.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        self.window.columns()
    }

    /// The underlying fetch window.
    #[must_use]
    pub fn window(&self) -> &FetchWindow {
        &self.window
    }

    fn release_statement(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.conn.release_statement(handle);
        }
    }
}

impl<S: WireSession> Drop for Cursor<'_, S> {
    fn drop(&mut self) {
        if let Some(cursor) = self.window.close() {
            self.conn.defer_cursor_close(cursor);
        }
        self.release_statement();
    }
}

impl<S: WireSession> std::fmt::Debug for Cursor<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("session", &self.conn.id())
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
