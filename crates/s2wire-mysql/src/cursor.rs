//! Fetch-style access to query results.
//!
//! A buffered cursor reads each result set in full on `execute` and hands
//! rows out from memory. An unbuffered cursor leaves the rows on the wire
//! and reads them as they are fetched; its row count is unknown until the
//! last row has been read.

use std::collections::VecDeque;

use s2wire_core::{ErrorCategory, Result, Row};

use crate::connection::{MySqlConnection, Pending};
use crate::convert::RowDecoder;
use crate::errors::query_error_in;
use crate::result::RowPacket;
use crate::types::ColumnDescription;

enum Current {
    /// No result set (statement without rows, or nothing executed)
    Empty,
    Buffered(VecDeque<Row>),
    Streaming { decoder: RowDecoder, done: bool },
}

/// Cursor over the results of one connection.
pub struct Cursor<'c> {
    conn: &'c mut MySqlConnection,
    unbuffered: bool,
    current: Current,
    row_count: Option<u64>,
    last_row_id: Option<u64>,
    description: Vec<ColumnDescription>,
    row_number: u64,
    closed: bool,
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("unbuffered", &self.unbuffered)
            .field("row_count", &self.row_count)
            .field("row_number", &self.row_number)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<'c> Cursor<'c> {
    pub(crate) fn new(conn: &'c mut MySqlConnection, unbuffered: bool) -> Self {
        Self {
            conn,
            unbuffered,
            current: Current::Empty,
            row_count: None,
            last_row_id: None,
            description: Vec::new(),
            row_number: 0,
            closed: false,
        }
    }

    /// Run one statement. Returns the affected (or, when buffered, fetched)
    /// row count if it is known.
    pub fn execute(&mut self, sql: &str) -> Result<Option<u64>> {
        self.ensure_open()?;
        self.discard_current()?;
        let pending = self.conn.start_query(sql, None)?;
        self.load(pending)?;
        Ok(self.row_count)
    }

    /// Run each statement in turn, summing the affected row counts.
    pub fn execute_many<I, S>(&mut self, statements: I) -> Result<Option<u64>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut total: Option<u64> = None;
        for sql in statements {
            if let Some(n) = self.execute(sql.as_ref())? {
                total = Some(total.unwrap_or(0) + n);
            }
        }
        self.row_count = total;
        Ok(total)
    }

    /// Next row of the current result set.
    pub fn fetch_one(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        let row = match &mut self.current {
            Current::Empty => None,
            Current::Buffered(rows) => rows.pop_front(),
            Current::Streaming { decoder, done } => {
                if *done {
                    None
                } else {
                    match self.conn.stream_next_packet() {
                        Ok(RowPacket::Row(payload)) => {
                            self.row_number += 1;
                            return decoder.decode_row(&payload).map(Some);
                        }
                        Ok(RowPacket::End(_)) => {
                            *done = true;
                            self.row_count = Some(self.row_number);
                            None
                        }
                        Err(e) => {
                            *done = true;
                            return Err(e);
                        }
                    }
                }
            }
        };
        if row.is_some() {
            self.row_number += 1;
        }
        Ok(row)
    }

    /// Up to `size` rows.
    pub fn fetch_many(&mut self, size: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(size.min(1024));
        while rows.len() < size {
            match self.fetch_one()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    /// Every remaining row of the current result set.
    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetch_one()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Move to the next result set of a multi-statement command.
    ///
    /// Unread rows of the current set are discarded. Returns `false` when
    /// there are no more result sets.
    pub fn next_set(&mut self) -> Result<bool> {
        self.ensure_open()?;
        self.discard_current()?;
        match self.conn.start_next_result()? {
            Some(pending) => {
                self.load(pending)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rows affected or fetched by the last statement, if known.
    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    /// Auto-increment id generated by the last statement.
    pub fn last_row_id(&self) -> Option<u64> {
        self.last_row_id
    }

    /// Rows fetched so far from the current result set.
    pub fn row_number(&self) -> u64 {
        self.row_number
    }

    /// Column descriptions of the current result set; empty for
    /// statements without rows.
    pub fn description(&self) -> &[ColumnDescription] {
        &self.description
    }

    pub fn is_unbuffered(&self) -> bool {
        self.unbuffered
    }

    /// Discard unread rows and pending result sets. Further calls fail.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.discard_current()?;
        while self.conn.start_next_result()?.is_some() {
            self.conn.drain_stream()?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(query_error_in(ErrorCategory::Programming, 0, "Cursor closed"));
        }
        Ok(())
    }

    fn load(&mut self, pending: Pending) -> Result<()> {
        self.row_number = 0;
        match pending {
            Pending::Done(ok) => {
                self.current = Current::Empty;
                self.description.clear();
                self.row_count = Some(ok.affected_rows);
                self.last_row_id = Some(ok.last_insert_id);
            }
            Pending::Rows(decoder) => {
                self.description = decoder.columns().iter().map(|c| c.description()).collect();
                self.last_row_id = None;
                if self.unbuffered {
                    self.row_count = None;
                    self.current = Current::Streaming {
                        decoder,
                        done: false,
                    };
                } else {
                    self.current = Current::Empty;
                    let result = self.conn.complete(Pending::Rows(decoder))?;
                    self.row_count = Some(result.rows.len() as u64);
                    self.current = Current::Buffered(result.rows.into());
                }
            }
        }
        Ok(())
    }

    fn discard_current(&mut self) -> Result<()> {
        let current = std::mem::replace(&mut self.current, Current::Empty);
        if let Current::Streaming { done: false, .. } = current {
            self.conn.drain_stream()?;
        }
        Ok(())
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetch_one().transpose()
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        if let Current::Streaming { done: false, .. } = self.current {
            if let Err(e) = self.discard_current() {
                tracing::warn!(error = %e, "failed to drain cursor result");
            }
        }
    }
}

