//! Reading one operation's response.

use std::sync::Arc;

use tds_codec::RowReader;
use tds_protocol::{Done, DoneStatus, ReturnValue, ServerMessage, Token};

use crate::error::{Error, Result};
use crate::operation::{OperationSlot, Outcome};
use crate::protocol::{BoxedRead, Protocol, ReaderGuard};
use crate::statement_cache::Statement;

/// Name of the output parameter carrying a prepared handle.
const HANDLE_PARAM: &str = "@handle";

/// What a fully read response reported.
#[derive(Debug, Clone, Default)]
pub struct CommandSummary {
    /// Rows affected, summed over counted DONE tokens.
    pub rows_affected: u64,
    /// Stored procedure return status.
    pub return_status: Option<i32>,
    /// Output parameters.
    pub return_values: Vec<ReturnValue>,
    /// INFO messages, in arrival order.
    pub infos: Vec<ServerMessage>,
}

/// Reads the response of the active operation.
///
/// Holds the connection's token stream until dropped. The final DONE
/// completes a non-exclusive operation, activating the next one; an
/// exclusive operation stays active until its owner completes it.
pub struct CommandReader {
    protocol: Arc<Protocol>,
    slot: Arc<OperationSlot>,
    reader: ReaderGuard,
    statement: Option<Arc<Statement>>,
    summary: CommandSummary,
    error: Option<ServerMessage>,
    finished: bool,
}

impl CommandReader {
    /// Take the token stream for an activated operation.
    pub async fn new(protocol: Arc<Protocol>, slot: Arc<OperationSlot>) -> Result<Self> {
        slot.activated().await?;
        let reader = protocol.lock_reader().await;
        Ok(Self {
            protocol,
            slot,
            reader,
            statement: None,
            summary: CommandSummary::default(),
            error: None,
            finished: false,
        })
    }

    /// Complete `statement` with the prepared handle found in this response.
    #[must_use]
    pub fn with_statement(mut self, statement: Arc<Statement>) -> Self {
        self.statement = Some(statement);
        self
    }

    /// Check if the final DONE has been read.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// INFO messages so far.
    #[must_use]
    pub fn infos(&self) -> &[ServerMessage] {
        &self.summary.infos
    }

    /// Read the next token, or `None` after the final DONE.
    ///
    /// A read failure faults the connection. A fault raised elsewhere, such
    /// as a failed flush, ends a read that is waiting on the transport.
    pub async fn next_token(&mut self) -> Result<Option<Token>> {
        if self.finished {
            return Ok(None);
        }
        let read = tokio::select! {
            biased;
            () = self.protocol.faulted() => Err(Error::ConnectionClosed),
            read = self.reader.next_token() => read.map_err(Error::from),
        };
        let token = match read {
            Ok(token) => token,
            Err(e) => {
                // Returns the first cause when the connection already faulted.
                let cause = self.protocol.fault(e);
                return Err(Error::ConnectionFaulted(cause));
            }
        };

        match &token {
            Token::Info(info) => {
                tracing::debug!(
                    number = info.number,
                    message = %info.message,
                    "server info message"
                );
                self.summary.infos.push(info.clone());
            }
            Token::Error(err) => {
                tracing::debug!(
                    number = err.number,
                    class = err.class,
                    message = %err.message,
                    "server error"
                );
                if self.error.is_none() {
                    self.error = Some(err.clone());
                }
            }
            Token::EnvChange(env) => self.protocol.apply_env_change(env),
            Token::ReturnStatus(status) => self.summary.return_status = Some(*status),
            Token::ReturnValue(value) => self.record_return_value(value),
            Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => {
                self.record_done(done, matches!(token, Token::DoneInProc(_)));
            }
            _ => {}
        }
        Ok(Some(token))
    }

    fn record_return_value(&mut self, value: &ReturnValue) {
        if value.name.eq_ignore_ascii_case(HANDLE_PARAM) {
            if let (Some(statement), Some(handle)) = (&self.statement, value.as_i32()) {
                if statement.complete(handle) {
                    tracing::debug!(statement_id = statement.id(), handle, "statement prepared");
                } else {
                    // Prepared twice by pipelined executions; keep the first.
                    self.protocol.retire_handle(handle);
                }
            }
        }
        self.summary.return_values.push(value.clone());
    }

    fn record_done(&mut self, done: &Done, in_proc: bool) {
        if done.status.contains(DoneStatus::COUNT) {
            self.summary.rows_affected += done.row_count;
        }
        if !in_proc && !done.has_more() {
            self.finished = true;
            self.slot.set_in_flight(false);
            if !self.slot.is_exclusive() {
                self.protocol.complete(&self.slot, Outcome::Success);
            }
        }
    }

    /// Advance to the next row of the current result set.
    ///
    /// Returns `None` at the end of the response. A server error is reported
    /// once the DONE of the failed statement has been read.
    pub async fn next_row(&mut self) -> Result<Option<RowReader<'_, BoxedRead>>> {
        loop {
            let Some(token) = self.next_token().await? else {
                return self.take_error().map(|()| None);
            };
            match token {
                Token::Row => break,
                Token::Done(_) | Token::DoneProc(_) | Token::DoneInProc(_) => {
                    self.take_error()?;
                }
                _ => {}
            }
        }
        Ok(self.reader.row())
    }

    fn take_error(&mut self) -> Result<()> {
        match self.error.take() {
            Some(err) => Err(Error::server(&err)),
            None => Ok(()),
        }
    }

    /// Drain the rest of the response.
    ///
    /// Returns the summary, or the first server error.
    pub async fn finish(mut self) -> Result<CommandSummary> {
        let mut first_error = None;
        while self.next_token().await?.is_some() {
            if first_error.is_none() {
                first_error = self.error.take();
            }
        }
        if let Some(err) = first_error.or_else(|| self.error.take()) {
            return Err(Error::server(&err));
        }
        Ok(std::mem::take(&mut self.summary))
    }

    /// Cancel the rest of the response with an attention signal.
    ///
    /// Faults the connection if the acknowledgement cannot be read.
    pub async fn cancel(mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let protocol = Arc::clone(&self.protocol);
        if let Err(e) = protocol.attention(&self.slot, &mut self.reader).await {
            let cause = protocol.fault(e);
            return Err(Error::ConnectionFaulted(cause));
        }
        self.finished = true;
        Ok(())
    }
}

impl std::fmt::Debug for CommandReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandReader")
            .field("connection", &self.protocol.id())
            .field("operation", &self.slot.id())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
