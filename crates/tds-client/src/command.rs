//! Command execution: coupling a request's write to its response's read.
//!
//! The write of a command runs as its own task so the caller can start
//! waiting for the response immediately. [`IoCompletionPair`] resolves to
//! the read side as soon as that is possible without losing a write
//! failure, and [`CommandContext`] checks the write outcome again once the
//! response has been consumed.

use std::sync::Arc;

use tds_codec::FrontendMessage;
use tds_protocol::{RpcRequest, SqlBatch};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::operation::{Operation, OperationFlags, OperationSlot, OperationState};
use crate::parameters::ParameterContext;
use crate::protocol::Protocol;
use crate::results::{CommandReader, CommandSummary};
use crate::statement_cache::{Statement, StatementKind};

/// Write half of an [`IoCompletionPair`].
#[derive(Debug)]
enum WriteState {
    InFlight(oneshot::Receiver<Result<()>>),
    Done(std::result::Result<(), Arc<Error>>),
}

enum Settled {
    Written(std::result::Result<(), Arc<Error>>),
    Read(Result<()>),
}

/// A command's in-flight write paired with its read activation.
#[derive(Debug)]
pub struct IoCompletionPair {
    write: WriteState,
    read: Arc<OperationSlot>,
}

impl IoCompletionPair {
    /// Pair an in-flight write with the operation that will read the
    /// response.
    #[must_use]
    pub fn new(write: oneshot::Receiver<Result<()>>, read: Arc<OperationSlot>) -> Self {
        Self {
            write: WriteState::InFlight(write),
            read,
        }
    }

    /// Spawn `message`'s write for `slot` and pair it with the slot.
    pub fn spawn(
        protocol: Arc<Protocol>,
        slot: Arc<OperationSlot>,
        message: FrontendMessage,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        let write_slot = Arc::clone(&slot);
        tokio::spawn(async move {
            let result = protocol.write_message(&write_slot, &message, &cancel).await;
            let _ = tx.send(result);
        });
        Self::new(rx, slot)
    }

    /// The read side.
    #[must_use]
    pub fn read(&self) -> &Arc<OperationSlot> {
        &self.read
    }

    /// Wait until the response can be read.
    ///
    /// Returns as soon as the read side is activated while the write has
    /// succeeded or is still in flight. A write that already failed is
    /// reported without waiting. When both settle together the read side
    /// wins unless the write failed.
    pub async fn select(&mut self) -> Result<()> {
        loop {
            let settled = match &mut self.write {
                WriteState::Done(Err(e)) => return Err(Error::WriteFailed(Arc::clone(e))),
                WriteState::Done(Ok(())) => return self.read.activated().await,
                WriteState::InFlight(rx) => {
                    if self.read.state() == OperationState::Activated {
                        return Ok(());
                    }
                    tokio::select! {
                        biased;
                        written = rx => Settled::Written(flatten(written)),
                        read = self.read.activated() => Settled::Read(read),
                    }
                }
            };
            match settled {
                Settled::Written(result) => self.write = WriteState::Done(result),
                Settled::Read(result) => return result,
            }
        }
    }

    /// Wait for the write to finish and report its outcome.
    pub async fn write_outcome(&mut self) -> Result<()> {
        if let WriteState::InFlight(rx) = &mut self.write {
            let result = flatten(rx.await);
            self.write = WriteState::Done(result);
        }
        match &self.write {
            WriteState::Done(Err(e)) => Err(Error::WriteFailed(Arc::clone(e))),
            _ => Ok(()),
        }
    }
}

fn flatten(
    received: std::result::Result<Result<()>, oneshot::error::RecvError>,
) -> std::result::Result<(), Arc<Error>> {
    match received {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Arc::new(e)),
        Err(_) => Err(Arc::new(Error::WriteAborted)),
    }
}

/// One command on one operation.
#[derive(Debug)]
pub struct CommandContext {
    operation: Operation,
    pair: IoCompletionPair,
    cancel: CancellationToken,
}

impl CommandContext {
    /// Admit a new operation on `protocol` and start writing `message`.
    pub fn start(
        protocol: &Arc<Protocol>,
        message: impl Into<FrontendMessage>,
        flags: OperationFlags,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let operation = protocol.try_start_operation(flags)?;
        Ok(Self::on(operation, message, cancel))
    }

    /// Start writing `message` on an admitted operation.
    ///
    /// An exclusive operation may carry several commands one after another.
    pub fn on(
        operation: Operation,
        message: impl Into<FrontendMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let pair = IoCompletionPair::spawn(
            Arc::clone(operation.protocol()),
            Arc::clone(operation.slot()),
            message.into(),
            cancel.clone(),
        );
        Self::with_pair(operation, pair, cancel)
    }

    /// Pair an operation with a write started elsewhere.
    #[must_use]
    pub fn with_pair(
        operation: Operation,
        pair: IoCompletionPair,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            operation,
            pair,
            cancel,
        }
    }

    /// The operation.
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Wait for the turn to read and take the token stream.
    ///
    /// Cancellation while waiting cancels the operation.
    pub async fn read(&mut self) -> Result<CommandReader> {
        let selected = tokio::select! {
            biased;
            selected = self.pair.select() => selected,
            () = self.cancel.cancelled() => Err(Error::Canceled),
        };
        if let Err(e) = selected {
            if self.cancel.is_cancelled() {
                self.operation.protocol().cancel(self.operation.slot()).await;
            }
            return Err(e);
        }
        CommandReader::new(
            Arc::clone(self.operation.protocol()),
            Arc::clone(self.operation.slot()),
        )
        .await
    }

    /// Drain `reader` and check the write outcome, keeping the operation.
    ///
    /// A write failure is reported in preference to a read failure.
    pub async fn complete_response(&mut self, reader: CommandReader) -> Result<CommandSummary> {
        let read = reader.finish().await;
        self.pair.write_outcome().await?;
        read
    }

    /// Drain `reader`, check the write outcome and release the operation.
    pub async fn finish(mut self, reader: CommandReader) -> Result<CommandSummary> {
        self.complete_response(reader).await
    }

    /// Run to completion: read, drain, check the write.
    pub async fn execute(mut self) -> Result<CommandSummary> {
        let reader = match self.read().await {
            Ok(reader) => reader,
            Err(e) => {
                // Surface the write failure if that is what stopped the read.
                self.pair.write_outcome().await?;
                return Err(e);
            }
        };
        self.finish(reader).await
    }

    /// Give back the operation, for an exclusive owner issuing more commands.
    #[must_use]
    pub fn into_operation(self) -> Operation {
        self.operation
    }
}

/// Preparation progress of a [`CommandExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparationState {
    /// Runs as text with `sp_executesql`.
    Unprepared,
    /// Runs with `sp_prepexec`; the response carries the handle.
    Preparing,
    /// Runs by handle with `sp_execute`.
    Prepared,
}

/// A parameterized command bound to a prepared statement.
#[derive(Debug)]
pub struct CommandExecution {
    protocol: Arc<Protocol>,
    statement: Arc<Statement>,
    parameters: Arc<ParameterContext>,
    preparation: PreparationState,
    flags: OperationFlags,
    cancel: CancellationToken,
}

impl CommandExecution {
    /// Bind `sql` to the connection's statement for that text.
    pub fn new(protocol: &Arc<Protocol>, sql: &str, parameters: Arc<ParameterContext>) -> Self {
        Self {
            statement: protocol.statement(sql),
            protocol: Arc::clone(protocol),
            parameters,
            preparation: PreparationState::Unprepared,
            flags: OperationFlags::empty(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the admission flags.
    #[must_use]
    pub fn flags(mut self, flags: OperationFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Link a cancellation token.
    #[must_use]
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The statement.
    #[must_use]
    pub fn statement(&self) -> &Arc<Statement> {
        &self.statement
    }

    /// Preparation progress.
    #[must_use]
    pub fn preparation(&self) -> PreparationState {
        self.preparation
    }

    /// Build the request for the statement's current state.
    pub fn request(&mut self) -> RpcRequest {
        let params = self.parameters.rpc_params();
        let request = match (self.statement.kind(), self.statement.handle()) {
            (StatementKind::Direct, _) => {
                self.preparation = PreparationState::Unprepared;
                RpcRequest::execute_sql(self.statement.sql(), params)
            }
            (StatementKind::Prepared, Some(handle)) => {
                self.preparation = PreparationState::Prepared;
                RpcRequest::execute(handle, params)
            }
            (StatementKind::Prepared, None) => {
                self.preparation = PreparationState::Preparing;
                RpcRequest::prep_exec(self.statement.sql(), params)
            }
        };
        request.with_transaction(self.protocol.transaction_descriptor())
    }

    /// Release prepared handles evicted from the statement table.
    pub async fn release_retired(&self) -> Result<()> {
        for handle in self.protocol.take_retired() {
            let request = RpcRequest::unprepare(handle)
                .with_transaction(self.protocol.transaction_descriptor());
            CommandContext::start(
                &self.protocol,
                request,
                OperationFlags::empty(),
                self.cancel.clone(),
            )?
            .execute()
            .await?;
            tracing::debug!(
                connection = self.protocol.id(),
                handle,
                "released prepared handle"
            );
        }
        Ok(())
    }

    /// Start the command, returning its context and reader.
    pub async fn start(&mut self) -> Result<(CommandContext, CommandReader)> {
        self.release_retired().await?;
        let request = self.request();
        tracing::trace!(
            statement_id = self.statement.id(),
            preparation = ?self.preparation,
            "executing statement"
        );
        let mut context =
            CommandContext::start(&self.protocol, request, self.flags, self.cancel.clone())?;
        let reader = match context.read().await {
            Ok(reader) => reader,
            Err(e) => {
                context.pair.write_outcome().await?;
                return Err(e);
            }
        };
        Ok((context, reader.with_statement(Arc::clone(&self.statement))))
    }

    /// Run the command to completion.
    pub async fn execute(mut self) -> Result<CommandSummary> {
        let (context, reader) = self.start().await?;
        let summary = context.finish(reader).await?;
        if self.preparation == PreparationState::Preparing && self.statement.is_complete() {
            self.preparation = PreparationState::Prepared;
        }
        Ok(summary)
    }
}

/// Run a SQL batch.
pub async fn execute_batch(protocol: &Arc<Protocol>, sql: &str) -> Result<CommandSummary> {
    let batch = SqlBatch::new(sql).with_transaction(protocol.transaction_descriptor());
    CommandContext::start(protocol, batch, OperationFlags::empty(), CancellationToken::new())?
        .execute()
        .await
}
