//! Contract between the session engine and the message layer.
//!
//! The engine assembles inbound content framesets into [`InboundMessage`]s
//! and hands them to a [`MessageSink`] together with a completion handle.
//! Routing, queueing and storage live behind the sink; the engine only
//! requires that the handle is completed exactly once, from any thread, when
//! the message has been fully processed.

use crate::{
    error::{ExecutionErrorCode, ExecutionException},
    frame::MessageHeader,
    method::{CreditUnit, FlowMode},
    sequence::{SequenceNumber, SequenceSet},
    session::incomplete::CompletionHandle,
};

/// A fully assembled inbound message.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    /// Command id assigned to the transfer.
    pub command_id: SequenceNumber,
    /// Destination named by the transfer.
    pub destination: String,
    /// True when the peer expects a `message.accept` for this transfer.
    pub requires_accept: bool,
    /// True when the peer asked for immediate completion notification.
    pub sync: bool,
    /// Typed header segment.
    pub header: MessageHeader,
    /// Concatenated content segments.
    pub body: Vec<u8>,
}

/// Failures reported by a sink while executing a command.
///
/// Each maps onto an [`ExecutionErrorCode`] and is reported to the peer as
/// `execution.exception` scoped to the offending command.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SinkError {
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
}

impl SinkError {
    /// The wire code this failure is reported with.
    #[must_use]
    pub const fn code(&self) -> ExecutionErrorCode {
        match self {
            Self::NotImplemented(_) => ExecutionErrorCode::NotImplemented,
            Self::IllegalArgument(_) => ExecutionErrorCode::IllegalArgument,
            Self::NotFound(_) => ExecutionErrorCode::NotFound,
            Self::ResourceLimit(_) => ExecutionErrorCode::ResourceLimitExceeded,
        }
    }

    /// Convert into the execution exception for `command_id`.
    #[must_use]
    pub fn into_exception(self, command_id: SequenceNumber) -> ExecutionException {
        ExecutionException {
            code: self.code(),
            command_id,
            description: self.to_string(),
        }
    }
}

/// Receiver of assembled messages and destination-scoped commands.
///
/// Methods other than [`MessageSink::transfer`] default to
/// `not-implemented`, matching an engine deployed without a semantic layer.
pub trait MessageSink: Send + Sync {
    /// Take ownership of an assembled message.
    ///
    /// `completion` must be completed exactly once, possibly from another
    /// thread, once every interested party is done with the message.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] when the message cannot be admitted; the
    /// engine reports it on the transfer's command id.
    fn transfer(
        &self,
        message: InboundMessage,
        completion: CompletionHandle,
    ) -> Result<(), SinkError>;

    /// The peer accepted transfers this engine previously delivered.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] when the referenced transfers are unknown.
    fn accept(&self, _transfers: &SequenceSet) -> Result<(), SinkError> { Ok(()) }

    /// Credit granted for a named destination.
    ///
    /// # Errors
    ///
    /// Defaults to `not-implemented`.
    fn flow(&self, destination: &str, _unit: CreditUnit, _value: u32) -> Result<(), SinkError> {
        Err(SinkError::NotImplemented(format!(
            "message.flow for destination {destination:?}"
        )))
    }

    /// Flow mode selected for a named destination.
    ///
    /// # Errors
    ///
    /// Defaults to `not-implemented`.
    fn set_flow_mode(&self, destination: &str, _mode: FlowMode) -> Result<(), SinkError> {
        Err(SinkError::NotImplemented(format!(
            "message.set-flow-mode for destination {destination:?}"
        )))
    }

    /// Credit drained for a named destination.
    ///
    /// # Errors
    ///
    /// Defaults to `not-implemented`.
    fn stop(&self, destination: &str) -> Result<(), SinkError> {
        Err(SinkError::NotImplemented(format!(
            "message.stop for destination {destination:?}"
        )))
    }
}

/// Sink that completes every message immediately and discards it.
///
/// Useful for demos and tests that exercise the protocol engine without a
/// message layer behind it.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardSink;

impl MessageSink for DiscardSink {
    fn transfer(
        &self,
        message: InboundMessage,
        completion: CompletionHandle,
    ) -> Result<(), SinkError> {
        log::debug!(
            "discarding {} byte message for {:?} (command {})",
            message.body.len(),
            message.destination,
            message.command_id
        );
        completion.complete();
        Ok(())
    }
}
