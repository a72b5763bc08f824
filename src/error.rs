//! Error taxonomy for the protocol engine.
//!
//! Errors are layered by scope: handshake failures happen before a
//! connection exists, connection exceptions tear the whole transport down,
//! channel errors close a single channel, session exceptions detach one
//! session, and execution exceptions are scoped to a single command and are
//! reported to the peer as `execution.exception` without disturbing the
//! session. Protocol-level failures are converted into method calls at the
//! engine boundary and never escape it; panics are reserved for broken
//! internal invariants.

use std::io;

use thiserror::Error;

use crate::sequence::SequenceNumber;

/// Failures while exchanging the 8-byte protocol-initiation header.
///
/// Every variant except [`HandshakeError::Io`] instructs the engine to emit
/// its own preferred header before closing the transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// The first four bytes were not the protocol magic.
    #[error("bad protocol magic {found:?}")]
    HeaderMismatch {
        /// Bytes received in place of the magic.
        found: [u8; 4],
    },
    /// Unsupported protocol class octet.
    #[error("unsupported protocol class {found} (supported: {supported})")]
    ProtocolClass {
        /// Class octet received from the peer.
        found: u8,
        /// Class octet this engine speaks.
        supported: u8,
    },
    /// Unsupported protocol instance octet.
    #[error("unsupported protocol instance {found} (supported: {supported})")]
    ProtocolInstance {
        /// Instance octet received from the peer.
        found: u8,
        /// Instance octet this engine speaks.
        supported: u8,
    },
    /// Unsupported major version.
    #[error("unsupported protocol major {found} (supported: {supported})")]
    ProtocolMajor {
        /// Major version received from the peer.
        found: u8,
        /// Major version this engine speaks.
        supported: u8,
    },
    /// Unsupported minor version.
    #[error("unsupported protocol minor {found} (supported: {supported})")]
    ProtocolMinor {
        /// Minor version received from the peer.
        found: u8,
        /// Minor version this engine speaks.
        supported: u8,
    },
    /// The transport failed while reading or writing the header.
    #[error("I/O error during protocol handshake: {0}")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// True when the engine should reply with its own header before closing.
    #[must_use]
    pub fn wants_header_reply(&self) -> bool { !matches!(self, Self::Io(_)) }
}

/// Reply codes carried on `connection.close`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
#[non_exhaustive]
pub enum ConnectionCloseCode {
    /// Orderly shutdown.
    Normal,
    /// The server forced the connection closed (e.g. authentication failure).
    ConnectionForced,
    /// A frame violated the connection-level protocol rules.
    FramingError,
    /// An unrecoverable internal invariant was violated.
    InternalError,
}

/// Connection-scoped failures; all of them end the connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionException {
    /// SASL negotiation failed; closed with `CONNECTION_FORCED`.
    #[error("authentication failed: {reason}")]
    Sasl {
        /// Human-readable failure detail from the mechanism.
        reason: String,
    },
    /// A method arrived that the current connection state does not accept.
    #[error("unexpected {method} in connection state {state}")]
    UnexpectedMethod {
        /// Name of the offending method.
        method: &'static str,
        /// Name of the state the connection was in.
        state: &'static str,
    },
    /// A frame addressed a channel at or beyond the negotiated channel-max.
    #[error("channel {channel} exceeds negotiated channel-max {max}")]
    ChannelLimit {
        /// Channel id carried by the frame.
        channel: u16,
        /// Negotiated channel-max.
        max: u16,
    },
    /// The underlying transport failed; sessions are detached, nothing is sent.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    /// A broken invariant inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Detach codes carried on `session.detached`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
#[non_exhaustive]
pub enum DetachCode {
    /// Orderly detach.
    Normal,
    /// The session name is already bound to another channel.
    SessionBusy,
    /// The transport carrying the session is shutting down.
    TransportBusy,
    /// The named session does not exist on this connection.
    NotAttached,
    /// Command-id state did not match what the peer claimed.
    UnknownIds,
}

/// Session-scoped failures; the session detaches, the connection survives.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionException {
    /// Operation on a channel with no attached session.
    #[error("no session attached")]
    NotAttached,
    /// Attach rejected because the name is bound elsewhere on the connection.
    #[error("session already attached on channel {channel}")]
    Busy {
        /// Channel currently holding the session.
        channel: u16,
    },
    /// The replay buffer cannot hold another command.
    #[error("replay buffer exhausted ({bytes} bytes buffered, limit {limit})")]
    ReplayOverflow {
        /// Bytes currently buffered for replay.
        bytes: usize,
        /// Configured replay byte budget.
        limit: usize,
    },
    /// A frameset violated the segment rules (e.g. a multi-frame method).
    #[error("malformed frameset: {0}")]
    Frameset(String),
}

/// Error codes reported to the peer via `execution.exception`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
#[non_exhaustive]
pub enum ExecutionErrorCode {
    /// The peer referenced an unknown entity.
    NotFound,
    /// An argument value was outside the legal domain.
    IllegalArgument,
    /// The command is recognised but not implemented by this peer.
    NotImplemented,
    /// A resource limit (e.g. producer credit) was exceeded.
    ResourceLimitExceeded,
    /// An unrecoverable internal fault while executing the command.
    InternalError,
}

/// A command-scoped failure, reported as `execution.exception` to the peer.
///
/// The offending command id is marked complete once the exception has been
/// sent, so completion bookkeeping keeps advancing.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("command {command_id} failed ({code:?}): {description}")]
pub struct ExecutionException {
    /// Taxonomy code reported on the wire.
    pub code: ExecutionErrorCode,
    /// Id of the command that failed.
    pub command_id: SequenceNumber,
    /// Human-readable detail.
    pub description: String,
}

impl ExecutionException {
    /// Build a `not-implemented` exception for `command_id`.
    #[must_use]
    pub fn not_implemented(command_id: SequenceNumber, what: impl Into<String>) -> Self {
        Self {
            code: ExecutionErrorCode::NotImplemented,
            command_id,
            description: what.into(),
        }
    }
}

/// Failures raised while applying client connection options.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The option name is not recognised; callers must fail open.
    #[error("invalid option: {0} not recognised")]
    InvalidOption(String),
    /// The option exists but the supplied value does not fit it.
    #[error("invalid value for {option}: {reason}")]
    InvalidValue {
        /// Option name as supplied.
        option: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Failures surfaced by the client-side reconnect controller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconnectError {
    /// Reconnect is disabled and the initial connection attempt failed.
    #[error("failed to connect (reconnect disabled)")]
    Disabled,
    /// The configured attempt limit was exhausted.
    #[error("failed to connect within reconnect limit ({limit} attempts)")]
    LimitExceeded {
        /// Configured attempt limit.
        limit: u32,
    },
    /// The configured wall-clock timeout elapsed.
    #[error("failed to connect within reconnect timeout")]
    TimedOut,
    /// The broker rejected a session resume for capacity reasons and
    /// `x-reconnect-on-limit-exceeded` is disabled.
    #[error("target capacity exceeded: {0}")]
    CapacityExceeded(String),
}

/// Failure reported by a transactional session mirror after failover.
///
/// The first commit after a reconnect reports the rollback; a subsequent
/// commit on the clean session succeeds.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransactionError {
    /// Work staged before the failover was discarded.
    #[error("transaction rolled back by connection failover")]
    RolledBack,
}

/// Errors produced by the reference wire codec.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The frame length prefix exceeded the negotiated maximum.
    #[error("frame of {size} bytes exceeds max frame size {max}")]
    Oversized {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
    /// The frame body could not be decoded.
    #[error("frame decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    /// The frame could not be encoded.
    #[error("frame encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
