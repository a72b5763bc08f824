//! Typed method descriptors used by the state machines.
//!
//! These are the protocol-visible commands and controls, modelled as plain
//! data. Bit-level encoding of method bodies belongs to the wire codec; the
//! engine only ever sees these descriptors. Each method maps to a
//! [`MethodCode`] used by the per-state dispatch tables.

use bincode::{Decode, Encode};

use crate::{
    error::{ConnectionCloseCode, DetachCode, ExecutionErrorCode},
    sequence::{SequenceNumber, SequenceSet},
};

/// Flat method identifier used by dispatch tables and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum MethodCode {
    ConnectionStart,
    ConnectionStartOk,
    ConnectionSecure,
    ConnectionSecureOk,
    ConnectionTune,
    ConnectionTuneOk,
    ConnectionOpen,
    ConnectionOpenOk,
    ConnectionClose,
    ConnectionCloseOk,
    ChannelClose,
    ChannelCloseOk,
    SessionAttach,
    SessionAttached,
    SessionDetach,
    SessionDetached,
    SessionRequestTimeout,
    SessionTimeout,
    SessionCommandPoint,
    SessionExpected,
    SessionCompleted,
    SessionKnownCompleted,
    SessionFlush,
    ExecutionSync,
    ExecutionResult,
    ExecutionException,
    MessageTransfer,
    MessageAccept,
    MessageFlow,
    MessageSetFlowMode,
    MessageStop,
}

impl MethodCode {
    /// Wire-style name, used in error text and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ConnectionStart => "connection.start",
            Self::ConnectionStartOk => "connection.start-ok",
            Self::ConnectionSecure => "connection.secure",
            Self::ConnectionSecureOk => "connection.secure-ok",
            Self::ConnectionTune => "connection.tune",
            Self::ConnectionTuneOk => "connection.tune-ok",
            Self::ConnectionOpen => "connection.open",
            Self::ConnectionOpenOk => "connection.open-ok",
            Self::ConnectionClose => "connection.close",
            Self::ConnectionCloseOk => "connection.close-ok",
            Self::ChannelClose => "channel.close",
            Self::ChannelCloseOk => "channel.close-ok",
            Self::SessionAttach => "session.attach",
            Self::SessionAttached => "session.attached",
            Self::SessionDetach => "session.detach",
            Self::SessionDetached => "session.detached",
            Self::SessionRequestTimeout => "session.request-timeout",
            Self::SessionTimeout => "session.timeout",
            Self::SessionCommandPoint => "session.command-point",
            Self::SessionExpected => "session.expected",
            Self::SessionCompleted => "session.completed",
            Self::SessionKnownCompleted => "session.known-completed",
            Self::SessionFlush => "session.flush",
            Self::ExecutionSync => "execution.sync",
            Self::ExecutionResult => "execution.result",
            Self::ExecutionException => "execution.exception",
            Self::MessageTransfer => "message.transfer",
            Self::MessageAccept => "message.accept",
            Self::MessageFlow => "message.flow",
            Self::MessageSetFlowMode => "message.set-flow-mode",
            Self::MessageStop => "message.stop",
        }
    }
}

/// Connection-class controls (channel 0 only).
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[non_exhaustive]
pub enum ConnectionMethod {
    Start {
        mechanisms: Vec<String>,
        locales: Vec<String>,
    },
    StartOk {
        client_properties: Vec<(String, String)>,
        mechanism: String,
        response: Vec<u8>,
        locale: String,
    },
    Secure {
        challenge: Vec<u8>,
    },
    SecureOk {
        response: Vec<u8>,
    },
    Tune {
        channel_max: u16,
        max_frame_size: u32,
        heartbeat_max: u16,
    },
    TuneOk {
        channel_max: u16,
        max_frame_size: u32,
        heartbeat: u16,
    },
    Open {
        virtual_host: String,
    },
    OpenOk {
        known_hosts: Vec<String>,
    },
    Close {
        reply_code: ConnectionCloseCode,
        reply_text: String,
    },
    CloseOk,
}

/// Channel-class controls used for channel-scoped errors.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[non_exhaustive]
pub enum ChannelMethod {
    Close { reply_code: u16, reply_text: String },
    CloseOk,
}

/// Session-class controls.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[non_exhaustive]
pub enum SessionMethod {
    Attach {
        name: Vec<u8>,
        force: bool,
    },
    Attached {
        name: Vec<u8>,
    },
    Detach {
        name: Vec<u8>,
    },
    Detached {
        name: Vec<u8>,
        code: DetachCode,
    },
    RequestTimeout {
        timeout: u32,
    },
    Timeout {
        timeout: u32,
    },
    CommandPoint {
        command_id: SequenceNumber,
        command_offset: u64,
    },
    Expected {
        commands: SequenceSet,
    },
    Completed {
        commands: SequenceSet,
        timely_reply: bool,
    },
    KnownCompleted {
        commands: SequenceSet,
    },
    Flush {
        expected: bool,
        confirmed: bool,
        completed: bool,
    },
}

/// Execution-class commands.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[non_exhaustive]
pub enum ExecutionMethod {
    Sync,
    Result {
        command_id: SequenceNumber,
        value: Vec<u8>,
    },
    Exception {
        error_code: ExecutionErrorCode,
        command_id: SequenceNumber,
        description: String,
    },
}

/// How transfers must be acknowledged by the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum AcceptMode {
    /// No `message.accept` is expected.
    None,
    /// The receiver must list the transfer in a `message.accept`.
    Explicit,
}

/// Unit in which flow credit is granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum CreditUnit {
    Message,
    Byte,
}

/// Credit accounting mode for a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum FlowMode {
    Credit,
    Window,
}

/// Message-class commands.
///
/// `Transfer` is the only content-bearing method: its frame opens a frameset
/// continued by header and content segments.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[non_exhaustive]
pub enum MessageMethod {
    Transfer {
        destination: String,
        accept_mode: AcceptMode,
    },
    Accept {
        transfers: SequenceSet,
    },
    Flow {
        destination: String,
        unit: CreditUnit,
        value: u32,
    },
    SetFlowMode {
        destination: String,
        mode: FlowMode,
    },
    Stop {
        destination: String,
    },
}

/// Any protocol method, grouped by class.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum Method {
    Connection(ConnectionMethod),
    Channel(ChannelMethod),
    Session(SessionMethod),
    Execution(ExecutionMethod),
    Message(MessageMethod),
}

impl Method {
    /// The flat dispatch code for this method.
    #[must_use]
    pub const fn code(&self) -> MethodCode {
        match self {
            Self::Connection(m) => match m {
                ConnectionMethod::Start { .. } => MethodCode::ConnectionStart,
                ConnectionMethod::StartOk { .. } => MethodCode::ConnectionStartOk,
                ConnectionMethod::Secure { .. } => MethodCode::ConnectionSecure,
                ConnectionMethod::SecureOk { .. } => MethodCode::ConnectionSecureOk,
                ConnectionMethod::Tune { .. } => MethodCode::ConnectionTune,
                ConnectionMethod::TuneOk { .. } => MethodCode::ConnectionTuneOk,
                ConnectionMethod::Open { .. } => MethodCode::ConnectionOpen,
                ConnectionMethod::OpenOk { .. } => MethodCode::ConnectionOpenOk,
                ConnectionMethod::Close { .. } => MethodCode::ConnectionClose,
                ConnectionMethod::CloseOk => MethodCode::ConnectionCloseOk,
            },
            Self::Channel(m) => match m {
                ChannelMethod::Close { .. } => MethodCode::ChannelClose,
                ChannelMethod::CloseOk => MethodCode::ChannelCloseOk,
            },
            Self::Session(m) => match m {
                SessionMethod::Attach { .. } => MethodCode::SessionAttach,
                SessionMethod::Attached { .. } => MethodCode::SessionAttached,
                SessionMethod::Detach { .. } => MethodCode::SessionDetach,
                SessionMethod::Detached { .. } => MethodCode::SessionDetached,
                SessionMethod::RequestTimeout { .. } => MethodCode::SessionRequestTimeout,
                SessionMethod::Timeout { .. } => MethodCode::SessionTimeout,
                SessionMethod::CommandPoint { .. } => MethodCode::SessionCommandPoint,
                SessionMethod::Expected { .. } => MethodCode::SessionExpected,
                SessionMethod::Completed { .. } => MethodCode::SessionCompleted,
                SessionMethod::KnownCompleted { .. } => MethodCode::SessionKnownCompleted,
                SessionMethod::Flush { .. } => MethodCode::SessionFlush,
            },
            Self::Execution(m) => match m {
                ExecutionMethod::Sync => MethodCode::ExecutionSync,
                ExecutionMethod::Result { .. } => MethodCode::ExecutionResult,
                ExecutionMethod::Exception { .. } => MethodCode::ExecutionException,
            },
            Self::Message(m) => match m {
                MessageMethod::Transfer { .. } => MethodCode::MessageTransfer,
                MessageMethod::Accept { .. } => MethodCode::MessageAccept,
                MessageMethod::Flow { .. } => MethodCode::MessageFlow,
                MessageMethod::SetFlowMode { .. } => MethodCode::MessageSetFlowMode,
                MessageMethod::Stop { .. } => MethodCode::MessageStop,
            },
        }
    }

    /// True for methods whose frame opens a content frameset.
    #[must_use]
    pub const fn is_content_bearing(&self) -> bool {
        matches!(self, Self::Message(MessageMethod::Transfer { .. }))
    }

    /// True for controls (connection, channel and session classes), which
    /// travel on the control track and consume no command id.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Channel(_) | Self::Session(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_is_the_only_content_bearing_method() {
        let transfer = Method::Message(MessageMethod::Transfer {
            destination: String::new(),
            accept_mode: AcceptMode::None,
        });
        assert!(transfer.is_content_bearing());
        assert!(!Method::Execution(ExecutionMethod::Sync).is_content_bearing());
    }

    #[test]
    fn controls_and_commands_split_by_class() {
        assert!(Method::Session(SessionMethod::Detach { name: vec![1] }).is_control());
        assert!(!Method::Execution(ExecutionMethod::Sync).is_control());
        assert_eq!(
            Method::Execution(ExecutionMethod::Sync).code().name(),
            "execution.sync"
        );
    }
}
