//! Broker-side AMQP 0-10 connection and session protocol engine.
//!
//! `amqwire` implements the stateful machinery between a framed transport
//! and a message layer: protocol-initiation and SASL negotiation, channel
//! multiplexing, command-numbered session state with receiver/sender
//! completion tracking, producer flow control, and the client-side
//! reconnect mirror. Queue routing and storage stay behind the
//! [`sink::MessageSink`] seam; the bit-level codec stays behind the frame
//! contract in [`frame`].

pub mod codec;
pub mod connection;
pub mod driver;
pub mod error;
pub mod flow;
pub mod frame;
pub mod handshake;
pub mod method;
pub mod reconnect;
pub mod sasl;
pub mod sequence;
pub mod session;
pub mod sink;

pub use connection::{ConnectionEngine, ConnectionState, EngineConfig, EngineFlow};
pub use driver::{ConnectionDriver, DriverConfig, PushHandle};
pub use error::{
    ConfigError,
    ConnectionException,
    ExecutionException,
    HandshakeError,
    ReconnectError,
    SessionException,
};
pub use frame::{Frame, FrameBody, FrameFlags, SegmentType, Track};
pub use handshake::ProtocolHeader;
pub use method::{Method, MethodCode};
pub use reconnect::{ConnectionOptions, ReconnectController, TcpConnector};
pub use sequence::{SequenceNumber, SequenceRange, SequenceSet, SessionPoint};
pub use session::{SessionConfig, SessionName, SessionRegistry, SessionState};
pub use sink::{DiscardSink, InboundMessage, MessageSink};
