//! The connection-level protocol engine.
//!
//! [`ConnectionEngine`] drives the post-handshake state machine: the
//! start/secure/tune/open negotiation, SASL, the channel table, and the
//! conversion of protocol violations into `connection.close`. Everything a
//! peer can provoke is answered on the wire; the engine never raises
//! protocol errors out of [`ConnectionEngine::handle_frame`].

pub mod mux;
pub mod negotiate;

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::time::Duration;

use crate::{
    error::{ConnectionCloseCode, ConnectionException},
    flow::FlowConfig,
    frame::{Frame, FrameBody},
    handshake::ProtocolHeader,
    method::{ConnectionMethod, Method, MethodCode},
    sasl::{Mechanisms, SaslOutcome, SaslServer},
    session::{
        SessionConfig,
        SessionName,
        SessionRegistry,
        Wakeup,
        WakeupSender,
        handler::SessionEnv,
    },
    sink::MessageSink,
};

pub use mux::{ChannelMux, OutboundSerialiser};
pub use negotiate::{ServerLimits, Tuning, negotiate};

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    AwaitStartOk,
    AwaitSecureOk,
    AwaitTuneOk,
    AwaitOpen,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// State name used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::AwaitStartOk => "await-start-ok",
            Self::AwaitSecureOk => "await-secure-ok",
            Self::AwaitTuneOk => "await-tune-ok",
            Self::AwaitOpen => "await-open",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Connection-class methods accepted in this state.
    const fn allowed(self) -> &'static [MethodCode] {
        match self {
            Self::Initial | Self::Closed => &[],
            Self::AwaitStartOk => &[MethodCode::ConnectionStartOk, MethodCode::ConnectionClose],
            Self::AwaitSecureOk => &[MethodCode::ConnectionSecureOk, MethodCode::ConnectionClose],
            Self::AwaitTuneOk => &[MethodCode::ConnectionTuneOk, MethodCode::ConnectionClose],
            Self::AwaitOpen => &[MethodCode::ConnectionOpen, MethodCode::ConnectionClose],
            Self::Open => &[MethodCode::ConnectionClose, MethodCode::ConnectionCloseOk],
            Self::Closing => &[MethodCode::ConnectionCloseOk, MethodCode::ConnectionClose],
        }
    }
}

/// Whether the connection is still usable after a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineFlow {
    /// Keep pumping frames.
    Continue,
    /// The close handshake finished; drop the transport after flushing.
    Closed,
}

/// Static configuration for a broker-side connection engine.
#[derive(Clone)]
pub struct EngineConfig {
    /// The single protocol version this engine speaks.
    pub version: ProtocolHeader,
    /// Tune caps advertised to clients.
    pub limits: ServerLimits,
    /// Locales offered in `connection.start`.
    pub locales: Vec<String>,
    /// SASL mechanisms offered in `connection.start`.
    pub mechanisms: Mechanisms,
    /// Broker URLs advertised in `connection.open-ok`.
    pub known_hosts: Vec<String>,
    /// Tunables for sessions created on this connection.
    pub session: SessionConfig,
    /// Producer flow control, when enabled.
    pub flow: Option<FlowConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: ProtocolHeader::AMQP_0_10,
            limits: ServerLimits::default(),
            locales: vec!["en_US".to_owned()],
            mechanisms: Mechanisms::default(),
            known_hosts: Vec::new(),
            session: SessionConfig::default(),
            flow: None,
        }
    }
}

/// Broker-side connection state machine.
pub struct ConnectionEngine {
    config: EngineConfig,
    state: ConnectionState,
    sasl: Option<Box<dyn SaslServer>>,
    sasl_failed: bool,
    principal: Option<String>,
    locale: String,
    tuning: Tuning,
    mux: ChannelMux,
    env: SessionEnv,
}

impl ConnectionEngine {
    /// Create an engine for a freshly accepted transport.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        sink: Arc<dyn MessageSink>,
        registry: Arc<SessionRegistry>,
        wakeups: WakeupSender,
    ) -> Self {
        let env = SessionEnv {
            config: config.session,
            flow: config.flow,
            wakeups,
            registry,
            sink,
        };
        let mux = ChannelMux::new(config.limits.channel_max);
        Self {
            config,
            state: ConnectionState::Initial,
            sasl: None,
            sasl_failed: false,
            principal: None,
            locale: String::new(),
            tuning: Tuning::default(),
            mux,
            env,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState { self.state }

    /// Authenticated principal once SASL has completed.
    #[must_use]
    pub fn principal(&self) -> Option<&str> { self.principal.as_deref() }

    /// Locale selected by the client in `start-ok`.
    #[must_use]
    pub fn locale(&self) -> &str { &self.locale }

    /// Values agreed during tuning.
    #[must_use]
    pub const fn tuning(&self) -> Tuning { self.tuning }

    /// Heartbeat emission interval, when heartbeats were negotiated.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.tuning.heartbeat > 0).then(|| Duration::from_secs(u64::from(self.tuning.heartbeat)))
    }

    /// The channel table.
    #[must_use]
    pub fn mux(&self) -> &ChannelMux { &self.mux }

    /// The protocol header was accepted; start negotiation.
    pub fn on_header_matched(&mut self, out: &mut Vec<Frame>) {
        debug_assert_eq!(self.state, ConnectionState::Initial);
        self.state = ConnectionState::AwaitStartOk;
        out.push(Frame::method(
            0,
            Method::Connection(ConnectionMethod::Start {
                mechanisms: self.config.mechanisms.advertised(),
                locales: self.config.locales.clone(),
            }),
        ));
    }

    /// Feed one inbound frame through the engine.
    ///
    /// Protocol violations are answered with `connection.close` and
    /// reported through the returned flow; they are never raised.
    pub fn handle_frame(&mut self, frame: Frame, out: &mut Vec<Frame>) -> EngineFlow {
        if matches!(frame.body, FrameBody::Heartbeat) {
            // Liveness is tracked by the I/O task; nothing to do here.
            return EngineFlow::Continue;
        }
        if frame.channel == 0 {
            if let Some((Method::Connection(method), _)) = frame.as_method() {
                return self.handle_connection_method(method.clone(), out);
            }
            self.fail(
                ConnectionException::Internal("non-connection frame on channel 0".into()),
                out,
            );
            return EngineFlow::Continue;
        }

        // No channel may exist unless the connection is open.
        if self.state != ConnectionState::Open {
            self.fail(
                ConnectionException::UnexpectedMethod {
                    method: frame
                        .method_code()
                        .map_or("non-method frame", MethodCode::name),
                    state: self.state.name(),
                },
                out,
            );
            return EngineFlow::Continue;
        }
        if let Err(exception) = self.mux.route(frame, &self.env, out) {
            self.fail(exception, out);
        }
        EngineFlow::Continue
    }

    fn handle_connection_method(
        &mut self,
        method: ConnectionMethod,
        out: &mut Vec<Frame>,
    ) -> EngineFlow {
        let code = Method::Connection(method.clone()).code();
        if !self.state.allowed().contains(&code) {
            self.fail(
                ConnectionException::UnexpectedMethod {
                    method: code.name(),
                    state: self.state.name(),
                },
                out,
            );
            return EngineFlow::Continue;
        }
        match method {
            ConnectionMethod::StartOk {
                mechanism,
                response,
                locale,
                client_properties: _,
            } => {
                self.locale = locale;
                if mechanism.is_empty() {
                    // No mechanism selected: treat as anonymous.
                    self.principal = Some("anonymous".to_owned());
                    self.tune(out);
                    return EngineFlow::Continue;
                }
                let Some(server) = self.config.mechanisms.create(&mechanism) else {
                    self.sasl_failed = true;
                    self.fail(
                        ConnectionException::Sasl {
                            reason: format!("unknown SASL mechanism: {mechanism}"),
                        },
                        out,
                    );
                    return EngineFlow::Continue;
                };
                self.sasl = Some(server);
                self.secure(&response, out)
            }
            ConnectionMethod::SecureOk { response } => self.secure(&response, out),
            ConnectionMethod::TuneOk {
                channel_max,
                max_frame_size,
                heartbeat,
            } => {
                self.tuning = negotiate(self.config.limits, channel_max, max_frame_size, heartbeat);
                self.mux.set_channel_max(self.tuning.channel_max);
                debug!(
                    "tuned: channel-max {}, max-frame-size {}, heartbeat {}",
                    self.tuning.channel_max, self.tuning.max_frame_size, self.tuning.heartbeat
                );
                self.state = ConnectionState::AwaitOpen;
                EngineFlow::Continue
            }
            ConnectionMethod::Open { virtual_host } => {
                info!(
                    "connection open (virtual host {virtual_host:?}, principal {:?})",
                    self.principal
                );
                self.state = ConnectionState::Open;
                out.push(Frame::method(
                    0,
                    Method::Connection(ConnectionMethod::OpenOk {
                        known_hosts: self.config.known_hosts.clone(),
                    }),
                ));
                EngineFlow::Continue
            }
            ConnectionMethod::Close {
                reply_code,
                reply_text,
            } => {
                info!("connection closed by peer ({reply_code:?}): {reply_text}");
                self.mux.close_all(out);
                out.push(Frame::method(
                    0,
                    Method::Connection(ConnectionMethod::CloseOk),
                ));
                self.state = ConnectionState::Closed;
                EngineFlow::Closed
            }
            ConnectionMethod::CloseOk => {
                self.state = ConnectionState::Closed;
                EngineFlow::Closed
            }
            ConnectionMethod::Start { .. }
            | ConnectionMethod::Secure { .. }
            | ConnectionMethod::Tune { .. }
            | ConnectionMethod::OpenOk { .. } => {
                // Server-to-client methods are rejected by the allowed table.
                unreachable!("dispatch table admitted a server-only method")
            }
        }
    }

    /// Drive one SASL round; a failed exchange is never retried.
    fn secure(&mut self, response: &[u8], out: &mut Vec<Frame>) -> EngineFlow {
        if self.sasl_failed {
            self.fail(
                ConnectionException::Sasl {
                    reason: "authentication already failed".into(),
                },
                out,
            );
            return EngineFlow::Continue;
        }
        let Some(server) = self.sasl.as_mut() else {
            self.fail(
                ConnectionException::Internal("secure-ok with no SASL exchange".into()),
                out,
            );
            return EngineFlow::Continue;
        };
        match server.respond(response) {
            Ok(SaslOutcome::Complete { principal }) => {
                debug!("authenticated as {principal}");
                self.principal = Some(principal);
                self.sasl = None;
                self.tune(out);
            }
            Ok(SaslOutcome::Challenge(challenge)) => {
                self.state = ConnectionState::AwaitSecureOk;
                out.push(Frame::method(
                    0,
                    Method::Connection(ConnectionMethod::Secure { challenge }),
                ));
            }
            Err(error) => {
                self.sasl_failed = true;
                self.sasl = None;
                self.fail(
                    ConnectionException::Sasl {
                        reason: error.to_string(),
                    },
                    out,
                );
            }
        }
        EngineFlow::Continue
    }

    fn tune(&mut self, out: &mut Vec<Frame>) {
        self.state = ConnectionState::AwaitTuneOk;
        out.push(Frame::method(
            0,
            Method::Connection(ConnectionMethod::Tune {
                channel_max: self.config.limits.channel_max,
                max_frame_size: self.config.limits.max_frame_size,
                heartbeat_max: self.config.limits.heartbeat_max,
            }),
        ));
    }

    /// Report a broken engine invariant.
    ///
    /// Emits `connection.close` with `InternalError` and begins closing,
    /// exactly as any other connection exception is handled. Invariant
    /// violations are never forwarded to the peer as protocol traffic.
    pub fn fail_internal(&mut self, reason: String, out: &mut Vec<Frame>) {
        self.fail(ConnectionException::Internal(reason), out);
    }

    /// Convert a connection exception into `connection.close`.
    fn fail(&mut self, exception: ConnectionException, out: &mut Vec<Frame>) {
        warn!("closing connection: {exception}");
        let reply_code = match &exception {
            ConnectionException::Sasl { .. } => ConnectionCloseCode::ConnectionForced,
            ConnectionException::UnexpectedMethod { .. }
            | ConnectionException::ChannelLimit { .. } => ConnectionCloseCode::FramingError,
            ConnectionException::Transport(_) | ConnectionException::Internal(_) => {
                ConnectionCloseCode::InternalError
            }
        };
        self.mux.close_all(out);
        out.push(Frame::method(
            0,
            Method::Connection(ConnectionMethod::Close {
                reply_code,
                reply_text: exception.to_string(),
            }),
        ));
        self.state = ConnectionState::Closing;
    }

    /// The transport died: destroy sessions, send nothing.
    pub fn on_transport_failure(&mut self) {
        warn!("transport failure; aborting {} channel(s)", self.mux.len());
        self.mux.abort_all();
        self.state = ConnectionState::Closed;
    }

    /// Service a wakeup posted by a worker thread or timer.
    pub fn handle_wakeup(&mut self, wakeup: Wakeup, out: &mut Vec<Frame>) {
        match wakeup {
            Wakeup::Completions(name) => {
                if let Some(handler) = self.mux.session_handler_mut(&name) {
                    if let Some(session) = handler.session_mut() {
                        session.drain_completions(out);
                    }
                }
            }
            Wakeup::CreditRetry(name) => {
                if let Some(handler) = self.mux.session_handler_mut(&name) {
                    if let Some(session) = handler.session_mut() {
                        session.retry_credit(out);
                    }
                }
            }
        }
    }

    /// Collect credit-retry requests raised since the last call.
    ///
    /// The I/O task arms one timer per entry and posts
    /// [`Wakeup::CreditRetry`] when it fires.
    #[must_use]
    pub fn take_credit_schedules(&mut self) -> Vec<(SessionName, Duration)> {
        let mut schedules = Vec::new();
        for handler in self.mux.handlers_mut() {
            let name = handler.session_name();
            if let (Some(name), Some(session)) = (name, handler.session_mut()) {
                if let Some(delay) = session.take_credit_retry() {
                    schedules.push((name, delay));
                }
            }
        }
        schedules
    }
}
