//! Client-side reconnect machinery.
//!
//! This is the client mirror of the broker engine: an ordered,
//! de-duplicated URL set, an exponential backoff loop bounded by an attempt
//! limit and a wall-clock timeout, and session re-attachment after a
//! successful reconnect. Broker-advertised known-hosts merge into the URL
//! set on every successful connection. Transactional session mirrors report
//! a rollback on the first commit after a failover.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use tokio::{net::TcpStream, time::Instant};
use tokio_util::codec::Framed;

use crate::{
    codec::WireCodec,
    error::{ConfigError, DetachCode, HandshakeError, ReconnectError, TransactionError},
    frame::Frame,
    handshake::{self, ProtocolHeader},
    method::{ConnectionMethod, Method, SessionMethod},
    session::SessionName,
};

/// Default floor of the reconnect backoff, in seconds.
const DEFAULT_MIN_INTERVAL: u64 = 3;

/// Default ceiling of the reconnect backoff, in seconds.
const DEFAULT_MAX_INTERVAL: u64 = 60;

/// A loosely typed option value, as supplied by configuration surfaces.
#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self { Self::Bool(value) }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self { Self::Int(value) }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self { Self::Str(value.to_owned()) }
}

impl From<Vec<String>> for OptionValue {
    fn from(value: Vec<String>) -> Self { Self::List(value) }
}

impl OptionValue {
    fn as_bool(&self, option: &str) -> Result<bool, ConfigError> {
        match self {
            Self::Bool(value) => Ok(*value),
            Self::Int(value) => Ok(*value != 0),
            _ => Err(ConfigError::InvalidValue {
                option: option.to_owned(),
                reason: "expected a boolean".into(),
            }),
        }
    }

    fn as_int(&self, option: &str) -> Result<i64, ConfigError> {
        match self {
            Self::Int(value) => Ok(*value),
            _ => Err(ConfigError::InvalidValue {
                option: option.to_owned(),
                reason: "expected an integer".into(),
            }),
        }
    }

    fn as_str(&self, option: &str) -> Result<String, ConfigError> {
        match self {
            Self::Str(value) => Ok(value.clone()),
            _ => Err(ConfigError::InvalidValue {
                option: option.to_owned(),
                reason: "expected a string".into(),
            }),
        }
    }

    fn as_list(&self) -> Vec<String> {
        match self {
            Self::List(values) => values.clone(),
            Self::Str(value) => vec![value.clone()],
            Self::Bool(value) => vec![value.to_string()],
            Self::Int(value) => vec![value.to_string()],
        }
    }
}

/// Transport settings negotiated on behalf of the application.
#[derive(Clone, Debug, Default)]
pub struct ConnectionSettings {
    pub username: Option<String>,
    pub password: Option<String>,
    pub mechanism: Option<String>,
    pub service: Option<String>,
    pub min_ssf: Option<u32>,
    pub max_ssf: Option<u32>,
    pub heartbeat: Option<u16>,
    pub tcp_nodelay: Option<bool>,
    pub locale: Option<String>,
    pub max_channels: Option<u16>,
    pub max_frame_size: Option<u32>,
    pub bounds: Option<u32>,
    pub transport: Option<String>,
    pub ssl_cert_name: Option<String>,
}

/// The recognised client connection options.
///
/// Option names accept both hyphenated and underscored spellings. An
/// unrecognised name fails open with [`ConfigError::InvalidOption`].
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub reconnect: bool,
    pub timeout: Option<Duration>,
    pub limit: Option<u32>,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub urls: Vec<String>,
    pub replace_urls: bool,
    pub reconnect_on_limit_exceeded: bool,
    pub settings: ConnectionSettings,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: false,
            timeout: None,
            limit: None,
            min_interval: Duration::from_secs(DEFAULT_MIN_INTERVAL),
            max_interval: Duration::from_secs(DEFAULT_MAX_INTERVAL),
            urls: Vec::new(),
            replace_urls: false,
            reconnect_on_limit_exceeded: true,
            settings: ConnectionSettings::default(),
        }
    }
}

impl ConnectionOptions {
    /// Build options from a name/value map.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unknown names or ill-typed values.
    pub fn from_map(options: &HashMap<String, OptionValue>) -> Result<Self, ConfigError> {
        let mut built = Self::default();
        for (name, value) in options {
            built.set(name, value)?;
        }
        Ok(built)
    }

    /// Apply a single named option.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] for an unknown name and
    /// [`ConfigError::InvalidValue`] for a value of the wrong shape.
    pub fn set(&mut self, name: &str, value: &OptionValue) -> Result<(), ConfigError> {
        let canonical = name.replace('_', "-");
        match canonical.as_str() {
            "reconnect" => self.reconnect = value.as_bool(name)?,
            "reconnect-timeout" => {
                let secs = value.as_int(name)?;
                self.timeout = (secs >= 0).then(|| Duration::from_secs(secs.unsigned_abs()));
            }
            "reconnect-limit" => {
                let limit = value.as_int(name)?;
                self.limit = u32::try_from(limit).ok();
            }
            "reconnect-interval" => {
                let interval = Duration::from_secs(Self::seconds(name, value)?);
                self.min_interval = interval;
                self.max_interval = interval;
            }
            "reconnect-interval-min" => {
                self.min_interval = Duration::from_secs(Self::seconds(name, value)?);
            }
            "reconnect-interval-max" => {
                self.max_interval = Duration::from_secs(Self::seconds(name, value)?);
            }
            "reconnect-urls-replace" => self.replace_urls = value.as_bool(name)?,
            "reconnect-urls" => {
                if self.replace_urls {
                    self.urls.clear();
                }
                for url in value.as_list() {
                    merge_url(url, &mut self.urls);
                }
            }
            "username" => self.settings.username = Some(value.as_str(name)?),
            "password" => self.settings.password = Some(value.as_str(name)?),
            "sasl-mechanism" | "sasl-mechanisms" => {
                self.settings.mechanism = Some(value.as_str(name)?);
            }
            "sasl-service" => self.settings.service = Some(value.as_str(name)?),
            "sasl-min-ssf" => self.settings.min_ssf = Some(Self::unsigned(name, value)?),
            "sasl-max-ssf" => self.settings.max_ssf = Some(Self::unsigned(name, value)?),
            "heartbeat" => {
                self.settings.heartbeat = Some(Self::unsigned(name, value)? as u16);
            }
            "tcp-nodelay" => self.settings.tcp_nodelay = Some(value.as_bool(name)?),
            "locale" => self.settings.locale = Some(value.as_str(name)?),
            "max-channels" => {
                self.settings.max_channels = Some(Self::unsigned(name, value)? as u16);
            }
            "max-frame-size" => {
                self.settings.max_frame_size = Some(Self::unsigned(name, value)?);
            }
            "bounds" => self.settings.bounds = Some(Self::unsigned(name, value)?),
            "transport" => self.settings.transport = Some(value.as_str(name)?),
            "ssl-cert-name" => self.settings.ssl_cert_name = Some(value.as_str(name)?),
            "x-reconnect-on-limit-exceeded" => {
                self.reconnect_on_limit_exceeded = value.as_bool(name)?;
            }
            _ => return Err(ConfigError::InvalidOption(name.to_owned())),
        }
        Ok(())
    }

    fn seconds(name: &str, value: &OptionValue) -> Result<u64, ConfigError> {
        let secs = value.as_int(name)?;
        u64::try_from(secs).map_err(|_| ConfigError::InvalidValue {
            option: name.to_owned(),
            reason: "interval must not be negative".into(),
        })
    }

    fn unsigned(name: &str, value: &OptionValue) -> Result<u32, ConfigError> {
        let raw = value.as_int(name)?;
        u32::try_from(raw).map_err(|_| ConfigError::InvalidValue {
            option: name.to_owned(),
            reason: "value must not be negative".into(),
        })
    }
}

/// Insert `url` unless already present, preserving insertion order.
fn merge_url(url: String, urls: &mut Vec<String>) {
    if !urls.contains(&url) {
        urls.push(url);
    }
}

/// Failure while resuming one session after a reconnect.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ResumeError {
    /// The transport died mid-resume; the whole cycle restarts.
    #[error("transport failed during resume: {0}")]
    Transport(#[from] std::io::Error),
    /// The broker refused the session for capacity reasons.
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),
    /// The broker refused the attach outright.
    #[error("session attach rejected ({0:?})")]
    Rejected(DetachCode),
}

/// One live broker connection from the client's point of view.
#[async_trait]
pub trait BrokerLink: Send {
    /// Broker URLs advertised in `connection.open-ok`.
    fn known_hosts(&self) -> Vec<String>;

    /// Re-attach the named session on this connection.
    ///
    /// # Errors
    ///
    /// Returns a [`ResumeError`] when the broker refuses or the transport
    /// dies.
    async fn resume_session(&mut self, name: &SessionName) -> Result<(), ResumeError>;
}

/// Capability to establish one broker connection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `url` and complete the protocol handshake.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O failure when the broker is unreachable or
    /// rejects the negotiation.
    async fn connect(
        &self,
        url: &str,
        settings: &ConnectionSettings,
    ) -> std::io::Result<Box<dyn BrokerLink>>;
}

/// Mirror of one client session used across reconnects.
#[derive(Debug)]
pub struct SessionMirror {
    name: SessionName,
    transactional: bool,
    tx_open: bool,
    rolled_back: bool,
}

impl SessionMirror {
    fn new(name: SessionName, transactional: bool) -> Self {
        Self {
            name,
            transactional,
            tx_open: false,
            rolled_back: false,
        }
    }

    /// Session name.
    #[must_use]
    pub fn name(&self) -> &SessionName { &self.name }

    /// Record transactional work staged on this session.
    pub fn stage_work(&mut self) {
        if self.transactional {
            self.tx_open = true;
        }
    }

    /// Commit the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::RolledBack`] exactly once after a
    /// failover discarded staged work; the next commit succeeds.
    pub fn commit(&mut self) -> Result<(), TransactionError> {
        if self.rolled_back {
            self.rolled_back = false;
            self.tx_open = false;
            return Err(TransactionError::RolledBack);
        }
        self.tx_open = false;
        Ok(())
    }
}

/// Reconnecting client connection controller.
pub struct ReconnectController<C> {
    connector: C,
    options: ConnectionOptions,
    urls: Vec<String>,
    retries: u32,
    sessions: Vec<SessionMirror>,
    link: Option<Box<dyn BrokerLink>>,
}

impl<C: Connector> ReconnectController<C> {
    /// Create a controller for `url` with the supplied options.
    #[must_use]
    pub fn new(url: impl Into<String>, options: ConnectionOptions, connector: C) -> Self {
        let mut urls = vec![url.into()];
        for extra in &options.urls {
            merge_url(extra.clone(), &mut urls);
        }
        Self {
            connector,
            options,
            urls,
            retries: 0,
            sessions: Vec::new(),
            link: None,
        }
    }

    /// The current URL set, in attempt order.
    #[must_use]
    pub fn urls(&self) -> &[String] { &self.urls }

    /// True while a broker connection is established.
    #[must_use]
    pub fn is_open(&self) -> bool { self.link.is_some() }

    /// Register a session to be re-attached after every reconnect.
    pub fn add_session(&mut self, name: impl Into<SessionName>, transactional: bool) {
        self.sessions.push(SessionMirror::new(name.into(), transactional));
    }

    /// Mutable access to a registered session mirror.
    pub fn session_mut(&mut self, name: &SessionName) -> Option<&mut SessionMirror> {
        self.sessions.iter_mut().find(|s| s.name() == name)
    }

    /// The transport died; drop the link and mark open transactions.
    pub fn on_transport_failure(&mut self) {
        self.link = None;
        for session in &mut self.sessions {
            if session.tx_open {
                session.rolled_back = true;
            }
        }
    }

    /// Establish (or re-establish) the connection, honouring the reconnect
    /// policy.
    ///
    /// # Errors
    ///
    /// Returns a [`ReconnectError`] when reconnect is disabled, the attempt
    /// limit or timeout is exhausted, or the broker rejects a resume for
    /// capacity reasons with `x-reconnect-on-limit-exceeded` disabled.
    pub async fn open(&mut self) -> Result<(), ReconnectError> {
        if self.is_open() {
            return Ok(());
        }
        let started = Instant::now();
        let mut interval = self.options.min_interval;
        loop {
            if self.try_connect().await? {
                self.retries = 0;
                return Ok(());
            }
            if !self.options.reconnect {
                return Err(ReconnectError::Disabled);
            }
            if let Some(limit) = self.options.limit {
                if self.retries >= limit {
                    return Err(ReconnectError::LimitExceeded { limit });
                }
                self.retries += 1;
            }
            if let Some(timeout) = self.options.timeout {
                if started.elapsed() >= timeout {
                    return Err(ReconnectError::TimedOut);
                }
            }
            debug!("reconnect attempt failed; sleeping {interval:?}");
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(self.options.max_interval);
        }
    }

    /// One pass over the URL set.
    async fn try_connect(&mut self) -> Result<bool, ReconnectError> {
        for url in self.urls.clone() {
            info!("trying to connect to {url}...");
            match self.connector.connect(&url, &self.options.settings).await {
                Ok(link) => {
                    info!("connected to {url}");
                    for host in link.known_hosts() {
                        merge_url(host, &mut self.urls);
                    }
                    self.link = Some(link);
                    return self.reset_sessions().await;
                }
                Err(error) => {
                    info!("failed to connect to {url}: {error}");
                }
            }
        }
        Ok(false)
    }

    /// Re-attach every registered session on the fresh connection.
    async fn reset_sessions(&mut self) -> Result<bool, ReconnectError> {
        let Some(mut link) = self.link.take() else {
            return Ok(false);
        };
        for session in &mut self.sessions {
            // The channel the session lived on is gone; staged
            // transactional work did not survive it.
            if session.tx_open {
                session.rolled_back = true;
            }
            match link.resume_session(&session.name).await {
                Ok(()) => {}
                Err(ResumeError::Transport(error)) => {
                    debug!("connection failed while re-initialising sessions: {error}");
                    return Ok(false);
                }
                Err(ResumeError::ResourceLimitExceeded(reason)) => {
                    if self.options.reconnect_on_limit_exceeded {
                        debug!("detaching and reconnecting due to: {reason}");
                        return Ok(false);
                    }
                    return Err(ReconnectError::CapacityExceeded(reason));
                }
                Err(ResumeError::Rejected(code)) => {
                    debug!("session resume rejected ({code:?})");
                    return Ok(false);
                }
            }
        }
        self.link = Some(link);
        Ok(true)
    }
}

/// TCP connector speaking the reference wire codec.
///
/// Completes the header exchange and the start/tune/open negotiation, then
/// resumes sessions with `session.attach`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        url: &str,
        settings: &ConnectionSettings,
    ) -> std::io::Result<Box<dyn BrokerLink>> {
        let stream = TcpStream::connect(url).await?;
        if let Some(nodelay) = settings.tcp_nodelay {
            stream.set_nodelay(nodelay)?;
        }
        let link = negotiate_link(stream, settings).await?;
        Ok(Box::new(link))
    }
}

/// Drive the client side of the connection negotiation.
async fn negotiate_link(
    mut stream: TcpStream,
    settings: &ConnectionSettings,
) -> std::io::Result<TcpLink> {
    handshake::write_header(&mut stream, ProtocolHeader::AMQP_0_10)
        .await
        .map_err(io_error)?;
    let header = handshake::read_header(&mut stream).await.map_err(io_error)?;
    header
        .negotiate(ProtocolHeader::AMQP_0_10)
        .map_err(io_error)?;

    let max_frame = settings.max_frame_size.unwrap_or(65_536);
    let mut framed = Framed::new(stream, WireCodec::new(max_frame as usize));
    let mut known_hosts = Vec::new();
    loop {
        let frame = next_method(&mut framed).await?;
        match frame {
            Method::Connection(ConnectionMethod::Start { mechanisms, .. }) => {
                let (mechanism, response) = sasl_response(settings, &mechanisms)?;
                send_method(
                    &mut framed,
                    Method::Connection(ConnectionMethod::StartOk {
                        client_properties: Vec::new(),
                        mechanism,
                        response,
                        locale: settings.locale.clone().unwrap_or_else(|| "en_US".into()),
                    }),
                )
                .await?;
            }
            Method::Connection(ConnectionMethod::Tune {
                channel_max,
                max_frame_size,
                heartbeat_max,
            }) => {
                send_method(
                    &mut framed,
                    Method::Connection(ConnectionMethod::TuneOk {
                        channel_max: settings.max_channels.unwrap_or(channel_max),
                        max_frame_size: settings.max_frame_size.unwrap_or(max_frame_size),
                        heartbeat: settings.heartbeat.unwrap_or(0).min(heartbeat_max),
                    }),
                )
                .await?;
                send_method(
                    &mut framed,
                    Method::Connection(ConnectionMethod::Open {
                        virtual_host: String::new(),
                    }),
                )
                .await?;
            }
            Method::Connection(ConnectionMethod::OpenOk { known_hosts: hosts }) => {
                known_hosts = hosts;
                break;
            }
            Method::Connection(ConnectionMethod::Close { reply_text, .. }) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    reply_text,
                ));
            }
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected {} during negotiation", other.code().name()),
                ));
            }
        }
    }
    Ok(TcpLink {
        framed,
        known_hosts,
        next_channel: 1,
    })
}

fn sasl_response(
    settings: &ConnectionSettings,
    offered: &[String],
) -> std::io::Result<(String, Vec<u8>)> {
    let wanted = settings.mechanism.clone().unwrap_or_else(|| {
        if settings.username.is_some() {
            "PLAIN".to_owned()
        } else {
            "ANONYMOUS".to_owned()
        }
    });
    if !offered.iter().any(|m| *m == wanted) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("broker does not offer SASL mechanism {wanted}"),
        ));
    }
    let response = if wanted == "PLAIN" {
        let user = settings.username.clone().unwrap_or_default();
        let pass = settings.password.clone().unwrap_or_default();
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(user.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(pass.as_bytes());
        bytes
    } else {
        Vec::new()
    };
    Ok((wanted, response))
}

fn io_error(err: HandshakeError) -> std::io::Error {
    match err {
        HandshakeError::Io(inner) => inner,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
    }
}

async fn next_method(framed: &mut Framed<TcpStream, WireCodec>) -> std::io::Result<Method> {
    loop {
        let frame = framed
            .next()
            .await
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?
            .map_err(std::io::Error::from)?;
        if let Some((method, _)) = frame.as_method() {
            return Ok(method.clone());
        }
        // Heartbeats and stray content are not interesting here.
    }
}

async fn send_method(
    framed: &mut Framed<TcpStream, WireCodec>,
    method: Method,
) -> std::io::Result<()> {
    framed
        .send(Frame::method(0, method))
        .await
        .map_err(std::io::Error::from)
}

/// A negotiated TCP connection.
pub struct TcpLink {
    framed: Framed<TcpStream, WireCodec>,
    known_hosts: Vec<String>,
    next_channel: u16,
}

#[async_trait]
impl BrokerLink for TcpLink {
    fn known_hosts(&self) -> Vec<String> { self.known_hosts.clone() }

    async fn resume_session(&mut self, name: &SessionName) -> Result<(), ResumeError> {
        let channel = self.next_channel;
        self.next_channel += 1;
        self.framed
            .send(Frame::method(
                channel,
                Method::Session(SessionMethod::Attach {
                    name: name.as_bytes().to_vec(),
                    force: false,
                }),
            ))
            .await
            .map_err(std::io::Error::from)?;
        loop {
            let frame = self
                .framed
                .next()
                .await
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?
                .map_err(std::io::Error::from)?;
            match frame.as_method() {
                Some((Method::Session(SessionMethod::Attached { .. }), _)) => return Ok(()),
                Some((Method::Session(SessionMethod::Detached { code, .. }), _)) => {
                    return Err(ResumeError::Rejected(*code));
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_option_fails_open() {
        let mut options = ConnectionOptions::default();
        let err = options
            .set("frobnicate", &OptionValue::Bool(true))
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidOption("frobnicate".to_owned()));
    }

    #[test]
    fn underscore_spellings_are_aliases() {
        let mut options = ConnectionOptions::default();
        options
            .set("reconnect_interval_min", &OptionValue::Int(5))
            .expect("alias accepted");
        assert_eq!(options.min_interval, Duration::from_secs(5));
    }

    #[test]
    fn reconnect_urls_merge_without_duplicates() {
        let mut options = ConnectionOptions::default();
        options
            .set(
                "reconnect-urls",
                &OptionValue::List(vec!["b:5672".into(), "a:5672".into(), "b:5672".into()]),
            )
            .expect("urls accepted");
        assert_eq!(options.urls, vec!["b:5672".to_owned(), "a:5672".to_owned()]);
    }

    #[test]
    fn replace_urls_clears_previous_set() {
        let mut options = ConnectionOptions::default();
        options
            .set("reconnect-urls", &OptionValue::Str("a:5672".into()))
            .expect("urls");
        options
            .set("reconnect-urls-replace", &OptionValue::Bool(true))
            .expect("replace");
        options
            .set("reconnect-urls", &OptionValue::Str("c:5672".into()))
            .expect("urls");
        assert_eq!(options.urls, vec!["c:5672".to_owned()]);
    }

    #[test]
    fn commit_after_failover_rolls_back_once() {
        let mut session = SessionMirror::new(SessionName::from("tx"), true);
        session.stage_work();
        session.rolled_back = true;
        assert_eq!(session.commit(), Err(TransactionError::RolledBack));
        session.stage_work();
        assert_eq!(session.commit(), Ok(()));
    }
}
