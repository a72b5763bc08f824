//! Session machinery: per-channel handlers, session state, completion
//! tracking and the sender replay buffer.

pub mod handler;
pub mod incomplete;
pub mod replay;
pub mod state;

use std::{fmt, sync::Arc};

use tokio::sync::mpsc;

pub use handler::SessionHandler;
pub use incomplete::{CompletionHandle, IncompleteStore};
pub use replay::ReplayBuffer;
pub use state::SessionState;

/// The binary name identifying a session across attaches.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionName(Arc<[u8]>);

impl SessionName {
    /// Wrap raw name bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self { Self(Arc::from(bytes.into())) }

    /// Raw name bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] { &self.0 }
}

impl From<Vec<u8>> for SessionName {
    fn from(bytes: Vec<u8>) -> Self { Self::new(bytes) }
}

impl From<&str> for SessionName {
    fn from(name: &str) -> Self { Self::new(name.as_bytes().to_vec()) }
}

impl fmt::Debug for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionName({self})")
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(name) => f.write_str(name),
            Err(_) => {
                for byte in self.0.iter() {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Per-session tunables.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Byte budget for the sender replay buffer.
    pub replay_limit_bytes: usize,
    /// Ask the peer for a timely `known-completed` reply once this many
    /// completions are outstanding.
    pub ack_frequency: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            replay_limit_bytes: 1024 * 1024,
            ack_frequency: 64,
        }
    }
}

/// Work posted back to a connection's I/O task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// Completions were scheduled for the named session; drain them.
    Completions(SessionName),
    /// The flow controller asked for a credit retry on the named session.
    CreditRetry(SessionName),
}

/// Sender half used to post [`Wakeup`]s to the I/O task.
pub type WakeupSender = mpsc::UnboundedSender<Wakeup>;

/// Receiver half drained by the I/O task.
pub type WakeupReceiver = mpsc::UnboundedReceiver<Wakeup>;

/// Create the wakeup channel for one connection.
#[must_use]
pub fn wakeup_channel() -> (WakeupSender, WakeupReceiver) { mpsc::unbounded_channel() }

/// Concurrent registry of detached sessions awaiting a resume.
///
/// Sessions parked here survive a clean detach only; transport failure
/// destroys broker-side sessions instead of parking them.
#[derive(Default)]
pub struct SessionRegistry(dashmap::DashMap<SessionName, SessionState>);

impl SessionRegistry {
    /// Park a detached session under its name.
    pub fn park(&self, session: SessionState) {
        self.0.insert(session.name().clone(), session);
    }

    /// Take the detached session named `name`, if present.
    #[must_use]
    pub fn take(&self, name: &SessionName) -> Option<SessionState> {
        self.0.remove(name).map(|(_, session)| session)
    }

    /// True when a detached session with `name` exists.
    #[must_use]
    pub fn contains(&self, name: &SessionName) -> bool { self.0.contains_key(name) }

    /// Number of parked sessions.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// True when no sessions are parked.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}
