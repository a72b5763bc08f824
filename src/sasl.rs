//! Server-side SASL negotiation seam.
//!
//! The engine drives an opaque challenge/response exchange between
//! `connection.start-ok` and `connection.tune`; the mechanisms themselves
//! are pluggable. ANONYMOUS and PLAIN servers are provided. Cryptographic
//! strength is out of scope here: PLAIN delegates verification to a
//! caller-supplied checker.

use std::sync::Arc;

use thiserror::Error;

/// Failure inside a SASL exchange; closes the connection with
/// `CONNECTION_FORCED`.
#[derive(Debug, Error)]
#[error("{mechanism}: {reason}")]
pub struct SaslError {
    /// Mechanism that failed.
    pub mechanism: String,
    /// Human-readable failure detail.
    pub reason: String,
}

impl SaslError {
    fn new(mechanism: &str, reason: impl Into<String>) -> Self {
        Self {
            mechanism: mechanism.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Outcome of feeding one response to a mechanism.
#[derive(Debug)]
pub enum SaslOutcome {
    /// The exchange continues; send this challenge in `connection.secure`.
    Challenge(Vec<u8>),
    /// The exchange completed; the connection is authenticated.
    Complete {
        /// Authenticated principal.
        principal: String,
    },
}

/// One in-progress server-side mechanism exchange.
pub trait SaslServer: Send {
    /// Mechanism name as advertised in `connection.start`.
    fn mechanism(&self) -> &'static str;

    /// Feed the peer's response, producing a challenge or completion.
    ///
    /// # Errors
    ///
    /// Returns a [`SaslError`] when the response is malformed or the
    /// credentials are rejected; the engine never retries a failed exchange.
    fn respond(&mut self, response: &[u8]) -> Result<SaslOutcome, SaslError>;
}

/// Verifier invoked by the PLAIN mechanism.
pub type PlainChecker = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Capability struct listing the mechanisms a broker offers.
#[derive(Clone)]
pub struct Mechanisms {
    plain_checker: Option<PlainChecker>,
    allow_anonymous: bool,
}

impl Default for Mechanisms {
    fn default() -> Self {
        Self {
            plain_checker: None,
            allow_anonymous: true,
        }
    }
}

impl Mechanisms {
    /// Offer ANONYMOUS only.
    #[must_use]
    pub fn anonymous_only() -> Self { Self::default() }

    /// Offer PLAIN backed by `checker`, alongside ANONYMOUS.
    #[must_use]
    pub fn with_plain(checker: PlainChecker) -> Self {
        Self {
            plain_checker: Some(checker),
            allow_anonymous: true,
        }
    }

    /// Disable the ANONYMOUS mechanism.
    #[must_use]
    pub fn without_anonymous(mut self) -> Self {
        self.allow_anonymous = false;
        self
    }

    /// Mechanism names advertised in `connection.start`, strongest first.
    #[must_use]
    pub fn advertised(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.plain_checker.is_some() {
            names.push("PLAIN".to_owned());
        }
        if self.allow_anonymous {
            names.push("ANONYMOUS".to_owned());
        }
        names
    }

    /// Instantiate a server for `mechanism`, if offered.
    #[must_use]
    pub fn create(&self, mechanism: &str) -> Option<Box<dyn SaslServer>> {
        match mechanism {
            "ANONYMOUS" if self.allow_anonymous => Some(Box::new(Anonymous)),
            "PLAIN" => self
                .plain_checker
                .clone()
                .map(|checker| Box::new(Plain { checker }) as Box<dyn SaslServer>),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Mechanisms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mechanisms")
            .field("advertised", &self.advertised())
            .finish()
    }
}

struct Anonymous;

impl SaslServer for Anonymous {
    fn mechanism(&self) -> &'static str { "ANONYMOUS" }

    fn respond(&mut self, _response: &[u8]) -> Result<SaslOutcome, SaslError> {
        Ok(SaslOutcome::Complete {
            principal: "anonymous".to_owned(),
        })
    }
}

struct Plain {
    checker: PlainChecker,
}

impl SaslServer for Plain {
    fn mechanism(&self) -> &'static str { "PLAIN" }

    fn respond(&mut self, response: &[u8]) -> Result<SaslOutcome, SaslError> {
        // RFC 4616: [authzid] NUL authcid NUL passwd
        let mut parts = response.split(|b| *b == 0);
        let _authzid = parts
            .next()
            .ok_or_else(|| SaslError::new("PLAIN", "empty response"))?;
        let authcid = parts
            .next()
            .ok_or_else(|| SaslError::new("PLAIN", "missing authcid"))?;
        let passwd = parts
            .next()
            .ok_or_else(|| SaslError::new("PLAIN", "missing password"))?;
        if parts.next().is_some() {
            return Err(SaslError::new("PLAIN", "trailing fields in response"));
        }
        let user = std::str::from_utf8(authcid)
            .map_err(|_| SaslError::new("PLAIN", "authcid is not valid UTF-8"))?;
        let pass = std::str::from_utf8(passwd)
            .map_err(|_| SaslError::new("PLAIN", "password is not valid UTF-8"))?;
        if (self.checker)(user, pass) {
            Ok(SaslOutcome::Complete {
                principal: user.to_owned(),
            })
        } else {
            Err(SaslError::new("PLAIN", format!("authentication failed for {user}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest_only() -> Mechanisms {
        Mechanisms::with_plain(Arc::new(|user, pass| user == "guest" && pass == "guest"))
    }

    #[test]
    fn anonymous_completes_immediately() {
        let mut server = Mechanisms::default().create("ANONYMOUS").expect("mechanism");
        match server.respond(b"").expect("outcome") {
            SaslOutcome::Complete { principal } => assert_eq!(principal, "anonymous"),
            SaslOutcome::Challenge(_) => panic!("unexpected challenge"),
        }
    }

    #[test]
    fn plain_accepts_known_credentials() {
        let mut server = guest_only().create("PLAIN").expect("mechanism");
        match server.respond(b"\0guest\0guest").expect("outcome") {
            SaslOutcome::Complete { principal } => assert_eq!(principal, "guest"),
            SaslOutcome::Challenge(_) => panic!("unexpected challenge"),
        }
    }

    #[test]
    fn plain_rejects_bad_password() {
        let mut server = guest_only().create("PLAIN").expect("mechanism");
        assert!(server.respond(b"\0guest\0wrong").is_err());
    }

    #[test]
    fn unknown_mechanism_is_not_offered() {
        assert!(Mechanisms::default().create("GSSAPI").is_none());
        assert!(Mechanisms::default().create("PLAIN").is_none());
    }
}
