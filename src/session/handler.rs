//! Per-channel binding between the transport and a session.
//!
//! A `SessionHandler` lives in the channel table for the lifetime of its
//! channel. It owns at most one [`SessionState`], performs the
//! attach/detach/resume choreography, and routes frames between the wire
//! and the state machine. Once a close has been initiated the handler
//! ignores inbound frames until the peer's `session.detached` (or a fresh
//! `session.attached`) resets the flag.

use std::sync::Arc;

use log::{debug, warn};

use crate::{
    error::{DetachCode, SessionException},
    flow::FlowConfig,
    frame::{Frame, Track},
    method::{Method, SessionMethod},
    sequence::SequenceNumber,
    session::{SessionConfig, SessionName, SessionRegistry, SessionState, WakeupSender},
    sink::MessageSink,
};

/// Shared collaborators a handler needs to service its channel.
#[derive(Clone)]
pub struct SessionEnv {
    /// Tunables applied to newly created sessions.
    pub config: SessionConfig,
    /// Producer flow control, when enabled for this broker.
    pub flow: Option<FlowConfig>,
    /// Wakeup sender for this connection's I/O task.
    pub wakeups: WakeupSender,
    /// Registry of detached sessions available for resume.
    pub registry: Arc<SessionRegistry>,
    /// Message layer receiving assembled transfers.
    pub sink: Arc<dyn MessageSink>,
}

/// Binding of one channel to at most one session.
pub struct SessionHandler {
    channel: u16,
    session: Option<SessionState>,
    ignoring: bool,
}

impl SessionHandler {
    /// Create the handler for `channel`.
    #[must_use]
    pub fn new(channel: u16) -> Self {
        Self {
            channel,
            session: None,
            ignoring: false,
        }
    }

    /// Channel this handler serves.
    #[must_use]
    pub const fn channel(&self) -> u16 { self.channel }

    /// The resident session, if one is attached.
    #[must_use]
    pub fn session(&self) -> Option<&SessionState> { self.session.as_ref() }

    /// Mutable access to the resident session.
    pub fn session_mut(&mut self) -> Option<&mut SessionState> { self.session.as_mut() }

    /// Name of the resident session, if any.
    #[must_use]
    pub fn session_name(&self) -> Option<SessionName> {
        self.session.as_ref().map(|s| s.name().clone())
    }

    /// Bind a session to this channel, resuming a detached one by name.
    ///
    /// Attach is idempotent by name: re-attaching the resident session only
    /// re-announces it. A resumed session replays its unacknowledged
    /// sender-side commands after the announcement.
    pub fn attach(&mut self, name: SessionName, env: &SessionEnv, out: &mut Vec<Frame>) {
        self.ignoring = false;
        if let Some(session) = &self.session {
            if *session.name() == name {
                debug!("{name}: attach is idempotent; re-announcing");
                out.push(Frame::method(
                    self.channel,
                    Method::Session(SessionMethod::Attached {
                        name: name.as_bytes().to_vec(),
                    }),
                ));
                return;
            }
            warn!(
                "{name}: channel {} already carries session {}",
                self.channel,
                session.name()
            );
            out.push(Frame::method(
                self.channel,
                Method::Session(SessionMethod::Detached {
                    name: name.as_bytes().to_vec(),
                    code: DetachCode::SessionBusy,
                }),
            ));
            return;
        }

        if let Some(mut session) = env.registry.take(&name) {
            debug!("{name}: resumed on channel {}", self.channel);
            session.rebind_wakeups(env.wakeups.clone());
            session.attach(self.channel);
            out.push(Frame::method(
                self.channel,
                Method::Session(SessionMethod::Attached {
                    name: name.as_bytes().to_vec(),
                }),
            ));
            out.extend(session.replay_after_resume());
            self.session = Some(session);
            return;
        }

        let mut session = SessionState::new(name.clone(), env.config, env.flow, env.wakeups.clone());
        session.attach(self.channel);
        out.push(Frame::method(
            self.channel,
            Method::Session(SessionMethod::Attached {
                name: name.as_bytes().to_vec(),
            }),
        ));
        out.push(Frame::method(
            self.channel,
            Method::Session(SessionMethod::CommandPoint {
                command_id: SequenceNumber::ZERO,
                command_offset: 0,
            }),
        ));
        session.ready_to_send(out);
        self.session = Some(session);
    }

    /// Detach the resident session, parking it for a later resume unless a
    /// zero-timeout request marked it for destruction. Repeated detach of an
    /// absent session is a no-op beyond the `not-attached` reply.
    pub fn detach(&mut self, name: &SessionName, env: &SessionEnv, out: &mut Vec<Frame>) {
        let Some(mut session) = self.session.take() else {
            out.push(Frame::method(
                self.channel,
                Method::Session(SessionMethod::Detached {
                    name: name.as_bytes().to_vec(),
                    code: DetachCode::NotAttached,
                }),
            ));
            return;
        };
        if session.close_on_detach() {
            session.close(out);
        } else {
            session.detach();
            env.registry.park(session);
        }
        out.push(Frame::method(
            self.channel,
            Method::Session(SessionMethod::Detached {
                name: name.as_bytes().to_vec(),
                code: DetachCode::Normal,
            }),
        ));
    }

    /// Close the resident session for good, emitting final completion state.
    ///
    /// Used at orderly connection shutdown; repeated close is a no-op.
    pub fn close(&mut self, out: &mut Vec<Frame>) {
        if let Some(mut session) = self.session.take() {
            session.close(out);
        }
        self.ignoring = true;
    }

    /// Destroy the resident session without emitting anything.
    ///
    /// Used on transport failure; blocks until in-flight completion
    /// callbacks have quiesced.
    pub fn abort(&mut self) {
        if let Some(mut session) = self.session.take() {
            let mut discard = Vec::new();
            session.close(&mut discard);
        }
    }

    /// Route one inbound frame for this channel.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionException`] for violations that must detach the
    /// session; the caller owns the error reply.
    pub fn handle_in(
        &mut self,
        frame: Frame,
        env: &SessionEnv,
        out: &mut Vec<Frame>,
    ) -> Result<(), SessionException> {
        if self.ignoring && !Self::resets_ignoring(&frame) {
            return Ok(());
        }

        if frame.track == Track::Control {
            if let Some((Method::Session(control), _)) = frame.as_method() {
                let control = control.clone();
                return self.handle_control(control, env, out);
            }
            // Non-session controls never reach a channel handler.
            return Err(SessionException::Frameset(
                "unexpected control frame on a session channel".into(),
            ));
        }

        let session = self.session.as_mut().ok_or(SessionException::NotAttached)?;
        session.handle_in(frame, env.sink.as_ref(), out)?;
        // Fold any completions the sink delivered inline.
        session.drain_completions(out);
        Ok(())
    }

    fn resets_ignoring(frame: &Frame) -> bool {
        matches!(
            frame.as_method(),
            Some((
                Method::Session(SessionMethod::Attached { .. } | SessionMethod::Detached { .. }),
                _
            ))
        )
    }

    fn handle_control(
        &mut self,
        control: SessionMethod,
        env: &SessionEnv,
        out: &mut Vec<Frame>,
    ) -> Result<(), SessionException> {
        match control {
            SessionMethod::Attach { name, force: _ } => {
                self.attach(SessionName::new(name), env, out);
                Ok(())
            }
            SessionMethod::Detach { name } => {
                self.detach(&SessionName::new(name), env, out);
                Ok(())
            }
            SessionMethod::Attached { .. } => {
                self.ignoring = false;
                Ok(())
            }
            SessionMethod::Detached { name, code } => {
                debug!(
                    "{}: peer detached (code {code:?})",
                    SessionName::new(name)
                );
                self.ignoring = false;
                if let Some(mut session) = self.session.take() {
                    session.detach();
                    env.registry.park(session);
                }
                Ok(())
            }
            SessionMethod::RequestTimeout { timeout } => {
                let session = self.session.as_mut().ok_or(SessionException::NotAttached)?;
                session.request_timeout(timeout, out);
                Ok(())
            }
            SessionMethod::Timeout { .. } | SessionMethod::Expected { .. } => Ok(()),
            SessionMethod::CommandPoint {
                command_id,
                command_offset,
            } => {
                let session = self.session.as_mut().ok_or(SessionException::NotAttached)?;
                session.command_point(command_id, command_offset);
                Ok(())
            }
            SessionMethod::Completed {
                commands,
                timely_reply,
            } => {
                let session = self.session.as_mut().ok_or(SessionException::NotAttached)?;
                session.peer_completed(&commands, timely_reply, out);
                Ok(())
            }
            SessionMethod::KnownCompleted { commands } => {
                let session = self.session.as_mut().ok_or(SessionException::NotAttached)?;
                session.known_completed(&commands);
                Ok(())
            }
            SessionMethod::Flush {
                expected,
                confirmed,
                completed,
            } => {
                let session = self.session.as_mut().ok_or(SessionException::NotAttached)?;
                session.flush(expected, confirmed, completed, out);
                Ok(())
            }
        }
    }
}
