//! Channel multiplexing.
//!
//! The mux owns the channel table: it routes inbound frames to the resident
//! [`SessionHandler`], enforces the negotiated channel ceiling and the
//! one-session-per-connection invariant, and converts session-scoped
//! failures into channel-scoped error replies. A channel is removed from
//! the table the moment its `channel.close` is emitted.

use std::collections::HashMap;

use log::warn;

use crate::{
    error::{ConnectionException, SessionException},
    frame::Frame,
    method::{ChannelMethod, Method, SessionMethod},
    session::{SessionName, handler::{SessionEnv, SessionHandler}},
};

/// Reply code used on `channel.close` for channel-scoped errors.
const CHANNEL_ERROR_CODE: u16 = 504;

/// The per-connection channel table and frame router.
pub struct ChannelMux {
    channels: HashMap<u16, SessionHandler>,
    channel_max: u16,
}

impl ChannelMux {
    /// Create an empty table bounded by `channel_max`.
    #[must_use]
    pub fn new(channel_max: u16) -> Self {
        Self {
            channels: HashMap::new(),
            channel_max,
        }
    }

    /// Tighten the ceiling after tune negotiation.
    pub fn set_channel_max(&mut self, channel_max: u16) { self.channel_max = channel_max; }

    /// Number of live channels.
    #[must_use]
    pub fn len(&self) -> usize { self.channels.len() }

    /// True when no channels are open.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.channels.is_empty() }

    /// Find the handler carrying the session named `name`.
    pub fn session_handler_mut(&mut self, name: &SessionName) -> Option<&mut SessionHandler> {
        self.channels
            .values_mut()
            .find(|handler| handler.session_name().as_ref() == Some(name))
    }

    /// Iterate the handlers of every live channel.
    pub fn handlers_mut(&mut self) -> impl Iterator<Item = &mut SessionHandler> {
        self.channels.values_mut()
    }

    /// Route one inbound non-zero-channel frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionException`] only for connection-fatal
    /// violations (channel ceiling); everything session- or channel-scoped
    /// is answered on the wire and absorbed here.
    pub fn route(
        &mut self,
        frame: Frame,
        env: &SessionEnv,
        out: &mut Vec<Frame>,
    ) -> Result<(), ConnectionException> {
        let channel = frame.channel;
        if channel >= self.channel_max {
            return Err(ConnectionException::ChannelLimit {
                channel,
                max: self.channel_max,
            });
        }

        // Channel-class controls terminate here rather than in a session.
        if let Some((Method::Channel(control), _)) = frame.as_method() {
            match control {
                ChannelMethod::Close { reply_code, reply_text } => {
                    warn!("channel {channel} closed by peer ({reply_code}): {reply_text}");
                    if let Some(mut handler) = self.channels.remove(&channel) {
                        handler.close(out);
                    }
                    out.push(Frame::method(channel, Method::Channel(ChannelMethod::CloseOk)));
                }
                ChannelMethod::CloseOk => {
                    self.channels.remove(&channel);
                }
            }
            return Ok(());
        }

        // The one-session-per-connection invariant: an attach for a name
        // resident on another channel is refused busy.
        let attach_name = match frame.as_method() {
            Some((Method::Session(SessionMethod::Attach { name, .. }), _)) => {
                Some(SessionName::new(name.clone()))
            }
            _ => None,
        };
        if let Some(name) = attach_name {
            let elsewhere = self
                .session_handler_mut(&name)
                .map(|handler| handler.channel())
                .filter(|holder| *holder != channel);
            if let Some(holder) = elsewhere {
                warn!("{name}: attach on channel {channel} refused; already on channel {holder}");
                out.push(Frame::method(
                    channel,
                    Method::Session(SessionMethod::Detached {
                        name: name.as_bytes().to_vec(),
                        code: crate::error::DetachCode::SessionBusy,
                    }),
                ));
                return Ok(());
            }
            let handler = self
                .channels
                .entry(channel)
                .or_insert_with(|| SessionHandler::new(channel));
            let result = handler.handle_in(frame, env, out);
            return self.absorb(result, channel, out);
        }

        let Some(handler) = self.channels.get_mut(&channel) else {
            warn!("frame for channel {channel} with no session");
            out.push(Frame::method(
                channel,
                Method::Channel(ChannelMethod::Close {
                    reply_code: CHANNEL_ERROR_CODE,
                    reply_text: format!("no session on channel {channel}"),
                }),
            ));
            return Ok(());
        };
        let result = handler.handle_in(frame, env, out);
        self.absorb(result, channel, out)
    }

    /// Convert a session exception into a channel-scoped close.
    fn absorb(
        &mut self,
        result: Result<(), SessionException>,
        channel: u16,
        out: &mut Vec<Frame>,
    ) -> Result<(), ConnectionException> {
        if let Err(exception) = result {
            warn!("channel {channel}: {exception}");
            if let Some(mut handler) = self.channels.remove(&channel) {
                handler.abort();
            }
            out.push(Frame::method(
                channel,
                Method::Channel(ChannelMethod::Close {
                    reply_code: CHANNEL_ERROR_CODE,
                    reply_text: exception.to_string(),
                }),
            ));
        }
        Ok(())
    }

    /// Orderly teardown at connection close: sessions emit final state.
    pub fn close_all(&mut self, out: &mut Vec<Frame>) {
        for (_, mut handler) in self.channels.drain() {
            handler.close(out);
        }
    }

    /// Transport failure: destroy sessions, send nothing.
    pub fn abort_all(&mut self) {
        for (_, mut handler) in self.channels.drain() {
            handler.abort();
        }
    }
}

/// Validator ensuring outbound framesets are never interleaved per channel.
///
/// Interleaving across channels is allowed and expected; within one channel
/// a frameset must finish before the next command's frames begin.
#[derive(Debug, Default)]
pub struct OutboundSerialiser {
    open: std::collections::HashSet<u16>,
}

impl OutboundSerialiser {
    /// Create a serialiser with no open framesets.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Admit one outbound frame, tracking frameset boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionException::Internal`] when a frame would
    /// interleave with an unfinished frameset on the same channel.
    pub fn admit(&mut self, frame: &Frame) -> Result<(), ConnectionException> {
        let in_frameset = self.open.contains(&frame.channel);
        if frame.flags.bos {
            if in_frameset {
                return Err(ConnectionException::Internal(format!(
                    "frameset interleaving on channel {}",
                    frame.channel
                )));
            }
            if !frame.flags.eos {
                self.open.insert(frame.channel);
            }
            return Ok(());
        }
        if !in_frameset {
            return Err(ConnectionException::Internal(format!(
                "continuation frame outside a frameset on channel {}",
                frame.channel
            )));
        }
        if frame.flags.eos {
            self.open.remove(&frame.channel);
        }
        Ok(())
    }
}
