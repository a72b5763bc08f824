//! The frame contract shared by both peers.
//!
//! A [`Frame`] is the unit multiplexed onto channels: a segment type, the
//! four frameset flags, a track and a typed body. One message travels as a
//! *frameset* — a method segment, a header segment and any number of content
//! segments — with BOF set on the first frame and EOF on the last frame of
//! each segment, and BOS/EOS bracketing the message as a whole. A
//! non-content method occupies a single frame with all four flags set.

use bincode::{Decode, Encode};

use crate::method::{Method, MethodCode};

/// Segment types a frame can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentType {
    Method,
    Header,
    Content,
    Heartbeat,
}

/// Track a frame travels on.
///
/// Controls (connection, channel and session classes) use the control track
/// and consume no command id; commands (execution and message classes) use
/// the command track and are numbered per session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Track {
    Control,
    Command,
}

/// Frameset boundary flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct FrameFlags {
    /// Beginning of frame(set segment).
    pub bof: bool,
    /// End of frame(set segment).
    pub eof: bool,
    /// Beginning of the whole message.
    pub bos: bool,
    /// End of the whole message.
    pub eos: bool,
}

impl FrameFlags {
    /// Flags for a frame that is an entire frameset by itself.
    pub const COMPLETE: Self = Self {
        bof: true,
        eof: true,
        bos: true,
        eos: true,
    };
}

/// Typed frame payloads.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum FrameBody {
    /// A method segment; `sync` mirrors the method's sync bit.
    Method { sync: bool, method: Method },
    /// The header segment of a content frameset.
    Header(MessageHeader),
    /// One content segment of a content frameset.
    Content(Vec<u8>),
    /// Connection liveness probe; never enters a session.
    Heartbeat,
}

/// Typed descriptor for the header segment of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct MessageHeader {
    /// Total content length of the message body in bytes.
    pub content_length: u64,
}

/// One frame on the wire.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct Frame {
    /// Channel the frame is multiplexed onto.
    pub channel: u16,
    /// Control or command track.
    pub track: Track,
    /// Frameset boundary flags.
    pub flags: FrameFlags,
    /// Typed payload.
    pub body: FrameBody,
}

impl Frame {
    /// Build a complete single-frame method frameset.
    ///
    /// # Examples
    ///
    /// ```
    /// use amqwire::{Frame, FrameFlags, Method, method::ExecutionMethod};
    ///
    /// let frame = Frame::method(1, Method::Execution(ExecutionMethod::Sync));
    /// assert_eq!(frame.flags, FrameFlags::COMPLETE);
    /// ```
    #[must_use]
    pub fn method(channel: u16, method: Method) -> Self {
        Self::method_sync(channel, method, false)
    }

    /// Build a complete single-frame method frameset with the sync bit set.
    #[must_use]
    pub fn method_sync(channel: u16, method: Method, sync: bool) -> Self {
        let track = if method.is_control() {
            Track::Control
        } else {
            Track::Command
        };
        Self {
            channel,
            track,
            flags: FrameFlags::COMPLETE,
            body: FrameBody::Method { sync, method },
        }
    }

    /// Build the opening method frame of a content frameset.
    #[must_use]
    pub fn transfer_open(channel: u16, method: Method, sync: bool) -> Self {
        Self {
            channel,
            track: Track::Command,
            flags: FrameFlags {
                bof: true,
                eof: false,
                bos: true,
                eos: false,
            },
            body: FrameBody::Method { sync, method },
        }
    }

    /// Build the header frame of a content frameset.
    #[must_use]
    pub fn header(channel: u16, header: MessageHeader) -> Self {
        Self {
            channel,
            track: Track::Command,
            flags: FrameFlags {
                bof: true,
                eof: false,
                bos: false,
                eos: false,
            },
            body: FrameBody::Header(header),
        }
    }

    /// Build a content frame; `last` marks the end of the frameset.
    #[must_use]
    pub fn content(channel: u16, payload: Vec<u8>, last: bool) -> Self {
        Self {
            channel,
            track: Track::Command,
            flags: FrameFlags {
                bof: true,
                eof: last,
                bos: false,
                eos: last,
            },
            body: FrameBody::Content(payload),
        }
    }

    /// Build a heartbeat frame (always channel 0).
    #[must_use]
    pub fn heartbeat() -> Self {
        Self {
            channel: 0,
            track: Track::Control,
            flags: FrameFlags::COMPLETE,
            body: FrameBody::Heartbeat,
        }
    }

    /// Segment type of the payload.
    #[must_use]
    pub const fn segment_type(&self) -> SegmentType {
        match self.body {
            FrameBody::Method { .. } => SegmentType::Method,
            FrameBody::Header(_) => SegmentType::Header,
            FrameBody::Content(_) => SegmentType::Content,
            FrameBody::Heartbeat => SegmentType::Heartbeat,
        }
    }

    /// Method carried by this frame, if it is a method frame.
    #[must_use]
    pub fn as_method(&self) -> Option<(&Method, bool)> {
        match &self.body {
            FrameBody::Method { method, sync } => Some((method, *sync)),
            _ => None,
        }
    }

    /// Dispatch code of the carried method, if any.
    #[must_use]
    pub fn method_code(&self) -> Option<MethodCode> {
        self.as_method().map(|(m, _)| m.code())
    }

    /// Approximate byte footprint, used for replay-buffer accounting.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        const FRAME_OVERHEAD: usize = 12;
        FRAME_OVERHEAD
            + match &self.body {
                FrameBody::Content(payload) => payload.len(),
                FrameBody::Method { .. } | FrameBody::Header(_) => 64,
                FrameBody::Heartbeat => 0,
            }
    }
}

#[cfg(test)]
mod tests {
    use crate::method::{ExecutionMethod, Method};

    use super::*;

    #[test]
    fn single_method_frame_is_a_complete_frameset() {
        let frame = Frame::method(3, Method::Execution(ExecutionMethod::Sync));
        assert_eq!(frame.flags, FrameFlags::COMPLETE);
        assert_eq!(frame.segment_type(), SegmentType::Method);
        assert_eq!(frame.track, Track::Command);
    }

    #[test]
    fn content_frameset_flags_bracket_the_message() {
        use crate::method::{AcceptMode, MessageMethod};

        let open = Frame::transfer_open(
            1,
            Method::Message(MessageMethod::Transfer {
                destination: "q".into(),
                accept_mode: AcceptMode::None,
            }),
            false,
        );
        assert!(open.flags.bof && open.flags.bos);
        assert!(!open.flags.eof && !open.flags.eos);

        let tail = Frame::content(1, vec![1, 2, 3], true);
        assert!(tail.flags.eof && tail.flags.eos);
    }
}
