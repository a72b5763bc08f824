//! Sender-side replay buffer.
//!
//! Frames for every command this peer has sent but the remote has not yet
//! acknowledged as known-complete are retained here, so a resumed session
//! can re-emit them. The buffer is owned exclusively by its session; its
//! size is bounded by the session configuration's byte budget.

use std::collections::VecDeque;

use crate::{
    error::SessionException,
    frame::Frame,
    sequence::{SequenceNumber, SequenceSet},
};

#[derive(Debug)]
struct ReplayEntry {
    id: SequenceNumber,
    frames: Vec<Frame>,
    bytes: usize,
}

/// Bounded buffer of sent-but-unacknowledged command framesets.
#[derive(Debug)]
pub struct ReplayBuffer {
    entries: VecDeque<ReplayEntry>,
    bytes: usize,
    limit: usize,
}

impl ReplayBuffer {
    /// Create a buffer bounded to `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    /// Retain the frameset of command `id` for replay.
    ///
    /// # Errors
    ///
    /// Returns [`SessionException::ReplayOverflow`] when the byte budget
    /// would be exceeded.
    pub fn push(&mut self, id: SequenceNumber, frames: Vec<Frame>) -> Result<(), SessionException> {
        let bytes: usize = frames.iter().map(Frame::byte_size).sum();
        if self.bytes + bytes > self.limit {
            return Err(SessionException::ReplayOverflow {
                bytes: self.bytes + bytes,
                limit: self.limit,
            });
        }
        self.bytes += bytes;
        self.entries.push_back(ReplayEntry { id, frames, bytes });
        Ok(())
    }

    /// Release every command the peer has confirmed complete.
    pub fn release(&mut self, confirmed: &SequenceSet) {
        self.entries.retain(|entry| {
            if confirmed.contains(entry.id) {
                self.bytes -= entry.bytes;
                false
            } else {
                true
            }
        });
    }

    /// Clone the frames of every retained command, in command order.
    ///
    /// Used to re-emit unacknowledged work after a resume.
    #[must_use]
    pub fn replay_frames(&self) -> Vec<Frame> {
        self.entries
            .iter()
            .flat_map(|entry| entry.frames.iter().cloned())
            .collect()
    }

    /// Ids of every retained command.
    #[must_use]
    pub fn retained_ids(&self) -> SequenceSet {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    /// Bytes currently buffered.
    #[must_use]
    pub const fn bytes(&self) -> usize { self.bytes }

    /// Number of buffered commands.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{ExecutionMethod, Method};

    fn sync_frame() -> Frame { Frame::method(1, Method::Execution(ExecutionMethod::Sync)) }

    #[test]
    fn release_drops_confirmed_commands() {
        let mut buffer = ReplayBuffer::new(4096);
        buffer.push(SequenceNumber(0), vec![sync_frame()]).expect("push");
        buffer.push(SequenceNumber(1), vec![sync_frame()]).expect("push");
        buffer.push(SequenceNumber(2), vec![sync_frame()]).expect("push");

        buffer.release(&SequenceSet::of(SequenceNumber(1)));
        assert_eq!(buffer.len(), 2);
        let ids = buffer.retained_ids();
        assert!(ids.contains(SequenceNumber(0)) && ids.contains(SequenceNumber(2)));
    }

    #[test]
    fn byte_budget_is_enforced() {
        let mut buffer = ReplayBuffer::new(100);
        let big = Frame::content(1, vec![0u8; 200], true);
        let err = buffer.push(SequenceNumber(0), vec![big]).unwrap_err();
        assert!(matches!(err, SessionException::ReplayOverflow { .. }));
        assert!(buffer.is_empty());
    }

    #[test]
    fn replay_preserves_command_order() {
        let mut buffer = ReplayBuffer::new(4096);
        buffer.push(SequenceNumber(5), vec![sync_frame()]).expect("push");
        buffer
            .push(SequenceNumber(6), vec![sync_frame(), sync_frame()])
            .expect("push");
        assert_eq!(buffer.replay_frames().len(), 3);
        assert_eq!(buffer.bytes(), buffer.replay_frames().iter().map(Frame::byte_size).sum());
    }
}
