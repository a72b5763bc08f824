//! The per-session command state machine.
//!
//! `SessionState` numbers inbound commands, tracks receiver- and sender-side
//! completion sets, defers `execution.sync` barriers until their
//! predecessors complete, assembles content framesets, applies producer flow
//! control, and folds asynchronous sink completions back into command order.
//!
//! All methods run on the connection's I/O task; the only state shared with
//! other threads is the [`IncompleteStore`].

use std::{collections::VecDeque, sync::Arc};

use log::{debug, warn};
use tokio::time::{Duration, Instant};

use crate::{
    error::{ExecutionException, SessionException},
    flow::{FlowConfig, FlowController, FlowDecision},
    frame::{Frame, FrameBody, MessageHeader},
    method::{
        AcceptMode,
        CreditUnit,
        ExecutionMethod,
        FlowMode,
        Method,
        MessageMethod,
        SessionMethod,
    },
    sequence::{SequenceNumber, SequenceSet, SessionPoint},
    session::{
        SessionConfig,
        SessionName,
        WakeupSender,
        incomplete::{CompletedTransfer, IncompleteStore},
        replay::ReplayBuffer,
    },
    sink::{InboundMessage, MessageSink},
};

/// A content frameset being reassembled.
#[derive(Debug)]
struct InboundAssembly {
    command_id: SequenceNumber,
    destination: String,
    requires_accept: bool,
    sync: bool,
    header: MessageHeader,
    body: Vec<u8>,
}

/// Stateful core of one named session.
#[derive(Debug)]
pub struct SessionState {
    name: SessionName,
    config: SessionConfig,
    channel: u16,
    attached: bool,
    close_on_detach: bool,

    // Receiver direction: commands the peer sends us.
    receiver_next: SequenceNumber,
    receiver_incomplete: SequenceSet,
    completed_unacked: SequenceSet,
    accepted: SequenceSet,
    pending_syncs: VecDeque<SequenceNumber>,
    current_command_complete: bool,
    assembly: Option<InboundAssembly>,

    // Sender direction: commands we send the peer.
    command_point: SessionPoint,
    sender_incomplete: SequenceSet,
    replay: ReplayBuffer,

    // Client-mirror credit for the anonymous default destination.
    send_credit: u32,

    incomplete: Arc<IncompleteStore>,
    flow: Option<FlowController>,
    flow_stopped: bool,
    credit_retry: Option<Duration>,
}

impl SessionState {
    /// Create a fresh session named `name`.
    #[must_use]
    pub fn new(
        name: SessionName,
        config: SessionConfig,
        flow: Option<FlowConfig>,
        wakeups: WakeupSender,
    ) -> Self {
        let incomplete = IncompleteStore::new(name.clone(), wakeups);
        Self {
            name,
            config,
            channel: 0,
            attached: false,
            close_on_detach: false,
            receiver_next: SequenceNumber::ZERO,
            receiver_incomplete: SequenceSet::new(),
            completed_unacked: SequenceSet::new(),
            accepted: SequenceSet::new(),
            pending_syncs: VecDeque::new(),
            current_command_complete: true,
            assembly: None,
            command_point: SessionPoint::default(),
            sender_incomplete: SequenceSet::new(),
            replay: ReplayBuffer::new(config.replay_limit_bytes),
            send_credit: 0,
            incomplete,
            flow: flow.map(|cfg| FlowController::new(cfg, Instant::now())),
            flow_stopped: false,
            credit_retry: None,
        }
    }

    /// Session name.
    #[must_use]
    pub fn name(&self) -> &SessionName { &self.name }

    /// Channel currently carrying the session.
    #[must_use]
    pub const fn channel(&self) -> u16 { self.channel }

    /// True while bound to a channel.
    #[must_use]
    pub const fn is_attached(&self) -> bool { self.attached }

    /// True when a zero-timeout request marked the session for destruction.
    #[must_use]
    pub const fn close_on_detach(&self) -> bool { self.close_on_detach }

    /// Receiver-side commands not yet completed.
    #[must_use]
    pub fn receiver_incomplete(&self) -> &SequenceSet { &self.receiver_incomplete }

    /// Sender-side commands the peer has not confirmed complete.
    #[must_use]
    pub fn sender_incomplete(&self) -> &SequenceSet { &self.sender_incomplete }

    /// Inbound messages still awaiting asynchronous completion.
    #[must_use]
    pub fn incomplete_messages(&self) -> usize { self.incomplete.outstanding() }

    /// Re-point completion wakeups at a new connection after a resume.
    pub fn rebind_wakeups(&self, wakeups: WakeupSender) { self.incomplete.rebind(wakeups); }

    /// Bind to `channel` on the broker.
    pub fn attach(&mut self, channel: u16) {
        debug!("{}: attached on channel {channel}", self.name);
        self.channel = channel;
        self.attached = true;
        self.incomplete.set_attached(true);
    }

    /// Unbind from the transport, keeping session state for a resume.
    pub fn detach(&mut self) {
        debug!("{}: detached", self.name);
        self.attached = false;
        self.incomplete.set_attached(false);
    }

    /// Tear the session down: quiesce and cancel every in-flight completion.
    ///
    /// Blocks until no completion callback is executing on another thread.
    pub fn close(&mut self, out: &mut Vec<Frame>) {
        self.incomplete.cancel_all();
        self.credit_retry = None;
        if !self.completed_unacked.is_empty() {
            self.send_completion(out);
        }
        self.attached = false;
        self.incomplete.set_attached(false);
    }

    /// Announce readiness to the producer: flow mode plus initial credit.
    pub fn ready_to_send(&mut self, out: &mut Vec<Frame>) {
        if let Some(flow) = &mut self.flow {
            let credit = flow.initial_credit(Instant::now());
            debug!("{}: issuing initial producer credit {credit}", self.name);
            out.push(Frame::method(
                self.channel,
                Method::Message(MessageMethod::SetFlowMode {
                    destination: String::new(),
                    mode: FlowMode::Credit,
                }),
            ));
            out.push(Frame::method(
                self.channel,
                Method::Message(MessageMethod::Flow {
                    destination: String::new(),
                    unit: CreditUnit::Message,
                    value: credit,
                }),
            ));
        }
    }

    /// Handle one command-track frame in wire order.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionException`] only for violations that must detach
    /// the session; command-scoped failures are reported to the peer as
    /// `execution.exception` and do not surface here.
    pub fn handle_in(
        &mut self,
        frame: Frame,
        sink: &dyn MessageSink,
        out: &mut Vec<Frame>,
    ) -> Result<(), SessionException> {
        match frame.body {
            FrameBody::Method { sync, ref method } if method.is_content_bearing() => {
                let id = self.begin_command();
                self.admit_message(out);
                let Method::Message(MessageMethod::Transfer {
                    destination,
                    accept_mode,
                }) = method.clone()
                else {
                    unreachable!("content-bearing method is always a transfer");
                };
                self.assembly = Some(InboundAssembly {
                    command_id: id,
                    destination,
                    requires_accept: accept_mode == AcceptMode::Explicit,
                    sync,
                    header: MessageHeader::default(),
                    body: Vec::new(),
                });
                if frame.flags.eof && frame.flags.eos {
                    self.finish_message(sink, out);
                }
                Ok(())
            }
            FrameBody::Method { sync, method } => {
                if !(frame.flags.bof && frame.flags.eof) {
                    return Err(SessionException::Frameset(
                        "multi-frame command segments are not supported".into(),
                    ));
                }
                let id = self.begin_command();
                self.handle_command(id, sync, method, sink, out);
                Ok(())
            }
            FrameBody::Header(header) => {
                let assembly = self.assembly.as_mut().ok_or_else(|| {
                    SessionException::Frameset("header segment outside a frameset".into())
                })?;
                assembly.header = header;
                if frame.flags.eof && frame.flags.eos {
                    self.finish_message(sink, out);
                }
                Ok(())
            }
            FrameBody::Content(data) => {
                let assembly = self.assembly.as_mut().ok_or_else(|| {
                    SessionException::Frameset("content segment outside a frameset".into())
                })?;
                assembly.body.extend_from_slice(&data);
                if frame.flags.eof && frame.flags.eos {
                    self.finish_message(sink, out);
                }
                Ok(())
            }
            FrameBody::Heartbeat => Ok(()),
        }
    }

    fn begin_command(&mut self) -> SequenceNumber {
        let id = self.receiver_next;
        self.receiver_next = id.next();
        self.receiver_incomplete.add(id);
        id
    }

    /// Dispatch a complete non-content command.
    fn handle_command(
        &mut self,
        id: SequenceNumber,
        sync: bool,
        method: Method,
        sink: &dyn MessageSink,
        out: &mut Vec<Frame>,
    ) {
        self.current_command_complete = true;
        match self.dispatch(id, method, sink) {
            Ok(Some(value)) => {
                out.push(Frame::method(
                    self.channel,
                    Method::Execution(ExecutionMethod::Result {
                        command_id: id,
                        value,
                    }),
                ));
            }
            Ok(None) => {}
            Err(exception) => {
                warn!("{}: {exception}", self.name);
                self.current_command_complete = true;
                out.push(Frame::method(
                    self.channel,
                    Method::Execution(ExecutionMethod::Exception {
                        error_code: exception.code,
                        command_id: exception.command_id,
                        description: exception.description,
                    }),
                ));
            }
        }
        if self.current_command_complete {
            self.receiver_completed(id);
        }
        if sync && self.current_command_complete {
            self.send_accept_and_completion(out);
        }
    }

    fn dispatch(
        &mut self,
        id: SequenceNumber,
        method: Method,
        sink: &dyn MessageSink,
    ) -> Result<Option<Vec<u8>>, ExecutionException> {
        match method {
            Method::Execution(ExecutionMethod::Sync) => {
                self.sync_point(id);
                Ok(None)
            }
            Method::Execution(ExecutionMethod::Exception {
                error_code,
                command_id,
                description,
            }) => {
                warn!(
                    "{}: peer reported {error_code:?} on command {command_id}: {description}",
                    self.name
                );
                Ok(None)
            }
            Method::Message(MessageMethod::Accept { transfers }) => sink
                .accept(&transfers)
                .map(|()| None)
                .map_err(|e| e.into_exception(id)),
            Method::Message(MessageMethod::Flow {
                destination,
                unit,
                value,
            }) => {
                if destination.is_empty() && unit == CreditUnit::Message {
                    self.send_credit = self.send_credit.saturating_add(value);
                    Ok(None)
                } else {
                    sink.flow(&destination, unit, value)
                        .map(|()| None)
                        .map_err(|e| e.into_exception(id))
                }
            }
            Method::Message(MessageMethod::SetFlowMode { destination, mode }) => {
                if destination.is_empty() {
                    // Credit bookkeeping on the default destination is the
                    // only mode this engine operates in.
                    if mode == FlowMode::Credit {
                        Ok(None)
                    } else {
                        Err(ExecutionException::not_implemented(
                            id,
                            "window flow mode on the default destination",
                        ))
                    }
                } else {
                    sink.set_flow_mode(&destination, mode)
                        .map(|()| None)
                        .map_err(|e| e.into_exception(id))
                }
            }
            Method::Message(MessageMethod::Stop { destination }) => {
                if destination.is_empty() {
                    self.send_credit = 0;
                    Ok(None)
                } else {
                    sink.stop(&destination)
                        .map(|()| None)
                        .map_err(|e| e.into_exception(id))
                }
            }
            other => Err(ExecutionException::not_implemented(
                id,
                other.code().name(),
            )),
        }
    }

    /// Defer completion of an `execution.sync` until its predecessors finish.
    fn sync_point(&mut self, id: SequenceNumber) {
        if self.receiver_incomplete.first().is_some_and(|first| first < id) {
            debug!("{}: delaying completion of execution.sync {id}", self.name);
            self.current_command_complete = false;
            self.pending_syncs.push_back(id);
        }
    }

    /// Apply producer flow control on message admission.
    fn admit_message(&mut self, out: &mut Vec<Frame>) {
        let Some(flow) = &mut self.flow else { return };
        match flow.on_message(Instant::now()) {
            FlowDecision::Continue => {}
            FlowDecision::Grant { credit } => {
                self.flow_stopped = false;
                debug!("{}: send producer credit {credit}", self.name);
                out.push(Frame::method(
                    self.channel,
                    Method::Message(MessageMethod::Flow {
                        destination: String::new(),
                        unit: CreditUnit::Message,
                        value: credit,
                    }),
                ));
            }
            FlowDecision::Defer { retry_after } => {
                if self.credit_retry.is_none() {
                    debug!("{}: schedule sending credit", self.name);
                    self.credit_retry = Some(retry_after);
                }
            }
            FlowDecision::Stop => {
                if !self.flow_stopped {
                    warn!("{}: producer throttling violation", self.name);
                    self.flow_stopped = true;
                    out.push(Frame::method(
                        self.channel,
                        Method::Message(MessageMethod::Stop {
                            destination: String::new(),
                        }),
                    ));
                }
            }
        }
    }

    /// Take the pending credit-retry delay, if one was requested.
    #[must_use]
    pub fn take_credit_retry(&mut self) -> Option<Duration> { self.credit_retry.take() }

    /// Scheduled credit retry fired; attempt to issue credit again.
    pub fn retry_credit(&mut self, out: &mut Vec<Frame>) {
        let Some(flow) = &mut self.flow else { return };
        match flow.retry(Instant::now()) {
            FlowDecision::Grant { credit } => {
                self.flow_stopped = false;
                debug!("{}: send producer credit {credit}", self.name);
                out.push(Frame::method(
                    self.channel,
                    Method::Message(MessageMethod::Flow {
                        destination: String::new(),
                        unit: CreditUnit::Message,
                        value: credit,
                    }),
                ));
            }
            FlowDecision::Defer { retry_after } => {
                warn!("{}: reschedule sending credit", self.name);
                self.credit_retry = Some(retry_after);
            }
            FlowDecision::Continue | FlowDecision::Stop => {}
        }
    }

    /// Hand a completed frameset to the sink and register its completion.
    fn finish_message(&mut self, sink: &dyn MessageSink, out: &mut Vec<Frame>) {
        let Some(assembly) = self.assembly.take() else {
            return;
        };
        let id = assembly.command_id;
        let handle = self
            .incomplete
            .register(id, assembly.requires_accept, assembly.sync);
        let message = InboundMessage {
            command_id: id,
            destination: assembly.destination,
            requires_accept: assembly.requires_accept,
            sync: assembly.sync,
            header: assembly.header,
            body: assembly.body,
        };
        let sync = assembly.sync;
        if let Err(error) = sink.transfer(message, handle) {
            // The dropped handle has already discarded its record.
            let exception = error.into_exception(id);
            warn!("{}: {exception}", self.name);
            out.push(Frame::method(
                self.channel,
                Method::Execution(ExecutionMethod::Exception {
                    error_code: exception.code,
                    command_id: exception.command_id,
                    description: exception.description,
                }),
            ));
            self.receiver_completed(id);
            if sync {
                self.send_accept_and_completion(out);
            }
        }
    }

    /// Fold scheduled sink completions back into command order.
    pub fn drain_completions(&mut self, out: &mut Vec<Frame>) {
        for record in self.incomplete.drain_scheduled() {
            if self.attached {
                self.complete_transfer(record, out);
            }
        }
    }

    /// A message finished processing; advance completion bookkeeping.
    fn complete_transfer(&mut self, record: CompletedTransfer, out: &mut Vec<Frame>) {
        debug!(
            "{}: receive completed for message {}",
            self.name, record.command_id
        );
        self.receiver_completed(record.command_id);
        if record.requires_accept {
            // The id will appear in the next message.accept we send.
            self.accepted.add(record.command_id);
        }

        // Any execution.sync barriers now unblocked complete in order.
        let mut drained_sync = false;
        while let Some(&sync_id) = self.pending_syncs.front() {
            let blocked = self
                .receiver_incomplete
                .first()
                .is_some_and(|first| first < sync_id);
            if blocked {
                break;
            }
            self.pending_syncs.pop_front();
            debug!("{}: delayed execution.sync {sync_id} is completed", self.name);
            self.receiver_completed(sync_id);
            drained_sync = true;
        }

        if record.sync {
            self.send_accept_and_completion(out);
        } else if drained_sync {
            self.send_completion(out);
        }
    }

    fn receiver_completed(&mut self, id: SequenceNumber) {
        self.receiver_incomplete.remove(id);
        self.completed_unacked.add(id);
    }

    /// Emit pending `message.accept` state, then the completion set.
    fn send_accept_and_completion(&mut self, out: &mut Vec<Frame>) {
        if !self.accepted.is_empty() {
            let transfers = std::mem::take(&mut self.accepted);
            out.push(Frame::method(
                self.channel,
                Method::Message(MessageMethod::Accept { transfers }),
            ));
        }
        self.send_completion(out);
    }

    /// Emit the monotone `session.completed` set.
    pub fn send_completion(&mut self, out: &mut Vec<Frame>) {
        let timely_reply = self.completed_unacked.len() >= self.config.ack_frequency;
        out.push(Frame::method(
            self.channel,
            Method::Session(SessionMethod::Completed {
                commands: self.completed_unacked.clone(),
                timely_reply,
            }),
        ));
    }

    /// Peer acknowledged our completion set; stop re-announcing those ids.
    pub fn known_completed(&mut self, commands: &SequenceSet) {
        self.completed_unacked.remove_set(commands);
    }

    /// Peer reset the expected command id for its sender direction.
    pub fn command_point(&mut self, command_id: SequenceNumber, offset: u64) {
        debug_assert_eq!(offset, 0, "frameset offsets are not resumable");
        self.receiver_next = command_id;
    }

    /// Peer completed commands we sent; release replay state.
    pub fn peer_completed(
        &mut self,
        commands: &SequenceSet,
        timely_reply: bool,
        out: &mut Vec<Frame>,
    ) {
        self.sender_completed_upstream(commands);
        if timely_reply {
            out.push(Frame::method(
                self.channel,
                Method::Session(SessionMethod::KnownCompleted {
                    commands: commands.clone(),
                }),
            ));
        }
    }

    fn sender_completed_upstream(&mut self, commands: &SequenceSet) {
        self.sender_incomplete.remove_set(commands);
        self.replay.release(commands);
    }

    /// Peer solicited completion state via `session.flush`.
    pub fn flush(&mut self, expected: bool, confirmed: bool, completed: bool, out: &mut Vec<Frame>) {
        if expected {
            out.push(Frame::method(
                self.channel,
                Method::Session(SessionMethod::Expected {
                    commands: SequenceSet::of(self.receiver_next),
                }),
            ));
        }
        if confirmed || completed {
            self.send_completion(out);
        }
    }

    /// Peer requested a session expiry.
    ///
    /// Expiry is reported but never stored: the reply is always zero, and a
    /// zero request additionally marks the session for destruction at
    /// detach.
    pub fn request_timeout(&mut self, timeout: u32, out: &mut Vec<Frame>) {
        if timeout == 0 {
            self.close_on_detach = true;
        }
        out.push(Frame::method(
            self.channel,
            Method::Session(SessionMethod::Timeout { timeout: 0 }),
        ));
    }

    /// Cursor the peer must acknowledge against: the next sender command id.
    #[must_use]
    pub const fn sender_command_point(&self) -> SessionPoint { self.command_point }

    /// Send a non-content command, retaining it for replay.
    ///
    /// # Errors
    ///
    /// Returns [`SessionException::ReplayOverflow`] when the replay budget
    /// is exhausted.
    pub fn send_command(
        &mut self,
        method: Method,
        sync: bool,
        out: &mut Vec<Frame>,
    ) -> Result<SequenceNumber, SessionException> {
        debug_assert_eq!(self.command_point.offset, 0);
        let id = self.command_point.command;
        let frame = Frame::method_sync(self.channel, method, sync);
        self.replay.push(id, vec![frame.clone()])?;
        self.sender_incomplete.add(id);
        self.command_point.advance();
        out.push(frame);
        Ok(id)
    }

    /// Send a content message as a full frameset, retaining it for replay.
    ///
    /// # Errors
    ///
    /// Returns [`SessionException::ReplayOverflow`] when the replay budget
    /// is exhausted.
    pub fn send_transfer(
        &mut self,
        destination: &str,
        accept_mode: AcceptMode,
        body: Vec<u8>,
        sync: bool,
        out: &mut Vec<Frame>,
    ) -> Result<SequenceNumber, SessionException> {
        let id = self.command_point.command;
        let frames = vec![
            Frame::transfer_open(
                self.channel,
                Method::Message(MessageMethod::Transfer {
                    destination: destination.to_owned(),
                    accept_mode,
                }),
                sync,
            ),
            Frame::header(
                self.channel,
                MessageHeader {
                    content_length: body.len() as u64,
                },
            ),
            Frame::content(self.channel, body, true),
        ];
        self.replay.push(id, frames.clone())?;
        self.sender_incomplete.add(id);
        self.command_point.advance();
        out.extend(frames);
        Ok(id)
    }

    /// Frames to re-emit after a resume: command-point plus unacknowledged
    /// framesets, rebound to the current channel.
    #[must_use]
    pub fn replay_after_resume(&self) -> Vec<Frame> {
        let mut frames = vec![Frame::method(
            self.channel,
            Method::Session(SessionMethod::CommandPoint {
                command_id: self
                    .replay
                    .retained_ids()
                    .first()
                    .unwrap_or(self.command_point.command),
                command_offset: 0,
            }),
        )];
        frames.extend(self.replay.replay_frames().into_iter().map(|mut frame| {
            frame.channel = self.channel;
            frame
        }));
        frames
    }

    /// Credit currently granted to this peer on the default destination.
    #[must_use]
    pub const fn send_credit(&self) -> u32 { self.send_credit }
}
