//! Shared helpers for the integration suites.
#![allow(dead_code, reason = "each test binary uses a different helper subset")]

use std::sync::{Arc, Mutex};

use amqwire::{
    ConnectionEngine,
    EngineConfig,
    Frame,
    Method,
    SessionRegistry,
    frame::MessageHeader,
    method::{AcceptMode, ConnectionMethod, MessageMethod, SessionMethod},
    sequence::SequenceSet,
    session::{CompletionHandle, WakeupReceiver, wakeup_channel},
    sink::{InboundMessage, MessageSink, SinkError},
};

/// Result alias used by the test suites.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Sink recording every transfer and parking its completion handle.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<InboundMessage>>,
    pending: Mutex<Vec<CompletionHandle>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Messages received so far.
    pub fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().expect("sink lock").clone()
    }

    /// Number of parked completion handles.
    pub fn pending_count(&self) -> usize { self.pending.lock().expect("sink lock").len() }

    /// Take the parked handle at `index` (in arrival order).
    pub fn take_handle(&self, index: usize) -> CompletionHandle {
        self.pending.lock().expect("sink lock").remove(index)
    }
}

impl MessageSink for RecordingSink {
    fn transfer(
        &self,
        message: InboundMessage,
        completion: CompletionHandle,
    ) -> Result<(), SinkError> {
        self.messages.lock().expect("sink lock").push(message);
        self.pending.lock().expect("sink lock").push(completion);
        Ok(())
    }
}

/// An engine plus the loose ends needed to drive it without a transport.
pub struct Harness {
    pub engine: ConnectionEngine,
    pub wakeups: WakeupReceiver,
    pub sink: Arc<RecordingSink>,
    pub registry: Arc<SessionRegistry>,
}

impl Harness {
    pub fn new() -> Self { Self::with_config(EngineConfig::default()) }

    pub fn with_config(config: EngineConfig) -> Self {
        let (tx, wakeups) = wakeup_channel();
        let sink = RecordingSink::new();
        let registry = Arc::new(SessionRegistry::default());
        let engine = ConnectionEngine::new(config, sink.clone(), Arc::clone(&registry), tx);
        Self {
            engine,
            wakeups,
            sink,
            registry,
        }
    }

    /// Run the header-matched transition, returning `connection.start`.
    pub fn start(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        self.engine.on_header_matched(&mut out);
        out
    }

    /// Feed one frame, returning everything the engine emitted.
    pub fn feed(&mut self, frame: Frame) -> Vec<Frame> {
        let mut out = Vec::new();
        let _ = self.engine.handle_frame(frame, &mut out);
        out
    }

    /// Drive the connection to `Open` with an anonymous start-ok.
    pub fn open_connection(&mut self) -> Vec<Frame> {
        let mut all = self.start();
        all.extend(self.feed(Frame::method(
            0,
            Method::Connection(ConnectionMethod::StartOk {
                client_properties: Vec::new(),
                mechanism: "ANONYMOUS".into(),
                response: Vec::new(),
                locale: "en_US".into(),
            }),
        )));
        all.extend(self.feed(Frame::method(
            0,
            Method::Connection(ConnectionMethod::TuneOk {
                channel_max: 0,
                max_frame_size: 0,
                heartbeat: 0,
            }),
        )));
        all.extend(self.feed(Frame::method(
            0,
            Method::Connection(ConnectionMethod::Open {
                virtual_host: String::new(),
            }),
        )));
        all
    }

    /// Attach a session on `channel`, returning the engine's replies.
    pub fn attach(&mut self, channel: u16, name: &str) -> Vec<Frame> {
        self.feed(Frame::method(
            channel,
            Method::Session(SessionMethod::Attach {
                name: name.as_bytes().to_vec(),
                force: false,
            }),
        ))
    }

    /// Service every queued wakeup, returning the frames produced.
    pub fn pump_wakeups(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(wakeup) = self.wakeups.try_recv() {
            self.engine.handle_wakeup(wakeup, &mut out);
        }
        out
    }
}

/// Frames of a one-content-frame transfer frameset.
pub fn transfer_frameset(
    channel: u16,
    destination: &str,
    accept_mode: AcceptMode,
    sync: bool,
    body: &[u8],
) -> Vec<Frame> {
    vec![
        Frame::transfer_open(
            channel,
            Method::Message(MessageMethod::Transfer {
                destination: destination.into(),
                accept_mode,
            }),
            sync,
        ),
        Frame::header(
            channel,
            MessageHeader {
                content_length: body.len() as u64,
            },
        ),
        Frame::content(channel, body.to_vec(), true),
    ]
}

/// Every `session.completed` set emitted on `channel`, in order.
pub fn completed_sets(frames: &[Frame], channel: u16) -> Vec<SequenceSet> {
    frames
        .iter()
        .filter(|f| f.channel == channel)
        .filter_map(|f| match f.as_method() {
            Some((Method::Session(SessionMethod::Completed { commands, .. }), _)) => {
                Some(commands.clone())
            }
            _ => None,
        })
        .collect()
}

/// Every `message.accept` set emitted on `channel`, in order.
pub fn accept_sets(frames: &[Frame], channel: u16) -> Vec<SequenceSet> {
    frames
        .iter()
        .filter(|f| f.channel == channel)
        .filter_map(|f| match f.as_method() {
            Some((Method::Message(MessageMethod::Accept { transfers }), _)) => {
                Some(transfers.clone())
            }
            _ => None,
        })
        .collect()
}

/// The method codes emitted on `channel`, in order.
pub fn method_names(frames: &[Frame], channel: u16) -> Vec<&'static str> {
    frames
        .iter()
        .filter(|f| f.channel == channel)
        .filter_map(Frame::method_code)
        .map(|code| code.name())
        .collect()
}
