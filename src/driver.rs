//! Per-transport I/O task.
//!
//! One driver owns one framed transport and everything attached to it: the
//! [`ConnectionEngine`], the wakeup queue fed by sink workers and timers,
//! the outbound push queue, and the heartbeat clock. The loop is a biased
//! `select!`: shutdown first, then worker wakeups, then pushed framesets,
//! then heartbeats, then inbound frames. The engine itself never blocks on
//! a message store; completions always arrive through the wakeup queue.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use leaky_bucket::RateLimiter;
use log::{debug, warn};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{self, Duration, Instant, Interval},
};
use tokio_util::{codec::Framed, sync::CancellationToken};

use crate::{
    codec::WireCodec,
    connection::{ConnectionEngine, EngineConfig, EngineFlow, OutboundSerialiser},
    error::{CodecError, HandshakeError},
    frame::{Frame, FrameBody},
    handshake,
    session::{SessionRegistry, Wakeup, WakeupReceiver, WakeupSender, wakeup_channel},
    sink::MessageSink,
};

/// Failures that end a driver run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// The protocol-initiation exchange failed; our header was emitted.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// The framed transport failed.
    #[error("transport failed: {0}")]
    Codec(#[from] CodecError),
}

/// Error returned when pushing to a finished connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PushError {
    /// The connection's I/O task is gone.
    #[error("connection closed")]
    Closed,
}

/// Driver tunables independent of the protocol engine.
#[derive(Clone, Copy, Debug)]
pub struct DriverConfig {
    /// Capacity of the outbound push queue, in framesets.
    pub push_capacity: usize,
    /// Optional ceiling on pushed framesets per second.
    pub push_rate: Option<usize>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            push_capacity: 64,
            push_rate: None,
        }
    }
}

/// Cloneable handle used to push outbound framesets through a connection.
///
/// Framesets are queued atomically, so pushes can never interleave with
/// another command on the same channel.
#[derive(Clone)]
pub struct PushHandle {
    tx: mpsc::Sender<Vec<Frame>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl PushHandle {
    /// Queue one complete frameset, awaiting rate-limit tokens and queue
    /// space.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Closed`] when the connection has terminated.
    pub async fn push(&self, frameset: Vec<Frame>) -> Result<(), PushError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(1).await;
        }
        self.tx.send(frameset).await.map_err(|_| PushError::Closed)
    }
}

/// The I/O task for one accepted transport.
pub struct ConnectionDriver<T> {
    framed: Framed<T, WireCodec>,
    engine: ConnectionEngine,
    serialiser: OutboundSerialiser,
    wakeups_tx: WakeupSender,
    wakeups_rx: WakeupReceiver,
    push_rx: mpsc::Receiver<Vec<Frame>>,
    push_handle: PushHandle,
    shutdown: CancellationToken,
    heartbeat: Option<Interval>,
    last_inbound: Instant,
}

impl<T> ConnectionDriver<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the header exchange and build the driver.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Handshake`] on a rejected header; the
    /// engine's preferred header has already been written.
    pub async fn accept(
        mut io: T,
        config: EngineConfig,
        driver_config: DriverConfig,
        sink: Arc<dyn MessageSink>,
        registry: Arc<SessionRegistry>,
        shutdown: CancellationToken,
    ) -> Result<Self, DriverError> {
        handshake::accept(&mut io, config.version).await?;
        let (wakeups_tx, wakeups_rx) = wakeup_channel();
        let engine = ConnectionEngine::new(config.clone(), sink, registry, wakeups_tx.clone());
        let codec = WireCodec::new(config.limits.max_frame_size as usize);
        let (push_tx, push_rx) = mpsc::channel(driver_config.push_capacity);
        let limiter = driver_config.push_rate.map(|rate| {
            Arc::new(
                RateLimiter::builder()
                    .initial(rate)
                    .refill(rate)
                    .max(rate)
                    .interval(Duration::from_secs(1))
                    .build(),
            )
        });
        Ok(Self {
            framed: Framed::new(io, codec),
            engine,
            serialiser: OutboundSerialiser::new(),
            wakeups_tx,
            wakeups_rx,
            push_rx,
            push_handle: PushHandle {
                tx: push_tx,
                limiter,
            },
            shutdown,
            heartbeat: None,
            last_inbound: Instant::now(),
        })
    }

    /// Handle for pushing outbound framesets from other tasks.
    #[must_use]
    pub fn push_handle(&self) -> PushHandle { self.push_handle.clone() }

    /// The engine driven by this task, for inspection.
    #[must_use]
    pub fn engine(&self) -> &ConnectionEngine { &self.engine }

    /// Drive the connection until it closes, the transport fails, or
    /// shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Codec`] when the transport fails mid-run.
    pub async fn run(mut self) -> Result<(), DriverError> {
        let mut out = Vec::new();
        self.engine.on_header_matched(&mut out);
        if self.flush(&mut out).await? == EngineFlow::Closed {
            return Ok(());
        }

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    debug!("shutdown requested; aborting connection");
                    self.engine.on_transport_failure();
                    return Ok(());
                }

                wakeup = self.wakeups_rx.recv() => {
                    if let Some(wakeup) = wakeup {
                        self.engine.handle_wakeup(wakeup, &mut out);
                    }
                }

                frameset = self.push_rx.recv() => {
                    if let Some(frames) = frameset {
                        out.extend(frames);
                    }
                }

                _ = Self::heartbeat_tick(self.heartbeat.as_mut()) => {
                    if self.liveness_expired() {
                        warn!("peer missed two heartbeat intervals; dropping transport");
                        self.engine.on_transport_failure();
                        return Ok(());
                    }
                    out.push(Frame::heartbeat());
                }

                inbound = self.framed.next() => {
                    match inbound {
                        Some(Ok(frame)) => {
                            self.last_inbound = Instant::now();
                            if !matches!(frame.body, FrameBody::Heartbeat)
                                && self.engine.handle_frame(frame, &mut out) == EngineFlow::Closed
                            {
                                let _ = self.flush(&mut out).await?;
                                return Ok(());
                            }
                        }
                        Some(Err(error)) => {
                            self.engine.on_transport_failure();
                            return Err(error.into());
                        }
                        None => {
                            debug!("peer closed the transport");
                            self.engine.on_transport_failure();
                            return Ok(());
                        }
                    }
                }
            }

            self.arm_timers();
            if self.flush(&mut out).await? == EngineFlow::Closed {
                return Ok(());
            }
        }
    }

    /// Arm the heartbeat clock once negotiated, plus any credit retries.
    fn arm_timers(&mut self) {
        if self.heartbeat.is_none() {
            if let Some(interval) = self.engine.heartbeat_interval() {
                let mut ticker = time::interval(interval);
                ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
                self.heartbeat = Some(ticker);
            }
        }
        for (name, delay) in self.engine.take_credit_schedules() {
            let wakeups = self.wakeups_tx.clone();
            tokio::spawn(async move {
                time::sleep(delay).await;
                // The connection may be gone by the time the timer fires.
                let _ = wakeups.send(Wakeup::CreditRetry(name));
            });
        }
    }

    async fn heartbeat_tick(heartbeat: Option<&mut Interval>) -> Instant {
        match heartbeat {
            Some(interval) => interval.tick().await,
            None => std::future::pending().await,
        }
    }

    fn liveness_expired(&self) -> bool {
        self.heartbeat
            .as_ref()
            .map(Interval::period)
            .is_some_and(|period| self.last_inbound.elapsed() > period * 2)
    }

    /// Write pending frames, policing the per-channel frameset invariant.
    ///
    /// A frame that would interleave with an unfinished frameset is an
    /// engine bug, not a peer error: the frame (and everything queued
    /// behind it) is discarded, `connection.close` with `InternalError` is
    /// emitted instead, and the caller must drop the transport.
    async fn flush(&mut self, out: &mut Vec<Frame>) -> Result<EngineFlow, DriverError> {
        let mut violation = None;
        for frame in out.drain(..) {
            if violation.is_some() {
                continue;
            }
            match self.serialiser.admit(&frame) {
                Ok(()) => self.framed.feed(frame).await?,
                Err(exception) => violation = Some(exception),
            }
        }
        if let Some(exception) = violation {
            warn!("dropping connection: {exception}");
            let mut close = Vec::new();
            self.engine.fail_internal(exception.to_string(), &mut close);
            // Teardown frames bypass the serialiser: its state is exactly
            // what the violation corrupted.
            for frame in close {
                self.framed.feed(frame).await?;
            }
            self.framed.flush().await?;
            return Ok(EngineFlow::Closed);
        }
        self.framed.flush().await?;
        Ok(EngineFlow::Continue)
    }
}
